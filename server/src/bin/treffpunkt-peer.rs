//! Treffpunkt Peer – ermittelt die oeffentliche Adresse und tritt einem Raum bei
//!
//! Gibt alle Antworten und Hinweise des Servers zeilenweise auf stdout aus.

use anyhow::Result;
use treffpunkt_server::peer::{self, PeerEinstellungen};

#[tokio::main]
async fn main() -> Result<()> {
    treffpunkt_observability::logging_initialisieren("warn", "text");

    let einstellungen = PeerEinstellungen::aus_umgebung()?;
    tracing::info!(
        stun = %einstellungen.stun_server,
        url = %einstellungen.ws_url,
        raum = %einstellungen.raum,
        "Peer startet"
    );

    peer::ausfuehren(einstellungen).await
}
