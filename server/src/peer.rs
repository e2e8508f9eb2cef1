//! Peer-Ablauf: STUN -> Control-Channel -> joinRoom -> Hinweise ausgeben
//!
//! Einstellungen kommen ausschliesslich aus der Umgebung:
//! - `TREFFPUNKT_STUN`: STUN-Server als `host:port`
//! - `TREFFPUNKT_WS_URL`: Signaling-Endpunkt (`ws://` oder `wss://`)
//! - `TREFFPUNKT_TOKEN`: Identitaets-Token (Pflicht)
//! - `TREFFPUNKT_ROOM`: Raum dem beigetreten wird
//! - `TREFFPUNKT_LOCAL_PORT`: lokaler UDP-Port fuer die STUN-Abfrage (0 = beliebig)

use anyhow::{anyhow, Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use treffpunkt_core::RoomId;
use treffpunkt_signaling::{KanalEnde, KanalEreignis, WsControlChannel};
use treffpunkt_stun::StunRequester;

pub const ENV_STUN: &str = "TREFFPUNKT_STUN";
pub const ENV_WS_URL: &str = "TREFFPUNKT_WS_URL";
pub const ENV_TOKEN: &str = "TREFFPUNKT_TOKEN";
pub const ENV_ROOM: &str = "TREFFPUNKT_ROOM";
pub const ENV_LOCAL_PORT: &str = "TREFFPUNKT_LOCAL_PORT";

/// Einstellungen des Peer-Clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEinstellungen {
    pub stun_server: String,
    pub ws_url: String,
    pub token: String,
    pub raum: String,
    pub lokaler_port: u16,
}

impl PeerEinstellungen {
    /// Loest die Einstellungen ueber eine beliebige Variablen-Quelle auf
    pub fn aufloesen<F>(lesen: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lesen(ENV_TOKEN)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("{ENV_TOKEN} muss gesetzt sein"))?;

        let lokaler_port = match lesen(ENV_LOCAL_PORT) {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_LOCAL_PORT} ist kein gueltiger Port: '{port}'"))?,
            None => 0,
        };

        Ok(Self {
            stun_server: lesen(ENV_STUN).unwrap_or_else(|| "127.0.0.1:3468".into()),
            ws_url: lesen(ENV_WS_URL).unwrap_or_else(|| "ws://127.0.0.1:8080/".into()),
            token,
            raum: lesen(ENV_ROOM).unwrap_or_else(|| "lobby".into()),
            lokaler_port,
        })
    }

    pub fn aus_umgebung() -> Result<Self> {
        Self::aufloesen(|name| std::env::var(name).ok())
    }

    /// Endpunkt-URL mit angehaengtem `token`-Query-Parameter
    pub fn url_mit_token(&self) -> String {
        let trenner = if self.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{trenner}token={}",
            self.ws_url,
            prozent_kodieren(&self.token)
        )
    }
}

/// Kodiert alles ausser den RFC-3986 "unreserved" Zeichen
fn prozent_kodieren(text: &str) -> String {
    let mut ergebnis = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                ergebnis.push(byte as char)
            }
            _ => ergebnis.push_str(&format!("%{byte:02X}")),
        }
    }
    ergebnis
}

/// Ermittelt die oeffentliche Adresse ueber den konfigurierten STUN-Server
pub async fn oeffentliche_adresse_ermitteln(einstellungen: &PeerEinstellungen) -> Result<SocketAddr> {
    let server = tokio::net::lookup_host(&einstellungen.stun_server)
        .await
        .with_context(|| format!("STUN-Server '{}' nicht aufloesbar", einstellungen.stun_server))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("STUN-Server '{}' hat keine IPv4-Adresse", einstellungen.stun_server))?;

    let lokal = SocketAddr::from((Ipv4Addr::UNSPECIFIED, einstellungen.lokaler_port));
    let requester = StunRequester::binden(lokal).await?;
    let oeffentlich = requester.oeffentliche_adresse(server).await?;

    tracing::info!(stun = %server, oeffentlich = %oeffentlich, "Oeffentliche Adresse ermittelt");
    Ok(oeffentlich)
}

/// Kompletter Peer-Ablauf bis der Kanal endet oder Ctrl-C kommt
pub async fn ausfuehren(einstellungen: PeerEinstellungen) -> Result<()> {
    let oeffentlich = oeffentliche_adresse_ermitteln(&einstellungen).await?;
    println!("Oeffentliche Adresse: {oeffentlich}");

    let mut kanal = WsControlChannel::verbinden(&einstellungen.url_mit_token())
        .await
        .with_context(|| format!("Verbindung zu '{}' fehlgeschlagen", einstellungen.ws_url))?;
    kanal
        .join(
            RoomId::from(einstellungen.raum.as_str()),
            &einstellungen.token,
            Some(oeffentlich.to_string()),
        )
        .await?;

    loop {
        tokio::select! {
            ereignis = kanal.naechstes_ereignis() => match ereignis {
                Some(KanalEreignis::Antwort(antwort)) => {
                    println!("[{}] {}", antwort.status_code, antwort.body);
                }
                Some(KanalEreignis::Benachrichtigung(hinweis)) => {
                    println!("{}", hinweis.als_json()?);
                }
                Some(KanalEreignis::Text(text)) => println!("{text}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C, schliesse Kanal");
                break;
            }
        }
    }

    match kanal.schliessen().await {
        KanalEnde::Fehler(grund) => Err(anyhow!("Kanal mit Fehler beendet: {grund}")),
        ende => {
            tracing::info!(ende = ?ende, "Kanal beendet");
            Ok(())
        }
    }
}
