//! Client-seitiger Control-Channel
//!
//! Ein eigener Task besitzt den Socket und ist der einzige der liest oder
//! schreibt. Die Anwendung spricht mit ihm nur ueber Queues:
//!
//! ```text
//!  Anwendung --Befehl (Frame/Schliessen)--> Kanal-Task <--Frames--> Socket
//!  Anwendung <--KanalEreignis--------------/
//! ```
//!
//! Dadurch kann ein Schreibzugriff nie einen halb gelesenen Frame
//! zerstoeren. Ping wird sofort mit einem leeren Pong beantwortet; Close
//! oder Pong vom Server beenden den Lese-Loop normal. Auf jedem
//! Ausgangspfad wird ein Close-Frame gesendet.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use treffpunkt_core::{IdentityId, RoomId};
use treffpunkt_protocol::handshake;
use treffpunkt_protocol::{
    Antwort, Benachrichtigung, Frame, Opcode, SignalingMessage, WsFrameCodec,
};

use crate::error::{SignalingError, SignalingResult};

const BEFEHL_QUEUE_GROESSE: usize = 32;
const EREIGNIS_QUEUE_GROESSE: usize = 64;
const CLOSE_NORMAL: u16 = 1000;

/// Vom Server empfangener Text
#[derive(Debug, Clone, PartialEq)]
pub enum KanalEreignis {
    /// Antwort auf eine eigene Aktion
    Antwort(Antwort),
    /// Presence-Hinweis, Broadcast oder Direktnachricht
    Benachrichtigung(Benachrichtigung),
    /// Text der in keines der bekannten Schemata passt
    Text(String),
}

impl KanalEreignis {
    fn aus_text(text: &str) -> Self {
        if let Ok(antwort) = Antwort::parsen(text) {
            return Self::Antwort(antwort);
        }
        if let Ok(b) = Benachrichtigung::parsen(text) {
            return Self::Benachrichtigung(b);
        }
        Self::Text(text.to_string())
    }
}

/// Wie der Kanal endete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KanalEnde {
    /// Close oder Pong vom Server
    Normal,
    /// Lokal geschlossen
    Lokal,
    /// Socket ohne Close-Frame geschlossen
    Getrennt,
    Fehler(String),
}

enum Befehl {
    Senden(Frame),
    Schliessen,
}

/// Bestandteile einer `ws://` bzw. `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KanalUrl {
    pub tls: bool,
    /// Host wie im `Host`-Header (inkl. Port falls angegeben)
    pub autoritaet: String,
    pub host: String,
    pub port: u16,
    /// Pfad inkl. Query (mindestens `/`)
    pub pfad: String,
}

impl KanalUrl {
    pub fn parsen(url: &str) -> SignalingResult<Self> {
        let ungueltig = || SignalingError::UngueltigeAnfrage(format!("Ungueltige URL: {url}"));

        let (tls, rest) = if let Some(rest) = url.strip_prefix("wss://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            (false, rest)
        } else {
            return Err(ungueltig());
        };

        let (autoritaet, pfad) = match rest.find(|c: char| c == '/' || c == '?') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if autoritaet.is_empty() {
            return Err(ungueltig());
        }
        let pfad = if pfad.starts_with('?') {
            format!("/{pfad}")
        } else {
            pfad.to_string()
        };

        let (host, port_text) = if let Some(rest) = autoritaet.strip_prefix('[') {
            let (host, nach) = rest.split_once(']').ok_or_else(ungueltig)?;
            (host, nach.strip_prefix(':'))
        } else {
            match autoritaet.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (autoritaet, None),
            }
        };
        let port = match port_text {
            Some(p) => p.parse::<u16>().map_err(|_| ungueltig())?,
            None if tls => 443,
            None => 80,
        };

        Ok(Self {
            tls,
            autoritaet: autoritaet.to_string(),
            host: host.to_string(),
            port,
            pfad,
        })
    }
}

// ---------------------------------------------------------------------------
// WsControlChannel
// ---------------------------------------------------------------------------

/// Signaling-Kanal eines Peers
pub struct WsControlChannel {
    befehle: mpsc::Sender<Befehl>,
    ereignisse: mpsc::Receiver<KanalEreignis>,
    task: JoinHandle<KanalEnde>,
}

impl WsControlChannel {
    /// Verbindet zu `ws://` oder `wss://` und fuehrt den Handshake aus
    pub async fn verbinden(url: &str) -> SignalingResult<Self> {
        Self::verbinden_mit_codec(url, WsFrameCodec::new()).await
    }

    /// Wie [`verbinden`](Self::verbinden), mit eigenem Codec (z.B. ohne Maskierung)
    pub async fn verbinden_mit_codec(url: &str, codec: WsFrameCodec) -> SignalingResult<Self> {
        let ziel = KanalUrl::parsen(url)?;
        let tcp = TcpStream::connect((ziel.host.as_str(), ziel.port)).await?;
        tcp.set_nodelay(true)?;

        if ziel.tls {
            let connector = tls_connector()?;
            let server_name = rustls::pki_types::ServerName::try_from(ziel.host.clone())
                .map_err(|e| SignalingError::Tls(e.to_string()))?;
            let mut stream = connector.connect(server_name, tcp).await?;
            handshake::client_handshake(&mut stream, &ziel.autoritaet, &ziel.pfad).await?;
            tracing::info!(host = %ziel.host, port = ziel.port, "Control-Channel (TLS) verbunden");
            Ok(Self::ueber_stream(stream, codec))
        } else {
            let mut stream = tcp;
            handshake::client_handshake(&mut stream, &ziel.autoritaet, &ziel.pfad).await?;
            tracing::info!(host = %ziel.host, port = ziel.port, "Control-Channel verbunden");
            Ok(Self::ueber_stream(stream, codec))
        }
    }

    /// Startet den Kanal-Task ueber einem Stream mit abgeschlossenem Handshake
    pub fn ueber_stream<S>(stream: S, codec: WsFrameCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (befehle_tx, befehle_rx) = mpsc::channel(BEFEHL_QUEUE_GROESSE);
        let (ereignisse_tx, ereignisse_rx) = mpsc::channel(EREIGNIS_QUEUE_GROESSE);
        let framed = Framed::new(stream, codec);
        let task = tokio::spawn(kanal_loop(framed, befehle_rx, ereignisse_tx));
        Self {
            befehle: befehle_tx,
            ereignisse: ereignisse_rx,
            task,
        }
    }

    /// Reiht einen Frame zum Senden ein
    pub async fn senden(&self, frame: Frame) -> SignalingResult<()> {
        self.befehle
            .send(Befehl::Senden(frame))
            .await
            .map_err(|_| SignalingError::KanalGeschlossen)
    }

    pub async fn aktion_senden(&self, aktion: &SignalingMessage) -> SignalingResult<()> {
        self.senden(Frame::text(aktion.als_json()?)).await
    }

    pub async fn join(&self, rid: RoomId, token: &str, candidate: Option<String>) -> SignalingResult<()> {
        self.aktion_senden(&SignalingMessage::join(rid, token, candidate))
            .await
    }

    pub async fn leave(&self, token: &str) -> SignalingResult<()> {
        self.aktion_senden(&SignalingMessage::leave(token)).await
    }

    pub async fn send_message(&self, uid: IdentityId, token: &str, content: Value) -> SignalingResult<()> {
        self.aktion_senden(&SignalingMessage::send_message(uid, token, content))
            .await
    }

    pub async fn broadcast(&self, rid: RoomId, token: &str, content: Value) -> SignalingResult<()> {
        self.aktion_senden(&SignalingMessage::broadcast(rid, token, content))
            .await
    }

    /// Naechstes Ereignis; `None` sobald der Kanal beendet ist
    pub async fn naechstes_ereignis(&mut self) -> Option<KanalEreignis> {
        self.ereignisse.recv().await
    }

    /// Schliesst den Kanal (Close-Frame) und wartet auf das Ende des Tasks
    pub async fn schliessen(self) -> KanalEnde {
        // Ist der Task schon beendet, ist der Empfaenger weg
        let _ = self.befehle.send(Befehl::Schliessen).await;
        match self.task.await {
            Ok(ende) => ende,
            Err(e) => KanalEnde::Fehler(e.to_string()),
        }
    }
}

fn tls_connector() -> SignalingResult<tokio_rustls::TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| SignalingError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

async fn kanal_loop<S>(
    mut framed: Framed<S, WsFrameCodec>,
    mut befehle: mpsc::Receiver<Befehl>,
    ereignisse: mpsc::Sender<KanalEreignis>,
) -> KanalEnde
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ende = loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => match frame.opcode {
                        Opcode::Text => {
                            let ereignis = match frame.als_text() {
                                Ok(text) => KanalEreignis::aus_text(text),
                                Err(e) => {
                                    tracing::warn!(fehler = %e, "Text-Frame verworfen");
                                    continue;
                                }
                            };
                            if ereignisse.send(ereignis).await.is_err() {
                                break KanalEnde::Lokal;
                            }
                        }
                        Opcode::Ping => {
                            if let Err(e) = framed.send(Frame::pong()).await {
                                break KanalEnde::Fehler(e.to_string());
                            }
                        }
                        Opcode::Close | Opcode::Pong => {
                            tracing::debug!(opcode = ?frame.opcode, "Kanal vom Server beendet");
                            break KanalEnde::Normal;
                        }
                        Opcode::Binary | Opcode::Continuation => {
                            tracing::trace!(opcode = ?frame.opcode, "Frame ignoriert");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(fehler = %e, "Frame-Lesefehler");
                        break KanalEnde::Fehler(e.to_string());
                    }
                    None => break KanalEnde::Getrennt,
                }
            }

            befehl = befehle.recv() => {
                match befehl {
                    Some(Befehl::Senden(frame)) => {
                        if let Err(e) = framed.send(frame).await {
                            break KanalEnde::Fehler(e.to_string());
                        }
                    }
                    Some(Befehl::Schliessen) | None => break KanalEnde::Lokal,
                }
            }
        }
    };

    // Close-Frame auf jedem Ausgangspfad
    if let Err(e) = framed.send(Frame::close(Some(CLOSE_NORMAL))).await {
        tracing::debug!(fehler = %e, "Close-Frame nicht gesendet");
    }
    let _ = framed.close().await;

    tracing::debug!(ende = ?ende, "Control-Channel beendet");
    ende
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    fn paar() -> (WsControlChannel, Framed<tokio::io::DuplexStream, WsFrameCodec>) {
        let (client, server) = duplex(64 * 1024);
        let kanal = WsControlChannel::ueber_stream(client, WsFrameCodec::new());
        let gegenstelle = Framed::new(server, WsFrameCodec::fuer_server());
        (kanal, gegenstelle)
    }

    #[tokio::test]
    async fn ping_ergibt_genau_ein_pong() {
        let (mut kanal, mut server) = paar();

        server.send(Frame::ping("abc")).await.unwrap();
        let pong = server.next().await.unwrap().unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert!(pong.payload.is_empty());

        // Kanal laeuft weiter
        let antwort = Antwort::ok("Joined message group: \"R1\".");
        server
            .send(Frame::text(antwort.als_json().unwrap()))
            .await
            .unwrap();
        assert_eq!(
            kanal.naechstes_ereignis().await,
            Some(KanalEreignis::Antwort(antwort))
        );

        // Nach dem Pong kam nichts weiter: der naechste Frame ist unser Text
        kanal.leave("alice").await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
    }

    #[tokio::test]
    async fn close_beendet_normal() {
        let (mut kanal, mut server) = paar();
        server.send(Frame::close(Some(1000))).await.unwrap();

        assert_eq!(kanal.naechstes_ereignis().await, None);
        assert_eq!(kanal.schliessen().await, KanalEnde::Normal);

        // Close-Frame kommt auch auf diesem Pfad zurueck
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
    }

    #[tokio::test]
    async fn lokales_schliessen_sendet_close() {
        let (kanal, mut server) = paar();
        assert_eq!(kanal.schliessen().await, KanalEnde::Lokal);
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::close(Some(CLOSE_NORMAL)));
        assert!(server.next().await.is_none());
    }

    #[tokio::test]
    async fn benachrichtigungen_werden_erkannt() {
        let (mut kanal, mut server) = paar();
        let text = json!({"#notice": "User \"bob\" has left the message group.", "#user_id": "bob"});
        server.send(Frame::text(text.to_string())).await.unwrap();
        server.send(Frame::text("kein json")).await.unwrap();

        assert_eq!(
            kanal.naechstes_ereignis().await,
            Some(KanalEreignis::Benachrichtigung(Benachrichtigung::verlassen(
                IdentityId::from("bob")
            )))
        );
        assert_eq!(
            kanal.naechstes_ereignis().await,
            Some(KanalEreignis::Text("kein json".into()))
        );
    }

    #[test]
    fn urls_zerlegen() {
        let url = KanalUrl::parsen("wss://signal.example.org/prod?token=abc").unwrap();
        assert!(url.tls);
        assert_eq!(url.host, "signal.example.org");
        assert_eq!(url.port, 443);
        assert_eq!(url.pfad, "/prod?token=abc");

        let url = KanalUrl::parsen("ws://127.0.0.1:9000?token=x").unwrap();
        assert!(!url.tls);
        assert_eq!(url.autoritaet, "127.0.0.1:9000");
        assert_eq!(url.port, 9000);
        assert_eq!(url.pfad, "/?token=x");

        let url = KanalUrl::parsen("ws://[::1]:8080").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.pfad, "/");

        assert!(KanalUrl::parsen("http://example.org").is_err());
        assert!(KanalUrl::parsen("ws://").is_err());
        assert!(KanalUrl::parsen("ws://host:abc/").is_err());
    }
}
