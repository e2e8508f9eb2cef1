//! WebSocket-Endpunkt – Bindet Socket, akzeptiert Control-Channels
//!
//! Pro Verbindung:
//! ```text
//! Upgrade-Request lesen (Token aus ?token=)
//!     |
//!     +--> Token ungueltig -> 401, Socket zu (keine Connection angelegt)
//!     v
//! Connection anlegen, 101 senden, Send-Queue registrieren
//!     |
//!     v
//! Frame-Loop: Text -> Dispatcher -> Antwort
//!             Ping -> Pong
//!             Close -> Close, Ende
//!             Send-Queue -> Text-Frame
//!     |
//!     v
//! Send-Queue austragen, Connection loeschen
//! ```
//!
//! ## Concurrency-Modell
//! Die Storage- und Queue-Traits verwenden async fn ohne Send-Garantie
//! (async_fn_in_trait). Alle Verbindungs-Tasks laufen deshalb in einer
//! `tokio::task::LocalSet`.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinSet, LocalSet};
use tokio_util::codec::Framed;
use treffpunkt_core::ConnectionId;
use treffpunkt_protocol::handshake;
use treffpunkt_protocol::{Frame, Opcode, WsFrameCodec};

use crate::auth::TokenVerifier;
use crate::broadcast::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::SignalingError;
use crate::fanout::FanoutJob;
use crate::queue::JobQueue;
use crate::store::PresenceStore;

/// Close-Codes (RFC 6455, Abschnitt 7.4.1)
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_PROTOKOLLFEHLER: u16 = 1002;

/// Wie lange offene Verbindungen nach dem Shutdown-Signal noch Close senden
/// und aufraeumen duerfen
const NACHLAUF: Duration = Duration::from_secs(5);

type GeteilterDispatcher<S, V, Q> = Arc<Dispatcher<S, V, ConnectionRegistry, Q>>;

/// Signaling-Server fuer WebSocket-Control-Channels
pub struct SignalingServer<S, V, Q> {
    dispatcher: GeteilterDispatcher<S, V, Q>,
    listener: TcpListener,
}

impl<S, V, Q> SignalingServer<S, V, Q>
where
    S: PresenceStore + 'static,
    V: TokenVerifier + 'static,
    Q: JobQueue<FanoutJob> + 'static,
{
    /// Bindet den TCP-Socket
    pub async fn binden(
        bind_addr: SocketAddr,
        dispatcher: GeteilterDispatcher<S, V, Q>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            dispatcher,
            listener,
        })
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Akzeptiert Verbindungen bis `shutdown_rx` `true` meldet
    ///
    /// Verwendet eine `LocalSet` fuer alle Verbindungs-Tasks. Nach dem
    /// Shutdown-Signal wird die `LocalSet` weiter getrieben, bis jede offene
    /// Verbindung Close gesendet und ihre Connection entfernt hat.
    pub async fn starten(self, shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        let local = LocalSet::new();
        local.run_until(self.accept_loop(shutdown_rx)).await
    }

    async fn accept_loop(self, mut shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        tracing::info!(adresse = %self.listener.local_addr()?, "Signaling-Endpunkt gestartet");
        let mut verbindungen = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!(peer = %peer_addr, "Verbindung akzeptiert");
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let shutdown_rx = shutdown_rx.clone();

                            // Lokaler Task – kein Send erforderlich
                            verbindungen.spawn_local(async move {
                                verbindung_verarbeiten(dispatcher, stream, peer_addr, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }

                // Beendete Verbindungs-Tasks einsammeln
                Some(_) = verbindungen.join_next(), if !verbindungen.is_empty() => {}

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Signaling-Endpunkt: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        let offen = verbindungen.len();
        let nachlauf = async {
            while verbindungen.join_next().await.is_some() {}
        };
        if tokio::time::timeout(NACHLAUF, nachlauf).await.is_err() {
            tracing::warn!(
                offen = verbindungen.len(),
                "Verbindungen nach Nachlauf abgebrochen"
            );
            verbindungen.shutdown().await;
        } else if offen > 0 {
            tracing::debug!(offen, "Offene Verbindungen geschlossen");
        }

        tracing::info!("Signaling-Endpunkt gestoppt");
        Ok(())
    }
}

/// Handshake, Frame-Loop und Aufraeumen einer einzelnen Verbindung
async fn verbindung_verarbeiten<S, V, Q>(
    dispatcher: GeteilterDispatcher<S, V, Q>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: PresenceStore,
    V: TokenVerifier,
    Q: JobQueue<FanoutJob>,
{
    let anfrage = match handshake::anfrage_lesen(&mut stream).await {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, fehler = %e, "Upgrade-Request ungueltig");
            let _ = handshake::ablehnen(&mut stream, 400, "Bad Request").await;
            return;
        }
    };

    let connection_id = ConnectionId::new();
    let token = anfrage.query_parameter("token");
    if let Err(e) = dispatcher
        .presence()
        .verbinden(connection_id.clone(), token)
        .await
    {
        let (status, grund) = match e {
            SignalingError::InvalidToken => (401, "Unauthorized"),
            _ => (500, "Internal Server Error"),
        };
        tracing::info!(peer = %peer_addr, status, fehler = %e, "Upgrade abgelehnt");
        let _ = handshake::ablehnen(&mut stream, status, grund).await;
        return;
    }

    let registry = dispatcher.zusteller().clone();
    let mut ausgehend = registry.registrieren(connection_id.clone());

    if let Err(e) = handshake::annehmen(&mut stream, &anfrage).await {
        tracing::warn!(peer = %peer_addr, fehler = %e, "Handshake-Antwort fehlgeschlagen");
    } else {
        tracing::info!(peer = %peer_addr, connection_id = %connection_id, "Control-Channel geoeffnet");

        let mut framed = Framed::new(stream, WsFrameCodec::fuer_server());
        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(frame)) => match frame.opcode {
                            Opcode::Text => {
                                let antwort = match frame.als_text() {
                                    Ok(text) => dispatcher.verarbeiten(&connection_id, text).await,
                                    Err(e) => SignalingError::UngueltigeAnfrage(e.to_string()).als_antwort(),
                                };
                                let json = match antwort.als_json() {
                                    Ok(j) => j,
                                    Err(e) => {
                                        tracing::error!(fehler = %e, "Antwort nicht serialisierbar");
                                        continue;
                                    }
                                };
                                if let Err(e) = framed.send(Frame::text(json)).await {
                                    tracing::warn!(connection_id = %connection_id, fehler = %e, "Senden fehlgeschlagen");
                                    break;
                                }
                            }
                            Opcode::Ping => {
                                if let Err(e) = framed.send(Frame::pong()).await {
                                    tracing::warn!(connection_id = %connection_id, fehler = %e, "Pong fehlgeschlagen");
                                    break;
                                }
                            }
                            Opcode::Close => {
                                tracing::debug!(connection_id = %connection_id, "Close vom Client");
                                let _ = framed.send(Frame::close(Some(CLOSE_NORMAL))).await;
                                break;
                            }
                            Opcode::Pong | Opcode::Binary | Opcode::Continuation => {
                                tracing::trace!(connection_id = %connection_id, opcode = ?frame.opcode, "Frame ignoriert");
                            }
                        },
                        Some(Err(e)) => {
                            tracing::warn!(connection_id = %connection_id, fehler = %e, "Frame-Lesefehler");
                            let _ = framed.send(Frame::close(Some(CLOSE_PROTOKOLLFEHLER))).await;
                            break;
                        }
                        None => {
                            tracing::info!(connection_id = %connection_id, "Verbindung vom Client getrennt");
                            break;
                        }
                    }
                }

                // Zustellung aus Fan-out oder Direktnachricht
                Some(nachricht) = ausgehend.recv() => {
                    if let Err(e) = framed.send(Frame::text(nachricht)).await {
                        tracing::warn!(connection_id = %connection_id, fehler = %e, "Zustellung fehlgeschlagen");
                        break;
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = framed.send(Frame::close(Some(CLOSE_GOING_AWAY))).await;
                        break;
                    }
                }
            }
        }
    }

    // Cleanup beim Verbindungsende
    registry.entfernen(&connection_id);
    if let Err(e) = dispatcher.presence().trennen(&connection_id).await {
        tracing::error!(connection_id = %connection_id, fehler = %e, "Connection konnte nicht entfernt werden");
    }
    tracing::info!(peer = %peer_addr, connection_id = %connection_id, "Verbindungs-Task beendet");
}
