//! STUN-Responder – beantwortet Binding-Requests mit der beobachteten Adresse
//!
//! ## Architektur
//!
//! ```text
//! UDP Socket (recv_from)
//!     |
//!     v
//! stun::parse_binding_request()   <- Validierung, fremde Methoden verwerfen
//!     |
//!     v
//! stun::build_binding_response()  <- Absender-Adresse aus recv_from
//!     |
//!     v
//! UDP send_to (Absender)
//! ```
//!
//! Jedes Datagramm wird vollstaendig abgearbeitet bevor das naechste gelesen
//! wird. Der Health-Listener laeuft unabhaengig davon auf einem eigenen
//! TCP-Socket und teilt keinen Zustand mit dem Responder.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use treffpunkt_protocol::stun;

/// Groesser als jede sinnvolle Binding-Anfrage
const UDP_BUFFER_SIZE: usize = 1500;

/// Feste Antwort des Health-Listeners
const HEALTH_ANTWORT: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK";

// ---------------------------------------------------------------------------
// StunResponder
// ---------------------------------------------------------------------------

/// UDP-Binding-Responder
pub struct StunResponder {
    socket: Arc<UdpSocket>,
}

impl StunResponder {
    /// Bindet den UDP-Socket
    pub async fn binden(bind_addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "STUN-Responder gebunden");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Verwendet einen bereits gebundenen Socket
    pub fn mit_socket(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Empfangs-Loop (laeuft bis `shutdown_rx` `true` meldet)
    pub async fn empfangs_loop_starten(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_BUFFER_SIZE];

        tracing::info!("STUN-Empfangs-Loop gestartet");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, absender)) => {
                            if let Some(antwort) = antwort_erzeugen(&buf[..len], absender) {
                                if let Err(e) = self.socket.send_to(&antwort, absender).await {
                                    tracing::warn!(
                                        fehler = %e,
                                        ziel = %absender,
                                        "STUN-Antwort konnte nicht gesendet werden"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "UDP-Empfangsfehler");
                            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("STUN-Responder: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("STUN-Empfangs-Loop beendet");
    }
}

/// Erzeugt die Antwort auf ein einzelnes Datagramm
///
/// Die gemeldete Adresse ist immer die beobachtete Absender-Adresse, nie
/// etwas aus dem Inhalt der Anfrage. `None` heisst: verwerfen.
pub fn antwort_erzeugen(daten: &[u8], absender: SocketAddr) -> Option<Vec<u8>> {
    let transaction_id = match stun::parse_binding_request(daten) {
        Ok(tid) => tid,
        Err(e) => {
            tracing::debug!(fehler = %e, absender = %absender, "Datagramm verworfen");
            return None;
        }
    };

    match absender.ip() {
        IpAddr::V4(ip) => {
            tracing::trace!(absender = %absender, "Binding-Request beantwortet");
            Some(stun::build_binding_response(&transaction_id, ip, absender.port()))
        }
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => Some(stun::build_binding_response(&transaction_id, v4, absender.port())),
            None => {
                tracing::debug!(absender = %absender, "IPv6-Absender wird nicht beantwortet");
                None
            }
        },
    }
}

// ---------------------------------------------------------------------------
// HealthListener
// ---------------------------------------------------------------------------

/// TCP-Listener mit fester Lebenszeichen-Antwort
pub struct HealthListener {
    listener: TcpListener,
}

impl HealthListener {
    pub async fn binden(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Health-Listener gebunden");
        Ok(Self { listener })
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept-Loop; jede Verbindung bekommt einen eigenen Task
    pub async fn starten(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((mut stream, peer)) => {
                            tokio::spawn(async move {
                                if let Err(e) = stream.write_all(HEALTH_ANTWORT).await {
                                    tracing::debug!(fehler = %e, peer = %peer, "Health-Antwort fehlgeschlagen");
                                }
                                let _ = stream.shutdown().await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "Health-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Health-Listener gestoppt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use treffpunkt_protocol::stun::{build_binding_request, parse, BINDING_RESPONSE};

    #[test]
    fn antwort_nutzt_beobachtete_adresse() {
        let tid = [7u8; 12];
        let absender: SocketAddr = "198.51.100.20:40000".parse().unwrap();
        let antwort = antwort_erzeugen(&build_binding_request(&tid), absender).unwrap();

        let nachricht = parse(&antwort).unwrap();
        assert_eq!(nachricht.methode, BINDING_RESPONSE);
        assert_eq!(nachricht.transaction_id, tid);
        assert_eq!(nachricht.gemappte_adresse().unwrap(), Some(absender));
    }

    #[test]
    fn fremde_datagramme_verwerfen() {
        let absender: SocketAddr = "198.51.100.20:40000".parse().unwrap();
        assert!(antwort_erzeugen(b"kurz", absender).is_none());

        // Binding-Response statt Request
        let antwort = stun::build_binding_response(&[1u8; 12], Ipv4Addr::LOCALHOST, 1);
        assert!(antwort_erzeugen(&antwort, absender).is_none());

        let v6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        assert!(antwort_erzeugen(&build_binding_request(&[2u8; 12]), v6).is_none());
    }

    #[tokio::test]
    async fn responder_ueber_loopback() {
        let responder = StunResponder::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = responder.lokale_adresse().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { responder.empfangs_loop_starten(shutdown_rx).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        // Ungueltiges Paket darf die Loop nicht beenden
        client.send_to(b"muell", server_addr).await.unwrap();

        let tid = [9u8; 12];
        client
            .send_to(&build_binding_request(&tid), server_addr)
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let nachricht = parse(&buf[..len]).unwrap();
        assert_eq!(nachricht.gemappte_adresse().unwrap(), Some(client_addr));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn health_listener_antwortet() {
        let health = HealthListener::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = health.lokale_adresse().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(health.starten(shutdown_rx));

        let mut a = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut b = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut text_b = String::new();
        b.read_to_string(&mut text_b).await.unwrap();
        let mut text_a = String::new();
        a.read_to_string(&mut text_a).await.unwrap();
        assert!(text_a.starts_with("HTTP/1.1 200 OK"));
        assert!(text_b.ends_with("OK"));
    }
}
