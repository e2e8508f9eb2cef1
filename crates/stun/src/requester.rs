//! STUN-Requester – ermittelt den eigenen oeffentlichen Endpunkt
//!
//! Sendet genau einen Binding-Request und wartet begrenzt auf die Antwort.
//! Wiederholungen sind Sache des Aufrufers.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use treffpunkt_protocol::stun::{self, BINDING_RESPONSE};

use crate::error::{StunError, StunResult};

/// Standard-Timeout fuer eine Binding-Anfrage
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const UDP_BUFFER_SIZE: usize = 1500;

/// Client-Seite einer Binding-Anfrage
pub struct StunRequester {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunRequester {
    /// Bindet einen lokalen UDP-Socket (Port 0 = beliebig)
    ///
    /// Der lokale Port ist relevant: er ist der Port, dessen NAT-Abbildung
    /// ermittelt wird und ueber den spaeter die P2P-Session laeuft.
    pub async fn binden(lokale_addr: SocketAddr) -> StunResult<Self> {
        let socket = UdpSocket::bind(lokale_addr).await?;
        Ok(Self {
            socket,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn lokale_adresse(&self) -> StunResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Gibt den Socket frei, z.B. fuer die anschliessende P2P-Session
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Fragt den oeffentlichen Endpunkt bei `server` ab
    ///
    /// # Fehler
    /// - `Timeout` wenn keine passende Antwort innerhalb des Timeouts eintrifft
    /// - `ResponseMismatch` wenn nur Antworten mit fremder Transaction-ID kamen
    pub async fn oeffentliche_adresse(&self, server: SocketAddr) -> StunResult<SocketAddr> {
        let tid = stun::transaction_id_erzeugen();
        self.socket
            .send_to(&stun::build_binding_request(&tid), server)
            .await?;

        tracing::debug!(server = %server, "Binding-Request gesendet");

        let mut fremde_antwort = false;
        let frist = tokio::time::Instant::now() + self.timeout;
        let mut buf = [0u8; UDP_BUFFER_SIZE];

        loop {
            let empfangen = tokio::time::timeout_at(frist, self.socket.recv_from(&mut buf)).await;
            let (len, absender) = match empfangen {
                Ok(result) => result?,
                Err(_) if fremde_antwort => return Err(StunError::ResponseMismatch),
                Err(_) => return Err(StunError::Timeout(self.timeout)),
            };

            if absender != server {
                tracing::debug!(absender = %absender, "Datagramm von fremdem Absender verworfen");
                continue;
            }

            match antwort_auswerten(&buf[..len], &tid) {
                Ok(adresse) => {
                    tracing::info!(adresse = %adresse, "Oeffentlicher Endpunkt ermittelt");
                    return Ok(adresse);
                }
                Err(StunError::ResponseMismatch) => {
                    tracing::warn!(server = %server, "Antwort mit fremder Transaction-ID verworfen");
                    fremde_antwort = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Prueft eine Antwort gegen die erwartete Transaction-ID
pub fn antwort_auswerten(daten: &[u8], erwartet: &stun::TransactionId) -> StunResult<SocketAddr> {
    let nachricht = stun::parse(daten)?;
    if nachricht.transaction_id != *erwartet {
        return Err(StunError::ResponseMismatch);
    }
    if nachricht.methode != BINDING_RESPONSE {
        return Err(StunError::Protokoll(
            treffpunkt_protocol::ProtocolError::UnknownMethod(nachricht.methode),
        ));
    }
    nachricht.gemappte_adresse()?.ok_or(StunError::KeineAdresse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::StunResponder;
    use std::net::Ipv4Addr;
    use tokio::sync::watch;

    #[test]
    fn antwort_mit_fremder_transaction_id() {
        let antwort = stun::build_binding_response(&[1u8; 12], Ipv4Addr::new(203, 0, 113, 5), 54321);
        assert!(matches!(
            antwort_auswerten(&antwort, &[2u8; 12]),
            Err(StunError::ResponseMismatch)
        ));
        let adresse = antwort_auswerten(&antwort, &[1u8; 12]).unwrap();
        assert_eq!(adresse, "203.0.113.5:54321".parse().unwrap());
    }

    #[tokio::test]
    async fn anfrage_gegen_responder() {
        let responder = StunResponder::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = responder.lokale_adresse().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { responder.empfangs_loop_starten(shutdown_rx).await });

        let requester = StunRequester::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let lokal = requester.lokale_adresse().unwrap();
        let oeffentlich = requester.oeffentliche_adresse(server).await.unwrap();
        assert_eq!(oeffentlich, lokal);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_ohne_antwort() {
        // Gebundener Socket der nie antwortet
        let stumm = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let requester = StunRequester::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let ergebnis = requester
            .oeffentliche_adresse(stumm.local_addr().unwrap())
            .await;
        assert!(matches!(ergebnis, Err(StunError::Timeout(_))));
    }

    #[tokio::test]
    async fn gefaelschte_antwort_wird_verworfen() {
        let falscher_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = falscher_server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, client) = falscher_server.recv_from(&mut buf).await.unwrap();
            let falsch = stun::build_binding_response(&[0xEE; 12], Ipv4Addr::new(1, 2, 3, 4), 1);
            falscher_server.send_to(&falsch, client).await.unwrap();
        });

        let requester = StunRequester::binden("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(200));
        let ergebnis = requester.oeffentliche_adresse(server_addr).await;
        assert!(matches!(ergebnis, Err(StunError::ResponseMismatch)));
    }
}
