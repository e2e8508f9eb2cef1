//! Connection-Registry – Zustellung an offene Control-Channels
//!
//! Jede offene Verbindung registriert hier ihre Send-Queue. Der
//! Verbindungs-Task liest aus der Queue und schreibt Text-Frames auf den
//! Socket. Fan-out und Direktnachrichten legen nur in die Queue.
//!
//! Eine unbekannte oder geschlossene Queue bedeutet `RecipientGone`.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use treffpunkt_core::ConnectionId;

use crate::error::{SignalingError, SignalingResult};

/// Standard-Groesse der Send-Queue pro Verbindung
pub const SEND_QUEUE_GROESSE: usize = 64;

/// Zustellung einer serialisierten Nachricht an eine Connection
#[allow(async_fn_in_trait)]
pub trait Zusteller: Send + Sync {
    /// # Fehler
    /// - `RecipientGone` wenn der Kanal nicht mehr existiert
    /// - alles andere gilt als voruebergehender Zustellfehler
    async fn zustellen(&self, ziel: &ConnectionId, nachricht: &str) -> SignalingResult<()>;
}

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Handle auf die Send-Queue einer Verbindung
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub connection_id: ConnectionId,
    pub tx: mpsc::Sender<String>,
}

impl ClientSender {
    /// Legt eine Nachricht nicht-blockierend in die Queue
    pub fn senden(&self, nachricht: String) -> SignalingResult<()> {
        match self.tx.try_send(nachricht) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.connection_id, "Send-Queue voll – Nachricht verworfen");
                Err(SignalingError::SendeQueueVoll(self.connection_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.connection_id, "Send-Queue geschlossen (Client getrennt)");
                Err(SignalingError::RecipientGone(self.connection_id.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

/// Registry aller lokal offenen Verbindungen
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: DashMap<ConnectionId, ClientSender>,
    queue_groesse: usize,
}

impl ConnectionRegistry {
    pub fn neu() -> Self {
        Self::mit_queue_groesse(SEND_QUEUE_GROESSE)
    }

    pub fn mit_queue_groesse(queue_groesse: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clients: DashMap::new(),
                queue_groesse: queue_groesse.max(1),
            }),
        }
    }

    /// Registriert eine Verbindung und gibt ihre Empfangs-Queue zurueck
    pub fn registrieren(&self, connection_id: ConnectionId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(self.inner.queue_groesse);
        let sender = ClientSender {
            connection_id: connection_id.clone(),
            tx,
        };
        self.inner.clients.insert(connection_id.clone(), sender);
        tracing::debug!(connection_id = %connection_id, "Verbindung registriert");
        rx
    }

    pub fn entfernen(&self, connection_id: &ConnectionId) {
        if self.inner.clients.remove(connection_id).is_some() {
            tracing::debug!(connection_id = %connection_id, "Verbindung entfernt");
        }
    }

    pub fn ist_registriert(&self, connection_id: &ConnectionId) -> bool {
        self.inner.clients.contains_key(connection_id)
    }

    pub fn anzahl(&self) -> usize {
        self.inner.clients.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::neu()
    }
}

impl Zusteller for ConnectionRegistry {
    async fn zustellen(&self, ziel: &ConnectionId, nachricht: &str) -> SignalingResult<()> {
        let sender = match self.inner.clients.get(ziel) {
            Some(s) => s.clone(),
            None => return Err(SignalingError::RecipientGone(ziel.to_string())),
        };
        let ergebnis = sender.senden(nachricht.to_string());
        if matches!(ergebnis, Err(SignalingError::RecipientGone(_))) {
            self.inner.clients.remove(ziel);
        }
        ergebnis
    }
}
