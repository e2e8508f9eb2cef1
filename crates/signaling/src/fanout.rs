//! Fan-out – Zustellung einer Nachricht an alle Mitglieder eines Raums
//!
//! Ein Job verarbeitet genau eine Seite von Mitgliedern:
//!
//! ```text
//! Seite lesen (ab Fortsetzung)
//!     |
//!     +--> weitere Mitglieder? -> Folge-Job mit neuer Fortsetzung einreihen
//!     |                           (VOR der Zustellung)
//!     v
//! parallel an alle Connections der Seite zustellen
//!     |
//!     +--> RecipientGone -> veraltete Connection loeschen
//!     +--> anderer Fehler -> loggen, Rest der Seite laeuft weiter
//! ```
//!
//! Bricht der Worker nach dem Einreihen ab, geht kein Seitenfortschritt
//! verloren; die aktuelle Seite wird bei erneuter Zustellung wiederholt.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use treffpunkt_core::{ConnectionId, RoomId, ServiceNamespace};
use treffpunkt_protocol::Benachrichtigung;

use crate::broadcast::Zusteller;
use crate::error::{SignalingError, SignalingResult};
use crate::queue::{JobQueue, Zustellung};
use crate::store::{mitglieder_seite_lesen, PresenceStore};

/// Standard-Seitengroesse
pub const DEFAULT_SEITEN_GROESSE: usize = 1000;

/// Broadcast-Auftrag fuer einen Raum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutJob {
    pub namespace: ServiceNamespace,
    pub room_id: RoomId,
    /// Connection die den Broadcast ausgeloest hat (nur fuers Logging)
    #[serde(default)]
    pub sender: Option<ConnectionId>,
    pub content: Benachrichtigung,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fortsetzung: Option<String>,
}

impl FanoutJob {
    pub fn neu(
        namespace: ServiceNamespace,
        room_id: RoomId,
        sender: Option<ConnectionId>,
        content: Benachrichtigung,
    ) -> Self {
        Self {
            namespace,
            room_id,
            sender,
            content,
            fortsetzung: None,
        }
    }
}

/// Bilanz einer verarbeiteten Seite
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutErgebnis {
    pub zugestellt: usize,
    /// Empfaenger ohne Kanal (Connection wurde entfernt)
    pub entfernt: usize,
    pub fehlgeschlagen: usize,
    /// Fortsetzung des eingereihten Folge-Jobs
    pub fortsetzung: Option<String>,
}

// ---------------------------------------------------------------------------
// FanoutEngine
// ---------------------------------------------------------------------------

pub struct FanoutEngine<S, Z, Q> {
    store: S,
    zusteller: Z,
    queue: Q,
    seiten_groesse: usize,
}

impl<S, Z, Q> FanoutEngine<S, Z, Q>
where
    S: PresenceStore,
    Z: Zusteller,
    Q: JobQueue<FanoutJob>,
{
    pub fn neu(store: S, zusteller: Z, queue: Q) -> Self {
        Self {
            store,
            zusteller,
            queue,
            seiten_groesse: DEFAULT_SEITEN_GROESSE,
        }
    }

    pub fn with_seiten_groesse(mut self, seiten_groesse: usize) -> Self {
        self.seiten_groesse = seiten_groesse.max(1);
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Verarbeitet eine Seite eines Broadcast-Jobs
    ///
    /// Fehler einzelner Empfaenger schlagen nie auf das Ergebnis durch;
    /// `Err` heisst: Seite konnte nicht gelesen oder Folge-Job nicht
    /// eingereiht werden.
    pub async fn seite_verarbeiten(&self, job: &FanoutJob) -> SignalingResult<FanoutErgebnis> {
        let seite = mitglieder_seite_lesen(
            &self.store,
            &job.namespace,
            &job.room_id,
            self.seiten_groesse,
            job.fortsetzung.as_deref(),
        )
        .await?;

        if let Some(ref token) = seite.fortsetzung {
            let folge = FanoutJob {
                fortsetzung: Some(token.clone()),
                ..job.clone()
            };
            self.queue.einreihen(folge).await?;
        }

        let text = job.content.als_json()?;
        let zustellungen = seite.eintraege.iter().map(|c| {
            let text = text.as_str();
            async move {
                let ergebnis = self.zusteller.zustellen(&c.connection_id, text).await;
                (&c.connection_id, ergebnis)
            }
        });

        let mut bilanz = FanoutErgebnis {
            fortsetzung: seite.fortsetzung.clone(),
            ..Default::default()
        };

        for (connection_id, ergebnis) in join_all(zustellungen).await {
            match ergebnis {
                Ok(()) => bilanz.zugestellt += 1,
                Err(SignalingError::RecipientGone(_)) => {
                    bilanz.entfernt += 1;
                    self.veraltete_connection_entfernen(connection_id).await;
                }
                Err(e) => {
                    bilanz.fehlgeschlagen += 1;
                    tracing::warn!(
                        connection_id = %connection_id,
                        raum = %job.room_id,
                        fehler = %e,
                        "Zustellung fehlgeschlagen"
                    );
                }
            }
        }

        tracing::debug!(
            raum = %job.room_id,
            zugestellt = bilanz.zugestellt,
            entfernt = bilanz.entfernt,
            fehlgeschlagen = bilanz.fehlgeschlagen,
            weitere_seiten = bilanz.fortsetzung.is_some(),
            "Fan-out-Seite verarbeitet"
        );
        Ok(bilanz)
    }

    async fn veraltete_connection_entfernen(&self, connection_id: &ConnectionId) {
        match self.store.connection_loeschen(connection_id).await {
            Ok(Some(_)) => {
                tracing::info!(connection_id = %connection_id, "Veraltete Connection entfernt");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, fehler = %e, "Aufraeumen fehlgeschlagen");
            }
        }
    }

    /// Verarbeitet eine Zustellung und quittiert sie bzw. gibt sie zurueck
    pub async fn zustellung_verarbeiten(&self, zustellung: Zustellung<FanoutJob>) {
        match self.seite_verarbeiten(&zustellung.job).await {
            Ok(_) => {
                if let Err(e) = self.queue.bestaetigen(zustellung.quittung).await {
                    tracing::warn!(fehler = %e, "Fan-out-Job konnte nicht quittiert werden");
                }
            }
            Err(e) => {
                tracing::warn!(
                    raum = %zustellung.job.room_id,
                    versuch = zustellung.versuch,
                    fehler = %e,
                    "Fan-out-Job fehlgeschlagen, wird erneut zugestellt"
                );
                if let Err(e) = self.queue.zurueckgeben(zustellung.quittung).await {
                    tracing::error!(fehler = %e, "Fan-out-Job konnte nicht zurueckgegeben werden");
                }
            }
        }
    }

    /// Verarbeitet alle wartenden Jobs inkl. der dabei entstehenden Folge-Jobs
    ///
    /// Gibt die Anzahl verarbeiteter Jobs zurueck.
    pub async fn ausstehende_verarbeiten(&self) -> usize {
        let mut anzahl = 0;
        while let Some(zustellung) = self.queue.versuch_empfangen().await {
            anzahl += 1;
            self.zustellung_verarbeiten(zustellung).await;
        }
        anzahl
    }

    /// Worker-Loop (laeuft bis `shutdown_rx` `true` meldet)
    pub async fn starten(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(seiten_groesse = self.seiten_groesse, "Fan-out-Worker gestartet");
        loop {
            tokio::select! {
                zustellung = self.queue.empfangen() => {
                    self.zustellung_verarbeiten(zustellung).await;
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Fan-out-Worker beendet");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ConnectionRegistry;
    use crate::memory::MemoryStore;
    use crate::queue::MemoryQueue;
    use treffpunkt_core::{Connection, IdentityId};

    async fn raum_fuellen(store: &MemoryStore, registry: &ConnectionRegistry, anzahl: usize) -> Vec<tokio::sync::mpsc::Receiver<String>> {
        let mut empfaenger = Vec::new();
        for i in 0..anzahl {
            let cid = ConnectionId::from(format!("c{i:05}").as_str());
            let mut c = Connection::neu(cid.clone(), IdentityId::from("u"), ServiceNamespace::neu("svc"));
            c.room_id = Some(RoomId::from("R1"));
            store.connection_anlegen(c).await.unwrap();
            empfaenger.push(registry.registrieren(cid));
        }
        empfaenger
    }

    fn job() -> FanoutJob {
        FanoutJob::neu(
            ServiceNamespace::neu("svc"),
            RoomId::from("R1"),
            None,
            Benachrichtigung::verlassen(IdentityId::from("alice")),
        )
    }

    #[tokio::test]
    async fn folge_job_wird_vor_zustellung_eingereiht() {
        let (store, _rx) = MemoryStore::neu();
        let registry = ConnectionRegistry::neu();
        let _empfaenger = raum_fuellen(&store, &registry, 5).await;

        let queue = MemoryQueue::neu();
        let engine = FanoutEngine::neu(store, registry, queue.clone()).with_seiten_groesse(2);

        let bilanz = engine.seite_verarbeiten(&job()).await.unwrap();
        assert_eq!(bilanz.zugestellt, 2);
        assert_eq!(bilanz.fortsetzung.as_deref(), Some("c00001"));

        let folge = queue.versuch_empfangen().await.unwrap();
        assert_eq!(folge.job.fortsetzung.as_deref(), Some("c00001"));
        assert_eq!(folge.job.content, job().content);
    }

    #[tokio::test]
    async fn weg_und_voll_blockieren_die_seite_nicht() {
        let (store, _rx) = MemoryStore::neu();
        let registry = ConnectionRegistry::mit_queue_groesse(1);
        let mut empfaenger = raum_fuellen(&store, &registry, 4).await;

        // c00001 geschlossen, c00002 Queue voll
        drop(empfaenger.remove(1));
        registry
            .zustellen(&ConnectionId::from("c00002"), "fuellen")
            .await
            .unwrap();

        let queue = MemoryQueue::neu();
        let engine = FanoutEngine::neu(store.clone(), registry, queue);
        let bilanz = engine.seite_verarbeiten(&job()).await.unwrap();

        assert_eq!(bilanz.zugestellt, 2);
        assert_eq!(bilanz.entfernt, 1);
        assert_eq!(bilanz.fehlgeschlagen, 1);
        assert!(store
            .connection_laden(&ConnectionId::from("c00001"))
            .await
            .unwrap()
            .is_none());
        assert!(empfaenger[0].try_recv().is_ok());
    }

    #[tokio::test]
    async fn job_serialisierung() {
        let mut j = job();
        j.fortsetzung = Some("c00042".into());
        let text = serde_json::to_string(&j).unwrap();
        assert!(text.contains("\"#notice\""));
        let zurueck: FanoutJob = serde_json::from_str(&text).unwrap();
        assert_eq!(zurueck, j);
    }
}
