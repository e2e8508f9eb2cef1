//! Zaehler-Pflege aus dem Aenderungsstrom
//!
//! ```text
//! Store-Mutation --Aenderungsstrom--> AenderungsPumpe --> DownstreamJob-Queue
//!                                                              |
//!                                                              v
//!                                                     DownstreamWorker
//!                                                       update_group: atomar addieren,
//!                                                                     bei -1 "left"-Hinweis
//!                                                       remove_group: Zaehler loeschen
//!                                                                     falls noch 0
//! ```
//!
//! Jeder Job wird erst nach erfolgreicher Anwendung quittiert. Schlaegt sie
//! fehl, wird er zurueckgegeben und erneut zugestellt.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use treffpunkt_core::{CounterChange, PresenceDelta, RoomId, ServiceNamespace};
use treffpunkt_protocol::Benachrichtigung;

use crate::error::{SignalingError, SignalingResult};
use crate::fanout::FanoutJob;
use crate::presence::deltas_ableiten;
use crate::queue::{JobQueue, Zustellung};
use crate::store::{PresenceStore, StoreAenderung};

/// Auftrag an den Downstream-Worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum DownstreamJob {
    /// Presence-Delta auf den Raum-Zaehler anwenden
    UpdateGroup(PresenceDelta),
    /// Zaehler eines leeren Raums entfernen
    RemoveGroup {
        namespace: ServiceNamespace,
        room_id: RoomId,
    },
}

/// Job fuer einen auf 0 gefallenen Zaehler
pub fn aufraeum_job(aenderung: &CounterChange) -> Option<DownstreamJob> {
    aenderung
        .neu
        .as_ref()
        .filter(|z| z.member_count == 0)
        .map(|z| DownstreamJob::RemoveGroup {
            namespace: z.namespace.clone(),
            room_id: z.room_id.clone(),
        })
}

/// Jobs fuer eine einzelne Store-Aenderung
pub fn jobs_ableiten(aenderung: &StoreAenderung) -> Vec<DownstreamJob> {
    match aenderung {
        StoreAenderung::Connection(c) => deltas_ableiten(c)
            .into_iter()
            .map(DownstreamJob::UpdateGroup)
            .collect(),
        StoreAenderung::Zaehler(z) => aufraeum_job(z).into_iter().collect(),
    }
}

// ---------------------------------------------------------------------------
// AenderungsPumpe
// ---------------------------------------------------------------------------

/// Uebertraegt den Aenderungsstrom des Stores in die Downstream-Queue
pub struct AenderungsPumpe<Q> {
    strom: mpsc::UnboundedReceiver<StoreAenderung>,
    queue: Q,
}

impl<Q: JobQueue<DownstreamJob>> AenderungsPumpe<Q> {
    pub fn neu(strom: mpsc::UnboundedReceiver<StoreAenderung>, queue: Q) -> Self {
        Self { strom, queue }
    }

    async fn weiterleiten(&self, aenderung: StoreAenderung) -> SignalingResult<usize> {
        let jobs = jobs_ableiten(&aenderung);
        let anzahl = jobs.len();
        for job in jobs {
            self.queue.einreihen(job).await?;
        }
        Ok(anzahl)
    }

    /// Leitet alle bereits vorliegenden Aenderungen weiter
    ///
    /// Gibt die Anzahl eingereihter Jobs zurueck.
    pub async fn ausstehende_weiterleiten(&mut self) -> SignalingResult<usize> {
        let mut anzahl = 0;
        while let Ok(aenderung) = self.strom.try_recv() {
            anzahl += self.weiterleiten(aenderung).await?;
        }
        Ok(anzahl)
    }

    /// Loop bis der Strom endet oder `shutdown_rx` `true` meldet
    pub async fn starten(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                aenderung = self.strom.recv() => {
                    let Some(aenderung) = aenderung else {
                        break;
                    };
                    if let Err(e) = self.weiterleiten(aenderung).await {
                        tracing::error!(fehler = %e, "Aenderung konnte nicht eingereiht werden");
                    }
                }

                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Aenderungs-Pumpe beendet");
    }
}

// ---------------------------------------------------------------------------
// DownstreamWorker
// ---------------------------------------------------------------------------

pub struct DownstreamWorker<S, D, F> {
    store: S,
    queue: D,
    fanout: F,
}

impl<S, D, F> DownstreamWorker<S, D, F>
where
    S: PresenceStore,
    D: JobQueue<DownstreamJob>,
    F: JobQueue<FanoutJob>,
{
    pub fn neu(store: S, queue: D, fanout: F) -> Self {
        Self {
            store,
            queue,
            fanout,
        }
    }

    /// Wendet einen Job an
    pub async fn anwenden(&self, job: &DownstreamJob) -> SignalingResult<()> {
        match job {
            DownstreamJob::UpdateGroup(delta) => self.delta_anwenden(delta).await,
            DownstreamJob::RemoveGroup { namespace, room_id } => {
                let geloescht = self
                    .store
                    .zaehler_loeschen_wenn_null(namespace, room_id)
                    .await?;
                tracing::debug!(raum = %room_id, geloescht, "Leeren Raum aufgeraeumt");
                Ok(())
            }
        }
    }

    async fn delta_anwenden(&self, delta: &PresenceDelta) -> SignalingResult<()> {
        let verringern = delta.delta < 0;

        // Hinweis vor dem Zaehler: eine erneute Zustellung darf den Hinweis
        // doppeln, aber nie das Delta
        if verringern {
            let hinweis = FanoutJob::neu(
                delta.namespace.clone(),
                delta.room_id.clone(),
                Some(delta.connection_id.clone()),
                Benachrichtigung::verlassen(delta.identity_id.clone()),
            );
            self.fanout.einreihen(hinweis).await?;
        }

        match self
            .store
            .zaehler_addieren(&delta.namespace, &delta.room_id, delta.delta, verringern)
            .await
        {
            Ok(zaehler) => {
                tracing::debug!(
                    raum = %delta.room_id,
                    delta = delta.delta,
                    mitglieder = zaehler.member_count,
                    "Raum-Zaehler aktualisiert"
                );
                Ok(())
            }
            // Bereits entfernter Zaehler beim Verringern ist kein Fehler
            Err(SignalingError::PreconditionFailed(_)) if verringern => {
                tracing::debug!(raum = %delta.room_id, "Zaehler fehlt, Verringern uebersprungen");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn zustellung_verarbeiten(&self, zustellung: Zustellung<DownstreamJob>) -> bool {
        match self.anwenden(&zustellung.job).await {
            Ok(()) => {
                if let Err(e) = self.queue.bestaetigen(zustellung.quittung).await {
                    tracing::warn!(fehler = %e, "Downstream-Job konnte nicht quittiert werden");
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    job = ?zustellung.job,
                    versuch = zustellung.versuch,
                    fehler = %e,
                    "Downstream-Job fehlgeschlagen, wird erneut zugestellt"
                );
                if let Err(e) = self.queue.zurueckgeben(zustellung.quittung).await {
                    tracing::error!(fehler = %e, "Downstream-Job konnte nicht zurueckgegeben werden");
                }
                false
            }
        }
    }

    /// Verarbeitet wartende Jobs bis die Queue leer ist oder ein Job scheitert
    pub async fn ausstehende_verarbeiten(&self) -> usize {
        let mut anzahl = 0;
        while let Some(zustellung) = self.queue.versuch_empfangen().await {
            anzahl += 1;
            if !self.zustellung_verarbeiten(zustellung).await {
                break;
            }
        }
        anzahl
    }

    /// Worker-Loop (laeuft bis `shutdown_rx` `true` meldet)
    pub async fn starten(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("Downstream-Worker gestartet");
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
        tracing::info!("Downstream-Worker beendet");
    }
}
