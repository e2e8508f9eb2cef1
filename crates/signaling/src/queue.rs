//! Job-Queue mit expliziter Quittung (at-least-once)
//!
//! Ein empfangener Job bleibt "in Bearbeitung" bis er bestaetigt wird.
//! `zurueckgeben` legt ihn erneut in die Queue; ein Worker der abstuerzt
//! bevor er quittiert, verliert also keinen Job.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{SignalingError, SignalingResult};

/// Quittung eines empfangenen Jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quittung(Uuid);

impl std::fmt::Display for Quittung {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ein zugestellter Job
#[derive(Debug, Clone)]
pub struct Zustellung<J> {
    pub quittung: Quittung,
    pub job: J,
    /// 1 bei der ersten Zustellung
    pub versuch: u32,
}

#[allow(async_fn_in_trait)]
pub trait JobQueue<J>: Send + Sync {
    async fn einreihen(&self, job: J) -> SignalingResult<()>;

    /// Wartet auf den naechsten Job
    async fn empfangen(&self) -> Zustellung<J>;

    /// Naechster Job ohne zu warten
    async fn versuch_empfangen(&self) -> Option<Zustellung<J>>;

    /// Job erfolgreich verarbeitet
    async fn bestaetigen(&self, quittung: Quittung) -> SignalingResult<()>;

    /// Job erneut zustellen
    async fn zurueckgeben(&self, quittung: Quittung) -> SignalingResult<()>;
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// In-Memory-Queue. Clone teilt den inneren Zustand.
pub struct MemoryQueue<J> {
    inner: Arc<MemoryQueueInner<J>>,
}

struct MemoryQueueInner<J> {
    wartend: Mutex<VecDeque<(J, u32)>>,
    in_bearbeitung: DashMap<Quittung, (J, u32)>,
    signal: Notify,
}

impl<J> Clone for MemoryQueue<J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<J: Clone + Send + Sync> MemoryQueue<J> {
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(MemoryQueueInner {
                wartend: Mutex::new(VecDeque::new()),
                in_bearbeitung: DashMap::new(),
                signal: Notify::new(),
            }),
        }
    }

    /// Anzahl wartender (nicht empfangener) Jobs
    pub async fn wartend(&self) -> usize {
        self.inner.wartend.lock().await.len()
    }

    /// Anzahl empfangener, noch nicht quittierter Jobs
    pub fn in_bearbeitung(&self) -> usize {
        self.inner.in_bearbeitung.len()
    }

    async fn ablegen(&self, job: J, versuch: u32) {
        self.inner.wartend.lock().await.push_back((job, versuch));
        self.inner.signal.notify_one();
    }

    fn zustellung(&self, job: J, versuch: u32) -> Zustellung<J> {
        let quittung = Quittung(Uuid::new_v4());
        self.inner
            .in_bearbeitung
            .insert(quittung, (job.clone(), versuch));
        Zustellung {
            quittung,
            job,
            versuch,
        }
    }
}

impl<J: Clone + Send + Sync> Default for MemoryQueue<J> {
    fn default() -> Self {
        Self::neu()
    }
}

impl<J: Clone + Send + Sync> JobQueue<J> for MemoryQueue<J> {
    async fn einreihen(&self, job: J) -> SignalingResult<()> {
        self.ablegen(job, 1).await;
        Ok(())
    }

    async fn empfangen(&self) -> Zustellung<J> {
        loop {
            if let Some(zustellung) = self.versuch_empfangen().await {
                return zustellung;
            }
            self.inner.signal.notified().await;
        }
    }

    async fn versuch_empfangen(&self) -> Option<Zustellung<J>> {
        let naechster = self.inner.wartend.lock().await.pop_front();
        naechster.map(|(job, versuch)| self.zustellung(job, versuch))
    }

    async fn bestaetigen(&self, quittung: Quittung) -> SignalingResult<()> {
        self.inner
            .in_bearbeitung
            .remove(&quittung)
            .map(|_| ())
            .ok_or_else(|| SignalingError::Queue(format!("Unbekannte Quittung {quittung}")))
    }

    async fn zurueckgeben(&self, quittung: Quittung) -> SignalingResult<()> {
        let (_, (job, versuch)) = self
            .inner
            .in_bearbeitung
            .remove(&quittung)
            .ok_or_else(|| SignalingError::Queue(format!("Unbekannte Quittung {quittung}")))?;
        self.ablegen(job, versuch + 1).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bestaetigen_entfernt_job() {
        let queue = MemoryQueue::neu();
        queue.einreihen("a").await.unwrap();
        queue.einreihen("b").await.unwrap();

        let z = queue.versuch_empfangen().await.unwrap();
        assert_eq!(z.job, "a");
        assert_eq!(z.versuch, 1);
        assert_eq!(queue.in_bearbeitung(), 1);

        queue.bestaetigen(z.quittung).await.unwrap();
        assert_eq!(queue.in_bearbeitung(), 0);
        assert!(queue.bestaetigen(z.quittung).await.is_err());
        assert_eq!(queue.wartend().await, 1);
    }

    #[tokio::test]
    async fn zurueckgeben_stellt_erneut_zu() {
        let queue = MemoryQueue::neu();
        queue.einreihen(7u32).await.unwrap();

        let erste = queue.versuch_empfangen().await.unwrap();
        queue.zurueckgeben(erste.quittung).await.unwrap();

        let zweite = queue.versuch_empfangen().await.unwrap();
        assert_eq!(zweite.job, 7);
        assert_eq!(zweite.versuch, 2);
        assert_ne!(erste.quittung, zweite.quittung);
    }

    #[tokio::test]
    async fn empfangen_wartet_auf_job() {
        let queue: MemoryQueue<String> = MemoryQueue::neu();
        let q2 = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            q2.einreihen("spaet".to_string()).await.unwrap();
        });

        let z = tokio::time::timeout(Duration::from_secs(2), queue.empfangen())
            .await
            .expect("Job muss ankommen");
        assert_eq!(z.job, "spaet");
    }
}
