//! In-Memory-Backend fuer den Storage-Vertrag
//!
//! Haelt Connections und Zaehler in `DashMap`s. Jede Mutation schreibt ihr
//! Aenderungs-Event noch unter dem Eintrags-Lock in den Aenderungsstrom, so
//! dass die Reihenfolge im Strom der Reihenfolge der Mutationen pro
//! Datensatz entspricht.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use treffpunkt_core::{
    Connection, ConnectionChange, ConnectionId, CounterChange, IdentityId, RoomCounter, RoomId,
    ServiceNamespace,
};

use crate::error::{SignalingError, SignalingResult};
use crate::store::{PresenceStore, RaumFilter, Seite, StoreAenderung};

type ZaehlerSchluessel = (ServiceNamespace, RoomId);

/// Thread-safe In-Memory-Store. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    connections: DashMap<ConnectionId, Connection>,
    zaehler: DashMap<ZaehlerSchluessel, RoomCounter>,
    aenderungen: mpsc::UnboundedSender<StoreAenderung>,
}

impl MemoryStore {
    /// Erstellt einen leeren Store und den zugehoerigen Aenderungsstrom
    pub fn neu() -> (Self, mpsc::UnboundedReceiver<StoreAenderung>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            inner: Arc::new(MemoryStoreInner {
                connections: DashMap::new(),
                zaehler: DashMap::new(),
                aenderungen: tx,
            }),
        };
        (store, rx)
    }

    pub fn connection_anzahl(&self) -> usize {
        self.inner.connections.len()
    }

    fn melden(&self, aenderung: StoreAenderung) {
        if self.inner.aenderungen.send(aenderung).is_err() {
            tracing::trace!("Aenderungsstrom ohne Empfaenger");
        }
    }

    fn connection_melden(&self, alt: Option<Connection>, neu: Option<Connection>) {
        self.melden(StoreAenderung::Connection(ConnectionChange { alt, neu }));
    }

    fn zaehler_melden(&self, alt: Option<RoomCounter>, neu: Option<RoomCounter>) {
        self.melden(StoreAenderung::Zaehler(CounterChange { alt, neu }));
    }
}

/// Sortiert, ab Cursor gefiltert, eine Seite plus Fortsetzung
fn seite_bilden<T, K, F>(mut eintraege: Vec<T>, schluessel: F, limit: usize, fortsetzung: Option<&str>) -> Seite<T>
where
    F: Fn(&T) -> K,
    K: AsRef<str>,
{
    eintraege.sort_by(|a, b| schluessel(a).as_ref().cmp(schluessel(b).as_ref()));
    if let Some(cursor) = fortsetzung {
        eintraege.retain(|e| schluessel(e).as_ref() > cursor);
    }

    let limit = limit.max(1);
    let mehr = eintraege.len() > limit;
    eintraege.truncate(limit);
    let fortsetzung = if mehr {
        eintraege.last().map(|e| schluessel(e).as_ref().to_string())
    } else {
        None
    };

    Seite {
        eintraege,
        fortsetzung,
    }
}

impl PresenceStore for MemoryStore {
    async fn connection_laden(&self, id: &ConnectionId) -> SignalingResult<Option<Connection>> {
        Ok(self.inner.connections.get(id).map(|c| c.clone()))
    }

    async fn connection_anlegen(&self, connection: Connection) -> SignalingResult<()> {
        match self.inner.connections.entry(connection.connection_id.clone()) {
            Entry::Occupied(mut eintrag) => {
                let alt = eintrag.insert(connection.clone());
                self.connection_melden(Some(alt), Some(connection));
            }
            Entry::Vacant(eintrag) => {
                eintrag.insert(connection.clone());
                self.connection_melden(None, Some(connection));
            }
        }
        Ok(())
    }

    async fn connection_aktualisieren(
        &self,
        id: &ConnectionId,
        namespace: &ServiceNamespace,
        identitaet: &IdentityId,
        raum: Option<RoomId>,
        kandidat: Option<String>,
    ) -> SignalingResult<Connection> {
        let mut eintrag = self
            .inner
            .connections
            .get_mut(id)
            .ok_or_else(|| SignalingError::precondition(format!("Connection {id} existiert nicht")))?;

        if eintrag.namespace != *namespace || eintrag.identity_id != *identitaet {
            return Err(SignalingError::precondition(format!(
                "Connection {id} gehoert nicht zu {identitaet}"
            )));
        }

        let alt = eintrag.clone();
        eintrag.candidate = if raum.is_some() { kandidat } else { None };
        eintrag.room_id = raum;
        let neu = eintrag.clone();
        self.connection_melden(Some(alt), Some(neu.clone()));
        Ok(neu)
    }

    async fn connection_loeschen(&self, id: &ConnectionId) -> SignalingResult<Option<Connection>> {
        match self.inner.connections.entry(id.clone()) {
            Entry::Occupied(eintrag) => {
                let alt = eintrag.remove();
                self.connection_melden(Some(alt.clone()), None);
                Ok(Some(alt))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn mitglieder_abfragen(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<Connection>> {
        let mitglieder: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .filter(|c| c.namespace == *namespace && c.room_id.as_ref() == Some(raum))
            .map(|c| c.clone())
            .collect();

        Ok(seite_bilden(
            mitglieder,
            |c| c.connection_id.0.clone(),
            limit,
            fortsetzung,
        ))
    }

    async fn connections_der_identitaet(
        &self,
        namespace: &ServiceNamespace,
        identitaet: &IdentityId,
        limit: usize,
    ) -> SignalingResult<Vec<Connection>> {
        let treffer: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .filter(|c| c.namespace == *namespace && c.identity_id == *identitaet)
            .map(|c| c.clone())
            .collect();

        Ok(seite_bilden(treffer, |c| c.connection_id.0.clone(), limit, None).eintraege)
    }

    async fn zaehler_laden(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
    ) -> SignalingResult<Option<RoomCounter>> {
        Ok(self
            .inner
            .zaehler
            .get(&(namespace.clone(), raum.clone()))
            .map(|z| z.clone()))
    }

    async fn zaehler_addieren(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
        delta: i64,
        nur_wenn_vorhanden: bool,
    ) -> SignalingResult<RoomCounter> {
        match self.inner.zaehler.entry((namespace.clone(), raum.clone())) {
            Entry::Occupied(mut eintrag) => {
                let alt = eintrag.get().clone();
                eintrag.get_mut().member_count += delta;
                let neu = eintrag.get().clone();
                self.zaehler_melden(Some(alt), Some(neu.clone()));
                Ok(neu)
            }
            Entry::Vacant(_) if nur_wenn_vorhanden => Err(SignalingError::precondition(format!(
                "Zaehler fuer Raum {raum} existiert nicht"
            ))),
            Entry::Vacant(eintrag) => {
                let neu = RoomCounter {
                    namespace: namespace.clone(),
                    room_id: raum.clone(),
                    member_count: delta,
                };
                eintrag.insert(neu.clone());
                self.zaehler_melden(None, Some(neu.clone()));
                Ok(neu)
            }
        }
    }

    async fn zaehler_loeschen_wenn_null(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
    ) -> SignalingResult<bool> {
        match self.inner.zaehler.entry((namespace.clone(), raum.clone())) {
            Entry::Occupied(eintrag) if eintrag.get().member_count == 0 => {
                let alt = eintrag.remove();
                self.zaehler_melden(Some(alt), None);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn raeume_abfragen(
        &self,
        namespace: &ServiceNamespace,
        filter: &RaumFilter,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<RoomCounter>> {
        let raeume: Vec<RoomCounter> = self
            .inner
            .zaehler
            .iter()
            .filter(|z| z.namespace == *namespace)
            .filter(|z| match filter {
                RaumFilter::Praefix(praefix) => z.room_id.as_str().starts_with(praefix.as_str()),
                RaumFilter::MindestAnzahl(n) => z.member_count >= *n,
            })
            .map(|z| z.clone())
            .collect();

        Ok(seite_bilden(raeume, |z| z.room_id.0.clone(), limit, fortsetzung))
    }
}
