//! Presence-Engine – Raum-Zugehoerigkeit offener Verbindungen
//!
//! ## Zustandsmaschine pro Connection
//! ```text
//! (kein Datensatz) --verbinden--> Unjoined --beitreten(R)--> Joined(R)
//!                                    ^                         |
//!                                    +------ verlassen --------+
//! Joined(A) --beitreten(B)--> Joined(B)   (= verlassen(A) + beitreten(B))
//! ```
//!
//! Die Engine schreibt nur die Connection. Zaehler und Hinweise entstehen
//! aus dem Aenderungsstrom des Backends (`deltas_ableiten`), nie aus einem
//! zweiten Aufruf hier. Ein Absturz zwischen Schreiben und Antworten kann
//! daher keine Zaehler-Updates verlieren oder doppeln.

use serde::{Deserialize, Serialize};
use treffpunkt_core::{
    Connection, ConnectionChange, ConnectionId, IdentityId, PresenceDelta, RoomCounter, RoomId,
    ServiceNamespace,
};

use crate::auth::{Identitaet, TokenVerifier};
use crate::error::SignalingResult;
use crate::store::{mitglieder_seite_lesen, PresenceStore, RaumFilter, Seite};

/// Kandidat fuer Connections die keinen angegeben haben
pub const KEIN_KANDIDAT: &str = "n/a";

/// Ergebnis eines `joinRoom`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaumWechsel {
    Beigetreten {
        identitaet: Identitaet,
        raum: RoomId,
        kandidat: String,
    },
    Verlassen {
        identitaet: Identitaet,
    },
}

/// Oeffentliche Sicht auf ein Raum-Mitglied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mitglied {
    pub identity_id: IdentityId,
    pub candidate: String,
}

impl From<Connection> for Mitglied {
    fn from(c: Connection) -> Self {
        Self {
            identity_id: c.identity_id,
            candidate: c.candidate.unwrap_or_else(|| KEIN_KANDIDAT.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// PresenceEngine
// ---------------------------------------------------------------------------

pub struct PresenceEngine<S, V> {
    store: S,
    verifier: V,
}

impl<S, V> PresenceEngine<S, V>
where
    S: PresenceStore,
    V: TokenVerifier,
{
    pub fn neu(store: S, verifier: V) -> Self {
        Self { store, verifier }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Token einer Anfrage pruefen
    pub async fn identitaet(&self, token: Option<&str>) -> SignalingResult<Identitaet> {
        self.verifier.pruefen(token).await
    }

    /// Legt die Connection eines neu geoeffneten Kanals an
    ///
    /// Ohne gueltiges Token wird nichts geschrieben.
    pub async fn verbinden(
        &self,
        connection_id: ConnectionId,
        token: Option<&str>,
    ) -> SignalingResult<Connection> {
        let identitaet = self.verifier.pruefen(token).await?;
        let connection = Connection::neu(
            connection_id,
            identitaet.identity_id,
            identitaet.namespace,
        );
        self.store.connection_anlegen(connection.clone()).await?;

        tracing::info!(
            connection_id = %connection.connection_id,
            identity = %connection.identity_id,
            "Connection angelegt"
        );
        Ok(connection)
    }

    /// Entfernt die Connection eines geschlossenen Kanals
    ///
    /// Hielt sie einen Raum, entsteht daraus ueber den Aenderungsstrom ein
    /// -1 fuer diesen Raum.
    pub async fn trennen(&self, connection_id: &ConnectionId) -> SignalingResult<Option<Connection>> {
        let alt = self.store.connection_loeschen(connection_id).await?;
        if let Some(ref c) = alt {
            tracing::info!(
                connection_id = %connection_id,
                raum = ?c.room_id.as_ref().map(|r| r.as_str()),
                "Connection entfernt"
            );
        }
        Ok(alt)
    }

    /// `joinRoom`: Raum betreten, wechseln oder (leere Raum-ID) verlassen
    ///
    /// # Fehler
    /// - `InvalidToken` ohne Mutation
    /// - `PreconditionFailed` wenn die Connection nicht (mehr) existiert
    pub async fn raum_setzen(
        &self,
        connection_id: &ConnectionId,
        token: Option<&str>,
        raum: Option<RoomId>,
        kandidat: Option<String>,
    ) -> SignalingResult<RaumWechsel> {
        let identitaet = self.verifier.pruefen(token).await?;
        let raum = raum.filter(|r| !r.ist_leer());

        match raum {
            Some(raum) => {
                let kandidat = kandidat
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| KEIN_KANDIDAT.to_string());
                self.store
                    .connection_aktualisieren(
                        connection_id,
                        &identitaet.namespace,
                        &identitaet.identity_id,
                        Some(raum.clone()),
                        Some(kandidat.clone()),
                    )
                    .await?;

                tracing::debug!(
                    connection_id = %connection_id,
                    identity = %identitaet.identity_id,
                    raum = %raum,
                    "Raum betreten"
                );
                Ok(RaumWechsel::Beigetreten {
                    identitaet,
                    raum,
                    kandidat,
                })
            }
            None => {
                self.store
                    .connection_aktualisieren(
                        connection_id,
                        &identitaet.namespace,
                        &identitaet.identity_id,
                        None,
                        None,
                    )
                    .await?;

                tracing::debug!(connection_id = %connection_id, "Raum verlassen");
                Ok(RaumWechsel::Verlassen { identitaet })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Raum-Abfragen
    // -----------------------------------------------------------------------

    /// Mitglieder eines Raums seitenweise
    pub async fn mitglieder(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<Mitglied>> {
        let seite = mitglieder_seite_lesen(&self.store, namespace, raum, limit, fortsetzung).await?;
        Ok(Seite {
            eintraege: seite.eintraege.into_iter().map(Mitglied::from).collect(),
            fortsetzung: seite.fortsetzung,
        })
    }

    /// Prueft ob eine Identitaet (mit ihrer ersten offenen Connection) im Raum ist
    pub async fn ist_im_raum(
        &self,
        namespace: &ServiceNamespace,
        identitaet: &IdentityId,
        raum: &RoomId,
    ) -> SignalingResult<bool> {
        let connections = self
            .store
            .connections_der_identitaet(namespace, identitaet, 1)
            .await?;
        Ok(connections
            .first()
            .and_then(|c| c.room_id.as_ref())
            .is_some_and(|r| r == raum))
    }

    /// Raeume eines Namespaces nach Praefix oder Mindest-Mitgliederzahl
    pub async fn raeume(
        &self,
        namespace: &ServiceNamespace,
        filter: &RaumFilter,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<RoomCounter>> {
        self.store
            .raeume_abfragen(namespace, filter, limit, fortsetzung)
            .await
    }
}

// ---------------------------------------------------------------------------
// Aenderungsstrom -> Deltas
// ---------------------------------------------------------------------------

/// Leitet aus einer Connection-Aenderung 0, 1 oder 2 Deltas ab
///
/// Nur ein geaenderter Raum zaehlt: -1 fuer den alten, +1 fuer den neuen.
/// Ein reines Kandidaten-Update erzeugt nichts.
pub fn deltas_ableiten(aenderung: &ConnectionChange) -> Vec<PresenceDelta> {
    if !aenderung.raum_geaendert() {
        return Vec::new();
    }

    let delta = |c: &Connection, raum: &RoomId, wert: i64| PresenceDelta {
        namespace: c.namespace.clone(),
        room_id: raum.clone(),
        delta: wert,
        connection_id: c.connection_id.clone(),
        identity_id: c.identity_id.clone(),
        candidate: c
            .candidate
            .clone()
            .unwrap_or_else(|| KEIN_KANDIDAT.to_string()),
    };

    let mut deltas = Vec::with_capacity(2);
    if let (Some(alt), Some(raum)) = (&aenderung.alt, aenderung.alter_raum()) {
        deltas.push(delta(alt, raum, -1));
    }
    if let (Some(neu), Some(raum)) = (&aenderung.neu, aenderung.neuer_raum()) {
        deltas.push(delta(neu, raum, 1));
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpakerTokenVerifier;
    use crate::error::SignalingError;
    use crate::memory::MemoryStore;
    use crate::store::StoreAenderung;

    fn engine() -> (
        PresenceEngine<MemoryStore, OpakerTokenVerifier>,
        tokio::sync::mpsc::UnboundedReceiver<StoreAenderung>,
    ) {
        let (store, rx) = MemoryStore::neu();
        let verifier = OpakerTokenVerifier::neu(ServiceNamespace::neu("svc"));
        (PresenceEngine::neu(store, verifier), rx)
    }

    fn conn(cid: &str, raum: Option<&str>, kandidat: Option<&str>) -> Connection {
        Connection {
            connection_id: ConnectionId::from(cid),
            identity_id: IdentityId::from("alice"),
            namespace: ServiceNamespace::neu("svc"),
            room_id: raum.map(RoomId::from),
            candidate: kandidat.map(String::from),
        }
    }

    #[test]
    fn deltas_fuer_alle_uebergaenge() {
        let beitritt = ConnectionChange {
            alt: Some(conn("c1", None, None)),
            neu: Some(conn("c1", Some("R1"), Some("1.2.3.4:5"))),
        };
        let d = deltas_ableiten(&beitritt);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].delta, 1);
        assert_eq!(d[0].candidate, "1.2.3.4:5");

        let wechsel = ConnectionChange {
            alt: Some(conn("c1", Some("A"), None)),
            neu: Some(conn("c1", Some("B"), None)),
        };
        let d = deltas_ableiten(&wechsel);
        assert_eq!(d.len(), 2);
        assert_eq!((d[0].room_id.as_str(), d[0].delta), ("A", -1));
        assert_eq!((d[1].room_id.as_str(), d[1].delta), ("B", 1));
        assert_eq!(d[0].candidate, KEIN_KANDIDAT);

        let trennen = ConnectionChange {
            alt: Some(conn("c1", Some("A"), None)),
            neu: None,
        };
        assert_eq!(deltas_ableiten(&trennen)[0].delta, -1);

        let nur_kandidat = ConnectionChange {
            alt: Some(conn("c1", Some("A"), Some("x"))),
            neu: Some(conn("c1", Some("A"), Some("y"))),
        };
        assert!(deltas_ableiten(&nur_kandidat).is_empty());

        let anlegen = ConnectionChange {
            alt: None,
            neu: Some(conn("c1", None, None)),
        };
        assert!(deltas_ableiten(&anlegen).is_empty());
    }

    #[tokio::test]
    async fn beitritt_ohne_connection_ist_precondition_failed() {
        let (engine, mut rx) = engine();
        let ergebnis = engine
            .raum_setzen(
                &ConnectionId::from("fehlt"),
                Some("alice"),
                Some(RoomId::from("R1")),
                None,
            )
            .await;
        assert!(matches!(ergebnis, Err(SignalingError::PreconditionFailed(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.store().connection_anzahl(), 0);
    }

    #[tokio::test]
    async fn ungueltiges_token_mutiert_nichts() {
        let (engine, mut rx) = engine();
        let cid = ConnectionId::from("c1");
        engine.verbinden(cid.clone(), Some("alice")).await.unwrap();
        let _ = rx.try_recv();

        for token in [None, Some(""), Some("   ")] {
            let ergebnis = engine
                .raum_setzen(&cid, token, Some(RoomId::from("R1")), None)
                .await;
            assert!(matches!(ergebnis, Err(SignalingError::InvalidToken)));
        }
        assert!(rx.try_recv().is_err());

        let c = engine.store().connection_laden(&cid).await.unwrap().unwrap();
        assert!(c.room_id.is_none());

        assert!(matches!(
            engine.verbinden(ConnectionId::from("c2"), None).await,
            Err(SignalingError::InvalidToken)
        ));
        assert_eq!(engine.store().connection_anzahl(), 1);
    }

    #[tokio::test]
    async fn leere_raum_id_verlaesst_raum() {
        let (engine, _rx) = engine();
        let cid = ConnectionId::from("c1");
        engine.verbinden(cid.clone(), Some("alice")).await.unwrap();

        // Verlassen ohne Raum ist erlaubt
        let wechsel = engine
            .raum_setzen(&cid, Some("alice"), Some(RoomId::from("")), None)
            .await
            .unwrap();
        assert!(matches!(wechsel, RaumWechsel::Verlassen { .. }));

        let wechsel = engine
            .raum_setzen(&cid, Some("alice"), Some(RoomId::from("R1")), None)
            .await
            .unwrap();
        assert!(matches!(
            wechsel,
            RaumWechsel::Beigetreten { ref kandidat, .. } if kandidat == KEIN_KANDIDAT
        ));

        engine.raum_setzen(&cid, Some("alice"), None, None).await.unwrap();
        let c = engine.store().connection_laden(&cid).await.unwrap().unwrap();
        assert!(c.room_id.is_none());
        assert!(c.candidate.is_none());
    }

    #[tokio::test]
    async fn raum_abfragen() {
        let (engine, _rx) = engine();
        for (cid, uid) in [("c1", "alice"), ("c2", "bob")] {
            engine
                .verbinden(ConnectionId::from(cid), Some(uid))
                .await
                .unwrap();
            engine
                .raum_setzen(
                    &ConnectionId::from(cid),
                    Some(uid),
                    Some(RoomId::from("R1")),
                    Some(format!("10.0.0.1:{}", cid.len())),
                )
                .await
                .unwrap();
        }

        let ns = ServiceNamespace::neu("svc");
        let seite = engine
            .mitglieder(&ns, &RoomId::from("R1"), 10, None)
            .await
            .unwrap();
        assert_eq!(seite.eintraege.len(), 2);
        assert_eq!(seite.eintraege[0].identity_id.as_str(), "alice");

        assert!(engine
            .ist_im_raum(&ns, &IdentityId::from("bob"), &RoomId::from("R1"))
            .await
            .unwrap());
        assert!(!engine
            .ist_im_raum(&ns, &IdentityId::from("bob"), &RoomId::from("R2"))
            .await
            .unwrap());
        assert!(!engine
            .ist_im_raum(&ns, &IdentityId::from("carol"), &RoomId::from("R1"))
            .await
            .unwrap());
    }
}
