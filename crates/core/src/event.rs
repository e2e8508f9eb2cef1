//! Aenderungs-Events des Presence-Modells
//!
//! Das Storage-Backend erzeugt bei jeder Mutation eines Datensatzes ein
//! Aenderungs-Event (altes und neues Abbild). Daraus leitet die
//! Presence-Engine die Zaehler-Deltas ab. Weil die Events aus der
//! Mutation selbst stammen, gehen keine Zaehler-Updates verloren, auch wenn
//! der ausloesende Client mitten in der Anfrage abstuerzt.

use crate::types::{Connection, ConnectionId, IdentityId, RoomCounter, RoomId, ServiceNamespace};
use serde::{Deserialize, Serialize};

/// Aenderung an einer Connection (Insert: `alt == None`, Delete: `neu == None`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionChange {
    pub alt: Option<Connection>,
    pub neu: Option<Connection>,
}

impl ConnectionChange {
    /// Raum vor der Aenderung
    pub fn alter_raum(&self) -> Option<&RoomId> {
        self.alt.as_ref().and_then(|c| c.room_id.as_ref())
    }

    /// Raum nach der Aenderung
    pub fn neuer_raum(&self) -> Option<&RoomId> {
        self.neu.as_ref().and_then(|c| c.room_id.as_ref())
    }

    /// Prueft ob sich die Raum-Zugehoerigkeit geaendert hat
    pub fn raum_geaendert(&self) -> bool {
        self.alter_raum() != self.neuer_raum()
    }
}

/// Aenderung an einem Raum-Zaehler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterChange {
    pub alt: Option<RoomCounter>,
    pub neu: Option<RoomCounter>,
}

/// Presence-Delta fuer die Zaehler- und Benachrichtigungs-Pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub namespace: ServiceNamespace,
    pub room_id: RoomId,
    /// +1 (beigetreten) oder -1 (verlassen)
    pub delta: i64,
    pub connection_id: ConnectionId,
    pub identity_id: IdentityId,
    pub candidate: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(raum: Option<&str>) -> Connection {
        Connection {
            connection_id: ConnectionId::from("c1"),
            identity_id: IdentityId::from("alice"),
            namespace: ServiceNamespace::neu("svc"),
            room_id: raum.map(RoomId::from),
            candidate: None,
        }
    }

    #[test]
    fn raumwechsel_erkennung() {
        let beitritt = ConnectionChange {
            alt: Some(conn(None)),
            neu: Some(conn(Some("R1"))),
        };
        assert!(beitritt.raum_geaendert());

        let nur_kandidat = ConnectionChange {
            alt: Some(conn(Some("R1"))),
            neu: Some(conn(Some("R1"))),
        };
        assert!(!nur_kandidat.raum_geaendert());

        let insert = ConnectionChange {
            alt: None,
            neu: Some(conn(None)),
        };
        assert!(!insert.raum_geaendert());
    }
}
