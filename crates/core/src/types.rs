//! Identifikationstypen und Datensaetze des Presence-Modells
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen. Die IDs sind
//! opake Strings, weil sie von externen Komponenten (Gateway, Token-Dienst)
//! vergeben werden.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Eindeutige ID eines offenen Control-Channels
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Erstellt eine neue zufaellige ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identitaet eines Peers (aus dem verifizierten Token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name eines Raums innerhalb eines Service-Namespaces
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leere Raum-IDs bedeuten "Raum verlassen"
    pub fn ist_leer(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service-Namespace, trennt Identitaeten und Raeume verschiedener Dienste
///
/// Nur alphanumerische Zeichen sind erlaubt; alles andere wird beim
/// Erstellen entfernt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceNamespace(String);

impl ServiceNamespace {
    /// Erstellt einen bereinigten Namespace
    pub fn neu(name: &str) -> Self {
        Self(name.chars().filter(|c| c.is_alphanumeric()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Datensaetze
// ---------------------------------------------------------------------------

/// Ein offener Control-Channel und seine Raum-Zugehoerigkeit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub identity_id: IdentityId,
    pub namespace: ServiceNamespace,
    /// `None` solange der Peer keinem Raum beigetreten ist
    pub room_id: Option<RoomId>,
    /// Frei formatierter Kandidaten-Endpunkt (z.B. "203.0.113.5:54321")
    pub candidate: Option<String>,
}

impl Connection {
    /// Neue Connection ohne Raum
    pub fn neu(
        connection_id: ConnectionId,
        identity_id: IdentityId,
        namespace: ServiceNamespace,
    ) -> Self {
        Self {
            connection_id,
            identity_id,
            namespace,
            room_id: None,
            candidate: None,
        }
    }
}

/// Mitgliederzaehler eines Raums
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCounter {
    pub namespace: ServiceNamespace,
    pub room_id: RoomId,
    pub member_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_eindeutig() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b, "Zwei neue ConnectionIds muessen verschieden sein");
    }

    #[test]
    fn namespace_wird_bereinigt() {
        let ns = ServiceNamespace::neu("stun-punch_01!");
        assert_eq!(ns.as_str(), "stunpunch01");
    }

    #[test]
    fn leere_raum_id() {
        assert!(RoomId::from("").ist_leer());
        assert!(!RoomId::from("R1").ist_leer());
    }

    #[test]
    fn ids_sind_serde_transparent() {
        let rid = RoomId::from("R1");
        let json = serde_json::to_string(&rid).unwrap();
        assert_eq!(json, "\"R1\"");
        let rid2: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(rid, rid2);
    }
}
