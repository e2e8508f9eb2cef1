//! treffpunkt-core – Gemeinsame Typen und Events
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Treffpunkt-Crates gemeinsam genutzt werden: Identifikationstypen,
//! die Datensaetze des Presence-Modells und die Aenderungs-Events.

pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use event::{ConnectionChange, CounterChange, PresenceDelta};
pub use types::{Connection, ConnectionId, IdentityId, RoomCounter, RoomId, ServiceNamespace};
