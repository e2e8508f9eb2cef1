//! treffpunkt-signaling – Raum-Presence und Control-Channel
//!
//! Dieser Crate implementiert den Signaling-Dienst fuer Treffpunkt. Peers
//! halten einen WebSocket-Control-Channel offen, treten Raeumen bei und
//! tauschen darueber Kandidaten-Endpunkte und Nachrichten aus.
//!
//! ## Architektur
//!
//! ```text
//! SignalingServer (WebSocket-Endpunkt, ein Task pro Verbindung)
//!     |
//!     v
//! Dispatcher (joinRoom | sendMessage | broadcast)
//!     |
//!     +-- PresenceEngine  -> PresenceStore (Connection schreiben)
//!     +-- FanoutJob-Queue -> FanoutEngine  -> ConnectionRegistry
//!
//! PresenceStore --Aenderungsstrom--> AenderungsPumpe -> DownstreamWorker
//!                                      (Zaehler pflegen, "left"-Hinweise)
//!
//! WsControlChannel – Client-Seite des Kanals (ws:// und wss://)
//! ```

pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod presence;
pub mod queue;
pub mod server;
pub mod store;

// Bequeme Re-Exporte
pub use auth::{Identitaet, OpakerTokenVerifier, TokenVerifier};
pub use broadcast::{ConnectionRegistry, Zusteller};
pub use channel::{KanalEnde, KanalEreignis, WsControlChannel};
pub use dispatcher::Dispatcher;
pub use downstream::{AenderungsPumpe, DownstreamJob, DownstreamWorker};
pub use error::{SignalingError, SignalingResult};
pub use fanout::{FanoutEngine, FanoutJob};
pub use memory::MemoryStore;
pub use presence::PresenceEngine;
pub use queue::{JobQueue, MemoryQueue};
pub use server::SignalingServer;
pub use store::{PresenceStore, RaumFilter, Seite};
