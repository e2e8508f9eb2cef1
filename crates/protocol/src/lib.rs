//! treffpunkt-protocol – Wire-Formate
//!
//! Reine Kodierung/Dekodierung ohne eigene Sockets:
//! - `stun`: RFC 5389 Binding-Request/-Response (Teilmenge)
//! - `ws`: RFC 6455 Frames als tokio-util Codec
//! - `handshake`: RFC 6455 Opening-Handshake (Client- und Server-Seite)
//! - `signaling`: JSON-Nachrichten des Signaling-Kanals

pub mod error;
pub mod handshake;
pub mod signaling;
pub mod stun;
pub mod ws;

pub use error::{ProtocolError, ProtocolResult};
pub use signaling::{Ablehnung, Antwort, Benachrichtigung, ErrorCode, SignalingMessage};
pub use stun::{StunMessage, TransactionId};
pub use ws::{Frame, Maskierung, Opcode, WsFrameCodec};
