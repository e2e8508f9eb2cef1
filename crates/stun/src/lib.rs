//! treffpunkt-stun – NAT-Adress-Ermittlung
//!
//! ## Module
//! - [`responder`] – UDP-Binding-Responder plus TCP-Health-Listener
//! - [`requester`] – Einzelne Binding-Anfrage mit Timeout (Client-Seite)

pub mod error;
pub mod requester;
pub mod responder;

pub use error::{StunError, StunResult};
pub use requester::StunRequester;
pub use responder::{HealthListener, StunResponder};
