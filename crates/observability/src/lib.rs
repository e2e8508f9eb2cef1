//! # treffpunkt-observability
//!
//! Structured Logging via tracing-subscriber (Text oder JSON), einmal pro
//! Prozess in den Binaries initialisiert.

pub mod logging;

pub use logging::{logging_initialisieren, LogEinstellungen, LogFormat};
