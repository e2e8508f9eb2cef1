//! Fehlertypen fuer STUN

use thiserror::Error;
use treffpunkt_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum StunError {
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Dekodierfehler der Antwort
    #[error("Protokollfehler: {0}")]
    Protokoll(#[from] ProtocolError),

    /// Keine Antwort innerhalb des Timeouts (wird nicht intern wiederholt)
    #[error("Keine STUN-Antwort nach {0:?}")]
    Timeout(std::time::Duration),

    /// Antwort mit fremder Transaction-ID
    #[error("Transaction-ID der Antwort passt nicht zur Anfrage")]
    ResponseMismatch,

    /// Antwort enthaelt kein (XOR-)MAPPED-ADDRESS
    #[error("Antwort ohne gemappte Adresse")]
    KeineAdresse,
}

pub type StunResult<T> = Result<T, StunError>;
