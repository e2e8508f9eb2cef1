//! Fehlertypen fuer den Signaling-Service

use thiserror::Error;
use treffpunkt_protocol::{Antwort, ErrorCode, ProtocolError};

/// Fehlertyp fuer den Signaling-Service
#[derive(Debug, Error)]
pub enum SignalingError {
    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-Format verletzt oder Handshake abgelehnt
    #[error("Protokollfehler: {0}")]
    Protokoll(#[from] ProtocolError),

    /// Token fehlt, ist leer oder nicht verifizierbar
    #[error("Invalid token.")]
    InvalidToken,

    /// Bedingter Schreibzugriff auf nicht existierenden Datensatz
    #[error("Vorbedingung verletzt: {0}")]
    PreconditionFailed(String),

    /// Empfaenger-Kanal existiert nicht mehr
    #[error("Empfaenger nicht mehr erreichbar: {0}")]
    RecipientGone(String),

    /// Empfaenger hat keinen offenen Kanal (Direktnachricht)
    #[error("Recipient is not connected.")]
    RecipientNotConnected,

    /// Send-Queue des Empfaengers voll
    #[error("Send-Queue voll: {0}")]
    SendeQueueVoll(String),

    /// Speicher-Backend nicht erreichbar oder fehlerhaft
    #[error("Speicher nicht verfuegbar: {0}")]
    StorageUnavailable(String),

    /// Job-Queue geschlossen oder Quittung unbekannt
    #[error("Queue-Fehler: {0}")]
    Queue(String),

    /// TLS-Aufbau fehlgeschlagen
    #[error("TLS-Fehler: {0}")]
    Tls(String),

    /// Ungueltige Anfrage (z.B. unbekannte URL)
    #[error("Ungueltige Anfrage: {0}")]
    UngueltigeAnfrage(String),

    /// Control-Channel bereits beendet
    #[error("Kanal geschlossen")]
    KanalGeschlossen,

    #[error("Serialisierungsfehler: {0}")]
    Serialisierung(#[from] serde_json::Error),
}

impl SignalingError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn ist_recipient_gone(&self) -> bool {
        matches!(self, Self::RecipientGone(_))
    }

    /// Stabiler Fehlercode fuer Client-sichtbare Ablehnungen
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidToken => ErrorCode::InvalidToken,
            Self::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            Self::RecipientGone(_) | Self::RecipientNotConnected => {
                ErrorCode::RecipientNotConnected
            }
            Self::Protokoll(ProtocolError::MalformedMessage(_))
            | Self::Serialisierung(_)
            | Self::UngueltigeAnfrage(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::InternalError,
        }
    }

    /// Ablehnung mit Code und Klartext
    pub fn als_antwort(&self) -> Antwort {
        let code = self.error_code();
        let text = match code {
            ErrorCode::InternalError => "Internal error.".to_string(),
            _ => self.to_string(),
        };
        Antwort::fehler(code, text)
    }
}

/// Result-Typ fuer den Signaling-Service
pub type SignalingResult<T> = Result<T, SignalingError>;
