//! Fehlertypen fuer die Wire-Formate

use thiserror::Error;

/// Fehler beim Kodieren oder Dekodieren
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// STUN-Nachricht zu kurz, falsches Magic-Cookie oder inkonsistente Laengen
    #[error("Ungueltige Nachricht: {0}")]
    MalformedMessage(String),

    /// STUN-Methode die der Responder nicht bedient (nicht fatal)
    #[error("Unbekannte STUN-Methode: {0:#06x}")]
    UnknownMethod(u16),

    /// (XOR-)MAPPED-ADDRESS weder 8 noch 20 Bytes lang
    #[error("Unerwartete Attributlaenge: {0}")]
    UnexpectedAttributeLength(usize),

    /// Opening-Handshake abgelehnt oder Accept-Token falsch
    #[error("WebSocket-Handshake fehlgeschlagen: {0}")]
    HandshakeFailed(String),

    #[error("Frame zu gross: {laenge} Bytes (Maximum: {maximum} Bytes)")]
    FrameZuGross { laenge: u64, maximum: usize },

    #[error("Unbekannter Opcode: {0:#x}")]
    UngueltigerOpcode(u8),

    #[error("Text-Frame ist kein gueltiges UTF-8")]
    UngueltigesUtf8,

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }
}

/// Result-Typ fuer die Wire-Formate
pub type ProtocolResult<T> = Result<T, ProtocolError>;
