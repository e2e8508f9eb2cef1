//! Signaling-Nachrichten (JSON in WebSocket-Text-Frames)
//!
//! Eingehend: `SignalingMessage`, intern getaggt ueber das Feld `action`.
//! Ausgehend: `Antwort` auf jede Anfrage und `Benachrichtigung` fuer alles
//! was per Fan-out oder Direktnachricht zugestellt wird.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use treffpunkt_core::{IdentityId, RoomId};

use crate::error::{ProtocolError, ProtocolResult};

// ---------------------------------------------------------------------------
// Anfragen
// ---------------------------------------------------------------------------

/// Aktion eines Peers
///
/// Jede Aktion traegt das Identitaets-Token des Absenders. Ein `joinRoom`
/// mit fehlender oder leerer Raum-ID bedeutet "Raum verlassen".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SignalingMessage {
    JoinRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rid: Option<RoomId>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<String>,
    },
    SendMessage {
        uid: IdentityId,
        #[serde(default)]
        token: Option<String>,
        content: Value,
    },
    Broadcast {
        rid: RoomId,
        #[serde(default)]
        token: Option<String>,
        content: Value,
    },
}

impl SignalingMessage {
    /// Beitritt zu `rid` mit eigenem Kandidaten-Endpunkt
    pub fn join(rid: RoomId, token: impl Into<String>, candidate: Option<String>) -> Self {
        Self::JoinRoom {
            rid: Some(rid),
            token: Some(token.into()),
            candidate,
        }
    }

    /// Aktuellen Raum verlassen
    pub fn leave(token: impl Into<String>) -> Self {
        Self::JoinRoom {
            rid: None,
            token: Some(token.into()),
            candidate: None,
        }
    }

    pub fn send_message(uid: IdentityId, token: impl Into<String>, content: Value) -> Self {
        Self::SendMessage {
            uid,
            token: Some(token.into()),
            content,
        }
    }

    pub fn broadcast(rid: RoomId, token: impl Into<String>, content: Value) -> Self {
        Self::Broadcast {
            rid,
            token: Some(token.into()),
            content,
        }
    }

    /// Identitaets-Token der Aktion
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { token, .. }
            | Self::SendMessage { token, .. }
            | Self::Broadcast { token, .. } => token.as_deref(),
        }
    }

    pub fn parsen(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    pub fn als_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Zustellungen
// ---------------------------------------------------------------------------

/// Zugestellte Nachricht (Fan-out oder Direktnachricht)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Benachrichtigung {
    /// Presence-Hinweis (Beitritt/Verlassen)
    Hinweis {
        #[serde(rename = "#notice")]
        notice: String,
        #[serde(rename = "#user_id")]
        user_id: IdentityId,
    },
    /// Broadcast an den Raum
    Nachricht {
        #[serde(rename = "#message")]
        message: Value,
        #[serde(rename = "#user_id")]
        user_id: IdentityId,
    },
    /// Direktnachricht
    Privat {
        #[serde(rename = "#private")]
        private: Value,
        #[serde(rename = "#user_id")]
        user_id: IdentityId,
    },
}

impl Benachrichtigung {
    /// `User "<id>" has joined the message group;<candidate>`
    pub fn beigetreten(user_id: IdentityId, candidate: &str) -> Self {
        Self::Hinweis {
            notice: format!("User \"{user_id}\" has joined the message group;{candidate}"),
            user_id,
        }
    }

    /// `User "<id>" has left the message group.`
    pub fn verlassen(user_id: IdentityId) -> Self {
        Self::Hinweis {
            notice: format!("User \"{user_id}\" has left the message group."),
            user_id,
        }
    }

    pub fn user_id(&self) -> &IdentityId {
        match self {
            Self::Hinweis { user_id, .. }
            | Self::Nachricht { user_id, .. }
            | Self::Privat { user_id, .. } => user_id,
        }
    }

    pub fn parsen(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    pub fn als_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Antworten
// ---------------------------------------------------------------------------

/// Stabile Fehlercodes fuer Ablehnungen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidToken,
    InvalidRequest,
    PreconditionFailed,
    RecipientNotConnected,
    InternalError,
}

impl ErrorCode {
    /// HTTP-artiger Status der Ablehnung
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidToken => 401,
            Self::InvalidRequest | Self::PreconditionFailed | Self::RecipientNotConnected => 400,
            Self::InternalError => 500,
        }
    }
}

/// Body einer Ablehnung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ablehnung {
    pub code: ErrorCode,
    pub message: String,
}

/// Antwort auf eine einzelne Anfrage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Antwort {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl Antwort {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: Value::String(text.into()),
        }
    }

    pub fn fehler(code: ErrorCode, message: impl Into<String>) -> Self {
        let ablehnung = Ablehnung {
            code,
            message: message.into(),
        };
        Self {
            status_code: code.status(),
            body: serde_json::json!({
                "code": ablehnung.code,
                "message": ablehnung.message,
            }),
        }
    }

    pub fn ist_ok(&self) -> bool {
        self.status_code == 200
    }

    /// Ablehnungs-Body, falls die Antwort einer ist
    pub fn ablehnung(&self) -> Option<Ablehnung> {
        if self.ist_ok() {
            return None;
        }
        serde_json::from_value(self.body.clone()).ok()
    }

    pub fn parsen(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    pub fn als_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_parsen() {
        let msg = SignalingMessage::parsen(
            r#"{"action":"joinRoom","rid":"R1","token":"alice","candidate":"203.0.113.5:54321"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::join(
                RoomId::from("R1"),
                "alice",
                Some("203.0.113.5:54321".into())
            )
        );
        assert_eq!(msg.token(), Some("alice"));
    }

    #[test]
    fn leave_ohne_rid() {
        let msg = SignalingMessage::parsen(r#"{"action":"joinRoom","token":"alice"}"#).unwrap();
        assert_eq!(msg, SignalingMessage::leave("alice"));
        assert_eq!(msg.als_json().unwrap(), r#"{"action":"joinRoom","token":"alice"}"#);
    }

    #[test]
    fn send_message_und_broadcast() {
        let send = SignalingMessage::parsen(
            r#"{"action":"sendMessage","uid":"bob","token":"alice","content":{"sdp":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(send, SignalingMessage::SendMessage { ref uid, .. } if uid.as_str() == "bob"));

        let bc = SignalingMessage::broadcast(RoomId::from("R1"), "alice", json!("hallo"));
        let text = bc.als_json().unwrap();
        assert!(text.contains(r#""action":"broadcast""#));
        assert_eq!(SignalingMessage::parsen(&text).unwrap(), bc);
    }

    #[test]
    fn unbekannte_aktion_ist_malformed() {
        let ergebnis = SignalingMessage::parsen(r#"{"action":"dance","rid":"R1"}"#);
        assert!(matches!(ergebnis, Err(ProtocolError::MalformedMessage(_))));
        assert!(SignalingMessage::parsen("kein json").is_err());
    }

    #[test]
    fn hinweis_texte() {
        let beitritt = Benachrichtigung::beigetreten(IdentityId::from("alice"), "1.2.3.4:5");
        assert_eq!(
            serde_json::to_value(&beitritt).unwrap(),
            json!({
                "#notice": "User \"alice\" has joined the message group;1.2.3.4:5",
                "#user_id": "alice",
            })
        );

        let austritt = Benachrichtigung::verlassen(IdentityId::from("alice"));
        assert_eq!(
            serde_json::to_value(&austritt).unwrap(),
            json!({
                "#notice": "User \"alice\" has left the message group.",
                "#user_id": "alice",
            })
        );
    }

    #[test]
    fn benachrichtigung_varianten_unterscheidbar() {
        let privat = Benachrichtigung::parsen(r##"{"#private":{"a":1},"#user_id":"bob"}"##).unwrap();
        assert!(matches!(privat, Benachrichtigung::Privat { .. }));
        let nachricht = Benachrichtigung::parsen(r##"{"#message":"hi","#user_id":"bob"}"##).unwrap();
        assert!(matches!(nachricht, Benachrichtigung::Nachricht { .. }));
        assert_eq!(nachricht.user_id().as_str(), "bob");
    }

    #[test]
    fn ablehnung_mit_code() {
        let antwort = Antwort::fehler(ErrorCode::InvalidToken, "Invalid token.");
        assert_eq!(antwort.status_code, 401);
        assert_eq!(
            serde_json::to_value(&antwort).unwrap(),
            json!({
                "statusCode": 401,
                "body": {"code": "INVALID_TOKEN", "message": "Invalid token."},
            })
        );
        let ablehnung = antwort.ablehnung().unwrap();
        assert_eq!(ablehnung.code, ErrorCode::InvalidToken);

        let ok = Antwort::ok("Connected.");
        assert!(ok.ist_ok());
        assert!(ok.ablehnung().is_none());
        assert_eq!(ErrorCode::InternalError.status(), 500);
        assert_eq!(ErrorCode::RecipientNotConnected.status(), 400);
    }
}
