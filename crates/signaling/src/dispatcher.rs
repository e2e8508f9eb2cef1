//! Action-Dispatcher – Routet Signaling-Nachrichten
//!
//! Jede eingehende Nachricht ist genau eine der Aktionen `joinRoom`,
//! `sendMessage` oder `broadcast`. Der Dispatcher beantwortet jede Anfrage
//! mit einer [`Antwort`]; Fehler werden nie an den Verbindungs-Task
//! durchgereicht sondern als Ablehnung mit stabilem Code zurueckgegeben.

use treffpunkt_core::{ConnectionId, IdentityId, RoomId};
use treffpunkt_protocol::{Antwort, Benachrichtigung, ErrorCode, SignalingMessage};

use crate::auth::TokenVerifier;
use crate::broadcast::Zusteller;
use crate::error::{SignalingError, SignalingResult};
use crate::fanout::FanoutJob;
use crate::presence::{PresenceEngine, RaumWechsel};
use crate::queue::JobQueue;
use crate::store::PresenceStore;

/// Zentraler Dispatcher fuer Signaling-Aktionen
pub struct Dispatcher<S, V, Z, Q> {
    presence: PresenceEngine<S, V>,
    zusteller: Z,
    fanout: Q,
}

impl<S, V, Z, Q> Dispatcher<S, V, Z, Q>
where
    S: PresenceStore,
    V: TokenVerifier,
    Z: Zusteller,
    Q: JobQueue<FanoutJob>,
{
    pub fn neu(presence: PresenceEngine<S, V>, zusteller: Z, fanout: Q) -> Self {
        Self {
            presence,
            zusteller,
            fanout,
        }
    }

    pub fn presence(&self) -> &PresenceEngine<S, V> {
        &self.presence
    }

    pub fn zusteller(&self) -> &Z {
        &self.zusteller
    }

    /// Verarbeitet den Text eines Frames und liefert die Antwort
    pub async fn verarbeiten(&self, connection_id: &ConnectionId, text: &str) -> Antwort {
        let nachricht = match SignalingMessage::parsen(text) {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, fehler = %e, "Ungueltige Nachricht");
                return SignalingError::from(e).als_antwort();
            }
        };

        let ergebnis = match nachricht {
            SignalingMessage::JoinRoom {
                rid,
                token,
                candidate,
            } => {
                self.raum_beitreten(connection_id, token.as_deref(), rid, candidate)
                    .await
            }
            SignalingMessage::SendMessage {
                uid,
                token,
                content,
            } => {
                self.nachricht_senden(connection_id, token.as_deref(), uid, content)
                    .await
            }
            SignalingMessage::Broadcast {
                rid,
                token,
                content,
            } => {
                self.rundsenden(connection_id, token.as_deref(), rid, content)
                    .await
            }
        };

        ergebnis.unwrap_or_else(|e| {
            match e.error_code() {
                ErrorCode::InternalError => {
                    tracing::error!(connection_id = %connection_id, fehler = %e, "Aktion fehlgeschlagen");
                }
                _ => {
                    tracing::debug!(connection_id = %connection_id, fehler = %e, "Aktion abgelehnt");
                }
            }
            e.als_antwort()
        })
    }

    async fn raum_beitreten(
        &self,
        connection_id: &ConnectionId,
        token: Option<&str>,
        rid: Option<RoomId>,
        kandidat: Option<String>,
    ) -> SignalingResult<Antwort> {
        match self
            .presence
            .raum_setzen(connection_id, token, rid, kandidat)
            .await?
        {
            RaumWechsel::Beigetreten {
                identitaet,
                raum,
                kandidat,
            } => {
                let hinweis = Benachrichtigung::beigetreten(identitaet.identity_id, &kandidat);
                self.fanout
                    .einreihen(FanoutJob::neu(
                        identitaet.namespace,
                        raum.clone(),
                        Some(connection_id.clone()),
                        hinweis,
                    ))
                    .await?;
                Ok(Antwort::ok(format!("Joined message group: \"{raum}\".")))
            }
            RaumWechsel::Verlassen { .. } => Ok(Antwort::ok("User has left the message group.")),
        }
    }

    /// Direktnachricht an die erste offene Connection einer Identitaet
    ///
    /// Die Nachricht geht zusaetzlich als Echo an den Absender zurueck.
    async fn nachricht_senden(
        &self,
        connection_id: &ConnectionId,
        token: Option<&str>,
        empfaenger: IdentityId,
        inhalt: serde_json::Value,
    ) -> SignalingResult<Antwort> {
        let identitaet = self.presence.identitaet(token).await?;
        let ziel = self
            .presence
            .store()
            .connections_der_identitaet(&identitaet.namespace, &empfaenger, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(SignalingError::RecipientNotConnected)?;

        let nachricht = Benachrichtigung::Privat {
            private: inhalt,
            user_id: identitaet.identity_id,
        }
        .als_json()?;

        match self.zusteller.zustellen(&ziel.connection_id, &nachricht).await {
            Ok(()) => {}
            Err(SignalingError::RecipientGone(_)) => {
                return Err(SignalingError::RecipientNotConnected);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.zusteller.zustellen(connection_id, &nachricht).await {
            tracing::debug!(connection_id = %connection_id, fehler = %e, "Echo an Absender fehlgeschlagen");
        }

        Ok(Antwort::ok(format!("Sent message to {empfaenger}.")))
    }

    async fn rundsenden(
        &self,
        connection_id: &ConnectionId,
        token: Option<&str>,
        raum: RoomId,
        inhalt: serde_json::Value,
    ) -> SignalingResult<Antwort> {
        let identitaet = self.presence.identitaet(token).await?;
        if raum.ist_leer() {
            return Err(SignalingError::UngueltigeAnfrage("Raum-ID fehlt".into()));
        }

        let job = FanoutJob::neu(
            identitaet.namespace,
            raum,
            Some(connection_id.clone()),
            Benachrichtigung::Nachricht {
                message: inhalt,
                user_id: identitaet.identity_id,
            },
        );
        self.fanout.einreihen(job).await?;
        Ok(Antwort::ok("Broadcasted message to users."))
    }
}
