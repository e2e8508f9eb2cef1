//! Identitaets-Tokens
//!
//! Tokens werden von einem externen Dienst ausgestellt und hier nur auf
//! eine Identitaet abgebildet. Die Ausstellung selbst gehoert nicht zu
//! diesem Crate.

use treffpunkt_core::{IdentityId, ServiceNamespace};

use crate::error::{SignalingError, SignalingResult};

/// Verifizierte Identitaet eines Peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identitaet {
    pub identity_id: IdentityId,
    pub namespace: ServiceNamespace,
}

/// Bildet ein Token auf eine Identitaet ab
#[allow(async_fn_in_trait)]
pub trait TokenVerifier: Send + Sync {
    /// `InvalidToken` bei fehlendem, leerem oder ungueltigem Token
    async fn pruefen(&self, token: Option<&str>) -> SignalingResult<Identitaet>;
}

/// Behandelt das Token als bereits verifizierte, opake Identitaet
///
/// Fuer Deployments hinter einem Gateway das die Tokens schon geprueft hat.
#[derive(Debug, Clone)]
pub struct OpakerTokenVerifier {
    namespace: ServiceNamespace,
}

impl OpakerTokenVerifier {
    pub fn neu(namespace: ServiceNamespace) -> Self {
        Self { namespace }
    }
}

impl TokenVerifier for OpakerTokenVerifier {
    async fn pruefen(&self, token: Option<&str>) -> SignalingResult<Identitaet> {
        let token = token.map(str::trim).unwrap_or("");
        if token.is_empty() || token.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(SignalingError::InvalidToken);
        }
        Ok(Identitaet {
            identity_id: IdentityId::from(token),
            namespace: self.namespace.clone(),
        })
    }
}
