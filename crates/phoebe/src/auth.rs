//! Write authorization.
//!
//! A write is accepted when its token is in the union of the global and
//! per-space token sets, or when a registered extension accepts the
//! client-certificate fingerprint. Tokens are compared as opaque bytes.

use crate::config::{Config, SpaceConfig};
use crate::error::ServerError;
use crate::ext::Registry;

/// Check a Titan write against the effective token set and the
/// fingerprint authorizers.
pub fn authorize_write(
    config: &Config,
    registry: &Registry,
    space: &SpaceConfig,
    token: &str,
    fingerprint: Option<&str>,
) -> Result<(), ServerError> {
    if !token.is_empty()
        && config
            .tokens_for_space(space)
            .any(|t| t.as_bytes() == token.as_bytes())
    {
        return Ok(());
    }
    if let Some(fingerprint) = fingerprint {
        if registry.authorize_fingerprint(space.name.as_str(), fingerprint) {
            return Ok(());
        }
    }
    // With authorizers configured and no token offered, steer certificate
    // clients to the certificate statuses instead of the token error.
    if token.is_empty() && registry.wants_client_certs() {
        return Err(match fingerprint {
            None => ServerError::CertificateRequired,
            Some(_) => ServerError::CertificateNotAuthorized,
        });
    }
    Err(ServerError::WrongToken)
}
