//! Credential monitor (component J): a pluggable token provider plus the
//! deadline bookkeeping the connection manager needs to trigger a soft
//! reset before a credential expires.
//!
//! Grounded on the token-provider field on `io_mqtt_connection_t` and the
//! expiry check at the top of `io_mqtt_connection_monitor` in the
//! original implementation; the trait shape mirrors
//! `io_token_provider_new_token`/`io_token_provider_get_property`
//! referenced (not reproduced) from `original_source/inc/prx_client.h`.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::ErrorKind;

/// Supplies short-lived credentials (e.g. a SAS token) for authenticating
/// the MQTT CONNECT. Implementations decide their own refresh policy; the
/// connection manager only needs to know the token and how long it's
/// valid for.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A stable identifier presented as the CONNECT username, analogous to
    /// `io_token_property_policy`.
    fn policy_name(&self) -> &str;

    /// Mint a fresh token, returning it along with how long it remains
    /// valid for.
    async fn token(&self) -> Result<(String, Duration), ErrorKind>;
}

/// Tracks when the current credential expires so the monitor can schedule
/// a soft reset ahead of time, rather than waiting for the broker to
/// reject traffic.
#[derive(Debug, Clone, Copy)]
pub struct CredentialExpiry {
    deadline: Option<Instant>,
}

impl CredentialExpiry {
    pub fn none() -> Self {
        Self { deadline: None }
    }

    pub fn set(&mut self, ttl: Duration) {
        self.deadline = Some(Instant::now() + ttl);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Whether the credential has already expired as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Default for CredentialExpiry {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_ttl_elapses() {
        let mut expiry = CredentialExpiry::none();
        assert!(!expiry.is_expired(Instant::now()));

        expiry.set(Duration::from_millis(0));
        assert!(expiry.is_expired(Instant::now() + Duration::from_millis(1)));
    }

    #[test]
    fn clear_removes_deadline() {
        let mut expiry = CredentialExpiry::none();
        expiry.set(Duration::from_secs(60));
        expiry.clear();
        assert!(expiry.deadline().is_none());
    }
}
