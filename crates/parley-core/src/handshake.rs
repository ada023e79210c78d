//! Connection handshake.
//!
//! Clients authenticate elsewhere and exchange their credentials for a
//! single-use code. Opening the chat connection requires that code together
//! with the username it was issued to.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Default lifetime of an issued code.
pub const DEFAULT_OTP_TTL: Duration = Duration::from_secs(60);

/// Handshake errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing one-time code or username")]
    MissingCredentials,

    #[error("Invalid or expired one-time code")]
    InvalidCode,

    #[error("Unknown user: {0}")]
    UnknownUser(String),
}

/// Checks one-time codes presented at connection time.
#[async_trait]
pub trait OtpVerifier: Send + Sync {
    /// Verify and consume a code.
    async fn verify(&self, otp: &str, username: &str) -> Result<(), AuthError>;
}

#[derive(Debug)]
struct IssuedCode {
    username: String,
    expires: Instant,
}

/// In-process code issuer and verifier.
#[derive(Debug)]
pub struct MemoryOtpStore {
    codes: DashMap<String, IssuedCode>,
    ttl: Duration,
}

impl MemoryOtpStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh code for a user.
    #[must_use]
    pub fn issue(&self, username: &str) -> String {
        let code = Uuid::new_v4().simple().to_string();
        self.codes.insert(
            code.clone(),
            IssuedCode {
                username: username.to_string(),
                expires: Instant::now() + self.ttl,
            },
        );
        debug!(user = %username, "Issued one-time code");
        code
    }

    /// Number of codes neither used nor pruned.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.codes.len()
    }

    /// Drop codes whose lifetime has passed. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.codes.len();
        self.codes.retain(|_, issued| issued.expires > now);
        before.saturating_sub(self.codes.len())
    }
}

impl Default for MemoryOtpStore {
    fn default() -> Self {
        Self::new(DEFAULT_OTP_TTL)
    }
}

#[async_trait]
impl OtpVerifier for MemoryOtpStore {
    async fn verify(&self, otp: &str, username: &str) -> Result<(), AuthError> {
        if otp.is_empty() || username.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        // Codes are consumed even when presented with the wrong username.
        let (_, issued) = self.codes.remove(otp).ok_or(AuthError::InvalidCode)?;
        if issued.username != username || issued.expires <= Instant::now() {
            return Err(AuthError::InvalidCode);
        }
        Ok(())
    }
}
