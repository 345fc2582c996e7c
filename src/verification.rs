//! One-time email verification codes required for registration.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::store::{Store, StoreError};

/// How long a code stays valid.
pub const CODE_TTL: Duration = Duration::from_secs(10 * 60);

fn key(email: &str) -> String {
    format!("verify:{}", email)
}

/// Delivers verification codes to their recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), String>;
}

/// Writes codes to the log instead of sending mail.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), String> {
        info!(email = %email, code = %code, "Verification code issued");
        Ok(())
    }
}

#[derive(Clone)]
pub struct VerificationCodes {
    store: Arc<dyn Store>,
}

impl VerificationCodes {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Generate a six-digit code for `email`, replacing any earlier one.
    pub async fn issue(&self, email: &str) -> Result<String, StoreError> {
        let code = format!("{:06}", rand::rng().random_range(0..1_000_000u32));
        self.store.set(&key(email), &code, CODE_TTL).await?;
        Ok(code)
    }

    /// Check `code` and burn it. A code can be consumed at most once.
    pub async fn consume(&self, email: &str, code: &str) -> Result<bool, StoreError> {
        match self.store.get(&key(email)).await? {
            Some(stored) if stored == code => self.store.delete(&key(email)).await,
            _ => Ok(false),
        }
    }
}
