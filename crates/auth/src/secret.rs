//! Shared secret for the batch-processing trigger.
//!
//! This credential is distinct from end-user authentication: the trigger is
//! called by schedulers/ops tooling, not by users. Comparison is constant
//! time.

use subtle::ConstantTimeEq;

/// Minimum length for a production-grade trigger secret.
pub const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct ProcessingSecret(Vec<u8>);

impl ProcessingSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into().into_bytes())
    }

    /// Whether the secret is strong enough to protect a production trigger.
    pub fn is_production_grade(&self) -> bool {
        self.0.len() >= MIN_PRODUCTION_SECRET_LEN
    }

    /// Constant-time comparison against a presented credential.
    pub fn verify(&self, presented: &[u8]) -> bool {
        self.0.ct_eq(presented).into()
    }
}

// Never print the secret itself.
impl core::fmt::Debug for ProcessingSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessingSecret")
            .field("len", &self.0.len())
            .finish()
    }
}
