//! The credit gate (component C7).
//!
//! Wraps a [`CreditBackend`] with a free-tier allowlist, a preflight
//! balance check, and a transactional `settle` with exponential backoff and
//! jitter, retried only for backend errors the backend itself reports as
//! retryable. `settle` relies on the backend's own idempotency on
//! `operation_id` (property P-IDEMPOTENT-SETTLE); the gate never invents a
//! new id across retries of the same logical charge.

use std::collections::HashSet;
use std::time::Duration;

use tracing::warn;

use crate::error::{AgentError, Result};
use crate::ports::{Clock, CreditBackend, CreditBackendErrorCode};

/// Maximum number of attempts `settle` will make for one operation,
/// including the first.
const MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff: 1s, 2s, 4s, 8s, 16s before jitter.
const BASE_DELAY_MS: u64 = 1000;

/// Jitter applied to each backoff delay, as a fraction of the base delay.
const JITTER_FRACTION: f64 = 0.2;

/// Gates credit spend around each agent step.
pub struct CreditGate {
    backend: std::sync::Arc<dyn CreditBackend>,
    free_tier: HashSet<String>,
}

impl CreditGate {
    /// Build a gate over `backend`, exempting accounts in `free_tier` from
    /// the preflight balance check.
    #[must_use]
    pub fn new(backend: std::sync::Arc<dyn CreditBackend>, free_tier: HashSet<String>) -> Self {
        Self { backend, free_tier }
    }

    /// Check whether `user` may start another step. Free-tier accounts
    /// always pass; everyone else must have a strictly positive balance.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::OutOfCredits`] if the balance is non-positive,
    /// or propagates a non-retryable backend failure as
    /// [`AgentError::Internal`].
    pub async fn preflight(&self, user: &str) -> Result<()> {
        if self.free_tier.contains(user) {
            return Ok(());
        }
        let balance = self
            .backend
            .balance(user)
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        if balance.amount <= 0 {
            return Err(AgentError::OutOfCredits { balance: balance.amount });
        }
        Ok(())
    }

    /// Settle `amount` against `user` under `operation_id`, retrying
    /// retryable backend failures with capped exponential backoff and
    /// jitter.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Internal`] if the backend fails with a
    /// non-retryable error, or after [`MAX_ATTEMPTS`] retryable failures.
    pub async fn settle(&self, user: &str, amount: i64, operation_id: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.backend.settle(user, amount, operation_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.code.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt, err.code);
                    warn!(
                        attempt,
                        operation_id,
                        code = ?err.code,
                        delay_ms = delay.as_millis() as u64,
                        "credit settle failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(AgentError::Internal(format!(
                        "credit settle failed after {attempt} attempt(s): {err}"
                    )));
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32, _code: CreditBackendErrorCode) -> Duration {
    let base = BASE_DELAY_MS.saturating_mul(1u64 << (attempt - 1).min(4));
    let jitter_span = (base as f64 * JITTER_FRACTION) as i64;
    let jitter = fastrand::i64(-jitter_span..=jitter_span);
    let millis = (base as i64 + jitter).max(0) as u64;
    Duration::from_millis(millis)
}

/// Mint an idempotent operation id for one step's settlement, so retries of
/// the *same* step reuse the same id while distinct steps never collide.
#[must_use]
pub fn step_operation_id(run_id: &str, step_index: u32) -> String {
    format!("{run_id}:step:{step_index}")
}

/// An injected [`Clock`]-aware stopwatch used only for telemetry, kept here
/// since `CreditGate`'s own timing does not otherwise need a dependency on
/// `Clock`.
#[must_use]
pub fn elapsed_ms(clock: &dyn Clock, started_at: crate::ports::Timestamp) -> i64 {
    clock.now().0 - started_at.0
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::ports::{Balance, CreditBackendError};

    struct FlakyBackend {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CreditBackend for FlakyBackend {
        async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
            Ok(Balance { amount: 100 })
        }

        async fn settle(
            &self,
            _user: &str,
            _amount: i64,
            _operation_id: &str,
        ) -> std::result::Result<(), CreditBackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(CreditBackendError {
                    code: CreditBackendErrorCode::Deadlock,
                    message: "deadlock detected".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct AlwaysFailBackend;

    #[async_trait]
    impl CreditBackend for AlwaysFailBackend {
        async fn balance(&self, _user: &str) -> std::result::Result<Balance, CreditBackendError> {
            Ok(Balance { amount: 0 })
        }

        async fn settle(
            &self,
            _user: &str,
            _amount: i64,
            _operation_id: &str,
        ) -> std::result::Result<(), CreditBackendError> {
            Err(CreditBackendError {
                code: CreditBackendErrorCode::Other,
                message: "constraint violation".into(),
            })
        }
    }

    #[tokio::test]
    async fn preflight_rejects_non_positive_balance() {
        let gate = CreditGate::new(Arc::new(AlwaysFailBackend), HashSet::new());
        let err = gate.preflight("user_1").await.unwrap_err();
        assert!(matches!(err, AgentError::OutOfCredits { balance: 0 }));
    }

    #[tokio::test]
    async fn preflight_exempts_free_tier() {
        let gate = CreditGate::new(
            Arc::new(AlwaysFailBackend),
            HashSet::from(["user_1".to_owned()]),
        );
        assert!(gate.preflight("user_1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn settle_retries_retryable_failures_then_succeeds() {
        let gate = CreditGate::new(
            Arc::new(FlakyBackend {
                fail_times: 2,
                calls: AtomicU32::new(0),
            }),
            HashSet::new(),
        );
        let result = gate.settle("user_1", 10, "op_1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn settle_does_not_retry_non_retryable_failures() {
        let gate = CreditGate::new(Arc::new(AlwaysFailBackend), HashSet::new());
        let result = gate.settle("user_1", 10, "op_1").await;
        assert!(result.is_err());
    }

    #[test]
    fn step_operation_id_is_stable_per_step() {
        assert_eq!(step_operation_id("run_1", 3), step_operation_id("run_1", 3));
        assert_ne!(step_operation_id("run_1", 3), step_operation_id("run_1", 4));
    }
}
