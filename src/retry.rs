//! Retry combinator with exponential backoff for upstream I/O calls.
//!
//! Backoff doubles from `min` up to `cap` between attempts. An optional
//! per-attempt timeout turns a slow call into a retryable error. Dropping
//! the returned future cancels both the in-flight attempt and any sleeping
//! backoff.

use crate::error::{Result, TableRagError};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        (self.min * factor).min(self.max)
    }
}

/// Run `op` up to `attempts` times, each attempt bounded by `timeout`
/// (`None` = unlimited), sleeping `backoff.delay(n)` between failures.
///
/// `attempts` counts total tries, so `attempts = 1` means no retry.
pub async fn retry<T, F, Fut>(
    operation: &str,
    attempts: u32,
    timeout: Option<Duration>,
    backoff: Backoff,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err: Option<TableRagError> = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff.delay(attempt - 1)).await;
        }
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(res) => res,
                Err(_) => Err(TableRagError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => op().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    "{} attempt {}/{} failed: {}",
                    operation,
                    attempt + 1,
                    attempts,
                    e
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TableRagError::Internal {
        message: format!("{operation} failed without an error"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> Backoff {
        Backoff {
            min: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(1), Duration::from_secs(4));
        assert_eq!(b.delay(2), Duration::from_secs(8));
        assert_eq!(b.delay(3), Duration::from_secs(10));
        assert_eq!(b.delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let res = retry("test_op", 3, None, fast_backoff(), move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TableRagError::Embedding {
                        message: "transient".into(),
                    })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let res: Result<()> = retry("test_op", 2, None, fast_backoff(), || async {
            Err(TableRagError::Llm {
                message: "down".into(),
            })
        })
        .await;
        assert!(matches!(res, Err(TableRagError::Llm { .. })));
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let res = retry(
            "slow_op",
            2,
            Some(Duration::from_millis(5)),
            fast_backoff(),
            move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
