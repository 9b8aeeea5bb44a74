//! Bounded retry for optimistic (guarded) updates.

use std::future::Future;

use cairn_core::{Error, ErrorCode, Result};
use tracing::{trace, warn};

/// How many times an optimistic update is retried before giving up.
pub const MAX_GUARDED_ATTEMPTS: u32 = 100;

/// Runs an optimistic read-modify-write transaction until it sticks.
///
/// The operation is expected to read current state, compute an update and
/// apply it with a version guard; a lost race surfaces as `Canceled` and the
/// operation is re-run against fresh state. After
/// [`MAX_GUARDED_ATTEMPTS`] consecutive cancellations the loop escalates to
/// `Io`: at that point the object is churning faster than we can follow.
///
/// Any other error, including `Again` (the operation should re-resolve
/// state itself), is returned as-is.
pub async fn retry_guarded<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=MAX_GUARDED_ATTEMPTS {
        match op().await {
            Err(e) if e.is(ErrorCode::Canceled) => {
                trace!(attempt, "optimistic update raced, retrying");
            }
            other => return other,
        }
    }
    warn!(attempts = MAX_GUARDED_ATTEMPTS, "optimistic update exhausted retries");
    Err(Error::new(
        ErrorCode::Io,
        format!("optimistic update failed after {MAX_GUARDED_ATTEMPTS} attempts"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_succeeds_after_races() {
        let attempts = AtomicU32::new(0);
        let result = retry_guarded(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(Error::new(ErrorCode::Canceled, "raced"))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_escalates_to_io() {
        let attempts = AtomicU32::new(0);
        let err = retry_guarded::<(), _, _>(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorCode::Canceled, "raced"))
        })
        .await
        .unwrap_err();

        assert!(err.is(ErrorCode::Io));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_GUARDED_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let err = retry_guarded::<(), _, _>(|| async {
            Err(Error::new(ErrorCode::Busy, "locked"))
        })
        .await
        .unwrap_err();
        assert!(err.is(ErrorCode::Busy));
    }
}
