//! Waiting for remote resources to settle
//!
//! Bedrock agents, aliases, knowledge bases and Lambda functions all report a
//! status string. [`poll_until`] re-fetches it on an interval and gives up with
//! [`KitError::TimeoutError`] once the deadline passes.

use crate::error::KitError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Status reported for an agent-like resource, or its absence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Present(String),
    Deleted,
}

impl ResourceStatus {
    /// Fold a describe call into a status: not-found means the resource is gone
    pub fn from_lookup(result: Result<String>) -> Result<Self> {
        match result {
            Ok(status) => Ok(Self::Present(status)),
            Err(e) if e.is_not_found() => Ok(Self::Deleted),
            Err(e) => Err(e),
        }
    }

    /// `CREATING`, `PREPARING`, `UPDATING`, `DELETING`, `VERSIONING` and the like
    pub fn is_transitional(&self) -> bool {
        match self {
            Self::Present(status) => status.to_ascii_uppercase().ends_with("ING"),
            Self::Deleted => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Present(status) => status,
            Self::Deleted => "DELETED",
        }
    }
}

/// Call `fetch` every `interval` until it returns [`Poll::Ready`]
///
/// Throttling and network errors count as a pending check; any other error
/// ends the wait immediately.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut fetch: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match fetch().await {
            Ok(Poll::Ready(value)) => {
                debug!(what, attempt, elapsed_ms = started.elapsed().as_millis() as u64, "Wait finished");
                return Ok(value);
            }
            Ok(Poll::Pending) => {}
            Err(err) if err.is_retryable() => warn!(what, attempt, error = %err, "Status check failed, retrying"),
            Err(err) => return Err(err),
        }

        let elapsed = started.elapsed();
        if elapsed + interval > timeout {
            return Err(KitError::timeout(what, elapsed.as_millis() as u64));
        }

        debug!(what, attempt, "Still waiting");
        tokio::time::sleep(interval).await;
    }
}

/// Wait until a status leaves its transitional `*ING` state
///
/// Returns the final status; [`ResourceStatus::Deleted`] when the lookup
/// reports the resource as missing.
pub async fn wait_for_stable_status<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut lookup: F,
) -> Result<ResourceStatus>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    poll_until(what, interval, timeout, || {
        let fut = lookup();
        async move {
            let status = ResourceStatus::from_lookup(fut.await)?;
            debug!(what, status = status.as_str(), "Status check");
            Ok(if status.is_transitional() {
                Poll::Pending
            } else {
                Poll::Ready(status)
            })
        }
    })
    .await
}

/// Wait until a lookup reports the resource as not found
pub async fn wait_for_deletion<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut lookup: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    poll_until(what, interval, timeout, || {
        let fut = lookup();
        async move {
            Ok(match ResourceStatus::from_lookup(fut.await)? {
                ResourceStatus::Deleted => Poll::Ready(()),
                ResourceStatus::Present(_) => Poll::Pending,
            })
        }
    })
    .await
}

/// Fixed delay for changes that expose no status (IAM propagation and the like)
pub async fn settle(duration: Duration, reason: &str) {
    if duration.is_zero() {
        return;
    }
    info!(seconds = duration.as_secs(), "Waiting for {}", reason);
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_transitional_statuses() {
        for status in ["CREATING", "PREPARING", "UPDATING", "DELETING", "VERSIONING"] {
            assert!(ResourceStatus::Present(status.to_string()).is_transitional());
        }
        for status in ["PREPARED", "NOT_PREPARED", "FAILED", "Available"] {
            let s = ResourceStatus::Present(status.to_string());
            assert!(!s.is_transitional(), "{} should be stable", status);
        }
        assert!(!ResourceStatus::Deleted.is_transitional());
    }

    #[test]
    fn test_not_found_counts_as_deleted() {
        let status =
            ResourceStatus::from_lookup(Err(KitError::resource_not_found("agent gone"))).unwrap();
        assert_eq!(status, ResourceStatus::Deleted);
        assert_eq!(status.as_str(), "DELETED");

        let err = ResourceStatus::from_lookup(Err(KitError::invalid_input("bad id")));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_stable_status_follows_transitions() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let status = wait_for_stable_status(
            "agent",
            Duration::from_millis(5),
            Duration::from_secs(5),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(match n {
                        0 => "CREATING".to_string(),
                        1 => "PREPARING".to_string(),
                        _ => "PREPARED".to_string(),
                    })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(status, ResourceStatus::Present("PREPARED".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let result: Result<()> = poll_until(
            "alias",
            Duration::from_millis(10),
            Duration::from_millis(40),
            || async { Ok(Poll::Pending) },
        )
        .await;

        match result {
            Err(KitError::TimeoutError { what, .. }) => assert_eq!(what, "alias"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_deletion_stops_on_not_found() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        wait_for_deletion("agent", Duration::from_millis(5), Duration::from_secs(5), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok("DELETING".to_string())
                } else {
                    Err(KitError::resource_not_found("gone"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_throttled_checks_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let status = wait_for_stable_status("knowledge base", Duration::from_millis(5), Duration::from_secs(5), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(KitError::from_service_code(Some("ThrottlingException"), "Rate exceeded")),
                    1 => Err(KitError::network_error("connection reset")),
                    _ => Ok("ACTIVE".to_string()),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(status, ResourceStatus::Present("ACTIVE".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_error_stops_polling() {
        let result: Result<()> = poll_until(
            "function",
            Duration::from_millis(5),
            Duration::from_secs(5),
            || async { Err(KitError::AccessDenied { message: "no".into() }) },
        )
        .await;
        assert!(matches!(result, Err(KitError::AccessDenied { .. })));
    }
}
