/// Polling utilities for waiting on conditions
use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Configuration for polling operations
///
/// Polls on a fixed interval with no backoff. Without `max_attempts` or
/// `timeout` the loop is unbounded.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub subject: String,
}

impl PollingConfig {
    /// Create an unbounded polling configuration
    pub fn new(interval: Duration, subject: impl Into<String>) -> Self {
        Self {
            interval,
            max_attempts: None,
            timeout: None,
            subject: subject.into(),
        }
    }

    /// Give up after this many checks
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Give up once this much time has passed
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until condition is met or the policy runs out
    ///
    /// The condition function should return:
    /// - Ok(Some(T)) when condition is met (returns T)
    /// - Ok(None) when condition is not yet met (continues polling)
    /// - Err(e) when an error occurs (stops polling and returns error)
    pub async fn poll<F, Fut, T>(&self, condition: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        info!("Waiting for {}...", self.subject);

        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(value) = condition().await? {
                info!("✓ {} (after {} checks)", self.subject, attempts);
                return Ok(value);
            }
            debug!("{} not ready yet (check {})", self.subject, attempts);

            if let Some(max) = self.max_attempts {
                if attempts >= max {
                    return Err(ProvisionError::PollExhausted {
                        resource: self.subject.clone(),
                        attempts,
                    }
                    .into());
                }
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    return Err(ProvisionError::PollTimeout {
                        resource: self.subject.clone(),
                        seconds: timeout.as_secs(),
                    }
                    .into());
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll until condition returns Ok(true)
    pub async fn poll_until<F, Fut>(&self, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(|| async {
            match condition().await {
                Ok(true) => Ok(Some(())),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_polling_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = PollingConfig::new(Duration::ZERO, "test polling");

        let result = config
            .poll(|| {
                let c = counter_clone.clone();
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    if val >= 2 {
                        Ok(Some(val))
                    } else {
                        Ok(None)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_polling_exhausts_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config =
            PollingConfig::new(Duration::ZERO, "test exhaustion").with_max_attempts(Some(5));

        let err = config
            .poll_until(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::PollExhausted { attempts, .. }) => assert_eq!(*attempts, 5),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_polling_timeout() {
        let config = PollingConfig::new(Duration::from_millis(10), "test timeout")
            .with_timeout(Some(Duration::from_millis(30)));

        let result = config
            .poll(|| async { Ok::<Option<()>, anyhow::Error>(None) })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::PollTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_polling_stops_on_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = PollingConfig::new(Duration::ZERO, "test error");

        let result = config
            .poll_until(|| {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(anyhow::anyhow!("cluster unreachable"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = PollingConfig::new(Duration::ZERO, "test poll_until");

        let result = config
            .poll_until(|| {
                let c = counter_clone.clone();
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    Ok(val >= 2)
                }
            })
            .await;

        assert!(result.is_ok());
    }
}
