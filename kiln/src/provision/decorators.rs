//! Wrappers adding pause, timeout and retry behaviour to a provisioner.
//!
//! [`decorate`] applies them in a fixed order: a pause *or* a timeout
//! (pause wins when both are set), then retries around the result.

use crate::cancellation::CancellationToken;
use crate::config::ProvisionerBlock;
use crate::errors::BuildError;
use crate::plugin::{Provisioner, Variables};
use crate::retry::RetryPolicy;
use crate::ui::Ui;
use crate::utils::format_duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Wraps `provisioner` according to the block's `pause_before`, `timeout`
/// and `max_retries` settings.
#[must_use]
pub fn decorate(provisioner: Box<dyn Provisioner>, block: &ProvisionerBlock) -> Box<dyn Provisioner> {
    let mut decorated = provisioner;
    if let Some(pause) = block.pause_before.filter(|d| !d.is_zero()) {
        decorated = Box::new(PausedProvisioner::new(pause, decorated));
    } else if let Some(timeout) = block.timeout.filter(|d| !d.is_zero()) {
        decorated = Box::new(TimeoutProvisioner::new(timeout, decorated));
    }
    if block.max_retries > 0 {
        decorated = Box::new(RetriedProvisioner::new(block.max_retries, decorated));
    }
    decorated
}

/// Sleeps before running the wrapped provisioner.
pub struct PausedProvisioner {
    pause: Duration,
    inner: Box<dyn Provisioner>,
}

impl PausedProvisioner {
    /// Pauses for `pause` before each run of `inner`.
    #[must_use]
    pub fn new(pause: Duration, inner: Box<dyn Provisioner>) -> Self {
        Self { pause, inner }
    }
}

#[async_trait]
impl Provisioner for PausedProvisioner {
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<()> {
        self.inner.prepare(vars, config)
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()> {
        ui.say(&format!(
            "Pausing {} before the next provisioner...",
            format_duration(self.pause)
        ));
        tokio::select! {
            () = cancel.cancelled() => return Err(BuildError::Cancelled.into()),
            () = tokio::time::sleep(self.pause) => {}
        }
        self.inner.provision(cancel, ui, data).await
    }
}

/// Fails the wrapped provisioner if it runs longer than a deadline.
pub struct TimeoutProvisioner {
    timeout: Duration,
    inner: Box<dyn Provisioner>,
}

impl TimeoutProvisioner {
    /// Bounds each run of `inner` by `timeout`.
    #[must_use]
    pub fn new(timeout: Duration, inner: Box<dyn Provisioner>) -> Self {
        Self { timeout, inner }
    }
}

#[async_trait]
impl Provisioner for TimeoutProvisioner {
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<()> {
        self.inner.prepare(vars, config)
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()> {
        match tokio::time::timeout(self.timeout, self.inner.provision(cancel, ui, data)).await {
            Ok(result) => result,
            Err(_) => {
                let limit = format_duration(self.timeout);
                ui.error(&format!("Provisioner timeout: {limit}"));
                Err(anyhow::anyhow!("provisioner timed out after {limit}"))
            }
        }
    }
}

/// Re-runs the wrapped provisioner after failures.
pub struct RetriedProvisioner {
    max_retries: u32,
    inner: Box<dyn Provisioner>,
}

impl RetriedProvisioner {
    /// Allows `max_retries` extra runs of `inner`.
    #[must_use]
    pub fn new(max_retries: u32, inner: Box<dyn Provisioner>) -> Self {
        Self { max_retries, inner }
    }
}

#[async_trait]
impl Provisioner for RetriedProvisioner {
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<()> {
        self.inner.prepare(vars, config)
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled.into());
        }

        let inner = self.inner.as_ref();
        let max_retries = self.max_retries;
        let attempts = AtomicU32::new(0);
        let last_error: Mutex<Option<String>> = Mutex::new(None);
        let mut policy = RetryPolicy::new()
            .with_tries(max_retries.saturating_add(1))
            .with_delay(Duration::ZERO);

        let result = policy
            .run(cancel, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt > 0 {
                    let last = last_error.lock().clone().unwrap_or_default();
                    ui.say(&format!(
                        "Provisioner failed with {last:?}, retrying with {} trie(s) left",
                        max_retries + 1 - attempt
                    ));
                }
                let last_error = &last_error;
                async move {
                    let result = inner.provision(cancel, ui, data).await;
                    if let Err(e) = &result {
                        debug!(attempt, error = %e, "Provisioner attempt failed");
                        *last_error.lock() = Some(e.to_string());
                    }
                    result
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_exhausted() => {
                ui.say("retry limit reached.");
                Err(anyhow::Error::new(err))
            }
            Err(err) => Err(err.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectingUi, MockProvisioner};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retried_succeeds_within_budget() {
        let mock = MockProvisioner::new().failing_times(2);
        let calls = mock.calls();
        let provisioner = RetriedProvisioner::new(2, Box::new(mock));
        let ui = CollectingUi::new();

        provisioner
            .provision(&CancellationToken::new(), &ui, &Variables::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let said = ui.said();
        assert_eq!(said.len(), 2);
        assert!(said[0].ends_with("retrying with 2 trie(s) left"));
        assert!(said[1].ends_with("retrying with 1 trie(s) left"));
    }

    #[tokio::test]
    async fn test_retried_exhausts() {
        let mock = MockProvisioner::new().failing_times(10);
        let calls = mock.calls();
        let provisioner = RetriedProvisioner::new(1, Box::new(mock));
        let ui = CollectingUi::new();

        let err = provisioner
            .provision(&CancellationToken::new(), &ui, &Variables::new())
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().starts_with("retry count exhausted after 2 attempt(s)"));
        assert_eq!(ui.said().last().map(String::as_str), Some("retry limit reached."));
    }

    #[tokio::test]
    async fn test_timeout_fails_slow_provisioner() {
        let mock = MockProvisioner::new().with_delay(Duration::from_secs(5));
        let provisioner = TimeoutProvisioner::new(Duration::from_millis(20), Box::new(mock));
        let ui = CollectingUi::new();

        let err = provisioner
            .provision(&CancellationToken::new(), &ui, &Variables::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "provisioner timed out after 20ms");
        assert_eq!(ui.errors(), vec!["Provisioner timeout: 20ms".to_string()]);
    }

    #[tokio::test]
    async fn test_pause_interrupted_by_cancel() {
        let mock = MockProvisioner::new();
        let calls = mock.calls();
        let provisioner = PausedProvisioner::new(Duration::from_secs(3600), Box::new(mock));
        let token = Arc::new(CancellationToken::new());
        let ui = CollectingUi::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel("interrupt");
            })
        };
        let result = provisioner.provision(&token, &ui, &Variables::new()).await;
        canceller.await.unwrap();

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ui.said(), vec!["Pausing 1h before the next provisioner...".to_string()]);
    }

    #[tokio::test]
    async fn test_decorate_pause_then_retry() {
        let block = ProvisionerBlock::new("shell", crate::config::Body::new())
            .with_pause_before(Duration::from_millis(1))
            .with_timeout(Duration::from_secs(60))
            .with_max_retries(1);
        let mock = MockProvisioner::new().failing_times(1);
        let calls = mock.calls();
        let decorated = decorate(Box::new(mock), &block);
        let ui = CollectingUi::new();

        decorated
            .provision(&CancellationToken::new(), &ui, &Variables::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let pauses = ui.said().iter().filter(|l| l.starts_with("Pausing")).count();
        assert_eq!(pauses, 2);
    }
}
