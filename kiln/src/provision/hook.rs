//! The provision hook fired by builders.

use crate::cancellation::CancellationToken;
use crate::plugin::{Hook, Provisioner, Variables, HOOK_PROVISION};
use crate::ui::Ui;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

/// A started, prepared and decorated provisioner of one job.
pub struct HookedProvisioner {
    /// Plugin type.
    pub ptype: String,
    /// Optional display name.
    pub pname: Option<String>,
    /// The provisioner, already wrapped by [`decorate`](super::decorate).
    pub provisioner: Box<dyn Provisioner>,
    /// Evaluated configuration it was prepared with.
    pub config: Value,
}

impl HookedProvisioner {
    /// Name shown in output.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pname.as_deref().unwrap_or(&self.ptype)
    }
}

impl std::fmt::Debug for HookedProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedProvisioner")
            .field("ptype", &self.ptype)
            .field("pname", &self.pname)
            .finish_non_exhaustive()
    }
}

/// Runs a job's provisioners in order when the builder fires
/// [`HOOK_PROVISION`].
///
/// The first failure stops the chain. If an error-cleanup provisioner is
/// configured it runs before the failure is returned.
pub struct ProvisionHook<'a> {
    provisioners: &'a [HookedProvisioner],
    cleanup: Option<&'a HookedProvisioner>,
}

impl<'a> ProvisionHook<'a> {
    /// Creates a hook over `provisioners`.
    #[must_use]
    pub fn new(provisioners: &'a [HookedProvisioner], cleanup: Option<&'a HookedProvisioner>) -> Self {
        Self {
            provisioners,
            cleanup,
        }
    }

    async fn run_cleanup(&self, cancel: &CancellationToken, ui: &dyn Ui, data: &Variables) {
        let Some(cleanup) = self.cleanup else {
            return;
        };
        ui.say("Provisioning step had errors: Running the cleanup provisioner, if present...");
        if let Err(e) = cleanup.provisioner.provision(cancel, ui, data).await {
            warn!(provisioner = cleanup.display_name(), error = %e, "Cleanup provisioner failed");
            ui.error(&format!("Error running cleanup provisioner: {e}"));
        }
    }
}

#[async_trait]
impl Hook for ProvisionHook<'_> {
    async fn run(
        &self,
        name: &str,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()> {
        if name != HOOK_PROVISION {
            debug!(hook = name, "Ignoring unknown hook");
            return Ok(());
        }

        for hooked in self.provisioners {
            info!(provisioner = hooked.display_name(), "Running provisioner");
            if let Err(e) = hooked.provisioner.provision(cancel, ui, data).await {
                self.run_cleanup(cancel, ui, data).await;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectingUi, MockProvisioner};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn hooked(ptype: &str, provisioner: MockProvisioner) -> HookedProvisioner {
        HookedProvisioner {
            ptype: ptype.to_string(),
            pname: None,
            provisioner: Box::new(provisioner),
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn test_runs_in_order_and_stops_at_first_error() {
        let first = MockProvisioner::new();
        let failing = MockProvisioner::new().failing_times(1);
        let never = MockProvisioner::new();
        let (c1, c2, c3) = (first.calls(), failing.calls(), never.calls());
        let provisioners = vec![
            hooked("shell", first),
            hooked("file", failing),
            hooked("shell", never),
        ];
        let hook = ProvisionHook::new(&provisioners, None);
        let ui = CollectingUi::new();

        let result = hook
            .run(HOOK_PROVISION, &CancellationToken::new(), &ui, &Variables::new())
            .await;

        assert!(result.is_err());
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(c3.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_runs_only_on_failure() {
        let cleanup_mock = MockProvisioner::new();
        let cleanup_calls = cleanup_mock.calls();
        let cleanup = hooked("shell-local", cleanup_mock);

        let ok = vec![hooked("shell", MockProvisioner::new())];
        ProvisionHook::new(&ok, Some(&cleanup))
            .run(HOOK_PROVISION, &CancellationToken::new(), &CollectingUi::new(), &Variables::new())
            .await
            .unwrap();
        assert_eq!(cleanup_calls.load(Ordering::SeqCst), 0);

        let failing = vec![hooked("shell", MockProvisioner::new().failing_times(1))];
        let ui = CollectingUi::new();
        let result = ProvisionHook::new(&failing, Some(&cleanup))
            .run(HOOK_PROVISION, &CancellationToken::new(), &ui, &Variables::new())
            .await;
        assert!(result.is_err());
        assert_eq!(cleanup_calls.load(Ordering::SeqCst), 1);
        assert!(ui.said()[0].starts_with("Provisioning step had errors"));
    }

    #[tokio::test]
    async fn test_other_hooks_are_ignored() {
        let mock = MockProvisioner::new();
        let calls = mock.calls();
        let provisioners = vec![hooked("shell", mock)];

        ProvisionHook::new(&provisioners, None)
            .run("communicator", &CancellationToken::new(), &CollectingUi::new(), &Variables::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
