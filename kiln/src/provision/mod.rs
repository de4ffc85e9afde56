//! Provisioner decorators and the hook that runs a job's provisioners.

mod decorators;
mod hook;

pub use decorators::{decorate, PausedProvisioner, RetriedProvisioner, TimeoutProvisioner};
pub use hook::{HookedProvisioner, ProvisionHook};
