//! Run-level cancellation.
//!
//! A single [`CancellationToken`] is shared by every phase of a run: data
//! source resolution, job dispatch, provisioner pauses and retry sleeps all
//! observe it.

mod token;

pub use token::CancellationToken;
