//! Server control channels.
//!
//! The harness never starts or stops servers itself. It talks to running servers through a
//! control channel, typically `rndc`, to make them reload their configuration or to run
//! any other administrative command a scenario needs.

use crate::error::Error;
use std::sync::Arc;

pub mod rndc;

pub use rndc::RndcControl;

/// `DynControl` is a type alias for a [`Control`] shared between the handles and tasks that
/// drive one server.
pub type DynControl = Arc<dyn Control + Send + Sync>;

/// What a control command printed, and whether the server accepted it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlOutput {
    pub success: bool,
    pub output: String,
}

/// An async trait for sending administrative commands to a running server.
#[async_trait::async_trait]
pub trait Control {
    /// Run the command made of `args`, e.g. `["reconfig"]` or `["nta", "-d"]`.
    async fn run(&self, args: &[&str]) -> Result<ControlOutput, Error>;
}
