//! nsharness
//!
//! An integration-test harness for DNS servers. It drives already-running servers through
//! configuration changes and asserts on their answers and logs:
//!
//! * [`query`] builds DNS queries and sends them over UDP or TCP with bounded retries,
//! * [`check`] holds the assertions a test makes about responses,
//! * [`server`] renders configuration templates and reconfigures servers through their
//!   control channel,
//! * [`watch`] waits for lines to appear in server logs,
//! * [`scenario`] runs data-driven test scenarios built from all of the above.
//!
#![warn(clippy::pedantic)]

pub mod check;
pub mod config;
pub mod error;
pub mod query;
pub mod scenario;
pub mod server;
pub mod template;
pub mod watch;

pub use config::{Config, SharedConfig};
pub use query::transport::{Mode, TransportOptions};
pub use query::{Flag, Query, Response, Status};
pub use scenario::{Runner, Scenario};
pub use server::{ServerHandle, Servers};
pub use template::TemplateEngine;
pub use watch::{LogCursor, Pattern};
