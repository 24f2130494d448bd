//! In-process execution channels.
//!
//! - [`LocalExecutor`]: executes bundles locally, taking time proportional to the bundle
//!   size and the channel's speed
//! - [`HeartbeatSender`]: keeps a channel registered as alive with the dispatcher
//!
//! The grid runs one executor loop and one heartbeat loop per attached local channel.

pub mod executor;
pub mod heartbeat;

pub use executor::{ExecutionResult, LocalExecutor};
pub use heartbeat::HeartbeatSender;
