//! Job lifecycle and dispatch.
//!
//! - [`ServerJob`]: a submitted job, its status machine and its undispatched tasks
//! - [`JobQueue`]: owns the jobs and orders them for dispatch
//! - [`JobDispatcher`]: pairs idle channels with jobs, sized by each channel's bundler
//! - [`JobNotifier`]: fans lifecycle events out to listeners

pub mod bundle;
pub mod channel;
pub mod dispatcher;
pub mod job;
pub mod notifier;
pub mod queue;

pub use bundle::{BundleOutcome, ServerTask, TaskBundle};
pub use channel::ChannelInfo;
pub use dispatcher::{ChannelState, JobDispatcher};
pub use job::{CompletionCallback, JobSla, JobStatus, ServerJob};
pub use notifier::{JobEvent, JobEventKind, JobInfo, JobListener, JobNotifier};
pub use queue::JobQueue;
