pub mod bundler;
pub mod config;
pub mod error;
pub mod grid;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{GridError, Result};
