//! Adaptive bundle sizing.
//!
//! A [`Bundler`] decides how many tasks the next bundle sent to one channel should hold. The
//! dispatcher reads [`Bundler::bundle_size`] before carving a bundle and reports the measured
//! execution time through [`Bundler::feedback`] when the bundle comes back.
//!
//! # Algorithms
//!
//! - [`ProportionalBundler`] (`proportional`): sizes of all live bundlers of a family are
//!   recomputed on every feedback so they are inversely proportional to a power of each
//!   channel's mean time per task and add up to the family's capacity bound.
//! - [`AutotunedBundler`] (`autotuned`): each bundler searches for its own size, stepping
//!   it up or down depending on whether its mean time per task improved.
//! - [`FixedSizeBundler`] (`manual`): a constant size.
//!
//! Bundlers are created by a [`BundlerFactory`], which owns the family state. Bundlers built
//! by different factories never influence each other.

pub mod autotuned;
pub mod factory;
pub mod fixed;
pub mod profile;
pub mod proportional;
pub mod registry;
pub mod sample_cache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use autotuned::{AutotunedBundler, AutotunedFamily, FamilyStats};
pub use factory::BundlerFactory;
pub use fixed::FixedSizeBundler;
pub use profile::{AutotunedProfile, FixedSizeProfile, ProportionalProfile};
pub use proportional::{
    ChannelPerformance, ProportionalAllocator, ProportionalBundler, ProportionalFamily,
};
pub use registry::BundlerRegistry;
pub use sample_cache::{PerformanceSample, PerformanceSampleCache};

static NEXT_BUNDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Bundler ids increase with creation order.
pub(crate) fn next_bundler_id() -> u64 {
    NEXT_BUNDLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-channel bundle size strategy.
pub trait Bundler: Send + Sync + std::fmt::Debug {
    fn id(&self) -> u64;

    /// Name of the algorithm family, as used in configuration.
    fn algorithm(&self) -> &'static str;

    /// Current bundle size. Lock-free; may be one recomputation behind.
    fn bundle_size(&self) -> usize;

    /// Report that `size` tasks took `elapsed_nanos` in total. `size == 0` is ignored.
    fn feedback(&self, size: usize, elapsed_nanos: f64);

    /// Join the family. Called when the channel attaches.
    fn setup(&self);

    /// Leave the family. The last computed size stays readable.
    fn dispose(&self);

    /// A fresh, unregistered bundler with the same profile and no samples.
    fn copy(&self) -> Box<dyn Bundler>;

    fn feedback_elapsed(&self, size: usize, elapsed: Duration) {
        self.feedback(size, elapsed.as_nanos() as f64);
    }
}
