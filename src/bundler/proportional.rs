//! Proportional bundling: each channel's bundle size is inversely proportional to a power of
//! its mean execution time per task, and the sizes of all live channels add up to the current
//! capacity bound.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::profile::{ProportionalProfile, MAX_PROPORTIONALITY_FACTOR};
use super::registry::BundlerRegistry;
use super::sample_cache::PerformanceSampleCache;
use super::{next_bundler_id, Bundler};

pub const ALGORITHM_NAME: &str = "proportional";

/// Per-bundler state shared between the bundler handle and its family registry.
#[derive(Debug)]
pub struct ProportionalState {
    id: u64,
    profile: ProportionalProfile,
    size: AtomicUsize,
    cache: Mutex<PerformanceSampleCache>,
}

impl ProportionalState {
    fn new(profile: ProportionalProfile) -> Self {
        Self {
            id: next_bundler_id(),
            size: AtomicUsize::new(profile.initial_size()),
            cache: Mutex::new(PerformanceSampleCache::new(
                profile.performance_cache_size(),
                profile.initial_mean_time(),
            )),
            profile,
        }
    }

    pub fn mean(&self) -> f64 {
        self.cache.lock().mean()
    }
}

/// Everything the bundlers of one proportional family share: the registry and the capacity
/// bound the sizes must add up to.
#[derive(Debug)]
pub struct ProportionalFamily {
    registry: BundlerRegistry<ProportionalState>,
    max_size: AtomicUsize,
}

impl ProportionalFamily {
    pub fn new(max_size: usize) -> Self {
        Self {
            registry: BundlerRegistry::new(),
            max_size: AtomicUsize::new(max_size.max(1)),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Update the capacity bound. Zero is ignored. Takes effect at the next recomputation.
    pub fn set_max_size(&self, max_size: usize) {
        if max_size == 0 {
            return;
        }
        let previous = self.max_size.swap(max_size, Ordering::AcqRel);
        if previous != max_size {
            tracing::debug!(previous, max_size, "Bundle capacity bound updated");
        }
    }

    pub fn registry(&self) -> &BundlerRegistry<ProportionalState> {
        &self.registry
    }

    /// Recompute every member's size now, under the family lock.
    pub fn recompute(&self) {
        let members = self.registry.lock();
        ProportionalAllocator::apply(&members, self.max_size());
    }
}

/// Input of one channel to the allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelPerformance {
    pub id: u64,
    pub mean: f64,
    pub proportionality_factor: u32,
}

pub struct ProportionalAllocator;

impl ProportionalAllocator {
    /// `1 / x^k`, with `k` clamped to `1..=MAX_PROPORTIONALITY_FACTOR`.
    pub fn normalize(mean: f64, proportionality_factor: u32) -> f64 {
        let k = proportionality_factor.clamp(1, MAX_PROPORTIONALITY_FACTOR);
        mean.powi(k as i32).recip()
    }

    /// Compute the bundle size of each channel, in input order.
    ///
    /// Sizes are at least 1. When there are no more channels than `max_size`, they add up to
    /// exactly `max_size`: the flooring shortfall goes to the channel with the smallest mean
    /// (lowest id on ties) and any excess created by the minimum of 1 is taken back from the
    /// largest sizes. Among equal sizes the slowest channel gives first, then the highest id,
    /// so a faster channel never ends up with less than a slower one.
    pub fn compute(channels: &[ChannelPerformance], max_size: usize) -> Vec<usize> {
        let count = channels.len();
        if count == 0 {
            return Vec::new();
        }
        let max_size = max_size.max(1);

        let weights: Vec<f64> = channels
            .iter()
            .map(|c| Self::normalize(c.mean, c.proportionality_factor))
            .collect();
        let weight_sum: f64 = weights.iter().sum();
        let degenerate = !(weight_sum.is_finite() && weight_sum > 0.0)
            || weights.iter().any(|w| !w.is_finite());

        let mut sizes: Vec<usize> = weights
            .iter()
            .map(|&weight| {
                let share = if degenerate {
                    1.0 / count as f64
                } else {
                    weight / weight_sum
                };
                let mut size = ((share * max_size as f64).floor() as usize).max(1);
                if size >= max_size && max_size > 1 {
                    size = max_size - 1;
                }
                size
            })
            .collect();

        let sum: usize = sizes.iter().sum();
        if sum < max_size {
            let fastest = (0..count)
                .min_by(|&a, &b| {
                    channels[a]
                        .mean
                        .total_cmp(&channels[b].mean)
                        .then(channels[a].id.cmp(&channels[b].id))
                })
                .unwrap_or(0);
            sizes[fastest] += max_size - sum;
        } else if sum > max_size {
            let mut excess = sum - max_size;
            while excess > 0 {
                let largest = (0..count).filter(|&i| sizes[i] > 1).max_by(|&a, &b| {
                    sizes[a]
                        .cmp(&sizes[b])
                        .then(channels[a].mean.total_cmp(&channels[b].mean))
                        .then(channels[a].id.cmp(&channels[b].id))
                });
                match largest {
                    Some(i) => {
                        sizes[i] -= 1;
                        excess -= 1;
                    }
                    // every channel is at 1: more channels than capacity
                    None => break,
                }
            }
        }

        sizes
    }

    /// Read every member's mean, compute the new sizes and write them back. The caller holds
    /// the family lock.
    pub(crate) fn apply(members: &BTreeMap<u64, Arc<ProportionalState>>, max_size: usize) {
        if members.is_empty() {
            return;
        }
        let channels: Vec<ChannelPerformance> = members
            .values()
            .map(|state| ChannelPerformance {
                id: state.id,
                mean: state.mean(),
                proportionality_factor: state.profile.proportionality_factor(),
            })
            .collect();

        let sizes = Self::compute(&channels, max_size);
        for (state, size) in members.values().zip(sizes) {
            state.size.store(size, Ordering::Release);
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            let summary: Vec<(u64, usize)> = members
                .values()
                .map(|s| (s.id, s.size.load(Ordering::Relaxed)))
                .collect();
            tracing::trace!(max_size, sizes = ?summary, "Bundle sizes recomputed");
        }
    }
}

/// Bundler of the proportional family.
#[derive(Debug)]
pub struct ProportionalBundler {
    state: Arc<ProportionalState>,
    family: Arc<ProportionalFamily>,
}

impl ProportionalBundler {
    pub fn new(profile: ProportionalProfile, family: Arc<ProportionalFamily>) -> Self {
        let state = Arc::new(ProportionalState::new(profile));
        tracing::debug!(
            bundler_id = state.id,
            initial_size = state.profile.initial_size(),
            "Proportional bundler created"
        );
        Self { state, family }
    }

    pub fn profile(&self) -> &ProportionalProfile {
        &self.state.profile
    }

    pub fn mean(&self) -> f64 {
        self.state.mean()
    }

    pub fn sample_count(&self) -> usize {
        self.state.cache.lock().len()
    }

    pub fn is_registered(&self) -> bool {
        self.family.registry.contains(self.state.id)
    }

    pub fn family(&self) -> &Arc<ProportionalFamily> {
        &self.family
    }
}

impl Bundler for ProportionalBundler {
    fn id(&self) -> u64 {
        self.state.id
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM_NAME
    }

    fn bundle_size(&self) -> usize {
        self.state.size.load(Ordering::Acquire)
    }

    fn feedback(&self, size: usize, elapsed_nanos: f64) {
        if size == 0 {
            return;
        }
        if !elapsed_nanos.is_finite() || elapsed_nanos < 0.0 {
            tracing::warn!(
                bundler_id = self.state.id,
                size,
                elapsed_nanos,
                "Ignoring feedback with invalid elapsed time"
            );
            return;
        }
        // below clock resolution: count it as one nanosecond
        let per_task = elapsed_nanos.max(1.0) / size as f64;

        let members = self.family.registry.lock();
        self.state.cache.lock().add_sample(per_task, size);
        if !members.contains_key(&self.state.id) {
            tracing::debug!(
                bundler_id = self.state.id,
                "Feedback for unregistered bundler, sizes not recomputed"
            );
            return;
        }
        ProportionalAllocator::apply(&members, self.family.max_size());
        tracing::debug!(
            bundler_id = self.state.id,
            tasks = size,
            per_task_nanos = per_task,
            new_size = self.bundle_size(),
            "Feedback applied"
        );
    }

    fn setup(&self) {
        if self
            .family
            .registry
            .register(self.state.id, self.state.clone())
        {
            tracing::debug!(bundler_id = self.state.id, "Bundler registered");
        }
    }

    fn dispose(&self) {
        if self.family.registry.deregister(self.state.id) {
            tracing::debug!(bundler_id = self.state.id, "Bundler disposed");
        }
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(ProportionalBundler::new(
            self.state.profile.copy(),
            self.family.clone(),
        ))
    }
}
