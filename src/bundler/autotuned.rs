//! Autotuned bundling: each bundler searches for its own best size by trial. After every
//! feedback it compares the channel's new mean time per task with the previous one; while the
//! mean improves the size keeps moving the same way with a growing step, and once it gets
//! worse the direction flips and the step is halved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::profile::AutotunedProfile;
use super::registry::BundlerRegistry;
use super::sample_cache::PerformanceSampleCache;
use super::{next_bundler_id, Bundler};

pub const ALGORITHM_NAME: &str = "autotuned";

const STEP: i64 = 1;

#[derive(Debug)]
struct Tuning {
    cache: PerformanceSampleCache,
    /// Signed size change applied at the next feedback. Never zero.
    action: i64,
}

/// Per-bundler state shared between the bundler handle and its family registry.
#[derive(Debug)]
pub struct AutotunedState {
    id: u64,
    profile: AutotunedProfile,
    size: AtomicUsize,
    tuning: Mutex<Tuning>,
}

impl AutotunedState {
    fn new(profile: AutotunedProfile) -> Self {
        Self {
            id: next_bundler_id(),
            size: AtomicUsize::new(profile.initial_size()),
            tuning: Mutex::new(Tuning {
                cache: PerformanceSampleCache::new(
                    profile.performance_cache_size(),
                    profile.initial_mean_time(),
                ),
                action: profile.max_action_range() as i64,
            }),
            profile,
        }
    }

    pub fn mean(&self) -> f64 {
        self.tuning.lock().cache.mean()
    }

    pub fn bundle_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

/// Aggregate view of the live members of an autotuned family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyStats {
    pub members: usize,
    pub mean_sum: f64,
    pub size_sum: usize,
}

/// Registry and capacity bound of the autotuned bundlers built by one factory.
#[derive(Debug)]
pub struct AutotunedFamily {
    registry: BundlerRegistry<AutotunedState>,
    max_size: AtomicUsize,
}

impl AutotunedFamily {
    pub fn new(max_size: usize) -> Self {
        Self {
            registry: BundlerRegistry::new(),
            max_size: AtomicUsize::new(max_size.max(1)),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Zero is ignored. Sizes above the new bound are cut at their next feedback.
    pub fn set_max_size(&self, max_size: usize) {
        if max_size > 0 {
            self.max_size.store(max_size, Ordering::Release);
        }
    }

    pub fn registry(&self) -> &BundlerRegistry<AutotunedState> {
        &self.registry
    }

    pub fn stats(&self) -> FamilyStats {
        let members = self.registry.lock();
        FamilyStats {
            members: members.len(),
            mean_sum: members.values().map(|m| m.mean()).sum(),
            size_sum: members.values().map(|m| m.bundle_size()).sum(),
        }
    }
}

/// Bundler of the autotuned family.
#[derive(Debug)]
pub struct AutotunedBundler {
    state: Arc<AutotunedState>,
    family: Arc<AutotunedFamily>,
}

impl AutotunedBundler {
    pub fn new(profile: AutotunedProfile, family: Arc<AutotunedFamily>) -> Self {
        let state = Arc::new(AutotunedState::new(profile));
        tracing::debug!(
            bundler_id = state.id,
            initial_size = state.profile.initial_size(),
            "Autotuned bundler created"
        );
        Self { state, family }
    }

    pub fn profile(&self) -> &AutotunedProfile {
        &self.state.profile
    }

    pub fn mean(&self) -> f64 {
        self.state.mean()
    }

    /// Size change the next feedback will apply, before the new sample is judged.
    pub fn action(&self) -> i64 {
        self.state.tuning.lock().action
    }

    pub fn is_registered(&self) -> bool {
        self.family.registry.contains(self.state.id)
    }

    pub fn family(&self) -> &Arc<AutotunedFamily> {
        &self.family
    }
}

impl Bundler for AutotunedBundler {
    fn id(&self) -> u64 {
        self.state.id
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM_NAME
    }

    fn bundle_size(&self) -> usize {
        self.state.bundle_size()
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
        let per_task = elapsed_nanos.max(1.0) / size as f64;
        let range = self.state.profile.max_action_range() as i64;
        let threshold = self.state.profile.performance_variation_threshold();
        let max_size = self.family.max_size() as i64;

        let (action, new_size) = {
            let mut tuning = self.state.tuning.lock();
            tuning.cache.add_sample(per_task, size);
            let previous = tuning.cache.previous_mean();
            let improvement = previous - tuning.cache.mean();
            let tolerance = previous.abs() * threshold;

            let action = tuning.action;
            if improvement > tolerance {
                tuning.action = action + action.signum() * STEP;
            } else if improvement < -tolerance {
                tuning.action = -action.signum() * (action.abs() / 2).max(STEP);
            }
            tuning.action = tuning.action.clamp(-range, range);

            let current = self.state.size.load(Ordering::Acquire) as i64;
            let new_size = (current + tuning.action).clamp(1, max_size.max(1)) as usize;
            self.state.size.store(new_size, Ordering::Release);
            (tuning.action, new_size)
        };

        tracing::debug!(
            bundler_id = self.state.id,
            tasks = size,
            per_task_nanos = per_task,
            action,
            new_size,
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
        Box::new(AutotunedBundler::new(
            self.state.profile.copy(),
            self.family.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundler(max_size: usize) -> AutotunedBundler {
        let profile = AutotunedProfile::new(100, 20, 10, 1e9, 0.0);
        AutotunedBundler::new(profile, Arc::new(AutotunedFamily::new(max_size)))
    }

    #[test]
    fn improvement_keeps_direction_and_degradation_reverses() {
        let b = bundler(300);
        assert_eq!(b.bundle_size(), 10);

        // 1024ns per task, far better than the initial mean
        b.feedback(10, 10_240.0);
        assert_eq!(b.action(), 20);
        assert_eq!(b.bundle_size(), 30);

        // 2048ns per task: the mean rises to 1792, so reverse with half the step
        b.feedback(30, 61_440.0);
        assert_eq!(b.action(), -10);
        assert_eq!(b.bundle_size(), 20);

        // 512ns per task: the mean falls again, keep shrinking one step further
        b.feedback(20, 10_240.0);
        assert_eq!(b.action(), -11);
        assert_eq!(b.bundle_size(), 9);
    }

    #[test]
    fn size_stays_within_bounds() {
        let b = bundler(25);
        b.feedback(10, 10_240.0);
        assert_eq!(b.bundle_size(), 25);

        let b = bundler(300);
        b.feedback(10, 10_240.0);
        // each worse sample halves the step until it reaches one
        for _ in 0..20 {
            b.feedback(1, 1e12);
        }
        assert!(b.bundle_size() >= 1);
        assert_ne!(b.action(), 0);
    }

    #[test]
    fn invalid_feedback_is_ignored() {
        let b = bundler(300);
        b.feedback(0, 1000.0);
        b.feedback(5, f64::NAN);
        b.feedback(5, -1.0);
        assert_eq!(b.bundle_size(), 10);
        assert_eq!(b.mean(), 1e9);
    }

    #[test]
    fn family_stats_cover_registered_members() {
        let family = Arc::new(AutotunedFamily::new(300));
        let a = AutotunedBundler::new(AutotunedProfile::default(), family.clone());
        let b = AutotunedBundler::new(AutotunedProfile::default(), family.clone());
        a.setup();
        b.setup();
        a.feedback(10, 10_240.0);

        let stats = family.stats();
        assert_eq!(stats.members, 2);
        assert_eq!(stats.size_sum, 30 + 10);

        b.dispose();
        assert_eq!(family.stats().members, 1);
        assert!(!b.is_registered());
    }
}
