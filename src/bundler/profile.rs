use serde::Serialize;

use crate::config::LoadBalancingConfig;

pub const DEFAULT_PERFORMANCE_CACHE_SIZE: usize = 3000;
pub const DEFAULT_PROPORTIONALITY_FACTOR: u32 = 1;
pub const DEFAULT_INITIAL_SIZE: usize = 10;
/// One second, expressed in nanoseconds.
pub const DEFAULT_INITIAL_MEAN_TIME: f64 = 1e9;
pub const MAX_PROPORTIONALITY_FACTOR: u32 = 32;

pub const DEFAULT_FIXED_SIZE: usize = 1;

pub const DEFAULT_MAX_ACTION_RANGE: usize = 20;
pub const MAX_ACTION_RANGE_LIMIT: usize = 1000;
pub const DEFAULT_PERFORMANCE_VARIATION_THRESHOLD: f64 = 0.0001;

/// Tuning parameters of the proportional algorithm.
///
/// Fields are private so a profile cannot change once a bundler is built from it; bundlers
/// hold their own copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProportionalProfile {
    performance_cache_size: usize,
    proportionality_factor: u32,
    initial_size: usize,
    initial_mean_time: f64,
}

impl Default for ProportionalProfile {
    fn default() -> Self {
        Self {
            performance_cache_size: DEFAULT_PERFORMANCE_CACHE_SIZE,
            proportionality_factor: DEFAULT_PROPORTIONALITY_FACTOR,
            initial_size: DEFAULT_INITIAL_SIZE,
            initial_mean_time: DEFAULT_INITIAL_MEAN_TIME,
        }
    }
}

impl ProportionalProfile {
    /// Build a profile; each out-of-range value is replaced by its default.
    pub fn new(
        performance_cache_size: usize,
        proportionality_factor: u32,
        initial_size: usize,
        initial_mean_time: f64,
    ) -> Self {
        let defaults = Self::default();
        Self {
            performance_cache_size: if performance_cache_size > 0 {
                performance_cache_size
            } else {
                defaults.performance_cache_size
            },
            proportionality_factor: if (1..=MAX_PROPORTIONALITY_FACTOR)
                .contains(&proportionality_factor)
            {
                proportionality_factor
            } else {
                defaults.proportionality_factor
            },
            initial_size: if initial_size >= 1 {
                initial_size
            } else {
                defaults.initial_size
            },
            initial_mean_time: if initial_mean_time.is_finite() && initial_mean_time > 0.0 {
                initial_mean_time
            } else {
                defaults.initial_mean_time
            },
        }
    }

    pub fn from_config(config: &LoadBalancingConfig) -> Self {
        let factor = config.get_u32(
            "proportionalityFactor",
            DEFAULT_PROPORTIONALITY_FACTOR,
            1,
        );
        Self::new(
            config.get_usize("performanceCacheSize", DEFAULT_PERFORMANCE_CACHE_SIZE, 1),
            factor.min(MAX_PROPORTIONALITY_FACTOR),
            config.get_usize("initialSize", DEFAULT_INITIAL_SIZE, 1),
            config.get_f64("initialMeanTime", DEFAULT_INITIAL_MEAN_TIME),
        )
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn performance_cache_size(&self) -> usize {
        self.performance_cache_size
    }

    pub fn proportionality_factor(&self) -> u32 {
        self.proportionality_factor
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn initial_mean_time(&self) -> f64 {
        self.initial_mean_time
    }
}

/// Parameters of the `manual` algorithm: every bundle has the same size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedSizeProfile {
    size: usize,
}

impl Default for FixedSizeProfile {
    fn default() -> Self {
        Self {
            size: DEFAULT_FIXED_SIZE,
        }
    }
}

impl FixedSizeProfile {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
        }
    }

    pub fn from_config(config: &LoadBalancingConfig) -> Self {
        Self::new(config.get_usize("size", DEFAULT_FIXED_SIZE, 1))
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Tuning parameters of the `autotuned` algorithm.
///
/// `max_action_range` bounds how far one feedback can move the bundle size.
/// `performance_variation_threshold` is the relative change of the mean below which a new
/// sample counts as neither better nor worse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutotunedProfile {
    performance_cache_size: usize,
    max_action_range: usize,
    initial_size: usize,
    initial_mean_time: f64,
    performance_variation_threshold: f64,
}

impl Default for AutotunedProfile {
    fn default() -> Self {
        Self {
            performance_cache_size: DEFAULT_PERFORMANCE_CACHE_SIZE,
            max_action_range: DEFAULT_MAX_ACTION_RANGE,
            initial_size: DEFAULT_INITIAL_SIZE,
            initial_mean_time: DEFAULT_INITIAL_MEAN_TIME,
            performance_variation_threshold: DEFAULT_PERFORMANCE_VARIATION_THRESHOLD,
        }
    }
}

impl AutotunedProfile {
    /// Build a profile; each out-of-range value is replaced by its default.
    pub fn new(
        performance_cache_size: usize,
        max_action_range: usize,
        initial_size: usize,
        initial_mean_time: f64,
        performance_variation_threshold: f64,
    ) -> Self {
        let defaults = Self::default();
        Self {
            performance_cache_size: if performance_cache_size > 0 {
                performance_cache_size
            } else {
                defaults.performance_cache_size
            },
            max_action_range: if (1..=MAX_ACTION_RANGE_LIMIT).contains(&max_action_range) {
                max_action_range
            } else {
                defaults.max_action_range
            },
            initial_size: initial_size.max(1),
            initial_mean_time: if initial_mean_time.is_finite() && initial_mean_time > 0.0 {
                initial_mean_time
            } else {
                defaults.initial_mean_time
            },
            performance_variation_threshold: if performance_variation_threshold.is_finite()
                && performance_variation_threshold >= 0.0
            {
                performance_variation_threshold
            } else {
                defaults.performance_variation_threshold
            },
        }
    }

    pub fn from_config(config: &LoadBalancingConfig) -> Self {
        Self::new(
            config.get_usize("performanceCacheSize", DEFAULT_PERFORMANCE_CACHE_SIZE, 1),
            config.get_usize("maxActionRange", DEFAULT_MAX_ACTION_RANGE, 1),
            config.get_usize("initialSize", DEFAULT_INITIAL_SIZE, 1),
            config.get_f64("initialMeanTime", DEFAULT_INITIAL_MEAN_TIME),
            config.get_f64(
                "performanceVariationThreshold",
                DEFAULT_PERFORMANCE_VARIATION_THRESHOLD,
            ),
        )
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn performance_cache_size(&self) -> usize {
        self.performance_cache_size
    }

    pub fn max_action_range(&self) -> usize {
        self.max_action_range
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn initial_mean_time(&self) -> f64 {
        self.initial_mean_time
    }

    pub fn performance_variation_threshold(&self) -> f64 {
        self.performance_variation_threshold
    }
}
