use std::sync::Arc;

use super::autotuned::{self, AutotunedBundler, AutotunedFamily};
use super::fixed::{self, FixedSizeBundler};
use super::profile::{AutotunedProfile, FixedSizeProfile, ProportionalProfile};
use super::proportional::{self, ProportionalBundler, ProportionalFamily};
use super::Bundler;
use crate::config::LoadBalancingConfig;
use crate::error::{GridError, Result};

const ALGORITHM_NAMES: [&str; 3] = [
    autotuned::ALGORITHM_NAME,
    fixed::ALGORITHM_NAME,
    proportional::ALGORITHM_NAME,
];

#[derive(Debug, Clone)]
enum Algorithm {
    Proportional(ProportionalProfile),
    Autotuned(AutotunedProfile),
    Manual(FixedSizeProfile),
}

/// Creates bundlers for the configured algorithm.
///
/// The factory owns one family per adaptive algorithm (registry and capacity bound); every
/// bundler it creates joins its family on [`Bundler::setup`].
#[derive(Debug)]
pub struct BundlerFactory {
    algorithm: Algorithm,
    family: Arc<ProportionalFamily>,
    autotuned: Arc<AutotunedFamily>,
}

impl BundlerFactory {
    /// Build a factory, rejecting unknown algorithm names.
    pub fn try_new(config: &LoadBalancingConfig, max_size: usize) -> Result<Self> {
        let algorithm = match config.algorithm.as_str() {
            proportional::ALGORITHM_NAME => {
                Algorithm::Proportional(ProportionalProfile::from_config(config))
            }
            autotuned::ALGORITHM_NAME => {
                Algorithm::Autotuned(AutotunedProfile::from_config(config))
            }
            fixed::ALGORITHM_NAME => Algorithm::Manual(FixedSizeProfile::from_config(config)),
            other => return Err(GridError::UnknownAlgorithm(other.to_string())),
        };
        tracing::info!(
            algorithm = %config.algorithm,
            profile = %config.profile,
            max_size,
            "Load balancer configured"
        );
        Ok(Self::with_algorithm(algorithm, max_size))
    }

    /// Build a factory; an unknown algorithm falls back to fixed bundles of one task.
    pub fn new(config: &LoadBalancingConfig, max_size: usize) -> Self {
        match Self::try_new(config, max_size) {
            Ok(factory) => factory,
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to fixed-size load balancing");
                Self::with_algorithm(Algorithm::Manual(FixedSizeProfile::default()), max_size)
            }
        }
    }

    fn with_algorithm(algorithm: Algorithm, max_size: usize) -> Self {
        Self {
            algorithm,
            family: Arc::new(ProportionalFamily::new(max_size)),
            autotuned: Arc::new(AutotunedFamily::new(max_size)),
        }
    }

    pub fn algorithm_names() -> &'static [&'static str] {
        &ALGORITHM_NAMES
    }

    pub fn algorithm(&self) -> &'static str {
        match self.algorithm {
            Algorithm::Proportional(_) => proportional::ALGORITHM_NAME,
            Algorithm::Autotuned(_) => autotuned::ALGORITHM_NAME,
            Algorithm::Manual(_) => fixed::ALGORITHM_NAME,
        }
    }

    /// A new, unregistered bundler for the configured algorithm.
    pub fn new_bundler(&self) -> Box<dyn Bundler> {
        match &self.algorithm {
            Algorithm::Proportional(profile) => Box::new(self.new_proportional(profile.copy())),
            Algorithm::Autotuned(profile) => Box::new(self.new_autotuned(profile.copy())),
            Algorithm::Manual(profile) => Box::new(FixedSizeBundler::new(profile.clone())),
        }
    }

    /// A proportional bundler with an explicit profile, in this factory's family.
    pub fn new_proportional(&self, profile: ProportionalProfile) -> ProportionalBundler {
        ProportionalBundler::new(profile, self.family.clone())
    }

    /// An autotuned bundler with an explicit profile, in this factory's autotuned family.
    pub fn new_autotuned(&self, profile: AutotunedProfile) -> AutotunedBundler {
        AutotunedBundler::new(profile, self.autotuned.clone())
    }

    pub fn fallback_bundler() -> Box<dyn Bundler> {
        Box::new(FixedSizeBundler::new(FixedSizeProfile::default()))
    }

    pub fn max_size(&self) -> usize {
        self.family.max_size()
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.family.set_max_size(max_size);
        self.autotuned.set_max_size(max_size);
    }

    /// Number of adaptive bundlers currently registered.
    pub fn active_bundlers(&self) -> usize {
        self.family.registry().len() + self.autotuned.registry().len()
    }

    pub fn family(&self) -> &Arc<ProportionalFamily> {
        &self.family
    }

    pub fn autotuned_family(&self) -> &Arc<AutotunedFamily> {
        &self.autotuned
    }
}
