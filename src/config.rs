use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// Property naming the load-balancing algorithm.
pub const ALGORITHM_KEY: &str = "taskgrid.load.balancing.algorithm";
/// Property naming the parameter profile used by the algorithm.
pub const PROFILE_KEY: &str = "taskgrid.load.balancing.profile";

pub const DEFAULT_ALGORITHM: &str = "proportional";
pub const DEFAULT_PROFILE: &str = "default";

/// Load-balancing configuration: which algorithm to run and its string-keyed parameters.
///
/// Parameters are read from flat properties. For a profile named `p`, both
/// `taskgrid.load.balancing.profile.p.<key>` and the short form `strategy.p.<key>` are
/// accepted; the long form wins when both are present.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancingConfig {
    pub algorithm: String,
    pub profile: String,
    pub parameters: HashMap<String, String>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM.to_string(),
            profile: DEFAULT_PROFILE.to_string(),
            parameters: HashMap::new(),
        }
    }
}

impl LoadBalancingConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }

    /// Build a configuration from flat properties.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let algorithm = props
            .get(ALGORITHM_KEY)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ALGORITHM.to_string());
        let profile = props
            .get(PROFILE_KEY)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());

        let long_prefix = format!("{}.{}.", PROFILE_KEY, profile);
        let short_prefix = format!("strategy.{}.", profile);

        let mut parameters = HashMap::new();
        for (key, value) in props {
            if let Some(name) = key.strip_prefix(&short_prefix) {
                parameters
                    .entry(name.to_string())
                    .or_insert_with(|| value.trim().to_string());
            }
        }
        for (key, value) in props {
            if let Some(name) = key.strip_prefix(&long_prefix) {
                parameters.insert(name.to_string(), value.trim().to_string());
            }
        }

        tracing::debug!(
            algorithm = %algorithm,
            profile = %profile,
            parameters = ?parameters,
            "Load-balancing configuration parsed"
        );

        Self {
            algorithm,
            profile,
            parameters,
        }
    }

    /// Read a `key = value` properties file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_properties(&parse_properties(&text)))
    }

    /// Integer parameter, or `default` when missing, malformed or below `min`.
    pub fn get_usize(&self, key: &str, default: usize, min: usize) -> usize {
        match self.parameters.get(key) {
            None => default,
            Some(raw) => match raw.parse::<usize>() {
                Ok(v) if v >= min => v,
                _ => {
                    tracing::warn!(key, value = %raw, default, "Invalid load-balancing parameter, using default");
                    default
                }
            },
        }
    }

    pub fn get_u32(&self, key: &str, default: u32, min: u32) -> u32 {
        match self.parameters.get(key) {
            None => default,
            Some(raw) => match raw.parse::<u32>() {
                Ok(v) if v >= min => v,
                _ => {
                    tracing::warn!(key, value = %raw, default, "Invalid load-balancing parameter, using default");
                    default
                }
            },
        }
    }

    /// Strictly positive, finite float parameter.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.parameters.get(key) {
            None => default,
            Some(raw) => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => v,
                _ => {
                    tracing::warn!(key, value = %raw, default, "Invalid load-balancing parameter, using default");
                    default
                }
            },
        }
    }
}

/// Parse `key = value` (or `key: value`) lines. Blank lines and lines starting with `#` or
/// `!` are skipped.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line.find(['=', ':']);
        let (key, value) = match split {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };
        props.insert(key.trim().to_string(), value.trim().to_string());
    }
    props
}

#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Maximum number of jobs held by the queue
    pub max_jobs: usize,
    /// Capacity bound used by the allocator until the queue reports a larger job
    pub default_max_bundle_size: usize,
    /// A channel that has not sent a heartbeat within this window is considered dead
    pub channel_timeout_ms: u64,
    pub dispatch_interval_ms: u64,
    pub load_balancing: LoadBalancingConfig,
    pub executor: ExecutorConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            default_max_bundle_size: 300,
            channel_timeout_ms: 5000,
            dispatch_interval_ms: 20,
            load_balancing: LoadBalancingConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl GridConfig {
    pub fn with_load_balancing(mut self, load_balancing: LoadBalancingConfig) -> Self {
        self.load_balancing = load_balancing;
        self
    }

    pub fn with_max_bundle_size(mut self, size: usize) -> Self {
        self.default_max_bundle_size = size.max(1);
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }
}

/// Settings of the in-process execution channels.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Simulated cost of one task on a channel of speed 1.0, in microseconds
    pub task_cost_us: u64,
    /// Relative random variation applied to each bundle's duration, in `[0, 1)`
    pub jitter: f64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_cost_us: 1000,
            jitter: 0.1,
            heartbeat_interval_ms: 500,
        }
    }
}

impl ExecutorConfig {
    pub fn with_task_cost_us(mut self, task_cost_us: u64) -> Self {
        self.task_cost_us = task_cost_us;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.99)
        } else {
            0.0
        };
        self
    }
}
