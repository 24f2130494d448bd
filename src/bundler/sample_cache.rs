use std::collections::VecDeque;

/// One observation: mean execution time per task of a returned bundle, weighted by the number
/// of tasks in that bundle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub mean_time: f64,
    pub weight: usize,
}

/// Bounded FIFO of performance samples with an incrementally maintained weighted mean.
///
/// Not synchronized: the owning bundler serializes writers.
#[derive(Debug, Clone)]
pub struct PerformanceSampleCache {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
    initial_mean: f64,
    total_time: f64,
    total_weight: u64,
    mean: f64,
    previous_mean: f64,
}

impl PerformanceSampleCache {
    pub fn new(capacity: usize, initial_mean: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            initial_mean,
            total_time: 0.0,
            total_weight: 0,
            mean: initial_mean,
            previous_mean: initial_mean,
        }
    }

    /// Append a sample, evicting the oldest one once the capacity is exceeded.
    pub fn add_sample(&mut self, mean_time: f64, weight: usize) {
        self.samples.push_back(PerformanceSample { mean_time, weight });
        self.total_time += mean_time * weight as f64;
        self.total_weight += weight as u64;

        if self.samples.len() > self.capacity {
            if let Some(evicted) = self.samples.pop_front() {
                self.total_time -= evicted.mean_time * evicted.weight as f64;
                self.total_weight -= evicted.weight as u64;
            }
        }

        self.previous_mean = self.mean;
        self.mean = self.compute_mean();
    }

    fn compute_mean(&self) -> f64 {
        if self.total_weight == 0 {
            return self.initial_mean;
        }
        // float subtraction on eviction can drift slightly below zero
        (self.total_time / self.total_weight as f64).max(0.0)
    }

    /// Weighted mean of the retained samples, or the initial mean when there are none.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Mean before the most recent insertion.
    pub fn previous_mean(&self) -> f64 {
        self.previous_mean
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn samples(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_reports_initial_mean() {
        let cache = PerformanceSampleCache::new(4, 1e9);
        assert!(cache.is_empty());
        assert_eq!(cache.mean(), 1e9);
        assert_eq!(cache.previous_mean(), 1e9);
    }

    #[test]
    fn weighted_mean() {
        let mut cache = PerformanceSampleCache::new(10, 1.0);
        cache.add_sample(10.0, 1);
        cache.add_sample(40.0, 3);
        assert_eq!(cache.total_weight(), 4);
        assert!((cache.mean() - 32.5).abs() < 1e-9);
        assert!((cache.previous_mean() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn eviction_keeps_latest_samples() {
        let mut cache = PerformanceSampleCache::new(3, 1.0);
        for i in 1..=10 {
            cache.add_sample(i as f64, 2);
        }
        assert_eq!(cache.len(), 3);
        let kept: Vec<f64> = cache.samples().map(|s| s.mean_time).collect();
        assert_eq!(kept, vec![8.0, 9.0, 10.0]);
        assert!((cache.mean() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut cache = PerformanceSampleCache::new(0, 5.0);
        assert_eq!(cache.capacity(), 1);
        cache.add_sample(2.0, 1);
        cache.add_sample(3.0, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.mean(), 3.0);
    }

    #[test]
    fn zero_weight_samples_leave_initial_mean() {
        let mut cache = PerformanceSampleCache::new(2, 7.0);
        cache.add_sample(100.0, 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.mean(), 7.0);
    }
}
