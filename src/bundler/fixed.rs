use super::profile::FixedSizeProfile;
use super::{next_bundler_id, Bundler};

pub const ALGORITHM_NAME: &str = "manual";

/// Always proposes the same bundle size; feedback is ignored.
#[derive(Debug)]
pub struct FixedSizeBundler {
    id: u64,
    profile: FixedSizeProfile,
}

impl FixedSizeBundler {
    pub fn new(profile: FixedSizeProfile) -> Self {
        Self {
            id: next_bundler_id(),
            profile,
        }
    }

    pub fn profile(&self) -> &FixedSizeProfile {
        &self.profile
    }
}

impl Bundler for FixedSizeBundler {
    fn id(&self) -> u64 {
        self.id
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM_NAME
    }

    fn bundle_size(&self) -> usize {
        self.profile.size()
    }

    fn feedback(&self, _size: usize, _elapsed_nanos: f64) {}

    fn setup(&self) {}

    fn dispose(&self) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(FixedSizeBundler::new(self.profile.clone()))
    }
}
