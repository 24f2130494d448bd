use serde::{Deserialize, Serialize};

/// Management identity of an execution channel, carried by dispatch/return events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u64,
    pub identity: String,
    /// True for an executor running inside the grid process
    pub local: bool,
}

impl ChannelInfo {
    pub fn node(id: u64, identity: impl Into<String>) -> Self {
        Self {
            id,
            identity: identity.into(),
            local: false,
        }
    }

    pub fn local(id: u64) -> Self {
        Self {
            id,
            identity: format!("local-{}", id),
            local: true,
        }
    }
}

impl std::fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.identity, self.id)
    }
}
