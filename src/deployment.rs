use std::sync::atomic::{AtomicU8, Ordering};

/// What is known about an account's on-chain code.
///
/// Ordered: a state only ever moves to a greater one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeploymentState {
    Undefined = 0,
    NotDeployed = 1,
    Deployed = 2,
}

impl DeploymentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Undefined,
            1 => Self::NotDeployed,
            _ => Self::Deployed,
        }
    }
}

/// Per-account cache of the deployment state.
///
/// Concurrent observers may race on the first bytecode check; writes go
/// through an atomic max so the result is the same whatever the order, and
/// `Deployed` is never overwritten.
#[derive(Debug, Default)]
pub struct DeploymentCache {
    state: AtomicU8,
}

impl DeploymentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> DeploymentState {
        DeploymentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Records an observation and returns the resulting state.
    pub fn observe(&self, observed: DeploymentState) -> DeploymentState {
        let previous = self.state.fetch_max(observed as u8, Ordering::AcqRel);
        DeploymentState::from_u8(previous.max(observed as u8))
    }

    /// Records a bytecode check result.
    pub fn observe_code_len(&self, code_len: usize) -> DeploymentState {
        if code_len > 0 {
            self.observe(DeploymentState::Deployed)
        } else {
            self.observe(DeploymentState::NotDeployed)
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.get() == DeploymentState::Deployed
    }
}
