use std::sync::atomic::{AtomicBool, Ordering};

/// The replication layer's view of whether this server instance may originate
/// outbound notifications.
pub trait Replica: Send + Sync {
    fn is_primary(&self) -> bool;
}

/// A server with no replicas; always primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standalone;

impl Replica for Standalone {
    fn is_primary(&self) -> bool {
        true
    }
}

/// Primary status set from outside, e.g. by a view-change handler.
#[derive(Debug)]
pub struct PrimaryFlag(AtomicBool);

impl PrimaryFlag {
    pub fn new(primary: bool) -> Self {
        Self(AtomicBool::new(primary))
    }

    pub fn set_primary(&self, primary: bool) {
        self.0.store(primary, Ordering::SeqCst);
    }
}

impl Replica for PrimaryFlag {
    fn is_primary(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
