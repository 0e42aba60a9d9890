use std::collections::HashSet;
use std::sync::RwLock;

/// Records operator acknowledgements for stacks under the `flag` drift
/// policy. An acknowledgement is consumed by the next reconcile cycle.
#[derive(Default)]
pub struct AckStore {
    acks: RwLock<HashSet<String>>,
}

impl AckStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledge(&self, path: &str) {
        self.acks
            .write()
            .expect("poisoned ack lock")
            .insert(path.to_string());
    }

    pub fn is_acknowledged(&self, path: &str) -> bool {
        self.acks.read().expect("poisoned ack lock").contains(path)
    }

    pub fn clear(&self, path: &str) {
        self.acks.write().expect("poisoned ack lock").remove(path);
    }
}
