//! Folder change short-circuit.

/// Remembers the last folder change counter a scheduler cycle acted on.
///
/// A cycle is skipped when neither the local nor any remote index of the
/// folder changed since the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeTracker {
    last: Option<u64>,
}

impl ChangeTracker {
    /// Create a tracker that reports the first observation as a change.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and report whether it differs from the last value.
    pub fn changed(&mut self, current: u64) -> bool {
        if self.last == Some(current) {
            return false;
        }
        self.last = Some(current);
        true
    }

    /// Forget the last value so the next cycle runs unconditionally.
    ///
    /// Called after a cycle that left work undone.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
