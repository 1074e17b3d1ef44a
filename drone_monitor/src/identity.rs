use crate::frame::FrameIdentity;
use std::collections::HashSet;

/// Remembers which frames have already been through a classification
/// attempt, so a still-displayed frame is never classified twice.
#[derive(Debug, Default)]
pub struct FrameIdentityTracker {
    evaluated: HashSet<FrameIdentity>,
}

impl FrameIdentityTracker {
    pub fn has_been_evaluated(&self, identity: &FrameIdentity) -> bool {
        self.evaluated.contains(identity)
    }

    pub fn mark_evaluated(&mut self, identity: &FrameIdentity) {
        if !self.evaluated.contains(identity) {
            self.evaluated.insert(identity.clone());
        }
    }

    /// Only the current frame can ever be re-offered, so older entries are
    /// dropped whenever a new frame becomes current.
    pub fn retain_only(&mut self, identity: &FrameIdentity) {
        self.evaluated.retain(|evaluated| evaluated == identity);
    }

    pub fn reset(&mut self) {
        self.evaluated.clear();
    }
}
