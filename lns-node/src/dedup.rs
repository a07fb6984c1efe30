use crate::coordination::DedupVerdict;
use crate::device::DeduplicationMode;

/// What the dispatcher does with an uplink after coordination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeduplicationAction {
    /// Continue normally
    Process,
    /// Complete as duplicate; nothing is applied
    Drop,
    /// Continue as the primary copy of the frame
    MarkPrimary,
    /// Continue for side effects only; customer-facing telemetry is suppressed
    MarkDuplicate,
}

impl DeduplicationAction {
    /// Whether the uplink continues to session mutation
    pub fn continues(self) -> bool {
        !matches!(self, DeduplicationAction::Drop)
    }

    pub fn is_marked_duplicate(self) -> bool {
        matches!(self, DeduplicationAction::MarkDuplicate)
    }
}

/// Maps a device's deduplication mode and the coordination verdict to an action
#[derive(Debug, Default, Clone, Copy)]
pub struct DeduplicationStrategy;

impl DeduplicationStrategy {
    pub fn evaluate(mode: DeduplicationMode, verdict: &DedupVerdict) -> DeduplicationAction {
        match (mode, verdict.is_duplicate) {
            (DeduplicationMode::None, _) => DeduplicationAction::Process,
            (DeduplicationMode::Drop, false) => DeduplicationAction::Process,
            (DeduplicationMode::Drop, true) => DeduplicationAction::Drop,
            (DeduplicationMode::Mark, false) => DeduplicationAction::MarkPrimary,
            (DeduplicationMode::Mark, true) => DeduplicationAction::MarkDuplicate,
        }
    }
}
