//! Crash injection points for publish

/// Points at which a publish can be interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Redo entries written and flushed, commit word not yet set
    AfterLogWrite,
    /// Payloads flushed, commit word not yet set
    AfterPayloadFlush,
    /// Commit word durable, metadata not yet updated
    AfterCommit,
    /// Metadata updated, commit word not yet cleared
    AfterApply,
}

impl CrashPoint {
    /// Get all crash points, in publish order
    pub fn all() -> Vec<CrashPoint> {
        vec![
            CrashPoint::AfterLogWrite,
            CrashPoint::AfterPayloadFlush,
            CrashPoint::AfterCommit,
            CrashPoint::AfterApply,
        ]
    }

    /// Get description of crash point
    pub fn description(&self) -> &'static str {
        match self {
            CrashPoint::AfterLogWrite => "After redo entries flushed, before payload flush",
            CrashPoint::AfterPayloadFlush => "After payload flush, before commit",
            CrashPoint::AfterCommit => "After commit word flushed, before apply",
            CrashPoint::AfterApply => "After apply, before the lane is cleared",
        }
    }

    /// True if the commit word was durable when the crash hit
    pub fn is_committed(&self) -> bool {
        matches!(self, CrashPoint::AfterCommit | CrashPoint::AfterApply)
    }

    /// Expected state of the batch after reopen
    pub fn expected_data_state(&self) -> DataState {
        if self.is_committed() {
            DataState::Present
        } else {
            DataState::NotPresent
        }
    }
}

/// Expected data state after recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    /// Batch must have no visible effect
    NotPresent,
    /// Batch must be fully visible
    Present,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_points_in_order() {
        let all = CrashPoint::all();
        assert_eq!(all.len(), 4);
        let committed: Vec<bool> = all.iter().map(CrashPoint::is_committed).collect();
        assert_eq!(committed, vec![false, false, true, true]);
    }

    #[test]
    fn test_descriptions_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for point in CrashPoint::all() {
            assert!(seen.insert(point.description()));
        }
    }
}
