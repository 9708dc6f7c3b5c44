use std::collections::HashMap;

use crate::error::SessionError;
use crate::protocol::UnitId;

/// Per-derive progress. Always `completed <= dispatched <= total`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub dispatched: usize,
    pub completed: usize,
}

/// What the coordinator should do after a block comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every block is mixed; run finalization.
    Finished,
    /// More blocks remain; offer the reporting unit another one.
    Continue,
}

/// Greedy pull scheduler for one derive call.
///
/// No plan is made up front: whichever unit becomes idle first claims the
/// next unassigned block index. The `unit -> block` map lives here, not on
/// the unit handles.
#[derive(Debug, Default)]
pub struct Scheduler {
    total: usize,
    counters: Counters,
    assignments: HashMap<UnitId, usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh derive over `total` blocks.
    pub fn begin(&mut self, total: usize) {
        self.total = total;
        self.counters = Counters::default();
        self.assignments.clear();
    }

    /// Drop all per-derive state.
    pub fn reset(&mut self) {
        self.begin(0);
    }

    /// Hand `unit` the next block index, if any remain and the unit is idle.
    pub fn claim(&mut self, unit: UnitId) -> Option<usize> {
        if self.counters.dispatched >= self.total || self.assignments.contains_key(&unit) {
            return None;
        }
        let index = self.counters.dispatched;
        self.counters.dispatched += 1;
        self.assignments.insert(unit, index);
        Some(index)
    }

    /// Record that `unit` returned `block_index`.
    pub fn complete(
        &mut self,
        unit: UnitId,
        block_index: usize,
    ) -> Result<Completion, SessionError> {
        match self.assignments.get(&unit) {
            Some(&assigned) if assigned == block_index => {}
            Some(&assigned) => {
                return Err(SessionError::ProtocolViolation {
                    unit,
                    detail: format!("returned block {block_index} but was assigned {assigned}"),
                });
            }
            None => {
                return Err(SessionError::ProtocolViolation {
                    unit,
                    detail: format!("returned block {block_index} without an assignment"),
                });
            }
        }

        self.assignments.remove(&unit);
        self.counters.completed += 1;
        debug_assert!(self.counters.completed <= self.counters.dispatched);

        if self.is_finished() {
            Ok(Completion::Finished)
        } else {
            Ok(Completion::Continue)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.counters.completed == self.total
    }

    pub fn assignment(&self, unit: UnitId) -> Option<usize> {
        self.assignments.get(&unit).copied()
    }

    /// Number of units currently holding a block.
    pub fn in_flight(&self) -> usize {
        self.assignments.len()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(s: &Scheduler, threads: usize) {
        let c = s.counters();
        assert!(c.completed <= c.dispatched, "{c:?}");
        assert!(c.dispatched <= s.total(), "{c:?}");
        assert!(s.in_flight() <= threads);
    }

    #[test]
    fn test_indices_assigned_monotonically() {
        let mut s = Scheduler::new();
        s.begin(3);
        assert_eq!(s.claim(UnitId(5)), Some(0));
        assert_eq!(s.claim(UnitId(2)), Some(1));
        assert_eq!(s.claim(UnitId(9)), Some(2));
        assert_eq!(s.claim(UnitId(1)), None);
    }

    #[test]
    fn test_busy_unit_cannot_claim_twice() {
        let mut s = Scheduler::new();
        s.begin(4);
        assert_eq!(s.claim(UnitId(0)), Some(0));
        assert_eq!(s.claim(UnitId(0)), None);
        assert_eq!(s.counters().dispatched, 1);
    }

    #[test]
    fn test_greedy_pull_with_uneven_units() {
        let threads = 2;
        let (fast, slow) = (UnitId(0), UnitId(1));
        let mut s = Scheduler::new();
        s.begin(5);

        assert_eq!(s.claim(fast), Some(0));
        assert_eq!(s.claim(slow), Some(1));
        assert_invariants(&s, threads);

        // The fast unit keeps pulling while the slow one is still busy.
        for expected in 2..5 {
            let held = s.assignment(fast).unwrap();
            assert_eq!(s.complete(fast, held).unwrap(), Completion::Continue);
            assert_eq!(s.claim(fast), Some(expected));
            assert_invariants(&s, threads);
        }

        assert_eq!(s.complete(fast, 4).unwrap(), Completion::Continue);
        assert_eq!(s.claim(fast), None);
        assert_eq!(s.complete(slow, 1).unwrap(), Completion::Finished);
        assert_eq!(
            s.counters(),
            Counters {
                dispatched: 5,
                completed: 5
            }
        );
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn test_wrong_block_is_protocol_violation() {
        let mut s = Scheduler::new();
        s.begin(2);
        s.claim(UnitId(0));

        let err = s.complete(UnitId(0), 1).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { unit: UnitId(0), .. }));

        let err = s.complete(UnitId(3), 0).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { unit: UnitId(3), .. }));
        assert_eq!(s.counters().completed, 0);
    }

    #[test]
    fn test_zero_blocks_is_immediately_finished() {
        let mut s = Scheduler::new();
        s.begin(0);
        assert!(s.is_finished());
        assert_eq!(s.claim(UnitId(0)), None);
    }

    #[test]
    fn test_reset_clears_assignments() {
        let mut s = Scheduler::new();
        s.begin(2);
        s.claim(UnitId(0));
        s.reset();
        assert_eq!(s.assignment(UnitId(0)), None);
        assert_eq!(s.counters(), Counters::default());
    }
}
