use crossbeam::channel::Sender;
use std::collections::{HashMap, HashSet};

use super::unit::{ExecutionUnit, UnitSpawner};
use crate::error::SessionError;
use crate::protocol::{Message, MixParams, UnitEvent, UnitId};

/// Outcome of a `Ready` reply during a configure round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Reply to an earlier round, or not a round member.
    Stale,
    /// Counted; more units still outstanding.
    Waiting { ready: usize, expected: usize },
    /// The last expected unit just became ready.
    Complete,
}

/// Fixed-size, reusable set of execution units.
///
/// Slots are filled lazily and keep their units across configure and derive
/// calls. A slot is emptied only when its unit is evicted for a protocol
/// violation, and refilled on the next `ensure_size`.
pub struct UnitPool {
    spawner: Box<dyn UnitSpawner>,
    events: Sender<UnitEvent>,
    slots: Vec<Option<Box<dyn ExecutionUnit>>>,
    next_id: u64,

    // Configure bookkeeping. A unit may have several Configure messages in
    // flight; only its reply to the latest one counts.
    outstanding: HashMap<UnitId, usize>,
    round: HashSet<UnitId>,
    ready: usize,
    expected: usize,
}

impl UnitPool {
    pub fn new(spawner: Box<dyn UnitSpawner>, events: Sender<UnitEvent>) -> Self {
        Self {
            spawner,
            events,
            slots: Vec::new(),
            next_id: 0,
            outstanding: HashMap::new(),
            round: HashSet::new(),
            ready: 0,
            expected: 0,
        }
    }

    /// Make sure the first `n` slots hold live units. Returns how many were spawned.
    pub fn ensure_size(&mut self, n: usize) -> Result<usize, SessionError> {
        if self.slots.len() < n {
            self.slots.resize_with(n, || None);
        }

        let mut spawned = 0;
        for slot in self.slots.iter_mut().take(n) {
            if slot.is_none() {
                let id = UnitId(self.next_id);
                self.next_id += 1;
                *slot = Some(self.spawner.spawn(id, self.events.clone())?);
                spawned += 1;
            }
        }

        if spawned > 0 {
            tracing::debug!("Pool grew by {} units to {}", spawned, self.len());
        }
        Ok(spawned)
    }

    /// Ids of the first `n` units, in slot order.
    pub fn active(&self, n: usize) -> Vec<UnitId> {
        self.slots
            .iter()
            .take(n)
            .flatten()
            .map(|unit| unit.id())
            .collect()
    }

    /// Number of live units.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.find(id).is_some()
    }

    fn find(&self, id: UnitId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|unit| unit.id() == id))
    }

    pub fn send(&mut self, id: UnitId, message: Message) -> Result<(), SessionError> {
        let unit = self
            .slots
            .iter_mut()
            .flatten()
            .find(|unit| unit.id() == id)
            .ok_or_else(|| SessionError::ProtocolViolation {
                unit: id,
                detail: "unit is not in the pool".to_string(),
            })?;
        tracing::trace!("-> {} {}", id, message.kind());
        unit.send(message)
    }

    /// Start a configure round over the first `count` units, spawning any
    /// that are missing. Readiness is tracked through [`UnitPool::mark_ready`].
    pub fn begin_round(&mut self, count: usize, params: MixParams) -> Result<(), SessionError> {
        self.ensure_size(count)?;

        self.round.clear();
        self.ready = 0;
        self.expected = count;

        for id in self.active(count) {
            self.send(id, Message::Configure(params))?;
            *self.outstanding.entry(id).or_insert(0) += 1;
            self.round.insert(id);
        }
        Ok(())
    }

    /// Account for a `Ready` reply.
    pub fn mark_ready(&mut self, id: UnitId) -> Readiness {
        if !self.settle(id) || !self.round.remove(&id) {
            return Readiness::Stale;
        }
        self.ready += 1;
        if self.ready == self.expected {
            Readiness::Complete
        } else {
            Readiness::Waiting {
                ready: self.ready,
                expected: self.expected,
            }
        }
    }

    /// Account for a configure-time `Fail`. Returns `true` when it answers the
    /// current round.
    pub fn mark_failed(&mut self, id: UnitId) -> bool {
        self.settle(id) && self.round.remove(&id)
    }

    // Consume one outstanding Configure; true when it was the unit's latest.
    fn settle(&mut self, id: UnitId) -> bool {
        match self.outstanding.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.outstanding.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Send `Free` to every live unit.
    pub fn free_all(&mut self) {
        for unit in self.slots.iter_mut().flatten() {
            if let Err(e) = unit.send(Message::Free) {
                tracing::warn!("Could not free unit {}: {}", unit.id(), e);
            }
        }
    }

    /// Terminate one unit and empty its slot.
    pub fn evict(&mut self, id: UnitId) {
        if let Some(index) = self.find(id)
            && let Some(unit) = self.slots[index].take()
        {
            unit.terminate();
        }
        self.outstanding.remove(&id);
        self.round.remove(&id);
    }

    /// Terminate every unit. The pool is empty afterwards.
    pub fn shutdown(&mut self) {
        for unit in self.slots.drain(..).flatten() {
            unit.terminate();
        }
        self.outstanding.clear();
        self.round.clear();
        self.ready = 0;
        self.expected = 0;
    }
}

impl Drop for UnitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
