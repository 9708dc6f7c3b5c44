use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Lifecycle of a session.
///
/// ```text
/// Unconfigured ─configure─▶ Configuring ─all ready─▶ Ready ─derive─▶ Deriving
///      ▲                          │                   ▲  │              │
///      └────── unit failure ──────┘                   │  release        │
///                                                     │  ▼              │
///                                                  Released ◀───────────┘ (finalize → Ready)
/// any ─shutdown─▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Unconfigured = 0,
    Configuring = 1,
    Ready = 2,
    Deriving = 3,
    Released = 4,
    Terminated = 5,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Unconfigured,
            1 => SessionState::Configuring,
            2 => SessionState::Ready,
            3 => SessionState::Deriving,
            4 => SessionState::Released,
            _ => SessionState::Terminated,
        }
    }

    /// States from which a derive may start.
    pub fn can_derive(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Released)
    }

    /// States from which a (re)configure may start.
    pub fn can_configure(self) -> bool {
        matches!(
            self,
            SessionState::Unconfigured | SessionState::Ready | SessionState::Released
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configuring => "configuring",
            SessionState::Ready => "ready",
            SessionState::Deriving => "deriving",
            SessionState::Released => "released",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// State snapshot readable from the session handle; written only by the coordinator.
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Counters accumulated over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub derives_completed: u64,
    pub blocks_mixed: u64,
    pub progress_acked: u64,
    pub arena_reallocations: u64,
    pub units_spawned: u64,
}

/// Statistics tracked atomically; the coordinator writes, handles read.
#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    derives_completed: AtomicU64,
    blocks_mixed: AtomicU64,
    progress_acked: AtomicU64,
    arena_reallocations: AtomicU64,
    units_spawned: AtomicU64,
}

impl StatsCell {
    pub(crate) fn increment_derives(&self) {
        self.derives_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_blocks(&self) {
        self.blocks_mixed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_acks(&self) {
        self.progress_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_reallocations(&self) {
        self.arena_reallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_units(&self, count: usize) {
        self.units_spawned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            derives_completed: self.derives_completed.load(Ordering::Relaxed),
            blocks_mixed: self.blocks_mixed.load(Ordering::Relaxed),
            progress_acked: self.progress_acked.load(Ordering::Relaxed),
            arena_reallocations: self.arena_reallocations.load(Ordering::Relaxed),
            units_spawned: self.units_spawned.load(Ordering::Relaxed),
        }
    }
}
