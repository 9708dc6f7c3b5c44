//! Session lifecycle and the coordinator that drives it
//!
//! A [`Session`] is a cheap handle. All mutable state (arena, pool,
//! scheduler, configuration) lives on a dedicated coordinator thread and is
//! reached through a command channel, so several sessions can coexist in one
//! process without sharing anything.
//!
//! ```text
//! Session ──Command──▶ coordinator ──Message──▶ units
//!    ▲                     │   ▲                  │
//!    └──── Pending<T> ─────┘   └──── UnitEvent ───┘
//! ```
//!
//! `configure` and `derive` return a [`Pending`] that can be awaited or
//! waited on. `release` and `shutdown` complete before returning.

mod coordinator;
pub mod pending;
pub mod state;

use crossbeam::channel::{Sender, unbounded};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use zeroize::Zeroizing;

use crate::config::SessionLimits;
use crate::error::SessionError;
use crate::kdf::{Pbkdf2Sha256, Stretch};
use crate::parallel::{ThreadSpawner, UnitPool, UnitSpawner};
use crate::protocol::MixParams;
use coordinator::{Command, Coordinator};
use pending::Responder;

pub use pending::Pending;
pub use state::{SessionState, SessionStats};

/// scrypt requires `r * p < 2^30`.
const MAX_R_TIMES_P: u64 = 1 << 30;

/// Validated cost parameters of one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub n: u32,
    pub r: u32,
    pub p: usize,
    pub threads: usize,
}

impl SessionConfig {
    /// Validate `N`, `r`, `P` and the thread count against `limits`.
    ///
    /// When `threads` is `None` the count is derived from `P` with
    /// [`auto_thread_count`].
    pub fn new(
        limits: &SessionLimits,
        n: u32,
        r: u32,
        p: usize,
        threads: Option<usize>,
    ) -> Result<Self, SessionError> {
        if n < 2 || !n.is_power_of_two() {
            return Err(SessionError::InvalidConfig(format!(
                "N must be a power of two of at least 2, got {n}"
            )));
        }
        if r == 0 {
            return Err(SessionError::InvalidConfig("r must be at least 1".to_string()));
        }
        if u64::from(r).saturating_mul(p as u64) >= MAX_R_TIMES_P {
            return Err(SessionError::InvalidConfig(format!(
                "r * P must be below 2^30, got r={r} P={p}"
            )));
        }

        let block_len = 128usize
            .checked_mul(r as usize)
            .ok_or_else(|| SessionError::InvalidConfig("block length overflows".to_string()))?;
        if block_len.checked_mul(n as usize).is_none() || block_len.checked_mul(p).is_none() {
            return Err(SessionError::InvalidConfig(format!(
                "memory for N={n} r={r} P={p} overflows usize"
            )));
        }

        let max_thread = limits.resolved_max_thread();
        let threads = match threads {
            Some(t) if (1..=max_thread).contains(&t) => t,
            Some(t) => {
                return Err(SessionError::InvalidConfig(format!(
                    "thread count {t} is outside 1..={max_thread}"
                )));
            }
            None => auto_thread_count(p, max_thread),
        };

        Ok(Self { n, r, p, threads })
    }

    pub fn block_len(&self) -> usize {
        128 * self.r as usize
    }

    pub fn mix_params(&self) -> MixParams {
        MixParams {
            n: self.n,
            r: self.r,
        }
    }
}

/// Smallest thread count that keeps the number of rounds minimal:
/// `ceil(P / ceil(P / max_thread))`, and `0` when there are no blocks.
pub fn auto_thread_count(p: usize, max_thread: usize) -> usize {
    if p == 0 || max_thread == 0 {
        return 0;
    }
    p.div_ceil(p.div_ceil(max_thread))
}

/// Assembles a [`Session`] with custom collaborators.
pub struct SessionBuilder {
    limits: SessionLimits,
    spawner: Option<Box<dyn UnitSpawner>>,
    stretch: Option<Box<dyn Stretch>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            limits: SessionLimits::default(),
            spawner: None,
            stretch: None,
        }
    }

    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the default thread-backed units.
    pub fn spawner(mut self, spawner: impl UnitSpawner) -> Self {
        self.spawner = Some(Box::new(spawner));
        self
    }

    /// Replace the default PBKDF2-HMAC-SHA256 stretch.
    pub fn stretch(mut self, stretch: impl Stretch) -> Self {
        self.stretch = Some(Box::new(stretch));
        self
    }

    /// Validate the limits and start the coordinator thread.
    pub fn build(self) -> Result<Session, SessionError> {
        self.limits.validate()?;

        let (events_tx, events_rx) = unbounded();
        let (commands_tx, commands_rx) = unbounded();

        let spawner = self
            .spawner
            .unwrap_or_else(|| Box::new(ThreadSpawner::default()));
        let stretch = self.stretch.unwrap_or_else(|| Box::new(Pbkdf2Sha256));
        let pool = UnitPool::new(spawner, events_tx);

        let state = Arc::new(state::SharedState::new(SessionState::Unconfigured));
        let stats = Arc::new(state::StatsCell::default());
        let coordinator =
            Coordinator::new(self.limits, stretch, pool, state.clone(), stats.clone());
        let handle = coordinator::spawn(coordinator, commands_rx, events_rx)?;

        tracing::debug!("Session started with limits {:?}", self.limits);
        Ok(Session {
            limits: self.limits,
            commands: commands_tx,
            state,
            stats,
            coordinator: Mutex::new(Some(handle)),
        })
    }
}

/// Handle to one key-derivation session.
///
/// Dropping the handle shuts the session down.
pub struct Session {
    limits: SessionLimits,
    commands: Sender<Command>,
    state: Arc<state::SharedState>,
    stats: Arc<state::StatsCell>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(limits: SessionLimits) -> Result<Self, SessionError> {
        SessionBuilder::new().limits(limits).build()
    }

    pub fn with_defaults() -> Result<Self, SessionError> {
        Self::new(SessionLimits::default())
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Set cost parameters and bring `T` units to readiness.
    ///
    /// Resolves once the last unit has acknowledged its configuration.
    pub fn configure(&self, n: u32, r: u32, p: usize, threads: Option<usize>) -> Pending<()> {
        match SessionConfig::new(&self.limits, n, r, p, threads) {
            Ok(config) => self.submit(|reply| Command::Configure { config, reply }),
            Err(e) => Pending::resolved(Err(e)),
        }
    }

    /// Derive `output_len` bytes (default `max_dk_len`) from `password` and `salt`.
    pub fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        output_len: Option<usize>,
    ) -> Pending<Vec<u8>> {
        if let Err(e) = self.check_inputs(password, salt, output_len) {
            return Pending::resolved(Err(e));
        }
        let output_len = output_len.unwrap_or(self.limits.max_dk_len);
        let password = Zeroizing::new(password.to_vec());
        let salt = salt.to_vec();
        self.submit(|reply| Command::Derive {
            password,
            salt,
            output_len,
            reply,
        })
    }

    fn check_inputs(
        &self,
        password: &[u8],
        salt: &[u8],
        output_len: Option<usize>,
    ) -> Result<(), SessionError> {
        let limits = &self.limits;
        if password.len() > limits.max_pass_len {
            return Err(SessionError::PasswordTooLong {
                len: password.len(),
                max: limits.max_pass_len,
            });
        }
        if salt.len() > limits.max_salt_len {
            return Err(SessionError::SaltTooLong {
                len: salt.len(),
                max: limits.max_salt_len,
            });
        }
        if let Some(requested) = output_len
            && (requested == 0 || requested > limits.max_dk_len)
        {
            return Err(SessionError::InvalidOutputLength {
                requested,
                max: limits.max_dk_len,
            });
        }
        Ok(())
    }

    /// Drop every unit's scratch memory. Units stay alive and reallocate on
    /// their next task.
    ///
    /// Blocks until the coordinator has processed the request; do not call
    /// from inside an async runtime.
    pub fn release(&self) -> Result<(), SessionError> {
        self.submit(|reply| Command::Release { reply }).wait()
    }

    /// Terminate all units and release the arena. Any operation still in
    /// flight resolves with [`SessionError::Terminated`].
    pub fn shutdown(&self) -> Result<(), SessionError> {
        let Some(handle) = self
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(SessionError::Terminated);
        };

        let mut pending = self.submit(|reply| Command::Shutdown { reply });
        if handle.join().is_err() {
            tracing::error!("Coordinator thread panicked");
        }
        pending.try_result().unwrap_or(Err(SessionError::Terminated))
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    fn submit<T>(&self, command: impl FnOnce(Responder<T>) -> Command) -> Pending<T> {
        if self.state.load() == SessionState::Terminated {
            return Pending::resolved(Err(SessionError::Terminated));
        }
        let (reply, pending) = pending::pending();
        // A failed send drops the responder, which resolves as Terminated.
        if self.commands.send(command(reply)).is_err() {
            tracing::debug!("Coordinator is gone, command dropped");
        }
        pending
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self
            .coordinator
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            && let Err(e) = self.shutdown()
        {
            tracing::debug!("Shutdown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_thread: usize) -> SessionLimits {
        SessionLimits {
            max_thread,
            ..SessionLimits::default()
        }
    }

    #[test]
    fn test_auto_thread_count() {
        assert_eq!(auto_thread_count(0, 4), 0);
        assert_eq!(auto_thread_count(1, 4), 1);
        assert_eq!(auto_thread_count(4, 4), 4);
        // 5 blocks need two rounds either way; three units are enough.
        assert_eq!(auto_thread_count(5, 4), 3);
        assert_eq!(auto_thread_count(16, 4), 4);
        assert_eq!(auto_thread_count(9, 8), 5);
        assert_eq!(auto_thread_count(3, 8), 3);
    }

    #[test]
    fn test_config_rejects_bad_n() {
        for n in [0, 1, 3, 1000] {
            assert!(matches!(
                SessionConfig::new(&limits(4), n, 8, 1, None),
                Err(SessionError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_config_rejects_zero_r_and_huge_rp() {
        assert!(SessionConfig::new(&limits(4), 16, 0, 1, None).is_err());
        assert!(SessionConfig::new(&limits(4), 16, 1 << 20, 1 << 10, None).is_err());
    }

    #[test]
    fn test_config_thread_bounds() {
        assert!(SessionConfig::new(&limits(4), 16, 1, 8, Some(0)).is_err());
        assert!(SessionConfig::new(&limits(4), 16, 1, 8, Some(5)).is_err());

        let config = SessionConfig::new(&limits(4), 16, 1, 8, Some(4)).unwrap();
        assert_eq!(config.threads, 4);

        // More units than blocks is allowed.
        let config = SessionConfig::new(&limits(4), 16, 1, 1, Some(3)).unwrap();
        assert_eq!(config.threads, 3);
    }

    #[test]
    fn test_config_auto_threads() {
        let config = SessionConfig::new(&limits(4), 1024, 8, 16, None).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.block_len(), 1024);
        assert_eq!(config.mix_params(), MixParams { n: 1024, r: 8 });

        let config = SessionConfig::new(&limits(4), 2, 1, 0, None).unwrap();
        assert_eq!(config.threads, 0);
    }

    #[test]
    fn test_input_checks_are_synchronous() {
        let session = Session::with_defaults().unwrap();
        let err = session.derive(&[0u8; 65], b"salt", None).wait().unwrap_err();
        assert_eq!(err, SessionError::PasswordTooLong { len: 65, max: 64 });

        let err = session.derive(b"pw", b"salt", Some(0)).wait().unwrap_err();
        assert!(err.is_invalid_input());
        assert_eq!(session.state(), SessionState::Unconfigured);
    }

    #[test]
    fn test_derive_before_configure_is_invalid_state() {
        let session = Session::with_defaults().unwrap();
        let err = session.derive(b"pw", b"salt", None).wait().unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                operation: "derive",
                state: SessionState::Unconfigured
            }
        ));
    }

    #[test]
    fn test_shutdown_twice() {
        let session = Session::with_defaults().unwrap();
        session.shutdown().unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.shutdown(), Err(SessionError::Terminated));
        assert_eq!(
            session.configure(16, 1, 1, None).wait(),
            Err(SessionError::Terminated)
        );
    }

    #[test]
    fn test_invalid_limits_rejected_by_builder() {
        let limits = SessionLimits {
            max_dk_len: 16,
            ..SessionLimits::default()
        };
        assert!(matches!(
            SessionBuilder::new().limits(limits).build(),
            Err(SessionError::InvalidConfig(_))
        ));
    }
}
