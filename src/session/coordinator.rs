use crossbeam::channel::Receiver;
use std::ops::ControlFlow;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::SessionConfig;
use super::pending::Responder;
use super::state::{SessionState, SharedState, StatsCell};
use crate::arena::{Arena, ArenaLayout};
use crate::config::SessionLimits;
use crate::error::SessionError;
use crate::kdf::Stretch;
use crate::parallel::{Completion, Readiness, Scheduler, UnitPool};
use crate::protocol::{Message, UnitEvent, UnitId};

/// Minimum number of bytes the final stretch always produces.
const MIN_INTERNAL_DK_LEN: usize = 32;

/// Requests from a [`super::Session`] handle to its coordinator thread.
pub(crate) enum Command {
    Configure {
        config: SessionConfig,
        reply: Responder<()>,
    },
    Derive {
        password: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
        output_len: usize,
        reply: Responder<Vec<u8>>,
    },
    Release {
        reply: Responder<()>,
    },
    Shutdown {
        reply: Responder<()>,
    },
}

/// Inputs of the derive currently in flight.
struct DeriveJob {
    pass_len: usize,
    output_len: usize,
    reply: Responder<Vec<u8>>,
}

/// Owner of all mutable session state.
///
/// Runs on one thread and is the only writer of the arena, the scheduler
/// counters and unit assignments. Unit replies and handle commands are both
/// processed here, one at a time.
pub(crate) struct Coordinator {
    limits: SessionLimits,
    stretch: Box<dyn Stretch>,
    pool: UnitPool,
    arena: Option<Arena>,
    config: Option<SessionConfig>,
    scheduler: Scheduler,
    state: SessionState,
    shared_state: Arc<SharedState>,
    stats: Arc<StatsCell>,
    configuring: Option<Responder<()>>,
    deriving: Option<DeriveJob>,
}

impl Coordinator {
    pub(crate) fn new(
        limits: SessionLimits,
        stretch: Box<dyn Stretch>,
        pool: UnitPool,
        shared_state: Arc<SharedState>,
        stats: Arc<StatsCell>,
    ) -> Self {
        Self {
            limits,
            stretch,
            pool,
            arena: None,
            config: None,
            scheduler: Scheduler::new(),
            state: SessionState::Unconfigured,
            shared_state,
            stats,
            configuring: None,
            deriving: None,
        }
    }

    /// Event loop. Returns after shutdown or once every handle is gone.
    pub(crate) fn run(mut self, commands: Receiver<Command>, events: Receiver<UnitEvent>) {
        tracing::debug!("Coordinator started");
        loop {
            let flow = crossbeam::select! {
                recv(commands) -> command => match command {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        tracing::debug!("Session handle dropped, shutting down");
                        self.shutdown();
                        ControlFlow::Break(())
                    }
                },
                recv(events) -> event => match event {
                    Ok(event) => {
                        self.handle_event(event);
                        ControlFlow::Continue(())
                    }
                    Err(_) => {
                        tracing::error!("Unit event channel closed unexpectedly");
                        self.shutdown();
                        ControlFlow::Break(())
                    }
                },
            };
            if flow.is_break() {
                break;
            }
        }
        tracing::debug!("Coordinator stopped");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::trace!("Session state {} -> {}", self.state, state);
        }
        self.state = state;
        self.shared_state.store(state);
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Configure { config, reply } => self.configure(config, reply),
            Command::Derive {
                password,
                salt,
                output_len,
                reply,
            } => self.derive(&password, &salt, output_len, reply),
            Command::Release { reply } => reply.resolve(self.release()),
            Command::Shutdown { reply } => {
                self.shutdown();
                reply.resolve(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ---------------------------------------------------------------------
    // configure
    // ---------------------------------------------------------------------

    fn configure(&mut self, config: SessionConfig, reply: Responder<()>) {
        if !self.state.can_configure() {
            reply.resolve(Err(self.invalid_state("configure")));
            return;
        }

        let layout = match ArenaLayout::plan(&self.limits, config.block_len(), config.p) {
            Ok(layout) => layout,
            Err(e) => {
                reply.resolve(Err(e));
                return;
            }
        };

        match self.arena.as_mut() {
            Some(arena) => {
                if arena.prepare(layout) {
                    self.stats.increment_reallocations();
                }
            }
            None => {
                tracing::debug!("Allocating arena of {} bytes", layout.total);
                self.arena = Some(Arena::new(layout));
                self.stats.increment_reallocations();
            }
        }

        self.scheduler.reset();
        self.config = Some(config);
        tracing::debug!(
            "Configuring N={} r={} P={} with {} units",
            config.n,
            config.r,
            config.p,
            config.threads
        );

        let started = self
            .pool
            .ensure_size(config.threads)
            .inspect(|spawned| self.stats.add_units(*spawned))
            .and_then(|_| self.pool.begin_round(config.threads, config.mix_params()));
        if let Err(e) = started {
            tracing::error!("Failed to start execution units: {}", e);
            self.config = None;
            self.set_state(SessionState::Unconfigured);
            reply.resolve(Err(e));
            return;
        }

        if config.threads == 0 {
            self.set_state(SessionState::Ready);
            tracing::info!("Session ready with no execution units");
            reply.resolve(Ok(()));
        } else {
            self.set_state(SessionState::Configuring);
            self.configuring = Some(reply);
        }
    }

    fn on_ready(&mut self, unit: UnitId) {
        match self.pool.mark_ready(unit) {
            Readiness::Stale => {
                tracing::debug!("Discarding stale ready from unit {}", unit);
            }
            Readiness::Waiting { ready, expected } => {
                tracing::trace!("Unit {} ready ({}/{})", unit, ready, expected);
            }
            Readiness::Complete if self.state != SessionState::Configuring => {
                tracing::warn!("Discarding ready from unit {} after configure ended", unit);
            }
            Readiness::Complete => {
                self.set_state(SessionState::Ready);
                tracing::info!(
                    "Session ready with {} units",
                    self.config.map_or(0, |c| c.threads)
                );
                if let Some(reply) = self.configuring.take() {
                    reply.resolve(Ok(()));
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // derive
    // ---------------------------------------------------------------------

    fn derive(
        &mut self,
        password: &[u8],
        salt: &[u8],
        output_len: usize,
        reply: Responder<Vec<u8>>,
    ) {
        if !self.state.can_derive() {
            reply.resolve(Err(self.invalid_state("derive")));
            return;
        }
        let Some(config) = self.config else {
            reply.resolve(Err(self.invalid_state("derive")));
            return;
        };
        let Some(arena) = self.arena.as_mut() else {
            reply.resolve(Err(SessionError::InvalidState {
                operation: "derive",
                state: self.state,
            }));
            return;
        };

        // [B0 .. B(P-1)] <- stretch(password, salt)
        arena.write_inputs(password, salt);
        self.stretch.stretch(password, salt, arena.blocks_mut());

        self.scheduler.begin(config.p);
        self.deriving = Some(DeriveJob {
            pass_len: password.len(),
            output_len,
            reply,
        });
        self.set_state(SessionState::Deriving);
        tracing::debug!("Derive started over {} blocks", config.p);

        if config.p == 0 {
            self.finalize();
            return;
        }

        let units = self.pool.active(config.threads);
        if units.is_empty() {
            self.fail_derive(SessionError::InvalidConfig(
                "no execution units available".to_string(),
            ));
            return;
        }
        for unit in units {
            if let Err(e) = self.dispatch(unit) {
                self.fail_derive(e);
                return;
            }
        }
    }

    /// Give `unit` the next block, if any remain.
    fn dispatch(&mut self, unit: UnitId) -> Result<(), SessionError> {
        let Some(block_index) = self.scheduler.claim(unit) else {
            return Ok(());
        };
        let block = match self.arena.as_ref() {
            Some(arena) => arena.take_block(block_index),
            None => return Err(self.invalid_state("dispatch")),
        };
        tracing::debug!("Dispatching block {} to unit {}", block_index, unit);
        self.pool.send(unit, Message::Task { block_index, block })
    }

    fn on_done(&mut self, unit: UnitId, block_index: usize, block: Vec<u8>) {
        if self.state != SessionState::Deriving || self.scheduler.assignment(unit).is_none() {
            tracing::warn!(
                "Discarding block {} from unit {} outside an active assignment",
                block_index,
                unit
            );
            return;
        }

        let expected_len = self.config.map_or(0, |c| c.block_len());
        if block.len() != expected_len {
            self.protocol_violation(SessionError::ProtocolViolation {
                unit,
                detail: format!("returned {} bytes, expected {}", block.len(), expected_len),
            });
            return;
        }

        let completion = match self.scheduler.complete(unit, block_index) {
            Ok(completion) => completion,
            Err(e) => {
                self.protocol_violation(e);
                return;
            }
        };

        // B'i overwrites Bi at its fixed offset, whatever the completion order.
        let stored = match self.arena.as_mut() {
            Some(arena) => arena.put_block(block_index, &block),
            None => Err(SessionError::Terminated),
        };
        drop(block);
        if let Err(e) = stored {
            self.fail_derive(e);
            return;
        }
        self.stats.increment_blocks();

        let counters = self.scheduler.counters();
        tracing::debug!(
            "Unit {} finished block {} ({}/{})",
            unit,
            block_index,
            counters.completed,
            self.scheduler.total()
        );

        match completion {
            Completion::Finished => self.finalize(),
            Completion::Continue => {
                if let Err(e) = self.dispatch(unit) {
                    self.fail_derive(e);
                }
            }
        }
    }

    fn finalize(&mut self) {
        let Some(job) = self.deriving.take() else {
            return;
        };
        let Some(arena) = self.arena.as_mut() else {
            job.reply.resolve(Err(SessionError::Terminated));
            return;
        };

        // dk <- stretch(password, B'0 || ... || B'(P-1))
        let internal_len = std::cmp::max(job.output_len, MIN_INTERNAL_DK_LEN);
        let (password, blocks, dk) = arena.finalize_regions(job.pass_len);
        self.stretch.stretch(password, blocks, &mut dk[..internal_len]);

        let key = arena.dk(job.output_len).to_vec();
        arena.wipe_secrets();

        self.scheduler.reset();
        self.set_state(SessionState::Ready);
        self.stats.increment_derives();
        tracing::info!("Derived {} byte key", key.len());
        job.reply.resolve(Ok(key));
    }

    fn fail_derive(&mut self, error: SessionError) {
        tracing::error!("Derive aborted: {}", error);
        self.scheduler.reset();
        if let Some(arena) = self.arena.as_mut() {
            arena.wipe_secrets();
        }
        self.set_state(SessionState::Unconfigured);
        if let Some(job) = self.deriving.take() {
            job.reply.resolve(Err(error));
        }
    }

    // ---------------------------------------------------------------------
    // unit replies
    // ---------------------------------------------------------------------

    fn handle_event(&mut self, event: UnitEvent) {
        let UnitEvent { unit, message } = event;
        tracing::trace!("<- {} {}", unit, message.kind());

        if !self.pool.contains(unit) {
            tracing::debug!("Ignoring {} from retired unit {}", message.kind(), unit);
            return;
        }

        match message {
            Message::Ready => self.on_ready(unit),
            Message::Done { block_index, block } => self.on_done(unit, block_index, block),
            Message::Fail {
                block_index,
                reason,
            } => self.on_fail(unit, block_index, reason),
            Message::Progress(percent) => {
                tracing::trace!("Unit {} at {}%", unit, percent);
                match self.pool.send(unit, Message::Ack) {
                    Ok(()) => self.stats.increment_acks(),
                    Err(e) => tracing::debug!("Could not ack unit {}: {}", unit, e),
                }
            }
            other => self.protocol_violation(SessionError::ProtocolViolation {
                unit,
                detail: format!("unexpected {} message", other.kind()),
            }),
        }
    }

    fn on_fail(&mut self, unit: UnitId, block_index: Option<usize>, reason: String) {
        match block_index {
            None => {
                if !self.pool.mark_failed(unit) || self.state != SessionState::Configuring {
                    tracing::warn!("Discarding stale configure failure from unit {}", unit);
                    return;
                }
                tracing::error!("Unit {} could not allocate: {}", unit, reason);
                self.config = None;
                self.set_state(SessionState::Unconfigured);
                if let Some(reply) = self.configuring.take() {
                    reply.resolve(Err(SessionError::allocation()));
                }
            }
            Some(index) => {
                if self.state != SessionState::Deriving
                    || self.scheduler.assignment(unit) != Some(index)
                {
                    tracing::warn!(
                        "Discarding stale failure of block {} from unit {}",
                        index,
                        unit
                    );
                    return;
                }
                tracing::error!("Unit {} failed block {}: {}", unit, index, reason);
                self.fail_derive(SessionError::allocation());
            }
        }
    }

    /// Fatal for the offending unit; fails whatever operation is in flight.
    fn protocol_violation(&mut self, error: SessionError) {
        tracing::error!("{}", error);
        if let SessionError::ProtocolViolation { unit, .. } = &error {
            self.pool.evict(*unit);
        }

        match self.state {
            SessionState::Deriving => self.fail_derive(error),
            SessionState::Configuring => {
                self.config = None;
                self.set_state(SessionState::Unconfigured);
                if let Some(reply) = self.configuring.take() {
                    reply.resolve(Err(error));
                }
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------------
    // release / shutdown
    // ---------------------------------------------------------------------

    fn release(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready | SessionState::Released => {
                self.pool.free_all();
                self.scheduler.reset();
                self.set_state(SessionState::Released);
            }
            SessionState::Unconfigured => {
                // Units may still hold scratch after a failure; stays unconfigured.
                self.pool.free_all();
                self.scheduler.reset();
            }
            _ => return Err(self.invalid_state("release")),
        }
        tracing::debug!("Released unit working memory");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
        self.arena = None;
        self.config = None;
        self.scheduler.reset();
        self.set_state(SessionState::Terminated);

        if let Some(reply) = self.configuring.take() {
            reply.resolve(Err(SessionError::Terminated));
        }
        if let Some(job) = self.deriving.take() {
            job.reply.resolve(Err(SessionError::Terminated));
        }
        tracing::info!("Session terminated");
    }
}

/// Spawn the coordinator thread.
pub(crate) fn spawn(
    coordinator: Coordinator,
    commands: Receiver<Command>,
    events: Receiver<UnitEvent>,
) -> Result<std::thread::JoinHandle<()>, SessionError> {
    std::thread::Builder::new()
        .name("parascrypt-coordinator".to_string())
        .spawn(move || coordinator.run(commands, events))
        .map_err(|e| SessionError::Spawn(e.to_string()))
}
