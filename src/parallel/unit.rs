use crossbeam::channel::{Receiver, Sender, unbounded};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::error::SessionError;
use crate::kdf::{BlockMixer, ScryptMixer};
use crate::protocol::{Message, MixParams, UnitEvent, UnitId};

/// An isolated worker that mixes one block at a time.
///
/// Replies are not returned from `send`; they arrive on the event channel the
/// unit was spawned with, tagged with [`ExecutionUnit::id`].
pub trait ExecutionUnit: Send {
    fn id(&self) -> UnitId;

    /// Queue a message on the unit's inbox. Payloads move into the unit.
    fn send(&mut self, message: Message) -> Result<(), SessionError>;

    /// Destroy the unit. No further replies are guaranteed.
    fn terminate(self: Box<Self>);
}

/// Creates execution units for a pool.
pub trait UnitSpawner: Send + 'static {
    fn spawn(
        &mut self,
        id: UnitId,
        events: Sender<UnitEvent>,
    ) -> Result<Box<dyn ExecutionUnit>, SessionError>;
}

/// Spawns each unit on its own OS thread with a crossbeam inbox.
pub struct ThreadSpawner<M: BlockMixer = ScryptMixer> {
    mixer: Arc<M>,
}

impl<M: BlockMixer> ThreadSpawner<M> {
    pub fn new(mixer: M) -> Self {
        Self {
            mixer: Arc::new(mixer),
        }
    }
}

impl Default for ThreadSpawner<ScryptMixer> {
    fn default() -> Self {
        Self::new(ScryptMixer)
    }
}

impl<M: BlockMixer> UnitSpawner for ThreadSpawner<M> {
    fn spawn(
        &mut self,
        id: UnitId,
        events: Sender<UnitEvent>,
    ) -> Result<Box<dyn ExecutionUnit>, SessionError> {
        let (inbox_tx, inbox_rx) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = UnitWorker {
            id,
            mixer: self.mixer.clone(),
            cancelled: cancelled.clone(),
            events,
            params: None,
            scratch: None,
        };

        let handle = std::thread::Builder::new()
            .name(format!("parascrypt-unit-{}", id.0))
            .spawn(move || worker.run(inbox_rx))
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        tracing::debug!("Spawned execution unit {}", id);
        Ok(Box::new(ThreadUnit {
            id,
            inbox: inbox_tx,
            cancelled,
            handle: Some(handle),
        }))
    }
}

/// Coordinator-side handle of a thread-backed unit.
pub struct ThreadUnit {
    id: UnitId,
    inbox: Sender<Message>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionUnit for ThreadUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn send(&mut self, message: Message) -> Result<(), SessionError> {
        self.inbox
            .send(message)
            .map_err(|_| SessionError::ProtocolViolation {
                unit: self.id,
                detail: "unit thread is no longer running".to_string(),
            })
    }

    fn terminate(mut self: Box<Self>) {
        // The flag aborts a running mix at its next progress step; dropping
        // the inbox then ends the worker loop. The thread is detached.
        self.cancelled.store(true, Ordering::Release);
        drop(self.handle.take());
        tracing::debug!("Terminated execution unit {}", self.id);
    }
}

/// State owned by the unit's thread.
struct UnitWorker<M: BlockMixer> {
    id: UnitId,
    mixer: Arc<M>,
    cancelled: Arc<AtomicBool>,
    events: Sender<UnitEvent>,
    params: Option<MixParams>,
    scratch: Option<M::Scratch>,
}

impl<M: BlockMixer> UnitWorker<M> {
    fn run(mut self, inbox: Receiver<Message>) {
        while let Ok(message) = inbox.recv() {
            if self.cancelled.load(Ordering::Acquire) {
                break;
            }
            let reply = match message {
                Message::Configure(params) => Some(self.configure(params)),
                Message::Task { block_index, block } => match self.task(block_index, block) {
                    ControlFlow::Continue(reply) => Some(reply),
                    ControlFlow::Break(()) => break,
                },
                Message::Free => {
                    self.scratch = None;
                    None
                }
                Message::Ack => None,
                other => {
                    tracing::warn!("Unit {} ignoring unexpected {} message", self.id, other.kind());
                    None
                }
            };

            if let Some(reply) = reply
                && self.events.send(UnitEvent::new(self.id, reply)).is_err()
            {
                break; // Coordinator gone
            }
        }
        tracing::trace!("Unit {} exiting", self.id);
    }

    fn configure(&mut self, params: MixParams) -> Message {
        self.params = Some(params);
        self.scratch = None;
        match self.mixer.prepare(params) {
            Ok(scratch) => {
                self.scratch = Some(scratch);
                Message::Ready
            }
            Err(e) => Message::Fail {
                block_index: None,
                reason: e.to_string(),
            },
        }
    }

    /// `Break` when the mix was abandoned because the unit is going away.
    fn task(&mut self, block_index: usize, mut block: Vec<u8>) -> ControlFlow<(), Message> {
        let Some(params) = self.params else {
            return ControlFlow::Continue(Message::Fail {
                block_index: Some(block_index),
                reason: "task received before configure".to_string(),
            });
        };

        // Scratch is dropped by `Free`; reallocate on the next task.
        if self.scratch.is_none() {
            match self.mixer.prepare(params) {
                Ok(scratch) => self.scratch = Some(scratch),
                Err(e) => {
                    return ControlFlow::Continue(Message::Fail {
                        block_index: Some(block_index),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let id = self.id;
        let events = &self.events;
        let cancelled = &self.cancelled;
        if let Some(scratch) = self.scratch.as_mut() {
            self.mixer.mix(&mut block, params, scratch, &mut |percent| {
                if cancelled.load(Ordering::Acquire) {
                    return ControlFlow::Break(());
                }
                // Only quarter points go out; a closed channel means the
                // coordinator is gone.
                if percent % 25 == 0
                    && events
                        .send(UnitEvent::new(id, Message::Progress(percent)))
                        .is_err()
                {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
        }

        ControlFlow::Continue(Message::Done { block_index, block })
    }
}
