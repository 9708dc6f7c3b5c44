#![allow(dead_code)]

use crossbeam::channel::Sender;
use parascrypt::SessionError;
use parascrypt::kdf::{BlockMixer, MixError, ScryptMixer};
use parascrypt::parallel::{ExecutionUnit, ThreadSpawner, UnitSpawner};
use parascrypt::protocol::{Message, MixParams, UnitEvent, UnitId};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(30);

/// Reference key from the `scrypt` crate.
pub fn reference_scrypt(
    password: &[u8],
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
    len: usize,
) -> Vec<u8> {
    let params = scrypt::Params::new(log_n, r, p, len).expect("valid scrypt params");
    let mut out = vec![0u8; len];
    scrypt::scrypt(password, salt, &params, &mut out).expect("valid output length");
    out
}

/// Poll `condition` until it holds or the timeout expires.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------------
// Scripted units: answer Configure at once, hold every Task until released
// ---------------------------------------------------------------------------

pub struct HeldTask {
    pub unit: UnitId,
    pub block_index: usize,
    block: Vec<u8>,
    params: MixParams,
    events: Sender<UnitEvent>,
}

#[derive(Clone, Default)]
pub struct Script {
    held: Arc<Mutex<Vec<HeldTask>>>,
}

impl Script {
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn held_indices(&self) -> Vec<usize> {
        self.held.lock().unwrap().iter().map(|t| t.block_index).collect()
    }

    /// Mix and answer the held task for `block_index`.
    pub fn complete(&self, block_index: usize) {
        let task = {
            let mut held = self.held.lock().unwrap();
            let pos = held
                .iter()
                .position(|t| t.block_index == block_index)
                .expect("block is held");
            held.remove(pos)
        };

        let mixer = ScryptMixer;
        let mut scratch = mixer.prepare(task.params).unwrap();
        let mut block = task.block;
        let _ = mixer.mix(&mut block, task.params, &mut scratch, &mut |_| {
            ControlFlow::Continue(())
        });
        task.events
            .send(UnitEvent::new(
                task.unit,
                Message::Done {
                    block_index: task.block_index,
                    block,
                },
            ))
            .unwrap();
    }

    /// Answer a held task with a raw message instead of its result.
    pub fn answer_raw(&self, block_index: usize, message: Message) {
        let task = {
            let mut held = self.held.lock().unwrap();
            let pos = held
                .iter()
                .position(|t| t.block_index == block_index)
                .expect("block is held");
            held.remove(pos)
        };
        task.events.send(UnitEvent::new(task.unit, message)).unwrap();
    }
}

pub struct ScriptedSpawner {
    pub script: Script,
}

impl UnitSpawner for ScriptedSpawner {
    fn spawn(
        &mut self,
        id: UnitId,
        events: Sender<UnitEvent>,
    ) -> Result<Box<dyn ExecutionUnit>, SessionError> {
        Ok(Box::new(ScriptedUnit {
            id,
            events,
            params: None,
            script: self.script.clone(),
        }))
    }
}

struct ScriptedUnit {
    id: UnitId,
    events: Sender<UnitEvent>,
    params: Option<MixParams>,
    script: Script,
}

impl ExecutionUnit for ScriptedUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn send(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Configure(params) => {
                self.params = Some(params);
                let _ = self.events.send(UnitEvent::new(self.id, Message::Ready));
            }
            Message::Task { block_index, block } => {
                self.script.held.lock().unwrap().push(HeldTask {
                    unit: self.id,
                    block_index,
                    block,
                    params: self.params.expect("configured before task"),
                    events: self.events.clone(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn terminate(self: Box<Self>) {}
}

// ---------------------------------------------------------------------------
// Failing units
// ---------------------------------------------------------------------------

/// Where a [`FailingSpawner`] unit reports failure.
#[derive(Clone, Copy)]
pub enum FailAt {
    Configure,
    Task,
}

pub struct FailingSpawner {
    pub at: FailAt,
}

impl UnitSpawner for FailingSpawner {
    fn spawn(
        &mut self,
        id: UnitId,
        events: Sender<UnitEvent>,
    ) -> Result<Box<dyn ExecutionUnit>, SessionError> {
        Ok(Box::new(FailingUnit {
            id,
            events,
            at: self.at,
        }))
    }
}

struct FailingUnit {
    id: UnitId,
    events: Sender<UnitEvent>,
    at: FailAt,
}

impl ExecutionUnit for FailingUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn send(&mut self, message: Message) -> Result<(), SessionError> {
        let reply = match (message, self.at) {
            (Message::Configure(_), FailAt::Configure) => Message::Fail {
                block_index: None,
                reason: "out of memory in test".to_string(),
            },
            (Message::Configure(_), FailAt::Task) => Message::Ready,
            (Message::Task { block_index, .. }, _) => Message::Fail {
                block_index: Some(block_index),
                reason: "out of memory in test".to_string(),
            },
            _ => return Ok(()),
        };
        let _ = self.events.send(UnitEvent::new(self.id, reply));
        Ok(())
    }

    fn terminate(self: Box<Self>) {}
}

// ---------------------------------------------------------------------------
// Recording wrapper around the real thread units
// ---------------------------------------------------------------------------

pub type MessageLog = Arc<Mutex<Vec<(UnitId, &'static str)>>>;

pub struct RecordingSpawner {
    inner: ThreadSpawner,
    pub log: MessageLog,
}

impl RecordingSpawner {
    pub fn new() -> (Self, MessageLog) {
        let log = MessageLog::default();
        (
            Self {
                inner: ThreadSpawner::default(),
                log: log.clone(),
            },
            log,
        )
    }
}

impl UnitSpawner for RecordingSpawner {
    fn spawn(
        &mut self,
        id: UnitId,
        events: Sender<UnitEvent>,
    ) -> Result<Box<dyn ExecutionUnit>, SessionError> {
        let inner = self.inner.spawn(id, events)?;
        self.log.lock().unwrap().push((id, "spawn"));
        Ok(Box::new(RecordingUnit {
            inner,
            log: self.log.clone(),
        }))
    }
}

struct RecordingUnit {
    inner: Box<dyn ExecutionUnit>,
    log: MessageLog,
}

impl ExecutionUnit for RecordingUnit {
    fn id(&self) -> UnitId {
        self.inner.id()
    }

    fn send(&mut self, message: Message) -> Result<(), SessionError> {
        self.log.lock().unwrap().push((self.inner.id(), message.kind()));
        self.inner.send(message)
    }

    fn terminate(self: Box<Self>) {
        self.log.lock().unwrap().push((self.inner.id(), "terminate"));
        self.inner.terminate();
    }
}

pub fn count(log: &MessageLog, kind: &str) -> usize {
    log.lock().unwrap().iter().filter(|(_, k)| *k == kind).count()
}

// ---------------------------------------------------------------------------
// Slow mixer: a long mix whose scratch reports when it is freed
// ---------------------------------------------------------------------------

/// Mixer that takes about two seconds per block and counts dropped scratch.
#[derive(Clone, Default)]
pub struct SlowMixer {
    pub released: Arc<AtomicUsize>,
}

pub struct CountedScratch(Arc<AtomicUsize>);

impl Drop for CountedScratch {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

impl SlowMixer {
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }
}

impl BlockMixer for SlowMixer {
    type Scratch = CountedScratch;

    fn prepare(&self, _params: MixParams) -> Result<CountedScratch, MixError> {
        Ok(CountedScratch(self.released.clone()))
    }

    fn mix(
        &self,
        _block: &mut [u8],
        _params: MixParams,
        _scratch: &mut CountedScratch,
        progress: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        for percent in 1..=100 {
            std::thread::sleep(Duration::from_millis(20));
            progress(percent)?;
        }
        ControlFlow::Continue(())
    }
}
