//! Message vocabulary exchanged between the coordinator and execution units
//!
//! Every unit has an ordered, reliable inbox. Replies from all units share
//! one event channel and are tagged with the sender's [`UnitId`]. Messages
//! from a single unit are observed in send order; nothing is assumed across
//! units.
//!
//! Block payloads are plain `Vec<u8>` values moved through the channel, so
//! once a `Task` or `Done` is sent the sender no longer holds the bytes.

use std::fmt;

/// Identity of one execution unit. Never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cost parameters a unit needs to run the mix function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixParams {
    pub n: u32,
    pub r: u32,
}

impl MixParams {
    pub fn block_len(&self) -> usize {
        128 * self.r as usize
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    /// Coordinator → unit: adopt these cost parameters and allocate scratch.
    Configure(MixParams),
    /// Unit → coordinator: configured and able to take tasks.
    Ready,
    /// Coordinator → unit: mix one block.
    Task { block_index: usize, block: Vec<u8> },
    /// Unit → coordinator: the mixed block, handed back by move.
    Done { block_index: usize, block: Vec<u8> },
    /// Unit → coordinator: scratch allocation failed. `block_index` is set
    /// when the failure happened while serving a task.
    Fail {
        block_index: Option<usize>,
        reason: String,
    },
    /// Coordinator → unit: reply to a bare progress signal.
    Ack,
    /// Unit → coordinator: bare progress signal, answered with [`Message::Ack`].
    Progress(u32),
    /// Coordinator → unit: drop working memory but stay alive.
    Free,
}

impl Message {
    /// Short tag used in logs and protocol-violation reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Configure(_) => "configure",
            Message::Ready => "ready",
            Message::Task { .. } => "task",
            Message::Done { .. } => "done",
            Message::Fail { .. } => "fail",
            Message::Ack => "ack",
            Message::Progress(_) => "progress",
            Message::Free => "free",
        }
    }

    /// Whether a unit may legitimately send this message to the coordinator.
    pub fn is_unit_reply(&self) -> bool {
        matches!(
            self,
            Message::Ready | Message::Done { .. } | Message::Fail { .. } | Message::Progress(_)
        )
    }
}

/// A message received from a unit, tagged with its sender.
#[derive(Debug)]
pub struct UnitEvent {
    pub unit: UnitId,
    pub message: Message,
}

impl UnitEvent {
    pub fn new(unit: UnitId, message: Message) -> Self {
        Self { unit, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_direction() {
        assert!(Message::Ready.is_unit_reply());
        assert!(Message::Progress(50).is_unit_reply());
        assert!(
            Message::Done {
                block_index: 0,
                block: Vec::new()
            }
            .is_unit_reply()
        );
        assert!(!Message::Ack.is_unit_reply());
        assert!(!Message::Free.is_unit_reply());
        assert!(!Message::Configure(MixParams { n: 2, r: 1 }).is_unit_reply());
    }

    #[test]
    fn test_block_len() {
        assert_eq!(MixParams { n: 1024, r: 8 }.block_len(), 1024);
        assert_eq!(MixParams { n: 16, r: 1 }.block_len(), 128);
    }

    #[test]
    fn test_unit_id_display() {
        assert_eq!(UnitId(7).to_string(), "#7");
    }
}
