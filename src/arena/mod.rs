//! Shared memory arena
//!
//! One contiguous buffer holds the password, salt, derived key and all `P`
//! blocks at fixed offsets:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────────────────────────┬─────────┐
//! │ password │   salt   │    dk    │ B0 │ B1 │ ... │ B(P-1)     │ padding │
//! └──────────┴──────────┴──────────┴────────────────────────────┴─────────┘
//!  max_pass   max_salt   max_dk     block_len * P                → 64 KiB
//! ```
//!
//! The buffer only grows. A configuration that fits in the current buffer
//! reuses it as is.

use std::ops::Range;

use zeroize::Zeroize;

use crate::config::SessionLimits;
use crate::error::SessionError;

/// Arena sizes are rounded up to a multiple of this many bytes.
pub const ARENA_ALIGNMENT: usize = 64 * 1024;

/// Offsets of every region inside the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaLayout {
    pub password: Range<usize>,
    pub salt: Range<usize>,
    pub dk: Range<usize>,
    pub blocks: Range<usize>,
    pub block_len: usize,
    pub total: usize,
}

impl ArenaLayout {
    /// Plan the regions for `blocks` blocks of `block_len` bytes each.
    pub fn plan(
        limits: &SessionLimits,
        block_len: usize,
        blocks: usize,
    ) -> Result<Self, SessionError> {
        let overflow = || SessionError::InvalidConfig("arena size overflows usize".to_string());

        let mut ptr = 0usize;
        let mut region = |len: usize| -> Result<Range<usize>, SessionError> {
            let start = ptr;
            ptr = ptr.checked_add(len).ok_or_else(overflow)?;
            Ok(start..ptr)
        };

        let password = region(limits.max_pass_len)?;
        let salt = region(limits.max_salt_len)?;
        let dk = region(limits.max_dk_len)?;
        let blocks = region(block_len.checked_mul(blocks).ok_or_else(overflow)?)?;

        let total = ptr
            .checked_next_multiple_of(ARENA_ALIGNMENT)
            .ok_or_else(overflow)?;

        Ok(Self {
            password,
            salt,
            dk,
            blocks,
            block_len,
            total,
        })
    }

    /// Byte range of block `index` within the arena.
    pub fn block(&self, index: usize) -> Range<usize> {
        let start = self.blocks.start + index * self.block_len;
        start..start + self.block_len
    }

    pub fn block_count(&self) -> usize {
        if self.block_len == 0 {
            0
        } else {
            self.blocks.len() / self.block_len
        }
    }
}

/// The arena buffer together with its current layout.
pub struct Arena {
    buf: Vec<u8>,
    layout: ArenaLayout,
}

impl Arena {
    pub fn new(layout: ArenaLayout) -> Self {
        Self {
            buf: vec![0u8; layout.total],
            layout,
        }
    }

    /// Adopt `layout`, growing the buffer only when it is too small.
    /// Returns `true` when a new buffer was allocated.
    pub fn prepare(&mut self, layout: ArenaLayout) -> bool {
        let grow = layout.total > self.buf.len();
        if grow {
            tracing::debug!(
                "Reallocating arena: {} -> {} bytes",
                self.buf.len(),
                layout.total
            );
            self.buf.zeroize();
            self.buf = vec![0u8; layout.total];
        }
        self.layout = layout;
        grow
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Allocated size, which may exceed the current layout's total.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy `password` and `salt` into their regions.
    pub fn write_inputs(&mut self, password: &[u8], salt: &[u8]) {
        let pass_start = self.layout.password.start;
        let salt_start = self.layout.salt.start;
        self.buf[pass_start..pass_start + password.len()].copy_from_slice(password);
        self.buf[salt_start..salt_start + salt.len()].copy_from_slice(salt);
    }

    pub fn password(&self, len: usize) -> &[u8] {
        let start = self.layout.password.start;
        &self.buf[start..start + len]
    }

    pub fn salt(&self, len: usize) -> &[u8] {
        let start = self.layout.salt.start;
        &self.buf[start..start + len]
    }

    pub fn blocks(&self) -> &[u8] {
        &self.buf[self.layout.blocks.clone()]
    }

    pub fn blocks_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.layout.blocks.clone()]
    }

    /// Copy block `index` out into an owned buffer for a task payload.
    pub fn take_block(&self, index: usize) -> Vec<u8> {
        self.buf[self.layout.block(index)].to_vec()
    }

    /// Overwrite block `index` with a returned payload.
    pub fn put_block(&mut self, index: usize, block: &[u8]) -> Result<(), SessionError> {
        if block.len() != self.layout.block_len {
            return Err(SessionError::InvalidConfig(format!(
                "block {} is {} bytes, expected {}",
                index,
                block.len(),
                self.layout.block_len
            )));
        }
        let range = self.layout.block(index);
        self.buf[range].copy_from_slice(block);
        Ok(())
    }

    /// Split borrows needed by the final stretch: password and blocks are
    /// read while the dk region is written.
    pub fn finalize_regions(&mut self, pass_len: usize) -> (&[u8], &[u8], &mut [u8]) {
        let layout = &self.layout;
        // Regions are laid out password < salt < dk < blocks.
        let (head, tail) = self.buf.split_at_mut(layout.blocks.start);
        let (head, dk_tail) = head.split_at_mut(layout.dk.start);
        let head: &[u8] = head;
        let tail: &[u8] = tail;
        let password = &head[layout.password.start..layout.password.start + pass_len];
        let blocks = &tail[..layout.blocks.len()];
        let dk = &mut dk_tail[..layout.dk.len()];
        (password, blocks, dk)
    }

    pub fn dk(&self, len: usize) -> &[u8] {
        let start = self.layout.dk.start;
        &self.buf[start..start + len]
    }

    /// Wipe the password, salt and derived-key regions.
    pub fn wipe_secrets(&mut self) {
        let end = self.layout.dk.end;
        self.buf[..end].zeroize();
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}
