use salsa20::SalsaCore;
use salsa20::cipher::StreamCipherCore;
use salsa20::cipher::typenum::U4;
use std::ops::ControlFlow;
use thiserror::Error;

use crate::protocol::MixParams;

/// Salsa20 reduced to 8 rounds (4 double rounds).
type Salsa20_8 = SalsaCore<U4>;

/// Working memory could not be obtained for a mix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MixError(pub String);

/// Memory-hard per-block transform run inside an execution unit.
pub trait BlockMixer: Send + Sync + 'static {
    /// Per-unit working memory, reused across tasks until freed.
    type Scratch: Send;

    /// Allocate working memory for `params`.
    fn prepare(&self, params: MixParams) -> Result<Self::Scratch, MixError>;

    /// Transform `block` in place.
    ///
    /// `progress` receives the completed percentage each time it changes.
    /// When it returns `Break` the mix stops early, leaves `block` in an
    /// unspecified state and returns `Break`.
    fn mix(
        &self,
        block: &mut [u8],
        params: MixParams,
        scratch: &mut Self::Scratch,
        progress: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> ControlFlow<()>;
}
/// scrypt ROMix over BlockMix with the Salsa20/8 core.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScryptMixer;

pub struct RomixScratch {
    v: Vec<u32>,
    x: Vec<u32>,
    y: Vec<u32>,
}

impl RomixScratch {
    fn try_new(params: MixParams) -> Result<Self, MixError> {
        let words = 32 * params.r as usize;
        let v_len = words
            .checked_mul(params.n as usize)
            .ok_or_else(|| MixError(format!("N={} r={} overflows", params.n, params.r)))?;

        Ok(Self {
            v: try_alloc(v_len)?,
            x: try_alloc(words)?,
            y: try_alloc(words)?,
        })
    }
}

fn try_alloc(len: usize) -> Result<Vec<u32>, MixError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| MixError(format!("cannot reserve {} words: {e}", len)))?;
    buf.resize(len, 0);
    Ok(buf)
}

impl BlockMixer for ScryptMixer {
    type Scratch = RomixScratch;

    fn prepare(&self, params: MixParams) -> Result<RomixScratch, MixError> {
        RomixScratch::try_new(params)
    }

    fn mix(
        &self,
        block: &mut [u8],
        params: MixParams,
        scratch: &mut RomixScratch,
        progress: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        romix(block, params, scratch, progress)
    }
}

fn romix(
    block: &mut [u8],
    params: MixParams,
    scratch: &mut RomixScratch,
    progress: &mut dyn FnMut(u32) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let n = params.n as usize;
    let r = params.r as usize;
    let words = 32 * r;
    debug_assert_eq!(block.len(), 4 * words);

    for (w, chunk) in scratch.x.iter_mut().zip(block.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    // Percentage of the 2N BlockMix calls done, reported on change.
    let steps = 2 * n;
    let mut reported = 0;
    let mut report = |step: usize| {
        let percent = ((step + 1) * 100 / steps) as u32;
        if percent == reported {
            return ControlFlow::Continue(());
        }
        reported = percent;
        progress(percent)
    };

    for i in 0..n {
        scratch.v[i * words..(i + 1) * words].copy_from_slice(&scratch.x);
        block_mix(&scratch.x, &mut scratch.y, r);
        std::mem::swap(&mut scratch.x, &mut scratch.y);
        report(i)?;
    }

    for i in 0..n {
        let j = (scratch.x[(2 * r - 1) * 16] as usize) & (n - 1);
        let vj = &scratch.v[j * words..(j + 1) * words];
        for (x, v) in scratch.x.iter_mut().zip(vj) {
            *x ^= v;
        }
        block_mix(&scratch.x, &mut scratch.y, r);
        std::mem::swap(&mut scratch.x, &mut scratch.y);
        report(n + i)?;
    }

    for (chunk, w) in block.chunks_exact_mut(4).zip(&scratch.x) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
    ControlFlow::Continue(())
}

/// BlockMix: even-indexed outputs go to the first half, odd to the second.
fn block_mix(input: &[u32], output: &mut [u32], r: usize) {
    let mut x = [0u32; 16];
    x.copy_from_slice(&input[(2 * r - 1) * 16..2 * r * 16]);

    for i in 0..2 * r {
        for (xk, bk) in x.iter_mut().zip(&input[i * 16..(i + 1) * 16]) {
            *xk ^= bk;
        }
        salsa20_8(&mut x);
        let dst = (if i % 2 == 0 { i / 2 } else { r + i / 2 }) * 16;
        output[dst..dst + 16].copy_from_slice(&x);
    }
}

/// Salsa20/8 core: the keystream block of a state is the permuted state
/// added to itself.
fn salsa20_8(b: &mut [u32; 16]) {
    let mut out = [0u8; 64];
    Salsa20_8::from_raw_state(*b).write_keystream_block((&mut out).into());
    for (w, chunk) in b.iter_mut().zip(out.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}
