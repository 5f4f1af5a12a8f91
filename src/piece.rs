//! Per-piece block bookkeeping: requested/received sets, timers, retry.
//!
//! Grounded on `examples/original_source/src/piece.cpp`: block id math,
//! the `requested + done` combined next-offset search, and the
//! inactivity-based retry contract. The original's `std::mutex` becomes a
//! `std::sync::Mutex` around the mutable fields.
use crate::bitfield::Bitfield;
use crate::runtime::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Block request/transfer granularity, per BEP 3 convention.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// How long a piece may sit with an outstanding request before
/// `retry_blocks` clears it for re-request.
pub const RETRY_INACTIVITY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("block offset {0} is not a multiple of the block size")]
    UnalignedOffset(u32),

    #[error("block of {0} bytes exceeds the block size")]
    BlockTooLarge(usize),

    #[error("block at offset {offset} of length {len} overflows the piece (size {piece_size})")]
    Overflow {
        offset: u32,
        len: usize,
        piece_size: u32,
    },
}

struct Inner {
    requested: Bitfield,
    received: Bitfield,
    data: Vec<u8>,
    written: bool,
    last_request: Option<Instant>,
    last_block: Option<Instant>,
}

/// One active piece: either still being downloaded, or fully verified and
/// written to disk (`written == true`, in which case `data` is empty).
pub struct Piece {
    id: u32,
    piece_size: u32,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Piece {
    pub fn new(id: u32, piece_size: u32, clock: Arc<dyn Clock>) -> Self {
        let block_count = Self::block_count_for(piece_size);
        Self {
            id,
            piece_size,
            clock,
            inner: Mutex::new(Inner {
                requested: Bitfield::with_bit_capacity(block_count as usize),
                received: Bitfield::with_bit_capacity(block_count as usize),
                data: vec![0u8; piece_size as usize],
                written: false,
                last_request: None,
                last_block: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    fn block_count_for(piece_size: u32) -> u32 {
        piece_size / BLOCK_SIZE + u32::from(piece_size % BLOCK_SIZE != 0)
    }

    pub fn block_count(&self) -> u32 {
        Self::block_count_for(self.piece_size)
    }

    /// Size in bytes of the block starting at `offset`: `BLOCK_SIZE`
    /// unless it's the final block, whose size is `piece_size mod
    /// BLOCK_SIZE` (or `BLOCK_SIZE` if that's 0).
    pub fn block_len_at(&self, offset: u32) -> u32 {
        let remainder = self.piece_size.saturating_sub(offset);
        remainder.min(BLOCK_SIZE)
    }

    pub fn written(&self) -> bool {
        self.inner.lock().expect("piece mutex poisoned").written
    }

    /// Returns the byte offset of the first block that is neither
    /// requested nor received. If `mark` is true, also marks that block
    /// requested and bumps `last_request`.
    pub fn next_offset(&self, mark: bool) -> Option<u32> {
        let mut inner = self.inner.lock().expect("piece mutex poisoned");
        let req_or_done = inner.requested.union(&inner.received);
        let next = req_or_done.next(false, 0)?;
        if next as u32 >= self.block_count() {
            return None;
        }
        if mark {
            inner.requested.set(next, true);
            inner.last_request = Some(self.clock.now());
        }
        Some(next as u32 * BLOCK_SIZE)
    }

    /// Stores an incoming block. Idempotent (warns, no-op) if the block is
    /// already received. Returns `true` once every block has been
    /// received.
    pub fn set_block(&self, offset: u32, data: &[u8]) -> Result<bool, PieceError> {
        if offset % BLOCK_SIZE != 0 {
            return Err(PieceError::UnalignedOffset(offset));
        }
        if data.len() as u32 > BLOCK_SIZE {
            return Err(PieceError::BlockTooLarge(data.len()));
        }
        if offset as u64 + data.len() as u64 > self.piece_size as u64 {
            return Err(PieceError::Overflow {
                offset,
                len: data.len(),
                piece_size: self.piece_size,
            });
        }

        let block_id = (offset / BLOCK_SIZE) as usize;
        let mut inner = self.inner.lock().expect("piece mutex poisoned");

        if inner.received.get(block_id) {
            tracing::warn!(piece = self.id, block_id, "already received this block");
        } else {
            if !inner.requested.get(block_id) {
                tracing::warn!(piece = self.id, block_id, "got data for a non-requested block");
            }
            let start = offset as usize;
            inner.data[start..start + data.len()].copy_from_slice(data);
            inner.received.set(block_id, true);
            tracing::debug!(
                piece = self.id,
                block_id,
                len = data.len(),
                "stored block"
            );
        }
        inner.last_block = Some(self.clock.now());
        let next = inner.received.next(false, 0);
        Ok(next.is_none() || next.unwrap() as u32 >= self.block_count())
    }

    /// Returns a block's bytes if already received and still buffered in
    /// memory. Returns `None` if the block isn't done, or if the piece has
    /// already been written (the caller should fall back to a disk read).
    pub fn get_block_from_memory(&self, offset: u32, length: u32) -> Option<Vec<u8>> {
        let block_id = (offset / BLOCK_SIZE) as usize;
        let inner = self.inner.lock().expect("piece mutex poisoned");
        if !inner.received.get(block_id) || inner.written {
            return None;
        }
        let start = offset as usize;
        let end = start + length as usize;
        Some(inner.data[start..end].to_vec())
    }

    /// Marks the piece fully written: sets every `received` bit, releases
    /// the in-memory buffer.
    pub fn set_piece_written(&self, written: bool) {
        let mut inner = self.inner.lock().expect("piece mutex poisoned");
        if written {
            let count = self.block_count();
            for i in 0..count {
                inner.received.set(i as usize, true);
            }
            inner.data.clear();
            inner.data.shrink_to_fit();
        }
        inner.written = written;
    }

    /// Clones out the full piece buffer for hashing/writing by the file
    /// writer. Empty once the piece has been written and the buffer
    /// released.
    pub fn buffer_snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("piece mutex poisoned").data.clone()
    }

    /// If this piece has been inactive (no request/block activity) for
    /// over `RETRY_INACTIVITY`, clears the `requested` bitfield so every
    /// unreceived block is eligible for re-request, returning the number
    /// of blocks that were requested-but-not-received. Returns 0 if
    /// already written, never active, or still within the window.
    pub fn retry_blocks(&self) -> usize {
        let mut inner = self.inner.lock().expect("piece mutex poisoned");
        if inner.written {
            return 0;
        }
        let last_activity = match (inner.last_request, inner.last_block) {
            (None, None) => return 0,
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
        };
        if self.clock.now().duration_since(last_activity) <= RETRY_INACTIVITY {
            return 0;
        }
        if inner.requested.next(true, 0).is_none() {
            return 0;
        }
        let retry = inner.requested.difference(&inner.received).count();
        let block_count = self.block_count();
        inner.requested = Bitfield::with_bit_capacity(block_count as usize);
        tracing::warn!(piece = self.id, retry, "piece inactive, marking for retry");
        retry
    }
}
