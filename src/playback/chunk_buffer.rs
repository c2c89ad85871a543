//! Chunked SPSC byte buffer
//!
//! Decouples the decode thread's production rate from the output callback's
//! consumption rate. Bytes live in fixed 4096-byte chunks chained through a
//! [`SlotList`]; each chunk carries independent atomic read/write cursors,
//! so the producer appends at the tail while the consumer drains the head
//! with no shared lock.
//!
//! The split mirrors the thread roles: [`ChunkWriter`] (decode side) pushes
//! bytes, recycles drained chunks, and clears on seek; [`ChunkReader`]
//! (output side) pops bytes by advancing cursors only. The reader never
//! touches the allocator or the chain structure, which is what keeps the
//! real-time pop path safe at a type level: chunk unlinking is deferred to
//! the writer's explicit `cleanup()` from its non-real-time context.

use crate::config::CHUNK_SIZE;
use crate::playback::slot_list::{ListConsumer, ListProducer, ListReader, SlotList};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on chunks parked for reuse before extras are freed.
const RECYCLE_POOL_CAP: usize = 32;

/// One fixed-capacity byte segment.
///
/// The producer owns `end` and the bytes at `end..`, the consumer owns
/// `start` and reads `start..end`; the cursors only move forward, so the
/// two regions never overlap. `start <= end <= CHUNK_SIZE` always holds.
pub struct Chunk {
    data: UnsafeCell<[u8; CHUNK_SIZE]>,
    start: AtomicU16,
    end: AtomicU16,
}

// The cursor protocol keeps producer writes and consumer reads on disjoint
// byte ranges; `end` is published with Release and read with Acquire.
unsafe impl Sync for Chunk {}
unsafe impl Send for Chunk {}

impl Chunk {
    fn new() -> Self {
        Chunk {
            data: UnsafeCell::new([0u8; CHUNK_SIZE]),
            start: AtomicU16::new(0),
            end: AtomicU16::new(0),
        }
    }

    /// Bytes the producer can still append.
    fn free_space(&self) -> usize {
        CHUNK_SIZE - self.end.load(Ordering::Relaxed) as usize
    }

    fn is_full(&self) -> bool {
        self.end.load(Ordering::Acquire) as usize == CHUNK_SIZE
    }

    fn is_drained(&self) -> bool {
        let end = self.end.load(Ordering::Acquire);
        self.start.load(Ordering::Acquire) == end
    }

    /// Producer-only append; returns bytes written.
    fn write(&self, data: &[u8]) -> usize {
        let end = self.end.load(Ordering::Relaxed) as usize;
        let n = (CHUNK_SIZE - end).min(data.len());
        if n == 0 {
            return 0;
        }
        unsafe {
            let dst = (*self.data.get()).as_mut_ptr().add(end);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, n);
        }
        self.end.store((end + n) as u16, Ordering::Release);
        n
    }

    /// Consumer-only drain; returns bytes copied.
    fn read(&self, out: &mut [u8]) -> usize {
        let end = self.end.load(Ordering::Acquire) as usize;
        let start = self.start.load(Ordering::Relaxed) as usize;
        let n = (end - start).min(out.len());
        if n == 0 {
            return 0;
        }
        unsafe {
            let src = (*self.data.get()).as_ptr().add(start);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), n);
        }
        self.start.store((start + n) as u16, Ordering::Release);
        n
    }

    /// Reset for reuse. Requires exclusive ownership, which the writer
    /// proves via `Arc::get_mut` before calling.
    fn reset(&mut self) {
        *self.start.get_mut() = 0;
        *self.end.get_mut() = 0;
    }
}

struct BufferShared {
    /// Total buffered bytes across all chunks.
    size: AtomicUsize,
}

/// Construction entry point; split into the two working halves.
pub struct ChunkBuffer;

impl ChunkBuffer {
    pub fn new() -> (ChunkWriter, ChunkReader) {
        let (prod, cons, reader) = SlotList::new().split();
        let shared = Arc::new(BufferShared {
            size: AtomicUsize::new(0),
        });
        (
            ChunkWriter {
                prod,
                cons,
                reader: reader.clone(),
                tail_chunk: None,
                recycled: Vec::new(),
                shared: Arc::clone(&shared),
            },
            ChunkReader { reader, shared },
        )
    }
}

/// Decode-side half: appends bytes and reclaims drained chunks.
pub struct ChunkWriter {
    prod: ListProducer<Arc<Chunk>>,
    cons: ListConsumer<Arc<Chunk>>,
    reader: ListReader<Arc<Chunk>>,
    /// The chunk new bytes go into; always the last linked chunk.
    tail_chunk: Option<Arc<Chunk>>,
    /// Drained chunks parked for reuse once exclusively owned again.
    recycled: Vec<Arc<Chunk>>,
    shared: Arc<BufferShared>,
}

impl ChunkWriter {
    /// Append bytes at the tail. Never fails; allocates a fresh chunk only
    /// when the recycle pool has none to reuse.
    pub fn push(&mut self, mut data: &[u8]) {
        // Counted before the bytes are published: the add is sequenced
        // before each Release store of a chunk end cursor, so any pop that
        // copied these bytes also observes it. The saturating drain in
        // `pop` then only clips against a concurrent clear().
        self.shared.size.fetch_add(data.len(), Ordering::AcqRel);
        while !data.is_empty() {
            let chunk = match &self.tail_chunk {
                Some(c) if c.free_space() > 0 => Arc::clone(c),
                _ => self.link_new_tail(),
            };
            let n = chunk.write(data);
            data = &data[n..];
        }
    }

    /// Unlink head chunks that are both full and fully drained and park
    /// them for reuse. Called from the decode loop; the reader's pop path
    /// stays free of structural work because this exists.
    pub fn cleanup(&mut self) {
        let mut eligible = 0usize;
        {
            let guard = self.reader.guard();
            for chunk in guard.iter() {
                if let Some(tail) = &self.tail_chunk {
                    if Arc::ptr_eq(chunk, tail) {
                        break;
                    }
                }
                if chunk.is_full() && chunk.is_drained() {
                    eligible += 1;
                } else {
                    break;
                }
            }
        }
        for _ in 0..eligible {
            match self.cons.pop_front() {
                Some(chunk) => {
                    if self.recycled.len() < RECYCLE_POOL_CAP {
                        self.recycled.push(chunk);
                    }
                }
                None => break,
            }
        }
        // The last pop parks a chunk copy in the list anchor, which would
        // keep its pool entry above one owner; drain it so the chunk is
        // reusable right away.
        let _ = self.cons.drain_anchor();
        self.cons.try_reclaim();
        // Reclamation hands back the chunk copies the earlier pops left in
        // their anchors; dropping them returns the pooled chunks to one
        // owner.
        drop(self.cons.take_recovered());
    }

    /// Drop all buffered bytes. No concurrent `push` may run (the `&mut`
    /// receiver enforces it); a racing pop degrades to reading empty.
    pub fn clear(&mut self) {
        self.cons.clear(&mut self.prod);
        let _ = self.cons.drain_anchor();
        self.cons.try_reclaim();
        drop(self.cons.take_recovered());
        self.tail_chunk = None;
        self.recycled.clear();
        self.shared.size.store(0, Ordering::Release);
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn link_new_tail(&mut self) -> Arc<Chunk> {
        let chunk = self.take_reusable().unwrap_or_else(|| Arc::new(Chunk::new()));
        self.prod.push_back(Arc::clone(&chunk));
        self.tail_chunk = Some(Arc::clone(&chunk));
        chunk
    }

    /// Pull a chunk from the pool if we are its only owner; a pooled chunk
    /// still co-owned by a list slot awaiting reclamation is left alone.
    fn take_reusable(&mut self) -> Option<Arc<Chunk>> {
        let pos = self
            .recycled
            .iter()
            .position(|c| Arc::strong_count(c) == 1)?;
        let mut chunk = self.recycled.swap_remove(pos);
        match Arc::get_mut(&mut chunk) {
            Some(inner) => {
                inner.reset();
                Some(chunk)
            }
            // Lost exclusivity between the count check and here; put it
            // back rather than reuse storage a reader might still see.
            None => {
                self.recycled.push(chunk);
                None
            }
        }
    }
}

/// Output-side half: copies bytes out by advancing cursors. No structural
/// work, no allocation, no deallocation; safe to drive from the real-time
/// callback.
pub struct ChunkReader {
    reader: ListReader<Arc<Chunk>>,
    shared: Arc<BufferShared>,
}

impl ChunkReader {
    /// Copy up to `target.len()` buffered bytes into `target`, front to
    /// back; returns bytes copied (0 if empty). Stops at a drained chunk
    /// that is not yet full, since the producer may still extend it.
    pub fn pop(&mut self, target: &mut [u8]) -> usize {
        if target.is_empty() {
            return 0;
        }
        let mut copied = 0usize;
        {
            let guard = self.reader.guard();
            for chunk in guard.iter() {
                copied += chunk.read(&mut target[copied..]);
                if copied == target.len() {
                    break;
                }
                if !chunk.is_full() {
                    break;
                }
            }
        }
        if copied > 0 {
            // Saturating: a concurrent clear() may already have zeroed the
            // counter while we were copying from the old chain.
            let _ = self
                .shared
                .size
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                    Some(s.saturating_sub(copied))
                });
        }
        copied
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_across_chunk_boundaries() {
        let (mut writer, mut reader) = ChunkBuffer::new();

        // Pushes sized to straddle chunk edges repeatedly.
        let mut pushed = Vec::new();
        let mut value = 0u8;
        for push_len in [1usize, 100, 4095, 4096, 4097, 9000, 3] {
            let data: Vec<u8> = (0..push_len)
                .map(|_| {
                    value = value.wrapping_add(1);
                    value
                })
                .collect();
            writer.push(&data);
            pushed.extend_from_slice(&data);
        }
        assert_eq!(writer.len(), pushed.len());

        let mut popped = Vec::new();
        let mut scratch = [0u8; 777];
        loop {
            let n = reader.pop(&mut scratch);
            if n == 0 {
                break;
            }
            popped.extend_from_slice(&scratch[..n]);
        }
        assert_eq!(popped, pushed);
        assert!(reader.is_empty());
    }

    #[test]
    fn pop_returns_less_when_short() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        writer.push(&[1, 2, 3, 4, 5]);

        let mut out = [0u8; 64];
        assert_eq!(reader.pop(&mut out), 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(reader.pop(&mut out), 0);
    }

    #[test]
    fn pop_stops_at_refillable_tail_then_resumes() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        writer.push(&[1, 2, 3]);
        let mut out = [0u8; 8];
        assert_eq!(reader.pop(&mut out), 3);

        // Same tail chunk gets extended; pop picks the new bytes up.
        writer.push(&[4, 5]);
        assert_eq!(reader.pop(&mut out), 2);
        assert_eq!(&out[..2], &[4, 5]);
    }

    #[test]
    fn size_tracks_partial_drains() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        writer.push(&vec![7u8; 10_000]);
        assert_eq!(writer.len(), 10_000);

        let mut out = [0u8; 6_000];
        assert_eq!(reader.pop(&mut out), 6_000);
        assert_eq!(reader.len(), 4_000);
        assert_eq!(writer.len(), 4_000);
    }

    #[test]
    fn cleanup_recycles_drained_full_chunks() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        // Three full chunks plus a partial tail.
        writer.push(&vec![1u8; CHUNK_SIZE * 3 + 100]);

        let mut out = vec![0u8; CHUNK_SIZE * 3 + 100];
        assert_eq!(reader.pop(&mut out), out.len());

        writer.cleanup();
        assert_eq!(writer.recycled.len(), 3);

        // New pushes reuse the parked chunks instead of allocating.
        writer.push(&vec![2u8; CHUNK_SIZE * 2]);
        assert!(writer.recycled.len() <= 1);

        let mut out2 = vec![0u8; CHUNK_SIZE * 2];
        assert_eq!(reader.pop(&mut out2), out2.len());
        assert!(out2.iter().all(|&b| b == 2));
    }

    #[test]
    fn clear_discards_everything() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        writer.push(&vec![9u8; CHUNK_SIZE + 11]);
        writer.clear();
        assert_eq!(writer.len(), 0);

        let mut out = [0u8; 32];
        assert_eq!(reader.pop(&mut out), 0);

        // Usable again after clear.
        writer.push(&[1, 2, 3]);
        assert_eq!(reader.pop(&mut out), 3);
    }

    #[test]
    fn interleaved_push_pop_preserves_order() {
        let (mut writer, mut reader) = ChunkBuffer::new();
        let mut expected = Vec::new();
        let mut popped = Vec::new();
        let mut scratch = [0u8; 129];

        for i in 0..2_000u32 {
            let record = i.to_le_bytes();
            writer.push(&record);
            expected.extend_from_slice(&record);
            if i % 3 == 0 {
                let n = reader.pop(&mut scratch);
                popped.extend_from_slice(&scratch[..n]);
            }
            if i % 512 == 0 {
                writer.cleanup();
            }
        }
        loop {
            let n = reader.pop(&mut scratch);
            if n == 0 {
                break;
            }
            popped.extend_from_slice(&scratch[..n]);
        }
        assert_eq!(popped, expected);
    }
}
