//! Concurrent FIFO list over a slot arena
//!
//! The ordered backbone of the streaming core, used for both the chunk chain
//! inside the byte buffer and the queue of in-flight streams. One producer
//! appends at the tail, one consumer pops at the head, and any number of
//! sequential read passes may traverse concurrently with both.
//!
//! Instead of a pointer-linked list with intrusive reference counts, slots
//! live in an arena of geometrically growing blocks and never move. Links
//! are packed `generation:index` words, so a stale link is detectable rather
//! than dangling. The single-writer-per-end rule is a compile-time fact:
//! [`ListProducer`] and [`ListConsumer`] are unique handles whose mutating
//! methods take `&mut self`.
//!
//! Values must be cheap shared handles (`Arc<_>` in this crate). `pop_front`
//! returns a clone and the slot's own copy is dropped later, once no read
//! guard is active; readers therefore never observe a value being destroyed
//! under them. The head slot is a consumed anchor (the sentinel role): the
//! first data slot is always `anchor.next`, which keeps the producer's
//! tail-append and the consumer's head-advance from ever writing the same
//! field.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Slot has no value and is not linked anywhere.
const STATE_FREE: u8 = 0;
/// Slot is the consumed head anchor and holds no value (initial sentinel).
const STATE_ANCHOR: u8 = 1;
/// Slot is the consumed head anchor but still holds its popped value.
const STATE_ANCHOR_HELD: u8 = 2;
/// Slot is linked and holds a live value.
const STATE_DATA: u8 = 3;

/// Index half of a link that points nowhere.
const NIL: u32 = u32::MAX;
/// A link with no target (generation half zero, index half NIL).
const LINK_NIL: u64 = NIL as u64;

/// Number of arena blocks; block `b` holds `32 << b` slots.
const SPINE_WAYS: usize = 32;
/// Capacity of the free-index ring between consumer and producer.
const FREE_RING_CAP: usize = 1024;

#[inline]
fn pack(gen: u32, index: u32) -> u64 {
    ((gen as u64) << 32) | index as u64
}

#[inline]
fn unpack(link: u64) -> (u32, u32) {
    ((link >> 32) as u32, link as u32)
}

/// Map a slot index to its (block, offset) position in the spine.
#[inline]
fn locate(index: u32) -> (usize, usize) {
    let q = (index >> 5) + 1;
    let block = q.ilog2() as usize;
    let base = 32u32 * ((1u32 << block) - 1);
    (block, (index - base) as usize)
}

#[inline]
fn block_len(block: usize) -> usize {
    32 << block
}

struct Slot<T> {
    gen: AtomicU32,
    state: AtomicU8,
    next: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct ListCore<T> {
    /// Block pointers; each entry is an array of `block_len(b)` slots.
    spine: [AtomicPtr<Slot<T>>; SPINE_WAYS],
    /// Number of blocks currently allocated (producer-published).
    blocks: AtomicU32,
    /// Link to the anchor slot. Written by the consumer, read by everyone.
    head: AtomicU64,
    /// Link to the last linked slot. Producer-owned; others read it only
    /// under structural exclusivity (truncate, clear, sanity checks).
    tail: AtomicU64,
    /// Data slots currently linked (anchor excluded).
    len: AtomicUsize,
    /// Active read guards; retired slots are reclaimed only at zero.
    readers: AtomicU32,
}

// Values are written through UnsafeCell from the producer thread and read
// from consumer and reader threads; the state/link protocol plus deferred
// reclamation keeps those accesses disjoint-or-shared-immutable.
unsafe impl<T: Send + Sync> Send for ListCore<T> {}
unsafe impl<T: Send + Sync> Sync for ListCore<T> {}

impl<T> ListCore<T> {
    #[inline]
    fn slot(&self, index: u32) -> &Slot<T> {
        let (block, offset) = locate(index);
        let ptr = self.spine[block].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "slot index {} in unallocated block", index);
        unsafe { &*ptr.add(offset) }
    }

    fn alloc_block(&self, block: usize) {
        assert!(block < SPINE_WAYS, "slot arena spine exhausted");
        let len = block_len(block);
        let mut slots = Vec::with_capacity(len);
        for _ in 0..len {
            slots.push(Slot {
                gen: AtomicU32::new(0),
                state: AtomicU8::new(STATE_FREE),
                next: AtomicU64::new(LINK_NIL),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        let boxed: Box<[Slot<T>]> = slots.into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut Slot<T>;
        self.spine[block].store(ptr, Ordering::Release);
        self.blocks.store(block as u32 + 1, Ordering::Release);
    }

    /// Total slots across allocated blocks.
    fn slot_capacity(&self) -> u32 {
        let blocks = self.blocks.load(Ordering::Acquire);
        32 * ((1u32 << blocks) - 1)
    }
}

impl<T> Drop for ListCore<T> {
    fn drop(&mut self) {
        // All handles are gone, so no slot can be concurrently accessed.
        // Drop any value still parked in a slot (linked data, held anchors,
        // and retired-but-unreclaimed slots all still carry theirs).
        let blocks = *self.blocks.get_mut() as usize;
        for block in 0..blocks {
            let ptr = *self.spine[block].get_mut();
            if ptr.is_null() {
                continue;
            }
            let len = block_len(block);
            let slots = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) };
            for slot in slots.iter() {
                let state = slot.state.load(Ordering::Relaxed);
                if state == STATE_DATA || state == STATE_ANCHOR_HELD {
                    unsafe { (*slot.value.get()).assume_init_drop() };
                }
            }
        }
    }
}

/// Construction entry point; split into the working handles immediately.
pub struct SlotList<T> {
    core: Arc<ListCore<T>>,
}

impl<T: Send + Sync> SlotList<T> {
    pub fn new() -> Self {
        let core = ListCore {
            spine: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            blocks: AtomicU32::new(0),
            head: AtomicU64::new(LINK_NIL),
            tail: AtomicU64::new(LINK_NIL),
            len: AtomicUsize::new(0),
            readers: AtomicU32::new(0),
        };
        core.alloc_block(0);
        // Slot 0 is the initial anchor: consumed, valueless.
        core.slot(0).state.store(STATE_ANCHOR, Ordering::Relaxed);
        let anchor = pack(0, 0);
        core.head.store(anchor, Ordering::Relaxed);
        core.tail.store(anchor, Ordering::Relaxed);
        SlotList {
            core: Arc::new(core),
        }
    }

    /// Split into the producer, consumer, and shared reader handles.
    pub fn split(self) -> (ListProducer<T>, ListConsumer<T>, ListReader<T>) {
        let ring = HeapRb::<u32>::new(FREE_RING_CAP);
        let (free_tx, free_rx) = ring.split();
        (
            ListProducer {
                core: Arc::clone(&self.core),
                free_rx,
                bump_next: 1,
            },
            ListConsumer {
                core: Arc::clone(&self.core),
                free_tx,
                retired: VecDeque::new(),
                recovered: Vec::new(),
            },
            ListReader { core: self.core },
        )
    }
}

impl<T: Send + Sync> Default for SlotList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique append handle (the single producer).
pub struct ListProducer<T> {
    core: Arc<ListCore<T>>,
    /// Recycled slot indices, fed by the consumer.
    free_rx: HeapCons<u32>,
    /// Next never-used slot index.
    bump_next: u32,
}

impl<T: Clone + Send + Sync> ListProducer<T> {
    /// Append a value at the tail.
    ///
    /// The value is published before the link, so a concurrent reader either
    /// does not see the new slot yet or sees it fully initialized.
    pub fn push_back(&mut self, value: T) {
        let index = self.take_index();
        let slot = self.core.slot(index);
        debug_assert_eq!(slot.state.load(Ordering::Relaxed), STATE_FREE);

        unsafe { (*slot.value.get()).write(value) };
        slot.next.store(LINK_NIL, Ordering::Relaxed);
        slot.state.store(STATE_DATA, Ordering::Release);

        let link = pack(slot.gen.load(Ordering::Relaxed), index);
        let (_, tail_index) = unpack(self.core.tail.load(Ordering::Relaxed));
        // Counted before the link is published: a pop can only observe the
        // slot after the link store, so its decrement always lands after
        // this increment and len never underflows. It may transiently read
        // one high.
        self.core.len.fetch_add(1, Ordering::AcqRel);
        // The tail slot is never reclaimed while it is the tail (the anchor
        // only advances past a slot once a successor exists), so this store
        // cannot land in a recycled slot.
        self.core
            .slot(tail_index)
            .next
            .store(link, Ordering::Release);
        self.core.tail.store(link, Ordering::Release);
    }

    /// Data slots currently linked.
    pub fn len(&self) -> usize {
        self.core.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_index(&mut self) -> u32 {
        if let Some(index) = self.free_rx.try_pop() {
            return index;
        }
        if self.bump_next >= self.core.slot_capacity() {
            let next_block = self.core.blocks.load(Ordering::Acquire) as usize;
            self.core.alloc_block(next_block);
        }
        let index = self.bump_next;
        self.bump_next += 1;
        index
    }
}

/// Unique pop handle (the single consumer).
pub struct ListConsumer<T> {
    core: Arc<ListCore<T>>,
    /// Reclaimed slot indices handed back to the producer.
    free_tx: HeapProd<u32>,
    /// Unlinked slots awaiting a reader-free moment to reclaim.
    retired: VecDeque<u64>,
    /// Values rescued from reclaimed slots, held for `take_recovered`.
    recovered: Vec<T>,
}

impl<T: Clone + Send + Sync> ListConsumer<T> {
    /// Pop the first value, or `None` if the list is empty.
    pub fn pop_front(&mut self) -> Option<T> {
        let anchor_link = self.core.head.load(Ordering::Acquire);
        let (_, anchor_index) = unpack(anchor_link);
        let next_link = self.core.slot(anchor_index).next.load(Ordering::Acquire);
        let (next_gen, next_index) = unpack(next_link);
        if next_index == NIL {
            return None;
        }

        let slot = self.core.slot(next_index);
        debug_assert_eq!(slot.gen.load(Ordering::Relaxed), next_gen);
        debug_assert_eq!(slot.state.load(Ordering::Acquire), STATE_DATA);
        let value = unsafe { (*slot.value.get()).assume_init_ref() }.clone();

        // The popped slot becomes the new anchor, keeping its value until it
        // is itself retired; readers racing this see either state and both
        // are benign (the value stays alive under any active guard).
        slot.state.store(STATE_ANCHOR_HELD, Ordering::Relaxed);
        self.core.head.store(next_link, Ordering::Release);
        self.core.len.fetch_sub(1, Ordering::AcqRel);
        self.retire(anchor_link);
        Some(value)
    }

    /// Data slots currently linked.
    pub fn len(&self) -> usize {
        self.core.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every linked value, leaving the list empty.
    ///
    /// Needs the producer handle too: clearing restructures both ends, so
    /// exclusivity over the whole list is required. Concurrent readers keep
    /// traversing the old chain until their guard drops; its slots are only
    /// reclaimed after that.
    pub fn clear(&mut self, _producer: &mut ListProducer<T>) {
        let anchor_link = self.core.head.load(Ordering::Acquire);
        let (_, anchor_index) = unpack(anchor_link);

        // Walk the data chain, remembering the last slot; it becomes the
        // new anchor so the producer's tail stays valid.
        let mut cut = Vec::new();
        let mut last_link = anchor_link;
        let mut link = self.core.slot(anchor_index).next.load(Ordering::Acquire);
        while unpack(link).1 != NIL {
            cut.push(last_link);
            last_link = link;
            let (_, index) = unpack(link);
            link = self.core.slot(index).next.load(Ordering::Acquire);
        }
        if cut.is_empty() {
            return;
        }

        let (_, new_anchor_index) = unpack(last_link);
        self.core
            .slot(new_anchor_index)
            .state
            .store(STATE_ANCHOR_HELD, Ordering::Relaxed);
        self.core.head.store(last_link, Ordering::Release);
        self.core.len.store(0, Ordering::Release);
        for link in cut {
            self.retire(link);
        }
        self.try_reclaim();
    }

    /// Reclaim retired slots if no reader guard is active.
    ///
    /// Called opportunistically from pop/clear, and explicitly by owners
    /// that batch structural work (buffer cleanup, queue edits). Values
    /// still parked in reclaimed slots are never dropped here; they move
    /// to the recovered set for the owner to take, so the owner controls
    /// where a last reference goes out of scope.
    pub fn try_reclaim(&mut self) {
        if self.retired.is_empty() {
            return;
        }
        // Pairs with the SeqCst guard entry: a guard that our load misses
        // entered after this fence and will start from the already-advanced
        // head, never reaching the slots reclaimed below.
        fence(Ordering::SeqCst);
        if self.core.readers.load(Ordering::SeqCst) != 0 {
            return;
        }
        while let Some(link) = self.retired.pop_front() {
            let (gen, index) = unpack(link);
            let slot = self.core.slot(index);
            let state = slot.state.load(Ordering::Relaxed);
            debug_assert_ne!(state, STATE_FREE);
            if state == STATE_DATA || state == STATE_ANCHOR_HELD {
                let value = unsafe { (*slot.value.get()).assume_init_read() };
                self.recovered.push(value);
            }
            slot.next.store(LINK_NIL, Ordering::Relaxed);
            slot.gen.store(gen.wrapping_add(1), Ordering::Relaxed);
            slot.state.store(STATE_FREE, Ordering::Release);
            // A full ring just leaks the index; the arena keeps the slot.
            let _ = self.free_tx.try_push(index);
        }
    }

    /// Take back the value parked in the consumed head anchor, if any.
    ///
    /// `pop_front` leaves its value in the anchor slot so readers already
    /// holding a reference stay valid; that copy otherwise lives until the
    /// slot is retired by a later pop. With no reader guard active it can
    /// be released early, which lets the owner decide where the value's
    /// final drop runs. A copy that never gets drained surfaces through
    /// `take_recovered` once its slot is reclaimed.
    pub fn drain_anchor(&mut self) -> Option<T> {
        // Same pairing as try_reclaim: a guard this load misses entered
        // after the fence and starts from the current head, whose anchor
        // states it skips without touching the value.
        fence(Ordering::SeqCst);
        if self.core.readers.load(Ordering::SeqCst) != 0 {
            return None;
        }
        let (_, anchor_index) = unpack(self.core.head.load(Ordering::Acquire));
        let slot = self.core.slot(anchor_index);
        if slot.state.load(Ordering::Relaxed) != STATE_ANCHOR_HELD {
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.state.store(STATE_ANCHOR, Ordering::Release);
        Some(value)
    }

    /// Values rescued by reclamation from slots that still held one: cut
    /// data slots, and parked anchors a guard kept loaded past their
    /// drain. Untaken values stay here until the consumer itself drops.
    pub fn take_recovered(&mut self) -> Vec<T> {
        std::mem::take(&mut self.recovered)
    }

    /// Slots waiting for reclamation (diagnostics and tests).
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    fn retire(&mut self, link: u64) {
        self.retired.push_back(link);
        self.try_reclaim();
    }
}

/// Drop the data slots after the first `keep`, preserving their values'
/// lifetimes for any active reader. Requires both end handles: the cut
/// rewrites the tail.
pub fn truncate<T: Clone + Send + Sync>(
    _producer: &mut ListProducer<T>,
    consumer: &mut ListConsumer<T>,
    keep: usize,
) {
    let core = Arc::clone(&consumer.core);
    let anchor_link = core.head.load(Ordering::Acquire);
    let (_, anchor_index) = unpack(anchor_link);

    let mut last_kept = anchor_link;
    let mut link = core.slot(anchor_index).next.load(Ordering::Acquire);
    let mut kept = 0usize;
    while kept < keep {
        let (_, index) = unpack(link);
        if index == NIL {
            return; // shorter than keep, nothing to cut
        }
        last_kept = link;
        link = core.slot(index).next.load(Ordering::Acquire);
        kept += 1;
    }
    if unpack(link).1 == NIL {
        return;
    }

    // Cut after last_kept; readers already past the cut keep walking the
    // detached chain, whose slots stay alive until reclaimed.
    let (_, last_kept_index) = unpack(last_kept);
    core.slot(last_kept_index)
        .next
        .store(LINK_NIL, Ordering::Release);
    core.tail.store(last_kept, Ordering::Release);

    let mut dropped = 0usize;
    while unpack(link).1 != NIL {
        let (_, index) = unpack(link);
        let next = core.slot(index).next.load(Ordering::Acquire);
        consumer.retire(link);
        dropped += 1;
        link = next;
    }
    core.len.fetch_sub(dropped, Ordering::AcqRel);
    consumer.try_reclaim();
}

/// Validate arena/chain invariants. Only meaningful while no operation or
/// iteration runs concurrently, which taking both end handles guarantees.
pub fn check_sanity<T: Clone + Send + Sync>(
    _producer: &ListProducer<T>,
    consumer: &ListConsumer<T>,
) -> std::result::Result<(), String> {
    let core = &consumer.core;
    let head = core.head.load(Ordering::Acquire);
    let (head_gen, head_index) = unpack(head);
    if head_index == NIL {
        return Err("head link is nil".into());
    }
    let anchor = core.slot(head_index);
    if anchor.gen.load(Ordering::Relaxed) != head_gen {
        return Err("anchor generation stale".into());
    }
    let anchor_state = anchor.state.load(Ordering::Relaxed);
    if anchor_state != STATE_ANCHOR && anchor_state != STATE_ANCHOR_HELD {
        return Err(format!("anchor state is {} not anchor", anchor_state));
    }

    let len = core.len.load(Ordering::Acquire);
    let mut count = 0usize;
    let mut last = head;
    let mut link = anchor.next.load(Ordering::Acquire);
    while unpack(link).1 != NIL {
        if count > len {
            return Err(format!("chain longer than len {}", len));
        }
        let (gen, index) = unpack(link);
        let slot = core.slot(index);
        if slot.gen.load(Ordering::Relaxed) != gen {
            return Err(format!("slot {} generation stale", index));
        }
        if slot.state.load(Ordering::Relaxed) != STATE_DATA {
            return Err(format!("slot {} linked but not data", index));
        }
        last = link;
        link = slot.next.load(Ordering::Acquire);
        count += 1;
    }
    if count != len {
        return Err(format!("len {} but chain holds {}", len, count));
    }
    let tail = core.tail.load(Ordering::Acquire);
    if tail != last {
        return Err("tail does not match last chain slot".into());
    }
    Ok(())
}

/// Shared read-only handle; cloneable, safe alongside both end handles.
pub struct ListReader<T> {
    core: Arc<ListCore<T>>,
}

impl<T> Clone for ListReader<T> {
    fn clone(&self) -> Self {
        ListReader {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync> ListReader<T> {
    /// Enter a read pass. While the guard lives, no slot it can reach will
    /// be reclaimed, so yielded references stay valid. Entry is one atomic
    /// RMW and never blocks.
    pub fn guard(&self) -> ReadGuard<'_, T> {
        self.core.readers.fetch_add(1, Ordering::SeqCst);
        ReadGuard { core: &self.core }
    }

    pub fn len(&self) -> usize {
        self.core.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII token for one lock-free traversal.
pub struct ReadGuard<'a, T> {
    core: &'a ListCore<T>,
}

impl<'a, T: Send + Sync> ReadGuard<'a, T> {
    /// Iterate the data slots front to back.
    pub fn iter(&self) -> ListIter<'_, T> {
        ListIter {
            core: self.core,
            link: self.core.head.load(Ordering::Acquire),
        }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.core.readers.fetch_sub(1, Ordering::Release);
    }
}

/// Forward traversal; ends early (rather than crashing) if it loses a race
/// with clear or truncate and walks onto a stale link. Entries consumed
/// while the iteration is in flight are skipped, not replayed.
pub struct ListIter<'a, T> {
    core: &'a ListCore<T>,
    link: u64,
}

impl<'a, T: Send + Sync> Iterator for ListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let (gen, index) = unpack(self.link);
            if index == NIL {
                return None;
            }
            let slot = self.core.slot(index);
            if slot.gen.load(Ordering::Acquire) != gen {
                return None;
            }
            match slot.state.load(Ordering::Acquire) {
                STATE_ANCHOR | STATE_ANCHOR_HELD => {
                    self.link = slot.next.load(Ordering::Acquire);
                }
                STATE_DATA => {
                    self.link = slot.next.load(Ordering::Acquire);
                    // Alive for the guard's lifetime: reclamation is
                    // deferred while any guard is active.
                    let value = unsafe { (*slot.value.get()).assume_init_ref() };
                    return Some(value);
                }
                _ => return None,
            }
        }
    }
}
