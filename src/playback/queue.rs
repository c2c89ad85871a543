//! Ordered stream queue with peek reconciliation
//!
//! The queue is the playback order's source of truth: the head stream is
//! what the output renders, the entries behind it are pre-opened "peek"
//! streams for upcoming songs. Two views exist side by side: a plain `Vec`
//! the decode/control side edits under the player lock, and the lock-free
//! [`SlotList`] the render path iterates. Edits keep the two in step
//! without blanking the render view mid-song: head retirement and
//! promotion advance the slot list by popping, reconciliation cuts the
//! peek tail after the head and appends the new tail, and only outright
//! head replacement rebuilds the chain.
//!
//! All methods here are pure structure manipulation, safe to call under the
//! player lock. Opening a stream blocks on I/O, so callers open streams
//! *before* taking the lock and hand the results in; retired streams are
//! returned to the caller to drop *after* releasing it.

use crate::playback::slot_list::{self, ListConsumer, ListProducer, ListReader, SlotList};
use crate::playback::stream::SongStream;
use crate::source::{SongDesc, SongId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct StreamQueue {
    prod: ListProducer<Arc<SongStream>>,
    cons: ListConsumer<Arc<SongStream>>,
    /// Decode-side mirror of the slot list, head first.
    entries: Vec<Arc<SongStream>>,
    peek_count: usize,
}

impl StreamQueue {
    /// Create an empty queue plus the reader handle the render path uses to
    /// walk it.
    pub fn new(peek_count: usize) -> (Self, ListReader<Arc<SongStream>>) {
        let (prod, cons, reader) = SlotList::new().split();
        (
            StreamQueue {
                prod,
                cons,
                entries: Vec::new(),
                peek_count,
            },
            reader,
        )
    }

    pub fn head(&self) -> Option<&Arc<SongStream>> {
        self.entries.first()
    }

    pub fn entries(&self) -> &[Arc<SongStream>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry matching `id`, if any.
    pub fn find(&self, id: SongId) -> Option<Arc<SongStream>> {
        self.entries.iter().find(|s| s.id() == id).cloned()
    }

    /// Install `stream` as the new head, displacing the old one. Peeks are
    /// kept. Returns the retired streams.
    pub fn set_head(&mut self, stream: Arc<SongStream>) -> Vec<Arc<SongStream>> {
        let retired = if self.entries.is_empty() {
            self.entries.push(stream);
            Vec::new()
        } else {
            let old = std::mem::replace(&mut self.entries[0], stream);
            vec![old]
        };
        self.rebuild_rt_list();
        retired
    }

    /// Promote an existing entry to head, retiring everything before it.
    /// Returns `None` when no entry matches (caller opens a fresh stream
    /// instead).
    pub fn promote(&mut self, id: SongId) -> Option<Vec<Arc<SongStream>>> {
        let pos = self.entries.iter().position(|s| s.id() == id)?;
        if pos == 0 {
            return Some(Vec::new());
        }
        let retired: Vec<Arc<SongStream>> = self.entries.drain(..pos).collect();
        // Advance the slot list by popping rather than rebuilding, so the
        // render path sees a live head at every point in between.
        let mut in_step = true;
        for old in &retired {
            match self.cons.pop_front() {
                Some(popped) if Arc::ptr_eq(&popped, old) => {}
                _ => {
                    in_step = false;
                    break;
                }
            }
        }
        if in_step {
            self.cons.try_reclaim();
            // The last pop parked a copy of its value in the anchor; take
            // it back so the final drop goes with the retired vec, outside
            // the player lock.
            let _ = self.cons.drain_anchor();
        } else {
            warn!(song = %id, "slot list out of step with queue, rebuilding");
            self.rebuild_rt_list();
        }
        debug!(song = %id, retired = retired.len(), "promoted peek to head");
        Some(retired)
    }

    /// Retire the head; the next peek becomes current. The slot list
    /// advances in place, so the render path sees the new head on its next
    /// fill without waiting for a rebuild.
    pub fn pop_head(&mut self) -> Option<Arc<SongStream>> {
        if self.entries.is_empty() {
            return None;
        }
        let head = self.entries.remove(0);
        let popped = self.cons.pop_front();
        if popped.as_ref().map_or(true, |p| !Arc::ptr_eq(p, &head)) {
            warn!(song = %head.id(), "slot list out of step with queue, rebuilding");
            self.rebuild_rt_list();
        } else {
            self.cons.try_reclaim();
            // The pop parked a copy of the head in the anchor; take it
            // back so the final drop goes with the returned value, outside
            // the player lock.
            let _ = self.cons.drain_anchor();
        }
        Some(head)
    }

    /// Which upcoming songs have no matching peek entry yet. The caller
    /// opens these without holding the player lock, then calls
    /// [`StreamQueue::reconcile_peeks`]. Duplicate ids after the first are
    /// ignored.
    pub fn missing_peeks(&self, upcoming: &[SongDesc]) -> Vec<SongDesc> {
        let head_id = self.entries.first().map(|s| s.id());
        let mut avail: Vec<SongId> = self.entries.iter().skip(1).map(|s| s.id()).collect();
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for desc in upcoming.iter().take(self.peek_count) {
            if Some(desc.id) == head_id {
                continue;
            }
            if let Some(pos) = avail.iter().position(|&id| id == desc.id) {
                avail.remove(pos);
                seen.insert(desc.id);
                continue;
            }
            if !seen.insert(desc.id) {
                continue;
            }
            missing.push(desc.clone());
        }
        missing
    }

    /// Rebuild the peek tail to match `upcoming`, reusing existing entries
    /// by song id (first match wins) and taking unmatched ids from
    /// `opened`. Entries for songs no longer upcoming are returned for the
    /// caller to drop outside the lock.
    pub fn reconcile_peeks(
        &mut self,
        upcoming: &[SongDesc],
        opened: &mut Vec<Arc<SongStream>>,
    ) -> Vec<Arc<SongStream>> {
        let mut new_entries: Vec<Arc<SongStream>> = Vec::with_capacity(self.peek_count + 1);
        if let Some(head) = self.entries.first() {
            new_entries.push(Arc::clone(head));
        }

        let head_id = self.entries.first().map(|s| s.id());
        let mut used = HashSet::new();
        for desc in upcoming.iter().take(self.peek_count) {
            if Some(desc.id) == head_id {
                warn!(song = %desc.id, "upcoming song equals the current song, skipping");
                continue;
            }
            if used.contains(&desc.id) {
                warn!(song = %desc.id, "duplicate song in upcoming list, skipping");
                continue;
            }
            let reuse = self
                .entries
                .iter()
                .skip(1)
                .find(|s| s.id() == desc.id && !new_entries.iter().any(|n| Arc::ptr_eq(n, *s)))
                .cloned();
            let stream = match reuse {
                Some(stream) => stream,
                None => match opened.iter().position(|s| s.id() == desc.id) {
                    Some(pos) => opened.swap_remove(pos),
                    None => {
                        // Open failed or was never requested; leave a hole
                        // rather than block here.
                        debug!(song = %desc.id, "no stream available for peek");
                        continue;
                    }
                },
            };
            used.insert(desc.id);
            new_entries.push(stream);
        }

        let retired: Vec<Arc<SongStream>> = self
            .entries
            .iter()
            .filter(|old| !new_entries.iter().any(|n| Arc::ptr_eq(n, *old)))
            .cloned()
            .collect();

        // Rewrite the slot list without ever unlinking the head: cut the
        // old peek tail after it, then append the new one. A fill running
        // in parallel keeps seeing the current song throughout.
        let kept = usize::from(self.entries.first().is_some());
        slot_list::truncate(&mut self.prod, &mut self.cons, kept);
        for entry in new_entries.iter().skip(kept) {
            self.prod.push_back(Arc::clone(entry));
        }
        self.cons.try_reclaim();

        self.entries = new_entries;
        retired
    }

    /// Append a pre-opened stream behind the existing entries. Append-only,
    /// so the render path's view extends in place.
    pub fn push_peek(&mut self, stream: Arc<SongStream>) {
        self.entries.push(Arc::clone(&stream));
        self.prod.push_back(stream);
    }

    /// Drop everything. Returns the retired streams.
    pub fn clear(&mut self) -> Vec<Arc<SongStream>> {
        let retired = std::mem::take(&mut self.entries);
        self.rebuild_rt_list();
        retired
    }

    /// Stream copies the slot list rescued during reclamation: cut peek
    /// tails, and parked head copies a render guard kept alive past their
    /// drain. The worker takes these once per cycle and drops them outside
    /// the player lock; a stream's teardown never runs inside an edit.
    pub fn take_recovered(&mut self) -> Vec<Arc<SongStream>> {
        self.cons.take_recovered()
    }

    /// Mirror `entries` into the slot list. A render-path guard iterating
    /// the old chain keeps it alive until the guard drops; it sees the new
    /// chain on its next fill.
    fn rebuild_rt_list(&mut self) {
        self.cons.clear(&mut self.prod);
        // Clearing parks the old chain's last value in the anchor; taking
        // it back leaves the list holding no stream beyond the entries.
        let _ = self.cons.drain_anchor();
        for entry in &self.entries {
            self.prod.push_back(Arc::clone(entry));
        }
        self.cons.try_reclaim();
    }
}

impl std::fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.entries.iter().map(|s| s.id().to_string()).collect();
        f.debug_struct("StreamQueue")
            .field("entries", &ids)
            .field("peek_count", &self.peek_count)
            .finish()
    }
}
