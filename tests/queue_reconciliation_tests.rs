//! Queue reconciliation observed through the host seams
//!
//! The in-crate tests check stream reuse by pointer identity; here reuse is
//! observed the way a host would see it: a counting media opener proving a
//! kept song is never reopened when the upcoming list is reshuffled.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use symphonia::core::io::MediaSource;
use tempfile::TempDir;
use tonearm::playback::queue::StreamQueue;
use tonearm::playback::slot_list::ListReader;
use tonearm::playback::stream::SongStream;
use tonearm::source::{MediaFile, MediaOpen, SongDesc, SongId};
use tonearm::Result;

/// Wraps a file opener and counts how many times the media is opened.
struct CountingMedia {
    inner: MediaFile,
    opens: Arc<AtomicUsize>,
}

impl MediaOpen for CountingMedia {
    fn open_media(&self) -> Result<Box<dyn MediaSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_media()
    }

    fn extension_hint(&self) -> Option<&str> {
        self.inner.extension_hint()
    }
}

fn counted_song(dir: &TempDir, name: &str) -> (SongDesc, Arc<AtomicUsize>) {
    let path = dir.path().join(format!("{}.wav", name));
    let spec = WavSpec {
        channels: 2,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec).unwrap();
    for _ in 0..441 {
        writer.write_sample(1000i16).unwrap();
        writer.write_sample(1000i16).unwrap();
    }
    writer.finalize().unwrap();

    let opens = Arc::new(AtomicUsize::new(0));
    let media = CountingMedia {
        inner: MediaFile::new(path),
        opens: Arc::clone(&opens),
    };
    (SongDesc::new(name, Arc::new(media)), opens)
}

fn open_stream(desc: &SongDesc) -> Arc<SongStream> {
    SongStream::open(desc.clone(), 44100, 2).unwrap()
}

fn entry_ids(queue: &StreamQueue) -> Vec<SongId> {
    queue.entries().iter().map(|s| s.id()).collect()
}

fn rt_ids(reader: &ListReader<Arc<SongStream>>) -> Vec<SongId> {
    let guard = reader.guard();
    guard.iter().map(|s| s.id()).collect()
}

#[test]
fn reshuffle_keeps_surviving_peek_without_reopening_it() {
    let dir = TempDir::new().unwrap();
    let (mut queue, _reader) = StreamQueue::new(3);

    let (head, head_opens) = counted_song(&dir, "head");
    let (a, a_opens) = counted_song(&dir, "a");
    let (b, b_opens) = counted_song(&dir, "b");
    let (c, c_opens) = counted_song(&dir, "c");

    queue.set_head(open_stream(&head));
    let upcoming = vec![a.clone(), b.clone(), c.clone()];
    let missing = queue.missing_peeks(&upcoming);
    let mut opened: Vec<Arc<SongStream>> = missing.iter().map(open_stream).collect();
    queue.reconcile_peeks(&upcoming, &mut opened);

    assert_eq!(entry_ids(&queue), vec![head.id, a.id, b.id, c.id]);
    for opens in [&head_opens, &a_opens, &b_opens, &c_opens] {
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    // New upcoming list [B, D]: only D needs an open; B's existing stream
    // carries over untouched.
    let (d, d_opens) = counted_song(&dir, "d");
    let upcoming = vec![b.clone(), d.clone()];
    let missing = queue.missing_peeks(&upcoming);
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].id, d.id);
    let mut opened: Vec<Arc<SongStream>> = missing.iter().map(open_stream).collect();
    let retired = queue.reconcile_peeks(&upcoming, &mut opened);

    assert_eq!(entry_ids(&queue), vec![head.id, b.id, d.id]);
    assert_eq!(b_opens.load(Ordering::SeqCst), 1, "surviving peek reopened");
    assert_eq!(d_opens.load(Ordering::SeqCst), 1);
    assert_eq!(retired.len(), 2);
    let retired_ids: Vec<SongId> = retired.iter().map(|s| s.id()).collect();
    assert!(retired_ids.contains(&a.id));
    assert!(retired_ids.contains(&c.id));
}

#[test]
fn compound_edits_keep_render_view_in_step() {
    let dir = TempDir::new().unwrap();
    let (mut queue, reader) = StreamQueue::new(3);

    let (head, _) = counted_song(&dir, "head");
    let (a, _) = counted_song(&dir, "a");
    let (b, _) = counted_song(&dir, "b");
    let (d, _) = counted_song(&dir, "d");

    queue.set_head(open_stream(&head));
    assert_eq!(rt_ids(&reader), entry_ids(&queue));

    let upcoming = vec![a.clone(), b.clone()];
    let mut opened: Vec<Arc<SongStream>> =
        queue.missing_peeks(&upcoming).iter().map(open_stream).collect();
    queue.reconcile_peeks(&upcoming, &mut opened);
    assert_eq!(rt_ids(&reader), entry_ids(&queue));

    queue.push_peek(open_stream(&d));
    assert_eq!(rt_ids(&reader), entry_ids(&queue));
    assert_eq!(entry_ids(&queue), vec![head.id, a.id, b.id, d.id]);

    // Overtake: jump to b, retiring head and a.
    let retired = queue.promote(b.id).unwrap();
    assert_eq!(retired.len(), 2);
    assert_eq!(entry_ids(&queue), vec![b.id, d.id]);
    assert_eq!(rt_ids(&reader), entry_ids(&queue));

    queue.pop_head().unwrap();
    assert_eq!(entry_ids(&queue), vec![d.id]);
    assert_eq!(rt_ids(&reader), entry_ids(&queue));

    let retired = queue.clear();
    assert_eq!(retired.len(), 1);
    assert!(rt_ids(&reader).is_empty());
}
