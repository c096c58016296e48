//! Round trips through the event log on disk: rotation, reopening and
//! pruning, read back through the public reader.

use std::fs;

use pces_core::config::{LogConfig, PcesConfig};
use pces_core::event::{GossipEvent, PlatformEvent};
use pces_core::pces::{PcesFileTracker, PcesReader, PcesWriter, read_files_from_disk};
use pces_core::window::EventWindow;
use tempfile::TempDir;

#[path = "generators.rs"]
mod generators;
use generators::*;

fn narrow_spans() -> PcesConfig {
    PcesConfig {
        log: LogConfig {
            bootstrap_span: 3,
            bootstrap_span_overlap_factor: 1.0,
            span_overlap_factor: 1.0,
            minimum_span: 1,
            ..LogConfig::default()
        },
        ..PcesConfig::default()
    }
}

fn write_all(
    config: &PcesConfig,
    dir: &TempDir,
    tracker: PcesFileTracker,
    events: &[PlatformEvent],
) -> PcesFileTracker {
    let mut writer = PcesWriter::open(&config.log, dir.path(), tracker).expect("open writer");
    writer.begin_streaming_new_events();
    for event in events {
        assert!(writer.write_event(event).expect("write"));
    }
    writer.sync().expect("sync");
    writer.close().expect("close")
}

fn read_all(config: &PcesConfig, dir: &TempDir) -> Vec<GossipEvent> {
    PcesReader::open(config, dir.path(), 0, 0)
        .expect("open reader")
        .events()
        .collect::<Result<_, _>>()
        .expect("read events")
}

#[test]
fn events_round_trip_across_rotated_files() {
    let dir = TempDir::new().expect("tempdir");
    let config = narrow_spans();
    let events = chain(120);

    let tracker = write_all(&config, &dir, PcesFileTracker::new(0), &events);
    assert!(tracker.len() > 1, "narrow spans should rotate");

    let read = read_all(&config, &dir);
    let written: Vec<GossipEvent> = events.iter().map(|e| e.gossip().clone()).collect();
    assert_eq!(read, written);

    let reader = PcesReader::open(&config, dir.path(), 0, 0).expect("reader");
    assert_eq!(reader.files().len(), tracker.len());
    assert!(reader.recovery_report().is_clean());
    for pair in reader.files().windows(2) {
        assert_eq!(pair[1].sequence(), pair[0].sequence() + 1);
    }
}

#[test]
fn reopened_log_continues_after_previous_session() {
    let dir = TempDir::new().expect("tempdir");
    let config = PcesConfig::default();
    let events = chain(30);

    let first = write_all(&config, &dir, PcesFileTracker::new(0), &events[..10]);
    let discovered = read_files_from_disk(&config.log, dir.path(), 0).expect("discover");
    assert_eq!(discovered.len(), first.len());

    let second = write_all(&config, &dir, discovered, &events[10..]);
    assert_eq!(second.len(), first.len() + 1);

    let read = read_all(&config, &dir);
    assert_eq!(read.len(), 30);
    assert_eq!(read.last(), Some(events[29].gossip()));
}

#[test]
fn lower_bound_skips_older_rounds() {
    let dir = TempDir::new().expect("tempdir");
    let config = narrow_spans();
    let events = chain(40);
    write_all(&config, &dir, PcesFileTracker::new(0), &events);

    let reader = PcesReader::open(&config, dir.path(), 0, 25).expect("reader");
    let rounds: Vec<_> = reader
        .events()
        .map(|event| event.expect("event").birth_round())
        .collect();
    assert!(!rounds.is_empty());
    assert!(rounds.iter().all(|&round| round >= 25));
}

#[test]
fn expired_files_leave_the_log_directory() {
    let dir = TempDir::new().expect("tempdir");
    let config = narrow_spans();
    let events = chain(60);

    let mut writer =
        PcesWriter::open(&config.log, dir.path(), PcesFileTracker::new(0)).expect("open");
    writer.begin_streaming_new_events();
    for event in &events {
        writer.write_event(event).expect("write");
    }
    let before = writer.tracker().len();
    let oldest_upper = writer.tracker().first().expect("file").upper_bound();

    writer
        .update_event_window(EventWindow::new(40, 30, oldest_upper).expect("window"))
        .expect("advance");
    let tracker = writer.close().expect("close");
    assert_eq!(tracker.len(), before);
    assert!(
        tracker
            .files()
            .iter()
            .all(|file| file.upper_bound() > oldest_upper)
    );

    let recycled = fs::read_dir(dir.path().join(&config.log.recycle_dir_name))
        .expect("recycle dir")
        .count();
    assert!(recycled >= 1);

    let read = read_all(&config, &dir);
    assert!(read.len() < events.len());
    assert_eq!(read.last(), Some(events[59].gossip()));
}
