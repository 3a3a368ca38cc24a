use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hybridlog::{CompactingLog, CompactionMode, Config};
use tempfile::tempdir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn compacting_config(path: &std::path::Path, mode: CompactionMode, compact_after: u64) -> Config {
    let mut cfg = Config::new(path);
    cfg.buffer_size = 4096;
    cfg.high_water_mark = 30;
    cfg.auto_compaction = true;
    cfg.compaction_mode = mode;
    cfg.compact_after = compact_after;
    cfg.compaction_chunk_size = 4096;
    cfg
}

#[test]
fn time_based_cycle_preserves_contents_without_tombstones() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = CompactingLog::open(compacting_config(&path, CompactionMode::TimeBased, 1)).unwrap();
    let data = pattern(8192);
    log.append(&data).unwrap();
    // Let at least one compaction cycle run.
    thread::sleep(Duration::from_millis(2500));
    assert_eq!(log.size(), 8192);
    let mut buf = vec![0u8; 8192];
    assert_eq!(log.read_at(&mut buf, 0).unwrap(), 8192);
    assert_eq!(buf, data);
    log.close().unwrap();
}

#[test]
fn fragmentation_monitor_fires_once_the_threshold_is_reached() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = CompactingLog::open(compacting_config(
        &path,
        CompactionMode::FragmentationBased,
        2,
    ))
    .unwrap();
    log.append(&vec![b'a'; 100]).unwrap();
    log.append(&vec![b'b'; 100]).unwrap();
    log.append(&vec![b'c'; 100]).unwrap();
    log.delete(0, 100).unwrap();
    log.delete(100, 100).unwrap();
    assert_eq!(log.fragments(), 2);
    thread::sleep(Duration::from_millis(2500));
    assert_eq!(log.size(), 100);
    assert_eq!(log.fragments(), 0);
    let mut buf = vec![0u8; 100];
    assert_eq!(log.read_at(&mut buf, 0).unwrap(), 100);
    assert!(buf.iter().all(|byte| *byte == b'c'));
    log.close().unwrap();
}

#[test]
fn monitor_below_threshold_leaves_the_log_alone() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = CompactingLog::open(compacting_config(
        &path,
        CompactionMode::FragmentationBased,
        10,
    ))
    .unwrap();
    log.append(&pattern(1000)).unwrap();
    log.delete(0, 100).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(log.size(), 1000);
    assert_eq!(log.fragments(), 1);
    log.close().unwrap();
}

#[test]
fn chunked_compaction_preserves_the_live_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    // Chunk size far below the live span so the copy loop iterates.
    let mut cfg = compacting_config(&path, CompactionMode::FragmentationBased, u64::MAX);
    cfg.compaction_chunk_size = 512;
    let log = CompactingLog::open(cfg).unwrap();
    let data = pattern(65536);
    log.append(&data).unwrap();
    log.delete(0, 32768).unwrap();
    log.compact().unwrap();
    assert_eq!(log.size(), 32768);
    let mut buf = vec![0u8; 32768];
    assert_eq!(log.read_at(&mut buf, 0).unwrap(), 32768);
    assert_eq!(&buf[..], &data[32768..]);
    // The compacted offset space accepts further appends.
    log.append(b"tail").unwrap();
    assert_eq!(log.size(), 32772);
    log.close().unwrap();
}

#[test]
fn reads_proceed_while_the_monitor_compacts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = Arc::new(
        CompactingLog::open(compacting_config(&path, CompactionMode::TimeBased, 1)).unwrap(),
    );
    let data = pattern(1024);
    for _ in 0..1000 {
        log.append(&data).unwrap();
    }
    let readers: Vec<_> = (0..100)
        .map(|_| {
            let log = log.clone();
            thread::spawn(move || {
                // Span a couple of monitor ticks so reads overlap rewrites.
                for _ in 0..20 {
                    let mut buf = [0u8; 128];
                    let n = log.read_at(&mut buf, 128).unwrap();
                    assert_eq!(n, 128);
                    assert_eq!(buf[0], 128);
                    thread::sleep(Duration::from_millis(100));
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(log.size(), 1024 * 1000);
    log.close().unwrap();
}

#[test]
fn appends_during_a_compaction_cycle_are_kept() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = Arc::new(
        CompactingLog::open(compacting_config(&path, CompactionMode::TimeBased, 1)).unwrap(),
    );
    let writer = {
        let log = log.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                log.append(&pattern(1024)).unwrap();
                thread::sleep(Duration::from_millis(10));
            }
        })
    };
    writer.join().unwrap();
    assert_eq!(log.size(), 1024 * 200);
    let mut buf = vec![0u8; 1024];
    assert_eq!(log.read_at(&mut buf, 1024 * 199).unwrap(), 1024);
    assert_eq!(buf, pattern(1024));
    log.close().unwrap();
}

#[test]
fn close_stops_the_monitor_promptly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.log");
    let log = CompactingLog::open(compacting_config(
        &path,
        CompactionMode::FragmentationBased,
        1,
    ))
    .unwrap();
    log.append(b"short-lived").unwrap();
    log.close().unwrap();
    log.close().unwrap();
}
