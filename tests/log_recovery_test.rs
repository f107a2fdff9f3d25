// Crash-recovery drills for the segmented log: whatever point a write was
// interrupted at, reopening must yield a CRC-valid prefix of the
// pre-crash log and accept fresh appends.

use std::fs;
use std::path::Path;
use tempfile::TempDir;

use rusty_raft::{EntryType, LogEntry, SegmentedLog};

const SEGMENT_SIZE: u64 = 256;

fn fill_log(dir: &Path, count: u64) -> Vec<LogEntry> {
    let mut log = SegmentedLog::open(dir, SEGMENT_SIZE).unwrap();
    let entries: Vec<LogEntry> = (1..=count)
        .map(|i| {
            LogEntry::new(
                1 + i / 10,
                i,
                EntryType::Data,
                format!("record-{:05}", i).into_bytes(),
            )
        })
        .collect();
    log.append(&entries).unwrap();
    log.update_meta(1 + count / 10, Some(1), 1, count / 2).unwrap();
    entries
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for dirent in fs::read_dir(src).unwrap() {
        let dirent = dirent.unwrap();
        let target = dst.join(dirent.file_name());
        if dirent.file_type().unwrap().is_dir() {
            copy_dir(&dirent.path(), &target);
        } else {
            fs::copy(dirent.path(), &target).unwrap();
        }
    }
}

fn last_segment_file(log_dir: &Path) -> std::path::PathBuf {
    let mut names: Vec<_> = fs::read_dir(log_dir.join("segments"))
        .unwrap()
        .map(|d| d.unwrap().path())
        .collect();
    names.sort();
    names.pop().unwrap()
}

#[test]
fn clean_reopen_is_lossless() {
    let dir = TempDir::new().unwrap();
    let entries = fill_log(dir.path(), 40);

    let log = SegmentedLog::open(dir.path(), SEGMENT_SIZE).unwrap();
    assert_eq!(log.first_index(), 1);
    assert_eq!(log.last_index(), 40);
    for entry in &entries {
        assert_eq!(&log.entry_at(entry.index).unwrap(), entry);
    }
    assert_eq!(log.metadata().commit_index, 20);
    assert_eq!(log.metadata().voted_for, Some(1));
}

#[test]
fn torn_write_leaves_a_valid_prefix_at_every_cut() {
    let master = TempDir::new().unwrap();
    let entries = fill_log(master.path(), 40);
    let tail = last_segment_file(master.path());
    let tail_len = fs::metadata(&tail).unwrap().len();

    // Chop the active segment at a spread of byte positions, emulating a
    // crash mid-write at each point.
    let cuts: Vec<u64> = (1..tail_len).step_by(7).collect();
    for cut in cuts {
        let scratch = TempDir::new().unwrap();
        copy_dir(master.path(), scratch.path());
        let victim = last_segment_file(scratch.path());
        let file = fs::OpenOptions::new().write(true).open(&victim).unwrap();
        file.set_len(cut).unwrap();
        drop(file);

        let log = SegmentedLog::open(scratch.path(), SEGMENT_SIZE).unwrap();
        let last = log.last_index();
        assert!(last <= 40, "cut {} resurrected entries", cut);
        for entry in entries.iter().take(last as usize) {
            assert_eq!(
                &log.entry_at(entry.index).unwrap(),
                entry,
                "cut {} corrupted the surviving prefix",
                cut
            );
        }
    }
}

#[test]
fn appends_resume_after_torn_tail() {
    let dir = TempDir::new().unwrap();
    fill_log(dir.path(), 12);

    // Tear a few bytes off the active segment.
    let victim = last_segment_file(dir.path());
    let len = fs::metadata(&victim).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&victim).unwrap();
    file.set_len(len - 4).unwrap();
    drop(file);

    let mut log = SegmentedLog::open(dir.path(), SEGMENT_SIZE).unwrap();
    let resume_at = log.last_index() + 1;
    assert!(resume_at <= 13);

    let fresh: Vec<LogEntry> = (resume_at..resume_at + 5)
        .map(|i| LogEntry::new(9, i, EntryType::Data, b"fresh".to_vec()))
        .collect();
    log.append(&fresh).unwrap();
    assert_eq!(log.last_index(), resume_at + 4);
    assert_eq!(log.term_at(resume_at), Some(9));

    // And the repaired log reopens cleanly.
    let reopened = SegmentedLog::open(dir.path(), SEGMENT_SIZE).unwrap();
    assert_eq!(reopened.last_index(), resume_at + 4);
    assert_eq!(reopened.entry_at(resume_at).unwrap().payload, b"fresh");
}
