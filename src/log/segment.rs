// Log Segment Files
//
// A segment is a bounded-size file of CRC-framed log records covering a
// contiguous index range. The file name is the zero-padded first index, so
// lexicographic directory order equals index order. Each open segment keeps
// an in-memory slot table (offset, length, term per record), making term
// lookups memory-only and entry reads a single seek.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use crate::log::entry::{
    read_frame, write_frame, FrameRead, LogEntry, LogIndex, Term, FRAME_HEADER_LEN,
};

const SEGMENT_SUFFIX: &str = ".seg";

/// Location and term of one record within a segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntrySlot {
    pub offset: u64,
    pub len: u32,
    pub term: Term,
}

/// File name for a segment starting at `first_index`.
pub(crate) fn segment_file_name(first_index: LogIndex) -> String {
    format!("{:020}{}", first_index, SEGMENT_SUFFIX)
}

/// Recover the first index from a segment file name.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<LogIndex> {
    name.strip_suffix(SEGMENT_SUFFIX)?.parse().ok()
}

/// One open segment file and its record index.
pub(crate) struct Segment {
    path: PathBuf,
    file: File,
    first_index: LogIndex,
    slots: Vec<EntrySlot>,
    size: u64,
}

impl Segment {
    /// Create a fresh segment whose first record will be `first_index`.
    pub fn create(dir: &Path, first_index: LogIndex) -> Result<Self> {
        let path = dir.join(segment_file_name(first_index));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            first_index,
            slots: Vec::new(),
            size: 0,
        })
    }

    /// Open an existing segment, scanning and CRC-checking every record.
    ///
    /// The scan stops at the first torn or mismatched record; the file is
    /// truncated there and `clean` comes back false, telling the caller to
    /// discard any later segments as well.
    pub fn open(path: &Path) -> Result<(Self, bool)> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RaftError::Corruption(format!("bad segment path {:?}", path)))?;
        let first_index = parse_segment_file_name(name).ok_or_else(|| {
            RaftError::Corruption(format!("segment file name {:?} is not an index", name))
        })?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();

        let mut slots = Vec::new();
        let mut offset = 0u64;
        let mut clean = true;
        {
            let mut reader = BufReader::new(&file);
            loop {
                match read_frame(&mut reader)? {
                    FrameRead::Frame(body) => {
                        let entry = match LogEntry::decode(&body) {
                            Ok(entry) => entry,
                            Err(_) => {
                                clean = false;
                                break;
                            }
                        };
                        let expected = first_index + slots.len() as u64;
                        if entry.index != expected {
                            clean = false;
                            break;
                        }
                        slots.push(EntrySlot {
                            offset,
                            len: body.len() as u32,
                            term: entry.term,
                        });
                        offset += FRAME_HEADER_LEN + body.len() as u64;
                    }
                    FrameRead::Eof => break,
                    FrameRead::Corrupt => {
                        clean = false;
                        break;
                    }
                }
            }
        }

        if offset < file_len {
            // Drop the torn tail so future appends start at a valid record
            // boundary.
            file.set_len(offset)?;
            file.sync_data()?;
            clean = false;
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                first_index,
                slots,
                size: offset,
            },
            clean,
        ))
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index of the last record, or `None` for an empty segment.
    pub fn last_index(&self) -> Option<LogIndex> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.first_index + self.slots.len() as u64 - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append pre-encoded record bodies. Bodies are buffered into a single
    /// write; call `sync` once per batch before acknowledging.
    pub fn append(&mut self, bodies: &[(Vec<u8>, Term)]) -> Result<()> {
        let mut buf = Vec::with_capacity(
            bodies
                .iter()
                .map(|(b, _)| FRAME_HEADER_LEN as usize + b.len())
                .sum(),
        );
        let mut slots = Vec::with_capacity(bodies.len());
        let mut offset = self.size;
        for (body, term) in bodies {
            let written = write_frame(&mut buf, body)?;
            slots.push(EntrySlot {
                offset,
                len: body.len() as u32,
                term: *term,
            });
            offset += written;
        }

        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(&buf)?;
        self.slots.extend(slots);
        self.size = offset;
        Ok(())
    }

    /// Flush appended records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Term of the record at `index`, if this segment holds it.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.slot(index).map(|s| s.term)
    }

    /// Read and decode the record at `index`, re-verifying its checksum.
    pub fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        let slot = self
            .slot(index)
            .ok_or_else(|| RaftError::NotFound(format!("log index {}", index)))?;

        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(slot.offset))?;
        let mut framed = reader.take(FRAME_HEADER_LEN + slot.len as u64);
        match read_frame(&mut framed)? {
            FrameRead::Frame(body) => {
                let entry = LogEntry::decode(&body)?;
                if entry.index != index {
                    return Err(RaftError::Corruption(format!(
                        "segment {:?} holds index {} where {} was expected",
                        self.path, entry.index, index
                    )));
                }
                Ok(entry)
            }
            FrameRead::Eof | FrameRead::Corrupt => Err(RaftError::Corruption(format!(
                "unreadable record at index {} in {:?}",
                index, self.path
            ))),
        }
    }

    /// Discard all records at `index` and above.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let slot = self
            .slot(index)
            .ok_or_else(|| RaftError::NotFound(format!("log index {}", index)))?;
        let offset = slot.offset;
        self.file.set_len(offset)?;
        self.file.sync_data()?;
        self.slots.truncate((index - self.first_index) as usize);
        self.size = offset;
        Ok(())
    }

    /// Delete the backing file. Consumes the segment.
    pub fn remove(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn slot(&self, index: LogIndex) -> Option<&EntrySlot> {
        if index < self.first_index {
            return None;
        }
        self.slots.get((index - self.first_index) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry::EntryType;
    use tempfile::TempDir;

    fn encoded(term: Term, index: LogIndex, payload: &[u8]) -> (Vec<u8>, Term) {
        let entry = LogEntry::new(term, index, EntryType::Data, payload.to_vec());
        (entry.encode().unwrap(), term)
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();

        segment
            .append(&[encoded(1, 1, b"a"), encoded(1, 2, b"b"), encoded(2, 3, b"c")])
            .unwrap();
        segment.sync().unwrap();

        assert_eq!(segment.first_index(), 1);
        assert_eq!(segment.last_index(), Some(3));
        assert_eq!(segment.term_at(3), Some(2));
        assert_eq!(segment.read_entry(2).unwrap().payload, b"b");
        assert!(segment.read_entry(4).is_err());
    }

    #[test]
    fn reopen_recovers_slots() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 5).unwrap();
            segment
                .append(&[encoded(2, 5, b"x"), encoded(2, 6, b"y")])
                .unwrap();
            segment.sync().unwrap();
            segment.path().to_path_buf()
        };

        let (segment, clean) = Segment::open(&path).unwrap();
        assert!(clean);
        assert_eq!(segment.first_index(), 5);
        assert_eq!(segment.last_index(), Some(6));
        assert_eq!(segment.read_entry(6).unwrap().payload, b"y");
    }

    #[test]
    fn reopen_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut segment = Segment::create(dir.path(), 1).unwrap();
            segment
                .append(&[encoded(1, 1, b"keep"), encoded(1, 2, b"torn")])
                .unwrap();
            segment.sync().unwrap();
            segment.path().to_path_buf()
        };

        // Chop a few bytes off the last record to simulate a crash mid-write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let (segment, clean) = Segment::open(&path).unwrap();
        assert!(!clean);
        assert_eq!(segment.last_index(), Some(1));
        assert_eq!(segment.read_entry(1).unwrap().payload, b"keep");

        // The tail is gone from disk too, so a fresh append lands cleanly.
        let reopened_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(reopened_len, segment.size());
    }

    #[test]
    fn truncate_from_discards_suffix() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1).unwrap();
        segment
            .append(&[encoded(1, 1, b"a"), encoded(1, 2, b"b"), encoded(1, 3, b"c")])
            .unwrap();
        segment.sync().unwrap();

        segment.truncate_from(2).unwrap();
        assert_eq!(segment.last_index(), Some(1));
        assert!(segment.read_entry(2).is_err());

        segment.append(&[encoded(4, 2, b"b2")]).unwrap();
        segment.sync().unwrap();
        assert_eq!(segment.read_entry(2).unwrap().term, 4);
    }

    #[test]
    fn file_names_sort_by_index() {
        let a = segment_file_name(99);
        let b = segment_file_name(100);
        assert!(a < b);
        assert_eq!(parse_segment_file_name(&a), Some(99));
        assert_eq!(parse_segment_file_name("junk"), None);
    }
}
