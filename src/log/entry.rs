// Log Entry Types and Record Framing
//
// Defines the replicated log entry, the persisted log metadata, and the
// cluster configuration carried by CONFIGURATION entries. The CRC frame
// codec here wraps every record the engine puts on disk: log records,
// the log metadata file, and the snapshot metadata file all share the
// `[crc32 widened to 8 bytes][len: 4 bytes][body]` layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

use crate::error::{RaftError, Result};

/// Election epoch; at most one leader per term.
pub type Term = u64;

/// Position in the replicated log. Indices are dense and 1-based.
pub type LogIndex = u64;

/// Identifier of a cluster member.
pub type ServerId = u32;

/// Kind of payload carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Opaque command for the host state machine.
    Data,
    /// Serialized `ClusterConfiguration` taking effect when applied.
    Configuration,
}

/// Entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that first appended this entry.
    pub term: Term,
    /// Index of this entry in the log.
    pub index: LogIndex,
    /// Payload interpretation.
    pub entry_type: EntryType,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, entry_type: EntryType, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            entry_type,
            payload,
        }
    }

    /// Serialize this entry into a record body.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decode an entry from a record body.
    pub(crate) fn decode(body: &[u8]) -> Result<Self> {
        let (entry, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        Ok(entry)
    }
}

/// One addressable member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(id: ServerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// The active set of cluster members.
///
/// The effective configuration is the latest CONFIGURATION entry applied,
/// falling back to the snapshot's configuration when the log holds none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub servers: Vec<ServerInfo>,
}

impl ClusterConfiguration {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// Votes needed for a majority of the current voters.
    pub fn quorum_size(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    /// A copy of this configuration with one server added.
    pub fn with_server(&self, server: ServerInfo) -> Self {
        let mut servers = self.servers.clone();
        servers.retain(|s| s.id != server.id);
        servers.push(server);
        servers.sort_by_key(|s| s.id);
        Self { servers }
    }

    /// A copy of this configuration with one server removed.
    pub fn without_server(&self, id: ServerId) -> Self {
        let servers = self
            .servers
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        Self { servers }
    }

    /// Serialize for a CONFIGURATION entry payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decode a CONFIGURATION entry payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (config, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
        Ok(config)
    }
}

/// Persistent per-node log metadata.
///
/// Written through `SegmentedLog::update_meta` before any RPC response
/// reveals the new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub first_log_index: LogIndex,
    pub commit_index: LogIndex,
}

impl Default for LogMetadata {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            first_log_index: 1,
            commit_index: 0,
        }
    }
}

impl LogMetadata {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub(crate) fn decode(body: &[u8]) -> Result<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        Ok(meta)
    }
}

/// Bytes of frame header preceding every record body.
pub(crate) const FRAME_HEADER_LEN: u64 = 12;

/// Largest record body accepted on read. Anything larger is treated as a
/// torn length field.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Result of pulling one frame off a reader.
#[derive(Debug)]
pub(crate) enum FrameRead {
    /// A record with a valid checksum.
    Frame(Vec<u8>),
    /// Clean end of input.
    Eof,
    /// Torn or checksum-mismatched record; nothing beyond it is valid.
    Corrupt,
}

/// Write one CRC-framed record; returns bytes written.
pub(crate) fn write_frame(writer: &mut impl Write, body: &[u8]) -> Result<u64> {
    let checksum = crc32fast::hash(body) as u64;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)?;
    Ok(FRAME_HEADER_LEN + body.len() as u64)
}

/// Read one CRC-framed record.
pub(crate) fn read_frame(reader: &mut impl Read) -> Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match read_fully(reader, &mut header)? {
        ReadState::Complete => {}
        ReadState::Empty => return Ok(FrameRead::Eof),
        ReadState::Partial => return Ok(FrameRead::Corrupt),
    }

    let mut checksum_bytes = [0u8; 8];
    checksum_bytes.copy_from_slice(&header[0..8]);
    let checksum = u64::from_le_bytes(checksum_bytes);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..12]);
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Ok(FrameRead::Corrupt);
    }

    let mut body = vec![0u8; len as usize];
    match read_fully(reader, &mut body)? {
        ReadState::Complete => {}
        ReadState::Empty | ReadState::Partial => return Ok(FrameRead::Corrupt),
    }

    if crc32fast::hash(&body) as u64 != checksum {
        return Ok(FrameRead::Corrupt);
    }
    Ok(FrameRead::Frame(body))
}

/// Decode a CRC-framed record held entirely in memory (metadata files).
pub(crate) fn decode_framed(buf: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(buf);
    match read_frame(&mut cursor)? {
        FrameRead::Frame(body) => Ok(body),
        FrameRead::Eof | FrameRead::Corrupt => Err(RaftError::Corruption(
            "framed record failed checksum validation".to_string(),
        )),
    }
}

enum ReadState {
    Complete,
    Empty,
    Partial,
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadState> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadState::Empty
                } else {
                    ReadState::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadState::Complete)
}
