//! Chunk File Format
//!
//! A journal is a directory of chunk files named `{chunk_id:016x}.chunk`,
//! with chunk ids assigned monotonically at roll-over. Only the last chunk
//! of a journal accepts appends; earlier chunks are sealed.
//!
//! ## Frame Format (little-endian)
//!
//! ```text
//! ┌─────────────┬──────────────┬───────────┐
//! │ payload len │ CRC32        │ payload   │
//! │ (4 bytes)   │ (4 bytes)    │ (N bytes) │
//! └─────────────┴──────────────┴───────────┘
//! ```
//!
//! The CRC32 covers the payload only, so a torn append is detected either
//! by a short read or by a checksum mismatch.
//!
//! ## Payload Codec
//!
//! ```text
//! [i64 ts][u32 msg_len][msg bytes][u16 n_fields]
//! ([u16 key_len][key][u16 val_len][val])*
//! ```
//!
//! ## Record Addressing
//!
//! Reads address records by index within the chunk. The byte offset of
//! every frame is kept in an in-memory index (`ChunkMeta::offsets`) built
//! while appending, and rebuilt by scanning the file when an existing
//! chunk is opened. A torn frame at the tail of the active chunk is
//! truncated away during the scan, the same way a write-ahead log recovers.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use loghouse_core::{Error, LogEvent, Result};

/// Bytes of frame header preceding each payload: length + CRC.
pub const FRAME_HEADER: usize = 8;

/// Upper bound on a single frame payload. Anything larger is corruption.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// File extension for chunk files.
pub const CHUNK_EXT: &str = "chunk";

/// Renders the file name for a chunk id.
pub fn chunk_file_name(chunk_id: u64) -> String {
    format!("{:016x}.{}", chunk_id, CHUNK_EXT)
}

/// Parses a chunk id back out of a file name, if it is a chunk file.
pub fn parse_chunk_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{}", CHUNK_EXT))?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Encodes one event into its payload form.
pub fn encode_event(ev: &LogEvent, buf: &mut BytesMut) {
    buf.put_i64_le(ev.ts);
    buf.put_u32_le(ev.msg.len() as u32);
    buf.put_slice(&ev.msg);
    buf.put_u16_le(ev.fields.len() as u16);
    for (k, v) in &ev.fields {
        buf.put_u16_le(k.len() as u16);
        buf.put_slice(k.as_bytes());
        buf.put_u16_le(v.len() as u16);
        buf.put_slice(v.as_bytes());
    }
}

/// Decodes one event from a frame payload.
pub fn decode_event(payload: &[u8]) -> Result<LogEvent> {
    let mut cur = payload;
    if cur.remaining() < 12 {
        return Err(Error::Corrupt("event payload too short".to_string()));
    }
    let ts = cur.get_i64_le();
    let msg_len = cur.get_u32_le() as usize;
    if cur.remaining() < msg_len {
        return Err(Error::Corrupt("event payload truncated in msg".to_string()));
    }
    let msg = Bytes::copy_from_slice(&cur[..msg_len]);
    cur.advance(msg_len);

    if cur.remaining() < 2 {
        return Err(Error::Corrupt("event payload truncated in fields".to_string()));
    }
    let n_fields = cur.get_u16_le() as usize;
    let mut fields = Vec::with_capacity(n_fields);
    for _ in 0..n_fields {
        let k = read_small_str(&mut cur)?;
        let v = read_small_str(&mut cur)?;
        fields.push((k, v));
    }

    Ok(LogEvent {
        ts,
        msg,
        fields,
    })
}

fn read_small_str(cur: &mut &[u8]) -> Result<String> {
    if cur.remaining() < 2 {
        return Err(Error::Corrupt("event field truncated".to_string()));
    }
    let len = cur.get_u16_le() as usize;
    if cur.remaining() < len {
        return Err(Error::Corrupt("event field truncated".to_string()));
    }
    let s = std::str::from_utf8(&cur[..len])
        .map_err(|_| Error::Corrupt("event field is not UTF-8".to_string()))?
        .to_string();
    cur.advance(len);
    Ok(s)
}

/// Wraps a payload in a length+CRC frame.
pub fn frame_payload(payload: &[u8], out: &mut BytesMut) {
    out.put_u32_le(payload.len() as u32);
    out.put_u32_le(crc32fast::hash(payload));
    out.put_slice(payload);
}

/// Verifies and strips the frame around a payload read from disk.
pub fn check_frame(crc: u32, payload: &[u8], path: &Path) -> Result<()> {
    if crc32fast::hash(payload) != crc {
        return Err(Error::Corrupt(format!(
            "CRC mismatch in {}",
            path.display()
        )));
    }
    Ok(())
}

/// In-memory description of one chunk file.
#[derive(Debug)]
pub struct ChunkMeta {
    /// Chunk id, also encoded in the file name.
    pub id: u64,

    /// Path of the chunk file.
    pub path: PathBuf,

    /// FD-pool client id this chunk's file is registered under.
    pub pool_cid: u64,

    /// Byte offset of each frame start, by record index.
    pub offsets: Vec<u64>,

    /// Bytes of valid framed data.
    pub size: u64,

    /// Sealed chunks no longer accept appends.
    pub sealed: bool,
}

impl ChunkMeta {
    /// Creates the meta for a brand new, empty chunk.
    pub fn new(id: u64, path: PathBuf) -> Self {
        let pool_cid = loghouse_core::hash::fnv1a64(path.to_string_lossy().as_bytes());
        Self {
            id,
            path,
            pool_cid,
            offsets: Vec::new(),
            size: 0,
            sealed: false,
        }
    }

    /// Opens an existing chunk file and rebuilds its frame index by
    /// scanning. Returns the meta and the number of trailing bytes that did
    /// not form a complete, checksummed frame (a torn append).
    pub async fn open(id: u64, path: PathBuf) -> Result<(Self, u64)> {
        let mut meta = Self::new(id, path);
        let file = File::open(&meta.path).await?;
        let file_len = file.metadata().await?.len();
        let mut rd = BufReader::with_capacity(256 * 1024, file);

        let mut off: u64 = 0;
        let mut header = [0u8; FRAME_HEADER];
        let mut payload = Vec::new();
        loop {
            match rd.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if len > MAX_FRAME {
                break; // garbage length, treat the rest as torn
            }
            payload.resize(len as usize, 0);
            match rd.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if crc32fast::hash(&payload) != crc {
                break; // torn or corrupt tail
            }
            meta.offsets.push(off);
            off += (FRAME_HEADER + len as usize) as u64;
        }

        meta.size = off;
        let torn = file_len - off;
        Ok((meta, torn))
    }

    /// Number of records in the chunk.
    pub fn record_count(&self) -> u32 {
        self.offsets.len() as u32
    }

    /// Byte offset of the frame for a record index.
    pub fn offset_of(&self, idx: u32) -> Option<u64> {
        self.offsets.get(idx as usize).copied()
    }

    /// Records a newly appended frame.
    pub fn push_frame(&mut self, frame_len: u64) {
        self.offsets.push(self.size);
        self.size += frame_len;
    }
}
