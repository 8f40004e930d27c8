use crate::common::{DbError, DbResult};
use crate::log::{Lsn, NULL_LSN};
use crate::storage::page::NONE_RAW;

/// Record types carried in both logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Update,
    Clr,
    Commit,
    BeginCheckpoint,
    EndCheckpoint,
}

impl RecordKind {
    fn to_u8(self) -> u8 {
        match self {
            RecordKind::Update => 0,
            RecordKind::Clr => 1,
            RecordKind::Commit => 2,
            RecordKind::BeginCheckpoint => 3,
            RecordKind::EndCheckpoint => 4,
        }
    }
    fn from_u8(v: u8) -> DbResult<Self> {
        Ok(match v {
            0 => RecordKind::Update,
            1 => RecordKind::Clr,
            2 => RecordKind::Commit,
            3 => RecordKind::BeginCheckpoint,
            4 => RecordKind::EndCheckpoint,
            _ => return Err(DbError::Storage(format!("invalid record kind {}", v))),
        })
    }
}

/// Chunk tags. Each component owns a disjoint range so a record's payload is
/// self-describing.
pub mod tag {
    pub const SLOT: u8 = 1;
    pub const ROW: u8 = 2;
    pub const FLAGS: u8 = 3;
    pub const HOLDER: u8 = 4;
    pub const OFFSET: u8 = 5;
    pub const OLD: u8 = 6;
    pub const NEW: u8 = 7;
    pub const KEY: u8 = 8;
    pub const ENTRY: u8 = 9;
    pub const ROWID: u8 = 10;
    pub const PREV_ENTRY: u8 = 11;
    pub const DIRTY_PAGES: u8 = 12;
    pub const ACTIVE_TXS: u8 = 13;
    pub const REPLACE: u8 = 14;
    pub const OP: u8 = 15;
    pub const COUNT: u8 = 16;
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// A log record: fixed header plus an ordered sequence of tagged chunks.
///
/// `undo_next` chains a transaction's undo records in reverse; on a redo
/// record it is the address of the paired undo record, and on a CLR it
/// points past the record the CLR compensates. `pair_lsn` (undo records
/// only) is the redo address of the pair; `page_prev_undo` is the previous
/// undo record that touched the same page.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub is_clr: bool,
    pub tx_id: u64,
    pub undo_next: Lsn,
    pub pair_lsn: Lsn,
    pub page_prev_undo: Lsn,
    pub segment_id: u64,
    pub page: u64,
    pub segment_type: u8,
    pub page_type: u8,
    pub chunks: Vec<Chunk>,
}

impl LogRecord {
    pub fn new(kind: RecordKind) -> Self {
        LogRecord {
            kind,
            is_clr: kind == RecordKind::Clr,
            tx_id: 0,
            undo_next: NULL_LSN,
            pair_lsn: NULL_LSN,
            page_prev_undo: NULL_LSN,
            segment_id: NONE_RAW,
            page: NONE_RAW,
            segment_type: 0,
            page_type: 0,
            chunks: Vec::new(),
        }
    }

    pub fn push(&mut self, tag: u8, data: Vec<u8>) -> &mut Self {
        self.chunks.push(Chunk { tag, data });
        self
    }

    pub fn push_u64(&mut self, tag: u8, v: u64) -> &mut Self {
        self.push(tag, v.to_le_bytes().to_vec())
    }

    pub fn push_u16(&mut self, tag: u8, v: u16) -> &mut Self {
        self.push(tag, v.to_le_bytes().to_vec())
    }

    pub fn chunk(&self, tag: u8) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|c| c.tag == tag)
            .map(|c| c.data.as_slice())
    }

    pub fn chunk_u64(&self, tag: u8) -> Option<u64> {
        self.chunk(tag)
            .map(|d| u64::from_le_bytes(d[..8].try_into().unwrap()))
    }

    pub fn chunk_u16(&self, tag: u8) -> Option<u16> {
        self.chunk(tag)
            .map(|d| u16::from_le_bytes(d[..2].try_into().unwrap()))
    }

    pub fn require(&self, tag: u8) -> DbResult<&[u8]> {
        self.chunk(tag)
            .ok_or_else(|| DbError::Storage(format!("log record missing chunk {}", tag)))
    }

    /// The record body. Framing (length, address, crc) is the log file's
    /// concern.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind.to_u8());
        buf.push(self.is_clr as u8);
        buf.extend(&self.tx_id.to_le_bytes());
        buf.extend(&self.undo_next.to_le_bytes());
        buf.extend(&self.pair_lsn.to_le_bytes());
        buf.extend(&self.page_prev_undo.to_le_bytes());
        buf.extend(&self.segment_id.to_le_bytes());
        buf.extend(&self.page.to_le_bytes());
        buf.push(self.segment_type);
        buf.push(self.page_type);
        buf.extend(&(self.chunks.len() as u16).to_le_bytes());
        for c in &self.chunks {
            buf.push(c.tag);
            buf.extend(&(c.data.len() as u16).to_le_bytes());
            buf.extend(&c.data);
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> DbResult<Self> {
        let bad = || DbError::Storage("truncated log record".to_string());
        if buf.len() < 54 {
            return Err(bad());
        }
        let kind = RecordKind::from_u8(buf[0])?;
        let is_clr = buf[1] != 0;
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let tx_id = u64_at(2);
        let undo_next = u64_at(10);
        let pair_lsn = u64_at(18);
        let page_prev_undo = u64_at(26);
        let segment_id = u64_at(34);
        let page = u64_at(42);
        let segment_type = buf[50];
        let page_type = buf[51];
        let n = u16::from_le_bytes(buf[52..54].try_into().unwrap()) as usize;
        let mut chunks = Vec::with_capacity(n);
        let mut off = 54;
        for _ in 0..n {
            if off + 3 > buf.len() {
                return Err(bad());
            }
            let tag = buf[off];
            let len = u16::from_le_bytes(buf[off + 1..off + 3].try_into().unwrap()) as usize;
            off += 3;
            if off + len > buf.len() {
                return Err(bad());
            }
            chunks.push(Chunk {
                tag,
                data: buf[off..off + len].to_vec(),
            });
            off += len;
        }
        Ok(LogRecord {
            kind,
            is_clr,
            tx_id,
            undo_next,
            pair_lsn,
            page_prev_undo,
            segment_id,
            page,
            segment_type,
            page_type,
            chunks,
        })
    }
}

/// On-disk frame shared by both logs:
/// [len: u32][addr: u64][body][crc32: u32], crc over len+addr+body. The
/// stored address must match the frame's own; a mismatch marks the end of
/// the log (stale bytes from a previous lap of the circular file).
pub const FRAME_OVERHEAD: usize = 16;
pub const MIN_FRAME: u64 = FRAME_OVERHEAD as u64;

pub fn frame(addr: Lsn, body: &[u8]) -> Vec<u8> {
    let len = (FRAME_OVERHEAD + body.len()) as u32;
    let mut buf = Vec::with_capacity(len as usize);
    buf.extend(&len.to_le_bytes());
    buf.extend(&addr.to_le_bytes());
    buf.extend(body);
    let crc = crc32fast::hash(&buf);
    buf.extend(&crc.to_le_bytes());
    buf
}

/// Parse a frame expected at `addr`. Returns `(body, total_len)`, or None
/// when the bytes do not form a frame written at this address.
pub fn read_frame(buf: &[u8], addr: Lsn) -> Option<(Vec<u8>, usize)> {
    if buf.len() < FRAME_OVERHEAD {
        return None;
    }
    let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    if len < FRAME_OVERHEAD || len > buf.len() {
        return None;
    }
    let stored = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    if stored != addr {
        return None;
    }
    let crc_at = len - 4;
    let expect = u32::from_le_bytes(buf[crc_at..len].try_into().unwrap());
    if crc32fast::hash(&buf[..crc_at]) != expect {
        return None;
    }
    Some((buf[12..crc_at].to_vec(), len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut rec = LogRecord::new(RecordKind::Update);
        rec.tx_id = 9;
        rec.undo_next = 100;
        rec.pair_lsn = 200;
        rec.segment_type = 3;
        rec.page = 0x0001_0000_0002;
        rec.push_u16(tag::SLOT, 5);
        rec.push(tag::ROW, b"hello".to_vec());
        let back = LogRecord::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(back.kind, RecordKind::Update);
        assert_eq!(back.tx_id, 9);
        assert_eq!(back.undo_next, 100);
        assert_eq!(back.pair_lsn, 200);
        assert_eq!(back.chunk_u16(tag::SLOT), Some(5));
        assert_eq!(back.chunk(tag::ROW), Some(&b"hello"[..]));
        assert_eq!(back.chunk(tag::KEY), None);
    }

    #[test]
    fn test_frame_rejects_wrong_address() {
        let body = b"payload".to_vec();
        let framed = frame(77, &body);
        assert!(read_frame(&framed, 77).is_some());
        assert!(read_frame(&framed, 78).is_none());
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let mut framed = frame(5, b"data");
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(read_frame(&framed, 5).is_none());
    }
}
