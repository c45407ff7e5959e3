//! On-flash record format
//!
//! The log inside every LEB is a sequence of typed records:
//!
//! ```text
//! +-------+------+--------+---------+----------------------+----------+---------+
//! | magic | type | length | hdr_crc | fixed body           | body_crc | payload |
//! | 2B    | 2B   | 4B     | 4B      | per type             | 4B       | var     |
//! +-------+------+--------+---------+----------------------+----------+---------+
//! ```
//!
//! `hdr_crc` covers the first 8 bytes, `body_crc` covers the fixed body.
//! Data payloads and dirent names carry their own CRC inside the fixed
//! body. `length` is the full record length, padded to 4 bytes.
//! A padding record has a header only; its length spans the gap it fills.

use bytes::{Buf, BufMut, BytesMut};
use chfs_common::{Error, Result, Vno, crc32};

/// Record magic
pub const NODE_MAGIC: u16 = 0x4AEB;

/// Record header size
pub const NODE_HDR_SIZE: usize = 12;

/// Records are aligned to this many bytes; also the resync step
pub const NODE_ALIGN: usize = 4;

const VNODE_BODY: usize = 64;
const DATA_BODY: usize = 32;
const DIRENT_BODY: usize = 40;

/// Fixed size of a vnode-info record
pub const VNODE_NODE_SIZE: usize = NODE_HDR_SIZE + VNODE_BODY + 4;

/// Size of a data record before its payload
pub const DATA_NODE_FIXED: usize = NODE_HDR_SIZE + DATA_BODY + 4;

/// Size of a dirent record before its name
pub const DIRENT_NODE_FIXED: usize = NODE_HDR_SIZE + DIRENT_BODY + 4;

/// Longest dirent name
pub const MAX_NAME_LEN: usize = 255;

/// Round up to record alignment
#[inline]
#[must_use]
pub const fn pad_len(len: usize) -> usize {
    (len + NODE_ALIGN - 1) & !(NODE_ALIGN - 1)
}

/// Record type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NodeType {
    Vnode = 1,
    Data = 2,
    Dirent = 3,
    Padding = 4,
}

impl NodeType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Vnode),
            2 => Some(Self::Data),
            3 => Some(Self::Dirent),
            4 => Some(Self::Padding),
            _ => None,
        }
    }
}

/// Parsed record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub length: u32,
}

impl NodeHeader {
    fn encode(node_type: NodeType, length: u32, buf: &mut BytesMut) {
        let mut hdr = [0u8; 8];
        hdr[..2].copy_from_slice(&NODE_MAGIC.to_le_bytes());
        hdr[2..4].copy_from_slice(&(node_type as u16).to_le_bytes());
        hdr[4..8].copy_from_slice(&length.to_le_bytes());
        buf.put_slice(&hdr);
        buf.put_u32_le(crc32(&hdr));
    }

    /// Validate and parse a record header
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NODE_HDR_SIZE {
            return Err(Error::Malformed("record header truncated".into()));
        }
        let mut buf = &data[..NODE_HDR_SIZE];
        let magic = buf.get_u16_le();
        let raw_type = buf.get_u16_le();
        let length = buf.get_u32_le();
        let crc = buf.get_u32_le();

        if magic != NODE_MAGIC {
            return Err(Error::Malformed(format!("bad record magic {magic:#06x}")));
        }
        let actual = crc32(&data[..8]);
        if actual != crc {
            return Err(Error::ChecksumMismatch {
                expected: crc,
                actual,
            });
        }
        let node_type = NodeType::from_u16(raw_type)
            .ok_or_else(|| Error::Malformed(format!("unknown record type {raw_type}")))?;
        if (length as usize) < NODE_HDR_SIZE || length as usize % NODE_ALIGN != 0 {
            return Err(Error::Malformed(format!("bad record length {length}")));
        }
        Ok(Self { node_type, length })
    }
}

/// Vnode information record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VnodeInfo {
    pub vno: Vno,
    pub version: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl VnodeInfo {
    /// A vnode record with no links left marks the vnode as deleted
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.nlink == 0
    }
}

/// File data record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataNode {
    pub vno: Vno,
    pub version: u64,
    /// Offset of the payload inside the file
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Directory entry record; `vno == Vno::NONE` marks a deletion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirentNode {
    pub pvno: Vno,
    pub vno: Vno,
    pub version: u64,
    pub mctime: u64,
    pub dtype: u8,
    pub name: Vec<u8>,
}

/// A decoded record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Vnode(VnodeInfo),
    Data(DataNode),
    Dirent(DirentNode),
    Padding { length: u32 },
}

impl Node {
    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        match self {
            Self::Vnode(_) => NodeType::Vnode,
            Self::Data(_) => NodeType::Data,
            Self::Dirent(_) => NodeType::Dirent,
            Self::Padding { .. } => NodeType::Padding,
        }
    }

    /// Vnode whose chain the record belongs to (the parent, for dirents)
    #[must_use]
    pub const fn owner(&self) -> Option<Vno> {
        match self {
            Self::Vnode(v) => Some(v.vno),
            Self::Data(d) => Some(d.vno),
            Self::Dirent(d) => Some(d.pvno),
            Self::Padding { .. } => None,
        }
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::Vnode(v) => v.version,
            Self::Data(d) => d.version,
            Self::Dirent(d) => d.version,
            Self::Padding { .. } => 0,
        }
    }

    /// Length on flash, including alignment
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Vnode(_) => VNODE_NODE_SIZE,
            Self::Data(d) => pad_len(DATA_NODE_FIXED + d.data.len()),
            Self::Dirent(d) => pad_len(DIRENT_NODE_FIXED + d.name.len()),
            Self::Padding { length } => *length as usize,
        }
    }

    /// Serialize the record, padded to alignment
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        let length = u32::try_from(len)
            .map_err(|_| Error::invalid_argument(format!("record of {len} bytes is too large")))?;
        let mut buf = BytesMut::with_capacity(len);
        NodeHeader::encode(self.node_type(), length, &mut buf);

        match self {
            Self::Vnode(v) => {
                let start = buf.len();
                buf.put_u64_le(v.vno.get());
                buf.put_u64_le(v.version);
                buf.put_u32_le(v.uid);
                buf.put_u32_le(v.gid);
                buf.put_u32_le(v.mode);
                buf.put_u32_le(v.nlink);
                buf.put_u64_le(v.size);
                buf.put_u64_le(v.atime);
                buf.put_u64_le(v.mtime);
                buf.put_u64_le(v.ctime);
                let crc = crc32(&buf[start..]);
                buf.put_u32_le(crc);
            }
            Self::Data(d) => {
                let data_len = u32::try_from(d.data.len())
                    .map_err(|_| Error::invalid_argument("data payload too large"))?;
                let start = buf.len();
                buf.put_u64_le(d.vno.get());
                buf.put_u64_le(d.version);
                buf.put_u64_le(d.offset);
                buf.put_u32_le(data_len);
                buf.put_u32_le(crc32(&d.data));
                let crc = crc32(&buf[start..]);
                buf.put_u32_le(crc);
                buf.put_slice(&d.data);
            }
            Self::Dirent(d) => {
                if d.name.is_empty() || d.name.len() > MAX_NAME_LEN {
                    return Err(Error::invalid_argument(format!(
                        "dirent name length {} out of range",
                        d.name.len()
                    )));
                }
                let start = buf.len();
                buf.put_u64_le(d.pvno.get());
                buf.put_u64_le(d.vno.get());
                buf.put_u64_le(d.version);
                buf.put_u64_le(d.mctime);
                buf.put_u8(d.dtype);
                // checked above
                buf.put_u8(d.name.len() as u8);
                buf.put_u16_le(0);
                buf.put_u32_le(crc32(&d.name));
                let crc = crc32(&buf[start..]);
                buf.put_u32_le(crc);
                buf.put_slice(&d.name);
            }
            Self::Padding { length } => {
                if (*length as usize) < NODE_HDR_SIZE {
                    return Err(Error::invalid_argument("padding shorter than a header"));
                }
            }
        }

        buf.resize(len, 0);
        Ok(buf.to_vec())
    }

    /// Parse and fully validate one record at the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        let hdr = NodeHeader::parse(data)?;
        let length = hdr.length as usize;
        if data.len() < length {
            return Err(Error::Malformed(format!(
                "record of {length} bytes truncated to {}",
                data.len()
            )));
        }
        let body = &data[NODE_HDR_SIZE..length];

        let check_body = |fixed: usize| -> Result<()> {
            if body.len() < fixed + 4 {
                return Err(Error::Malformed("record body truncated".into()));
            }
            let expected = u32::from_le_bytes([
                body[fixed],
                body[fixed + 1],
                body[fixed + 2],
                body[fixed + 3],
            ]);
            let actual = crc32(&body[..fixed]);
            if expected == actual {
                Ok(())
            } else {
                Err(Error::ChecksumMismatch { expected, actual })
            }
        };

        match hdr.node_type {
            NodeType::Vnode => {
                check_body(VNODE_BODY)?;
                let mut b = body;
                Ok(Self::Vnode(VnodeInfo {
                    vno: Vno::new(b.get_u64_le()),
                    version: b.get_u64_le(),
                    uid: b.get_u32_le(),
                    gid: b.get_u32_le(),
                    mode: b.get_u32_le(),
                    nlink: b.get_u32_le(),
                    size: b.get_u64_le(),
                    atime: b.get_u64_le(),
                    mtime: b.get_u64_le(),
                    ctime: b.get_u64_le(),
                }))
            }
            NodeType::Data => {
                check_body(DATA_BODY)?;
                let mut b = body;
                let vno = Vno::new(b.get_u64_le());
                let version = b.get_u64_le();
                let offset = b.get_u64_le();
                let data_len = b.get_u32_le() as usize;
                let data_crc = b.get_u32_le();
                let payload_start = DATA_BODY + 4;
                if body.len() < payload_start + data_len {
                    return Err(Error::Malformed("data payload truncated".into()));
                }
                let payload = &body[payload_start..payload_start + data_len];
                let actual = crc32(payload);
                if actual != data_crc {
                    return Err(Error::ChecksumMismatch {
                        expected: data_crc,
                        actual,
                    });
                }
                Ok(Self::Data(DataNode {
                    vno,
                    version,
                    offset,
                    data: payload.to_vec(),
                }))
            }
            NodeType::Dirent => {
                check_body(DIRENT_BODY)?;
                let mut b = body;
                let pvno = Vno::new(b.get_u64_le());
                let vno = Vno::new(b.get_u64_le());
                let version = b.get_u64_le();
                let mctime = b.get_u64_le();
                let dtype = b.get_u8();
                let nsize = b.get_u8() as usize;
                let _reserved = b.get_u16_le();
                let name_crc = b.get_u32_le();
                let name_start = DIRENT_BODY + 4;
                if nsize == 0 || body.len() < name_start + nsize {
                    return Err(Error::Malformed("dirent name truncated".into()));
                }
                let name = &body[name_start..name_start + nsize];
                let actual = crc32(name);
                if actual != name_crc {
                    return Err(Error::ChecksumMismatch {
                        expected: name_crc,
                        actual,
                    });
                }
                Ok(Self::Dirent(DirentNode {
                    pvno,
                    vno,
                    version,
                    mctime,
                    dtype,
                    name: name.to_vec(),
                }))
            }
            NodeType::Padding => Ok(Self::Padding { length: hdr.length }),
        }
    }
}

/// Bytes filling a gap of `len` bytes at the end of a page
///
/// A padding record when the gap can hold a header, zeroes otherwise.
#[must_use]
pub fn padding_bytes(len: usize) -> Vec<u8> {
    if len >= NODE_HDR_SIZE {
        // len < page size, so it fits
        let node = Node::Padding { length: len as u32 };
        if let Ok(bytes) = node.encode() {
            return bytes;
        }
    }
    vec![0; len]
}

/// One item produced by [`RecordScanner`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanItem {
    /// A valid record
    Node { offset: u32, length: u32, node: Node },
    /// An unreadable region that was skipped
    Corrupt { offset: u32, length: u32, reason: String },
}

/// Walks the records of a LEB image
///
/// Stops at the first erased (`0xFF`) header position. Zero filler is
/// skipped silently; anything else that does not parse is reported as a
/// corrupt region and skipped in [`NODE_ALIGN`] steps until a valid header
/// turns up again.
pub struct RecordScanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordScanner<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos + NODE_HDR_SIZE > self.buf.len()
            || self.buf[self.pos..self.pos + NODE_HDR_SIZE]
                .iter()
                .all(|&b| b == 0xFF)
    }

    fn is_filler(&self) -> bool {
        self.buf[self.pos..self.pos + NODE_ALIGN]
            .iter()
            .all(|&b| b == 0)
    }
}

impl Iterator for RecordScanner<'_> {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        loop {
            if self.at_end() {
                return None;
            }
            if self.is_filler() {
                self.pos += NODE_ALIGN;
                continue;
            }

            let start = self.pos;
            match NodeHeader::parse(&self.buf[start..]) {
                Ok(hdr) if start + hdr.length as usize <= self.buf.len() => {
                    self.pos += hdr.length as usize;
                    return Some(match Node::decode(&self.buf[start..]) {
                        Ok(node) => ScanItem::Node {
                            offset: start as u32,
                            length: hdr.length,
                            node,
                        },
                        Err(e) => ScanItem::Corrupt {
                            offset: start as u32,
                            length: hdr.length,
                            reason: e.to_string(),
                        },
                    });
                }
                Ok(_) | Err(_) => {
                    let reason = match NodeHeader::parse(&self.buf[start..]) {
                        Ok(hdr) => format!("record of {} bytes runs past the end", hdr.length),
                        Err(e) => e.to_string(),
                    };
                    self.pos += NODE_ALIGN;
                    while !self.at_end()
                        && !self.is_filler()
                        && NodeHeader::parse(&self.buf[self.pos..]).is_err()
                    {
                        self.pos += NODE_ALIGN;
                    }
                    return Some(ScanItem::Corrupt {
                        offset: start as u32,
                        length: (self.pos - start) as u32,
                        reason,
                    });
                }
            }
        }
    }
}
