//! On-disk layout of the write-ahead log.
//!
//! ```text
//! [WAL header: 32 bytes]
//! [frame 1: 24-byte frame header + page image]
//! [frame 2: 24-byte frame header + page image]
//! ...
//! ```
//!
//! Header fields are big-endian. Checksums are a running fold over the
//! header and then over every frame in order, so a frame is only valid if all
//! frames before it are.

use bytes::{Buf, BufMut};

use crate::common::{LodeError, PageNumber, Result};

pub const WAL_HEADER_SIZE: usize = 32;
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Magic selecting little-endian checksum words. Written by this engine.
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;
/// Magic selecting big-endian checksum words. Accepted when reading.
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// Running checksum pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalChecksum {
    pub s1: u32,
    pub s2: u32,
}

impl WalChecksum {
    /// Folds `data` into the checksum. `data` must be a multiple of 8 bytes.
    pub fn fold(self, data: &[u8], big_endian: bool) -> Self {
        debug_assert_eq!(data.len() % 8, 0);
        let (mut s1, mut s2) = (self.s1, self.s2);
        let mut words = data;
        while words.remaining() >= 8 {
            let (a, b) = if big_endian {
                (words.get_u32(), words.get_u32())
            } else {
                (words.get_u32_le(), words.get_u32_le())
            };
            s1 = s1.wrapping_add(a).wrapping_add(s2);
            s2 = s2.wrapping_add(b).wrapping_add(s1);
        }
        Self { s1, s2 }
    }
}

/// Salt pair copied from the header into every frame. A frame whose salts do
/// not match the header belongs to an older log generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalSalts {
    pub salt1: u32,
    pub salt2: u32,
}

impl WalSalts {
    pub fn as_pair(self) -> (u32, u32) {
        (self.salt1, self.salt2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salts: WalSalts,
    /// Checksum of the first 24 header bytes; seeds the frame checksums
    pub checksum: WalChecksum,
}

impl WalHeader {
    pub fn new(page_size: usize, checkpoint_seq: u32, salts: WalSalts) -> Self {
        let mut header = Self {
            magic: WAL_MAGIC_LE,
            page_size: page_size as u32,
            checkpoint_seq,
            salts,
            checksum: WalChecksum::default(),
        };
        let bytes = header.encode();
        header.checksum = WalChecksum::default().fold(&bytes[..24], false);
        header
    }

    pub fn big_endian_checksum(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Parses and validates a header.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_HEADER_SIZE {
            return Err(LodeError::corrupt("WAL header is truncated"));
        }
        let mut buf = &data[..WAL_HEADER_SIZE];
        let magic = buf.get_u32();
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(LodeError::corrupt(format!("bad WAL magic {magic:#010x}")));
        }
        let version = buf.get_u32();
        if version != WAL_FORMAT_VERSION {
            return Err(LodeError::corrupt(format!("unsupported WAL version {version}")));
        }
        let header = Self {
            magic,
            page_size: buf.get_u32(),
            checkpoint_seq: buf.get_u32(),
            salts: WalSalts {
                salt1: buf.get_u32(),
                salt2: buf.get_u32(),
            },
            checksum: WalChecksum {
                s1: buf.get_u32(),
                s2: buf.get_u32(),
            },
        };

        let expected = WalChecksum::default().fold(&data[..24], header.big_endian_checksum());
        if expected != header.checksum {
            return Err(LodeError::corrupt("WAL header checksum mismatch"));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut out = [0u8; WAL_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.magic);
        buf.put_u32(WAL_FORMAT_VERSION);
        buf.put_u32(self.page_size);
        buf.put_u32(self.checkpoint_seq);
        buf.put_u32(self.salts.salt1);
        buf.put_u32(self.salts.salt2);
        buf.put_u32(self.checksum.s1);
        buf.put_u32(self.checksum.s2);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    pub pgno: PageNumber,
    /// Database size in pages after the transaction for commit frames, else 0
    pub db_size: u32,
    pub salts: WalSalts,
    /// Running checksum through the end of this frame
    pub checksum: WalChecksum,
}

impl WalFrameHeader {
    pub fn is_commit(&self) -> bool {
        self.db_size != 0
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_FRAME_HEADER_SIZE {
            return Err(LodeError::corrupt("WAL frame header is truncated"));
        }
        let mut buf = &data[..WAL_FRAME_HEADER_SIZE];
        Ok(Self {
            pgno: PageNumber::new(buf.get_u32()),
            db_size: buf.get_u32(),
            salts: WalSalts {
                salt1: buf.get_u32(),
                salt2: buf.get_u32(),
            },
            checksum: WalChecksum {
                s1: buf.get_u32(),
                s2: buf.get_u32(),
            },
        })
    }

    pub fn encode(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut out = [0u8; WAL_FRAME_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(self.pgno.as_u32());
        buf.put_u32(self.db_size);
        buf.put_u32(self.salts.salt1);
        buf.put_u32(self.salts.salt2);
        buf.put_u32(self.checksum.s1);
        buf.put_u32(self.checksum.s2);
        out
    }

    /// Checksum of this frame given the checksum of everything before it.
    /// Covers the page number and commit size, then the page image.
    pub fn compute_checksum(&self, page: &[u8], previous: WalChecksum, big_endian: bool) -> WalChecksum {
        let header = self.encode();
        previous
            .fold(&header[..8], big_endian)
            .fold(page, big_endian)
    }
}
