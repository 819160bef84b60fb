use bytes::{Buf, BufMut};

use crate::common::{LodeError, PagerConfig, Result, DB_HEADER_SIZE};

/// Magic string opening every database file
pub const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// File format version byte meaning "write-ahead log mode"
pub const FORMAT_VERSION_WAL: u8 = 2;

/// Version number stamped into newly created files
pub const LODE_VERSION_NUMBER: u32 = 3_045_000;

/// The 100-byte header stored at the start of page 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: usize,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_space: u8,
    pub max_payload_fraction: u8,
    pub min_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub change_counter: u32,
    /// Database size in pages
    pub page_count: u32,
    pub freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub largest_root_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub version_number: u32,
}

impl DatabaseHeader {
    /// Header for a database that is about to be created with `config`.
    pub fn new(config: &PagerConfig) -> Self {
        Self {
            page_size: config.page_size,
            write_version: FORMAT_VERSION_WAL,
            read_version: FORMAT_VERSION_WAL,
            reserved_space: config.reserved_space,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            change_counter: 0,
            page_count: 0,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root_page: 0,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 0,
            version_number: LODE_VERSION_NUMBER,
        }
    }

    /// Parses the first 100 bytes of page 1.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(LodeError::format("database header is truncated"));
        }
        if &data[..16] != HEADER_MAGIC {
            return Err(LodeError::format("file is not a database"));
        }

        let mut buf = &data[16..DB_HEADER_SIZE];
        let page_size = match buf.get_u16() {
            1 => 65536,
            n => n as usize,
        };
        if !PagerConfig::page_size_is_valid(page_size) {
            return Err(LodeError::format(format!("invalid page size {page_size}")));
        }
        let write_version = buf.get_u8();
        let read_version = buf.get_u8();
        if read_version > FORMAT_VERSION_WAL {
            return Err(LodeError::format(format!(
                "unsupported file format read version {read_version}"
            )));
        }
        let reserved_space = buf.get_u8();
        let max_payload_fraction = buf.get_u8();
        let min_payload_fraction = buf.get_u8();
        let leaf_payload_fraction = buf.get_u8();
        if (max_payload_fraction, min_payload_fraction, leaf_payload_fraction) != (64, 32, 32) {
            return Err(LodeError::format("unsupported payload fractions"));
        }
        if page_size - (reserved_space as usize) < 480 {
            return Err(LodeError::format("reserved space leaves too small a page"));
        }

        let mut header = Self {
            page_size,
            write_version,
            read_version,
            reserved_space,
            max_payload_fraction,
            min_payload_fraction,
            leaf_payload_fraction,
            change_counter: buf.get_u32(),
            page_count: buf.get_u32(),
            freelist_trunk: buf.get_u32(),
            freelist_count: buf.get_u32(),
            schema_cookie: buf.get_u32(),
            schema_format: buf.get_u32(),
            default_cache_size: buf.get_u32(),
            largest_root_page: buf.get_u32(),
            text_encoding: buf.get_u32(),
            user_version: buf.get_u32(),
            incremental_vacuum: buf.get_u32(),
            application_id: buf.get_u32(),
            version_valid_for: 0,
            version_number: 0,
        };
        // 20 reserved bytes
        buf.advance(20);
        header.version_valid_for = buf.get_u32();
        header.version_number = buf.get_u32();
        Ok(header)
    }

    /// Serializes the header into the first 100 bytes of `data`.
    pub fn write(&self, data: &mut [u8]) {
        let mut buf = &mut data[..DB_HEADER_SIZE];
        buf.put_slice(HEADER_MAGIC);
        buf.put_u16(if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        });
        buf.put_u8(self.write_version);
        buf.put_u8(self.read_version);
        buf.put_u8(self.reserved_space);
        buf.put_u8(self.max_payload_fraction);
        buf.put_u8(self.min_payload_fraction);
        buf.put_u8(self.leaf_payload_fraction);
        buf.put_u32(self.change_counter);
        buf.put_u32(self.page_count);
        buf.put_u32(self.freelist_trunk);
        buf.put_u32(self.freelist_count);
        buf.put_u32(self.schema_cookie);
        buf.put_u32(self.schema_format);
        buf.put_u32(self.default_cache_size);
        buf.put_u32(self.largest_root_page);
        buf.put_u32(self.text_encoding);
        buf.put_u32(self.user_version);
        buf.put_u32(self.incremental_vacuum);
        buf.put_u32(self.application_id);
        buf.put_bytes(0, 20);
        buf.put_u32(self.version_valid_for);
        buf.put_u32(self.version_number);
    }

    /// Database size recorded in the header, trusted only when the header was
    /// written by a writer that kept `version_valid_for` in step.
    pub fn trusted_page_count(&self) -> Option<u32> {
        (self.page_count > 0 && self.version_valid_for == self.change_counter)
            .then_some(self.page_count)
    }

    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved_space as usize
    }
}

/// Reads the file change counter from raw header bytes without full validation.
pub fn peek_change_counter(data: &[u8]) -> Option<u32> {
    let mut buf = data.get(24..28)?;
    Some(buf.get_u32())
}
