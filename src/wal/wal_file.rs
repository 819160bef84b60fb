use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::common::{FrameNumber, LodeError, PageNumber, Result};

use super::{
    FrameEntry, WalChecksum, WalFrameHeader, WalHeader, WalIndex, WalSalts, WAL_FRAME_HEADER_SIZE,
    WAL_HEADER_SIZE,
};

/// One connection's view of the write-ahead log file.
///
/// Frames up to [`Wal::max_frame`] end in a commit marker and are visible to
/// new snapshots. Frames appended without a commit marker stay pending until
/// a later commit frame or [`Wal::discard_pending`].
pub struct Wal {
    file: File,
    path: PathBuf,
    page_size: usize,
    /// `None` while the file holds no valid header
    header: Option<WalHeader>,
    index: WalIndex,
    /// Last frame that ends a committed transaction
    max_frame: FrameNumber,
    /// Checksum through `max_frame`
    commit_checksum: WalChecksum,
    /// Checksum through the last frame written, pending or not
    running_checksum: WalChecksum,
}

impl Wal {
    /// Opens (creating if needed) the log at `path` and recovers its
    /// committed frames.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let mut wal = Self {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
            header: None,
            index: WalIndex::new(),
            max_frame: 0,
            commit_checksum: WalChecksum::default(),
            running_checksum: WalChecksum::default(),
        };
        wal.rebuild()?;
        Ok(wal)
    }

    fn frame_size(&self) -> usize {
        WAL_FRAME_HEADER_SIZE + self.page_size
    }

    fn frame_offset(&self, frame: FrameNumber) -> u64 {
        WAL_HEADER_SIZE as u64 + (frame as u64 - 1) * self.frame_size() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Reads the header currently on disk, if it is valid.
    fn read_header(&mut self) -> Result<Option<WalHeader>> {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        if self.read_at(0, &mut buf)? < WAL_HEADER_SIZE {
            return Ok(None);
        }
        match WalHeader::decode(&buf) {
            Ok(header) => {
                if header.page_size as usize != self.page_size {
                    return Err(LodeError::format(format!(
                        "WAL page size {} does not match database page size {}",
                        header.page_size, self.page_size
                    )));
                }
                Ok(Some(header))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring invalid WAL header");
                Ok(None)
            }
        }
    }

    /// Forgets everything and recovers the log from its first frame.
    fn rebuild(&mut self) -> Result<()> {
        self.index.clear();
        self.max_frame = 0;
        self.header = self.read_header()?;
        let seed = self.header.map(|h| h.checksum).unwrap_or_default();
        self.commit_checksum = seed;
        self.running_checksum = seed;

        if self.header.is_some() {
            let scanned = self.scan_frames()?;
            if scanned > self.max_frame {
                warn!(
                    path = %self.path.display(),
                    discarded = scanned - self.max_frame,
                    "discarded uncommitted WAL frames"
                );
            }
            debug!(path = %self.path.display(), frames = self.max_frame, "recovered WAL");
        }
        Ok(())
    }

    /// Validates and indexes frames past the current end of the index.
    /// Stops at the first frame that is torn, from another generation, or
    /// fails its checksum, and keeps only frames up to the last commit.
    /// Returns the number of valid frames seen before trimming.
    fn scan_frames(&mut self) -> Result<FrameNumber> {
        let Some(header) = self.header else {
            return Ok(0);
        };
        let big_endian = header.big_endian_checksum();
        let file_size = self.file.metadata()?.len();
        let mut buf = vec![0u8; self.frame_size()];
        let mut checksum = self.running_checksum;

        loop {
            let frame = self.index.len() + 1;
            let offset = self.frame_offset(frame);
            if offset + buf.len() as u64 > file_size {
                break;
            }
            if self.read_at(offset, &mut buf)? < buf.len() {
                break;
            }
            let frame_header = WalFrameHeader::decode(&buf)?;
            if frame_header.salts != header.salts || !frame_header.pgno.is_valid() {
                break;
            }
            let expected =
                frame_header.compute_checksum(&buf[WAL_FRAME_HEADER_SIZE..], checksum, big_endian);
            if expected != frame_header.checksum {
                break;
            }

            checksum = expected;
            self.index.push(FrameEntry {
                pgno: frame_header.pgno,
                db_size: frame_header.db_size,
                checksum,
            });
            if frame_header.is_commit() {
                self.max_frame = frame;
                self.commit_checksum = checksum;
            }
        }

        let scanned = self.index.len();
        self.index.truncate(self.max_frame);
        self.running_checksum = self.commit_checksum;
        Ok(scanned)
    }

    /// Catches up with frames other connections committed since the last
    /// call. Returns true if the log was restarted in the meantime, in which
    /// case every previously cached page may be stale.
    pub fn refresh(&mut self) -> Result<bool> {
        if self.index.len() != self.max_frame {
            return Err(LodeError::Misuse("refresh with uncommitted WAL frames"));
        }

        let on_disk = self.read_header()?;
        let file_size = self.file.metadata()?.len();
        let expected_size = if self.max_frame == 0 {
            0
        } else {
            self.frame_offset(self.max_frame) + self.frame_size() as u64
        };

        if on_disk != self.header || file_size < expected_size {
            let had_frames = self.header.is_some();
            self.rebuild()?;
            return Ok(had_frames || self.max_frame > 0);
        }
        if self.header.is_some() {
            let before = self.max_frame;
            self.scan_frames()?;
            if self.max_frame > before {
                debug!(from = before, to = self.max_frame, "absorbed new WAL frames");
            }
        }
        Ok(false)
    }

    /// Returns true if the header on disk is still the one this view was
    /// built from.
    pub fn header_is_current(&mut self) -> Result<bool> {
        Ok(self.read_header()? == self.header)
    }

    /// Most recent frame at or below `max_frame` holding `pgno`.
    pub fn find_frame(&self, pgno: PageNumber, max_frame: FrameNumber) -> Option<FrameNumber> {
        self.index.find(pgno, max_frame)
    }

    /// Reads the page image stored in `frame`, checking it against the
    /// checksum recorded when the frame was indexed.
    pub fn read_frame(&mut self, frame: FrameNumber, data: &mut [u8]) -> Result<()> {
        let header = self
            .header
            .ok_or_else(|| LodeError::corrupt("read from a WAL without a header"))?;
        let entry = *self
            .index
            .entry(frame)
            .ok_or_else(|| LodeError::corrupt(format!("WAL frame {frame} is not indexed")))?;
        let previous = if frame == 1 {
            header.checksum
        } else {
            self.index
                .entry(frame - 1)
                .map(|e| e.checksum)
                .unwrap_or(header.checksum)
        };

        let mut buf = vec![0u8; self.frame_size()];
        let offset = self.frame_offset(frame);
        if self.read_at(offset, &mut buf)? < buf.len() {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("short read of WAL frame {frame}"),
            )
            .into());
        }

        let frame_header = WalFrameHeader::decode(&buf)?;
        let page = &buf[WAL_FRAME_HEADER_SIZE..];
        let checksum = frame_header.compute_checksum(page, previous, header.big_endian_checksum());
        if frame_header.salts != header.salts
            || frame_header.pgno != entry.pgno
            || checksum != entry.checksum
            || frame_header.checksum != entry.checksum
        {
            warn!(frame, pgno = entry.pgno.as_u32(), "WAL frame checksum mismatch");
            return Err(LodeError::corrupt(format!("WAL frame {frame} checksum mismatch")));
        }
        data.copy_from_slice(page);
        Ok(())
    }

    /// Appends one frame per page, in order. With `commit_db_size` the last
    /// frame carries the commit marker and everything appended so far
    /// becomes visible; without it the frames stay pending.
    pub fn append_frames(&mut self, pages: &[(PageNumber, &[u8])], commit_db_size: Option<u32>) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        if commit_db_size == Some(0) {
            return Err(LodeError::Misuse("a commit frame needs a nonzero database size"));
        }
        let header = match self.header {
            Some(header) => header,
            None => self.write_new_header(0, random_salts())?,
        };
        let big_endian = header.big_endian_checksum();

        let first = self.index.len() + 1;
        let mut buf = Vec::with_capacity(pages.len() * self.frame_size());
        let mut checksum = self.running_checksum;
        let mut entries = Vec::with_capacity(pages.len());
        for (i, &(pgno, page)) in pages.iter().enumerate() {
            if page.len() != self.page_size {
                return Err(LodeError::Misuse("WAL frame image must be one page"));
            }
            let db_size = if i + 1 == pages.len() {
                commit_db_size.unwrap_or(0)
            } else {
                0
            };
            let mut frame_header = WalFrameHeader {
                pgno,
                db_size,
                salts: header.salts,
                checksum: WalChecksum::default(),
            };
            checksum = frame_header.compute_checksum(page, checksum, big_endian);
            frame_header.checksum = checksum;
            buf.extend_from_slice(&frame_header.encode());
            buf.extend_from_slice(page);
            entries.push(FrameEntry {
                pgno,
                db_size,
                checksum,
            });
        }

        let offset = self.frame_offset(first);
        self.write_at(offset, &buf)?;
        for entry in entries {
            self.index.push(entry);
        }
        self.running_checksum = checksum;
        if commit_db_size.is_some() {
            self.max_frame = self.index.len();
            self.commit_checksum = checksum;
        }
        debug!(
            first,
            frames = pages.len(),
            commit = commit_db_size.is_some(),
            "appended WAL frames"
        );
        Ok(())
    }

    /// Forgets frames appended since the last commit marker.
    pub fn discard_pending(&mut self) {
        if self.index.len() > self.max_frame {
            debug!(frames = self.index.len() - self.max_frame, "discarded pending WAL frames");
        }
        self.index.truncate(self.max_frame);
        self.running_checksum = self.commit_checksum;
    }

    /// Takes back every frame after `frame`, committed or not, and cuts the
    /// file to match. `frame` must end a transaction of the current
    /// generation, or be 0.
    pub fn rewind(&mut self, frame: FrameNumber) -> Result<()> {
        if frame > self.max_frame {
            return Err(LodeError::Misuse("rewind past the last commit"));
        }
        let checksum = if frame == 0 {
            self.header.map(|h| h.checksum).unwrap_or_default()
        } else {
            self.index
                .entry(frame)
                .map(|e| e.checksum)
                .ok_or_else(|| LodeError::corrupt(format!("WAL frame {frame} is not indexed")))?
        };
        let dropped = self.index.len() - frame;
        self.index.truncate(frame);
        self.max_frame = frame;
        self.commit_checksum = checksum;
        self.running_checksum = checksum;

        let len = if self.header.is_some() {
            self.frame_offset(frame + 1)
        } else {
            0
        };
        self.file.set_len(len)?;
        debug!(path = %self.path.display(), frame, dropped, "rewound WAL");
        Ok(())
    }

    /// Starts a new log generation once every frame is in the main file.
    /// With `truncate` the file is left empty and the header is written by
    /// the next append.
    pub fn restart(&mut self, truncate: bool) -> Result<()> {
        let (seq, salts) = match self.header {
            Some(h) => (
                h.checkpoint_seq.wrapping_add(1),
                WalSalts {
                    salt1: h.salts.salt1.wrapping_add(1),
                    salt2: rand::random(),
                },
            ),
            None => (0, random_salts()),
        };
        self.index.clear();
        self.max_frame = 0;

        if truncate {
            self.file.set_len(0)?;
            self.header = None;
            self.commit_checksum = WalChecksum::default();
            self.running_checksum = WalChecksum::default();
        } else {
            self.write_new_header(seq, salts)?;
            self.file.set_len(WAL_HEADER_SIZE as u64)?;
        }
        debug!(path = %self.path.display(), truncate, checkpoint_seq = seq, "restarted WAL");
        Ok(())
    }

    fn write_new_header(&mut self, checkpoint_seq: u32, salts: WalSalts) -> Result<WalHeader> {
        let header = WalHeader::new(self.page_size, checkpoint_seq, salts);
        self.write_at(0, &header.encode())?;
        self.header = Some(header);
        self.commit_checksum = header.checksum;
        self.running_checksum = header.checksum;
        Ok(header)
    }

    /// Flushes the log to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Last committed frame.
    pub fn max_frame(&self) -> FrameNumber {
        self.max_frame
    }

    /// Frames indexed, including pending ones.
    pub fn frame_count(&self) -> FrameNumber {
        self.index.len()
    }

    pub fn header(&self) -> Option<&WalHeader> {
        self.header.as_ref()
    }

    pub fn salts(&self) -> Option<WalSalts> {
        self.header.map(|h| h.salts)
    }

    /// Database size recorded by the commit frame `frame`.
    pub fn db_size_at(&self, frame: FrameNumber) -> Option<u32> {
        self.index
            .entry(frame)
            .map(|e| e.db_size)
            .filter(|&size| size != 0)
    }

    /// Pages written by committed frames in `(after, through]`.
    pub fn pages_between(&self, after: FrameNumber, through: FrameNumber) -> Vec<PageNumber> {
        self.index.pages_between(after, through)
    }

    /// Latest frame of every page written in `(after, through]`.
    pub fn latest_frames(&self, after: FrameNumber, through: FrameNumber) -> Vec<(PageNumber, FrameNumber)> {
        self.index.latest_frames(after, through)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

fn random_salts() -> WalSalts {
    WalSalts {
        salt1: rand::random(),
        salt2: rand::random(),
    }
}
