use std::collections::HashMap;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::common::{
    FrameNumber, LodeError, Result, PENDING_BYTE, READMARK_NOT_USED, READ_MARK_COUNT,
    RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE,
};
use crate::storage::disk::sidecar_path;

use super::memory::LocalLocks;
use super::{Backfill, LockLevel, LockManager, Slot, SlotMode};

/// Shared-memory file layout (big-endian u32 words)
const SHM_BACKFILL_OFFSET: u64 = 0;
const SHM_READ_MARK_OFFSET: u64 = 12;
/// First slot lock byte
const SHM_LOCK_BASE: u64 = 120;
/// Held shared by every process with the database open; a process that gets
/// it exclusively is alone and resets the file
const SHM_DMS_BYTE: u64 = 128;
const SHM_SIZE: u64 = 136;

/// Places or clears one POSIX record lock without waiting.
///
/// Returns `Ok(false)` when another process holds a conflicting lock.
fn posix_lock(file: &File, lock_type: libc::c_int, start: u64, len: u64) -> Result<bool> {
    let flock = libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&flock)) {
        Ok(_) => Ok(true),
        Err(Errno::EACCES | Errno::EAGAIN) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Device and inode number, which identify a file however it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    dev: u64,
    ino: u64,
}

impl InodeKey {
    fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// One database file as seen by this process.
///
/// Record locks belong to the process, and closing any descriptor of a file
/// drops every lock the process holds on it. Each database is therefore
/// opened once per process; its connections share these handles and are
/// arbitrated against each other in `locks`, while the record locks show
/// other processes what the process as a whole holds.
struct Inode {
    /// Also handed to the page store, so no second descriptor is opened
    db: Arc<Mutex<File>>,
    shm: File,
    locks: Mutex<LocalLocks>,
}

type InodeTable = Mutex<HashMap<InodeKey, Weak<Inode>>>;

fn inode_table() -> &'static InodeTable {
    static TABLE: OnceLock<InodeTable> = OnceLock::new();
    TABLE.get_or_init(Default::default)
}

impl Inode {
    fn open(db_path: &Path) -> Result<(InodeKey, Self)> {
        let db = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path)?;
        let key = InodeKey::of(&db.metadata()?);
        let shm = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sidecar_path(db_path, "-shm"))?;

        if posix_lock(&shm, libc::F_WRLCK, SHM_DMS_BYTE, 1)? {
            // no other process has the database open
            shm.set_len(0)?;
            shm.set_len(SHM_SIZE)?;
            let mut marks = [0u8; READ_MARK_COUNT * 4];
            for mark in marks.chunks_mut(4).skip(1) {
                mark.copy_from_slice(&READMARK_NOT_USED.to_be_bytes());
            }
            shm.write_all_at(&marks, SHM_READ_MARK_OFFSET)?;
            debug!(path = %db_path.display(), "initialized shared-memory file");
        }
        if !posix_lock(&shm, libc::F_RDLCK, SHM_DMS_BYTE, 1)? {
            return Err(LodeError::Busy);
        }
        if shm.metadata()?.len() < SHM_SIZE {
            shm.set_len(SHM_SIZE)?;
        }

        let inode = Self {
            db: Arc::new(Mutex::new(db)),
            shm,
            locks: Mutex::new(LocalLocks::default()),
        };
        Ok((key, inode))
    }

    fn db_lock(&self, lock_type: libc::c_int, start: u64, len: u64) -> Result<bool> {
        posix_lock(&self.db.lock(), lock_type, start, len)
    }

    fn slot_lock(&self, lock_type: libc::c_int, slot: Slot) -> Result<bool> {
        posix_lock(&self.shm, lock_type, SHM_LOCK_BASE + slot.index() as u64, 1)
    }

    /// Takes the process's read lock on the shared range.
    fn lock_shared(&self) -> Result<bool> {
        // a pending writer holds this byte, keeping new readers out
        if !self.db_lock(libc::F_RDLCK, PENDING_BYTE, 1)? {
            return Ok(false);
        }
        let ok = self.db_lock(libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)?;
        self.db_lock(libc::F_UNLCK, PENDING_BYTE, 1)?;
        Ok(ok)
    }

    fn read_word(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.shm.read_exact_at(&mut buf, offset)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn write_word(&self, offset: u64, value: u32) -> Result<()> {
        self.shm.write_all_at(&value.to_be_bytes(), offset)?;
        Ok(())
    }
}

/// File-lock protocol over POSIX advisory record locks on the database file,
/// with log coordination state kept in a `<db>-shm` file.
///
/// Managers opened on the same file within one process share a single
/// set of descriptors and exclude each other like separate processes do.
pub struct PosixLockManager {
    inode: Arc<Inode>,
    id: u64,
}

impl PosixLockManager {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let mut table = inode_table().lock();
        table.retain(|_, inode| inode.strong_count() > 0);

        let existing = match fs::metadata(db_path) {
            Ok(meta) => table.get(&InodeKey::of(&meta)).and_then(Weak::upgrade),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let inode = match existing {
            Some(inode) => inode,
            None => {
                let (key, inode) = Inode::open(db_path)?;
                let inode = Arc::new(inode);
                table.insert(key, Arc::downgrade(&inode));
                inode
            }
        };
        drop(table);

        let id = inode.locks.lock().register();
        trace!(conn = id, path = %db_path.display(), "opened file locks");
        Ok(Self { inode, id })
    }

    /// Handle on the database file that shares this manager's descriptor.
    pub fn db_file(&self) -> Arc<Mutex<File>> {
        Arc::clone(&self.inode.db)
    }

    fn mark_offset(index: usize) -> Result<u64> {
        if index >= READ_MARK_COUNT {
            return Err(LodeError::Misuse("read mark index out of range"));
        }
        Ok(SHM_READ_MARK_OFFSET + 4 * index as u64)
    }
}

impl LockManager for PosixLockManager {
    fn level(&self) -> LockLevel {
        self.inode.locks.lock().level_of(self.id)
    }

    fn acquire(&self, level: LockLevel) -> Result<()> {
        let inode = &self.inode;
        let mut locks = inode.locks.lock();
        let current = locks.level_of(self.id);
        if level <= current {
            return Ok(());
        }
        if current == LockLevel::Unlocked && level > LockLevel::Shared {
            return Err(LodeError::Misuse("SHARED must be held before a write lock"));
        }

        if level == LockLevel::Shared {
            if locks.other_holds(self.id, LockLevel::Pending) {
                return Err(LodeError::Busy);
            }
            // the first local reader takes the record lock for the process
            if !locks.other_holds(self.id, LockLevel::Shared) && !inode.lock_shared()? {
                return Err(LodeError::Busy);
            }
            locks.set_level(self.id, LockLevel::Shared);
            trace!(conn = self.id, "acquired SHARED");
            return Ok(());
        }

        let took_reserved = current < LockLevel::Reserved;
        if took_reserved {
            if locks.other_holds(self.id, LockLevel::Reserved)
                || !inode.db_lock(libc::F_WRLCK, RESERVED_BYTE, 1)?
            {
                return Err(LodeError::Busy);
            }
            locks.set_level(self.id, LockLevel::Reserved);
        }

        if level >= LockLevel::Pending && locks.level_of(self.id) < LockLevel::Pending {
            if !inode.db_lock(libc::F_WRLCK, PENDING_BYTE, 1)? {
                if took_reserved {
                    inode.db_lock(libc::F_UNLCK, RESERVED_BYTE, 1)?;
                    locks.set_level(self.id, current);
                }
                return Err(LodeError::Busy);
            }
            locks.set_level(self.id, LockLevel::Pending);
        }

        if level == LockLevel::Exclusive {
            if locks.other_holds(self.id, LockLevel::Shared)
                || !inode.db_lock(libc::F_WRLCK, SHARED_FIRST, SHARED_SIZE)?
            {
                trace!(conn = self.id, "exclusive lock waiting for readers");
                return Err(LodeError::Busy);
            }
            locks.set_level(self.id, LockLevel::Exclusive);
        }

        trace!(conn = self.id, from = %current, to = %locks.level_of(self.id), "lock acquired");
        Ok(())
    }

    fn downgrade(&self, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(LodeError::Misuse("locks can only be lowered to SHARED or UNLOCKED"));
        }
        let inode = &self.inode;
        let mut locks = inode.locks.lock();
        let current = locks.level_of(self.id);
        if level >= current {
            return Ok(());
        }

        if current == LockLevel::Exclusive
            && !inode.db_lock(libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)?
        {
            return Err(LodeError::Io(std::io::Error::other(
                "could not convert exclusive lock to shared",
            )));
        }
        if current >= LockLevel::Pending {
            inode.db_lock(libc::F_UNLCK, PENDING_BYTE, 1)?;
        }
        if current >= LockLevel::Reserved {
            inode.db_lock(libc::F_UNLCK, RESERVED_BYTE, 1)?;
        }
        // the last local reader gives up the process's record lock
        if level == LockLevel::Unlocked && !locks.other_holds(self.id, LockLevel::Shared) {
            inode.db_lock(libc::F_UNLCK, SHARED_FIRST, SHARED_SIZE)?;
        }
        locks.set_level(self.id, level);
        Ok(())
    }

    fn try_lock_slot(&self, slot: Slot, mode: SlotMode) -> Result<bool> {
        let mut locks = self.inode.locks.lock();
        if !locks.slot_admits(self.id, slot, mode) {
            return Ok(false);
        }
        if locks.slot_mode(slot) != Some(mode) {
            let lock_type = match mode {
                SlotMode::Shared => libc::F_RDLCK,
                SlotMode::Exclusive => libc::F_WRLCK,
            };
            if !self.inode.slot_lock(lock_type, slot)? {
                return Ok(false);
            }
        }
        locks.grant_slot(self.id, slot, mode);
        Ok(true)
    }

    fn unlock_slot(&self, slot: Slot) -> Result<()> {
        let mut locks = self.inode.locks.lock();
        if locks.remove_slot(self.id, slot) && locks.slot_mode(slot).is_none() {
            self.inode.slot_lock(libc::F_UNLCK, slot)?;
        }
        Ok(())
    }

    fn read_mark(&self, index: usize) -> Result<FrameNumber> {
        self.inode.read_word(Self::mark_offset(index)?)
    }

    fn set_read_mark(&self, index: usize, frame: FrameNumber) -> Result<()> {
        self.inode.write_word(Self::mark_offset(index)?, frame)
    }

    fn backfill(&self) -> Result<Backfill> {
        Ok(Backfill {
            salt1: self.inode.read_word(SHM_BACKFILL_OFFSET)?,
            salt2: self.inode.read_word(SHM_BACKFILL_OFFSET + 4)?,
            frames: self.inode.read_word(SHM_BACKFILL_OFFSET + 8)?,
        })
    }

    fn set_backfill(&self, backfill: Backfill) -> Result<()> {
        self.inode.write_word(SHM_BACKFILL_OFFSET, backfill.salt1)?;
        self.inode.write_word(SHM_BACKFILL_OFFSET + 4, backfill.salt2)?;
        self.inode.write_word(SHM_BACKFILL_OFFSET + 8, backfill.frames)
    }
}

impl Drop for PosixLockManager {
    fn drop(&mut self) {
        let slots = self.inode.locks.lock().slots_of(self.id);
        let released = slots
            .into_iter()
            .try_for_each(|slot| self.unlock_slot(slot))
            .and_then(|()| self.release());
        if let Err(e) = released {
            warn!(conn = self.id, error = %e, "failed to release file locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_level_transitions() {
        let dir = tempdir().unwrap();
        let locks = PosixLockManager::open(dir.path().join("test.db")).unwrap();

        locks.acquire(LockLevel::Shared).unwrap();
        locks.acquire(LockLevel::Reserved).unwrap();
        locks.acquire(LockLevel::Exclusive).unwrap();
        assert_eq!(locks.level(), LockLevel::Exclusive);

        locks.downgrade(LockLevel::Shared).unwrap();
        assert_eq!(locks.level(), LockLevel::Shared);
        locks.release().unwrap();
        assert_eq!(locks.level(), LockLevel::Unlocked);
    }

    #[test]
    fn test_shm_state_starts_fresh() {
        let dir = tempdir().unwrap();
        let locks = PosixLockManager::open(dir.path().join("test.db")).unwrap();
        assert_eq!(locks.read_mark(0).unwrap(), 0);
        assert_eq!(locks.read_mark(1).unwrap(), READMARK_NOT_USED);
        assert_eq!(locks.backfill().unwrap(), Backfill::default());

        locks.set_read_mark(2, 40).unwrap();
        assert_eq!(locks.read_mark(2).unwrap(), 40);
        assert!(locks.read_mark(READ_MARK_COUNT).is_err());
    }

    #[test]
    fn test_slot_lock_and_unlock() {
        let dir = tempdir().unwrap();
        let locks = PosixLockManager::open(dir.path().join("test.db")).unwrap();
        assert!(locks.try_lock_slot(Slot::WalWrite, SlotMode::Exclusive).unwrap());
        locks.unlock_slot(Slot::WalWrite).unwrap();
        assert!(locks.try_lock_slot(Slot::ReadMark(1), SlotMode::Shared).unwrap());
    }

    #[test]
    fn test_write_lock_requires_shared() {
        let dir = tempdir().unwrap();
        let locks = PosixLockManager::open(dir.path().join("test.db")).unwrap();
        assert!(matches!(
            locks.acquire(LockLevel::Exclusive),
            Err(LodeError::Misuse(_))
        ));
    }

    #[test]
    fn test_same_file_shares_one_inode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let a = PosixLockManager::open(&path).unwrap();
        let b = PosixLockManager::open(&path).unwrap();
        assert!(Arc::ptr_eq(&a.inode, &b.inode));
        assert_ne!(a.id, b.id);

        // a later open does not reset the shared state
        a.set_read_mark(1, 9).unwrap();
        let c = PosixLockManager::open(&path).unwrap();
        assert_eq!(c.read_mark(1).unwrap(), 9);

        drop((a, b, c));
        let d = PosixLockManager::open(&path).unwrap();
        assert_eq!(d.read_mark(1).unwrap(), READMARK_NOT_USED);
    }

    #[test]
    fn test_local_connections_exclude_each_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let writer = PosixLockManager::open(&path).unwrap();
        let reader = PosixLockManager::open(&path).unwrap();

        writer.acquire(LockLevel::Shared).unwrap();
        reader.acquire(LockLevel::Shared).unwrap();
        writer.acquire(LockLevel::Reserved).unwrap();
        assert!(reader.acquire(LockLevel::Reserved).unwrap_err().is_busy());

        assert!(writer.acquire(LockLevel::Exclusive).unwrap_err().is_busy());
        assert_eq!(writer.level(), LockLevel::Pending);
        reader.release().unwrap();
        assert!(reader.acquire(LockLevel::Shared).unwrap_err().is_busy());

        writer.acquire(LockLevel::Exclusive).unwrap();
        writer.release().unwrap();
        reader.acquire(LockLevel::Shared).unwrap();
        reader.acquire(LockLevel::Reserved).unwrap();
    }

    #[test]
    fn test_local_slot_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let a = PosixLockManager::open(&path).unwrap();
        let b = PosixLockManager::open(&path).unwrap();
        let slot = Slot::ReadMark(2);

        assert!(a.try_lock_slot(slot, SlotMode::Shared).unwrap());
        assert!(b.try_lock_slot(slot, SlotMode::Shared).unwrap());
        assert!(!a.try_lock_slot(slot, SlotMode::Exclusive).unwrap());
        b.unlock_slot(slot).unwrap();
        assert!(a.try_lock_slot(slot, SlotMode::Exclusive).unwrap());
        assert!(!b.try_lock_slot(slot, SlotMode::Shared).unwrap());

        // dropping a connection hands its slots back
        drop(a);
        assert!(b.try_lock_slot(slot, SlotMode::Exclusive).unwrap());
    }
}
