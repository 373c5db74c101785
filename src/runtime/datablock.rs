//! Data-blocks
//!
//! A data-block is a GUID-named byte buffer. Tasks receive data-block GUIDs
//! through their dependency slots and acquire a view of the bytes in the
//! access mode the slot was bound with. Views hold their own reference to
//! the buffer, so destroying the GUID while a view is alive never frees
//! bytes still in use.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use super::error::{Result, RuntimeError};
use super::guid::Guid;

/// How a task intends to use a data-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessMode {
    /// Shared read access.
    ReadOnly = 0,
    /// Read and write.
    #[default]
    ReadWrite = 1,
    /// Read access to contents promised never to change.
    Const = 2,
    /// Write access excluding every other acquirer.
    ExclusiveWrite = 3,
    /// The slot carries the GUID only; no access is granted.
    Null = 4,
}

impl AccessMode {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => AccessMode::ReadOnly,
            1 => AccessMode::ReadWrite,
            2 => AccessMode::Const,
            3 => AccessMode::ExclusiveWrite,
            _ => AccessMode::Null,
        }
    }

    #[inline]
    pub fn allows_write(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::ExclusiveWrite)
    }
}

pub struct DataBlock {
    guid: Guid,
    bytes: Arc<RwLock<Vec<u8>>>,
    /// GUID this block was cloned from, NULL for originals.
    origin: Guid,
    acquisitions: AtomicU64,
}

impl fmt::Debug for DataBlock {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("guid", &self.guid)
            .field("origin", &self.origin)
            .field("len", &self.len())
            .finish()
    }
}

impl DataBlock {
    pub fn new(
        guid: Guid,
        bytes: Vec<u8>,
        origin: Guid,
    ) -> Self {
        DataBlock {
            guid,
            bytes: Arc::new(RwLock::new(bytes)),
            origin,
            acquisitions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn origin(&self) -> Guid {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of acquisitions made so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Copy of the current contents, used when cloning to another domain.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Acquire a view in `mode`. Writers wait for other views to drop.
    pub fn acquire(
        &self,
        mode: AccessMode,
    ) -> DbView {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let inner = match mode {
            AccessMode::Null => ViewInner::Null,
            AccessMode::ReadOnly | AccessMode::Const => ViewInner::Read(self.bytes.read_arc()),
            AccessMode::ReadWrite | AccessMode::ExclusiveWrite => {
                ViewInner::Write(self.bytes.write_arc())
            },
        };
        DbView {
            guid: self.guid,
            mode,
            inner,
        }
    }
}

enum ViewInner {
    Read(ArcRwLockReadGuard<RawRwLock, Vec<u8>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Vec<u8>>),
    Null,
}

/// An acquired data-block. Dropping the view releases it.
pub struct DbView {
    guid: Guid,
    mode: AccessMode,
    inner: ViewInner,
}

impl fmt::Debug for DbView {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DbView")
            .field("guid", &self.guid)
            .field("mode", &self.mode)
            .field("len", &self.len())
            .finish()
    }
}

impl DbView {
    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            ViewInner::Read(guard) => guard.as_slice(),
            ViewInner::Write(guard) => guard.as_slice(),
            ViewInner::Null => &[],
        }
    }

    /// Mutable bytes; fails unless the view was acquired for writing.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &mut self.inner {
            ViewInner::Write(guard) => Ok(guard.as_mut_slice()),
            ViewInner::Read(_) => Err(RuntimeError::ModeViolation("writing a read-only view")),
            ViewInner::Null => Err(RuntimeError::ModeViolation("writing a null view")),
        }
    }

    /// Resize the underlying buffer; requires a writable view.
    pub fn resize(
        &mut self,
        len: usize,
    ) -> Result<()> {
        match &mut self.inner {
            ViewInner::Write(guard) => {
                guard.resize(len, 0);
                Ok(())
            },
            _ => Err(RuntimeError::ModeViolation("resizing without write access")),
        }
    }

    /// Explicit release; equivalent to dropping the view.
    pub fn release(self) {}
}

impl Deref for DbView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}
