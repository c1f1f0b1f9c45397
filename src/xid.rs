use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TxError};

/// Format identifier stamped on ids created by this crate ("MAAT").
pub const DEFAULT_FORMAT_ID: u32 = 0x4d41_4154;

/// Identifier of one branch of a global transaction.
///
/// The global part is shared by every branch of the same transaction and
/// never changes. The branch part is unique per participant. Two ids are
/// equal when their branch parts are equal, regardless of how they were
/// constructed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransactionId {
    format: u32,
    global: u64,
    branch: u64,
}

impl TransactionId {
    /// Creates a fresh id with random global and branch parts.
    pub fn new() -> Self {
        Self::with_format(DEFAULT_FORMAT_ID)
    }

    /// Creates a fresh id carrying the given format identifier.
    pub fn with_format(format: u32) -> Self {
        Self {
            format,
            global: rand::random(),
            branch: rand::random(),
        }
    }

    /// Rebuilds an id from its raw parts, e.g. when reading a recovery log.
    pub fn from_parts(format: u32, global: u64, branch: u64) -> Self {
        Self {
            format,
            global,
            branch,
        }
    }

    /// Derives a new branch of the same global transaction.
    ///
    /// The returned id keeps the format and global part and is never equal
    /// to `self`.
    pub fn new_branch(&self) -> Self {
        let mut branch = rand::random::<u64>();
        while branch == self.branch {
            branch = rand::random();
        }
        Self {
            format: self.format,
            global: self.global,
            branch,
        }
    }

    pub fn format_id(&self) -> u32 {
        self.format
    }

    pub fn global_id(&self) -> u64 {
        self.global
    }

    pub fn branch_id(&self) -> u64 {
        self.branch
    }

    /// Whether both ids belong to the same global transaction.
    pub fn same_global(&self, other: &TransactionId) -> bool {
        self.format == other.format && self.global == other.global
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.branch == other.branch
    }
}

impl Eq for TransactionId {}

impl Hash for TransactionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:016x}:{:016x}", self.format, self.global, self.branch)
    }
}

impl FromStr for TransactionId {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TxError::InvalidId(s.to_string());
        let mut parts = s.split(':');
        let (Some(format), Some(global), Some(branch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if format.len() != 8 || global.len() != 16 || branch.len() != 16 {
            return Err(invalid());
        }
        if !s.chars().all(|c| c == ':' || c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self {
            format: u32::from_str_radix(format, 16).map_err(|_| invalid())?,
            global: u64::from_str_radix(global, 16).map_err(|_| invalid())?,
            branch: u64::from_str_radix(branch, 16).map_err(|_| invalid())?,
        })
    }
}
