use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// The path given to open is the data file itself, not a directory
        const NOSUBDIR = 0x4000;
        /// Don't flush the map after commit
        const NOSYNC = 0x10000;
        /// Don't flush the meta header after commit
        const NOMETASYNC = 0x40000;
        /// The engine does not serialize writers; callers must
        const NOLOCK = 0x400000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransactionFlags: u32 {
        // Reuse environment bit
        const RDONLY = 0x20000;

        // Lifecycle bits
        const FINISHED = 0x01;
        const RESET = 0x04;
    }
}

// Reader pool update handling
bitflags! {
    /// How a `TxnPool` treats read-only transactions once a newer write has
    /// been committed.
    ///
    /// The empty set ignores updates entirely: pooled readers are renewed
    /// when they are next acquired and nothing else.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateHandling: u32 {
        /// Stale readers returned to the pool are aborted.
        const HANDLE_OUTSTANDING = 1 << 0;
        /// Idle readers are swept after a commit advances the watermark.
        /// Best effort: no guarantee every stale reader is found.
        const HANDLE_IDLE = 1 << 1;
        /// Stale readers are renewed and kept instead of aborted.
        const HANDLE_RENEW = 1 << 2;
        const HANDLE_ALL = Self::HANDLE_OUTSTANDING.bits() | Self::HANDLE_IDLE.bits();
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// Packed on-map format version
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;
/// Pages reserved for the meta header at the front of the map
pub const META_PAGES: usize = 1;
/// Name of the data file inside an environment directory
pub const DATA_FILE: &str = "data.mdb";
/// Name of the writer lock file inside an environment directory
pub const LOCK_FILE: &str = "lock.mdb";
/// Suffix of the writer lock file for `NOSUBDIR` environments
pub const LOCK_SUFFIX: &str = "-lock";

// Environment defaults
pub const DEFAULT_MAP_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_DBS: u32 = 0;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_KEY_SIZE: usize = 511;
/// Largest value a single put accepts
pub const MAX_VAL_SIZE: usize = u32::MAX as usize;

/// Consecutive `MapResized` failures tolerated by a default
/// `MapResizedHandler`.
pub const MAP_RESIZED_DEFAULT_RETRY: i32 = 2;
