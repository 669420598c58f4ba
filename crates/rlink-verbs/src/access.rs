use bitflags::bitflags;

bitflags! {
    /// Raw access bits understood by the driver when pinning memory.
    ///
    /// If `REMOTE_WRITE` or `REMOTE_ATOMIC` is set, `LOCAL_WRITE` should be
    /// set as well; hardware rejects the combination otherwise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Which operations a memory registration permits.
///
/// An immutable value: every combinator consumes `self` and returns the
/// updated flags, so they chain.
///
/// ```
/// use rlink_verbs::AccessFlags;
///
/// let read_only = AccessFlags::default().clear().add_remote_read();
/// assert!(read_only.allows_remote_read());
/// assert!(!read_only.allows_remote_write());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessFlags {
    access: Access,
}

impl AccessFlags {
    pub const fn new(access: Access) -> Self {
        Self { access }
    }

    /// Replace the whole bitset.
    #[must_use]
    pub const fn set(self, access: Access) -> Self {
        Self { access }
    }

    #[must_use]
    pub const fn clear(self) -> Self {
        Self {
            access: Access::empty(),
        }
    }

    #[must_use]
    pub const fn add_local_write(self) -> Self {
        self.with(Access::LOCAL_WRITE)
    }

    #[must_use]
    pub const fn add_remote_write(self) -> Self {
        self.with(Access::REMOTE_WRITE)
    }

    #[must_use]
    pub const fn add_remote_read(self) -> Self {
        self.with(Access::REMOTE_READ)
    }

    #[must_use]
    pub const fn add_remote_atomic(self) -> Self {
        self.with(Access::REMOTE_ATOMIC)
    }

    const fn with(self, bit: Access) -> Self {
        Self {
            access: self.access.union(bit),
        }
    }

    pub const fn access(self) -> Access {
        self.access
    }

    pub const fn bits(self) -> u32 {
        self.access.bits()
    }

    pub const fn allows_local_write(self) -> bool {
        self.access.contains(Access::LOCAL_WRITE)
    }

    pub const fn allows_remote_read(self) -> bool {
        self.access.contains(Access::REMOTE_READ)
    }

    pub const fn allows_remote_write(self) -> bool {
        self.access.contains(Access::REMOTE_WRITE)
    }
}

impl Default for AccessFlags {
    /// All four permissions.
    fn default() -> Self {
        Self::new(Access::all())
    }
}

impl From<Access> for AccessFlags {
    fn from(access: Access) -> Self {
        Self::new(access)
    }
}
