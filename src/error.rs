//! Error types for peermem.

use thiserror::Error;

/// Result type alias using peermem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for peermem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A bounds or permission check rejected the operation before any
    /// device work was issued.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The requested flag combination or backend pairing is not supported.
    ///
    /// Raised at construction time only.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Importing peer memory or a peer semaphore failed.
    #[error("import failed: {0}")]
    Import(String),

    /// A sharing call was handed a queue of the wrong backend or device.
    #[error("sharing protocol violation: {0}")]
    SharingProtocol(String),

    /// Accelerator driver error.
    #[error("driver error: {0}")]
    Driver(String),

    /// Vulkan peer backend error.
    #[cfg(feature = "vulkan")]
    #[error("vulkan error: {0}")]
    Vulkan(#[from] crate::peer::vulkan::VulkanError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Why a data-path operation was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Offset lies at or past the end of the resource.
    #[error("offset {offset} is out of bounds for size {size}")]
    OffsetOutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Resource size.
        size: usize,
    },

    /// `offset + len` runs past the end of the resource.
    #[error("range {offset}+{len} exceeds size {size}")]
    RangeOutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Resource size.
        size: usize,
    },

    /// Reading requires `HOST_READ`.
    #[error("resource was not created with HOST_READ")]
    MissingHostRead,

    /// Writing requires `HOST_WRITE`.
    #[error("resource was not created with HOST_WRITE")]
    MissingHostWrite,

    /// Fills of zero bytes are rejected.
    #[error("fill size must not be zero")]
    ZeroFill,

    /// Fill pattern is empty.
    #[error("fill pattern must not be empty")]
    EmptyPattern,

    /// Fill offset or size is not a multiple of the pattern size.
    #[error("fill offset {offset} / size {len} not a multiple of pattern size {pattern}")]
    PatternMisaligned {
        /// Requested offset.
        offset: usize,
        /// Requested fill size.
        len: usize,
        /// Pattern size.
        pattern: usize,
    },

    /// `WRITE_INVALIDATE` combined with `READ` or `WRITE`.
    #[error("WRITE_INVALIDATE is mutually exclusive with READ and WRITE")]
    ExclusiveMapFlags,

    /// Map flags name no intent.
    #[error("map flags must contain READ, WRITE or WRITE_INVALIDATE")]
    NoMapIntent,

    /// Map size is zero.
    #[error("map size must not be zero")]
    ZeroMap,

    /// Resource has no host access at all.
    #[error("resource has no host access and can not be mapped")]
    NoHostAccess,

    /// Map intent exceeds the declared host access.
    #[error("map intent exceeds declared host access")]
    MapIntentExceedsHostAccess,

    /// `unmap` got a pointer that no outstanding `map` returned.
    #[error("pointer was not returned by a prior map")]
    UnknownMapping,

    /// An accelerator queue or copy source of another device. Device
    /// addresses are only meaningful to the driver that issued them.
    #[error("queue or source buffer belongs to another device")]
    ForeignDevice,

    /// Ownership calls on a resource without a sharing target.
    #[error("resource is not shared with a peer")]
    NotShared,

    /// Image mip level does not exist.
    #[error("mip level {level} out of range, image has {levels}")]
    MipLevelOutOfRange {
        /// Requested level.
        level: u32,
        /// Number of levels.
        levels: u32,
    },
}
