//! Bounds and permission checks run before an operation reaches a backend.
//!
//! Every check returns `Ok(())` or an [`Error::Validation`]. Failures are
//! logged and counted; nothing here panics. With the `validation` feature
//! disabled all checks compile to `Ok(())`.

use crate::error::{Error, Result, ValidationError};
use crate::flags::{MapFlags, MemoryFlags};

/// Log, count and return a validation failure.
///
/// Also used for the checks that stay on without the `validation` feature
/// (unknown map pointers, ownership calls on unshared resources).
pub(crate) fn reject<T>(op: &'static str, err: ValidationError) -> Result<T> {
    tracing::error!(op, error = %err, "rejected device memory operation");
    crate::observability::record_validation_failure(op);
    Err(Error::Validation(err))
}

/// Check that `[offset, offset + len)` lies inside a resource of `size` bytes.
#[cfg(feature = "validation")]
fn range_check(op: &'static str, size: usize, len: usize, offset: usize) -> Result<()> {
    if offset >= size {
        return reject(op, ValidationError::OffsetOutOfBounds { offset, size });
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => reject(op, ValidationError::RangeOutOfBounds { offset, len, size }),
    }
}

/// Validate a host read of `req_size` bytes at `offset`.
///
/// A zero-sized read only logs a warning.
#[cfg(feature = "validation")]
pub fn read_check(size: usize, req_size: usize, offset: usize, flags: MemoryFlags) -> Result<()> {
    range_check("read", size, req_size, offset)?;
    if !flags.contains(MemoryFlags::HOST_READ) {
        return reject("read", ValidationError::MissingHostRead);
    }
    if req_size == 0 {
        tracing::warn!(offset, "read of zero bytes");
    }
    Ok(())
}

/// Validate a host write of `req_size` bytes at `offset`.
///
/// A zero-sized write only logs a warning.
#[cfg(feature = "validation")]
pub fn write_check(size: usize, req_size: usize, offset: usize, flags: MemoryFlags) -> Result<()> {
    range_check("write", size, req_size, offset)?;
    if !flags.contains(MemoryFlags::HOST_WRITE) {
        return reject("write", ValidationError::MissingHostWrite);
    }
    if req_size == 0 {
        tracing::warn!(offset, "write of zero bytes");
    }
    Ok(())
}

/// Validate a device copy; both ranges are checked against their own size.
#[cfg(feature = "validation")]
pub fn copy_check(
    dst_size: usize,
    src_size: usize,
    copy_size: usize,
    dst_offset: usize,
    src_offset: usize,
) -> Result<()> {
    range_check("copy", src_size, copy_size, src_offset)?;
    range_check("copy", dst_size, copy_size, dst_offset)
}

/// Validate a fill of `fill_size` bytes with a pattern of `pattern_size`.
#[cfg(feature = "validation")]
pub fn fill_check(size: usize, fill_size: usize, pattern_size: usize, offset: usize) -> Result<()> {
    if fill_size == 0 {
        return reject("fill", ValidationError::ZeroFill);
    }
    if pattern_size == 0 {
        return reject("fill", ValidationError::EmptyPattern);
    }
    if offset % pattern_size != 0 || fill_size % pattern_size != 0 {
        return reject(
            "fill",
            ValidationError::PatternMisaligned {
                offset,
                len: fill_size,
                pattern: pattern_size,
            },
        );
    }
    range_check("fill", size, fill_size, offset)
}

/// Validate a map request.
#[cfg(feature = "validation")]
pub fn map_check(
    size: usize,
    map_size: usize,
    flags: MemoryFlags,
    map_flags: MapFlags,
    offset: usize,
) -> Result<()> {
    if map_flags.contains(MapFlags::WRITE_INVALIDATE) && map_flags.intersects(MapFlags::READ_WRITE)
    {
        return reject("map", ValidationError::ExclusiveMapFlags);
    }
    if !map_flags.intersects(MapFlags::READ_WRITE | MapFlags::WRITE_INVALIDATE) {
        return reject("map", ValidationError::NoMapIntent);
    }
    if map_size == 0 {
        return reject("map", ValidationError::ZeroMap);
    }
    range_check("map", size, map_size, offset)?;

    if !flags.has_host_access() {
        return reject("map", ValidationError::NoHostAccess);
    }
    if !flags.contains(MemoryFlags::HOST_READ_WRITE) {
        let wants_read = map_flags.contains(MapFlags::READ);
        let wants_write = map_flags.intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE);
        if (wants_read && !flags.contains(MemoryFlags::HOST_READ))
            || (wants_write && !flags.contains(MemoryFlags::HOST_WRITE))
        {
            return reject("map", ValidationError::MapIntentExceedsHostAccess);
        }
    }
    Ok(())
}

/// Validation disabled; always succeeds.
#[cfg(not(feature = "validation"))]
#[inline(always)]
pub fn read_check(_: usize, _: usize, _: usize, _: MemoryFlags) -> Result<()> {
    Ok(())
}

/// Validation disabled; always succeeds.
#[cfg(not(feature = "validation"))]
#[inline(always)]
pub fn write_check(_: usize, _: usize, _: usize, _: MemoryFlags) -> Result<()> {
    Ok(())
}

/// Validation disabled; always succeeds.
#[cfg(not(feature = "validation"))]
#[inline(always)]
pub fn copy_check(_: usize, _: usize, _: usize, _: usize, _: usize) -> Result<()> {
    Ok(())
}

/// Validation disabled; always succeeds.
#[cfg(not(feature = "validation"))]
#[inline(always)]
pub fn fill_check(_: usize, _: usize, _: usize, _: usize) -> Result<()> {
    Ok(())
}

/// Validation disabled; always succeeds.
#[cfg(not(feature = "validation"))]
#[inline(always)]
pub fn map_check(_: usize, _: usize, _: MemoryFlags, _: MapFlags, _: usize) -> Result<()> {
    Ok(())
}
