//! Images: a buffer resource plus dimensions and a mip table.
//!
//! Levels are stored back to back, largest first. Each level holds all
//! array layers contiguously, so level `n` occupies
//! `[levels[n].offset, levels[n].offset + levels[n].size)` of the
//! underlying buffer. Every buffer rule (validation, map, ownership) applies
//! per level.

use crate::error::{Error, Result, ValidationError};
use crate::flags::{MapFlags, MemoryFlags};
use crate::memory::{DeviceMemory, Ownership};
use crate::peer::SharedPeer;
use crate::queue::Queue;
use crate::validate;
use std::ptr::NonNull;

/// Image dimensions and format size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Width of level 0 in pixels.
    pub width: u32,
    /// Height of level 0 in pixels.
    pub height: u32,
    /// Depth of level 0 in pixels; 1 for 1D/2D images.
    pub depth: u32,
    /// Array layers.
    pub layers: u32,
    /// Mip levels. 0 requests the full chain down to 1x1x1.
    pub mip_levels: u32,
    /// Bytes per pixel.
    pub bytes_per_pixel: u32,
}

impl ImageDesc {
    /// A single-level, single-layer 2D image.
    pub fn new_2d(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
            layers: 1,
            mip_levels: 1,
            bytes_per_pixel,
        }
    }

    /// A single-level 3D image.
    pub fn new_3d(width: u32, height: u32, depth: u32, bytes_per_pixel: u32) -> Self {
        Self {
            depth,
            ..Self::new_2d(width, height, bytes_per_pixel)
        }
    }

    /// Set the layer count.
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    /// Set the mip level count; 0 is the full chain.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Length of the full mip chain: `floor(log2(max extent)) + 1`.
    pub fn full_chain_len(&self) -> u32 {
        let extent = self.width.max(self.height).max(self.depth).max(1);
        u32::BITS - extent.leading_zeros()
    }

    /// Number of levels the image actually has. Requests longer than the
    /// full chain are clamped.
    pub fn level_count(&self) -> u32 {
        match self.mip_levels {
            0 => self.full_chain_len(),
            n => n.min(self.full_chain_len()),
        }
    }

    /// Compute the mip table.
    ///
    /// Fails with `UnsupportedConfiguration` for zero dimensions or when the
    /// image does not fit in the address space.
    pub fn mip_table(&self) -> Result<Vec<MipLevel>> {
        self.check()?;
        let mut offset = 0usize;
        let mut levels = Vec::with_capacity(self.level_count() as usize);
        for n in 0..self.level_count() {
            let width = (self.width >> n).max(1);
            let height = (self.height >> n).max(1);
            let depth = (self.depth >> n).max(1);
            let size = [height, depth, self.layers, self.bytes_per_pixel]
                .into_iter()
                .try_fold(width as usize, |acc, dim| acc.checked_mul(dim as usize));
            let Some((size, end)) = size.and_then(|s| Some((s, offset.checked_add(s)?))) else {
                return Err(Error::UnsupportedConfiguration(format!(
                    "image size overflows at mip level {n}: {self:?}"
                )));
            };
            levels.push(MipLevel {
                offset,
                size,
                width,
                height,
                depth,
                clamp: [width - 1, height - 1, depth - 1],
            });
            offset = end;
        }
        Ok(levels)
    }

    /// Total bytes of all levels.
    pub fn byte_size(&self) -> Result<usize> {
        Ok(self
            .mip_table()?
            .last()
            .map_or(0, |level| level.offset + level.size))
    }

    fn check(&self) -> Result<()> {
        if self.width == 0
            || self.height == 0
            || self.depth == 0
            || self.layers == 0
            || self.bytes_per_pixel == 0
        {
            return Err(Error::UnsupportedConfiguration(format!(
                "image dimensions must be non-zero: {self:?}"
            )));
        }
        Ok(())
    }
}

/// One mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevel {
    /// Byte offset of the level in the image.
    pub offset: usize,
    /// Bytes of the level, all layers included.
    pub size: usize,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth in pixels.
    pub depth: u32,
    /// Largest valid coordinate per axis.
    pub clamp: [u32; 3],
}

impl MipLevel {
    /// Bytes of one layer of this level.
    pub fn layer_size(&self, layers: u32) -> usize {
        self.size / layers.max(1) as usize
    }
}

/// An image over any buffer backend.
#[derive(Debug)]
pub struct DeviceImage<B: DeviceMemory> {
    buffer: B,
    desc: ImageDesc,
    levels: Vec<MipLevel>,
}

impl<B: DeviceMemory> DeviceImage<B> {
    /// Create the backing buffer with `create`, which receives the total
    /// byte size. `Ok(None)` from `create` (below minimum) is passed on.
    ///
    /// ```rust,ignore
    /// let image = DeviceImage::new_with(desc, |size| {
    ///     HostBuffer::new(&queue, BufferDesc::new(size, flags))
    /// })?;
    /// ```
    pub fn new_with<F>(desc: ImageDesc, create: F) -> Result<Option<Self>>
    where
        F: FnOnce(usize) -> Result<Option<B>>,
    {
        match create(desc.byte_size()?)? {
            Some(buffer) => Self::from_buffer(desc, buffer).map(Some),
            None => Ok(None),
        }
    }

    /// Use an existing buffer as image storage. The buffer must hold at
    /// least [`ImageDesc::byte_size`] bytes.
    pub fn from_buffer(desc: ImageDesc, buffer: B) -> Result<Self> {
        let levels = desc.mip_table()?;
        let needed = levels.last().map_or(0, |level| level.offset + level.size);
        if buffer.size() < needed {
            return Err(Error::UnsupportedConfiguration(format!(
                "image needs {needed} bytes, buffer holds {}",
                buffer.size()
            )));
        }
        tracing::debug!(
            width = desc.width,
            height = desc.height,
            depth = desc.depth,
            layers = desc.layers,
            levels = levels.len(),
            "created image"
        );
        Ok(Self {
            buffer,
            desc,
            levels,
        })
    }

    /// Image dimensions.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Array layers.
    pub fn layers(&self) -> u32 {
        self.desc.layers
    }

    /// The mip table.
    pub fn levels(&self) -> &[MipLevel] {
        &self.levels
    }

    /// One mip level.
    pub fn level(&self, level: u32) -> Result<&MipLevel> {
        match self.levels.get(level as usize) {
            Some(mip) => Ok(mip),
            None => validate::reject(
                "level",
                ValidationError::MipLevelOutOfRange {
                    level,
                    levels: self.levels.len() as u32,
                },
            ),
        }
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Give up the image view and return the buffer.
    pub fn into_buffer(self) -> B {
        self.buffer
    }

    /// Flags of the backing buffer.
    pub fn flags(&self) -> MemoryFlags {
        self.buffer.flags()
    }

    /// Byte offset of `layer` within `level`, relative to the image start.
    pub fn layer_offset(&self, level: u32, layer: u32) -> Result<usize> {
        let mip = self.level(level)?;
        if layer >= self.desc.layers {
            let layer_size = mip.layer_size(self.desc.layers);
            return validate::reject(
                "layer",
                ValidationError::RangeOutOfBounds {
                    offset: (layer as usize).saturating_mul(layer_size),
                    len: layer_size,
                    size: mip.size,
                },
            );
        }
        Ok(mip.offset + layer as usize * mip.layer_size(self.desc.layers))
    }

    /// Absolute offset of `[offset, offset + len)` inside `level`.
    fn level_range(&self, op: &'static str, level: u32, len: usize, offset: usize) -> Result<usize> {
        let mip = self.level(level)?;
        if cfg!(feature = "validation") {
            match offset.checked_add(len) {
                Some(end) if end <= mip.size => {}
                _ => {
                    return validate::reject(
                        op,
                        ValidationError::RangeOutOfBounds {
                            offset,
                            len,
                            size: mip.size,
                        },
                    );
                }
            }
        }
        Ok(mip.offset + offset)
    }

    /// Read `dst.len()` bytes at `offset` within `level`.
    pub fn read_level(&self, queue: &B::Queue, level: u32, dst: &mut [u8], offset: usize) -> Result<()> {
        let at = self.level_range("read", level, dst.len(), offset)?;
        self.buffer.read(queue, dst, at)
    }

    /// Read a whole level.
    pub fn read_level_vec(&self, queue: &B::Queue, level: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.level(level)?.size];
        self.read_level(queue, level, &mut out, 0)?;
        Ok(out)
    }

    /// Write `src` at `offset` within `level`.
    pub fn write_level(&self, queue: &B::Queue, level: u32, src: &[u8], offset: usize) -> Result<()> {
        let at = self.level_range("write", level, src.len(), offset)?;
        self.buffer.write(queue, src, at)
    }

    /// Fill a whole level with `pattern`.
    pub fn fill_level(&self, queue: &B::Queue, level: u32, pattern: &[u8]) -> Result<()> {
        let mip = *self.level(level)?;
        self.buffer.fill(queue, pattern, mip.size, mip.offset)
    }

    /// Map a whole level.
    pub fn map_level(&self, queue: &B::Queue, level: u32, flags: MapFlags) -> Result<NonNull<u8>> {
        let mip = *self.level(level)?;
        self.buffer.map(queue, flags, mip.size, mip.offset)
    }

    /// Release a pointer returned by [`map_level`](Self::map_level).
    pub fn unmap(&self, queue: &B::Queue, ptr: NonNull<u8>) -> Result<()> {
        self.buffer.unmap(queue, ptr)
    }

    /// The peer the image shares its memory with.
    pub fn shared_peer(&self) -> Option<&SharedPeer> {
        self.buffer.shared_peer()
    }

    /// Current owner of a shared image.
    pub fn ownership(&self) -> Option<Ownership> {
        self.buffer.ownership()
    }

    /// See [`DeviceMemory::acquire_peer`].
    pub fn acquire_peer(&self, queue: Option<&B::Queue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        self.buffer.acquire_peer(queue, peer_queue)
    }

    /// See [`DeviceMemory::release_peer`].
    pub fn release_peer(&self, queue: Option<&B::Queue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        self.buffer.release_peer(queue, peer_queue)
    }

    /// See [`DeviceMemory::sync_peer`].
    pub fn sync_peer(&self, queue: Option<&B::Queue>, peer_queue: Option<&dyn Queue>) -> Result<()> {
        self.buffer.sync_peer(queue, peer_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_chain_len() {
        assert_eq!(ImageDesc::new_2d(1, 1, 4).full_chain_len(), 1);
        assert_eq!(ImageDesc::new_2d(256, 256, 4).full_chain_len(), 9);
        assert_eq!(ImageDesc::new_2d(300, 17, 4).full_chain_len(), 9);
        assert_eq!(ImageDesc::new_3d(4, 4, 64, 1).full_chain_len(), 7);
    }

    #[test]
    fn test_mip_table_layout() {
        let desc = ImageDesc::new_2d(8, 4, 4).with_mip_levels(0).with_layers(2);
        let table = desc.mip_table().unwrap();
        assert_eq!(table.len(), 4);

        let dims: Vec<_> = table.iter().map(|l| (l.width, l.height)).collect();
        assert_eq!(dims, [(8, 4), (4, 2), (2, 1), (1, 1)]);
        assert_eq!(table[0].size, 8 * 4 * 4 * 2);
        assert_eq!(table[1].offset, table[0].size);
        assert_eq!(table[3].clamp, [0, 0, 0]);
        assert_eq!(table[0].clamp, [7, 3, 0]);
        assert_eq!(table[0].layer_size(2), 128);
        assert_eq!(desc.byte_size().unwrap(), 256 + 64 + 16 + 8);
    }

    #[test]
    fn test_mip_request_clamped() {
        let desc = ImageDesc::new_2d(4, 4, 1).with_mip_levels(10);
        assert_eq!(desc.level_count(), 3);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            ImageDesc::new_2d(0, 4, 4).check(),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_oversized_image_rejected() {
        let desc = ImageDesc::new_3d(u32::MAX, u32::MAX, u32::MAX, 16).with_layers(u32::MAX);
        assert!(matches!(
            desc.mip_table(),
            Err(Error::UnsupportedConfiguration(_))
        ));
        assert!(desc.byte_size().is_err());
    }
}
