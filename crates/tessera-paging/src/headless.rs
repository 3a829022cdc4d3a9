//! Headless backend
//!
//! A deterministic software implementation of [`SparseBackend`]. Device
//! memory is plain host memory, sparse images are per-tier maps from page
//! coordinates to memory bindings, and transfers are recorded and executed
//! on [`SparseBackend::flush`]. Reads of unbound texels return zeros and
//! writes to them are dropped.

use ahash::{AHashMap, AHashSet};

use tessera_core::math::{Extent2D, Extent3D, Offset2D};

use crate::backend::{
    BackendError, BackendResult, BufferHandle, BufferImageCopy, DeviceCapabilities, ImageBlit,
    ImageHandle, ImageUsage, MemoryHandle, MemoryPropertyFlags, MemoryRequirements,
    SemaphoreHandle, SparseBackend, SparseImageBind, SparseImageDesc, TextureFormat,
};

const MEMORY_TYPES: [MemoryPropertyFlags; 2] = [
    MemoryPropertyFlags::HOST_VISIBLE.union(MemoryPropertyFlags::HOST_COHERENT),
    MemoryPropertyFlags::DEVICE_LOCAL,
];

/// Headless device configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessConfig {
    /// Reported sparse features
    pub capabilities: DeviceCapabilities,
    /// Sparse page granularity in texels
    pub granularity: Extent2D,
    /// Alignment reported in memory requirements
    pub memory_alignment: u64,
    /// Total device memory available, unlimited if `None`
    pub device_memory_limit: Option<u64>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            capabilities: DeviceCapabilities::full(),
            granularity: Extent2D::new(128, 128),
            memory_alignment: 64 * 1024,
            device_memory_limit: None,
        }
    }
}

impl HeadlessConfig {
    /// Device without sparse residency support
    pub fn without_sparse_residency() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                sparse_residency_image_2d: false,
                ..DeviceCapabilities::full()
            },
            ..Default::default()
        }
    }

    /// Override the page granularity
    pub fn with_granularity(mut self, width: u32, height: u32) -> Self {
        self.granularity = Extent2D::new(width, height);
        self
    }

    /// Override the memory alignment
    pub fn with_memory_alignment(mut self, alignment: u64) -> Self {
        self.memory_alignment = alignment;
        self
    }

    /// Limit total device memory
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.device_memory_limit = Some(bytes);
        self
    }
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessCounters {
    /// `bind_sparse` submissions
    pub bind_calls: u64,
    /// Pages bound to memory
    pub pages_bound: u64,
    /// Pages unbound
    pub pages_unbound: u64,
    /// `flush` calls
    pub submissions: u64,
    /// `barrier` calls
    pub barriers: u64,
    /// Bytes written into images from buffers
    pub uploaded_bytes: u64,
    /// Blit regions executed
    pub blits: u64,
    /// Device memory allocations
    pub allocations: u64,
    /// Device memory frees
    pub frees: u64,
    /// Frees of memory that was still bound to an image
    pub dangling_frees: u64,
}

struct HeadlessImage {
    format: TextureFormat,
    tiers: Vec<Extent2D>,
    bindings: Vec<AHashMap<(u32, u32), (MemoryHandle, u64)>>,
}

enum Command {
    BufferToImage {
        buffer: BufferHandle,
        image: ImageHandle,
        regions: Vec<BufferImageCopy>,
    },
    ImageToBuffer {
        image: ImageHandle,
        buffer: BufferHandle,
        regions: Vec<BufferImageCopy>,
    },
    Blit {
        image: ImageHandle,
        blits: Vec<ImageBlit>,
    },
}

/// Software sparse backend
pub struct HeadlessBackend {
    config: HeadlessConfig,
    next_handle: u64,
    images: AHashMap<u64, HeadlessImage>,
    memories: AHashMap<u64, Vec<u8>>,
    buffers: AHashMap<u64, Vec<u8>>,
    semaphores: AHashSet<u64>,
    pending: Vec<Command>,
    allocated_bytes: u64,
    counters: HeadlessCounters,
    reject_next_bind: bool,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessBackend {
    /// Create a headless device
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            next_handle: 1,
            images: AHashMap::new(),
            memories: AHashMap::new(),
            buffers: AHashMap::new(),
            semaphores: AHashSet::new(),
            pending: Vec::new(),
            allocated_bytes: 0,
            counters: HeadlessCounters::default(),
            reject_next_bind: false,
        }
    }

    /// Device configuration
    pub fn config(&self) -> &HeadlessConfig {
        &self.config
    }

    /// Operation counters
    pub fn counters(&self) -> HeadlessCounters {
        self.counters
    }

    /// Bytes of device memory currently allocated
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Make the next `bind_sparse` call fail
    pub fn reject_next_bind(&mut self) {
        self.reject_next_bind = true;
    }

    /// Number of live device memory allocations
    pub fn live_allocations(&self) -> usize {
        self.memories.len()
    }

    /// Number of pages of `image` currently bound to memory
    pub fn bound_page_count(&self, image: ImageHandle) -> usize {
        self.images
            .get(&image.0)
            .map(|img| img.bindings.iter().map(|tier| tier.len()).sum())
            .unwrap_or(0)
    }

    /// Check whether the page at `(col, row)` of `tier` is bound
    pub fn is_page_bound(&self, image: ImageHandle, tier: u32, col: u32, row: u32) -> bool {
        self.images
            .get(&image.0)
            .and_then(|img| img.bindings.get(tier as usize))
            .is_some_and(|tier| tier.contains_key(&(col, row)))
    }

    /// Read a region of an image immediately, bypassing the command stream
    pub fn read_region(
        &self,
        image: ImageHandle,
        tier: u32,
        offset: Offset2D,
        extent: Extent2D,
    ) -> BackendResult<Vec<u8>> {
        let bpt = self.image(image)?.format.bytes_per_texel() as usize;
        self.check_region(image, tier, offset, extent)?;
        let row_bytes = extent.width as usize * bpt;
        let mut out = vec![0u8; row_bytes * extent.height as usize];
        for row in 0..extent.height {
            let start = row as usize * row_bytes;
            self.read_row(image, tier, offset.x, offset.y + row, &mut out[start..start + row_bytes]);
        }
        Ok(out)
    }

    /// Read back the contents of a transfer buffer
    pub fn read_buffer(&self, buffer: BufferHandle) -> BackendResult<&[u8]> {
        self.buffers
            .get(&buffer.0)
            .map(Vec::as_slice)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn image(&self, image: ImageHandle) -> BackendResult<&HeadlessImage> {
        self.images
            .get(&image.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("image {}", image.0)))
    }

    fn page_bytes(&self, format: TextureFormat) -> u64 {
        self.config.granularity.area() * format.bytes_per_texel() as u64
    }

    fn check_region(
        &self,
        image: ImageHandle,
        tier: u32,
        offset: Offset2D,
        extent: Extent2D,
    ) -> BackendResult<()> {
        let img = self.image(image)?;
        let tier_extent = img
            .tiers
            .get(tier as usize)
            .ok_or_else(|| BackendError::OutOfBounds(format!("tier {tier}")))?;
        if offset.x + extent.width > tier_extent.width || offset.y + extent.height > tier_extent.height {
            return Err(BackendError::OutOfBounds(format!(
                "region {:?}+{:?} outside tier {tier} of {:?}",
                offset, extent, tier_extent
            )));
        }
        Ok(())
    }

    /// Memory location backing texel `(x, y)`
    fn texel_location(&self, image: ImageHandle, tier: u32, x: u32, y: u32) -> Option<(u64, usize)> {
        let img = self.images.get(&image.0)?;
        let gran = self.config.granularity;
        let (memory, base) = *img.bindings.get(tier as usize)?.get(&(x / gran.width, y / gran.height))?;
        let local = (y % gran.height) as u64 * gran.width as u64 + (x % gran.width) as u64;
        Some((memory.0, (base + local * img.format.bytes_per_texel() as u64) as usize))
    }

    fn read_row(&self, image: ImageHandle, tier: u32, x: u32, y: u32, out: &mut [u8]) {
        let Some(bpt) = self.images.get(&image.0).map(|img| img.format.bytes_per_texel() as usize) else {
            return;
        };
        let gran_w = self.config.granularity.width;
        let texels = (out.len() / bpt) as u32;
        let mut cursor = 0u32;
        while cursor < texels {
            let tx = x + cursor;
            let run = (gran_w - tx % gran_w).min(texels - cursor);
            let dst = &mut out[cursor as usize * bpt..(cursor + run) as usize * bpt];
            match self.texel_location(image, tier, tx, y) {
                Some((memory, start)) => match self.memories.get(&memory) {
                    Some(bytes) => dst.copy_from_slice(&bytes[start..start + dst.len()]),
                    None => dst.fill(0),
                },
                None => dst.fill(0),
            }
            cursor += run;
        }
    }

    fn write_row(&mut self, image: ImageHandle, tier: u32, x: u32, y: u32, data: &[u8]) {
        let Some(bpt) = self.images.get(&image.0).map(|img| img.format.bytes_per_texel() as usize) else {
            return;
        };
        let gran_w = self.config.granularity.width;
        let texels = (data.len() / bpt) as u32;
        let mut cursor = 0u32;
        while cursor < texels {
            let tx = x + cursor;
            let run = (gran_w - tx % gran_w).min(texels - cursor);
            let src = &data[cursor as usize * bpt..(cursor + run) as usize * bpt];
            if let Some((memory, start)) = self.texel_location(image, tier, tx, y) {
                if let Some(bytes) = self.memories.get_mut(&memory) {
                    bytes[start..start + src.len()].copy_from_slice(src);
                }
            }
            cursor += run;
        }
    }

    fn execute(&mut self, command: Command) -> BackendResult<()> {
        match command {
            Command::BufferToImage { buffer, image, regions } => {
                let bpt = self.image(image)?.format.bytes_per_texel() as usize;
                for region in regions {
                    self.check_region(image, region.tier, region.offset, region.extent)?;
                    let row_bytes = region.extent.width as usize * bpt;
                    let data = self.region_bytes(buffer, region.buffer_offset, row_bytes * region.extent.height as usize)?;
                    for row in 0..region.extent.height {
                        let start = row as usize * row_bytes;
                        self.write_row(
                            image,
                            region.tier,
                            region.offset.x,
                            region.offset.y + row,
                            &data[start..start + row_bytes],
                        );
                    }
                    self.counters.uploaded_bytes += data.len() as u64;
                }
            }
            Command::ImageToBuffer { image, buffer, regions } => {
                let bpt = self.image(image)?.format.bytes_per_texel() as usize;
                for region in regions {
                    self.check_region(image, region.tier, region.offset, region.extent)?;
                    let row_bytes = region.extent.width as usize * bpt;
                    let mut data = vec![0u8; row_bytes * region.extent.height as usize];
                    for row in 0..region.extent.height {
                        let start = row as usize * row_bytes;
                        self.read_row(
                            image,
                            region.tier,
                            region.offset.x,
                            region.offset.y + row,
                            &mut data[start..start + row_bytes],
                        );
                    }
                    let target = self
                        .buffers
                        .get_mut(&buffer.0)
                        .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
                    let start = region.buffer_offset as usize;
                    if start + data.len() > target.len() {
                        return Err(BackendError::OutOfBounds(format!("buffer {} write past end", buffer.0)));
                    }
                    target[start..start + data.len()].copy_from_slice(&data);
                }
            }
            Command::Blit { image, blits } => {
                for blit in blits {
                    self.check_region(image, blit.src_tier, blit.src_offset, blit.src_extent)?;
                    self.check_region(image, blit.dst_tier, blit.dst_offset, blit.dst_extent)?;
                    self.execute_blit(image, &blit);
                    self.counters.blits += 1;
                }
            }
        }
        Ok(())
    }

    fn region_bytes(&self, buffer: BufferHandle, offset: u64, len: usize) -> BackendResult<Vec<u8>> {
        let bytes = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        bytes
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| BackendError::OutOfBounds(format!("buffer {} read past end", buffer.0)))
    }

    /// Box-filtered downsample of one blit region
    fn execute_blit(&mut self, image: ImageHandle, blit: &ImageBlit) {
        let src = self.read_block(image, blit.src_tier, blit.src_offset, blit.src_extent);
        let (sw, sh) = (blit.src_extent.width as usize, blit.src_extent.height as usize);
        let (dw, dh) = (blit.dst_extent.width as usize, blit.dst_extent.height as usize);
        let mut row = vec![0u8; dw * 4];

        for dy in 0..dh {
            let y0 = dy * sh / dh;
            let y1 = ((dy + 1) * sh / dh).max(y0 + 1).min(sh);
            for dx in 0..dw {
                let x0 = dx * sw / dw;
                let x1 = ((dx + 1) * sw / dw).max(x0 + 1).min(sw);
                let mut sum = [0u32; 4];
                for y in y0..y1 {
                    for x in x0..x1 {
                        let texel = &src[(y * sw + x) * 4..(y * sw + x) * 4 + 4];
                        for (acc, value) in sum.iter_mut().zip(texel) {
                            *acc += *value as u32;
                        }
                    }
                }
                let count = ((y1 - y0) * (x1 - x0)) as u32;
                for (channel, acc) in sum.iter().enumerate() {
                    row[dx * 4 + channel] = ((acc + count / 2) / count) as u8;
                }
            }
            self.write_row(image, blit.dst_tier, blit.dst_offset.x, blit.dst_offset.y + dy as u32, &row);
        }
    }

    fn read_block(&self, image: ImageHandle, tier: u32, offset: Offset2D, extent: Extent2D) -> Vec<u8> {
        let row_bytes = extent.width as usize * 4;
        let mut out = vec![0u8; row_bytes * extent.height as usize];
        for row in 0..extent.height {
            let start = row as usize * row_bytes;
            self.read_row(image, tier, offset.x, offset.y + row, &mut out[start..start + row_bytes]);
        }
        out
    }
}

impl SparseBackend for HeadlessBackend {
    fn capabilities(&self) -> DeviceCapabilities {
        self.config.capabilities
    }

    fn query_page_granularity(&self, _format: TextureFormat, _usage: ImageUsage) -> BackendResult<Extent3D> {
        if !self.config.capabilities.sparse_residency_image_2d {
            return Err(BackendError::Unsupported("sparse residency for 2D images".to_string()));
        }
        let gran = self.config.granularity;
        Ok(Extent3D::new(gran.width, gran.height, 1))
    }

    fn create_sparse_image(&mut self, desc: &SparseImageDesc) -> BackendResult<ImageHandle> {
        if let Some(feature) = self.config.capabilities.missing_feature() {
            return Err(BackendError::Unsupported(feature.to_string()));
        }
        if desc.extent.is_empty() || desc.tiers == 0 {
            return Err(BackendError::Unsupported(format!("image {:?} with {} tiers", desc.extent, desc.tiers)));
        }

        let mut tiers = Vec::with_capacity(desc.tiers as usize);
        let mut extent = desc.extent;
        for _ in 0..desc.tiers {
            tiers.push(extent);
            extent = extent.halved();
        }

        let handle = self.allocate_handle();
        self.images.insert(
            handle,
            HeadlessImage {
                format: desc.format,
                bindings: vec![AHashMap::new(); tiers.len()],
                tiers,
            },
        );
        Ok(ImageHandle(handle))
    }

    fn query_memory_requirements(&self, image: ImageHandle) -> BackendResult<MemoryRequirements> {
        let img = self.image(image)?;
        let page_bytes = self.page_bytes(img.format);
        let pages: u64 = img
            .tiers
            .iter()
            .map(|tier| tier.tiles(self.config.granularity).area())
            .sum();
        Ok(MemoryRequirements {
            size: pages * page_bytes,
            alignment: self.config.memory_alignment,
            type_mask: (1 << MEMORY_TYPES.len()) - 1,
        })
    }

    fn find_memory_type(&self, type_bits: u32, properties: MemoryPropertyFlags) -> Option<u32> {
        MEMORY_TYPES
            .iter()
            .enumerate()
            .find(|(index, flags)| type_bits & (1u32 << *index) != 0 && flags.contains(properties))
            .map(|(index, _)| index as u32)
    }

    fn allocate_memory(&mut self, size: u64, type_index: u32) -> BackendResult<MemoryHandle> {
        if type_index as usize >= MEMORY_TYPES.len() {
            return Err(BackendError::InvalidHandle(format!("memory type {type_index}")));
        }
        if let Some(limit) = self.config.device_memory_limit {
            if self.allocated_bytes + size > limit {
                return Err(BackendError::OutOfDeviceMemory { requested: size });
            }
        }

        let handle = self.allocate_handle();
        self.memories.insert(handle, vec![0u8; size as usize]);
        self.allocated_bytes += size;
        self.counters.allocations += 1;
        Ok(MemoryHandle(handle))
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        let still_bound = self
            .images
            .values()
            .flat_map(|img| img.bindings.iter())
            .flat_map(|tier| tier.values())
            .any(|(bound, _)| *bound == memory);
        if still_bound {
            self.counters.dangling_frees += 1;
        }
        if let Some(bytes) = self.memories.remove(&memory.0) {
            self.allocated_bytes -= bytes.len() as u64;
            self.counters.frees += 1;
        }
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let handle = self.allocate_handle();
        self.semaphores.insert(handle);
        Ok(SemaphoreHandle(handle))
    }

    fn bind_sparse(
        &mut self,
        image: ImageHandle,
        binds: &[SparseImageBind],
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
    ) -> BackendResult<()> {
        if std::mem::take(&mut self.reject_next_bind) {
            return Err(BackendError::BindRejected("device lost during bind".to_string()));
        }
        for semaphore in wait.iter().chain(signal.iter()) {
            if !self.semaphores.contains(&semaphore.0) {
                return Err(BackendError::InvalidHandle(format!("semaphore {}", semaphore.0)));
            }
        }

        let img = self.image(image)?;
        let gran = self.config.granularity;
        let page_bytes = self.page_bytes(img.format);
        for bind in binds {
            if bind.tier as usize >= img.tiers.len() {
                return Err(BackendError::BindRejected(format!("tier {} does not exist", bind.tier)));
            }
            if bind.offset.x % gran.width != 0 || bind.offset.y % gran.height != 0 {
                return Err(BackendError::BindRejected(format!("offset {:?} is not page aligned", bind.offset)));
            }
            if let Some((memory, offset)) = bind.memory {
                let size = self
                    .memories
                    .get(&memory.0)
                    .map(|bytes| bytes.len() as u64)
                    .ok_or_else(|| BackendError::BindRejected(format!("memory {} does not exist", memory.0)))?;
                if offset + page_bytes > size {
                    return Err(BackendError::BindRejected(format!(
                        "offset {offset} past the end of memory {}",
                        memory.0
                    )));
                }
            }
        }

        let Some(img) = self.images.get_mut(&image.0) else {
            return Err(BackendError::InvalidHandle(format!("image {}", image.0)));
        };
        for bind in binds {
            let key = (bind.offset.x / gran.width, bind.offset.y / gran.height);
            let tier = &mut img.bindings[bind.tier as usize];
            match bind.memory {
                Some(binding) => {
                    tier.insert(key, binding);
                    self.counters.pages_bound += 1;
                }
                None => {
                    tier.remove(&key);
                    self.counters.pages_unbound += 1;
                }
            }
        }
        self.counters.bind_calls += 1;
        Ok(())
    }

    fn wait_sparse_idle(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn create_buffer(&mut self, size: u64) -> BackendResult<BufferHandle> {
        let handle = self.allocate_handle();
        self.buffers.insert(handle, vec![0u8; size as usize]);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let bytes = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let target = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| BackendError::OutOfBounds(format!("buffer {} write past end", buffer.0)))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn copy_buffer_to_image(
        &mut self,
        buffer: BufferHandle,
        image: ImageHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        self.image(image)?;
        self.pending.push(Command::BufferToImage {
            buffer,
            image,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn copy_image_to_buffer(
        &mut self,
        image: ImageHandle,
        buffer: BufferHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()> {
        self.image(image)?;
        self.pending.push(Command::ImageToBuffer {
            image,
            buffer,
            regions: regions.to_vec(),
        });
        Ok(())
    }

    fn blit_image(&mut self, image: ImageHandle, blits: &[ImageBlit]) -> BackendResult<()> {
        self.image(image)?;
        self.pending.push(Command::Blit {
            image,
            blits: blits.to_vec(),
        });
        Ok(())
    }

    fn barrier(&mut self, _image: ImageHandle, _tier: u32) {
        self.counters.barriers += 1;
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.counters.submissions += 1;
        let commands = std::mem::take(&mut self.pending);
        for command in commands {
            self.execute(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_backend() -> (HeadlessBackend, ImageHandle) {
        let mut backend = HeadlessBackend::new(HeadlessConfig::default().with_granularity(4, 4));
        let image = backend
            .create_sparse_image(&SparseImageDesc {
                format: TextureFormat::Rgba8Srgb,
                extent: Extent2D::new(8, 8),
                tiers: 2,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            })
            .unwrap();
        (backend, image)
    }

    fn bind(tier: u32, x: u32, y: u32, memory: Option<(MemoryHandle, u64)>) -> SparseImageBind {
        SparseImageBind {
            tier,
            offset: Offset2D::new(x, y),
            extent: Extent2D::new(4, 4),
            memory,
        }
    }

    #[test]
    fn test_unbound_reads_are_zero() {
        let (backend, image) = small_backend();
        let data = backend
            .read_region(image, 0, Offset2D::new(0, 0), Extent2D::new(8, 8))
            .unwrap();
        assert!(data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_upload_and_read_back() {
        let (mut backend, image) = small_backend();
        let memory = backend.allocate_memory(64, 1).unwrap();
        backend.bind_sparse(image, &[bind(0, 4, 0, Some((memory, 0)))], None, None).unwrap();

        let buffer = backend.create_buffer(64).unwrap();
        let pattern: Vec<u8> = (0..64).collect();
        backend.write_buffer(buffer, 0, &pattern).unwrap();
        let region = BufferImageCopy {
            buffer_offset: 0,
            tier: 0,
            offset: Offset2D::new(4, 0),
            extent: Extent2D::new(4, 4),
        };
        backend.copy_buffer_to_image(buffer, image, &[region]).unwrap();

        // Nothing happens until the flush
        let before = backend.read_region(image, 0, Offset2D::new(4, 0), Extent2D::new(4, 4)).unwrap();
        assert!(before.iter().all(|b| *b == 0));

        backend.flush().unwrap();
        let after = backend.read_region(image, 0, Offset2D::new(4, 0), Extent2D::new(4, 4)).unwrap();
        assert_eq!(after, pattern);
        assert_eq!(backend.counters().uploaded_bytes, 64);
    }

    #[test]
    fn test_blit_averages_quads() {
        let (mut backend, image) = small_backend();
        let memory = backend.allocate_memory(64 * 5, 1).unwrap();
        let binds: Vec<_> = [(0, 0), (4, 0), (0, 4), (4, 4)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| bind(0, *x, *y, Some((memory, i as u64 * 64))))
            .chain(std::iter::once(bind(1, 0, 0, Some((memory, 256)))))
            .collect();
        backend.bind_sparse(image, &binds, None, None).unwrap();

        let buffer = backend.create_buffer(256).unwrap();
        let texels: Vec<u8> = (0..64u32).flat_map(|i| {
            let v = if (i % 8) % 2 == 0 { 10 } else { 30 };
            [v, v, v, 255]
        }).collect();
        backend.write_buffer(buffer, 0, &texels).unwrap();
        let region = BufferImageCopy {
            buffer_offset: 0,
            tier: 0,
            offset: Offset2D::new(0, 0),
            extent: Extent2D::new(8, 8),
        };
        backend.copy_buffer_to_image(buffer, image, &[region]).unwrap();
        backend.barrier(image, 0);
        backend
            .blit_image(
                image,
                &[ImageBlit {
                    src_tier: 0,
                    src_offset: Offset2D::new(0, 0),
                    src_extent: Extent2D::new(8, 8),
                    dst_tier: 1,
                    dst_offset: Offset2D::new(0, 0),
                    dst_extent: Extent2D::new(4, 4),
                }],
            )
            .unwrap();
        backend.flush().unwrap();

        let coarse = backend.read_region(image, 1, Offset2D::new(0, 0), Extent2D::new(4, 4)).unwrap();
        assert!(coarse.chunks(4).all(|t| t == [20, 20, 20, 255]));
        assert_eq!(backend.counters().blits, 1);
    }

    #[test]
    fn test_bind_rejects_unaligned_offset() {
        let (mut backend, image) = small_backend();
        let memory = backend.allocate_memory(64, 1).unwrap();
        let result = backend.bind_sparse(image, &[bind(0, 2, 0, Some((memory, 0)))], None, None);
        assert!(matches!(result, Err(BackendError::BindRejected(_))));
        assert_eq!(backend.bound_page_count(image), 0);
    }

    #[test]
    fn test_dangling_free_is_counted() {
        let (mut backend, image) = small_backend();
        let memory = backend.allocate_memory(64, 1).unwrap();
        backend.bind_sparse(image, &[bind(0, 0, 0, Some((memory, 0)))], None, None).unwrap();
        backend.free_memory(memory);
        assert_eq!(backend.counters().dangling_frees, 1);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_memory_limit_and_types() {
        let mut backend = HeadlessBackend::new(HeadlessConfig::default().with_memory_limit(100));
        assert_eq!(backend.find_memory_type(0b11, MemoryPropertyFlags::DEVICE_LOCAL), Some(1));
        assert_eq!(backend.find_memory_type(0b01, MemoryPropertyFlags::DEVICE_LOCAL), None);
        assert!(backend.allocate_memory(80, 1).is_ok());
        assert!(matches!(
            backend.allocate_memory(40, 1),
            Err(BackendError::OutOfDeviceMemory { requested: 40 })
        ));
    }

    #[test]
    fn test_missing_residency() {
        let backend = HeadlessBackend::new(HeadlessConfig::without_sparse_residency());
        assert!(backend
            .query_page_granularity(TextureFormat::Rgba8Srgb, ImageUsage::SAMPLED)
            .is_err());
    }
}
