// GPU buffers: vertex, index, uniform and staging
//
// All kinds share one implementation, `GpuBuffer<K>`. The kind marker only
// fixes usage flags, memory preferences and whether the buffer stays mapped.

use anyhow::Result;
use ash::vk;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use super::device::QueueType;
use super::image::GpuImage;
use super::memory::{atom_aligned_range, DeviceAllocation, MemoryRequest, MemoryTier};
use super::VulkanDevice;
use crate::error::ResourceError;
use crate::renderer::Renderer;

/// Static description of a buffer kind
pub trait BufferKind: 'static {
    const NAME: &'static str;
    const USAGE: vk::BufferUsageFlags;
    const MEMORY: MemoryRequest;
    /// Keep the memory mapped for the whole lifetime of the buffer
    const PERSISTENT_MAP: bool;
}

pub mod kind {
    use super::*;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[derive(Debug)]
    pub struct Vertex;
    #[derive(Debug)]
    pub struct Index;
    #[derive(Debug)]
    pub struct Uniform;
    #[derive(Debug)]
    pub struct Staging;

    impl BufferKind for Vertex {
        const NAME: &'static str = "vertex";
        const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
            vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
                | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
                | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
        );
        const MEMORY: MemoryRequest = MemoryRequest::new(
            HOST,
            vk::MemoryPropertyFlags::from_raw(COHERENT.as_raw() | LOCAL.as_raw()),
        );
        const PERSISTENT_MAP: bool = false;
    }

    impl BufferKind for Index {
        const NAME: &'static str = "index";
        const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
            vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
                | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
                | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
        );
        const MEMORY: MemoryRequest = MemoryRequest::new(
            HOST,
            vk::MemoryPropertyFlags::from_raw(COHERENT.as_raw() | LOCAL.as_raw()),
        );
        const PERSISTENT_MAP: bool = false;
    }

    impl BufferKind for Uniform {
        const NAME: &'static str = "uniform";
        const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
            vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
                | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
                | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
        );
        const MEMORY: MemoryRequest = MemoryRequest::new(HOST, COHERENT);
        const PERSISTENT_MAP: bool = true;
    }

    impl BufferKind for Staging {
        const NAME: &'static str = "staging";
        const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
            vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
                | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
        );
        const MEMORY: MemoryRequest = MemoryRequest::new(
            vk::MemoryPropertyFlags::from_raw(HOST.as_raw() | COHERENT.as_raw()),
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        const PERSISTENT_MAP: bool = false;
    }
}

pub type VertexBuffer = GpuBuffer<kind::Vertex>;
pub type IndexBuffer = GpuBuffer<kind::Index>;
pub type UniformBuffer = GpuBuffer<kind::Uniform>;
pub type StagingBuffer = GpuBuffer<kind::Staging>;

/// Fail unless `[offset, offset+size)` lies inside `capacity`
pub fn check_range(offset: u64, size: u64, capacity: u64) -> Result<(), ResourceError> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(ResourceError::OutOfBounds {
            size,
            offset,
            capacity,
        }),
    }
}

/// Bounds-checked copy into host memory; nothing is written on failure
pub fn write_region(dst: &mut [u8], offset: usize, data: &[u8]) -> Result<(), ResourceError> {
    check_range(offset as u64, data.len() as u64, dst.len() as u64)?;
    dst[offset..offset + data.len()].copy_from_slice(data);
    Ok(())
}

/// Bounds-checked copy out of host memory
pub fn read_region(src: &[u8], offset: usize, out: &mut [u8]) -> Result<(), ResourceError> {
    check_range(offset as u64, out.len() as u64, src.len() as u64)?;
    out.copy_from_slice(&src[offset..offset + out.len()]);
    Ok(())
}

/// A linear GPU buffer with its own memory
pub struct GpuBuffer<K: BufferKind> {
    buffer: vk::Buffer,
    allocation: DeviceAllocation,
    capacity: vk::DeviceSize,
    persistent: Option<NonNull<u8>>,
    device: Arc<VulkanDevice>,
    _kind: PhantomData<K>,
}

impl<K: BufferKind> std::fmt::Debug for GpuBuffer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("kind", &K::NAME)
            .field("buffer", &self.buffer)
            .field("capacity", &self.capacity)
            .field("tier", &self.allocation.tier)
            .finish()
    }
}

impl<K: BufferKind> GpuBuffer<K> {
    /// Create a buffer with the kind's default memory preferences
    pub fn new(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self, ResourceError> {
        Self::with_memory(device, size, K::MEMORY)
    }

    /// Create a buffer in device-local memory; fill it through a staging buffer
    pub fn new_device_local(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
    ) -> Result<Self, ResourceError> {
        Self::with_memory(device, size, MemoryRequest::device_local())
    }

    /// Create a buffer with explicit memory preferences
    pub fn with_memory(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        request: MemoryRequest,
    ) -> Result<Self, ResourceError> {
        if size == 0 {
            return Err(ResourceError::Uninitialized("zero-sized buffer"));
        }

        let families = device.queue_families.unique();
        let mut buffer_info = vk::BufferCreateInfo::builder().size(size).usage(K::USAGE);
        // Transfer and graphics may live on different families
        buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match DeviceAllocation::allocate(device, requirements, request) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory, 0)
        };
        if let Err(err) = bound {
            unsafe { device.device.destroy_buffer(buffer, None) };
            allocation.free(&device.device);
            return Err(err.into());
        }

        let mut created = Self {
            buffer,
            allocation,
            capacity: size,
            persistent: None,
            device: Arc::clone(device),
            _kind: PhantomData,
        };

        if K::PERSISTENT_MAP && created.is_host_visible() {
            created.persistent = Some(created.map()?);
        }

        log::debug!(
            "Created {} buffer: {} bytes ({:?} tier)",
            K::NAME,
            size,
            created.allocation.tier
        );

        Ok(created)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    pub fn tier(&self) -> MemoryTier {
        self.allocation.tier
    }

    pub fn is_host_visible(&self) -> bool {
        self.allocation.is_host_visible()
    }

    pub fn is_persistently_mapped(&self) -> bool {
        self.persistent.is_some()
    }

    /// Write `data` at `offset`.
    ///
    /// Fails without touching memory if the range overflows the buffer or the
    /// memory is not host visible.
    pub fn set_data(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Result<(), ResourceError> {
        check_range(offset, data.len() as u64, self.capacity)?;
        if !self.is_host_visible() {
            return Err(ResourceError::NotHostVisible);
        }
        if data.is_empty() {
            return Ok(());
        }

        // Non-coherent ranges are flushed while still mapped
        self.with_mapped(|memory| {
            write_region(memory, offset as usize, data)?;
            self.flush(offset, data.len() as u64)
        })
    }

    /// Write a slice of plain-old-data values at `offset`
    pub fn set_slice<T: bytemuck::Pod>(
        &mut self,
        offset: vk::DeviceSize,
        values: &[T],
    ) -> Result<(), ResourceError> {
        self.set_data(offset, bytemuck::cast_slice(values))
    }

    /// Read `out.len()` bytes from `offset`
    pub fn read_data(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<(), ResourceError> {
        check_range(offset, out.len() as u64, self.capacity)?;
        if !self.is_host_visible() {
            return Err(ResourceError::NotHostVisible);
        }
        if out.is_empty() {
            return Ok(());
        }

        self.with_mapped(|memory| {
            self.invalidate(offset, out.len() as u64)?;
            read_region(memory, offset as usize, out)
        })
    }

    fn map(&self) -> Result<NonNull<u8>, ResourceError> {
        let ptr = unsafe {
            self.device.device.map_memory(
                self.allocation.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        NonNull::new(ptr as *mut u8).ok_or(ResourceError::Uninitialized("null mapping"))
    }

    /// Run `f` on the mapped bytes, mapping just for the call if needed
    fn with_mapped<R>(
        &self,
        f: impl FnOnce(&mut [u8]) -> Result<R, ResourceError>,
    ) -> Result<R, ResourceError> {
        let (ptr, temporary) = match self.persistent {
            Some(ptr) => (ptr, false),
            None => (self.map()?, true),
        };

        let memory = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.capacity as usize) };
        let result = f(memory);

        if temporary {
            unsafe { self.device.device.unmap_memory(self.allocation.memory) };
        }
        result
    }

    fn mapped_range(&self, offset: u64, size: u64) -> vk::MappedMemoryRange {
        let (offset, size) = atom_aligned_range(
            offset,
            size,
            self.device.non_coherent_atom_size(),
            self.allocation.size,
        );
        vk::MappedMemoryRange::builder()
            .memory(self.allocation.memory)
            .offset(offset)
            .size(size)
            .build()
    }

    /// Flush host writes; the memory must currently be mapped
    fn flush(&self, offset: u64, size: u64) -> Result<(), ResourceError> {
        if self.allocation.is_host_coherent() {
            return Ok(());
        }
        let range = self.mapped_range(offset, size);
        unsafe { self.device.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    /// Make device writes visible to the host; the memory must be mapped
    fn invalidate(&self, offset: u64, size: u64) -> Result<(), ResourceError> {
        if self.allocation.is_host_coherent() {
            return Ok(());
        }
        let range = self.mapped_range(offset, size);
        unsafe { self.device.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}

impl<K: BufferKind> Drop for GpuBuffer<K> {
    fn drop(&mut self) {
        unsafe {
            if self.persistent.take().is_some() {
                self.device.device.unmap_memory(self.allocation.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
        }
        self.allocation.free(&self.device.device);
    }
}

/// Device-side copies out of a staging buffer
impl StagingBuffer {
    /// Create a staging buffer already filled with `data`
    pub fn with_data(device: &Arc<VulkanDevice>, data: &[u8]) -> Result<Self, ResourceError> {
        let mut staging = Self::new(device, data.len() as u64)?;
        staging.set_data(0, data)?;
        Ok(staging)
    }

    fn buffer_copy<K: BufferKind>(
        &self,
        dst: &GpuBuffer<K>,
        region: vk::BufferCopy,
    ) -> Result<vk::BufferCopy, ResourceError> {
        check_range(region.src_offset, region.size, self.capacity)?;
        check_range(region.dst_offset, region.size, dst.capacity())?;
        Ok(region)
    }

    /// Copy `region` into `dst`, blocking until the copy is done
    pub fn transfer_to_buffer_immediate<K: BufferKind>(
        &self,
        device: &VulkanDevice,
        dst: &GpuBuffer<K>,
        region: vk::BufferCopy,
    ) -> Result<()> {
        let region = self.buffer_copy(dst, region)?;
        let (src, dst) = (self.buffer, dst.handle());

        device.immediate_submit(QueueType::Transfer, |device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }

    /// Copy `region` into `dst` as part of the current frame's batch.
    ///
    /// The staging buffer must stay alive until the batch completes; hand it
    /// to `Renderer::release_buffer` once queued.
    pub fn transfer_to_buffer<K: BufferKind>(
        &self,
        renderer: &mut Renderer,
        dst: &GpuBuffer<K>,
        region: vk::BufferCopy,
    ) -> Result<()> {
        let region = self.buffer_copy(dst, region)?;
        let (src, dst) = (self.buffer, dst.handle());

        renderer.queue_submit(QueueType::Transfer, move |device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }

    /// Copy a region of `src` back into this staging buffer, blocking
    pub fn transfer_from_buffer_immediate<K: BufferKind>(
        &mut self,
        device: &VulkanDevice,
        src: &GpuBuffer<K>,
        region: vk::BufferCopy,
    ) -> Result<()> {
        check_range(region.src_offset, region.size, src.capacity())?;
        check_range(region.dst_offset, region.size, self.capacity)?;
        let (src, dst) = (src.handle(), self.buffer);

        device.immediate_submit(QueueType::Transfer, |device, cmd| {
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }

    /// Upload the whole image (all layers) and leave it shader-readable, blocking
    pub fn transfer_to_image_immediate(&self, device: &VulkanDevice, image: &mut GpuImage) -> Result<()> {
        self.check_image_size(image)?;
        let copy = image.plan_upload()?;
        let src = self.buffer;

        device.immediate_submit(QueueType::Graphics, |device, cmd| {
            copy.record(device, cmd, src);
            Ok(())
        })?;
        image.commit_copy(&copy)?;
        Ok(())
    }

    /// Upload the whole image as part of the current frame's batch.
    ///
    /// The layout is committed once the copy is queued: a batch that fails to
    /// submit stays queued and goes out with the next flush.
    pub fn transfer_to_image(&self, renderer: &mut Renderer, image: &mut GpuImage) -> Result<()> {
        self.check_image_size(image)?;
        let copy = image.plan_upload()?;
        let src = self.buffer;

        renderer.queue_submit(QueueType::Graphics, |device, cmd| {
            copy.record(device, cmd, src);
            Ok(())
        })?;
        image.commit_copy(&copy)?;
        Ok(())
    }

    /// Copy the whole image back into this staging buffer, blocking
    pub fn transfer_from_image_immediate(
        &mut self,
        device: &VulkanDevice,
        image: &mut GpuImage,
    ) -> Result<()> {
        self.check_image_size(image)?;
        let copy = image.plan_readback()?;
        let dst = self.buffer;

        device.immediate_submit(QueueType::Graphics, |device, cmd| {
            copy.record(device, cmd, dst);
            Ok(())
        })?;
        image.commit_copy(&copy)?;
        Ok(())
    }

    fn check_image_size(&self, image: &GpuImage) -> Result<(), ResourceError> {
        let expected = image.byte_size();
        if self.capacity < expected {
            return Err(ResourceError::ImageSizeMismatch {
                given: self.capacity,
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflowing_write_leaves_memory_untouched() {
        let mut memory = vec![0xAAu8; 16];

        let err = write_region(&mut memory, 10, &[1, 2, 3, 4, 5, 6, 7]).unwrap_err();
        assert_eq!(
            err,
            ResourceError::OutOfBounds {
                size: 7,
                offset: 10,
                capacity: 16
            }
        );
        assert!(memory.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn write_up_to_capacity_succeeds() {
        let mut memory = vec![0u8; 8];
        write_region(&mut memory, 4, &[9, 9, 9, 9]).unwrap();
        assert_eq!(memory, [0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn range_check_handles_overflowing_offsets() {
        assert!(check_range(u64::MAX, 2, 16).is_err());
        assert!(check_range(0, 0, 0).is_ok());
        assert!(check_range(16, 1, 16).is_err());
    }

    #[test]
    fn read_back_returns_written_bytes() {
        let mut memory = vec![0u8; 32];
        let payload: Vec<u8> = (0..12).collect();
        write_region(&mut memory, 8, &payload).unwrap();

        let mut out = vec![0u8; 12];
        read_region(&memory, 8, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn kinds_carry_expected_usage() {
        assert!(kind::Vertex::USAGE.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(kind::Index::USAGE.contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(kind::Uniform::PERSISTENT_MAP);
        assert!(!kind::Staging::PERSISTENT_MAP);
        assert!(kind::Staging::MEMORY
            .required
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    }
}
