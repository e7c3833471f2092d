// Device memory selection and allocation
//
// Every resource asks for a *required* property mask and an *optimal* one.
// We try optimal+required first and fall back to required alone; the caller
// learns which tier it got (e.g. to decide whether a staging hop is needed).

use ash::vk;

use super::VulkanDevice;
use crate::error::ResourceError;

/// Which property tier an allocation was granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    /// Required and optimal properties both satisfied
    Optimal,
    /// Only the required properties are satisfied
    Required,
}

/// Memory properties a resource asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequest {
    pub required: vk::MemoryPropertyFlags,
    pub optimal: vk::MemoryPropertyFlags,
}

impl MemoryRequest {
    pub const fn new(required: vk::MemoryPropertyFlags, optimal: vk::MemoryPropertyFlags) -> Self {
        Self { required, optimal }
    }

    pub const fn device_local() -> Self {
        Self::new(vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::empty())
    }
}

/// Find a memory type index for `type_bits`, preferring the optimal tier
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    request: MemoryRequest,
) -> Option<(u32, MemoryTier)> {
    let find = |properties: vk::MemoryPropertyFlags| {
        (0..memory_properties.memory_type_count).find(|&i| {
            let has_type = (type_bits & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
    };

    if !request.optimal.is_empty() {
        if let Some(index) = find(request.required | request.optimal) {
            return Some((index, MemoryTier::Optimal));
        }
    }

    find(request.required).map(|index| {
        let tier = if request.optimal.is_empty() {
            MemoryTier::Optimal
        } else {
            MemoryTier::Required
        };
        (index, tier)
    })
}

/// A bound device allocation
#[derive(Debug)]
pub struct DeviceAllocation {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub properties: vk::MemoryPropertyFlags,
    pub tier: MemoryTier,
}

impl DeviceAllocation {
    /// Allocate memory matching `requirements` and `request`
    pub fn allocate(
        device: &VulkanDevice,
        requirements: vk::MemoryRequirements,
        request: MemoryRequest,
    ) -> Result<Self, ResourceError> {
        let (memory_type_index, tier) = select_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            request,
        )
        .ok_or(ResourceError::NoMemoryType {
            required: request.required,
        })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None)? };

        if tier == MemoryTier::Required {
            log::debug!(
                "Memory fell back to required tier {:?} (wanted {:?})",
                request.required,
                request.optimal
            );
        }

        Ok(Self {
            memory,
            size: requirements.size,
            properties: device.memory_properties.memory_types[memory_type_index as usize]
                .property_flags,
            tier,
        })
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn free(&self, device: &ash::Device) {
        unsafe { device.free_memory(self.memory, None) };
    }
}

/// Expand `[offset, offset+size)` to atom boundaries, clamped to `capacity`
pub fn atom_aligned_range(
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
    capacity: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = offset - offset % atom;
    let end = (offset + size).div_ceil(atom) * atom;
    let end = end.min(capacity);
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn optimal_tier_is_tried_first() {
        let props = properties(&[LOCAL, HOST, HOST | COHERENT | LOCAL]);
        let request = MemoryRequest::new(HOST, COHERENT | LOCAL);

        assert_eq!(
            select_memory_type(&props, 0b111, request),
            Some((2, MemoryTier::Optimal))
        );
    }

    #[test]
    fn falls_back_to_required_tier() {
        let props = properties(&[LOCAL, HOST]);
        let request = MemoryRequest::new(HOST, COHERENT | LOCAL);

        assert_eq!(
            select_memory_type(&props, 0b11, request),
            Some((1, MemoryTier::Required))
        );
    }

    #[test]
    fn type_bits_filter_candidates() {
        let props = properties(&[HOST | COHERENT, HOST | COHERENT]);
        let request = MemoryRequest::new(HOST, COHERENT);

        assert_eq!(
            select_memory_type(&props, 0b10, request),
            Some((1, MemoryTier::Optimal))
        );
        assert_eq!(select_memory_type(&props, 0, request), None);
    }

    #[test]
    fn nothing_matches_required() {
        let props = properties(&[HOST | COHERENT]);
        assert_eq!(
            select_memory_type(&props, 0b1, MemoryRequest::device_local()),
            None
        );
    }

    #[test]
    fn flush_ranges_snap_to_atoms() {
        assert_eq!(atom_aligned_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(atom_aligned_range(0, 64, 64, 1024), (0, 64));
        // Never past the end of the allocation
        assert_eq!(atom_aligned_range(1000, 20, 64, 1020), (960, 60));
    }
}
