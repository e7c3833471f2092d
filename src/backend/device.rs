// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (deterministic scoring)
// - Logical device + graphics/compute/transfer queues
// - Per-thread command pools and one-shot command buffers

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::command::{CommandPoolRegistry, ThreadCommandPools};
use super::surface::{self, PresentSurface, SurfaceTarget};

/// The role a queue plays. Several roles may share one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Transfer,
    Compute,
    Graphics,
}

impl QueueType {
    /// Fixed submission order used when flushing batches
    pub const ALL: [QueueType; 3] = [QueueType::Transfer, QueueType::Compute, QueueType::Graphics];
}

/// Queue family chosen for each role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Pick families for every role.
    ///
    /// Graphics must also present when `supports_present` says so. Compute and
    /// transfer prefer dedicated families and fall back to graphics.
    pub fn select<P>(families: &[vk::QueueFamilyProperties], supports_present: P) -> Option<Self>
    where
        P: Fn(u32) -> bool,
    {
        let has = |props: &vk::QueueFamilyProperties, flags| {
            props.queue_count > 0 && props.queue_flags.contains(flags)
        };

        let graphics = families
            .iter()
            .enumerate()
            .find(|&(i, props)| has(props, vk::QueueFlags::GRAPHICS) && supports_present(i as u32))
            .map(|(i, _)| i as u32)?;

        let compute = families
            .iter()
            .enumerate()
            .find(|(_, props)| {
                has(props, vk::QueueFlags::COMPUTE)
                    && !props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32)
            .unwrap_or(graphics);

        // Copy engines first, then any non-graphics family that can transfer
        let transfer = families
            .iter()
            .enumerate()
            .find(|(_, props)| {
                has(props, vk::QueueFlags::TRANSFER)
                    && !props
                        .queue_flags
                        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .or_else(|| {
                families.iter().enumerate().find(|(_, props)| {
                    has(props, vk::QueueFlags::TRANSFER)
                        && !props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                })
            })
            .map(|(i, _)| i as u32)
            .unwrap_or(graphics);

        Some(Self {
            graphics,
            compute,
            transfer,
        })
    }

    pub fn family(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }

    /// Distinct families, graphics first
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = vec![self.graphics];
        for family in [self.compute, self.transfer] {
            if !unique.contains(&family) {
                unique.push(family);
            }
        }
        unique
    }
}

/// Features a device must have to be considered at all
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
}

impl RequiredFeatures {
    fn satisfied_by(&self, features: &vk::PhysicalDeviceFeatures) -> bool {
        (!self.sampler_anisotropy || features.sampler_anisotropy == vk::TRUE)
            && (!self.fill_mode_non_solid || features.fill_mode_non_solid == vk::TRUE)
    }
}

/// What we learned about one physical device while choosing
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: Option<QueueFamilies>,
}

impl PhysicalDeviceInfo {
    /// Deterministic suitability score, `None` if the device is unusable
    pub fn score(&self, required: &RequiredFeatures) -> Option<u32> {
        self.queue_families?;

        if !required.satisfied_by(&self.features) {
            return None;
        }

        let mut score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1,
        };
        score += self.max_image_dimension_2d / 256;
        if self.features.sampler_anisotropy == vk::TRUE {
            score += 50;
        }
        if self.features.fill_mode_non_solid == vk::TRUE {
            score += 25;
        }

        Some(score)
    }
}

/// Index of the best candidate; ties keep the first one enumerated
pub fn select_best_device(
    candidates: &[PhysicalDeviceInfo],
    required: &RequiredFeatures,
) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(score) = candidate.score(required) else {
            log::debug!("Rejected GPU {}", candidate.name);
            continue;
        };
        log::debug!("GPU {} scored {}", candidate.name, score);

        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }

    best.map(|(index, _)| index)
}

/// Device creation parameters
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub app_name: String,
    pub app_version: u32,
    pub enable_validation: bool,
    pub required_features: RequiredFeatures,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            app_name: "Frame Core".to_string(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            enable_validation: false,
            required_features: RequiredFeatures::default(),
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles, indexed by role
    pub queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,

    /// Present target, absent for headless devices
    pub surface: Option<PresentSurface>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    command_pools: CommandPoolRegistry,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub enabled_features: vk::PhysicalDeviceFeatures,
}

impl VulkanDevice {
    /// Create the device, optionally able to present to `target`
    pub fn new(desc: &DeviceDesc, target: Option<&SurfaceTarget>) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, desc, target)?;

        let debug_utils = if desc.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = target
            .map(|target| PresentSurface::new(&entry, &instance, target))
            .transpose()?;

        let info = Self::select_physical_device(&instance, surface.as_ref(), desc)?;
        let queue_families = info
            .queue_families
            .context("Selected GPU has no usable queue families")?;

        let enabled_features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: info.features.sampler_anisotropy,
            fill_mode_non_solid: info.features.fill_mode_non_solid,
            ..Default::default()
        };

        let device = Self::create_logical_device(
            &instance,
            info.handle,
            &queue_families,
            &enabled_features,
            surface.is_some(),
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let compute_queue = unsafe { device.get_device_queue(queue_families.compute, 0) };
        let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };

        let properties = unsafe { instance.get_physical_device_properties(info.handle) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(info.handle) };

        log::info!("Selected GPU: {}", info.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} compute={} transfer={}",
            queue_families.graphics,
            queue_families.compute,
            queue_families.transfer
        );

        Ok(Arc::new(Self {
            device,
            physical_device: info.handle,
            instance,
            entry,
            queue_families,
            graphics_queue,
            compute_queue,
            transfer_queue,
            surface,
            debug_utils,
            command_pools: CommandPoolRegistry::new(),
            properties,
            memory_properties,
            enabled_features,
        }))
    }

    fn create_instance(
        entry: &Entry,
        desc: &DeviceDesc,
        target: Option<&SurfaceTarget>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(desc.app_name.as_str())?;
        let engine_name = CString::new("Frame Core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(desc.app_version)
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = match target {
            Some(target) => surface::required_extensions(target.display)?,
            None => Vec::new(),
        };
        if desc.enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if desc.enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: Option<&PresentSurface>,
        desc: &DeviceDesc,
    ) -> Result<PhysicalDeviceInfo> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates: Vec<PhysicalDeviceInfo> = devices
            .into_iter()
            .map(|device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                let features = unsafe { instance.get_physical_device_features(device) };
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                let queue_families = QueueFamilies::select(&families, |family| {
                    surface.map_or(true, |surface| surface.supports(device, family))
                });

                PhysicalDeviceInfo {
                    handle: device,
                    name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned(),
                    device_type: props.device_type,
                    max_image_dimension_2d: props.limits.max_image_dimension2_d,
                    features,
                    queue_families,
                }
            })
            .collect();

        let best = select_best_device(&candidates, &desc.required_features)
            .context("No suitable GPU found")?;

        Ok(candidates[best].clone())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilies,
        features: &vk::PhysicalDeviceFeatures,
        presentable: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presentable {
            vec![ash::extensions::khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Queue handle for a role
    pub fn queue(&self, queue: QueueType) -> vk::Queue {
        match queue {
            QueueType::Graphics => self.graphics_queue,
            QueueType::Compute => self.compute_queue,
            QueueType::Transfer => self.transfer_queue,
        }
    }

    pub fn queue_family(&self, queue: QueueType) -> u32 {
        self.queue_families.family(queue)
    }

    /// Command pools of the calling thread, created on first use
    pub fn acquire_command_pool(&self) -> Result<ThreadCommandPools> {
        self.command_pools
            .acquire(&self.device, &self.queue_families.unique())
    }

    /// Allocate a primary command buffer, optionally already recording
    pub fn allocate_command_buffer(&self, begin: bool, queue: QueueType) -> Result<vk::CommandBuffer> {
        let pool = self.command_pool_for(queue)?;
        let cmd = self.allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)?[0];

        if begin {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let begun = unsafe { self.device.begin_command_buffer(cmd, &begin_info) };
            begun.context("Failed to begin command buffer")?;
        }

        Ok(cmd)
    }

    /// Allocate `count` buffers of `level` from an explicit pool
    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) };
        buffers.context("Failed to allocate command buffers")
    }

    /// The calling thread's pool for the family serving `queue`
    pub fn command_pool_for(&self, queue: QueueType) -> Result<vk::CommandPool> {
        let family = self.queue_family(queue);
        self.acquire_command_pool()?
            .pool(family)
            .with_context(|| format!("No command pool for queue family {}", family))
    }

    /// End, submit and wait for a one-shot buffer, then free it.
    ///
    /// Waits on a private fence rather than the whole queue so unrelated work
    /// on the same queue keeps flowing.
    pub fn flush_command_buffer(&self, cmd: vk::CommandBuffer, queue: QueueType) -> Result<()> {
        let pool = self.command_pool_for(queue)?;

        let result = (|| -> Result<()> {
            unsafe {
                self.device
                    .end_command_buffer(cmd)
                    .context("Failed to end command buffer")?;

                let fence = self
                    .device
                    .create_fence(&vk::FenceCreateInfo::builder(), None)
                    .context("Failed to create flush fence")?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

                let submitted = self
                    .device
                    .queue_submit(self.queue(queue), &[submit_info.build()], fence)
                    .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX));

                self.device.destroy_fence(fence, None);
                submitted.context("Failed to flush command buffer")?;
            }
            Ok(())
        })();

        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
        result
    }

    /// Record a one-shot buffer, submit it, and block until the queue is idle.
    ///
    /// Setup-time uploads only; idling the queue serializes everything on it.
    pub fn immediate_submit<F>(&self, queue: QueueType, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let pool = self.command_pool_for(queue)?;
        let cmd = self.allocate_command_buffer(true, queue)?;

        let result = (|| -> Result<()> {
            record(&self.device, cmd)?;

            unsafe {
                self.device
                    .end_command_buffer(cmd)
                    .context("Failed to end command buffer")?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.queue(queue), &[submit_info.build()], vk::Fence::null())
                    .context("Failed to submit immediate work")?;
                self.device
                    .queue_wait_idle(self.queue(queue))
                    .context("Failed waiting for queue idle")?;
            }
            Ok(())
        })();

        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
        result
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    /// Alignment for flushing/invalidating non-coherent mapped ranges
    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size.max(1)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        self.command_pools.destroy_all(&self.device);

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::from_raw(1),
            name: name.to_string(),
            device_type,
            max_image_dimension_2d: 16384,
            features: vk::PhysicalDeviceFeatures::default(),
            queue_families: Some(QueueFamilies {
                graphics: 0,
                compute: 0,
                transfer: 0,
            }),
        }
    }

    #[test]
    fn single_family_serves_every_role() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();

        assert_eq!(selected.graphics, 0);
        assert_eq!(selected.compute, 0);
        assert_eq!(selected.transfer, 0);
        assert_eq!(selected.unique(), vec![0]);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();

        assert_eq!(selected.compute, 1);
        assert_eq!(selected.transfer, 2);
        assert_eq!(selected.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn async_compute_family_doubles_as_transfer() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();

        assert_eq!(selected.transfer, 1);
        assert_eq!(selected.unique(), vec![0, 1]);
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::GRAPHICS)];
        let selected = QueueFamilies::select(&families, |i| i == 1).unwrap();
        assert_eq!(selected.graphics, 1);

        assert!(QueueFamilies::select(&families, |_| false).is_none());
        assert!(QueueFamilies::select(&[family(vk::QueueFlags::TRANSFER)], |_| true).is_none());
    }

    #[test]
    fn discrete_gpu_wins() {
        let candidates = [
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("cpu", vk::PhysicalDeviceType::CPU),
        ];
        let best = select_best_device(&candidates, &RequiredFeatures::default());
        assert_eq!(best, Some(1));
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let candidates = [
            candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_best_device(&candidates, &RequiredFeatures::default()), Some(0));
    }

    #[test]
    fn feature_bits_add_to_score() {
        let plain = candidate("plain", vk::PhysicalDeviceType::INTEGRATED_GPU);
        let mut featured = plain.clone();
        featured.features.sampler_anisotropy = vk::TRUE;

        let required = RequiredFeatures::default();
        assert_eq!(
            featured.score(&required).unwrap(),
            plain.score(&required).unwrap() + 50
        );
    }

    #[test]
    fn missing_requirements_reject_device() {
        let mut no_queues = candidate("headless", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_queues.queue_families = None;
        assert_eq!(no_queues.score(&RequiredFeatures::default()), None);

        let required = RequiredFeatures {
            sampler_anisotropy: true,
            ..Default::default()
        };
        let without = candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(select_best_device(&[without], &required), None);
    }
}
