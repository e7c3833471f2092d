// Presentation surface - the "window" end of the swapchain
//
// The application hands us raw display/window handles; ash-window turns them
// into a VkSurfaceKHR for whatever platform they come from.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{
    HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use std::ffi::c_char;

/// Opaque platform target: native connection + window handle.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

impl SurfaceTarget {
    /// Capture the raw handles of a window.
    ///
    /// The window must outlive the renderer built from this target.
    pub fn from_window<W: HasRawWindowHandle + HasRawDisplayHandle>(window: &W) -> Self {
        Self {
            display: window.raw_display_handle(),
            window: window.raw_window_handle(),
        }
    }
}

/// Instance extensions needed to present on this display
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let extensions = ash_window::enumerate_required_extensions(display)
        .with_context(|| format!("No Vulkan surface support for {:?}", display))?;
    Ok(extensions.to_vec())
}

/// Surface plus the loader needed to query and destroy it
pub struct PresentSurface {
    pub loader: ash::extensions::khr::Surface,
    pub surface: vk::SurfaceKHR,
}

impl PresentSurface {
    pub fn new(entry: &Entry, instance: &ash::Instance, target: &SurfaceTarget) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(entry, instance, target.display, target.window, None)
        };
        let surface = surface.context("Failed to create window surface")?;
        let loader = ash::extensions::khr::Surface::new(entry, instance);
        Ok(Self { loader, surface })
    }

    /// Whether `queue_family` on `physical_device` can present to this surface
    pub fn supports(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
                .unwrap_or(false)
        }
    }

    pub fn destroy(&self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{AppKitDisplayHandle, XlibDisplayHandle};
    use std::ffi::CStr;

    fn names(display: RawDisplayHandle) -> Vec<String> {
        required_extensions(display)
            .unwrap()
            .into_iter()
            .map(|name| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn xlib_needs_surface_and_xlib_surface() {
        let names = names(RawDisplayHandle::Xlib(XlibDisplayHandle::empty()));
        assert!(names.contains(&"VK_KHR_surface".to_string()));
        assert!(names.contains(&"VK_KHR_xlib_surface".to_string()));
    }

    #[test]
    fn appkit_displays_are_supported() {
        let names = names(RawDisplayHandle::AppKit(AppKitDisplayHandle::empty()));
        assert!(names.contains(&"VK_KHR_surface".to_string()));
        assert!(names.contains(&"VK_EXT_metal_surface".to_string()));
    }
}
