//! Window-system surface wrapper tying a `VkSurfaceKHR` to the window it
//! was created from.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("The surface source produced no display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("The surface source produced no window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan refused to create the surface: {0}")]
    Vulkan(vk::Result),
    #[error(
        "Parent instance was created without the platform surface extensions"
    )]
    MissingExtension,
}

/// Failure while asking a physical device about an existing surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Parent instance has no surface extension loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error while querying the surface: {0}")]
    Vulkan(vk::Result),
}

/// Everything one physical device reports about presenting to one surface.
///
/// Device selection only cares whether this [`is_adequate`](Self::is_adequate);
/// swapchain negotiation picks through the individual lists.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupportDetails {
    /// True when the device reports at least one format and one present
    /// mode, the minimum a swapchain can be negotiated from.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// A presentable surface plus the window it came from.
///
/// The source window stays referenced for as long as the surface exists, so
/// the platform handles behind the `VkSurfaceKHR` cannot dangle.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle> {
    instance: Arc<Instance>,
    handle: vk::SurfaceKHR,
    _source: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Surface<T> {
    /// Creates a surface for `source` and keeps `source` alive until drop.
    ///
    /// # Safety
    /// The surface must be destroyed before the windowing system invalidates
    /// it, e.g. dropped when winit suspends the application. No in-flight
    /// GPU work may still reference objects derived from it at destruction
    /// time.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        //SAFETY: the returned wrapper holds the instance and source alive
        //for as long as the raw handle exists
        let handle = unsafe { instance.create_raw_surface(&source) }?;

        Ok(Self {
            instance: Arc::clone(instance),
            handle,
            _source: source,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Asks whether `queue_family_index` on `physical_device` can present
    /// to this surface.
    ///
    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn queue_family_can_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceError> {
        //SAFETY: caller guarantees the device and surface share an instance
        unsafe {
            self.instance.raw_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceError> {
        //SAFETY: caller guarantees the device and surface share an instance
        unsafe {
            self.instance
                .raw_surface_capabilities(physical_device, self.handle)
        }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceError> {
        //SAFETY: caller guarantees the device and surface share an instance
        unsafe {
            self.instance
                .raw_surface_formats(physical_device, self.handle)
        }
    }

    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceError> {
        //SAFETY: caller guarantees the device and surface share an instance
        unsafe {
            self.instance
                .raw_surface_present_modes(physical_device, self.handle)
        }
    }

    /// Capabilities, formats, and present modes in one round trip.
    ///
    /// # Safety
    /// `physical_device` must come from the same instance as this surface.
    pub unsafe fn support_details(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SurfaceSupportDetails, SurfaceError> {
        //SAFETY: provenance guaranteed by the caller for all three queries
        let (capabilities, formats, present_modes) = unsafe {
            (
                self.capabilities(physical_device)?,
                self.formats(physical_device)?,
                self.present_modes(physical_device)?,
            )
        };

        Ok(SurfaceSupportDetails {
            capabilities,
            formats,
            present_modes,
        })
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        //SAFETY: dropping the wrapper means every object derived from the
        //surface is already gone and no GPU work references it
        if let Err(e) = unsafe { self.instance.destroy_raw_surface(self.handle) }
        {
            tracing::error!(
                "Error while dropping surface {:?}: {e}",
                self.handle
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_format() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn adequate_needs_both_formats_and_present_modes() {
        let details = SurfaceSupportDetails {
            formats: vec![some_format()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(details.is_adequate());
    }

    #[test]
    fn formats_alone_are_not_adequate() {
        let details = SurfaceSupportDetails {
            formats: vec![some_format()],
            ..Default::default()
        };
        assert!(!details.is_adequate());
    }

    #[test]
    fn present_modes_alone_are_not_adequate() {
        let details = SurfaceSupportDetails {
            present_modes: vec![vk::PresentModeKHR::MAILBOX],
            ..Default::default()
        };
        assert!(!details.is_adequate());
    }
}
