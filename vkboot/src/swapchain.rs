//! Swapchain negotiation, creation, and per-image view management.
//!
//! [`Swapchain::new`] negotiates within whatever the surface reports: the
//! preferred format when the surface offers it, mailbox presentation with
//! FIFO as the fallback, one image above the reported minimum, and the
//! surface's own extent unless the platform leaves the choice open. One 2D
//! color view per image is created up front and destroyed before the chain
//! on drop.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use thiserror::Error;

use crate::device::Device;
use crate::surface::{Surface, SurfaceError};

/// What format negotiation falls back to when the caller states no
/// preference: 8-bit RGBA in nonlinear sRGB.
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Debug, Error)]
pub enum SwapchainCreationError {
    #[error(
        "Device, surface, and any old swapchain handed to Swapchain::new \
         or new_with_old must share one instance"
    )]
    MismatchedParams,

    #[error("The surface reports no supported formats")]
    NoSurfaceFormats,

    #[error("The surface reports no supported present modes")]
    NoPresentModes,

    #[error("Requested swapchain extent {width}x{height} has a zero axis")]
    InvalidExtent { width: u32, height: u32 },

    #[error("The device was opened without VK_KHR_swapchain")]
    SwapchainNotEnabled,

    #[error("Failed to query surface support: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Vulkan error creating the swapchain: {0}")]
    Create(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    GetImages(vk::Result),

    #[error("Vulkan error creating a swapchain image view: {0}")]
    ImageView(vk::Result),
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred_format: Option<vk::SurfaceFormatKHR>,
) -> vk::SurfaceFormatKHR {
    let preferred = preferred_format.unwrap_or(DEFAULT_SURFACE_FORMAT);
    // Only an exact (format, color space) pair counts as a match; a format
    // hit in the wrong color space would silently change what sRGB
    // encoding the display applies.
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == preferred.format
                && f.color_space == preferred.color_space
        })
        .unwrap_or(formats[0])
}

fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    // Mailbox gives low latency without tearing; FIFO is the one mode
    // Vulkan guarantees everywhere.
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    // A current_extent of u32::MAX means the platform leaves the size to
    // the swapchain; anything else is the one size it will accept.
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: desired_extent.width.clamp(min.width, max.width),
        height: desired_extent.height.clamp(min.height, max.height),
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    // One above the minimum keeps acquisition from stalling on the driver.
    // A reported max of zero means unbounded.
    let count = capabilities.min_image_count.saturating_add(1);
    match capabilities.max_image_count {
        0 => count,
        max => count.min(max),
    }
}

/// Decides how swapchain images are shared between the graphics and
/// present queues.
///
/// A single family gets exclusive mode with no explicit index list; split
/// families get concurrent mode naming both, trading a bit of throughput
/// for not having to express ownership transfers.
fn select_sharing_mode(
    graphics_family: u32,
    present_family: u32,
) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![graphics_family, present_family],
        )
    }
}

/// Builds one plain 2D color view per swapchain image.
///
/// All or nothing: if any view fails, every view created before it goes
/// back through `destroy_view` in creation order before the error returns,
/// so callers never see a partial set.
fn create_image_views<FCreate, FDestroy>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_view: FCreate,
    mut destroy_view: FDestroy,
) -> Result<Vec<vk::ImageView>, SwapchainCreationError>
where
    FCreate: FnMut(
        &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>,
    FDestroy: FnMut(vk::ImageView),
{
    let mut views: Vec<vk::ImageView> = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        match create_view(&create_info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for earlier in views.drain(..) {
                    destroy_view(earlier);
                }
                return Err(SwapchainCreationError::ImageView(e));
            }
        }
    }

    Ok(views)
}

/// A presentation chain and the 2D color views over its images.
///
/// Keeps its [`Device`] and [`Surface`] alive through `Arc`s; drop order
/// inside is views first, then the chain, with the parents outliving both.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle> {
    device: Arc<Device>,
    _surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.surface_format.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Swapchain<T> {
    /// Creates a swapchain with no previous chain to hand to the driver.
    ///
    /// For resize and recreation paths prefer
    /// [`new_with_old`](Self::new_with_old) so the driver can reuse
    /// resources.
    ///
    /// `preferred_format` is a hint: when the surface supports the exact
    /// (format, color space) pair it wins, otherwise selection falls back
    /// to [`DEFAULT_SURFACE_FORMAT`] and then to the first format the
    /// surface reports.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
        preferred_format: Option<vk::SurfaceFormatKHR>,
    ) -> Result<Self, SwapchainCreationError> {
        Self::new_with_old(device, surface, desired_extent, None, preferred_format)
    }

    /// Creates a swapchain, handing `old_swapchain` to the driver for
    /// resource reuse when one is given.
    ///
    /// `old_swapchain` must have been created from the same `device` and
    /// `surface`. The caller is responsible for GPU synchronization: the
    /// old chain has to be safe to retire within the application's frame
    /// lifecycle.
    ///
    /// Negotiation picks the preferred surface format when advertised (see
    /// [`new`](Self::new)), mailbox presentation with FIFO as the
    /// fallback, an image count one above the reported minimum clamped to
    /// the maximum, and the surface's current extent unless the platform
    /// leaves it open, in which case `desired_extent` is clamped per axis.
    /// One 2D color view per image exists before this returns.
    pub fn new_with_old(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
        old_swapchain: Option<&Self>,
        preferred_format: Option<vk::SurfaceFormatKHR>,
    ) -> Result<Self, SwapchainCreationError> {
        if !device.has_swapchain_support() {
            return Err(SwapchainCreationError::SwapchainNotEnabled);
        }

        if desired_extent.width == 0 || desired_extent.height == 0 {
            return Err(SwapchainCreationError::InvalidExtent {
                width: desired_extent.width,
                height: desired_extent.height,
            });
        }

        if !Arc::ptr_eq(surface.instance(), device.instance()) {
            return Err(SwapchainCreationError::MismatchedParams);
        }

        if let Some(old) = old_swapchain {
            let same_device = Arc::ptr_eq(&old.device, device);
            let same_surface = Arc::ptr_eq(&old._surface, surface);
            if !same_device || !same_surface {
                return Err(SwapchainCreationError::MismatchedParams);
            }
        }

        let physical_device = device.physical_device();

        //SAFETY: physical_device belongs to device's instance and surface
        //shares it (validated above)
        let support = unsafe { surface.support_details(physical_device) }?;

        if support.formats.is_empty() {
            return Err(SwapchainCreationError::NoSurfaceFormats);
        }
        if support.present_modes.is_empty() {
            return Err(SwapchainCreationError::NoPresentModes);
        }

        let surface_format =
            choose_surface_format(&support.formats, preferred_format);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, desired_extent);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing_mode, sharing_families) = select_sharing_mode(
            device.graphics_queue_family(),
            device.present_queue_family(),
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&sharing_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(
                old_swapchain.map_or(vk::SwapchainKHR::null(), |old| old.handle),
            );

        //SAFETY: the create info references the surface and values
        //negotiated from its own support details
        let handle = unsafe { device.create_raw_swapchain(&create_info) }?;

        //SAFETY: handle was just created from this device
        let images = match unsafe { device.raw_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                //SAFETY: handle was created above and nothing else
                //references it yet
                unsafe { device.destroy_raw_swapchain(handle) };
                return Err(e);
            }
        };

        let image_views = match create_image_views(
            &images,
            surface_format.format,
            //SAFETY: each create info references a live swapchain image
            //from this device with a plain 2D color subresource range
            |info| unsafe { device.create_raw_image_view(info) },
            //SAFETY: only views created just above are handed back here
            |view| unsafe { device.destroy_raw_image_view(view) },
        ) {
            Ok(views) => views,
            Err(e) => {
                //SAFETY: the views are already gone, the chain goes last
                unsafe { device.destroy_raw_swapchain(handle) };
                return Err(e);
            }
        };

        tracing::info!(
            "Created swapchain {:?}: {:?} / {:?}, {}x{}, {} images, {:?} \
             present, {:?} sharing",
            handle,
            surface_format.format,
            surface_format.color_space,
            extent.width,
            extent.height,
            images.len(),
            present_mode,
            sharing_mode,
        );

        Ok(Self {
            device: Arc::clone(device),
            _surface: Arc::clone(surface),
            handle,
            surface_format,
            extent,
            images,
            image_views,
        })
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    /// The negotiated format and color space pair.
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // The caller must have synchronized the GPU (fences or device
        // idle) before this drop; no in-flight work may reference the
        // views or the chain.
        for view in self.image_views.drain(..) {
            //SAFETY: the view came from this device and views go before
            //the chain
            unsafe { self.device.destroy_raw_image_view(view) };
        }
        //SAFETY: the chain came from this device and its views are gone
        unsafe { self.device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn choose_surface_format_takes_exact_preferred_pair() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let chosen = choose_surface_format(&formats, Some(formats[1]));
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn choose_surface_format_needs_matching_color_space() {
        // Same pixel format, wrong color space: not a match, so the first
        // entry wins.
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };

        let chosen = choose_surface_format(&formats, Some(preferred));
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn choose_surface_format_defaults_to_rgba_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            DEFAULT_SURFACE_FORMAT,
        ];

        let chosen = choose_surface_format(&formats, None);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn choose_surface_format_falls_back_to_first_entry() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let chosen = choose_surface_format(&formats, None);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn choose_present_mode_prefers_mailbox() {
        let chosen = choose_present_mode(&[
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
        ]);
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn choose_present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn choose_extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );

        assert_eq!(chosen.width, 800);
        assert_eq!(chosen.height, 600);
    }

    #[test]
    fn choose_extent_clamps_each_axis_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 3000,
                height: 50,
            },
        );

        assert_eq!(chosen.width, 2000);
        assert_eq!(chosen.height, 100);
    }

    #[test]
    fn choose_image_count_requests_one_above_minimum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn choose_image_count_respects_max_when_set() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn choose_image_count_unbounded_when_max_is_zero() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn select_sharing_mode_exclusive_for_shared_family() {
        let (mode, families) = select_sharing_mode(1, 1);
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(families.is_empty());
    }

    #[test]
    fn select_sharing_mode_concurrent_for_split_families() {
        let (mode, families) = select_sharing_mode(0, 2);
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, vec![0, 2]);
    }

    #[test]
    fn image_view_helper_cleans_up_on_partial_failure() {
        let images = [
            vk::Image::from_raw(1),
            vk::Image::from_raw(2),
            vk::Image::from_raw(3),
            vk::Image::from_raw(4),
        ];
        let created_views =
            [vk::ImageView::from_raw(10), vk::ImageView::from_raw(11)];
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::ImageView>::new());

        let result = create_image_views(
            &images,
            vk::Format::R8G8B8A8_SRGB,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 | 1 => Ok(created_views[*call]),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |view| destroyed.borrow_mut().push(view),
        );

        assert!(matches!(
            result,
            Err(SwapchainCreationError::ImageView(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        ));
        // Both views that were created before the failure are released,
        // in creation order.
        assert_eq!(destroyed.borrow().as_slice(), &created_views);
    }

    #[test]
    fn image_view_helper_returns_all_views_on_success() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let views =
            [vk::ImageView::from_raw(100), vk::ImageView::from_raw(101)];
        let create_calls = RefCell::new(0usize);

        let result = create_image_views(
            &images,
            vk::Format::R8G8B8A8_SRGB,
            |_| {
                let mut call = create_calls.borrow_mut();
                let view = views[*call];
                *call += 1;
                Ok(view)
            },
            |_view| panic!("destroy callback should not be called on success"),
        )
        .expect("helper should succeed");

        assert_eq!(result, views);
    }
}
