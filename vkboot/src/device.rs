//! Physical device selection and logical device creation.
//!
//! [`Device::create_for_surface`] walks physical devices in the order the
//! backend enumerates them and opens the first one that can drive the given
//! surface: a graphics queue family, a present-capable queue family, every
//! extension in [`DeviceConfig::required_extensions`], and at least one
//! surface format and present mode. There is no scoring; enumeration order
//! decides ties.

use std::ffi::{CStr, CString, c_char};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{EnumerateDevicesError, Instance},
    surface::{Surface, SurfaceError},
    swapchain::SwapchainCreationError,
};

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(
        "The surface handed to Device::create_for_surface comes from a \
         different instance"
    )]
    MismatchedParams,

    #[error("Could not enumerate physical devices: {0}")]
    Enumeration(#[from] EnumerateDevicesError),

    #[error("No physical device can drive this surface")]
    NoSuitableDevice,

    #[error("Failed to create the logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("Surface query failed while probing devices: {0}")]
    Surface(#[from] SurfaceError),
}

/// Queue family indices for the two roles this library binds.
///
/// `graphics` and `present` may name the same family; both layouts are
/// first-class. See [`is_complete`](Self::is_complete).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Both roles have been matched to a family.
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }
}

/// Walks `queue_family_props` in index order and records which family
/// serves each role, stopping as soon as both are filled.
///
/// Later families overwrite earlier ones until the walk stops, which tends
/// to settle on a single family serving both roles when one exists.
fn find_queue_families(
    queue_family_props: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> Result<bool, SurfaceError>,
) -> Result<QueueFamilyIndices, SurfaceError> {
    let mut indices = QueueFamilyIndices::default();
    for (index, props) in queue_family_props.iter().enumerate() {
        if indices.is_complete() {
            break;
        }
        let index = index as u32;
        if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }
        if supports_present(index)? {
            indices.present = Some(index);
        }
    }
    Ok(indices)
}

/// The distinct queue families among the two roles, graphics first.
///
/// Each entry gets exactly one `VkDeviceQueueCreateInfo`; listing a family
/// twice would be invalid API usage.
fn unique_queue_families(graphics: u32, present: u32) -> Vec<u32> {
    if graphics == present {
        vec![graphics]
    } else {
        vec![graphics, present]
    }
}

fn extension_names(properties: &[vk::ExtensionProperties]) -> Vec<CString> {
    properties
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .map(CString::from)
        .collect()
}

/// Extensions from `required` that are absent from `available`, in the
/// order `required` lists them.
fn missing_extensions(
    required: &[&CStr],
    available: &[CString],
) -> Vec<CString> {
    required
        .iter()
        .filter(|required_ext| {
            !available
                .iter()
                .any(|avail| avail.as_c_str() == **required_ext)
        })
        .map(|ext| CString::from(*ext))
        .collect()
}

/// Everything probed about one physical device that the suitability
/// decision consumes.
#[derive(Debug)]
struct CandidateProfile {
    queue_families: QueueFamilyIndices,
    missing_extensions: Vec<CString>,
    format_count: usize,
    present_mode_count: usize,
}

impl CandidateProfile {
    fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.missing_extensions.is_empty()
            && self.format_count > 0
            && self.present_mode_count > 0
    }
}

/// Index of the first suitable profile, in enumeration order.
fn select_first_suitable(profiles: &[CandidateProfile]) -> Option<usize> {
    profiles.iter().position(CandidateProfile::is_suitable)
}

/// Probes one physical device for everything the suitability rule needs,
/// logging what it finds.
///
/// # Safety
/// `physical_device` must have been enumerated from `instance`, and `surf`
/// must be derived from the same instance.
unsafe fn probe_candidate<T: HasDisplayHandle + HasWindowHandle>(
    instance: &Instance,
    surf: &Surface<T>,
    physical_device: vk::PhysicalDevice,
    required_extensions: &[&CStr],
) -> Result<CandidateProfile, SurfaceError> {
    //SAFETY: physical_device comes from instance per the caller
    let props =
        unsafe { instance.raw_physical_device_properties(physical_device) };
    //SAFETY: as above
    let family_props =
        unsafe { instance.raw_queue_family_properties(physical_device) };

    let queue_families = find_queue_families(&family_props, |family| {
        //SAFETY: surf shares the instance per the caller
        unsafe { surf.queue_family_can_present(physical_device, family) }
    })?;

    //SAFETY: physical_device comes from instance per the caller
    let host_exts =
        unsafe { instance.raw_device_extension_properties(physical_device) }
            .unwrap_or_default();
    let missing =
        missing_extensions(required_extensions, &extension_names(&host_exts));

    // Format and present mode lists only matter once the extension check
    // has passed; without the swapchain extension they could not be
    // consumed anyway.
    let (format_count, present_mode_count) = if missing.is_empty() {
        //SAFETY: surf shares the instance per the caller
        let support = unsafe { surf.support_details(physical_device) }?;
        (support.formats.len(), support.present_modes.len())
    } else {
        (0, 0)
    };

    let profile = CandidateProfile {
        queue_families,
        missing_extensions: missing,
        format_count,
        present_mode_count,
    };
    tracing::debug!(
        "Candidate {:?}: queue families {:?}, missing extensions {:?}, {} \
         formats, {} present modes",
        props.device_name_as_c_str().unwrap_or(c"unknown"),
        profile.queue_families,
        profile.missing_extensions,
        profile.format_count,
        profile.present_mode_count,
    );
    Ok(profile)
}

/// Extensions the logical device is created with.
///
/// The default requests `VK_KHR_swapchain`, which is also what gates the
/// swapchain entry points on [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub required_extensions: Vec<&'static CStr>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            required_extensions: vec![ash::khr::swapchain::NAME],
        }
    }
}

/// A queue handle bound to a role, with the family it was opened from.
#[derive(Debug, Clone, Copy)]
struct RoleQueue {
    handle: vk::Queue,
    family: u32,
}

pub struct Device {
    instance: Arc<Instance>,
    handle: ash::Device,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    graphics: RoleQueue,
    present: RoleQueue,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Opens a logical device on the first physical device that can render
    /// to `surf`.
    ///
    /// Suitability requires a graphics-capable queue family, a queue family
    /// that can present to `surf` (not necessarily the same one), every
    /// extension in `config.required_extensions`, and a non-empty set of
    /// surface formats and present modes. One queue at priority 1.0 is
    /// opened per distinct family and the role handles are fetched by
    /// family index, so unified and split queue layouts come out the same
    /// way.
    pub fn create_for_surface<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surf: &Surface<T>,
        config: &DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        if !Arc::ptr_eq(surf.instance(), instance) {
            return Err(CreateDeviceError::MismatchedParams);
        }

        let physical_devices = instance.enumerate_raw_physical_devices()?;

        // Probe every candidate up front; profiles stay in enumeration
        // order so the first-match rule below is deterministic.
        let mut profiles = Vec::with_capacity(physical_devices.len());
        for &physical_device in &physical_devices {
            //SAFETY: physical_device was enumerated from instance and
            //surf shares it (validated above)
            let profile = unsafe {
                probe_candidate(
                    instance,
                    surf,
                    physical_device,
                    &config.required_extensions,
                )
            }?;
            profiles.push(profile);
        }

        let selected = select_first_suitable(&profiles)
            .ok_or(CreateDeviceError::NoSuitableDevice)?;
        let physical_device = physical_devices[selected];
        let QueueFamilyIndices {
            graphics: Some(graphics_family),
            present: Some(present_family),
        } = profiles[selected].queue_families
        else {
            // is_suitable only passes for complete indices
            return Err(CreateDeviceError::NoSuitableDevice);
        };

        //SAFETY: physical_device was enumerated from instance
        let properties = unsafe {
            instance.raw_physical_device_properties(physical_device)
        };
        tracing::info!(
            "Selected physical device {:?} (type {:?}, graphics family {}, \
             present family {})",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
            graphics_family,
            present_family,
        );

        // One create record per distinct family, a single queue each at
        // maximum priority.
        let priorities = [1.0f32];
        let queue_create_infos: Vec<_> =
            unique_queue_families(graphics_family, present_family)
                .into_iter()
                .map(|family| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(family)
                        .queue_priorities(&priorities)
                })
                .collect();

        let ext_ptrs: Vec<*const c_char> = config
            .required_extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_features(&features);

        //SAFETY: physical_device came from instance and create_info only
        //references live locals
        let device = unsafe {
            instance.create_ash_device(physical_device, &create_info)
        }
        .map_err(CreateDeviceError::DeviceCreation)?;

        // Role handles are re-queried by (family, queue index 0), so the
        // binding never depends on the order of the create records.
        //SAFETY: the device was created with a queue in each family
        let (graphics_handle, present_handle) = unsafe {
            (
                device.get_device_queue(graphics_family, 0),
                device.get_device_queue(present_family, 0),
            )
        };

        let swapchain_enabled = config
            .required_extensions
            .iter()
            .any(|&ext| ext == ash::khr::swapchain::NAME);

        Ok(Self {
            instance: Arc::clone(instance),
            swapchain_loader: swapchain_enabled
                .then(|| instance.create_swapchain_device(&device)),
            handle: device,
            physical_device,
            properties,
            graphics: RoleQueue {
                handle: graphics_handle,
                family: graphics_family,
            },
            present: RoleQueue {
                handle: present_handle,
                family: present_family,
            },
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Properties of the physical device this logical device was opened
    /// on, captured at selection time.
    pub fn physical_device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Human-readable driver name of the selected physical device.
    pub fn physical_device_name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned()
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// Waits until all submitted work on this device has completed.
    ///
    /// This blocks the calling thread, so it belongs in coarse transitions
    /// (shutdown, suspend, swapchain teardown) rather than per-frame paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        //SAFETY: the handle is a live logical device for the lifetime of
        //self and this call has no pointer preconditions
        unsafe { self.handle.device_wait_idle() }
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics.handle
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics.family
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present.handle
    }

    pub fn present_queue_family(&self) -> u32 {
        self.present.family
    }

    /// The queue family bindings this device was opened with, always
    /// complete.
    pub fn queue_family_indices(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: Some(self.graphics.family),
            present: Some(self.present.family),
        }
    }

    pub fn has_swapchain_support(&self) -> bool {
        self.swapchain_loader.is_some()
    }
}

// Raw swapchain and image view entry points, gated on VK_KHR_swapchain
// having been requested at device creation.
impl Device {
    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device and its parent instance, and every pointer in it must stay
    /// valid for the duration of the call. A non-null
    /// `create_info.old_swapchain` must be a live swapchain from this
    /// device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, SwapchainCreationError> {
        let Some(ref loader) = self.swapchain_loader else {
            return Err(SwapchainCreationError::SwapchainNotEnabled);
        };
        //SAFETY: caller guarantees create info validity and provenance
        unsafe { loader.create_swapchain(create_info, None) }
            .map_err(SwapchainCreationError::Create)
    }

    /// # Safety
    /// `swapchain` must be a live swapchain created from this device.
    pub unsafe fn raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, SwapchainCreationError> {
        let Some(ref loader) = self.swapchain_loader else {
            return Err(SwapchainCreationError::SwapchainNotEnabled);
        };
        //SAFETY: caller guarantees the swapchain is live and came from
        //this device
        unsafe { loader.get_swapchain_images(swapchain) }
            .map_err(SwapchainCreationError::GetImages)
    }

    /// # Safety
    /// `swapchain` must come from this device, every resource derived from
    /// it must already be destroyed, and no in-flight GPU work may still
    /// reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(ref loader) = self.swapchain_loader {
            //SAFETY: caller guarantees provenance and destruction order
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device, and every pointer in it must stay valid for the duration of
    /// the call.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        //SAFETY: caller guarantees create info validity and provenance
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must come from this device, everything using it must
    /// already be destroyed, and no in-flight GPU work may still reference
    /// it.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        //SAFETY: caller guarantees provenance and destruction order
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: every object derived from this device is dropped before
        //the device itself
        unsafe { self.handle.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graphics_family() -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn compute_family() -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::COMPUTE,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn find_queue_families_accepts_combined_family() {
        let families = [graphics_family()];
        let indices = find_queue_families(&families, |_| Ok(true))
            .expect("no query error");
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert!(indices.is_complete());
    }

    #[test]
    fn find_queue_families_accepts_split_families() {
        // Family 0 can only run graphics, family 1 can only present.
        let families = [graphics_family(), compute_family()];
        let indices = find_queue_families(&families, |family| Ok(family == 1))
            .expect("no query error");
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn find_queue_families_incomplete_without_present_support() {
        let families = [graphics_family()];
        let indices = find_queue_families(&families, |_| Ok(false))
            .expect("no query error");
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, None);
        assert!(!indices.is_complete());
    }

    #[test]
    fn find_queue_families_settles_on_later_family_serving_both_roles() {
        // Family 0 is graphics-only, family 1 can do both; the overwriting
        // walk lands on family 1 for both roles.
        let families = [graphics_family(), graphics_family()];
        let indices = find_queue_families(&families, |family| Ok(family == 1))
            .expect("no query error");
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn find_queue_families_stops_probing_once_complete() {
        let families =
            [graphics_family(), graphics_family(), graphics_family()];
        let mut probed = Vec::new();
        let _ = find_queue_families(&families, |family| {
            probed.push(family);
            Ok(true)
        })
        .expect("no query error");
        // Family 0 satisfies both roles, so families 1 and 2 are never
        // queried.
        assert_eq!(probed, vec![0]);
    }

    #[test]
    fn find_queue_families_propagates_query_errors() {
        let families = [graphics_family()];
        let result = find_queue_families(&families, |_| {
            Err(SurfaceError::ExtensionNotLoaded)
        });
        assert!(matches!(result, Err(SurfaceError::ExtensionNotLoaded)));
    }

    #[test]
    fn unique_queue_families_merges_shared_family() {
        assert_eq!(unique_queue_families(2, 2), vec![2]);
    }

    #[test]
    fn unique_queue_families_keeps_distinct_families_ordered() {
        assert_eq!(unique_queue_families(0, 3), vec![0, 3]);
    }

    #[test]
    fn missing_extensions_reports_absent_names_in_request_order() {
        let available = vec![
            CString::from(c"VK_KHR_swapchain"),
            CString::from(c"VK_EXT_robustness2"),
        ];
        let missing = missing_extensions(
            &[
                c"VK_KHR_portability_subset",
                c"VK_KHR_swapchain",
                c"VK_KHR_ray_query",
            ],
            &available,
        );
        assert_eq!(
            missing,
            vec![
                CString::from(c"VK_KHR_portability_subset"),
                CString::from(c"VK_KHR_ray_query"),
            ]
        );
    }

    #[test]
    fn missing_extensions_empty_when_all_present() {
        let available = vec![CString::from(c"VK_KHR_swapchain")];
        assert!(
            missing_extensions(&[c"VK_KHR_swapchain"], &available).is_empty()
        );
    }

    fn suitable_profile() -> CandidateProfile {
        CandidateProfile {
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            missing_extensions: Vec::new(),
            format_count: 2,
            present_mode_count: 1,
        }
    }

    #[test]
    fn profile_unsuitable_when_any_requirement_fails() {
        assert!(suitable_profile().is_suitable());

        let incomplete = CandidateProfile {
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: None,
            },
            ..suitable_profile()
        };
        assert!(!incomplete.is_suitable());

        let missing_ext = CandidateProfile {
            missing_extensions: vec![CString::from(c"VK_KHR_swapchain")],
            ..suitable_profile()
        };
        assert!(!missing_ext.is_suitable());

        let no_formats = CandidateProfile {
            format_count: 0,
            ..suitable_profile()
        };
        assert!(!no_formats.is_suitable());

        let no_modes = CandidateProfile {
            present_mode_count: 0,
            ..suitable_profile()
        };
        assert!(!no_modes.is_suitable());
    }

    #[test]
    fn selection_takes_first_suitable_candidate_in_order() {
        let unsuitable = CandidateProfile {
            format_count: 0,
            ..suitable_profile()
        };
        let profiles = [unsuitable, suitable_profile(), suitable_profile()];
        assert_eq!(select_first_suitable(&profiles), Some(1));
    }

    #[test]
    fn selection_fails_when_no_candidate_is_suitable() {
        let profiles = [
            CandidateProfile {
                format_count: 0,
                ..suitable_profile()
            },
            CandidateProfile {
                queue_families: QueueFamilyIndices::default(),
                ..suitable_profile()
            },
        ];
        assert_eq!(select_first_suitable(&profiles), None);
        assert_eq!(select_first_suitable(&[]), None);
    }
}
