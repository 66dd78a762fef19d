//! Vulkan loading, instance creation, and the raw queries everything else
//! is built on.
//!
//! [`Instance`] owns the `ash::Entry` loader, the `VkInstance`, an optional
//! debug messenger, and an optional surface extension loader. Physical
//! device probing, surface queries, and logical device creation all route
//! through it so the rest of the crate never touches a dispatch table
//! directly. [`VkVersion`] is a newtype over the packed Vulkan version
//! word.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::diagnostics::{
    DiagnosticsConfig, DiagnosticsError, DiagnosticsPlan,
    messenger_create_info, resolve_plan,
};
use crate::surface::{CreateSurfaceError, SurfaceError};
use std::{
    ffi::{CStr, CString, c_char},
    fmt::{Debug, Display},
};

/// A Vulkan API version in its packed 32-bit form.
///
/// This is the encoding `VkApplicationInfo` and
/// `vkEnumerateInstanceVersion` traffic in. Build one from components
/// with [`new`](Self::new) or wrap an already-encoded word with
/// [`from_raw`](Self::from_raw). Ordering follows the encoding, so
/// comparisons behave like version comparisons for standard (variant 0)
/// Vulkan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    /// Packs a standard (variant 0) Vulkan version.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }
}

impl Display for VkVersion {
    /// Formats as `major.minor.patch`. The variant is left out since it is
    /// zero for standard Vulkan.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load the Vulkan library: {0}")]
    Loading(ash::LoadingError),
    #[error("The display handle source has no usable handle: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("The host is missing required instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error("Unexpected Vulkan error: {0}")]
    Vulkan(vk::Result),
    #[error("App names may not contain interior nul bytes")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::Vulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum EnumerateDevicesError {
    #[error("Ran out of memory while enumerating physical devices")]
    OutOfMemory,
    #[error("Unexpected Vulkan error while enumerating physical devices: {0}")]
    Unexpected(vk::Result),
}

/// Instance-extension groups [`Instance::new`] may enable.
///
/// Everything defaults to off. `surface` asks for the window system's
/// `VkSurfaceKHR` extensions; it only takes effect when a display handle
/// source is passed alongside it, because the concrete extension names
/// depend on the window system.
#[derive(Debug, Default)]
pub struct InstanceExtensions {
    pub surface: bool,
}

/// A live debug messenger and the extension loader that can destroy it.
struct InstalledMessenger {
    handle: vk::DebugUtilsMessengerEXT,
    loader: ash::ext::debug_utils::Instance,
}

/// The root of a Vulkan session.
///
/// Owns the loader entry, the `VkInstance`, and whatever optional extension
/// state got enabled at creation time. Every object derived from an
/// instance holds an `Arc<Instance>` so teardown order follows ownership
/// order.
///
/// Built via [`Instance::new`], which is `unsafe` because it loads and runs
/// the host's Vulkan shared library.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    messenger: Option<InstalledMessenger>,
    surface_loader: Option<ash::khr::surface::Instance>,
    api_version: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

/// Resolves the window-system surface extension names for `source`.
fn window_system_extensions(
    source: &impl HasDisplayHandle,
) -> Result<Vec<&'static CStr>, InstanceCreationError> {
    let display = source
        .display_handle()
        .map_err(InstanceCreationError::InvalidDisplayHandle)?;
    let names = ash_window::enumerate_required_extensions(display.as_raw())?;
    Ok(names
        .iter()
        //SAFETY: ash_window documents these as pointers to static
        //null-terminated strings
        .map(|&ptr| unsafe { CStr::from_ptr(ptr) })
        .collect())
}

/// Names from `required` that `host` does not offer, lossily stringified
/// for error reporting.
fn missing_from_host(
    required: &[&CStr],
    host: &[vk::ExtensionProperties],
) -> Vec<String> {
    required
        .iter()
        .filter(|&&name| {
            !host
                .iter()
                .any(|props| props.extension_name_as_c_str() == Ok(name))
        })
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// # Safety
/// `instance` must have been created from `entry` with
/// `VK_EXT_debug_utils` enabled.
unsafe fn install_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
    config: &DiagnosticsConfig,
) -> Result<InstalledMessenger, vk::Result> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let create_info = messenger_create_info(config);
    //SAFETY: the create info is fully initialized and unchained
    let handle =
        unsafe { loader.create_debug_utils_messenger(&create_info, None) }?;
    Ok(InstalledMessenger { handle, loader })
}

impl Instance {
    /// Loads Vulkan and creates an instance against the newest API version
    /// the loader reports.
    ///
    /// Passing a [`DiagnosticsConfig`] enables its layers on the instance
    /// and installs a debug messenger that forwards driver messages to
    /// `tracing`. A configured layer missing from the host fails creation;
    /// a missing `VK_EXT_debug_utils` only fails it when the config marked
    /// the messenger required, and otherwise degrades to layers without a
    /// messenger.
    ///
    /// # Safety
    /// Loading the Vulkan library runs arbitrary initialization code from
    /// whatever shared object the loader finds, so the caller has to vouch
    /// for the host.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        diagnostics: Option<DiagnosticsConfig>,
        display_handle_source: Option<&impl HasDisplayHandle>,
        enabled_exts: InstanceExtensions,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name = CString::new(app_name.as_ref())
            .map_err(|_| Error::InvalidAppName)?;

        //SAFETY: dlopen-ing the loader is the risk the caller accepted.
        //The entry outlives everything created from it because Instance
        //owns it and tears the rest down first in Drop.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        //SAFETY: entry is live and this query has no other preconditions.
        //A loader too old to know the call counts as 1.0.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        // Which surface extensions to ask for depends on the window
        // system, so `enabled_exts.surface` only takes effect when a
        // display handle source is there to tell us.
        let mut required_exts = Vec::new();
        let surface_requested = if let Some(source) = display_handle_source
            && enabled_exts.surface
        {
            required_exts = window_system_extensions(source)?;
            true
        } else {
            false
        };

        //SAFETY: entry is live. None asks for the implementation's own
        //extension list rather than some layer's.
        let host_exts =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        //SAFETY: entry is live, no other preconditions
        let host_layers =
            unsafe { entry.enumerate_instance_layer_properties() }?;

        let missing = missing_from_host(&required_exts, &host_exts);
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let plan =
            resolve_plan(diagnostics.as_ref(), &host_layers, &host_exts)?;

        let mut ext_ptrs: Vec<*const c_char> =
            required_exts.iter().map(|name| name.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const c_char> = Vec::new();

        if let Some(ref config) = diagnostics {
            layer_ptrs
                .extend(config.layers.iter().map(|layer| layer.as_ptr()));
            if plan == DiagnosticsPlan::Messenger {
                ext_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
            } else {
                tracing::warn!(
                    "VK_EXT_debug_utils is not available on this host, \
                     continuing without a debug messenger"
                );
            }
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkboot")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);

        // Chained into the instance create info, the messenger settings
        // also cover messages emitted during instance creation and
        // destruction themselves.
        let mut chained_messenger_info = diagnostics
            .as_ref()
            .filter(|_| plan == DiagnosticsPlan::Messenger)
            .map(messenger_create_info);
        if let Some(ref mut chained) = chained_messenger_info {
            create_info = create_info.push_next(chained);
        }

        //SAFETY: the create info and everything it points at are alive
        //right here
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        let messenger = match (plan, diagnostics.as_ref()) {
            (DiagnosticsPlan::Messenger, Some(config)) => {
                //SAFETY: the instance was just created from entry with
                //VK_EXT_debug_utils enabled
                match unsafe { install_messenger(&entry, &instance, config) }
                {
                    Ok(installed) => Some(installed),
                    Err(e) if config.required => {
                        tracing::error!(
                            "A debug messenger was required but creating \
                             one failed: {e}"
                        );
                        //SAFETY: nothing has been derived from this
                        //instance yet and it does not escape on this path
                        unsafe { instance.destroy_instance(None) };
                        return Err(Error::Diagnostics(
                            DiagnosticsError::MessengerUnavailable,
                        ));
                    }
                    Err(e) => {
                        tracing::error!(
                            "Creating the debug messenger failed, \
                             continuing without one: {e}"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let surface_loader = surface_requested
            .then(|| ash::khr::surface::Instance::new(&entry, &instance));

        Ok(Self {
            entry,
            handle: instance,
            messenger,
            surface_loader,
            api_version: VkVersion::from_raw(api_version),
        })
    }

    /// Enumerates the physical devices this instance can see. The returned
    /// handles are only meaningful while this instance is alive.
    pub fn enumerate_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, EnumerateDevicesError> {
        //SAFETY: nothing to uphold beyond a live instance
        unsafe { self.handle.enumerate_physical_devices() }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                    EnumerateDevicesError::OutOfMemory
                }
                other => EnumerateDevicesError::Unexpected(other),
            }
        })
    }

    /// # Safety
    /// `physical_device` must be a valid handle from this instance.
    pub unsafe fn raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        //SAFETY: caller promises physical_device came from this instance
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be a valid handle from this instance.
    pub unsafe fn raw_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        //SAFETY: caller promises physical_device came from this instance
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle from this instance.
    pub unsafe fn raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        //SAFETY: caller promises physical_device came from this instance
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// Opens a logical device on `physical_device`.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle from this instance,
    /// `create_info` must be a valid `VkDeviceCreateInfo`, and every handle
    /// it references must also come from this instance and stay valid for
    /// the duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        //SAFETY: upheld by the caller per the conditions above
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    /// Builds the `VK_KHR_swapchain` dispatch table for a logical device
    /// opened from this instance.
    pub fn create_swapchain_device(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    /// The API version reported by `vkEnumerateInstanceVersion`, not
    /// necessarily the one the application asked for.
    pub fn api_version(&self) -> VkVersion {
        self.api_version
    }

    /// Whether a debug messenger is live on this instance.
    ///
    /// `false` either because no [`DiagnosticsConfig`] was passed or
    /// because `VK_EXT_debug_utils` was unavailable and the request was
    /// not marked required.
    pub fn diagnostics_installed(&self) -> bool {
        self.messenger.is_some()
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

// Surface extension queries. Everything here reports ExtensionNotLoaded
// when the instance was created without the surface extensions.
impl Instance {
    /// Creates a raw `VkSurfaceKHR` for a window-system source.
    ///
    /// # Safety
    /// The surface is a child of both this instance and `source`: destroy
    /// it before either goes away, and destroy it when the platform
    /// invalidates it (winit's suspend, for instance). It must only ever
    /// be passed back to this instance.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;

        if self.surface_loader.is_none() {
            return Err(Error::MissingExtension);
        }

        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?;
        let window = source
            .window_handle()
            .map_err(Error::InvalidWindowHandle)?;

        //SAFETY: keeping source alive past the surface is the caller's job
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display.as_raw(),
                window.as_raw(),
                None,
            )
        }
        .map_err(Error::Vulkan)
    }

    /// Destroys a raw `VkSurfaceKHR` made from this instance.
    ///
    /// # Safety
    /// `surface` must come from this instance, must have no live derived
    /// objects or in-flight GPU work referencing it, and must not be used
    /// again afterwards.
    pub unsafe fn destroy_raw_surface(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<(), SurfaceError> {
        let Some(ref loader) = self.surface_loader else {
            return Err(SurfaceError::ExtensionNotLoaded);
        };
        //SAFETY: provenance and last-use are the caller's promise
        unsafe { loader.destroy_surface(surface, None) };
        Ok(())
    }

    /// Asks whether a queue family on `physical_device` can present to
    /// `surface`.
    ///
    /// # Safety
    /// `physical_device` and `surface` must both come from this instance.
    pub unsafe fn raw_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceError> {
        let Some(ref loader) = self.surface_loader else {
            return Err(SurfaceError::ExtensionNotLoaded);
        };
        //SAFETY: provenance of both handles is the caller's promise
        unsafe {
            loader.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both come from this instance.
    pub unsafe fn raw_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceError> {
        let Some(ref loader) = self.surface_loader else {
            return Err(SurfaceError::ExtensionNotLoaded);
        };
        //SAFETY: provenance of both handles is the caller's promise
        unsafe {
            loader.get_physical_device_surface_capabilities(
                physical_device,
                surface,
            )
        }
        .map_err(SurfaceError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both come from this instance.
    pub unsafe fn raw_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceError> {
        let Some(ref loader) = self.surface_loader else {
            return Err(SurfaceError::ExtensionNotLoaded);
        };
        //SAFETY: provenance of both handles is the caller's promise
        unsafe {
            loader.get_physical_device_surface_formats(
                physical_device,
                surface,
            )
        }
        .map_err(SurfaceError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must both come from this instance.
    pub unsafe fn raw_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceError> {
        let Some(ref loader) = self.surface_loader else {
            return Err(SurfaceError::ExtensionNotLoaded);
        };
        //SAFETY: provenance of both handles is the caller's promise
        unsafe {
            loader.get_physical_device_surface_present_modes(
                physical_device,
                surface,
            )
        }
        .map_err(SurfaceError::Vulkan)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some(messenger) = self.messenger.take() {
            //SAFETY: the messenger came from this instance and nothing
            //else can reach it once we are in drop
            unsafe {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.handle, None);
            }
        }
        //SAFETY: children keep us alive through an Arc, so reaching drop
        //means every derived object is already gone
        unsafe { self.handle.destroy_instance(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packs_and_unpacks_components() {
        let version = VkVersion::new(1, 3, 275);
        assert_eq!(version.variant(), 0);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
    }

    #[test]
    fn version_round_trips_through_raw() {
        let raw = vk::make_api_version(0, 1, 2, 198);
        assert_eq!(VkVersion::from_raw(raw).to_raw(), raw);
        assert_eq!(VkVersion::from_raw(raw), VkVersion::new(1, 2, 198));
    }

    #[test]
    fn version_displays_as_dotted_triple() {
        assert_eq!(VkVersion::new(1, 3, 275).to_string(), "1.3.275");
    }

    #[test]
    fn version_ordering_follows_the_encoding() {
        assert!(VkVersion::new(1, 2, 0) < VkVersion::new(1, 3, 0));
        assert!(VkVersion::new(1, 3, 7) < VkVersion::new(2, 0, 0));
    }

    fn host_extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (slot, byte) in
            props.extension_name.iter_mut().zip(name.to_bytes_with_nul())
        {
            *slot = *byte as c_char;
        }
        props
    }

    #[test]
    fn missing_extension_check_reports_only_absent_names() {
        let host = [host_extension(c"VK_KHR_surface")];
        let missing = missing_from_host(
            &[c"VK_KHR_surface", c"VK_KHR_xcb_surface"],
            &host,
        );
        assert_eq!(missing, vec!["VK_KHR_xcb_surface".to_owned()]);
    }

    #[test]
    fn missing_extension_check_is_empty_when_host_has_everything() {
        let host = [
            host_extension(c"VK_KHR_surface"),
            host_extension(c"VK_KHR_wayland_surface"),
        ];
        let missing = missing_from_host(&[c"VK_KHR_surface"], &host);
        assert!(missing.is_empty());
    }
}
