//! Debug messenger configuration and the policy for degrading gracefully
//! when the host is missing validation pieces.
//!
//! [`Instance::new`](crate::instance::Instance::new) takes an optional
//! [`DiagnosticsConfig`] describing which layers to enable and which driver
//! messages to forward. Forwarded messages come back through a callback that
//! re-emits them as [`tracing`] events and never asks the driver to abort
//! the triggering call.

use std::ffi::CStr;

use ash::vk;
use thiserror::Error;

/// The Khronos validation layer, enabled by [`DiagnosticsConfig::default`].
pub const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Severity floor for forwarded messages.
///
/// Ordered most to least verbose; a floor of `Warning` forwards warnings and
/// errors and drops the rest.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// Message classes the messenger subscribes to, all on by default.
///
/// `correctness` is the validation layer's API-misuse findings,
/// `performance` flags technically-valid-but-slow usage, and `general` is
/// everything else the driver wants to say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCategories {
    pub general: bool,
    pub correctness: bool,
    pub performance: bool,
}

impl Default for MessageCategories {
    fn default() -> Self {
        Self {
            general: true,
            correctness: true,
            performance: true,
        }
    }
}

/// Diagnostics request handed to
/// [`Instance::new`](crate::instance::Instance::new).
///
/// Every layer listed in `layers` must be installed on the host or instance
/// creation fails. The messenger itself rides on `VK_EXT_debug_utils`, which
/// drivers are allowed to omit; `required` picks between failing outright
/// and continuing with layers but no messenger when that happens.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub max_log_level: VulkanLogLevel,
    pub categories: MessageCategories,
    pub layers: Vec<&'static CStr>,
    pub required: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_log_level: VulkanLogLevel::Warning,
            categories: MessageCategories::default(),
            layers: vec![VALIDATION_LAYER_NAME],
            required: false,
        }
    }
}

/// Why a [`DiagnosticsConfig`] could not be honored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("Layer {layer} was requested but is not installed on this host")]
    LayerUnavailable { layer: String },
    #[error(
        "A debug messenger was required but this host does not support \
         VK_EXT_debug_utils"
    )]
    MessengerUnavailable,
}

/// What instance creation should enable, given what the host offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiagnosticsPlan {
    /// No diagnostics were requested.
    Disabled,
    /// Layers go on, but `VK_EXT_debug_utils` is absent and the messenger
    /// was optional.
    LayersOnly,
    /// Layers go on and the messenger gets installed.
    Messenger,
}

/// Decides how much of `config` the host can honor.
///
/// A requested layer missing from `host_layers` is always fatal. A missing
/// `VK_EXT_debug_utils` is only fatal when the config marked the messenger
/// required.
pub(crate) fn resolve_plan(
    config: Option<&DiagnosticsConfig>,
    host_layers: &[vk::LayerProperties],
    host_extensions: &[vk::ExtensionProperties],
) -> Result<DiagnosticsPlan, DiagnosticsError> {
    let Some(config) = config else {
        return Ok(DiagnosticsPlan::Disabled);
    };

    for &layer in &config.layers {
        let installed = host_layers
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(layer));
        if !installed {
            return Err(DiagnosticsError::LayerUnavailable {
                layer: layer.to_string_lossy().into_owned(),
            });
        }
    }

    let messenger_supported = host_extensions.iter().any(|props| {
        props.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME)
    });

    match (messenger_supported, config.required) {
        (true, _) => Ok(DiagnosticsPlan::Messenger),
        (false, true) => Err(DiagnosticsError::MessengerUnavailable),
        (false, false) => Ok(DiagnosticsPlan::LayersOnly),
    }
}

fn severity_flags(
    floor: VulkanLogLevel,
) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let mut flags = Severity::ERROR;
    if floor <= VulkanLogLevel::Warning {
        flags |= Severity::WARNING;
    }
    if floor <= VulkanLogLevel::Info {
        flags |= Severity::INFO;
    }
    if floor <= VulkanLogLevel::Verbose {
        flags |= Severity::VERBOSE;
    }
    flags
}

fn type_flags(
    categories: &MessageCategories,
) -> vk::DebugUtilsMessageTypeFlagsEXT {
    use vk::DebugUtilsMessageTypeFlagsEXT as Kind;

    let mut flags = Kind::empty();
    if categories.general {
        flags |= Kind::GENERAL;
    }
    if categories.correctness {
        flags |= Kind::VALIDATION;
    }
    if categories.performance {
        flags |= Kind::PERFORMANCE;
    }
    flags
}

/// Builds the messenger create info for `config`.
///
/// The result borrows nothing and has an empty `p_next`, so besides feeding
/// `vkCreateDebugUtilsMessengerEXT` it can be chained into
/// `VkInstanceCreateInfo` to also cover instance creation and destruction.
pub(crate) fn messenger_create_info(
    config: &DiagnosticsConfig,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity_flags(config.max_log_level))
        .message_type(type_flags(&config.categories))
        .pfn_user_callback(Some(forward_to_tracing))
}

unsafe extern "system" fn forward_to_tracing(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    //SAFETY: the loader passes a valid callback data struct for the
    //duration of this call
    let message = unsafe { CStr::from_ptr((*callback_data).p_message) }
        .to_string_lossy();

    let kind = match kind {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        _ => "unknown",
    };

    match severity {
        Severity::ERROR => {
            tracing::error!(target: "vkboot-debug-messenger", kind, "{message}");
        }
        Severity::WARNING => {
            tracing::warn!(target: "vkboot-debug-messenger", kind, "{message}");
        }
        Severity::INFO => {
            tracing::info!(target: "vkboot-debug-messenger", kind, "{message}");
        }
        Severity::VERBOSE => {
            tracing::trace!(target: "vkboot-debug-messenger", kind, "{message}");
        }
        _ => {
            tracing::debug!(target: "vkboot-debug-messenger", kind, "{message}");
        }
    }

    // Report the message as unhandled so the triggering call proceeds.
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use std::ffi::c_char;

    use super::*;

    fn write_c_name(dst: &mut [c_char], name: &CStr) {
        for (slot, byte) in dst.iter_mut().zip(name.to_bytes_with_nul()) {
            *slot = *byte as c_char;
        }
    }

    fn host_layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        write_c_name(&mut props.layer_name, name);
        props
    }

    fn host_extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        write_c_name(&mut props.extension_name, name);
        props
    }

    #[test]
    fn no_config_resolves_to_disabled() {
        let plan = resolve_plan(None, &[], &[]);
        assert_eq!(plan, Ok(DiagnosticsPlan::Disabled));
    }

    #[test]
    fn full_plan_when_layer_and_extension_are_present() {
        let config = DiagnosticsConfig::default();
        let layers = [host_layer(VALIDATION_LAYER_NAME)];
        let extensions = [host_extension(ash::ext::debug_utils::NAME)];
        let plan = resolve_plan(Some(&config), &layers, &extensions);
        assert_eq!(plan, Ok(DiagnosticsPlan::Messenger));
    }

    #[test]
    fn missing_layer_is_fatal_and_names_the_layer() {
        let config = DiagnosticsConfig::default();
        let layers = [host_layer(c"VK_LAYER_vendor_something_else")];
        let extensions = [host_extension(ash::ext::debug_utils::NAME)];
        let plan = resolve_plan(Some(&config), &layers, &extensions);
        assert_eq!(
            plan,
            Err(DiagnosticsError::LayerUnavailable {
                layer: VALIDATION_LAYER_NAME.to_string_lossy().into_owned(),
            })
        );
    }

    #[test]
    fn missing_messenger_extension_degrades_when_optional() {
        let config = DiagnosticsConfig::default();
        let layers = [host_layer(VALIDATION_LAYER_NAME)];
        let plan = resolve_plan(Some(&config), &layers, &[]);
        assert_eq!(plan, Ok(DiagnosticsPlan::LayersOnly));
    }

    #[test]
    fn missing_messenger_extension_is_fatal_when_required() {
        let config = DiagnosticsConfig {
            required: true,
            ..Default::default()
        };
        let layers = [host_layer(VALIDATION_LAYER_NAME)];
        let plan = resolve_plan(Some(&config), &layers, &[]);
        assert_eq!(plan, Err(DiagnosticsError::MessengerUnavailable));
    }

    #[test]
    fn severity_floor_includes_everything_at_or_above_it() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        let warning = severity_flags(VulkanLogLevel::Warning);
        assert!(warning.contains(Severity::WARNING | Severity::ERROR));
        assert!(!warning.intersects(Severity::INFO | Severity::VERBOSE));

        assert_eq!(severity_flags(VulkanLogLevel::Error), Severity::ERROR);
        assert_eq!(
            severity_flags(VulkanLogLevel::Verbose),
            Severity::VERBOSE
                | Severity::INFO
                | Severity::WARNING
                | Severity::ERROR
        );
    }

    #[test]
    fn disabled_categories_are_left_out_of_the_type_mask() {
        use vk::DebugUtilsMessageTypeFlagsEXT as Kind;

        let categories = MessageCategories {
            performance: false,
            ..Default::default()
        };
        let flags = type_flags(&categories);
        assert!(flags.contains(Kind::GENERAL | Kind::VALIDATION));
        assert!(!flags.contains(Kind::PERFORMANCE));
    }

    #[test]
    fn messenger_create_info_reflects_the_config() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        let config = DiagnosticsConfig {
            max_log_level: VulkanLogLevel::Info,
            ..Default::default()
        };
        let create_info = messenger_create_info(&config);
        assert_eq!(
            create_info.message_severity,
            Severity::INFO | Severity::WARNING | Severity::ERROR
        );
        assert!(create_info.pfn_user_callback.is_some());
        assert!(create_info.p_next.is_null());
    }
}
