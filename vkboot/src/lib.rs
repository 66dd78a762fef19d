//! Bring-up layer for a Vulkan device and presentation chain, built on
//! [`ash`].
//!
//! Initialization runs instance, surface, device, swapchain, in that
//! order: [`instance::Instance::new`] loads Vulkan and optionally installs
//! a debug messenger, [`surface::Surface`] ties a `VkSurfaceKHR` to the
//! window it came from, [`device::Device::create_for_surface`] opens the
//! first physical device that can drive that surface, and
//! [`swapchain::Swapchain`] negotiates the presentation chain and builds
//! one image view per chain image.
//!
//! # Ownership
//!
//! ```text
//! Instance (debug messenger rides along, destroyed last)
//! ├── Surface<T> ─┐
//! └── Device ─────┴── Swapchain<T> (views first, then the chain)
//! ```
//!
//! Every wrapper holds its parent through an [`Arc`](std::sync::Arc), so
//! dropping the tree releases resources in exact reverse acquisition order
//! (views, chain, device, surface, messenger, instance) with no manually
//! sequenced shutdown.
//!
//! Methods prefixed `raw_` take or return bare `ash::vk` handles and come
//! with provenance preconditions; `ash_`-prefixed accessors expose the
//! underlying `ash` wrapper objects for calls this crate does not cover.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod device;
pub mod diagnostics;
pub mod instance;
pub mod surface;
pub mod swapchain;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
