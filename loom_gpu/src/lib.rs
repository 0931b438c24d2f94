//! A thin, opinionated GPU abstraction layer: bindless resource tables,
//! a single main-queue timeline, a dependency-driven task graph, and an
//! in-process HLSL shader compiler.
//!
//! Entry point: [`Context::create_context`] -> [`Context::create_device`].

pub mod command_list;
pub mod error;
pub mod pipeline;
pub mod resource;
pub mod slot;
pub mod task_graph;
pub mod types;
pub mod vulkan;

use std::sync::Arc;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub use crate::vulkan::device::{Device, DeviceInfo};
use crate::vulkan::device::DeviceShared;
use crate::vulkan::instance::Instance;
use crate::vulkan::swapchain::{default_surface_format_selector, Surface, Swapchain};

pub struct ContextInfo {
    pub enable_validation: bool,
    pub enable_debug_names: bool,
}

impl Default for ContextInfo {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
            enable_debug_names: cfg!(debug_assertions),
        }
    }
}

/// Owns the Vulkan instance and the physical device it was selected from.
/// All device/swapchain/pipeline construction goes through here.
pub struct Context {
    instance: Instance,
    info: ContextInfo,
}

impl Context {
    pub fn create_context(info: ContextInfo, display_handle: RawDisplayHandle) -> anyhow::Result<Self> {
        log::trace!("creating context");
        let instance = Instance::new(info.enable_validation, display_handle)?;
        Ok(Self { instance, info })
    }

    pub fn create_device(&self, device_info: DeviceInfo) -> anyhow::Result<Device> {
        let physical_devices = self.instance.enumerate_physical_devices()?;
        let physical_device = physical_devices
            .iter()
            .find(|pd| pd.is_discrete())
            .or_else(|| physical_devices.first())
            .ok_or_else(|| anyhow::anyhow!("no Vulkan physical devices available"))?;

        log::debug!("selected physical device: {:?}", unsafe {
            std::ffi::CStr::from_ptr(physical_device.properties.device_name.as_ptr())
        });

        let shared = DeviceShared::new(&self.instance, physical_device, &device_info)?;
        Ok(Device { shared })
    }

    pub fn create_swapchain(
        &self,
        device: &Device,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> anyhow::Result<Swapchain> {
        let surface = Surface::new(&self.instance, display_handle, window_handle)?;
        let physical_device = device.shared().physical_device;
        Swapchain::new(device.shared().clone(), surface, physical_device, default_surface_format_selector)
    }

    pub fn enable_validation(&self) -> bool {
        self.info.enable_validation
    }

    pub fn enable_debug_names(&self) -> bool {
        self.info.enable_debug_names
    }
}

#[allow(unused)]
fn assert_device_shared_is_sync_send() {
    fn assert<T: Send + Sync>() {}
    assert::<Arc<DeviceShared>>();
}
