//! Instance creation, debug messenger and physical device selection.
//!
//! App info at API_VERSION_1_3, validation layer toggled by
//! `ContextInfo::enable_validation`, surface extensions pulled from
//! `ash_window::enumerate_required_extensions`.

use std::ffi::{CStr, CString};

use anyhow::Context as _;
use ash::ext::debug_utils;
use ash::vk;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub entry: ash::Entry,
    pub raw: ash::Instance,
    debug_utils_loader: Option<debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl Instance {
    pub fn new(enable_validation: bool, display_handle: raw_window_handle::RawDisplayHandle) -> anyhow::Result<Self> {
        let entry = unsafe { ash::Entry::load() }.context("failed to load Vulkan entry points")?;

        let app_name = CString::new("loom_gpu").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        if enable_validation {
            extension_names.push(debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&create_info, None) }
            .context("failed to create Vulkan instance")?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            let loader = debug_utils::Instance::new(&entry, &raw);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&messenger_info, None) }
                    .context("failed to create debug messenger")?;
            (Some(loader), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            raw,
            debug_utils_loader,
            debug_messenger,
        })
    }

    pub fn enumerate_physical_devices(&self) -> anyhow::Result<Vec<PhysicalDevice>> {
        let handles = unsafe { self.raw.enumerate_physical_devices() }
            .context("failed to enumerate physical devices")?;
        Ok(handles
            .into_iter()
            .map(|handle| PhysicalDevice::new_from_vulkan_handle(&self.raw, handle))
            .collect())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(loader), Some(messenger)) =
                (self.debug_utils_loader.take(), self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

pub struct PhysicalDevice {
    pub raw: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
}

impl PhysicalDevice {
    fn new_from_vulkan_handle(instance: &ash::Instance, raw: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        Self {
            raw,
            properties,
            queue_family_properties,
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

/// A single queue family supporting graphics, compute and transfer, which
/// this crate requires its one main queue to come from.
#[derive(Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_transfer(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
    }
}

/// Selects the first queue family exposing graphics, compute and transfer
/// together. Fatal (contract violation) if none exists: every GPU this
/// crate targets exposes such a family.
pub fn select_main_queue_family(physical_device: &PhysicalDevice) -> QueueFamily {
    physical_device
        .queue_family_properties
        .iter()
        .enumerate()
        .map(|(index, properties)| QueueFamily {
            index: index as u32,
            properties: *properties,
        })
        .find(|family| family.supports_graphics() && family.supports_compute() && family.supports_transfer())
        .expect("no queue family supports graphics + compute + transfer")
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = unsafe { CStr::from_ptr((*callback_data).p_message) }.to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[{message_type:?}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[{message_type:?}] {message}")
        }
        _ => log::debug!("[{message_type:?}] {message}"),
    }
    vk::FALSE
}
