//! Surface and swapchain lifecycle.
//!
//! `acquire_next_image` is fence-based rather than semaphore-based: the task
//! graph needs a CPU-visible sync point before it resolves the swapchain's
//! virtual image for the frame.

use std::sync::Arc;

use anyhow::Context as _;
use ash::khr::{surface, swapchain};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::device::DeviceShared;
use super::instance::Instance;
use crate::resource::ImageDescriptor;
use crate::types::ImageId;

pub struct Surface {
    loader: surface::Instance,
    pub(crate) raw: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        instance: &Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> anyhow::Result<Self> {
        let loader = surface::Instance::new(&instance.entry, &instance.raw);
        let raw = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("failed to create surface")?;
        Ok(Self { loader, raw })
    }

    pub fn supported_formats(&self, physical_device: vk::PhysicalDevice) -> anyhow::Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.raw)
        }
        .context("failed to query surface formats")
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> anyhow::Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.raw)
        }
        .context("failed to query surface capabilities")
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> anyhow::Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.raw)
        }
        .context("failed to query surface present modes")
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
    }
}

/// Scores a candidate surface format; the maximum-scoring format is chosen.
/// The default selector strongly prefers `B8G8R8A8_UNORM` + `SRGB_NONLINEAR`.
pub type SurfaceFormatSelector = fn(&vk::SurfaceFormatKHR) -> i32;

pub fn default_surface_format_selector(format: &vk::SurfaceFormatKHR) -> i32 {
    if format.format == vk::Format::B8G8R8A8_UNORM
        && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    {
        1
    } else {
        0
    }
}

pub struct Swapchain {
    device: Arc<DeviceShared>,
    surface: Surface,
    loader: swapchain::Device,
    pub(crate) raw: vk::SwapchainKHR,
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    pub(crate) image_ids: Vec<ImageId>,
    acquire_fence: vk::Fence,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceShared>,
        surface: Surface,
        physical_device: vk::PhysicalDevice,
        format_selector: SurfaceFormatSelector,
    ) -> anyhow::Result<Self> {
        let loader = swapchain::Device::new(&device.instance_raw, &device.raw);
        let acquire_fence = unsafe {
            device
                .raw
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .context("failed to create swapchain acquire fence")?;

        let mut swapchain = Self {
            device,
            surface,
            loader,
            raw: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            image_ids: Vec::new(),
            acquire_fence,
        };
        swapchain.recreate(physical_device, format_selector)?;
        Ok(swapchain)
    }

    pub fn get_format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn resize(&mut self, physical_device: vk::PhysicalDevice, format_selector: SurfaceFormatSelector) -> anyhow::Result<()> {
        self.recreate(physical_device, format_selector)
    }

    /// Destroys the previous per-image resources through the zombie path,
    /// then creates a new swapchain passing the old handle as `oldSwapchain`.
    fn recreate(
        &mut self,
        physical_device: vk::PhysicalDevice,
        format_selector: SurfaceFormatSelector,
    ) -> anyhow::Result<()> {
        let capabilities = self.surface.capabilities(physical_device)?;
        let formats = self.surface.supported_formats(physical_device)?;
        let surface_format = formats
            .iter()
            .copied()
            .max_by_key(format_selector)
            .ok_or_else(|| anyhow::anyhow!("no compatible surface format"))?;

        let present_modes = self.surface.present_modes(physical_device)?;
        let present_mode = if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            self.extent
        };

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.raw;

        for id in self.image_ids.drain(..) {
            self.device.destroy_image(id);
        }

        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("failed to create swapchain")?;

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }

        let raw_images = unsafe { self.loader.get_swapchain_images(raw) }
            .context("failed to get swapchain images")?;

        let descriptor = ImageDescriptor::new_2d_single_layer_level(
            extent.width,
            extent.height,
            surface_format.format,
            usage,
        );
        let image_ids = raw_images
            .into_iter()
            .map(|raw_image| self.device.adopt_swapchain_image(raw_image, descriptor))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.raw = raw;
        self.surface_format = surface_format;
        self.extent = extent;
        self.image_ids = image_ids;
        Ok(())
    }

    /// Fence-based acquire: no semaphore is used, the acquire fence is the
    /// single CPU synchronization point. Recreates on out-of-date/suboptimal
    /// /surface-lost; any other error is fatal.
    pub fn acquire_next_image(
        &mut self,
        physical_device: vk::PhysicalDevice,
        format_selector: SurfaceFormatSelector,
    ) -> anyhow::Result<ImageId> {
        loop {
            let result = unsafe {
                self.loader.acquire_next_image(
                    self.raw,
                    u64::MAX,
                    vk::Semaphore::null(),
                    self.acquire_fence,
                )
            };

            match result {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        log::warn!("swapchain suboptimal, will recreate next resize");
                    }
                    unsafe {
                        self.device
                            .raw
                            .wait_for_fences(&[self.acquire_fence], true, u64::MAX)
                    }
                    .context("failed waiting on swapchain acquire fence")?;
                    unsafe { self.device.raw.reset_fences(&[self.acquire_fence]) }
                        .context("failed to reset swapchain acquire fence")?;
                    return Ok(self.image_ids[index as usize]);
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.recreate(physical_device, format_selector)?;
                    continue;
                }
                Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                    self.recreate(physical_device, format_selector)?;
                    continue;
                }
                Err(other) => return Err(other).context("failed to acquire swapchain image"),
            }
        }
    }

    /// Maps a virtual image id previously returned by `acquire_next_image`
    /// back to its swapchain presentation index.
    pub(crate) fn image_index(&self, id: ImageId) -> Option<u32> {
        self.image_ids.iter().position(|&i| i == id).map(|i| i as u32)
    }

    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> anyhow::Result<bool> {
        let swapchains = [self.raw];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(other) => Err(other).context("failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        for id in self.image_ids.drain(..) {
            self.device.destroy_image(id);
        }
        unsafe {
            self.loader.destroy_swapchain(self.raw, None);
            self.device.raw.destroy_fence(self.acquire_fence, None);
        }
    }
}
