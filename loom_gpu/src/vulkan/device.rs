//! `Device`/`DeviceShared`: resource creation, submission, and deferred
//! destruction (garbage collection) against the main queue's CPU/GPU
//! timeline.
//!
//! Reclamation is purely timeline-value-driven: nothing here is indexed by
//! frame number. See `DESIGN.md` for the reasoning.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, RwLock};

use super::instance::{select_main_queue_family, Instance, PhysicalDevice};
use super::queue::{Queue, QueueSubmitSemaphoreDescriptor};
use super::semaphore::{BinarySemaphore, TimelineSemaphore};
use super::swapchain::Swapchain;
use crate::command_list::CompletedCommandList;
use crate::resource::{
    BufferDescriptor, BufferSlot, GpuResourceTable, ImageDescriptor, ImageSlot, ImageViewSlot,
    SamplerDescriptor, SamplerSlot,
};
use crate::types::{BufferId, ImageId, ImageViewId, SamplerId, MAX_PUSH_CONSTANT_BYTE_SIZE, PIPELINE_LAYOUT_COUNT};

#[derive(Clone, Copy)]
pub(crate) enum DeferredDestruction {
    Buffer(BufferId),
    Image(ImageId),
    ImageView(ImageViewId),
    Sampler(SamplerId),
}

struct Zombies {
    /// Submitted, not-yet-retired command lists: `(timeline, raw pool/buffer pairs, their deferred destructions)`.
    submits: VecDeque<(u64, Vec<(vk::CommandPool, vk::CommandBuffer)>, Vec<DeferredDestruction>)>,
    buffers: VecDeque<(u64, BufferId)>,
    image_views: VecDeque<(u64, ImageViewId)>,
    images: VecDeque<(u64, ImageId)>,
    samplers: VecDeque<(u64, SamplerId)>,
    binary_semaphores: VecDeque<(u64, vk::Semaphore)>,
    pipelines: VecDeque<(u64, vk::Pipeline)>,
}

/// A zombie tagged at timeline value `t` is reclaimable once the GPU
/// timeline semaphore has reached it, never before. Free of any device
/// dependency so it's directly testable.
fn zombie_ready(t: u64, gpu_timeline: u64) -> bool {
    t <= gpu_timeline
}

impl Zombies {
    fn new() -> Self {
        Self {
            submits: VecDeque::new(),
            buffers: VecDeque::new(),
            image_views: VecDeque::new(),
            images: VecDeque::new(),
            samplers: VecDeque::new(),
            binary_semaphores: VecDeque::new(),
            pipelines: VecDeque::new(),
        }
    }
}

pub struct DeviceShared {
    pub(crate) instance_raw: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) raw: ash::Device,
    pub(crate) use_scalar_layout: bool,

    pub(crate) resources: RwLock<GpuResourceTable>,
    allocator: ManuallyDrop<Mutex<Allocator>>,

    queue: Queue,
    cpu_timeline: AtomicU64,
    gpu_timeline_semaphore: vk::Semaphore,

    zombies: Mutex<Zombies>,
    recyclable_command_buffers: Mutex<Vec<(vk::CommandPool, vk::CommandBuffer)>>,
    recyclable_binary_semaphores: Mutex<Vec<vk::Semaphore>>,
}

pub struct DeviceInfo {
    pub enable_validation: bool,
    pub use_scalar_layout: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            enable_validation: false,
            use_scalar_layout: false,
        }
    }
}

pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl DeviceShared {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        info: &DeviceInfo,
    ) -> anyhow::Result<Arc<Self>> {
        let main_queue_family = select_main_queue_family(physical_device);

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(main_queue_family.index)
            .queue_priorities(&queue_priorities)];

        let device_extensions = [
            ash::khr::swapchain::NAME.as_ptr(),
            ash::khr::dynamic_rendering::NAME.as_ptr(),
            ash::khr::synchronization2::NAME.as_ptr(),
            ash::ext::descriptor_indexing::NAME.as_ptr(),
        ];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .runtime_descriptor_array(true)
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .scalar_block_layout(info.use_scalar_layout);

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut robustness_features =
            vk::PhysicalDeviceRobustness2FeaturesEXT::default().null_descriptor(true);

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut features13)
            .push_next(&mut robustness_features);

        let raw = unsafe { instance.raw.create_device(physical_device.raw, &create_info, None) }
            .context("failed to create logical device")?;

        let queue_raw = unsafe { raw.get_device_queue(main_queue_family.index, 0) };
        let queue = Queue::new(raw.clone(), queue_raw, main_queue_family.index);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("failed to create GPU memory allocator")?;

        let mut gpu_timeline_type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let gpu_timeline_info =
            vk::SemaphoreCreateInfo::default().push_next(&mut gpu_timeline_type_info);
        let gpu_timeline_semaphore = unsafe { raw.create_semaphore(&gpu_timeline_info, None) }
            .context("failed to create main queue timeline semaphore")?;

        let null_sampler = unsafe {
            raw.create_sampler(&vk::SamplerCreateInfo::default(), None)
        }
        .context("failed to create null sampler")?;

        let descriptor_set_layout = unsafe { GpuResourceTable::create_descriptor_set_layout(&raw) }
            .context("failed to create bindless descriptor set layout")?;
        let pipeline_layouts = create_pipeline_layouts(&raw, &[descriptor_set_layout])?;

        let resources = unsafe {
            GpuResourceTable::new(&raw, descriptor_set_layout, pipeline_layouts, null_sampler)
        }
        .context("failed to create bindless resource table")?;

        Ok(Arc::new(Self {
            instance_raw: instance.raw.clone(),
            physical_device: physical_device.raw,
            raw,
            use_scalar_layout: info.use_scalar_layout,
            resources: RwLock::new(resources),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queue,
            cpu_timeline: AtomicU64::new(0),
            gpu_timeline_semaphore,
            zombies: Mutex::new(Zombies::new()),
            recyclable_command_buffers: Mutex::new(Vec::new()),
            recyclable_binary_semaphores: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn gpu_timeline_value(&self) -> anyhow::Result<u64> {
        unsafe { self.raw.get_semaphore_counter_value(self.gpu_timeline_semaphore) }
            .context("failed to query main queue gpu timeline")
    }

    pub(crate) fn cpu_timeline_value(&self) -> u64 {
        self.cpu_timeline.load(Ordering::Acquire)
    }

    /// Checked out for command list recycling: returns an existing reset
    /// pool/buffer pair if one is available.
    pub(crate) fn acquire_recycled_command_buffer(&self) -> Option<(vk::CommandPool, vk::CommandBuffer)> {
        self.recyclable_command_buffers.lock().pop()
    }

    pub(crate) fn recycle_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe {
            let _ = self
                .raw
                .reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES);
        }
        self.recyclable_command_buffers.lock().push((pool, buffer));
    }

    /// Checked out for binary semaphore recycling: returns an existing
    /// retired (already-unsignaled) semaphore if one is available.
    pub(crate) fn acquire_recycled_binary_semaphore(&self) -> Option<vk::Semaphore> {
        self.recyclable_binary_semaphores.lock().pop()
    }

    pub(crate) fn recycle_binary_semaphore(&self, semaphore: vk::Semaphore) {
        self.recyclable_binary_semaphores.lock().push(semaphore);
    }

    pub(crate) fn queue_family_index(&self) -> u32 {
        self.queue.family_index
    }

    pub(crate) fn queue_raw(&self) -> vk::Queue {
        self.queue.raw
    }

    /// Enqueues a submitted command list's raw handles and its deferred
    /// destruction list onto the submit-zombie deque, tagged with `t`.
    pub(crate) fn push_submit_zombie(
        &self,
        t: u64,
        command_buffers: Vec<(vk::CommandPool, vk::CommandBuffer)>,
        deferred: Vec<DeferredDestruction>,
    ) {
        self.zombies
            .lock()
            .submits
            .push_front((t, command_buffers, deferred));
    }

    pub(crate) fn push_binary_semaphore_zombie(&self, t: u64, semaphore: vk::Semaphore) {
        self.zombies.lock().binary_semaphores.push_front((t, semaphore));
    }

    pub(crate) fn push_pipeline_zombie(&self, t: u64, pipeline: vk::Pipeline) {
        self.zombies.lock().pipelines.push_front((t, pipeline));
    }

    pub(crate) fn submit_and_advance_timeline(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_timelines: &[(vk::Semaphore, u64)],
        signal_timelines: &[(vk::Semaphore, u64)],
        wait_binaries: &[vk::Semaphore],
        signal_binaries: &[vk::Semaphore],
    ) -> anyhow::Result<u64> {
        self.collect_garbage()?;

        let t = self.cpu_timeline.fetch_add(1, Ordering::AcqRel) + 1;

        let mut waits: Vec<_> = wait_timelines
            .iter()
            .map(|(s, v)| QueueSubmitSemaphoreDescriptor {
                semaphore: *s,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                value: Some(*v),
            })
            .collect();
        waits.extend(wait_binaries.iter().map(|s| QueueSubmitSemaphoreDescriptor {
            semaphore: *s,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            value: None,
        }));

        let mut signals = vec![QueueSubmitSemaphoreDescriptor {
            semaphore: self.gpu_timeline_semaphore,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            value: Some(t),
        }];
        signals.extend(signal_timelines.iter().map(|(s, v)| QueueSubmitSemaphoreDescriptor {
            semaphore: *s,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            value: Some(*v),
        }));
        signals.extend(signal_binaries.iter().map(|s| QueueSubmitSemaphoreDescriptor {
            semaphore: *s,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            value: None,
        }));

        self.queue
            .submit_command_buffers(command_buffers, &waits, &signals, vk::Fence::null())?;

        Ok(t)
    }

    /// Submits a completed command list, then hands its pool/buffer and
    /// deferred destructions to the submit-zombie queue tagged with the
    /// resulting timeline value -- they must not be recycled/destroyed until
    /// the GPU timeline reaches it. Returns that timeline value.
    pub fn submit_commands(
        self: &Arc<Self>,
        mut completed: CompletedCommandList,
        wait_timelines: &[(vk::Semaphore, u64)],
        signal_timelines: &[(vk::Semaphore, u64)],
        wait_binaries: &[vk::Semaphore],
        signal_binaries: &[vk::Semaphore],
    ) -> anyhow::Result<u64> {
        let command_buffers = [completed.raw()];
        let t = self.submit_and_advance_timeline(
            &command_buffers,
            wait_timelines,
            signal_timelines,
            wait_binaries,
            signal_binaries,
        )?;

        let pool = completed.pool;
        let raw = completed.raw;
        let deferred = std::mem::take(&mut completed.deferred_destructions);
        std::mem::forget(completed);
        self.push_submit_zombie(t, vec![(pool, raw)], deferred);

        Ok(t)
    }

    pub fn wait_idle(&self) -> anyhow::Result<()> {
        self.queue.wait_idle()?;
        unsafe { self.raw.device_wait_idle() }.context("failed to wait device idle")
    }

    /// The garbage collection pass described in `SPEC_FULL.md` §4.2:
    /// drains the submit-zombie deque, re-tags each submit's deferred
    /// destructions onto the per-kind zombie deques, then drains those,
    /// always freeing image views before the images they belonged to.
    pub fn collect_garbage(&self) -> anyhow::Result<()> {
        let gpu_timeline = self.gpu_timeline_value()?;
        let mut zombies = self.zombies.lock();

        while let Some((t, _, _)) = zombies.submits.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (t, command_buffers, deferred) = zombies.submits.pop_back().unwrap();
            for (pool, buffer) in command_buffers {
                self.recycle_command_buffer(pool, buffer);
            }
            for d in deferred {
                match d {
                    DeferredDestruction::Buffer(id) => zombies.buffers.push_front((t, id)),
                    DeferredDestruction::Image(id) => zombies.images.push_front((t, id)),
                    DeferredDestruction::ImageView(id) => zombies.image_views.push_front((t, id)),
                    DeferredDestruction::Sampler(id) => zombies.samplers.push_front((t, id)),
                }
            }
        }

        while let Some((t, _)) = zombies.buffers.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, id) = zombies.buffers.pop_back().unwrap();
            self.cleanup_buffer(id);
        }

        while let Some((t, _)) = zombies.image_views.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, id) = zombies.image_views.pop_back().unwrap();
            self.cleanup_image_view(id);
        }

        while let Some((t, _)) = zombies.images.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, id) = zombies.images.pop_back().unwrap();
            self.cleanup_image(id);
        }

        while let Some((t, _)) = zombies.samplers.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, id) = zombies.samplers.pop_back().unwrap();
            self.cleanup_sampler(id);
        }

        while let Some((t, _)) = zombies.binary_semaphores.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, semaphore) = zombies.binary_semaphores.pop_back().unwrap();
            self.recycle_binary_semaphore(semaphore);
        }

        while let Some((t, _)) = zombies.pipelines.back() {
            if !zombie_ready(*t, gpu_timeline) {
                break;
            }
            let (_, pipeline) = zombies.pipelines.pop_back().unwrap();
            unsafe { self.raw.destroy_pipeline(pipeline, None) };
        }

        Ok(())
    }

    pub fn create_buffer(self: &Arc<Self>, descriptor: BufferDescriptor) -> anyhow::Result<BufferId> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(descriptor.usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.raw.create_buffer(&buffer_info, None) }
            .context("failed to create buffer")?;
        let requirements = unsafe { self.raw.get_buffer_memory_requirements(raw) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "loom_gpu buffer",
                requirements,
                location: descriptor.memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("failed to allocate buffer memory")?;

        unsafe {
            self.raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())
        }
        .context("failed to bind buffer memory")?;

        let mut resources = self.resources.write();
        let (id, slot) = resources.buffers.allocate(BufferSlot {
            raw,
            allocation: Some(allocation),
            descriptor,
        });
        let id = BufferId(id);
        unsafe {
            resources.write_buffer_descriptor(&self.raw, id.index(), slot.raw, descriptor.size);
        }
        Ok(id)
    }

    pub fn destroy_buffer(&self, id: BufferId) {
        let t = self.cpu_timeline_value();
        self.zombies.lock().buffers.push_front((t, id));
    }

    fn cleanup_buffer(&self, id: BufferId) {
        let mut resources = self.resources.write();
        if let Some(slot) = resources.buffers.free(id.0) {
            unsafe {
                resources.clear_buffer_descriptor(&self.raw, id.index());
                self.raw.destroy_buffer(slot.raw, None);
            }
            if let Some(allocation) = slot.allocation {
                let _ = self.allocator.lock().free(allocation);
            }
        }
    }

    pub fn create_image(self: &Arc<Self>, descriptor: ImageDescriptor) -> anyhow::Result<ImageId> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(descriptor.image_type)
            .format(descriptor.format)
            .extent(descriptor.extent)
            .mip_levels(descriptor.mip_level_count)
            .array_layers(descriptor.array_layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.raw.create_image(&image_info, None) }
            .context("failed to create image")?;

        let requirements = unsafe { self.raw.get_image_memory_requirements(raw) };
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "loom_gpu image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("failed to allocate image memory")?;
        unsafe {
            self.raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())
        }
        .context("failed to bind image memory")?;

        self.create_image_slot(raw, Some(allocation), descriptor, true)
    }

    pub(crate) fn adopt_swapchain_image(&self, raw: vk::Image, descriptor: ImageDescriptor) -> anyhow::Result<ImageId> {
        self.create_image_slot(raw, None, descriptor, false)
    }

    fn create_image_slot(
        &self,
        raw: vk::Image,
        allocation: Option<Allocation>,
        descriptor: ImageDescriptor,
        owns_image: bool,
    ) -> anyhow::Result<ImageId> {
        let aspect_mask = aspect_mask_for_format(descriptor.format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(descriptor.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(descriptor.mip_level_count)
                    .base_array_layer(0)
                    .layer_count(descriptor.array_layer_count),
            );
        let view_raw = unsafe { self.raw.create_image_view(&view_info, None) }
            .context("failed to create default image view")?;

        let mut resources = self.resources.write();
        let (id, slot) = resources.images.allocate(ImageSlot {
            raw,
            allocation,
            default_view: ImageViewSlot {
                raw: view_raw,
                format: descriptor.format,
                aspect_mask,
            },
            descriptor,
            owns_image,
        });
        let id = ImageId(id);
        unsafe {
            resources.write_image_descriptors(
                &self.raw,
                id.index(),
                slot.default_view.raw,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::GENERAL,
                descriptor.usage,
            );
        }
        Ok(id)
    }

    pub fn destroy_image(&self, id: ImageId) {
        let t = self.cpu_timeline_value();
        self.zombies.lock().images.push_front((t, id));
    }

    fn cleanup_image(&self, id: ImageId) {
        let mut resources = self.resources.write();
        if let Some(slot) = resources.images.free(id.0) {
            unsafe {
                resources.clear_image_descriptors(&self.raw, id.index(), slot.descriptor.usage);
                self.raw.destroy_image_view(slot.default_view.raw, None);
                if slot.owns_image {
                    self.raw.destroy_image(slot.raw, None);
                }
            }
            if let Some(allocation) = slot.allocation {
                let _ = self.allocator.lock().free(allocation);
            }
        }
    }

    pub fn create_image_view(
        &self,
        image: ImageId,
        range: vk::ImageSubresourceRange,
    ) -> anyhow::Result<ImageViewId> {
        let mut resources = self.resources.write();
        let image_slot = resources
            .images
            .get(image.0)
            .expect("create_image_view: invalid image id");
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image_slot.raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image_slot.descriptor.format)
            .subresource_range(range);
        let raw = unsafe { self.raw.create_image_view(&view_info, None) }
            .context("failed to create image view")?;

        let slot = ImageViewSlot {
            raw,
            format: image_slot.descriptor.format,
            aspect_mask: range.aspect_mask,
        };
        let (id, _) = resources.image_views.allocate(slot);
        Ok(ImageViewId(id))
    }

    pub fn destroy_image_view(&self, id: ImageViewId) {
        let t = self.cpu_timeline_value();
        self.zombies.lock().image_views.push_front((t, id));
    }

    fn cleanup_image_view(&self, id: ImageViewId) {
        let mut resources = self.resources.write();
        if let Some(slot) = resources.image_views.free(id.0) {
            unsafe { self.raw.destroy_image_view(slot.raw, None) };
        }
    }

    pub fn create_sampler(&self, descriptor: SamplerDescriptor) -> anyhow::Result<SamplerId> {
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(descriptor.mag_filter)
            .min_filter(descriptor.min_filter)
            .address_mode_u(descriptor.address_mode)
            .address_mode_v(descriptor.address_mode)
            .address_mode_w(descriptor.address_mode);
        if let Some(max_anisotropy) = descriptor.max_anisotropy {
            info = info.anisotropy_enable(true).max_anisotropy(max_anisotropy);
        }
        let raw = unsafe { self.raw.create_sampler(&info, None) }
            .context("failed to create sampler")?;

        let mut resources = self.resources.write();
        let (id, _) = resources.samplers.allocate(SamplerSlot { raw, descriptor });
        let id = SamplerId(id);
        unsafe { resources.write_sampler_descriptor(&self.raw, id.index(), raw) };
        Ok(id)
    }

    pub fn destroy_sampler(&self, id: SamplerId) {
        let t = self.cpu_timeline_value();
        self.zombies.lock().samplers.push_front((t, id));
    }

    fn cleanup_sampler(&self, id: SamplerId) {
        let mut resources = self.resources.write();
        if let Some(slot) = resources.samplers.free(id.0) {
            unsafe {
                resources.clear_sampler_descriptor(&self.raw, id.index());
                self.raw.destroy_sampler(slot.raw, None);
            }
        }
    }

    pub fn create_binary_semaphore(self: &Arc<Self>) -> anyhow::Result<BinarySemaphore> {
        if let Some(raw) = self.acquire_recycled_binary_semaphore() {
            return Ok(BinarySemaphore::from_raw(self.clone(), raw));
        }
        BinarySemaphore::new(self.clone())
    }

    pub fn create_timeline_semaphore(self: &Arc<Self>, initial_value: u64) -> anyhow::Result<TimelineSemaphore> {
        TimelineSemaphore::new(self.clone(), initial_value)
    }
}

fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn create_pipeline_layouts(device: &ash::Device, extra_set_layouts: &[vk::DescriptorSetLayout]) -> anyhow::Result<Vec<vk::PipelineLayout>> {
    let mut layouts = Vec::with_capacity(PIPELINE_LAYOUT_COUNT);
    for words in 0..PIPELINE_LAYOUT_COUNT as u32 {
        let push_constant_ranges = if words == 0 {
            Vec::new()
        } else {
            vec![vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::ALL)
                .offset(0)
                .size((words * 4).min(MAX_PUSH_CONSTANT_BYTE_SIZE))]
        };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(extra_set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&info, None) }
            .context("failed to create pipeline layout")?;
        layouts.push(layout);
    }
    Ok(layouts)
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let _ = self.wait_idle();
        let _ = self.collect_garbage();
        unsafe {
            self.resources.write().destroy(&self.raw);
            self.raw.destroy_semaphore(self.gpu_timeline_semaphore, None);
            for (pool, _) in self.recyclable_command_buffers.lock().drain(..) {
                self.raw.destroy_command_pool(pool, None);
            }
            for semaphore in self.recyclable_binary_semaphores.lock().drain(..) {
                self.raw.destroy_semaphore(semaphore, None);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

impl Device {
    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Submits a completed command list against the main queue, per
    /// `SPEC_FULL.md` §4.2. Returns the CPU timeline value reached by this
    /// submission, which is what its deferred destructions wait on.
    pub fn submit_commands(
        &self,
        completed: CompletedCommandList,
        wait_timelines: &[(vk::Semaphore, u64)],
        signal_timelines: &[(vk::Semaphore, u64)],
        wait_binaries: &[vk::Semaphore],
        signal_binaries: &[vk::Semaphore],
    ) -> anyhow::Result<u64> {
        self.shared
            .submit_commands(completed, wait_timelines, signal_timelines, wait_binaries, signal_binaries)
    }

    /// Presents a previously-acquired swapchain image, per `SPEC_FULL.md`
    /// §4.5. `image` must have come from `swapchain`'s own `acquire_next_image`.
    pub fn present_frame(
        &self,
        swapchain: &mut Swapchain,
        image: ImageId,
        wait_binaries: &[vk::Semaphore],
    ) -> anyhow::Result<bool> {
        let index = swapchain
            .image_index(image)
            .context("present_frame: image id does not belong to this swapchain")?;
        swapchain.present(self.shared.queue_raw(), index, wait_binaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclamation_ordering_waits_for_the_gpu_timeline() {
        // A buffer destroyed while its submission's timeline value hasn't
        // been reached yet must not be considered ready for reclamation...
        let submit_timeline = 5;
        let gpu_timeline_before = 4;
        assert!(!zombie_ready(submit_timeline, gpu_timeline_before));

        // ...but becomes ready once the GPU timeline reaches (or passes) it.
        let gpu_timeline_after = 5;
        assert!(zombie_ready(submit_timeline, gpu_timeline_after));
        assert!(zombie_ready(submit_timeline, gpu_timeline_after + 1));
    }
}
