//! Buffer/image/sampler slot payloads and the bindless [`GpuResourceTable`].
//!
//! One `UPDATE_AFTER_BIND` descriptor set at `set = 0`, four bindings
//! (storage buffer / sampled image / storage image / sampler), each image
//! slot embedding its own default view.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use crate::slot::SlotTable;
use crate::types::{BufferId, ImageId, ImageViewId, SamplerId, MAX_PUSH_CONSTANT_BYTE_SIZE, MAX_RESOURCE_SLOTS};

pub const STORAGE_BUFFER_BINDING: u32 = 0;
pub const SAMPLED_IMAGE_BINDING: u32 = 1;
pub const STORAGE_IMAGE_BINDING: u32 = 2;
pub const SAMPLER_BINDING: u32 = 3;

#[derive(Clone, Copy)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
}

#[derive(Clone, Copy)]
pub struct ImageDescriptor {
    pub extent: vk::Extent3D,
    pub array_layer_count: u32,
    pub mip_level_count: u32,
    pub format: vk::Format,
    pub image_type: vk::ImageType,
    pub usage: vk::ImageUsageFlags,
    pub memory_location: MemoryLocation,
}

impl ImageDescriptor {
    pub fn new_2d_single_layer_level(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            array_layer_count: 1,
            mip_level_count: 1,
            format,
            image_type: vk::ImageType::TYPE_2D,
            usage,
            memory_location: MemoryLocation::GpuOnly,
        }
    }
}

#[derive(Clone, Copy)]
pub struct SamplerDescriptor {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

pub(crate) struct BufferSlot {
    pub raw: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub descriptor: BufferDescriptor,
}

pub(crate) struct ImageSlot {
    pub raw: vk::Image,
    pub allocation: Option<Allocation>,
    pub default_view: ImageViewSlot,
    pub descriptor: ImageDescriptor,
    /// `true` for swapchain-owned images: the VkImage is not ours to destroy,
    /// only the default view and descriptor slot are.
    pub owns_image: bool,
}

#[derive(Clone, Copy)]
pub(crate) struct ImageViewSlot {
    pub raw: vk::ImageView,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
}

pub(crate) struct SamplerSlot {
    pub raw: vk::Sampler,
    pub descriptor: SamplerDescriptor,
}

/// Owns the four bindless slot tables plus the single descriptor set every
/// shader in this crate binds at set = 0, and the push-constant-sized
/// pipeline layout array shared by every pipeline.
pub struct GpuResourceTable {
    pub(crate) buffers: SlotTable<BufferSlot>,
    pub(crate) images: SlotTable<ImageSlot>,
    pub(crate) image_views: SlotTable<ImageViewSlot>,
    pub(crate) samplers: SlotTable<SamplerSlot>,

    pub(crate) descriptor_pool: vk::DescriptorPool,
    pub(crate) descriptor_set_layout: vk::DescriptorSetLayout,
    pub(crate) descriptor_set: vk::DescriptorSet,
    pub(crate) pipeline_layouts: Vec<vk::PipelineLayout>,
    pub(crate) null_sampler: vk::Sampler,
}

impl GpuResourceTable {
    /// Builds the `UPDATE_AFTER_BIND`/`PARTIALLY_BOUND` descriptor set layout
    /// every pipeline layout in [`PIPELINE_LAYOUT_COUNT`] embeds at set = 0.
    ///
    /// Split out from [`GpuResourceTable::new`] so the device can build the
    /// pipeline layout array against this layout before the rest of the
    /// resource table (pool, set, slot tables) exists.
    pub(crate) unsafe fn create_descriptor_set_layout(
        device: &ash::Device,
    ) -> anyhow::Result<vk::DescriptorSetLayout> {
        let bindings = [
            binding(STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
            binding(SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
            binding(STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
            binding(SAMPLER_BINDING, vk::DescriptorType::SAMPLER),
        ];
        let binding_flags = [bindless_flags(); 4];
        let mut binding_flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut binding_flags_info);
        Ok(device.create_descriptor_set_layout(&layout_info, None)?)
    }

    /// Builds the descriptor pool and allocates the single bindless set
    /// against `descriptor_set_layout`, sized to [`MAX_RESOURCE_SLOTS`] per
    /// binding.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        descriptor_set_layout: vk::DescriptorSetLayout,
        pipeline_layouts: Vec<vk::PipelineLayout>,
        null_sampler: vk::Sampler,
    ) -> anyhow::Result<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(MAX_RESOURCE_SLOTS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(MAX_RESOURCE_SLOTS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(MAX_RESOURCE_SLOTS),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(MAX_RESOURCE_SLOTS),
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = device.create_descriptor_pool(&pool_info, None)?;

        let set_layouts = [descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_set = device.allocate_descriptor_sets(&alloc_info)?[0];

        Ok(Self {
            buffers: SlotTable::new(),
            images: SlotTable::new(),
            image_views: SlotTable::new(),
            samplers: SlotTable::new(),
            descriptor_pool,
            descriptor_set_layout,
            descriptor_set,
            pipeline_layouts,
            null_sampler,
        })
    }

    pub(crate) unsafe fn write_buffer_descriptor(&self, device: &ash::Device, index: u32, buffer: vk::Buffer, size: u64) {
        let info = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(size)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(STORAGE_BUFFER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&info);
        device.update_descriptor_sets(&[write], &[]);
    }

    pub(crate) unsafe fn write_image_descriptors(
        &self,
        device: &ash::Device,
        index: u32,
        view: vk::ImageView,
        sampled_layout: vk::ImageLayout,
        storage_layout: vk::ImageLayout,
        usage: vk::ImageUsageFlags,
    ) {
        let mut writes = Vec::with_capacity(2);
        let sampled_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(sampled_layout)];
        let storage_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(storage_layout)];

        if usage.contains(vk::ImageUsageFlags::SAMPLED) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(SAMPLED_IMAGE_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&sampled_info),
            );
        }
        if usage.contains(vk::ImageUsageFlags::STORAGE) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(STORAGE_IMAGE_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&storage_info),
            );
        }
        if !writes.is_empty() {
            device.update_descriptor_sets(&writes, &[]);
        }
    }

    pub(crate) unsafe fn write_sampler_descriptor(&self, device: &ash::Device, index: u32, sampler: vk::Sampler) {
        let info = [vk::DescriptorImageInfo::default().sampler(sampler)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(SAMPLER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(&info);
        device.update_descriptor_sets(&[write], &[]);
    }

    pub(crate) unsafe fn clear_sampler_descriptor(&self, device: &ash::Device, index: u32) {
        self.write_sampler_descriptor(device, index, self.null_sampler);
    }

    /// Writes a null buffer descriptor over `index`, relying on
    /// `nullDescriptor` (robustness2) so reads through the bindless set
    /// return zero rather than referencing a destroyed `VkBuffer`.
    pub(crate) unsafe fn clear_buffer_descriptor(&self, device: &ash::Device, index: u32) {
        self.write_buffer_descriptor(device, index, vk::Buffer::null(), vk::WHOLE_SIZE);
    }

    /// Writes null sampled/storage image descriptors over `index` for
    /// whichever bindings `usage` populated, mirroring `clear_buffer_descriptor`.
    pub(crate) unsafe fn clear_image_descriptors(&self, device: &ash::Device, index: u32, usage: vk::ImageUsageFlags) {
        self.write_image_descriptors(
            device,
            index,
            vk::ImageView::null(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::UNDEFINED,
            usage,
        );
    }

    pub fn pipeline_layout_for_push_constant_size(&self, size_bytes: u32) -> vk::PipelineLayout {
        assert!(
            size_bytes <= MAX_PUSH_CONSTANT_BYTE_SIZE,
            "push constant size {size_bytes} exceeds the {MAX_PUSH_CONSTANT_BYTE_SIZE} byte cap"
        );
        let words = size_bytes.div_ceil(4) as usize;
        self.pipeline_layouts[words]
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn is_buffer_valid(&self, id: BufferId) -> bool {
        self.buffers.is_valid(id.0)
    }

    pub fn is_image_valid(&self, id: ImageId) -> bool {
        self.images.is_valid(id.0)
    }

    pub fn is_image_view_valid(&self, id: ImageViewId) -> bool {
        self.image_views.is_valid(id.0)
    }

    pub fn is_sampler_valid(&self, id: SamplerId) -> bool {
        self.samplers.is_valid(id.0)
    }

    pub fn buffer_descriptor(&self, id: BufferId) -> Option<BufferDescriptor> {
        self.buffers.get(id.0).map(|s| s.descriptor)
    }

    pub fn image_descriptor(&self, id: ImageId) -> Option<ImageDescriptor> {
        self.images.get(id.0).map(|s| s.descriptor)
    }

    pub fn raw_buffer(&self, id: BufferId) -> vk::Buffer {
        self.buffers.get(id.0).expect("invalid buffer id").raw
    }

    pub fn raw_image(&self, id: ImageId) -> vk::Image {
        self.images.get(id.0).expect("invalid image id").raw
    }

    pub fn raw_image_view(&self, id: ImageId) -> vk::ImageView {
        self.images.get(id.0).expect("invalid image id").default_view.raw
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.descriptor_pool, None);
        device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        for layout in self.pipeline_layouts.drain(..) {
            device.destroy_pipeline_layout(layout, None);
        }
        device.destroy_sampler(self.null_sampler, None);
    }
}

fn binding(index: u32, ty: vk::DescriptorType) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(index)
        .descriptor_type(ty)
        .descriptor_count(MAX_RESOURCE_SLOTS)
        .stage_flags(vk::ShaderStageFlags::ALL)
}

fn bindless_flags() -> vk::DescriptorBindingFlags {
    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
}
