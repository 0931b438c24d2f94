//! Recording surface for GPU commands.
//!
//! Thin `unsafe` wrappers over the raw `ash::Device` `cmd_*` entry points,
//! with `VkImageMemoryBarrier2`/`VkMemoryBarrier2` transitions built from
//! [`PipelineStageAccessFlags`] rather than hardcoded to one resource.

use std::sync::Arc;

use anyhow::Context as _;
use ash::vk;
use bitflags::bitflags;

use crate::vulkan::device::{DeferredDestruction, DeviceShared};
use crate::types::{BufferId, ImageId, ImageViewId, SamplerId};

bitflags! {
    /// High-level stage/access mask that [`CommandList::pipeline_barrier`]
    /// lowers into synchronization2 stage and access bits: the presence of
    /// `WRITE` always implies `MEMORY_WRITE`, `READ` implies `MEMORY_READ`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PipelineStageAccessFlags: u32 {
        const READ                 = 0b0000_0001;
        const WRITE                = 0b0000_0010;
        const VERTEX_SHADER        = 0b0000_0100;
        const FRAGMENT_SHADER      = 0b0000_1000;
        const COMPUTE_SHADER       = 0b0001_0000;
        const TRANSFER             = 0b0010_0000;
        const COLOR_ATTACHMENT     = 0b0100_0000;
        const DEPTH_STENCIL        = 0b1000_0000;
        const HOST                 = 0b1_0000_0000;
        const ALL_COMMANDS         = 0b10_0000_0000;
    }
}

impl PipelineStageAccessFlags {
    pub fn to_stage_mask(self) -> vk::PipelineStageFlags2 {
        let mut stages = vk::PipelineStageFlags2::empty();
        if self.contains(Self::VERTEX_SHADER) {
            stages |= vk::PipelineStageFlags2::VERTEX_SHADER;
        }
        if self.contains(Self::FRAGMENT_SHADER) {
            stages |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
        }
        if self.contains(Self::COMPUTE_SHADER) {
            stages |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        }
        if self.contains(Self::TRANSFER) {
            stages |= vk::PipelineStageFlags2::TRANSFER;
        }
        if self.contains(Self::COLOR_ATTACHMENT) {
            stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        }
        if self.contains(Self::DEPTH_STENCIL) {
            stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        }
        if self.contains(Self::HOST) {
            stages |= vk::PipelineStageFlags2::HOST;
        }
        if self.contains(Self::ALL_COMMANDS) {
            stages |= vk::PipelineStageFlags2::ALL_COMMANDS;
        }
        stages
    }

    pub fn to_access_mask(self) -> vk::AccessFlags2 {
        let mut access = vk::AccessFlags2::empty();
        if self.contains(Self::READ) {
            access |= vk::AccessFlags2::MEMORY_READ;
        }
        if self.contains(Self::WRITE) {
            access |= vk::AccessFlags2::MEMORY_WRITE;
        }
        access
    }
}

pub struct ImageBarrierInfo {
    pub src: PipelineStageAccessFlags,
    pub dst: PipelineStageAccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
}

pub struct MemoryBarrierInfo {
    pub src: PipelineStageAccessFlags,
    pub dst: PipelineStageAccessFlags,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum RecordingState {
    Recording,
    Complete,
}

/// One command pool + one primary command buffer. Lifecycle:
/// `Recording -> Complete`. Recording after `complete()` is a contract
/// violation and panics.
pub struct CommandList {
    device: Arc<DeviceShared>,
    pool: vk::CommandPool,
    pub(crate) raw: vk::CommandBuffer,
    state: RecordingState,
    deferred_destructions: Vec<DeferredDestruction>,
    debug_name: String,
}

impl CommandList {
    pub fn new(device: &Arc<DeviceShared>, debug_name: impl Into<String>) -> anyhow::Result<Self> {
        let (pool, raw) = if let Some(recycled) = device.acquire_recycled_command_buffer() {
            recycled
        } else {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(device.queue_family_index())
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = unsafe { device.raw.create_command_pool(&pool_info, None) }
                .context("failed to create command pool")?;
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffer = unsafe { device.raw.allocate_command_buffers(&alloc_info) }
                .context("failed to allocate command buffer")?[0];
            (pool, buffer)
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.raw.begin_command_buffer(raw, &begin_info) }
            .context("failed to begin command buffer")?;

        Ok(Self {
            device: device.clone(),
            pool,
            raw,
            state: RecordingState::Recording,
            deferred_destructions: Vec::new(),
            debug_name: debug_name.into(),
        })
    }

    fn assert_recording(&self) {
        assert!(
            self.state == RecordingState::Recording,
            "recording against completed command list '{}'",
            self.debug_name
        );
    }

    pub fn complete(mut self) -> anyhow::Result<CompletedCommandList> {
        self.assert_recording();
        unsafe { self.device.raw.end_command_buffer(self.raw) }
            .context("failed to end command buffer")?;
        self.state = RecordingState::Complete;
        let completed = CompletedCommandList {
            device: self.device.clone(),
            pool: self.pool,
            raw: self.raw,
            deferred_destructions: std::mem::take(&mut self.deferred_destructions),
        };
        // Ownership of the pool/buffer now lives on `completed`; without this
        // `CommandList::drop` would still run and recycle them immediately,
        // making them eligible for reuse before they're ever submitted.
        std::mem::forget(self);
        Ok(completed)
    }

    pub fn pipeline_barrier(&mut self, barrier: &MemoryBarrierInfo) {
        self.assert_recording();
        let memory_barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(barrier.src.to_stage_mask())
            .src_access_mask(barrier.src.to_access_mask())
            .dst_stage_mask(barrier.dst.to_stage_mask())
            .dst_access_mask(barrier.dst.to_access_mask());
        let memory_barriers = [memory_barrier];
        let dependency_info = vk::DependencyInfo::default().memory_barriers(&memory_barriers);
        unsafe { self.device.raw.cmd_pipeline_barrier2(self.raw, &dependency_info) };
    }

    pub fn pipeline_image_barrier(&mut self, barrier: &ImageBarrierInfo) {
        self.assert_recording();
        let image_barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(barrier.src.to_stage_mask())
            .src_access_mask(barrier.src.to_access_mask())
            .dst_stage_mask(barrier.dst.to_stage_mask())
            .dst_access_mask(barrier.dst.to_access_mask())
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.range);
        let image_barriers = [image_barrier];
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&image_barriers);
        unsafe { self.device.raw.cmd_pipeline_barrier2(self.raw, &dependency_info) };
    }

    pub fn begin_rendering(&mut self, info: &vk::RenderingInfo) {
        self.assert_recording();
        unsafe { self.device.raw.cmd_begin_rendering(self.raw, info) };
    }

    pub fn end_rendering(&mut self) {
        self.assert_recording();
        unsafe { self.device.raw.cmd_end_rendering(self.raw) };
    }

    pub fn bind_pipeline_graphics(&mut self, pipeline: vk::Pipeline) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    pub fn bind_pipeline_compute(&mut self, pipeline: vk::Pipeline) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::COMPUTE, pipeline)
        };
    }

    /// Binds the crate's single global bindless descriptor set at set = 0.
    pub fn bind_global_descriptor_set(&mut self, layout: vk::PipelineLayout, bind_point: vk::PipelineBindPoint) {
        self.assert_recording();
        let resources = self.device.resources.read();
        let sets = [resources.descriptor_set()];
        unsafe {
            self.device
                .raw
                .cmd_bind_descriptor_sets(self.raw, bind_point, layout, 0, &sets, &[])
        };
    }

    /// Pushes constants through the pipeline layout sized for `data.len()`
    /// bytes. Panics if `data` is not a multiple of 4 bytes or exceeds
    /// [`crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE`] -- a contract
    /// violation, not a recoverable error.
    pub fn push_constant(&mut self, layout: vk::PipelineLayout, data: &[u8]) {
        self.assert_recording();
        assert_eq!(data.len() % 4, 0, "push constant size must be a multiple of 4 bytes");
        assert!(
            data.len() as u32 <= crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE,
            "push constant size {} exceeds the {} byte cap",
            data.len(),
            crate::types::MAX_PUSH_CONSTANT_BYTE_SIZE
        );
        unsafe {
            self.device
                .raw
                .cmd_push_constants(self.raw, layout, vk::ShaderStageFlags::ALL, 0, data)
        };
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.assert_recording();
        unsafe { self.device.raw.cmd_dispatch(self.raw, x, y, z) };
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.assert_recording();
        unsafe {
            self.device.raw.cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    pub fn copy_buffer_to_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.assert_recording();
        unsafe { self.device.raw.cmd_copy_buffer(self.raw, src, dst, regions) };
    }

    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, layout: vk::ImageLayout, regions: &[vk::BufferImageCopy]) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_copy_buffer_to_image(self.raw, src, dst, layout, regions)
        };
    }

    pub fn copy_image_to_image(&mut self, src: vk::Image, src_layout: vk::ImageLayout, dst: vk::Image, dst_layout: vk::ImageLayout, regions: &[vk::ImageCopy]) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_copy_image(self.raw, src, src_layout, dst, dst_layout, regions)
        };
    }

    pub fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit2],
        filter: vk::Filter,
    ) {
        self.assert_recording();
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src)
            .src_image_layout(src_layout)
            .dst_image(dst)
            .dst_image_layout(dst_layout)
            .regions(regions)
            .filter(filter);
        unsafe { self.device.raw.cmd_blit_image2(self.raw, &blit_info) };
    }

    pub fn clear_color_image(&mut self, image: vk::Image, layout: vk::ImageLayout, color: vk::ClearColorValue, range: vk::ImageSubresourceRange) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_clear_color_image(self.raw, image, layout, &color, &[range])
        };
    }

    pub fn clear_depth_stencil_image(&mut self, image: vk::Image, layout: vk::ImageLayout, value: vk::ClearDepthStencilValue, range: vk::ImageSubresourceRange) {
        self.assert_recording();
        unsafe {
            self.device
                .raw
                .cmd_clear_depth_stencil_image(self.raw, image, layout, &value, &[range])
        };
    }

    pub fn deferred_destroy_buffer(&mut self, id: BufferId) {
        self.deferred_destructions.push(DeferredDestruction::Buffer(id));
    }

    pub fn deferred_destroy_image(&mut self, id: ImageId) {
        self.deferred_destructions.push(DeferredDestruction::Image(id));
    }

    pub fn deferred_destroy_image_view(&mut self, id: ImageViewId) {
        self.deferred_destructions.push(DeferredDestruction::ImageView(id));
    }

    pub fn deferred_destroy_sampler(&mut self, id: SamplerId) {
        self.deferred_destructions.push(DeferredDestruction::Sampler(id));
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.state == RecordingState::Recording {
            // Dropped mid-recording (e.g. an error unwound before `complete()`):
            // still safe to recycle once the driver-side recording is closed.
            unsafe {
                let _ = self.device.raw.end_command_buffer(self.raw);
            }
        }
        self.device.recycle_command_buffer(self.pool, self.raw);
    }
}

/// A command list that finished recording and is ready to submit.
pub struct CompletedCommandList {
    device: Arc<DeviceShared>,
    pub(crate) pool: vk::CommandPool,
    pub(crate) raw: vk::CommandBuffer,
    pub(crate) deferred_destructions: Vec<DeferredDestruction>,
}

impl CompletedCommandList {
    pub fn raw(&self) -> vk::CommandBuffer {
        self.raw
    }
}

impl Drop for CompletedCommandList {
    fn drop(&mut self) {
        // Reached only when a completed list is discarded without ever being
        // submitted: the GPU never saw it, so its pool/buffer and deferred
        // destructions are retired through the normal submit-zombie path at
        // the current timeline value rather than leaking.
        let t = self.device.cpu_timeline_value();
        let deferred = std::mem::take(&mut self.deferred_destructions);
        self.device
            .push_submit_zombie(t, vec![(self.pool, self.raw)], deferred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_masks_lower_to_memory_bits() {
        let flags = PipelineStageAccessFlags::READ | PipelineStageAccessFlags::WRITE;
        assert_eq!(
            flags.to_access_mask(),
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE
        );
    }

    #[test]
    fn compute_shader_stage_lowers_correctly() {
        let flags = PipelineStageAccessFlags::COMPUTE_SHADER;
        assert_eq!(flags.to_stage_mask(), vk::PipelineStageFlags2::COMPUTE_SHADER);
    }
}
