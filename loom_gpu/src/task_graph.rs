//! Dependency-driven task graph: virtual resources, access declarations,
//! deterministic batch compilation, and execution with synthesized
//! barriers.
//!
//! Tasks declare accesses against virtual `TaskBufferId`/`TaskImageId`
//! handles rather than raw resources; `compile()` linearizes tasks into
//! batches (two tasks join a batch when both are read-only with the same
//! stage bits, or — for images — also agree on layout), and `execute()`
//! resolves virtual ids to real resources through a fetch callback and
//! synthesizes one barrier per batch boundary from the union of that
//! batch's stage/access flags.

use std::sync::Arc;

use ash::vk;

use crate::command_list::{CommandList, CompletedCommandList, ImageBarrierInfo, MemoryBarrierInfo, PipelineStageAccessFlags};
use crate::error::GpuError;
use crate::types::{BufferId, ImageId};
use crate::vulkan::device::DeviceShared;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskBufferId(usize);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskImageId(usize);

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TaskBufferAccess {
    None,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    TransferRead,
    TransferWrite,
    HostTransferRead,
    HostTransferWrite,
}

impl TaskBufferAccess {
    fn stage_access(self) -> PipelineStageAccessFlags {
        use PipelineStageAccessFlags as F;
        match self {
            TaskBufferAccess::None => F::empty(),
            TaskBufferAccess::ShaderRead => F::READ | F::COMPUTE_SHADER,
            TaskBufferAccess::ShaderWrite => F::WRITE | F::COMPUTE_SHADER,
            TaskBufferAccess::ShaderReadWrite => F::READ | F::WRITE | F::COMPUTE_SHADER,
            TaskBufferAccess::TransferRead => F::READ | F::TRANSFER,
            TaskBufferAccess::TransferWrite => F::WRITE | F::TRANSFER,
            TaskBufferAccess::HostTransferRead => F::READ | F::HOST,
            TaskBufferAccess::HostTransferWrite => F::WRITE | F::HOST,
        }
    }

    fn is_read_only(self) -> bool {
        !self.stage_access().contains(PipelineStageAccessFlags::WRITE)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TaskImageAccess {
    None,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    TransferRead,
    TransferWrite,
    ColorAttachment,
    DepthAttachmentRead,
    DepthAttachmentWrite,
    Present,
}

impl TaskImageAccess {
    fn stage_access(self) -> PipelineStageAccessFlags {
        use PipelineStageAccessFlags as F;
        match self {
            TaskImageAccess::None => F::empty(),
            TaskImageAccess::ShaderRead => F::READ | F::COMPUTE_SHADER | F::FRAGMENT_SHADER,
            TaskImageAccess::ShaderWrite => F::WRITE | F::COMPUTE_SHADER | F::FRAGMENT_SHADER,
            TaskImageAccess::ShaderReadWrite => {
                F::READ | F::WRITE | F::COMPUTE_SHADER | F::FRAGMENT_SHADER
            }
            TaskImageAccess::TransferRead => F::READ | F::TRANSFER,
            TaskImageAccess::TransferWrite => F::WRITE | F::TRANSFER,
            TaskImageAccess::ColorAttachment => F::READ | F::WRITE | F::COLOR_ATTACHMENT,
            TaskImageAccess::DepthAttachmentRead => F::READ | F::DEPTH_STENCIL,
            TaskImageAccess::DepthAttachmentWrite => F::READ | F::WRITE | F::DEPTH_STENCIL,
            TaskImageAccess::Present => F::empty(),
        }
    }

    fn image_layout(self) -> vk::ImageLayout {
        match self {
            TaskImageAccess::None => vk::ImageLayout::UNDEFINED,
            TaskImageAccess::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            TaskImageAccess::ShaderWrite | TaskImageAccess::ShaderReadWrite => vk::ImageLayout::GENERAL,
            TaskImageAccess::TransferRead => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            TaskImageAccess::TransferWrite => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            TaskImageAccess::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            TaskImageAccess::DepthAttachmentRead | TaskImageAccess::DepthAttachmentWrite => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            TaskImageAccess::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    fn is_read_only(self) -> bool {
        !self.stage_access().contains(PipelineStageAccessFlags::WRITE)
    }
}

fn stage_bits_only(flags: PipelineStageAccessFlags) -> PipelineStageAccessFlags {
    flags - PipelineStageAccessFlags::READ - PipelineStageAccessFlags::WRITE
}

struct TaskBufferInfo {
    fetch_callback: Box<dyn Fn() -> BufferId>,
    last_access: TaskBufferAccess,
    debug_name: String,
}

struct TaskImageInfo {
    fetch_callback: Box<dyn Fn() -> ImageId>,
    last_access: TaskImageAccess,
    last_layout: vk::ImageLayout,
    debug_name: String,
}

struct TaskNode {
    buffer_accesses: Vec<(TaskBufferId, TaskBufferAccess)>,
    image_accesses: Vec<(TaskImageId, TaskImageAccess)>,
    callback: Box<dyn FnMut(&mut TaskInterface)>,
    debug_name: String,
}

struct Batch {
    task_indices: Vec<usize>,
    memory_barrier: Option<(PipelineStageAccessFlags, PipelineStageAccessFlags)>,
    image_transitions: Vec<(TaskImageId, vk::ImageLayout, vk::ImageLayout, PipelineStageAccessFlags, PipelineStageAccessFlags)>,
}

/// Borrows the current command list and exposes resolved concrete ids to a
/// running task callback. Valid only for the duration of the callback.
pub struct TaskInterface<'a> {
    pub command_list: &'a mut CommandList,
    device: &'a Arc<DeviceShared>,
    buffer_ids: &'a [BufferId],
    image_ids: &'a [ImageId],
}

impl<'a> TaskInterface<'a> {
    pub fn buffer(&self, id: TaskBufferId) -> BufferId {
        self.buffer_ids[id.0]
    }

    pub fn image(&self, id: TaskImageId) -> ImageId {
        self.image_ids[id.0]
    }

    pub fn raw_image(&self, id: TaskImageId) -> vk::Image {
        let resources = self.device.resources.read();
        resources.raw_image(self.image(id))
    }

    pub fn raw_buffer(&self, id: TaskBufferId) -> vk::Buffer {
        let resources = self.device.resources.read();
        resources.raw_buffer(self.buffer(id))
    }
}

pub struct TaskList {
    device: Option<Arc<DeviceShared>>,
    buffers: Vec<TaskBufferInfo>,
    images: Vec<TaskImageInfo>,
    tasks: Vec<TaskNode>,
    batches: Vec<Batch>,
    command_lists: Vec<CompletedCommandList>,
    debug_name: String,
}

impl TaskList {
    pub fn new(device: Arc<DeviceShared>, debug_name: impl Into<String>) -> Self {
        Self {
            device: Some(device),
            buffers: Vec::new(),
            images: Vec::new(),
            tasks: Vec::new(),
            batches: Vec::new(),
            command_lists: Vec::new(),
            debug_name: debug_name.into(),
        }
    }

    /// Builds a `TaskList` with no backing device, for tests that only
    /// exercise `compile()` and the access/layout bookkeeping. `execute()`
    /// panics if called on one of these.
    #[cfg(test)]
    fn new_headless(debug_name: impl Into<String>) -> Self {
        Self {
            device: None,
            buffers: Vec::new(),
            images: Vec::new(),
            tasks: Vec::new(),
            batches: Vec::new(),
            command_lists: Vec::new(),
            debug_name: debug_name.into(),
        }
    }

    pub fn create_task_buffer(
        &mut self,
        fetch_callback: impl Fn() -> BufferId + 'static,
        debug_name: impl Into<String>,
    ) -> TaskBufferId {
        self.buffers.push(TaskBufferInfo {
            fetch_callback: Box::new(fetch_callback),
            last_access: TaskBufferAccess::None,
            debug_name: debug_name.into(),
        });
        TaskBufferId(self.buffers.len() - 1)
    }

    pub fn create_task_image(
        &mut self,
        fetch_callback: impl Fn() -> ImageId + 'static,
        initial_layout: vk::ImageLayout,
        debug_name: impl Into<String>,
    ) -> TaskImageId {
        self.images.push(TaskImageInfo {
            fetch_callback: Box::new(fetch_callback),
            last_access: TaskImageAccess::None,
            last_layout: initial_layout,
            debug_name: debug_name.into(),
        });
        TaskImageId(self.images.len() - 1)
    }

    pub fn add_task(
        &mut self,
        buffer_accesses: Vec<(TaskBufferId, TaskBufferAccess)>,
        image_accesses: Vec<(TaskImageId, TaskImageAccess)>,
        debug_name: impl Into<String>,
        callback: impl FnMut(&mut TaskInterface) + 'static,
    ) -> Result<(), GpuError> {
        let debug_name = debug_name.into();

        let mut seen_buffers = std::collections::HashSet::new();
        for (id, _) in &buffer_accesses {
            if !seen_buffers.insert(id.0) {
                return Err(GpuError::DuplicateTaskResource {
                    task: debug_name,
                    resource: self.buffers[id.0].debug_name.clone(),
                });
            }
        }
        let mut seen_images = std::collections::HashSet::new();
        for (id, _) in &image_accesses {
            if !seen_images.insert(id.0) {
                return Err(GpuError::DuplicateTaskResource {
                    task: debug_name,
                    resource: self.images[id.0].debug_name.clone(),
                });
            }
        }

        self.tasks.push(TaskNode {
            buffer_accesses,
            image_accesses,
            callback: Box::new(callback),
            debug_name,
        });
        Ok(())
    }

    pub fn add_copy_image_to_image(
        &mut self,
        src: TaskImageId,
        dst: TaskImageId,
        extent: vk::Extent3D,
        debug_name: impl Into<String>,
    ) -> Result<(), GpuError> {
        self.add_task(
            Vec::new(),
            vec![
                (src, TaskImageAccess::TransferRead),
                (dst, TaskImageAccess::TransferWrite),
            ],
            debug_name,
            move |interface| {
                let src_raw = interface.raw_image(src);
                let dst_raw = interface.raw_image(dst);
                let region = vk::ImageCopy::default()
                    .src_subresource(vk::ImageSubresourceLayers::default().aspect_mask(vk::ImageAspectFlags::COLOR).layer_count(1))
                    .dst_subresource(vk::ImageSubresourceLayers::default().aspect_mask(vk::ImageAspectFlags::COLOR).layer_count(1))
                    .extent(extent);
                interface.command_list.copy_image_to_image(
                    src_raw,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            },
        )
    }

    pub fn add_clear_image(
        &mut self,
        dst: TaskImageId,
        color: vk::ClearColorValue,
        range: vk::ImageSubresourceRange,
        debug_name: impl Into<String>,
    ) -> Result<(), GpuError> {
        self.add_task(
            Vec::new(),
            vec![(dst, TaskImageAccess::TransferWrite)],
            debug_name,
            move |interface| {
                let dst_raw = interface.raw_image(dst);
                interface.command_list.clear_color_image(
                    dst_raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    color,
                    range,
                );
            },
        )
    }

    pub fn last_access(&self, id: TaskBufferId) -> bool {
        self.buffers[id.0].last_access != TaskBufferAccess::None
    }

    pub fn last_layout(&self, id: TaskImageId) -> vk::ImageLayout {
        self.images[id.0].last_layout
    }

    /// Deterministic for a fixed declaration order: walks tasks in
    /// declaration order, grouping consecutive tasks into a batch as long as
    /// none of their declared accesses conflict with the resource's last
    /// recorded access (and, for images, its last recorded layout).
    pub fn compile(&mut self) -> Result<(), GpuError> {
        self.batches.clear();

        let mut current_tasks: Vec<usize> = Vec::new();
        let mut current_memory_barrier: Option<(PipelineStageAccessFlags, PipelineStageAccessFlags)> = None;
        let mut current_image_transitions: Vec<(TaskImageId, vk::ImageLayout, vk::ImageLayout, PipelineStageAccessFlags, PipelineStageAccessFlags)> = Vec::new();

        for (task_index, task) in self.tasks.iter().enumerate() {
            let mut task_barrier: Option<(PipelineStageAccessFlags, PipelineStageAccessFlags)> = None;
            let mut task_image_transitions = Vec::new();

            for &(id, access) in &task.buffer_accesses {
                let prev = self.buffers[id.0].last_access;
                let can_join = prev.is_read_only()
                    && access.is_read_only()
                    && stage_bits_only(prev.stage_access()) == stage_bits_only(access.stage_access());
                if !can_join {
                    let (src, dst) = task_barrier.get_or_insert((PipelineStageAccessFlags::empty(), PipelineStageAccessFlags::empty()));
                    *src |= prev.stage_access();
                    *dst |= access.stage_access();
                }
            }

            for &(id, access) in &task.image_accesses {
                let prev_access = self.images[id.0].last_access;
                let prev_layout = self.images[id.0].last_layout;
                let new_layout = access.image_layout();
                let can_join = prev_access.is_read_only()
                    && access.is_read_only()
                    && stage_bits_only(prev_access.stage_access()) == stage_bits_only(access.stage_access())
                    && prev_layout == new_layout;
                if !can_join {
                    let (src, dst) = task_barrier.get_or_insert((PipelineStageAccessFlags::empty(), PipelineStageAccessFlags::empty()));
                    *src |= prev_access.stage_access();
                    *dst |= access.stage_access();
                    task_image_transitions.push((id, prev_layout, new_layout, prev_access.stage_access(), access.stage_access()));
                }
            }

            if task_barrier.is_some() && !current_tasks.is_empty() {
                self.batches.push(Batch {
                    task_indices: std::mem::take(&mut current_tasks),
                    memory_barrier: current_memory_barrier.take(),
                    image_transitions: std::mem::take(&mut current_image_transitions),
                });
            }

            if let Some((src, dst)) = task_barrier {
                let (cur_src, cur_dst) = current_memory_barrier.get_or_insert((PipelineStageAccessFlags::empty(), PipelineStageAccessFlags::empty()));
                *cur_src |= src;
                *cur_dst |= dst;
                current_image_transitions.extend(task_image_transitions);
            }
            current_tasks.push(task_index);

            for &(id, access) in &task.buffer_accesses {
                self.buffers[id.0].last_access = access;
            }
            for &(id, access) in &task.image_accesses {
                self.images[id.0].last_access = access;
                self.images[id.0].last_layout = access.image_layout();
            }
        }

        if !current_tasks.is_empty() {
            self.batches.push(Batch {
                task_indices: current_tasks,
                memory_barrier: current_memory_barrier,
                image_transitions: current_image_transitions,
            });
        }

        Ok(())
    }

    /// Walks the compiled batches, resolving each virtual resource via its
    /// fetch callback, and for each batch records one fresh `CommandList`
    /// carrying its synthesized barrier plus each task's callback. The
    /// completed lists accumulate for `command_lists()` to drain.
    pub fn execute(&mut self) -> anyhow::Result<()> {
        let device = self
            .device
            .clone()
            .expect("execute: TaskList has no device (built via new_headless)");

        let buffer_ids: Vec<BufferId> = self.buffers.iter().map(|b| (b.fetch_callback)()).collect();
        let image_ids: Vec<ImageId> = self.images.iter().map(|i| (i.fetch_callback)()).collect();

        for (batch_index, batch) in self.batches.iter().enumerate() {
            let mut command_list =
                CommandList::new(&device, format!("{}/batch{batch_index}", self.debug_name))?;

            if let Some((src, dst)) = batch.memory_barrier {
                if !batch.image_transitions.is_empty() {
                    for (id, old_layout, new_layout, t_src, t_dst) in &batch.image_transitions {
                        let raw_image = {
                            let resources = device.resources.read();
                            resources.raw_image(image_ids[id.0])
                        };
                        command_list.pipeline_image_barrier(&ImageBarrierInfo {
                            src: *t_src,
                            dst: *t_dst,
                            old_layout: *old_layout,
                            new_layout: *new_layout,
                            image: raw_image,
                            range: vk::ImageSubresourceRange::default()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .level_count(1)
                                .layer_count(1),
                        });
                    }
                } else {
                    command_list.pipeline_barrier(&MemoryBarrierInfo { src, dst });
                }
            }

            for &task_index in &batch.task_indices {
                let task = &mut self.tasks[task_index];
                let mut interface = TaskInterface {
                    command_list: &mut command_list,
                    device: &device,
                    buffer_ids: &buffer_ids,
                    image_ids: &image_ids,
                };
                (task.callback)(&mut interface);
            }

            self.command_lists.push(command_list.complete()?);
        }

        Ok(())
    }

    /// Drains the command lists accumulated by the most recent `execute()`
    /// call, ready for `Device::submit_commands`.
    pub fn command_lists(&mut self) -> Vec<CompletedCommandList> {
        std::mem::take(&mut self.command_lists)
    }

    pub fn output_graphviz(&self) -> String {
        let mut out = String::from("digraph task_list {\n");
        for (batch_index, batch) in self.batches.iter().enumerate() {
            out.push_str(&format!("  subgraph cluster_{batch_index} {{\n"));
            for &task_index in &batch.task_indices {
                out.push_str(&format!(
                    "    \"{}\";\n",
                    self.tasks[task_index].debug_name.replace('"', "'")
                ));
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_consecutive_read_only_tasks_share_a_batch() {
        // Pure scheduling logic test: exercised via the access/layout
        // derivation helpers directly, since building a TaskList needs a
        // live Device.
        let prev = TaskBufferAccess::ShaderRead;
        let next = TaskBufferAccess::ShaderRead;
        assert!(prev.is_read_only() && next.is_read_only());
        assert_eq!(
            stage_bits_only(prev.stage_access()),
            stage_bits_only(next.stage_access())
        );
    }

    #[test]
    fn write_then_read_requires_barrier() {
        let write = TaskBufferAccess::ShaderWrite;
        let read = TaskBufferAccess::ShaderRead;
        assert!(!write.is_read_only());
        assert!(read.is_read_only());
    }

    #[test]
    fn image_access_layouts_match_spec_table() {
        assert_eq!(TaskImageAccess::ShaderRead.image_layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(TaskImageAccess::TransferWrite.image_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(TaskImageAccess::ColorAttachment.image_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(TaskImageAccess::Present.image_layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(TaskImageAccess::None.image_layout(), vk::ImageLayout::UNDEFINED);
    }

    // The following exercise `TaskList` itself (via `new_headless`, which
    // needs no live device) rather than its helper enums, covering the
    // compiled-batch/barrier shape the end-to-end scenarios describe.
    // Invoking task callbacks requires a real `CommandList`, which in turn
    // requires a real device to create its command pool, so the host-buffer
    // side effect of running a batch is not reproduced here; what's checked
    // is the batch/barrier plan `execute()` would carry out against it.

    #[test]
    fn empty_task_list_compiles_with_no_batches() {
        let mut list = TaskList::new_headless("empty");
        list.compile().unwrap();
        assert!(list.batches.is_empty());
    }

    #[test]
    fn two_host_only_tasks_join_one_batch_in_declaration_order() {
        let mut list = TaskList::new_headless("hello");
        list.add_task(Vec::new(), Vec::new(), "say_hello", |_| {}).unwrap();
        list.add_task(Vec::new(), Vec::new(), "say_world", |_| {}).unwrap();
        list.compile().unwrap();

        assert_eq!(list.batches.len(), 1);
        assert_eq!(list.batches[0].task_indices, vec![0, 1]);
        assert!(list.batches[0].memory_barrier.is_none());
    }

    #[test]
    fn write_then_read_buffer_dependency_compiles_to_two_batches_with_a_barrier() {
        let mut list = TaskList::new_headless("war");
        let buffer = list.create_task_buffer(|| BufferId(crate::types::GenerationalId::new(0, 0)), "buf");
        list.add_task(vec![(buffer, TaskBufferAccess::ShaderWrite)], Vec::new(), "write", |_| {})
            .unwrap();
        list.add_task(vec![(buffer, TaskBufferAccess::ShaderRead)], Vec::new(), "read", |_| {})
            .unwrap();
        list.compile().unwrap();

        assert_eq!(list.batches.len(), 2);
        let (src, dst) = list.batches[1]
            .memory_barrier
            .expect("expected a barrier between the write and the read");
        assert!(src.contains(PipelineStageAccessFlags::COMPUTE_SHADER));
        assert!(dst.contains(PipelineStageAccessFlags::READ));
    }

    #[test]
    fn transfer_write_access_updates_last_layout_to_transfer_dst() {
        let mut list = TaskList::new_headless("upload");
        let image = list.create_task_image(
            || ImageId(crate::types::GenerationalId::new(0, 0)),
            vk::ImageLayout::UNDEFINED,
            "img",
        );
        list.add_task(Vec::new(), vec![(image, TaskImageAccess::TransferWrite)], "upload", |_| {})
            .unwrap();
        list.compile().unwrap();

        assert_eq!(list.last_layout(image), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
}
