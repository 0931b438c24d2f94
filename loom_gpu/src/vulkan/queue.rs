//! Single main-queue submission primitive.
//!
//! Builds a `vkQueueSubmit2`/`VkSubmitInfo2` batch from command buffers plus
//! wait/signal semaphore descriptors (binary or timeline, distinguished by
//! whether a counter value is present).

use anyhow::Context as _;
use ash::vk;

pub struct QueueSubmitSemaphoreDescriptor {
    pub semaphore: vk::Semaphore,
    pub stage_mask: vk::PipelineStageFlags2,
    /// `None` for binary semaphores, `Some(value)` for timeline semaphores.
    pub value: Option<u64>,
}

pub struct Queue {
    device: ash::Device,
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
}

impl Queue {
    pub(crate) fn new(device: ash::Device, raw: vk::Queue, family_index: u32) -> Self {
        Self {
            device,
            raw,
            family_index,
        }
    }

    pub fn submit_command_buffers(
        &self,
        command_buffers: &[vk::CommandBuffer],
        waits: &[QueueSubmitSemaphoreDescriptor],
        signals: &[QueueSubmitSemaphoreDescriptor],
        fence: vk::Fence,
    ) -> anyhow::Result<()> {
        let command_buffer_infos: Vec<_> = command_buffers
            .iter()
            .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(*cb))
            .collect();

        let wait_infos: Vec<_> = waits.iter().map(semaphore_submit_info).collect();
        let signal_infos: Vec<_> = signals.iter().map(semaphore_submit_info).collect();

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        unsafe {
            self.device
                .queue_submit2(self.raw, &[submit_info], fence)
        }
        .context("failed to submit command buffers")
    }

    pub fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe { self.device.queue_wait_idle(self.raw) }.context("failed to wait queue idle")
    }
}

fn semaphore_submit_info(descriptor: &QueueSubmitSemaphoreDescriptor) -> vk::SemaphoreSubmitInfo<'static> {
    let mut info = vk::SemaphoreSubmitInfo::default()
        .semaphore(descriptor.semaphore)
        .stage_mask(descriptor.stage_mask);
    if let Some(value) = descriptor.value {
        info = info.value(value);
    }
    info
}
