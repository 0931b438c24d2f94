//! Binary and timeline semaphore wrappers.
//!
//! The timeline-value accessors are the surface the submit/wait model in
//! the task graph and present loop needs on top of a plain semaphore
//! handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ash::vk;

use super::device::DeviceShared;

pub struct BinarySemaphore {
    pub(crate) raw: vk::Semaphore,
    device: Arc<DeviceShared>,
}

impl BinarySemaphore {
    pub(crate) fn new(device: Arc<DeviceShared>) -> anyhow::Result<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe { device.raw.create_semaphore(&info, None) }
            .context("failed to create binary semaphore")?;
        Ok(Self { raw, device })
    }

    /// Wraps an already-created (and already-unsignaled) semaphore handle
    /// popped from the device's recyclable pool.
    pub(crate) fn from_raw(device: Arc<DeviceShared>, raw: vk::Semaphore) -> Self {
        Self { raw, device }
    }
}

impl Drop for BinarySemaphore {
    fn drop(&mut self) {
        // May still be referenced by in-flight GPU work (e.g. a pending
        // present wait), so retirement goes through the zombie queue rather
        // than destroying immediately; `collect_garbage` recycles it once
        // the GPU timeline catches up.
        let t = self.device.cpu_timeline_value();
        self.device.push_binary_semaphore_zombie(t, self.raw);
    }
}

pub struct TimelineSemaphore {
    pub(crate) raw: vk::Semaphore,
    device: Arc<DeviceShared>,
}

impl TimelineSemaphore {
    pub(crate) fn new(device: Arc<DeviceShared>, initial_value: u64) -> anyhow::Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let raw = unsafe { device.raw.create_semaphore(&info, None) }
            .context("failed to create timeline semaphore")?;
        Ok(Self { raw, device })
    }

    pub fn value(&self) -> anyhow::Result<u64> {
        unsafe { self.device.raw.get_semaphore_counter_value(self.raw) }
            .context("failed to query timeline semaphore counter")
    }

    pub fn set_value(&self, value: u64) -> anyhow::Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.raw)
            .value(value);
        unsafe { self.device.raw.signal_semaphore(&signal_info) }
            .context("failed to signal timeline semaphore")
    }

    pub fn wait_for_value(&self, value: u64, timeout: Duration) -> anyhow::Result<bool> {
        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe {
            self.device
                .raw
                .wait_semaphores(&wait_info, timeout.as_nanos() as u64)
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err).context("failed waiting on timeline semaphore"),
        }
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_semaphore(self.raw, None) };
    }
}
