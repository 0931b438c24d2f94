//! Thin bindings to the underlying graphics API: instance/physical-device
//! selection, queue submission, semaphores, swapchain, and the device that
//! ties them together.

pub mod device;
pub mod instance;
pub mod queue;
pub mod semaphore;
pub mod swapchain;
