// Synchronization primitives
//
// A timeline semaphore is the fence: the queue signals increasing values,
// the host reads the counter and blocks in vkWaitSemaphores (driver-level
// wait, no spinning).

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::swapchain::timeout_ns;
use super::VulkanDevice;
use crate::error::FrameResult;
use crate::frame::GpuFence;

pub struct TimelineFence {
    semaphore: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl TimelineFence {
    pub fn new(device: Arc<VulkanDevice>) -> FrameResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.device.create_semaphore(&create_info, None)? };

        Ok(Self { semaphore, device })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl GpuFence for TimelineFence {
    fn signal(&mut self, value: u64) -> FrameResult<()> {
        // Empty submission: executes after everything queued before it
        let signal_values = [value];
        let signal_semaphores = [self.semaphore];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )?;
        }
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<u64> {
        let value = unsafe { self.device.device.get_semaphore_counter_value(self.semaphore)? };
        Ok(value)
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> FrameResult<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
