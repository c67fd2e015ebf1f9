// Command recording
//
// One transient command pool (the slot's allocator) and one primary
// command buffer per frame slot. Pools are reset wholesale once the
// presenter has confirmed the slot's watermark completed.

use ash::vk;
use std::sync::Arc;

use super::swapchain::{color_subresource_range, SwapImage};
use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};
use crate::frame::{CommandRecorder, ImageState};

pub struct FrameCommands {
    pools: Vec<vk::CommandPool>,
    buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl FrameCommands {
    pub fn new(device: Arc<VulkanDevice>, slot_count: usize) -> FrameResult<Self> {
        let mut commands = Self {
            pools: Vec::with_capacity(slot_count),
            buffers: Vec::with_capacity(slot_count),
            device,
        };

        for _ in 0..slot_count {
            // TRANSIENT: re-recorded every frame
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(commands.device.graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = unsafe { commands.device.device.create_command_pool(&pool_info, None)? };
            commands.pools.push(pool);

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { commands.device.device.allocate_command_buffers(&alloc_info)? };
            commands.buffers.push(buffers[0]);
        }

        log::info!("Created {} per-slot command pools", slot_count);
        Ok(commands)
    }

    fn buffer(&self, slot: usize) -> FrameResult<vk::CommandBuffer> {
        self.buffers.get(slot).copied().ok_or(FrameError::SlotOutOfRange {
            index: slot,
            count: self.buffers.len(),
        })
    }
}

/// Layout plus the access/stage pair a barrier needs for each side.
fn barrier_params(state: ImageState, as_source: bool) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match (state, as_source) {
        // Swap images are fully cleared every frame; old contents are discarded
        (ImageState::Present, true) => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        (ImageState::Present, false) => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        (ImageState::RenderTarget, true) => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (ImageState::RenderTarget, false) => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
    }
}

impl CommandRecorder<SwapImage> for FrameCommands {
    fn reset(&mut self, slot: usize) -> FrameResult<()> {
        let cmd = self.buffer(slot)?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .device
                .reset_command_pool(self.pools[slot], vk::CommandPoolResetFlags::empty())?;
            self.device.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn transition(
        &mut self,
        slot: usize,
        image: &SwapImage,
        before: ImageState,
        after: ImageState,
    ) -> FrameResult<()> {
        let cmd = self.buffer(slot)?;
        let (old_layout, src_access, src_stage) = barrier_params(before, true);
        let (new_layout, dst_access, dst_stage) = barrier_params(after, false);

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(color_subresource_range())
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    }

    fn clear(&mut self, slot: usize, image: &SwapImage, color: [f32; 4]) -> FrameResult<()> {
        let cmd = self.buffer(slot)?;

        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(image.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            })
            .build()];

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: image.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            self.device.device.cmd_begin_rendering(cmd, &rendering_info);
            self.device.device.cmd_end_rendering(cmd);
        }
        Ok(())
    }

    fn close(&mut self, slot: usize) -> FrameResult<()> {
        let cmd = self.buffer(slot)?;
        unsafe { self.device.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn execute(&mut self, slot: usize, image: &SwapImage) -> FrameResult<()> {
        let command_buffers = [self.buffer(slot)?];
        let signal_semaphores = [image.render_finished];

        // Completion is tracked by the timeline fence signaled after present
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                vk::Fence::null(),
            )?;
        }
        Ok(())
    }
}

impl Drop for FrameCommands {
    fn drop(&mut self) {
        unsafe {
            // Destroying a pool frees its command buffers
            for &pool in &self.pools {
                self.device.device.destroy_command_pool(pool, None);
            }
        }
    }
}
