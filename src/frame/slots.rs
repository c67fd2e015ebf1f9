// Frame slot table
//
// N fixed slots, one per swapchain image. Each slot's allocator may only be
// reset once the GPU has passed the slot's watermark; that check is the
// system's only backpressure point and its only mutual exclusion.

use std::time::Duration;

use super::{FenceTimeline, GpuFence};
use crate::error::{FrameError, FrameResult};

/// One buffering unit: allocator (owned by the recorder, addressed by
/// `index`), the swapchain image it renders to, and its watermark.
#[derive(Debug)]
pub struct FrameSlot<I> {
    index: usize,
    /// Tracked, not owned: the swapchain owns the image.
    image: Option<I>,
    /// Fence value that must complete before this slot is reused.
    required_fence_value: u64,
}

impl<I> FrameSlot<I> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn image(&self) -> Option<&I> {
        self.image.as_ref()
    }

    pub fn required_fence_value(&self) -> u64 {
        self.required_fence_value
    }
}

pub struct FrameSlotTable<I> {
    slots: Box<[FrameSlot<I>]>,
}

impl<I> FrameSlotTable<I> {
    /// Create `count` empty slots. The table never grows.
    pub fn new(count: usize) -> FrameResult<Self> {
        if count < 2 {
            return Err(FrameError::Usage(format!(
                "at least 2 frame slots required, got {}",
                count
            )));
        }

        let slots = (0..count)
            .map(|index| FrameSlot {
                index,
                image: None,
                required_fence_value: 0,
            })
            .collect();

        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> FrameResult<&FrameSlot<I>> {
        let count = self.slots.len();
        self.slots
            .get(index)
            .ok_or(FrameError::SlotOutOfRange { index, count })
    }

    fn get_mut(&mut self, index: usize) -> FrameResult<&mut FrameSlot<I>> {
        let count = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(FrameError::SlotOutOfRange { index, count })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot<I>> {
        self.slots.iter()
    }

    /// Image bound to the slot; unbound slots are a usage error.
    pub fn image(&self, index: usize) -> FrameResult<&I> {
        self.get(index)?.image.as_ref().ok_or_else(|| {
            FrameError::Usage(format!("slot {} has no presentable image bound", index))
        })
    }

    /// Wait for the slot's previous use to finish, then reset its allocator.
    ///
    /// `reset` runs only after the watermark has been reached. On a stall
    /// the slot is left untouched.
    pub fn prepare<F, R>(
        &mut self,
        index: usize,
        fence: &FenceTimeline<F>,
        timeout: Option<Duration>,
        reset: R,
    ) -> FrameResult<()>
    where
        F: GpuFence,
        R: FnOnce(usize) -> FrameResult<()>,
    {
        self.wait_for_slot(index, fence, timeout)?;
        reset(index)
    }

    /// Block until the GPU is done with everything guarded by the slot.
    pub fn wait_for_slot<F: GpuFence>(
        &self,
        index: usize,
        fence: &FenceTimeline<F>,
        timeout: Option<Duration>,
    ) -> FrameResult<()> {
        let required = self.get(index)?.required_fence_value;
        fence.wait_until(required, timeout)
    }

    /// Record the fence value now guarding the slot's resources.
    pub fn mark_submitted(&mut self, index: usize, fence_value: u64) -> FrameResult<()> {
        let slot = self.get_mut(index)?;
        debug_assert!(
            fence_value >= slot.required_fence_value,
            "watermark moved backwards on slot {}",
            index
        );
        slot.required_fence_value = fence_value;
        Ok(())
    }

    /// Drop every image reference so the swapchain can recreate its buffers.
    pub fn release_images(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.image = None;
        }
    }

    /// Rebind every slot to the swapchain image with the same index.
    pub fn bind_images<B>(&mut self, mut image_for: B) -> FrameResult<()>
    where
        B: FnMut(usize) -> FrameResult<I>,
    {
        for slot in self.slots.iter_mut() {
            slot.image = Some(image_for(slot.index)?);
        }
        Ok(())
    }

    /// Set every watermark to `completed`. Only valid right after a drain,
    /// when all prior work is known to be finished.
    pub fn normalize_watermarks(&mut self, completed: u64) {
        for slot in self.slots.iter_mut() {
            slot.required_fence_value = completed;
        }
    }
}
