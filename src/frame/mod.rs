// Frame synchronization core
//
// Backend-agnostic CPU/GPU lockstep: fence timeline, slot table,
// command submission, presentation cycle and resize/flush control.
// Backends plug in through the three traits below.

pub mod fence;
pub mod presenter;
pub mod resize;
pub mod slots;
pub mod submit;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::time::Duration;

use crate::error::FrameResult;

pub use fence::FenceTimeline;
pub use presenter::{CycleState, FrameReport, PresentationFlags, Presenter, PresenterOptions};
pub use resize::Extent;
pub use slots::{FrameSlot, FrameSlotTable};
pub use submit::{ClearPayload, CommandSubmitter, ListState, Payload};

/// GPU-signaled monotonic counter.
pub trait GpuFence {
    /// Ask the queue to set the fence to `value` once all prior work is done.
    fn signal(&mut self, value: u64) -> FrameResult<()>;

    /// Highest value the GPU has reached.
    fn completed_value(&self) -> FrameResult<u64>;

    /// Block until `completed_value() >= value`. `None` waits forever.
    /// Returns `false` if the timeout elapsed first.
    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> FrameResult<bool>;
}

/// Layout an image is in from the queue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Present,
    RenderTarget,
}

/// How the next present should be synchronized with the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    /// Wait for vertical blank (FIFO)
    Vsync,
    /// Present as soon as possible; `tearing` allows IMMEDIATE-style output
    Unsynced { tearing: bool },
}

/// Result of handing a frame to the presentation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Frame was queued, but the swapchain no longer matches the surface or
    /// the requested mode and must be rebuilt before it is used again.
    Stale,
}

/// Presentation engine owning the multi-buffered images.
pub trait Swapchain {
    type Image: Clone + PartialEq + fmt::Debug;

    fn image_count(&self) -> usize;

    fn extent(&self) -> Extent;

    /// Index of the image the presentation engine wants rendered next.
    /// Not guaranteed to be sequential.
    fn current_image_index(&mut self) -> FrameResult<usize>;

    fn image(&self, index: usize) -> FrameResult<Self::Image>;

    fn present(&mut self, mode: PresentMode) -> FrameResult<PresentOutcome>;

    /// Recreate the backing images at a new size, keeping format and flags.
    fn resize_images(&mut self, width: u32, height: u32) -> FrameResult<()>;
}

/// Per-slot command recording and queue submission.
///
/// Each slot owns one allocator and one list; the caller guarantees
/// `reset` is only called once the GPU is done with the slot.
pub trait CommandRecorder<I> {
    /// Reset the slot's allocator and reopen its list for recording.
    fn reset(&mut self, slot: usize) -> FrameResult<()>;

    fn transition(
        &mut self,
        slot: usize,
        image: &I,
        before: ImageState,
        after: ImageState,
    ) -> FrameResult<()>;

    fn clear(&mut self, slot: usize, image: &I, color: [f32; 4]) -> FrameResult<()>;

    fn close(&mut self, slot: usize) -> FrameResult<()>;

    /// Submit the closed list to the queue.
    fn execute(&mut self, slot: usize, image: &I) -> FrameResult<()>;
}
