// Resize/flush controller
//
// Anything that invalidates slot resources goes through a full drain first.
// After the drain every watermark is stale, so all of them are normalized to
// the value the drain reached.

use super::presenter::check_slot;
use super::{CommandRecorder, GpuFence, Presenter, Swapchain};
use crate::error::{FrameError, FrameResult};

/// Swapchain size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Degenerate (minimized) sizes become 1 pixel.
    pub fn clamped(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl<F, S, R> Presenter<F, S, R>
where
    F: GpuFence,
    S: Swapchain,
    R: CommandRecorder<S::Image>,
{
    /// Wait until every submitted frame has finished on the GPU.
    pub fn flush(&mut self) -> FrameResult<u64> {
        self.fence.drain()
    }

    /// Resize the swapchain. Returns `false` when the clamped size is
    /// unchanged and nothing was done.
    pub fn resize(&mut self, width: u32, height: u32) -> FrameResult<bool> {
        let extent = Extent::clamped(width, height);
        if extent == self.extent {
            return Ok(false);
        }

        log::info!(
            "Resizing swapchain: {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            extent.width,
            extent.height
        );
        self.rebuild(extent)?;
        Ok(true)
    }

    /// Drain, recreate the swapchain images at `extent` and rebind all slots.
    pub fn rebuild(&mut self, extent: Extent) -> FrameResult<()> {
        // Every slot's image is about to be destroyed
        let drained = self.flush()?;

        // Stays set until the rebuild fully succeeds, so a failed or stalled
        // rebuild is retried on the next tick
        self.needs_rebuild = true;
        self.slots.release_images();
        self.swapchain.resize_images(extent.width, extent.height)?;
        self.extent = extent;

        let slot_count = self.slots.len();
        if self.swapchain.image_count() != slot_count {
            return Err(FrameError::Swapchain(format!(
                "swapchain rebuilt with {} images, expected {}",
                self.swapchain.image_count(),
                slot_count
            )));
        }

        let acquired = match self.swapchain.current_image_index() {
            Ok(index) => {
                self.current_slot = check_slot(index, slot_count)?;
                true
            }
            Err(FrameError::OutOfDate) => {
                log::debug!("Swapchain out of date right after rebuild, retrying next frame");
                false
            }
            Err(e) => return Err(e),
        };

        let swapchain = &self.swapchain;
        self.slots.bind_images(|index| swapchain.image(index))?;

        let completed = self.fence.completed()?;
        debug_assert!(completed >= drained);
        self.slots.normalize_watermarks(completed);
        self.needs_rebuild = !acquired;
        self.pending_acquire = false;

        log::debug!(
            "Swapchain rebuilt at {}x{}, watermarks normalized to {}",
            extent.width,
            extent.height,
            completed
        );
        Ok(())
    }

    /// Record the fullscreen flag. No fence work: the window system follows
    /// up with a resize if the client area changes.
    pub fn set_fullscreen(&mut self, enabled: bool) -> bool {
        if self.flags.fullscreen == enabled {
            return false;
        }
        self.flags.fullscreen = enabled;
        log::info!(
            "{} fullscreen mode",
            if enabled { "Entered" } else { "Exited" }
        );
        true
    }
}
