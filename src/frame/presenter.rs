// Presentation cycle
//
// One tick = Idle -> Recording -> Submitted -> Presented -> Idle.
//
// ┌──────────────────────────────────────────────────────────────────────┐
// │ prepare(slot) ─> record+submit ─> present ─> signal ─> mark(slot)    │
// │                                               └─> query next slot    │
// │                                                   └─> wait(next)     │
// └──────────────────────────────────────────────────────────────────────┘
//
// Present goes out before the frame's fence signal, and the eager wait on
// the next slot caps the CPU at N-1 frames ahead of the GPU.

use std::time::Duration;

use super::{
    ClearPayload, CommandRecorder, CommandSubmitter, Extent, FenceTimeline, FrameSlotTable,
    GpuFence, Payload, PresentMode, PresentOutcome, Swapchain,
};
use crate::error::{FrameError, FrameResult};

/// Used for the best-effort flush on drop when no stall timeout is configured.
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Recording,
    Submitted,
    Presented,
}

/// Presentation mode flags, flipped by user input and read at present time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFlags {
    pub vsync: bool,
    /// Detected once at startup
    pub tearing_allowed: bool,
    pub fullscreen: bool,
}

impl PresentationFlags {
    pub fn present_mode(&self) -> PresentMode {
        if self.vsync {
            PresentMode::Vsync
        } else {
            PresentMode::Unsynced {
                tearing: self.tearing_allowed,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenterOptions {
    /// Slot count N; the swapchain must have exactly this many images.
    pub frames_in_flight: usize,
    /// Bound for steady-state waits. `None` waits forever.
    pub stall_timeout: Option<Duration>,
    pub vsync: bool,
    pub tearing_supported: bool,
    pub clear_color: [f32; 4],
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: usize,
    pub fence_value: u64,
    /// `None` when the swapchain went out of date; the next tick rebuilds.
    pub next_slot: Option<usize>,
    pub outcome: PresentOutcome,
}

pub struct Presenter<F, S, R>
where
    F: GpuFence,
    S: Swapchain,
    R: CommandRecorder<S::Image>,
{
    pub(super) fence: FenceTimeline<F>,
    pub(super) slots: FrameSlotTable<S::Image>,
    pub(super) submitter: CommandSubmitter<R, S::Image>,
    pub(super) swapchain: S,
    pub(super) current_slot: usize,
    pub(super) state: CycleState,
    pub(super) flags: PresentationFlags,
    /// Last requested (clamped) size; resize compares against this.
    pub(super) extent: Extent,
    pub(super) needs_rebuild: bool,
    /// The last acquire failed with a stall; the next tick retries it.
    pub(super) pending_acquire: bool,
    stall_timeout: Option<Duration>,
    clear_color: [f32; 4],
    frames_presented: u64,
    shut_down: bool,
}

impl<F, S, R> Presenter<F, S, R>
where
    F: GpuFence,
    S: Swapchain,
    R: CommandRecorder<S::Image>,
{
    pub fn new(fence: F, mut swapchain: S, recorder: R, options: PresenterOptions) -> FrameResult<Self> {
        let slot_count = options.frames_in_flight;
        let mut slots = FrameSlotTable::new(slot_count)?;

        if swapchain.image_count() != slot_count {
            return Err(FrameError::Swapchain(format!(
                "swapchain has {} images, expected {}",
                swapchain.image_count(),
                slot_count
            )));
        }

        let current_slot = check_slot(swapchain.current_image_index()?, slot_count)?;
        slots.bind_images(|index| swapchain.image(index))?;
        let extent = swapchain.extent();

        log::info!(
            "Presenter ready: {} slots, {}x{}, starting at slot {}",
            slot_count,
            extent.width,
            extent.height,
            current_slot
        );

        Ok(Self {
            fence: FenceTimeline::new(fence),
            slots,
            submitter: CommandSubmitter::new(recorder, slot_count),
            swapchain,
            current_slot,
            state: CycleState::Idle,
            flags: PresentationFlags {
                vsync: options.vsync,
                tearing_allowed: options.tearing_supported,
                fullscreen: false,
            },
            extent,
            needs_rebuild: false,
            pending_acquire: false,
            stall_timeout: options.stall_timeout,
            clear_color: options.clear_color,
            frames_presented: 0,
            shut_down: false,
        })
    }

    /// Run one full cycle with the default clear payload.
    pub fn tick(&mut self) -> FrameResult<FrameReport> {
        let mut payload = ClearPayload {
            color: self.clear_color,
        };
        self.tick_with(&mut payload)
    }

    /// Run one full cycle recording `payload`.
    ///
    /// A stall error leaves the slot bookkeeping consistent; calling `tick`
    /// again resumes waiting where it left off.
    pub fn tick_with<P>(&mut self, payload: &mut P) -> FrameResult<FrameReport>
    where
        P: Payload<R, S::Image> + ?Sized,
    {
        if self.shut_down {
            return Err(FrameError::Usage("tick after shutdown".into()));
        }

        if self.needs_rebuild {
            self.rebuild(self.extent)?;
            if self.needs_rebuild {
                return Err(FrameError::OutOfDate);
            }
        }

        if self.pending_acquire && self.acquire_next_slot()?.is_none() {
            return Err(FrameError::OutOfDate);
        }

        let slot = self.current_slot;
        let timeout = self.stall_timeout;

        // Idle -> Recording
        let submitter = &mut self.submitter;
        self.slots
            .prepare(slot, &self.fence, timeout, |index| submitter.open(index))?;
        self.state = CycleState::Recording;

        // Recording -> Submitted
        let image = self.slots.image(slot)?;
        self.submitter.record_and_submit(slot, image, payload)?;
        self.state = CycleState::Submitted;

        // Submitted -> Presented
        let outcome = self.swapchain.present(self.flags.present_mode())?;
        self.state = CycleState::Presented;
        if outcome == PresentOutcome::Stale {
            log::debug!("Swapchain stale after present, rebuilding next frame");
            self.needs_rebuild = true;
        }

        // Presented -> Idle
        let fence_value = self.fence.signal()?;
        self.slots.mark_submitted(slot, fence_value)?;
        self.frames_presented += 1;

        self.state = CycleState::Idle;
        let Some(next_slot) = self.acquire_next_slot()? else {
            log::debug!("Swapchain out of date after frame {}", fence_value);
            return Ok(FrameReport {
                slot,
                fence_value,
                next_slot: None,
                outcome,
            });
        };

        log::trace!(
            "Frame {} presented from slot {}, next slot {}",
            fence_value,
            slot,
            next_slot
        );

        self.slots.wait_for_slot(next_slot, &self.fence, timeout)?;

        Ok(FrameReport {
            slot,
            fence_value,
            next_slot: Some(next_slot),
            outcome,
        })
    }

    /// Ask the swapchain for the next image and make its slot current.
    ///
    /// `None` means the swapchain went out of date and a rebuild is queued.
    /// On any error the acquire stays pending so the next tick retries it
    /// instead of reusing the slot that was just submitted.
    fn acquire_next_slot(&mut self) -> FrameResult<Option<usize>> {
        self.pending_acquire = true;
        let index = match self.swapchain.current_image_index() {
            Ok(index) => index,
            Err(FrameError::OutOfDate) => {
                self.pending_acquire = false;
                self.needs_rebuild = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.pending_acquire = false;
        self.current_slot = check_slot(index, self.slots.len())?;
        Ok(Some(self.current_slot))
    }

    pub fn on_resize(&mut self, width: u32, height: u32) -> FrameResult<bool> {
        self.resize(width, height)
    }

    /// Flip fullscreen and return the new state. Window chrome is the
    /// caller's job; the resize it triggers arrives through `on_resize`.
    pub fn on_toggle_fullscreen(&mut self) -> bool {
        let enabled = !self.flags.fullscreen;
        self.set_fullscreen(enabled);
        enabled
    }

    pub fn on_present_mode_changed(&mut self, vsync: bool) {
        if self.flags.vsync != vsync {
            log::info!("VSync {}", if vsync { "enabled" } else { "disabled" });
        }
        self.flags.vsync = vsync;
    }

    /// Drain the GPU; the presenter cannot tick afterwards.
    pub fn shutdown(&mut self) -> FrameResult<()> {
        if self.shut_down {
            return Ok(());
        }
        let value = self.flush()?;
        self.shut_down = true;
        log::info!(
            "Presenter shut down after {} frames (fence {})",
            self.frames_presented,
            value
        );
        Ok(())
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn flags(&self) -> PresentationFlags {
        self.flags
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn fence(&self) -> &FenceTimeline<F> {
        &self.fence
    }

    pub fn slots(&self) -> &FrameSlotTable<S::Image> {
        &self.slots
    }

    pub fn submitter(&self) -> &CommandSubmitter<R, S::Image> {
        &self.submitter
    }

    pub fn swapchain(&self) -> &S {
        &self.swapchain
    }
}

impl<F, S, R> Drop for Presenter<F, S, R>
where
    F: GpuFence,
    S: Swapchain,
    R: CommandRecorder<S::Image>,
{
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }

        // Best effort: never destroy slot resources under in-flight work
        let timeout = self.stall_timeout.unwrap_or(DROP_FLUSH_TIMEOUT);
        let result = self
            .fence
            .signal()
            .and_then(|value| self.fence.wait_until(value, Some(timeout)));
        if let Err(e) = result {
            log::error!("Flush on drop failed: {}", e);
        }
    }
}

pub(super) fn check_slot(index: usize, count: usize) -> FrameResult<usize> {
    if index >= count {
        return Err(FrameError::SlotOutOfRange { index, count });
    }
    Ok(index)
}
