// Command submission unit
//
// Records a payload into a slot's list, bracketed by the image transitions
// present -> render target -> present, closes it and hands it to the queue.
// The per-slot list lifecycle is enforced here; any violation is fatal.

use std::marker::PhantomData;

use super::{CommandRecorder, ImageState};
use crate::error::{FrameError, FrameResult};

/// Lifecycle of one slot's command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Never opened
    Idle,
    Recording,
    /// Closed, ready to execute
    Closed,
    /// Executed; must be reopened through `prepare` before reuse
    Submitted,
}

/// The draw work recorded between the mandatory transitions.
pub trait Payload<R: ?Sized, I> {
    fn record(&mut self, recorder: &mut R, slot: usize, target: &I) -> FrameResult<()>;
}

/// Clear the whole render target to one color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearPayload {
    pub color: [f32; 4],
}

impl<R, I> Payload<R, I> for ClearPayload
where
    R: CommandRecorder<I> + ?Sized,
{
    fn record(&mut self, recorder: &mut R, slot: usize, target: &I) -> FrameResult<()> {
        recorder.clear(slot, target, self.color)
    }
}

pub struct CommandSubmitter<R, I> {
    recorder: R,
    lists: Box<[ListState]>,
    _image: PhantomData<fn(&I)>,
}

impl<R, I> CommandSubmitter<R, I>
where
    R: CommandRecorder<I>,
{
    pub fn new(recorder: R, slot_count: usize) -> Self {
        Self {
            recorder,
            lists: vec![ListState::Idle; slot_count].into_boxed_slice(),
            _image: PhantomData,
        }
    }

    pub fn state(&self, slot: usize) -> FrameResult<ListState> {
        let count = self.lists.len();
        self.lists
            .get(slot)
            .copied()
            .ok_or(FrameError::SlotOutOfRange { index: slot, count })
    }

    fn set_state(&mut self, slot: usize, state: ListState) {
        self.lists[slot] = state;
    }

    /// Reset the slot's allocator and reopen its list.
    ///
    /// Only call once the slot's watermark has completed.
    pub fn open(&mut self, slot: usize) -> FrameResult<()> {
        match self.state(slot)? {
            ListState::Idle | ListState::Submitted => {}
            other => {
                return Err(FrameError::Usage(format!(
                    "slot {} reopened while {:?}",
                    slot, other
                )))
            }
        }

        self.recorder.reset(slot)?;
        self.set_state(slot, ListState::Recording);
        Ok(())
    }

    /// Record `payload` against `image`, close the list and submit it.
    pub fn record_and_submit<P>(&mut self, slot: usize, image: &I, payload: &mut P) -> FrameResult<()>
    where
        P: Payload<R, I> + ?Sized,
    {
        self.expect_state(slot, ListState::Recording, "record into")?;

        self.recorder
            .transition(slot, image, ImageState::Present, ImageState::RenderTarget)?;
        payload.record(&mut self.recorder, slot, image)?;
        self.recorder
            .transition(slot, image, ImageState::RenderTarget, ImageState::Present)?;

        self.close(slot)?;
        self.execute(slot, image)
    }

    pub fn close(&mut self, slot: usize) -> FrameResult<()> {
        self.expect_state(slot, ListState::Recording, "close")?;
        self.recorder.close(slot)?;
        self.set_state(slot, ListState::Closed);
        Ok(())
    }

    pub fn execute(&mut self, slot: usize, image: &I) -> FrameResult<()> {
        self.expect_state(slot, ListState::Closed, "execute")?;
        self.recorder.execute(slot, image)?;
        self.set_state(slot, ListState::Submitted);
        Ok(())
    }

    fn expect_state(&self, slot: usize, expected: ListState, action: &str) -> FrameResult<()> {
        let state = self.state(slot)?;
        if state != expected {
            return Err(FrameError::Usage(format!(
                "cannot {} slot {} list while {:?}",
                action, slot, state
            )));
        }
        Ok(())
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }
}
