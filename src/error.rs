//! Error types for the frame synchronization core.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the presentation core and its backends.
///
/// Everything except [`FrameError::Stall`] is fatal at this layer: there is no
/// degraded mode for a failed submission, so callers should tear down.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A bounded fence wait expired before the GPU reached the value.
    #[error("GPU stall: fence value {value} not reached within {timeout:?} (completed {completed})")]
    Stall {
        value: u64,
        completed: u64,
        timeout: Duration,
    },

    /// The presentation engine did not hand out an image in time.
    #[error("GPU stall: no swapchain image within {timeout:?}")]
    AcquireStall { timeout: Duration },

    /// Caller misuse: list lifecycle violations, too few slots, tick after shutdown
    #[error("Usage error: {0}")]
    Usage(String),

    /// Slot index outside the fixed slot table
    #[error("Slot index {index} out of range (slot count {count})")]
    SlotOutOfRange { index: usize, count: usize },

    /// Swapchain no longer matches the surface; rebuild before acquiring again
    #[error("Swapchain out of date")]
    OutOfDate,

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    Swapchain(String),

    /// Device or queue failure reported by a non-Vulkan backend
    #[error("Device error: {0}")]
    Device(String),
}

impl FrameError {
    /// True for wait timeouts, the only condition a caller may choose to ride out.
    pub fn is_stall(&self) -> bool {
        matches!(
            self,
            FrameError::Stall { .. } | FrameError::AcquireStall { .. }
        )
    }
}

/// Result type alias for frame operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;
