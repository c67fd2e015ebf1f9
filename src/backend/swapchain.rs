// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Image count equals the frame slot count. The presentation engine picks
// the next image; we acquire it with a fence and wait on the host so the
// returned index is ready to record against, like a back-buffer index query.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};
use crate::frame::{self, Extent, PresentMode, PresentOutcome};

/// One presentable image plus the semaphore its frame's submission signals
/// and its present waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapImage {
    pub index: u32,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub render_finished: vk::Semaphore,
}

/// Window surface, destroyed after the swapchain built on it.
pub struct Surface {
    pub surface: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
}

impl Surface {
    pub fn new(device: &VulkanDevice, window: &Window) -> Result<Self> {
        let loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

        let surface = unsafe {
            use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
            let window_handle = window
                .window_handle()
                .context("Failed to get window handle")?
                .as_raw();
            let display_handle = window
                .display_handle()
                .context("Failed to get display handle")?
                .as_raw();

            #[cfg(target_os = "windows")]
            {
                match (display_handle, window_handle) {
                    (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                        let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0)
                            as *const std::ffi::c_void;
                        let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                        let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                            .hinstance(hinstance)
                            .hwnd(hwnd);
                        let win32_surface_loader =
                            ash::extensions::khr::Win32Surface::new(&device.entry, &device.instance);
                        win32_surface_loader.create_win32_surface(&create_info, None)?
                    }
                    _ => anyhow::bail!("Unsupported window handle type"),
                }
            }

            #[cfg(not(target_os = "windows"))]
            {
                let _ = (display_handle, window_handle);
                anyhow::bail!("Windowed Vulkan output is only supported on Windows; use headless mode")
            }
        };

        // Verify the GPU supports presenting to this surface
        let supported = unsafe {
            loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };

        if !supported {
            unsafe { loader.destroy_surface(surface, None) };
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        Ok(Self { surface, loader })
    }

    /// Present modes offered for this surface.
    pub fn present_modes(&self, device: &VulkanDevice) -> FrameResult<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(device.physical_device, self.surface)?
        };
        Ok(modes)
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    images: Vec<SwapImage>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    /// Mode the current swapchain was built with
    present_mode: vk::PresentModeKHR,
    /// Mode the presenter asked for last
    requested_mode: PresentMode,
    supported_modes: Vec<vk::PresentModeKHR>,
    image_count: u32,
    acquire_fence: vk::Fence,
    /// Bound for acquiring an image. `None` waits forever.
    acquire_timeout: Option<Duration>,
    /// Acquire issued but its fence timed out; the retry only waits
    fence_pending: Option<u32>,
    /// Acquired and not yet presented
    acquired: Option<u32>,
    stale: bool,
    surface: Surface,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: Surface,
        width: u32,
        height: u32,
        image_count: u32,
        mode: PresentMode,
        acquire_timeout: Option<Duration>,
    ) -> FrameResult<Self> {
        log::info!("Creating swapchain: {}x{}, {} images", width, height, image_count);

        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(device.physical_device, surface.surface)?
        };
        let format = choose_surface_format(&formats)
            .ok_or_else(|| FrameError::Swapchain("No suitable surface format".into()))?;
        let supported_modes = surface.present_modes(&device)?;

        let fence_info = vk::FenceCreateInfo::builder();
        let acquire_fence = unsafe { device.device.create_fence(&fence_info, None)? };

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            images: Vec::new(),
            format,
            extent: vk::Extent2D { width, height },
            present_mode: vk::PresentModeKHR::FIFO,
            requested_mode: mode,
            supported_modes,
            image_count,
            acquire_fence,
            acquire_timeout,
            fence_pending: None,
            acquired: None,
            stale: false,
            surface,
            device,
        };
        swapchain.build(width, height)?;

        Ok(swapchain)
    }

    /// True if the surface can present without waiting for vblank and
    /// without queuing (tearing allowed).
    pub fn tearing_supported(&self) -> bool {
        self.supported_modes.contains(&vk::PresentModeKHR::IMMEDIATE)
    }

    /// (Re)create the swapchain. Caller guarantees no GPU work references
    /// the old images.
    fn build(&mut self, width: u32, height: u32) -> FrameResult<()> {
        let device = self.device.clone();

        // The fence must be unsignaled before the next acquire uses it
        if self.fence_pending.take().is_some() {
            unsafe {
                device
                    .device
                    .wait_for_fences(&[self.acquire_fence], true, u64::MAX)?;
                device.device.reset_fences(&[self.acquire_fence])?;
            }
        }

        let caps = unsafe {
            self.surface
                .loader
                .get_physical_device_surface_capabilities(device.physical_device, self.surface.surface)?
        };

        let extent = choose_extent(&caps, width, height);
        let present_mode = choose_present_mode(self.requested_mode, &self.supported_modes);

        let mut min_image_count = self.image_count.max(caps.min_image_count);
        if caps.max_image_count > 0 && min_image_count > caps.max_image_count {
            min_image_count = caps.max_image_count;
        }

        let old_swapchain = self.swapchain;

        // Format, usage and flags are fixed at first creation and reused on every rebuild
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.surface)
            .min_image_count(min_image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };

        self.destroy_images();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        self.extent = extent;
        self.images = images
            .iter()
            .enumerate()
            .map(|(index, &image)| self.create_swap_image(index as u32, image))
            .collect::<FrameResult<Vec<_>>>()?;

        self.present_mode = present_mode;
        self.acquired = None;
        self.stale = false;

        log::info!(
            "Swapchain ready: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    fn create_swap_image(&self, index: u32, image: vk::Image) -> FrameResult<SwapImage> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());

        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        unsafe {
            let view = self.device.device.create_image_view(&create_info, None)?;
            let render_finished = self.device.device.create_semaphore(&semaphore_info, None)?;
            Ok(SwapImage {
                index,
                image,
                view,
                extent: self.extent,
                render_finished,
            })
        }
    }

    fn destroy_images(&mut self) {
        unsafe {
            for image in self.images.drain(..) {
                self.device.device.destroy_image_view(image.view, None);
                self.device.device.destroy_semaphore(image.render_finished, None);
            }
        }
    }
}

impl frame::Swapchain for Swapchain {
    type Image = SwapImage;

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> Extent {
        Extent::new(self.extent.width, self.extent.height)
    }

    fn current_image_index(&mut self) -> FrameResult<usize> {
        if let Some(index) = self.acquired {
            return Ok(index as usize);
        }

        let timeout = self.acquire_timeout;
        let index = match self.fence_pending {
            Some(index) => index,
            None => {
                let result = unsafe {
                    self.swapchain_loader.acquire_next_image(
                        self.swapchain,
                        timeout_ns(timeout),
                        vk::Semaphore::null(),
                        self.acquire_fence,
                    )
                };
                let (index, suboptimal) = result.map_err(|e| acquire_error(e, timeout))?;
                // Suboptimal still works; finish the frame, rebuild after present
                self.stale |= suboptimal;
                self.fence_pending = Some(index);
                index
            }
        };

        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.acquire_fence], true, timeout_ns(timeout))
                .map_err(|e| acquire_error(e, timeout))?;
            self.device.device.reset_fences(&[self.acquire_fence])?;
        }

        self.fence_pending = None;
        self.acquired = Some(index);
        Ok(index as usize)
    }

    fn image(&self, index: usize) -> FrameResult<SwapImage> {
        self.images
            .get(index)
            .copied()
            .ok_or(FrameError::SlotOutOfRange {
                index,
                count: self.images.len(),
            })
    }

    fn present(&mut self, mode: PresentMode) -> FrameResult<PresentOutcome> {
        let index = self
            .acquired
            .take()
            .ok_or_else(|| FrameError::Usage("present without an acquired image".into()))?;
        let image = self.image(index as usize)?;

        let swapchains = [self.swapchain];
        let image_indices = [index];
        let wait_semaphores = [image.render_finished];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        match result {
            Ok(suboptimal) => self.stale |= suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.stale = true,
            Err(e) => return Err(e.into()),
        }

        // Vulkan fixes the present mode at creation
        self.requested_mode = mode;
        if choose_present_mode(mode, &self.supported_modes) != self.present_mode {
            self.stale = true;
        }

        if std::mem::take(&mut self.stale) {
            return Ok(PresentOutcome::Stale);
        }
        Ok(PresentOutcome::Presented)
    }

    fn resize_images(&mut self, width: u32, height: u32) -> FrameResult<()> {
        self.build(width, height)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_images();
        unsafe {
            self.device.device.destroy_fence(self.acquire_fence, None);
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.surface.loader.destroy_surface(self.surface.surface, None);
        }
    }
}

/// Vulkan timeout in nanoseconds; `None` is forever.
pub(crate) fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout
        .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(u64::MAX)
}

fn acquire_error(result: vk::Result, timeout: Option<Duration>) -> FrameError {
    match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::OutOfDate,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => FrameError::AcquireStall {
            timeout: timeout.unwrap_or(Duration::MAX),
        },
        e => e.into(),
    }
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Prefer SRGB BGRA, otherwise whatever the surface lists first.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

// FIFO: vsync, always available
// IMMEDIATE: no vsync, may tear
// MAILBOX: no vsync, no tearing
fn choose_present_mode(mode: PresentMode, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let has = |m: vk::PresentModeKHR| available.contains(&m);
    match mode {
        PresentMode::Vsync => vk::PresentModeKHR::FIFO,
        PresentMode::Unsynced { tearing: true } if has(vk::PresentModeKHR::IMMEDIATE) => {
            vk::PresentModeKHR::IMMEDIATE
        }
        PresentMode::Unsynced { .. } if has(vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        PresentMode::Unsynced { .. } => vk::PresentModeKHR::FIFO,
    }
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [vk::PresentModeKHR; 3] = [
        vk::PresentModeKHR::FIFO,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ];

    #[test]
    fn test_acquire_timeouts_are_stalls() {
        let timeout = Some(Duration::from_millis(100));
        for result in [vk::Result::TIMEOUT, vk::Result::NOT_READY] {
            match acquire_error(result, timeout) {
                FrameError::AcquireStall { timeout: t } => {
                    assert_eq!(t, Duration::from_millis(100))
                }
                other => panic!("expected stall, got {:?}", other),
            }
        }
        assert!(matches!(
            acquire_error(vk::Result::ERROR_OUT_OF_DATE_KHR, timeout),
            FrameError::OutOfDate
        ));
        assert!(matches!(
            acquire_error(vk::Result::ERROR_DEVICE_LOST, timeout),
            FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_millis(2))), 2_000_000);
        assert_eq!(timeout_ns(Some(Duration::MAX)), u64::MAX);
    }

    #[test]
    fn test_vsync_maps_to_fifo() {
        assert_eq!(
            choose_present_mode(PresentMode::Vsync, &ALL_MODES),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_tearing_prefers_immediate() {
        assert_eq!(
            choose_present_mode(PresentMode::Unsynced { tearing: true }, &ALL_MODES),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(PresentMode::Unsynced { tearing: false }, &ALL_MODES),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn test_unsynced_falls_back_to_fifo() {
        assert_eq!(
            choose_present_mode(
                PresentMode::Unsynced { tearing: true },
                &[vk::PresentModeKHR::FIFO]
            ),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_follows_surface_when_fixed() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_extent_clamped_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, 8000, 0);
        assert_eq!((extent.width, extent.height), (4096, 1));
    }

    #[test]
    fn test_srgb_format_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert!(choose_surface_format(&[]).is_none());
    }
}
