// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The seam between the core and the compositor proper. The core owns
//! swapchain storage and layer reconciliation; everything pipeline-shaped
//! lives behind [`CompositorRenderer`]. Two implementations ship in-tree:
//! the Vulkan-backed one in `vulkan.rs`, and [`HeadlessRenderer`] for
//! driverless operation and tests.

use std::{
    ffi::CString,
    fs::File,
    os::fd::{AsFd, AsRawFd, BorrowedFd},
    time,
};

use ash::vk;
use glam::Vec2;
use nix::{
    fcntl::{fcntl, FcntlArg, SealFlag},
    sys::memfd::{memfd_create, MemFdCreateFlag},
};
use tracing::trace;

use crate::devices::Pose;
use crate::handoff::LayerFlags;

/// The background drawn when no client is active.
pub const IDLE_CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("layer index {0} out of range ({1} allocated)")]
    LayerOutOfRange(usize, usize),
    #[error("vulkan call {call} failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
    #[error("swapchain allocation failed: {0}")]
    SwapchainAlloc(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSpec {
    pub width: u32,
    pub height: u32,
    /// A VkFormat value, carried through for the layer renderers.
    pub format: u32,
    pub array_size: u32,
    pub image_count: u32,
}

/// One client-renderable buffer: a memfd sealed against resizing, but not
/// against writes, since the client draws into it.
pub struct SealedImage {
    file: File,
    size: usize,
}

impl SealedImage {
    pub fn new(name: &str, size: usize) -> anyhow::Result<Self> {
        let name = CString::new(name)?;
        let fd = memfd_create(
            name.as_c_str(),
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;

        let file: File = fd.into();
        file.set_len(size as u64)?;

        fcntl(
            file.as_raw_fd(),
            FcntlArg::F_ADD_SEALS(
                SealFlag::F_SEAL_SEAL | SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW,
            ),
        )?;

        Ok(Self { file, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl AsFd for SealedImage {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for SealedImage {
    fn as_raw_fd(&self) -> std::os::unix::prelude::RawFd {
        self.file.as_raw_fd()
    }
}

/// A ring of images the client rotates through, identified to the server
/// by a client-assigned id.
pub struct Swapchain {
    pub id: u32,
    pub spec: SwapchainSpec,
    images: Vec<SealedImage>,
}

impl Swapchain {
    pub fn new(id: u32, spec: SwapchainSpec) -> Result<Self, RenderError> {
        let image_size =
            spec.width as usize * spec.height as usize * 4 * spec.array_size.max(1) as usize;

        let images = (0..spec.image_count.max(1))
            .map(|i| SealedImage::new(&format!("oxserver-sc{id}-{i}"), image_size))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(RenderError::SwapchainAlloc)?;

        Ok(Self { id, spec, images })
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.images.iter().map(|img| img.as_fd()).collect()
    }

    pub fn image(&self, index: u32) -> Option<&SealedImage> {
        self.images.get(index as usize)
    }
}

/// A resolved reference to one image of a swapchain, as handed to the
/// layer renderers.
#[derive(Clone, Copy)]
pub struct SwapchainImage<'a> {
    pub swapchain: &'a Swapchain,
    pub image_index: u32,
    pub array_index: u32,
}

/// The compositor's layer-stack interface. Implementations own their draw
/// pacing; `draw` blocks until the frame is presented (or its interval has
/// elapsed), which is what paces the whole main loop.
pub trait CompositorRenderer {
    /// Discards all layer objects and allocates a fresh contiguous array.
    fn set_layer_count(&mut self, count: usize) -> Result<(), RenderError>;

    fn destroy_layers(&mut self);

    fn layer_count(&self) -> usize;

    fn set_projection_layer(
        &mut self,
        index: usize,
        left: SwapchainImage<'_>,
        right: SwapchainImage<'_>,
        flags: LayerFlags,
    ) -> Result<(), RenderError>;

    fn set_quad_layer(
        &mut self,
        index: usize,
        image: SwapchainImage<'_>,
        pose: Pose,
        size: Vec2,
        flags: LayerFlags,
    ) -> Result<(), RenderError>;

    fn draw(&mut self) -> Result<(), RenderError>;

    fn garbage_collect(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum LayerSlot {
    #[default]
    Empty,
    Projection {
        left_swapchain: u32,
        right_swapchain: u32,
        flags: LayerFlags,
    },
    Quad {
        swapchain: u32,
        pose: Pose,
        size: Vec2,
        flags: LayerFlags,
    },
}

/// Composites nothing, but keeps full layer bookkeeping and paces itself
/// like a real display would.
pub struct HeadlessRenderer {
    layers: Vec<LayerSlot>,
    frame_interval: time::Duration,
    next_frame: time::Instant,
    frames_drawn: u64,
}

impl HeadlessRenderer {
    pub fn new(refresh_rate_hz: f32) -> Self {
        let frame_interval = time::Duration::from_secs_f64(1.0 / refresh_rate_hz as f64);
        Self {
            layers: Vec::new(),
            frame_interval,
            next_frame: time::Instant::now() + frame_interval,
            frames_drawn: 0,
        }
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn layers(&self) -> &[LayerSlot] {
        &self.layers
    }

    fn slot(&mut self, index: usize) -> Result<&mut LayerSlot, RenderError> {
        let len = self.layers.len();
        self.layers
            .get_mut(index)
            .ok_or(RenderError::LayerOutOfRange(index, len))
    }
}

impl CompositorRenderer for HeadlessRenderer {
    fn set_layer_count(&mut self, count: usize) -> Result<(), RenderError> {
        self.layers.clear();
        self.layers.resize(count, LayerSlot::Empty);
        Ok(())
    }

    fn destroy_layers(&mut self) {
        self.layers.clear();
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn set_projection_layer(
        &mut self,
        index: usize,
        left: SwapchainImage<'_>,
        right: SwapchainImage<'_>,
        flags: LayerFlags,
    ) -> Result<(), RenderError> {
        *self.slot(index)? = LayerSlot::Projection {
            left_swapchain: left.swapchain.id,
            right_swapchain: right.swapchain.id,
            flags,
        };
        Ok(())
    }

    fn set_quad_layer(
        &mut self,
        index: usize,
        image: SwapchainImage<'_>,
        pose: Pose,
        size: Vec2,
        flags: LayerFlags,
    ) -> Result<(), RenderError> {
        *self.slot(index)? = LayerSlot::Quad {
            swapchain: image.swapchain.id,
            pose,
            size,
            flags,
        };
        Ok(())
    }

    fn draw(&mut self) -> Result<(), RenderError> {
        let now = time::Instant::now();
        if now < self.next_frame {
            std::thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.frame_interval;

        self.frames_drawn += 1;
        trace!(frame = self.frames_drawn, layers = self.layers.len(), "frame");
        Ok(())
    }

    fn garbage_collect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec() -> SwapchainSpec {
        SwapchainSpec {
            width: 64,
            height: 64,
            format: 37, // VK_FORMAT_R8G8B8A8_UNORM
            array_size: 2,
            image_count: 3,
        }
    }

    #[test]
    fn swapchain_images_are_sized_and_sealed() {
        let sc = Swapchain::new(7, spec()).unwrap();
        assert_eq!(sc.image_count(), 3);

        let img = sc.image(0).unwrap();
        assert_eq!(img.size(), 64 * 64 * 4 * 2);

        let seals = fcntl(img.as_raw_fd(), FcntlArg::F_GET_SEALS).unwrap();
        let seals = SealFlag::from_bits_truncate(seals);
        assert!(seals.contains(SealFlag::F_SEAL_SHRINK | SealFlag::F_SEAL_GROW));
        // Writes stay unsealed, the client renders into these.
        assert!(!seals.contains(SealFlag::F_SEAL_WRITE));

        assert!(sc.image(3).is_none());
    }

    #[test]
    fn headless_layer_bookkeeping() {
        let mut renderer = HeadlessRenderer::new(1000.0);
        let sc = Swapchain::new(0, spec()).unwrap();

        renderer.set_layer_count(2).unwrap();
        assert_eq!(renderer.layer_count(), 2);

        let img = SwapchainImage {
            swapchain: &sc,
            image_index: 0,
            array_index: 0,
        };
        renderer
            .set_projection_layer(0, img, img, LayerFlags::default())
            .unwrap();
        renderer
            .set_quad_layer(
                1,
                img,
                Pose::IDENTITY,
                Vec2::new(1.0, 0.75),
                LayerFlags { flip_y: true, unpremultiplied_alpha: false },
            )
            .unwrap();

        match renderer.layers()[1] {
            LayerSlot::Quad { swapchain, flags, .. } => {
                assert_eq!(swapchain, 0);
                assert!(flags.flip_y);
            }
            ref v => panic!("expected quad, got {v:?}"),
        }

        // Out of range is an error, not growth.
        assert!(matches!(
            renderer.set_projection_layer(2, img, img, LayerFlags::default()),
            Err(RenderError::LayerOutOfRange(2, 2))
        ));

        renderer.destroy_layers();
        assert_eq!(renderer.layer_count(), 0);

        renderer.draw().unwrap();
        assert_eq!(renderer.frames_drawn(), 1);
    }
}
