// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The single-slot handoff between a client worker and the compositor
//! loop. One atomic flag gates a plain-memory payload: the worker fills the
//! layer stack and releases the flag; the main loop acquires it, reconciles,
//! and hands the slot back. There is no queue; frames the compositor has
//! already consumed are simply replaced by newer ones.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

use glam::Vec2;

use crate::devices::Pose;

pub const MAX_LAYERS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl SubRect {
    /// A zero rect means "the full image"; anything else is currently
    /// ignored at reconcile time.
    pub fn is_trivial(&self) -> bool {
        *self == SubRect::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayerView {
    pub swapchain_id: u32,
    pub image_index: u32,
    pub array_index: u32,
    pub sub_rect: SubRect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerFlags {
    pub unpremultiplied_alpha: bool,
    pub flip_y: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LayerData {
    #[default]
    None,
    StereoProjection {
        views: [LayerView; 2],
    },
    Quad {
        pose: Pose,
        size: Vec2,
        view: LayerView,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayerRenderState {
    pub flags: LayerFlags,
    pub data: LayerData,
}

pub struct RenderState {
    pub num_layers: usize,
    pub layers: [LayerRenderState; MAX_LAYERS],
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            num_layers: 0,
            layers: [LayerRenderState::default(); MAX_LAYERS],
        }
    }
}

/// Single producer (the session worker), single consumer (the main loop).
///
/// Discipline: the payload may only be written while `rendering` is false
/// and only read while it is true. The release store in [`submit`] pairs
/// with the acquire load in [`try_consume`], and vice versa for the
/// handback.
pub struct RenderHandoff {
    rendering: AtomicBool,
    state: UnsafeCell<RenderState>,
}

// SAFETY: access to `state` is serialized by the `rendering` flag per the
// discipline above.
unsafe impl Sync for RenderHandoff {}

impl Default for RenderHandoff {
    fn default() -> Self {
        Self {
            rendering: AtomicBool::new(false),
            state: UnsafeCell::new(RenderState::default()),
        }
    }
}

impl RenderHandoff {
    /// Producer side: fills the slot and marks it renderable. If the
    /// compositor is mid-consume, waits for it to hand the slot back; the
    /// wait is bounded by a single loop iteration, since the consumer never
    /// blocks while holding the slot.
    pub fn submit(&self, fill: impl FnOnce(&mut RenderState)) {
        let mut spins: u32 = 0;
        while self.rendering.load(Ordering::Acquire) {
            spins += 1;
            if spins % 128 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        // SAFETY: we are the sole producer, and the consumer does not read
        // while the flag is clear.
        unsafe { fill(&mut *self.state.get()) };

        self.rendering.store(true, Ordering::Release);
    }

    /// Consumer side: if a frame is pending, reads it and hands the slot
    /// back. The slot is released whether or not the caller's reconcile
    /// succeeded; a frame that failed to reconcile is dropped, not
    /// retried.
    pub fn try_consume<R>(&self, read: impl FnOnce(&RenderState) -> R) -> Option<R> {
        if !self.rendering.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: we are the sole consumer, and the producer does not write
        // while the flag is set.
        let out = unsafe { read(&*self.state.get()) };

        self.rendering.store(false, Ordering::Release);
        Some(out)
    }

    pub fn is_pending(&self) -> bool {
        self.rendering.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn submit_then_consume() {
        let handoff = RenderHandoff::default();
        assert!(!handoff.is_pending());
        assert!(handoff.try_consume(|_| ()).is_none());

        handoff.submit(|state| {
            state.num_layers = 2;
            state.layers[0].data = LayerData::StereoProjection {
                views: [LayerView::default(); 2],
            };
            state.layers[1].flags.flip_y = true;
        });
        assert!(handoff.is_pending());

        let (n, flip) = handoff
            .try_consume(|state| (state.num_layers, state.layers[1].flags.flip_y))
            .unwrap();
        assert_eq!(n, 2);
        assert!(flip);

        // Consumed; the slot is empty again.
        assert!(!handoff.is_pending());
        assert!(handoff.try_consume(|_| ()).is_none());
    }

    /// Instrumented race check: the producer stamps every layer of a frame
    /// with the same value. If either side ever touched the payload in the
    /// wrong phase, the consumer would observe a torn (mixed-stamp) frame.
    #[test]
    fn no_tearing_under_contention() {
        const FRAMES: u32 = 10_000;

        let handoff = Arc::new(RenderHandoff::default());

        let producer = {
            let handoff = handoff.clone();
            std::thread::spawn(move || {
                for stamp in 1..=FRAMES {
                    handoff.submit(|state| {
                        state.num_layers = MAX_LAYERS;
                        for layer in state.layers.iter_mut() {
                            layer.data = LayerData::Quad {
                                pose: Pose::IDENTITY,
                                size: Vec2::ZERO,
                                view: LayerView {
                                    swapchain_id: stamp,
                                    ..Default::default()
                                },
                            };
                        }
                    });
                }
            })
        };

        let mut last_stamp = 0;
        while last_stamp < FRAMES {
            let Some(stamp) = handoff.try_consume(|state| {
                let stamps: Vec<u32> = state
                    .layers
                    .iter()
                    .map(|l| match l.data {
                        LayerData::Quad { view, .. } => view.swapchain_id,
                        _ => panic!("unexpected layer kind"),
                    })
                    .collect();

                assert!(
                    stamps.windows(2).all(|w| w[0] == w[1]),
                    "torn frame: {stamps:?}"
                );
                stamps[0]
            }) else {
                std::hint::spin_loop();
                continue;
            };

            // Frames may be skipped, never reordered.
            assert!(stamp > last_stamp, "reordered: {last_stamp} -> {stamp}");
            last_stamp = stamp;
        }

        producer.join().unwrap();
    }
}
