// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The server root: owns every long-lived resource, runs the compositor
//! loop, and enforces the single-client policy. Initialization follows a
//! strict order; teardown is the reverse, and because every resource is
//! RAII, the same unwinding happens on partial-init failure.

use std::{
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    catalogue::SharedCatalogue,
    config::Config,
    devices::{self, DeviceCatalogue},
    handoff::{LayerData, RenderState},
    listener::Listener,
    poller::{Event, EventPoller},
    renderer::{CompositorRenderer, HeadlessRenderer, RenderError, SwapchainImage},
    session::{self, ClientSession, SessionShared, WorkerContext},
    stats::Stats,
    vulkan::{VkContext, VulkanRenderer},
};

/// A frame that referenced state the server doesn't have. Non-fatal: the
/// frame is skipped and the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("layer {layer} references unknown swapchain {id}")]
    MissingSwapchain { layer: usize, id: u32 },
    #[error("layer {0} has no content")]
    EmptyLayer(usize),
    #[error(transparent)]
    Render(#[from] RenderError),
}

pub struct Server {
    // Dropped top to bottom, the reverse of init: the worker joins first,
    // the wait-frame structure goes before the compositor, and the
    // listener unlinks its socket last.
    session: Option<ClientSession>,
    stats: Stats,
    catalogue: Arc<SharedCatalogue>,
    renderer: Box<dyn CompositorRenderer>,
    devices: Arc<DeviceCatalogue>,
    poller: EventPoller,
    listener: Listener,

    cfg: Config,
    running: Arc<AtomicBool>,
    closer_send: Sender<()>,
    closer_recv: Receiver<()>,

    current_layer_count: usize,
    frame_interval_ns: u64,
    sub_rect_warned: bool,
    reconcile_err_logged: bool,
}

impl Server {
    /// Brings the whole stack up, in dependency order. Any failure unwinds
    /// everything constructed so far.
    pub fn init(cfg: Config) -> anyhow::Result<Self> {
        // Device enumeration. Hardware drivers plug in here; without them
        // we select the simulated set.
        let devices = Arc::new(devices::simulated());
        devices.validate().context("device selection")?;

        let hmd = devices
            .hmd()
            .and_then(|d| d.hmd)
            .expect("validated catalogue has an HMD");
        let frame_interval_ns = (1_000_000_000.0 / hmd.refresh_rate_hz as f64) as u64;

        // The compositor. Pipeline construction lives behind the renderer
        // seam; headless mode skips the GPU entirely.
        let renderer: Box<dyn CompositorRenderer> = if cfg.headless {
            info!("running headless");
            Box::new(HeadlessRenderer::new(hmd.refresh_rate_hz))
        } else {
            let vk = Arc::new(VkContext::new(cfg.debug_vulkan).context("initializing vulkan")?);
            Box::new(VulkanRenderer::new(
                vk,
                hmd.views[0].width * 2,
                hmd.views[0].height,
                hmd.refresh_rate_hz,
            )?)
        };

        let catalogue = Arc::new(
            SharedCatalogue::build(&devices, &cfg.shm_name)
                .context("publishing shared catalogue")?,
        );

        let listener = Listener::bootstrap(&cfg.socket_path, cfg.bind_systemd)?;

        // Stdin shutdown only applies when we own the terminal.
        let poller = EventPoller::new(&listener, !listener.launched_by_socket())
            .context("creating poller")?;

        let (closer_send, closer_recv) = crossbeam_channel::bounded(1);

        Ok(Self {
            session: None,
            stats: Stats::new(),
            catalogue,
            renderer,
            devices,
            poller,
            listener,

            cfg,
            running: Arc::new(AtomicBool::new(true)),
            closer_send,
            closer_recv,

            current_layer_count: 0,
            frame_interval_ns,
            sub_rect_warned: false,
            reconcile_err_logged: false,
        })
    }

    /// A handle that stops the loop from any thread (e.g. a signal
    /// handler).
    pub fn closer(&self) -> Sender<()> {
        self.closer_send.clone()
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the steady-state loop until shutdown or a fatal error.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("entering compositor loop");

        while self.running() {
            self.tick()?;
        }

        debug!("compositor loop exited");
        Ok(())
    }

    /// One main-loop iteration. Never blocks except inside the renderer's
    /// own frame pacing.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if self.closer_recv.try_recv().is_ok() {
            info!("shutdown requested");
            self.running.store(false, Ordering::Release);
            return Ok(());
        }

        for event in self.poller.poll() {
            match event {
                Event::NewConnection => self.accept_pending()?,
                Event::ShutdownRequested => {
                    info!("operator shutdown");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                Event::Error(code) => {
                    self.running.store(false, Ordering::Release);
                    anyhow::bail!("poll failed with errno {code}");
                }
            }
        }

        let active = self
            .session
            .as_ref()
            .map(|s| s.shared().clone())
            .filter(|s| s.is_active() && s.num_swapchains() > 0);

        match active {
            None => {
                if self.current_layer_count != 0 {
                    debug!("client gone, dropping layer stack");
                    self.renderer.destroy_layers();
                    self.current_layer_count = 0;
                }
            }
            Some(shared) => {
                let consumed = shared
                    .handoff
                    .try_consume(|state| self.reconcile(&shared, state));

                match consumed {
                    Some(Err(e)) => {
                        if !self.reconcile_err_logged {
                            warn!("skipping frame: {e}");
                            self.reconcile_err_logged = true;
                        }
                        self.stats.counters.frames_skipped += 1;
                        self.stats.counters.reconcile_errors += 1;

                        // Fatal for this frame only; no draw, no
                        // wait-frame post.
                        return Ok(());
                    }
                    Some(Ok(())) => self.reconcile_err_logged = false,
                    None => {}
                }
            }
        }

        match self.renderer.draw() {
            Ok(()) => self.stats.counters.frames_drawn += 1,
            Err(e) => {
                // Fatal to the frame; the device may recover.
                error!("draw failed: {e}");
                self.stats.counters.frames_skipped += 1;
            }
        }
        self.renderer.garbage_collect();

        // Pace the active client's wait-frame.
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.is_active())
        {
            self.catalogue.post_wait_frame();
        }

        self.stats.counters.layers_active = self.current_layer_count;
        self.stats.tick();

        Ok(())
    }

    /// Drains the accept queue. Accept failure is fatal; see the error
    /// policy notes in DESIGN.md.
    fn accept_pending(&mut self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept() {
                Ok(Some(stream)) => self.handle_connection(stream)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e).context("accept failed");
                }
            }
        }
    }

    /// The single-client policy: one session slot, first come first
    /// served. A finished worker is reaped here; a live one means the
    /// newcomer is turned away.
    fn handle_connection(&mut self, stream: UnixStream) -> anyhow::Result<()> {
        if self.session.as_ref().is_some_and(|s| s.is_stopping()) {
            debug!("reaping finished client worker");
            self.session.take().unwrap().reap();
        } else if self.session.is_some() {
            warn!("rejecting connection: a client is already connected");
            self.stats.counters.clients_rejected += 1;
            session::reject_client(stream);
            return Ok(());
        }

        info!("client connected");
        let session = ClientSession::spawn(
            stream,
            WorkerContext {
                catalogue: self.catalogue.clone(),
                devices: self.devices.clone(),
                running: self.running.clone(),
                exit_on_disconnect: self.cfg.exit_on_disconnect,
                frame_interval_ns: self.frame_interval_ns,
            },
        )
        .context("spawning client worker")?;

        self.session = Some(session);
        Ok(())
    }

    /// Pushes a submitted layer stack into the renderer. On a layer-count
    /// change the whole stack is torn down and reallocated at the new
    /// size.
    fn reconcile(
        &mut self,
        shared: &SessionShared,
        state: &RenderState,
    ) -> Result<(), ReconcileError> {
        if state.num_layers != self.current_layer_count {
            debug!(
                old = self.current_layer_count,
                new = state.num_layers,
                "layer count changed, reallocating"
            );
            self.renderer.destroy_layers();
            self.renderer.set_layer_count(state.num_layers)?;
            self.current_layer_count = state.num_layers;
        }

        for (i, layer) in state.layers[..state.num_layers].iter().enumerate() {
            match layer.data {
                LayerData::StereoProjection { views } => {
                    let left = shared.lookup_swapchain(views[0].swapchain_id).ok_or(
                        ReconcileError::MissingSwapchain {
                            layer: i,
                            id: views[0].swapchain_id,
                        },
                    )?;
                    let right = shared.lookup_swapchain(views[1].swapchain_id).ok_or(
                        ReconcileError::MissingSwapchain {
                            layer: i,
                            id: views[1].swapchain_id,
                        },
                    )?;

                    self.check_sub_rects(&[views[0].sub_rect, views[1].sub_rect]);

                    self.renderer.set_projection_layer(
                        i,
                        SwapchainImage {
                            swapchain: &left,
                            image_index: views[0].image_index,
                            array_index: views[0].array_index,
                        },
                        SwapchainImage {
                            swapchain: &right,
                            image_index: views[1].image_index,
                            array_index: views[1].array_index,
                        },
                        layer.flags,
                    )?;
                }
                LayerData::Quad { pose, size, view } => {
                    let swapchain = shared.lookup_swapchain(view.swapchain_id).ok_or(
                        ReconcileError::MissingSwapchain {
                            layer: i,
                            id: view.swapchain_id,
                        },
                    )?;

                    self.check_sub_rects(&[view.sub_rect]);

                    self.renderer.set_quad_layer(
                        i,
                        SwapchainImage {
                            swapchain: &swapchain,
                            image_index: view.image_index,
                            array_index: view.array_index,
                        },
                        pose,
                        size,
                        layer.flags,
                    )?;
                }
                LayerData::None => return Err(ReconcileError::EmptyLayer(i)),
            }
        }

        Ok(())
    }

    fn check_sub_rects(&mut self, rects: &[crate::handoff::SubRect]) {
        // Sub-rects are accepted on the wire but not yet honored; the full
        // image is sampled. See DESIGN.md.
        if !self.sub_rect_warned && rects.iter().any(|r| !r.is_trivial()) {
            warn!("client submitted a sub-rect; sampling the full image instead");
            self.sub_rect_warned = true;
        }
    }

    #[cfg(test)]
    fn renderer_layer_count(&self) -> usize {
        self.renderer.layer_count()
    }

    #[cfg(test)]
    fn counters(&self) -> &crate::stats::Counters {
        &self.stats.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BytesMut};
    use ox_protocol as protocol;
    use std::io::{Read, Write};

    struct TestEnv {
        // Dropped before the tempdir, so the socket unlinks first.
        server: Server,
        socket_path: std::path::PathBuf,
        _dir: mktemp::Temp,
    }

    fn test_server(tag: &str, exit_on_disconnect: bool) -> TestEnv {
        let dir = mktemp::Temp::new_dir().unwrap();
        let socket_path = dir.join(crate::listener::SOCKET_NAME);

        let cfg = Config {
            socket_path: socket_path.clone(),
            shm_name: format!("/oxserver-server-test-{}-{tag}", std::process::id()),
            bind_systemd: false,
            exit_on_disconnect,
            headless: true,
            debug_vulkan: false,
        };

        TestEnv {
            _dir: dir,
            socket_path,
            server: Server::init(cfg).unwrap(),
        }
    }

    fn send_one(stream: &mut UnixStream, msg: protocol::MessageType) {
        let mut scratch = [0u8; protocol::MAX_MESSAGE_SIZE];
        let len = protocol::encode_message(&msg, &mut scratch).unwrap();
        stream.write_all(&scratch[..len]).unwrap();
    }

    /// Reads one framed message, discarding any attached fds.
    fn recv_one(stream: &mut UnixStream, buf: &mut BytesMut) -> protocol::MessageType {
        loop {
            if let Ok((msg, len)) = protocol::decode_message(buf) {
                buf.advance(len);
                return msg;
            }

            let mut data = [0u8; 4096];
            let n = stream.read(&mut data).unwrap();
            assert!(n > 0, "server hung up");
            buf.extend_from_slice(&data[..n]);
        }
    }

    fn handshake(env: &mut TestEnv) -> (UnixStream, BytesMut) {
        let mut client = UnixStream::connect(&env.socket_path).unwrap();
        env.server.tick().unwrap();

        let mut buf = BytesMut::new();
        send_one(
            &mut client,
            protocol::ClientHello {
                name: "test-app".into(),
                version: session::PROTOCOL_VERSION,
            }
            .into(),
        );

        let reply = recv_one(&mut client, &mut buf);
        assert!(matches!(reply, protocol::MessageType::ServerHello(_)));

        (client, buf)
    }

    fn create_swapchain(client: &mut UnixStream, buf: &mut BytesMut, id: u32) {
        send_one(
            client,
            protocol::CreateSwapchain {
                id,
                width: 32,
                height: 32,
                format: 37,
                array_size: 1,
                image_count: 2,
            }
            .into(),
        );
        let reply = recv_one(client, buf);
        assert!(matches!(reply, protocol::MessageType::SwapchainCreated(_)));
    }

    fn stereo_frame(ids: [u32; 2]) -> protocol::MessageType {
        protocol::EndFrame {
            layers: vec![protocol::Layer {
                kind: protocol::LayerKind::StereoProjection as i32,
                flags: 0,
                views: ids
                    .iter()
                    .map(|&swapchain_id| protocol::LayerView {
                        swapchain_id,
                        image_index: 0,
                        array_index: 0,
                        rect: None,
                    })
                    .collect(),
                pose: None,
                size: None,
            }],
        }
        .into()
    }

    fn submit_frame(client: &mut UnixStream, buf: &mut BytesMut, msg: protocol::MessageType) {
        send_one(client, protocol::BeginFrame {}.into());
        let reply = recv_one(client, buf);
        assert!(matches!(reply, protocol::MessageType::FrameBegun(_)));

        send_one(client, msg);
        let reply = recv_one(client, buf);
        assert!(matches!(reply, protocol::MessageType::FrameEnded(_)));
    }

    #[test]
    fn cold_start_draws_idle_frames() {
        let mut env = test_server("idle", false);

        env.server.tick().unwrap();
        env.server.tick().unwrap();

        assert_eq!(env.server.counters().frames_drawn, 2);
        assert_eq!(env.server.renderer_layer_count(), 0);

        let socket_path = env.socket_path.clone();
        assert!(socket_path.exists());
        drop(env);
        assert!(!socket_path.exists());
    }

    #[test]
    fn single_client_frame_lifecycle() {
        let mut env = test_server("lifecycle", true);
        let (mut client, mut buf) = handshake(&mut env);

        create_swapchain(&mut client, &mut buf, 0);
        create_swapchain(&mut client, &mut buf, 1);
        submit_frame(&mut client, &mut buf, stereo_frame([0, 1]));

        env.server.tick().unwrap();
        assert_eq!(env.server.renderer_layer_count(), 1);
        assert!(env.server.counters().frames_drawn >= 1);

        // The slot was handed back after reconciliation.
        let shared = env.server.session.as_ref().unwrap().shared().clone();
        assert!(!shared.handoff.is_pending());

        // With exit_on_disconnect, hanging up stops the server.
        drop(client);
        let mut spins = 0;
        while env.server.running() {
            std::thread::sleep(std::time::Duration::from_millis(1));
            spins += 1;
            assert!(spins < 5000, "server did not stop");
        }
        assert!(shared.is_stopping());
    }

    #[test]
    fn second_client_is_rejected() {
        let mut env = test_server("reject", false);
        let (_client_a, _) = handshake(&mut env);

        let mut client_b = UnixStream::connect(&env.socket_path).unwrap();
        env.server.tick().unwrap();
        assert_eq!(env.server.counters().clients_rejected, 1);

        // B gets an error, then EOF.
        let mut buf = BytesMut::new();
        let reply = recv_one(&mut client_b, &mut buf);
        match reply {
            protocol::MessageType::Error(e) => {
                assert_eq!(e.code, protocol::ErrorCode::AlreadyConnected as i32)
            }
            v => panic!("expected Error, got {v}"),
        }

        let mut rest = Vec::new();
        client_b.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // A is unaffected.
        assert!(env.server.session.as_ref().unwrap().is_active());
    }

    #[test]
    fn invalid_swapchain_skips_frame() {
        let mut env = test_server("badframe", false);
        let (mut client, mut buf) = handshake(&mut env);

        create_swapchain(&mut client, &mut buf, 0);

        // References swapchain 5, which doesn't exist.
        submit_frame(&mut client, &mut buf, stereo_frame([0, 5]));

        env.server.tick().unwrap();
        assert_eq!(env.server.counters().frames_skipped, 1);
        assert_eq!(env.server.counters().frames_drawn, 0);

        // The loop recovers on the next iteration.
        env.server.tick().unwrap();
        assert_eq!(env.server.counters().frames_drawn, 1);
    }

    #[test]
    fn layer_count_change_reallocates() {
        let mut env = test_server("layercount", false);
        let (mut client, mut buf) = handshake(&mut env);

        for id in 0..4 {
            create_swapchain(&mut client, &mut buf, id);
        }

        let quad = |swapchain_id| protocol::Layer {
            kind: protocol::LayerKind::Quad as i32,
            flags: 0,
            views: vec![protocol::LayerView {
                swapchain_id,
                image_index: 0,
                array_index: 0,
                rect: None,
            }],
            pose: Some(protocol::Pose::default()),
            size: Some(protocol::Extent2D {
                width: 1.0,
                height: 1.0,
            }),
        };

        submit_frame(
            &mut client,
            &mut buf,
            protocol::EndFrame {
                layers: vec![quad(0), quad(1)],
            }
            .into(),
        );
        env.server.tick().unwrap();
        assert_eq!(env.server.renderer_layer_count(), 2);

        submit_frame(
            &mut client,
            &mut buf,
            protocol::EndFrame {
                layers: vec![quad(0), quad(1), quad(2)],
            }
            .into(),
        );
        env.server.tick().unwrap();
        assert_eq!(env.server.renderer_layer_count(), 3);
    }

    #[test]
    fn layers_are_dropped_when_client_leaves() {
        let mut env = test_server("cleanup", false);
        let (mut client, mut buf) = handshake(&mut env);

        create_swapchain(&mut client, &mut buf, 0);
        create_swapchain(&mut client, &mut buf, 1);
        submit_frame(&mut client, &mut buf, stereo_frame([0, 1]));

        env.server.tick().unwrap();
        assert_eq!(env.server.renderer_layer_count(), 1);

        let shared = env.server.session.as_ref().unwrap().shared().clone();
        drop(client);
        while !shared.is_stopping() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        env.server.tick().unwrap();
        assert_eq!(env.server.renderer_layer_count(), 0);
    }
}
