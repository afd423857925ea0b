// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Per-connection state and the worker thread that services it. The worker
//! owns the socket: it decodes length-framed messages, manages the
//! session's swapchain table, and publishes finished frames into the render
//! handoff. The main loop only ever touches the shared atomics, the
//! swapchain table, and the handoff.

use std::{
    io::{Read, Write},
    os::fd::{AsRawFd, BorrowedFd},
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use bytes::{Buf, BytesMut};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use ox_protocol as protocol;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    catalogue::SharedCatalogue,
    devices::DeviceCatalogue,
    handoff::{LayerData, LayerFlags, LayerRenderState, LayerView, RenderHandoff, SubRect, MAX_LAYERS},
    renderer::{Swapchain, SwapchainSpec},
};

pub const MAX_SWAPCHAINS: usize = 16;

/// The protocol revision we answer hellos with.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("decode error: {0}")]
    Decode(#[from] protocol::ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State shared between the worker thread and the main loop.
pub struct SessionShared {
    /// Set by the worker once the handshake completes.
    active: AtomicBool,
    /// Set by the worker on its way out; the main loop reaps the thread.
    stopping: AtomicBool,
    num_swapchains: AtomicUsize,
    pub handoff: RenderHandoff,
    swapchains: Mutex<[Option<Arc<Swapchain>>; MAX_SWAPCHAINS]>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            num_swapchains: AtomicUsize::new(0),
            handoff: RenderHandoff::default(),
            swapchains: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn num_swapchains(&self) -> usize {
        self.num_swapchains.load(Ordering::Acquire)
    }

    pub fn lookup_swapchain(&self, id: u32) -> Option<Arc<Swapchain>> {
        self.swapchains
            .lock()
            .get(id as usize)
            .and_then(|slot| slot.clone())
    }
}

/// Everything the worker needs from the rest of the server.
pub struct WorkerContext {
    pub catalogue: Arc<SharedCatalogue>,
    pub devices: Arc<DeviceCatalogue>,
    pub running: Arc<AtomicBool>,
    pub exit_on_disconnect: bool,
    pub frame_interval_ns: u64,
}

pub struct ClientSession {
    shared: Arc<SessionShared>,
    /// Our own handle to the connection, used to kick the worker off its
    /// blocking read at teardown.
    control: UnixStream,
    thread: Option<thread::JoinHandle<()>>,
}

impl ClientSession {
    /// Accepts ownership of a fresh connection and spawns its worker.
    pub fn spawn(stream: UnixStream, ctx: WorkerContext) -> std::io::Result<Self> {
        // The listener hands us non-blocking sockets; the worker wants
        // blocking reads.
        stream.set_nonblocking(false)?;
        let control = stream.try_clone()?;

        let shared = Arc::new(SessionShared::new());
        let thread_shared = shared.clone();

        let thread = thread::Builder::new()
            .name("ox-client".to_string())
            .spawn(move || {
                let peer = stream.as_raw_fd();
                match run_worker(stream, &thread_shared, &ctx) {
                    Ok(()) => debug!(peer, "client disconnected"),
                    Err(WorkerError::Io(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        debug!(peer, "client hung up")
                    }
                    Err(e) => warn!(peer, "client session failed: {e}"),
                }

                thread_shared.active.store(false, Ordering::Release);
                thread_shared.stopping.store(true, Ordering::Release);

                if ctx.exit_on_disconnect {
                    info!("exit_on_disconnect set, shutting down");
                    ctx.running.store(false, Ordering::Release);
                }

                // Wake anything still blocked in wait-frame so it can
                // observe the disconnect.
                ctx.catalogue.post_wait_frame();
            })?;

        Ok(Self {
            shared,
            control,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Joins a worker that has already marked itself stopping.
    pub fn reap(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Forces the worker off its socket and joins it. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        let _ = self.control.shutdown(std::net::Shutdown::Both);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Closes a connection we cannot service because another client holds the
/// slot. Best-effort: the error message may not arrive if the peer is
/// already gone.
pub fn reject_client(stream: UnixStream) {
    let msg = protocol::Error {
        code: protocol::ErrorCode::AlreadyConnected as i32,
        message: "another client is connected".to_string(),
    };

    let mut scratch = [0u8; 256];
    if let Ok(len) = protocol::encode_message(&msg.into(), &mut scratch) {
        let mut stream = stream;
        let _ = stream.write_all(&scratch[..len]);
    }
}

struct Worker<'a> {
    socket: UnixStream,
    shared: &'a SessionShared,
    ctx: &'a WorkerContext,
    hello_done: bool,
    in_frame: bool,
    frame_id: u64,
    scratch: Vec<u8>,
}

fn run_worker(
    socket: UnixStream,
    shared: &SessionShared,
    ctx: &WorkerContext,
) -> Result<(), WorkerError> {
    let mut worker = Worker {
        socket,
        shared,
        ctx,
        hello_done: false,
        in_frame: false,
        frame_id: 0,
        scratch: vec![0; protocol::MAX_MESSAGE_SIZE],
    };

    let mut buf = BytesMut::with_capacity(protocol::MAX_MESSAGE_SIZE);
    let mut read_buf = [0u8; 4096];

    loop {
        loop {
            match protocol::decode_message(&buf) {
                Ok((msg, len)) => {
                    buf.advance(len);
                    trace!("received {msg}");
                    worker.handle(msg)?;
                }
                Err(protocol::ProtocolError::ShortBuffer(_)) => break,
                Err(e) => {
                    worker.send_error(
                        protocol::ErrorCode::Protocol,
                        &format!("bad message: {e}"),
                    );
                    return Err(e.into());
                }
            }
        }

        let n = worker.socket.read(&mut read_buf)?;
        if n == 0 {
            if !buf.is_empty() {
                return Err(WorkerError::Protocol(
                    "connection closed mid-message".to_string(),
                ));
            }
            return Ok(());
        }

        buf.extend_from_slice(&read_buf[..n]);
    }
}

impl Worker<'_> {
    fn handle(&mut self, msg: protocol::MessageType) -> Result<(), WorkerError> {
        use protocol::MessageType;

        if !self.hello_done && !matches!(msg, MessageType::ClientHello(_)) {
            return Err(WorkerError::Protocol(format!(
                "expected ClientHello, got {msg}"
            )));
        }

        match msg {
            MessageType::ClientHello(hello) => self.handle_hello(hello),
            MessageType::CreateSwapchain(req) => self.handle_create_swapchain(req),
            MessageType::DestroySwapchain(req) => self.handle_destroy_swapchain(req),
            MessageType::BeginFrame(_) => {
                self.in_frame = true;
                self.send(protocol::FrameBegun {}.into(), &[])
            }
            MessageType::EndFrame(req) => self.handle_end_frame(req),
            MessageType::WaitFrame(_) => {
                self.frame_id += 1;
                self.send(
                    protocol::FrameTiming {
                        predicted_display_ns: monotonic_ns() + self.ctx.frame_interval_ns,
                        frame_id: self.frame_id,
                    }
                    .into(),
                    &[],
                )
            }
            MessageType::DeviceStateRequest(req) => self.handle_device_state(req),
            other => Err(WorkerError::Protocol(format!(
                "unexpected message {other}"
            ))),
        }
    }

    fn handle_hello(&mut self, hello: protocol::ClientHello) -> Result<(), WorkerError> {
        if self.hello_done {
            return Err(WorkerError::Protocol("duplicate ClientHello".to_string()));
        }

        debug!(name = %hello.name, version = hello.version, "client handshake");

        let reply = protocol::ServerHello {
            shm_size: self.ctx.catalogue.size() as u64,
            num_devices: self.ctx.devices.devices.len() as u32,
        };

        self.hello_done = true;
        self.shared.active.store(true, Ordering::Release);

        let catalogue_fd = self.ctx.catalogue.fd();
        self.send(reply.into(), &[catalogue_fd])?;
        Ok(())
    }

    fn handle_create_swapchain(
        &mut self,
        req: protocol::CreateSwapchain,
    ) -> Result<(), WorkerError> {
        if req.id as usize >= MAX_SWAPCHAINS {
            self.send_error(
                protocol::ErrorCode::BadSwapchain,
                &format!("swapchain id {} out of range", req.id),
            );
            return Ok(());
        }

        let spec = SwapchainSpec {
            width: req.width,
            height: req.height,
            format: req.format,
            array_size: req.array_size,
            image_count: req.image_count,
        };

        let swapchain = match Swapchain::new(req.id, spec) {
            Ok(sc) => Arc::new(sc),
            Err(e) => {
                warn!("swapchain allocation failed: {e}");
                self.send_error(protocol::ErrorCode::Server, "allocation failed");
                return Ok(());
            }
        };

        {
            let mut table = self.shared.swapchains.lock();
            if table[req.id as usize].is_some() {
                self.send_error(
                    protocol::ErrorCode::BadSwapchain,
                    &format!("swapchain id {} already in use", req.id),
                );
                return Ok(());
            }

            table[req.id as usize] = Some(swapchain.clone());
        }
        self.shared.num_swapchains.fetch_add(1, Ordering::AcqRel);

        debug!(
            id = req.id,
            width = req.width,
            height = req.height,
            images = swapchain.image_count(),
            "swapchain created"
        );

        let reply = protocol::SwapchainCreated {
            id: req.id,
            image_count: swapchain.image_count(),
        };
        self.send(reply.into(), &swapchain.image_fds())
    }

    fn handle_destroy_swapchain(
        &mut self,
        req: protocol::DestroySwapchain,
    ) -> Result<(), WorkerError> {
        let removed = self
            .shared
            .swapchains
            .lock()
            .get_mut(req.id as usize)
            .and_then(Option::take);

        match removed {
            Some(_) => {
                self.shared.num_swapchains.fetch_sub(1, Ordering::AcqRel);
                debug!(id = req.id, "swapchain destroyed");
                self.send(protocol::SwapchainDestroyed { id: req.id }.into(), &[])
            }
            None => {
                self.send_error(
                    protocol::ErrorCode::BadSwapchain,
                    &format!("no swapchain with id {}", req.id),
                );
                Ok(())
            }
        }
    }

    fn handle_end_frame(&mut self, req: protocol::EndFrame) -> Result<(), WorkerError> {
        if !self.in_frame {
            return Err(WorkerError::Protocol(
                "EndFrame without BeginFrame".to_string(),
            ));
        }
        self.in_frame = false;

        if req.layers.len() > MAX_LAYERS {
            return Err(WorkerError::Protocol(format!(
                "{} layers submitted, max is {MAX_LAYERS}",
                req.layers.len()
            )));
        }

        let mut converted = [LayerRenderState::default(); MAX_LAYERS];
        for (i, layer) in req.layers.iter().enumerate() {
            converted[i] = convert_layer(layer)
                .map_err(WorkerError::Protocol)?;
        }
        let num_layers = req.layers.len();

        self.shared.handoff.submit(|state| {
            state.num_layers = num_layers;
            state.layers[..num_layers].copy_from_slice(&converted[..num_layers]);
        });

        trace!(num_layers, "frame submitted");
        self.send(protocol::FrameEnded {}.into(), &[])
    }

    fn handle_device_state(
        &mut self,
        req: protocol::DeviceStateRequest,
    ) -> Result<(), WorkerError> {
        let Some(device) = self.ctx.devices.devices.get(req.device_index as usize) else {
            self.send_error(
                protocol::ErrorCode::Protocol,
                &format!("no device at index {}", req.device_index),
            );
            return Ok(());
        };

        // Live values come from the driver layer; without one, every input
        // reads neutral.
        let now = monotonic_ns();
        let inputs = (0..device.inputs.len() as u32)
            .map(|input_index| protocol::InputValue {
                input_index,
                value_x: 0.0,
                value_y: 0.0,
                pressed: false,
                timestamp_ns: now,
            })
            .collect();

        self.send(
            protocol::DeviceState {
                device_index: req.device_index,
                inputs,
            }
            .into(),
            &[],
        )
    }

    fn send(
        &mut self,
        msg: protocol::MessageType,
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), WorkerError> {
        let len = protocol::encode_message(&msg, &mut self.scratch)?;
        trace!(len, fds = fds.len(), "sending {msg}");

        if fds.is_empty() {
            self.socket.write_all(&self.scratch[..len])?;
            return Ok(());
        }

        // Ancillary data rides with the first byte of the frame.
        let raw_fds: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let iov = [std::io::IoSlice::new(&self.scratch[..len])];
        let cmsg = [ControlMessage::ScmRights(&raw_fds)];

        let sent = sendmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(std::io::Error::from)?;

        if sent < len {
            self.socket.write_all(&self.scratch[sent..len])?;
        }

        Ok(())
    }

    fn send_error(&mut self, code: protocol::ErrorCode, message: &str) {
        let msg = protocol::Error {
            code: code as i32,
            message: message.to_string(),
        };

        if let Err(e) = self.send(msg.into(), &[]) {
            debug!("failed to send error to client: {e}");
        }
    }
}

fn convert_layer(layer: &protocol::Layer) -> Result<LayerRenderState, String> {
    let kind = protocol::LayerKind::try_from(layer.kind)
        .map_err(|_| format!("unknown layer kind {}", layer.kind))?;

    let flags = LayerFlags {
        unpremultiplied_alpha: layer.flags & protocol::LAYER_FLAG_UNPREMULTIPLIED_ALPHA != 0,
        flip_y: layer.flags & protocol::LAYER_FLAG_FLIP_Y != 0,
    };

    let data = match kind {
        protocol::LayerKind::StereoProjection => {
            let [left, right] = layer.views.as_slice() else {
                return Err(format!(
                    "stereo projection layer with {} views",
                    layer.views.len()
                ));
            };

            LayerData::StereoProjection {
                views: [convert_view(left), convert_view(right)],
            }
        }
        protocol::LayerKind::Quad => {
            let [view] = layer.views.as_slice() else {
                return Err(format!("quad layer with {} views", layer.views.len()));
            };

            let pose = layer.pose.ok_or_else(|| "quad layer without pose".to_string())?;
            let size = layer.size.ok_or_else(|| "quad layer without size".to_string())?;

            LayerData::Quad {
                pose: convert_pose(&pose),
                size: glam::Vec2::new(size.width, size.height),
                view: convert_view(view),
            }
        }
        other => return Err(format!("unsupported layer kind {other:?}")),
    };

    Ok(LayerRenderState { flags, data })
}

fn convert_view(view: &protocol::LayerView) -> LayerView {
    LayerView {
        swapchain_id: view.swapchain_id,
        image_index: view.image_index,
        array_index: view.array_index,
        sub_rect: view
            .rect
            .as_ref()
            .map(|r| SubRect {
                x: r.x,
                y: r.y,
                width: r.width,
                height: r.height,
            })
            .unwrap_or_default(),
    }
}

fn convert_pose(pose: &protocol::Pose) -> crate::devices::Pose {
    let orientation = pose
        .orientation
        .map(|q| glam::Quat::from_xyzw(q.x, q.y, q.z, q.w))
        .unwrap_or(glam::Quat::IDENTITY);
    let position = pose
        .position
        .map(|v| glam::Vec3::new(v.x, v.y, v.z))
        .unwrap_or(glam::Vec3::ZERO);

    crate::devices::Pose {
        orientation,
        position,
    }
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalogue, devices};
    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use std::io::IoSliceMut;
    use std::os::fd::RawFd;

    fn test_ctx(tag: &str) -> WorkerContext {
        let devices = Arc::new(devices::simulated());
        let shm_name = format!("/oxserver-session-test-{}-{tag}", std::process::id());
        let catalogue =
            Arc::new(catalogue::SharedCatalogue::build(&devices, &shm_name).unwrap());

        WorkerContext {
            catalogue,
            devices,
            running: Arc::new(AtomicBool::new(true)),
            exit_on_disconnect: false,
            frame_interval_ns: 11_111_111,
        }
    }

    /// Reads one framed message plus any attached fds off the client side.
    fn recv_one(stream: &UnixStream, buf: &mut BytesMut) -> (protocol::MessageType, Vec<RawFd>) {
        let mut fds = Vec::new();

        loop {
            if let Ok((msg, len)) = protocol::decode_message(buf) {
                buf.advance(len);
                return (msg, fds);
            }

            let mut data = [0u8; 4096];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_SWAPCHAINS]);
            let mut iov = [IoSliceMut::new(&mut data)];

            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .unwrap();

            for cmsg in msg.cmsgs().unwrap() {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    fds.extend(received);
                }
            }

            let n = msg.bytes;
            assert!(n > 0, "worker hung up early");
            buf.extend_from_slice(&data[..n]);
        }
    }

    fn send_one(stream: &mut UnixStream, msg: protocol::MessageType) {
        let mut scratch = [0u8; protocol::MAX_MESSAGE_SIZE];
        let len = protocol::encode_message(&msg, &mut scratch).unwrap();
        stream.write_all(&scratch[..len]).unwrap();
    }

    #[test]
    fn client_lifecycle() {
        let (server_end, mut client) = UnixStream::pair().unwrap();
        let session = ClientSession::spawn(server_end, test_ctx("lifecycle")).unwrap();

        assert!(!session.is_active());

        // Handshake: the catalogue fd arrives with ServerHello.
        let mut buf = BytesMut::new();
        send_one(
            &mut client,
            protocol::ClientHello {
                name: "test".into(),
                version: PROTOCOL_VERSION,
            }
            .into(),
        );

        let (reply, fds) = recv_one(&client, &mut buf);
        let protocol::MessageType::ServerHello(hello) = reply else {
            panic!("expected ServerHello, got {reply}");
        };
        assert_eq!(hello.shm_size, catalogue::LAYOUT_SIZE as u64);
        assert_eq!(fds.len(), 1);
        assert!(session.is_active());

        // Create a swapchain; one fd per image comes back.
        send_one(
            &mut client,
            protocol::CreateSwapchain {
                id: 0,
                width: 64,
                height: 64,
                format: 37,
                array_size: 1,
                image_count: 3,
            }
            .into(),
        );

        let (reply, fds) = recv_one(&client, &mut buf);
        assert!(matches!(reply, protocol::MessageType::SwapchainCreated(_)));
        assert_eq!(fds.len(), 3);
        assert_eq!(session.shared().num_swapchains(), 1);
        assert!(session.shared().lookup_swapchain(0).is_some());
        assert!(session.shared().lookup_swapchain(1).is_none());

        // Submit a frame and watch it land in the handoff.
        send_one(&mut client, protocol::BeginFrame {}.into());
        let (reply, _) = recv_one(&client, &mut buf);
        assert!(matches!(reply, protocol::MessageType::FrameBegun(_)));

        send_one(
            &mut client,
            protocol::EndFrame {
                layers: vec![protocol::Layer {
                    kind: protocol::LayerKind::StereoProjection as i32,
                    flags: protocol::LAYER_FLAG_FLIP_Y,
                    views: vec![
                        protocol::LayerView {
                            swapchain_id: 0,
                            image_index: 1,
                            array_index: 0,
                            rect: None,
                        },
                        protocol::LayerView {
                            swapchain_id: 0,
                            image_index: 1,
                            array_index: 1,
                            rect: None,
                        },
                    ],
                    pose: None,
                    size: None,
                }],
            }
            .into(),
        );

        let (reply, _) = recv_one(&client, &mut buf);
        assert!(matches!(reply, protocol::MessageType::FrameEnded(_)));

        let consumed = session
            .shared()
            .handoff
            .try_consume(|state| {
                assert_eq!(state.num_layers, 1);
                assert!(state.layers[0].flags.flip_y);
                matches!(
                    state.layers[0].data,
                    LayerData::StereoProjection { .. }
                )
            })
            .unwrap();
        assert!(consumed);

        // Disconnect; the worker marks itself stopping.
        drop(client);
        session.reap();
    }

    #[test]
    fn messages_before_hello_are_fatal() {
        let (server_end, mut client) = UnixStream::pair().unwrap();
        let session = ClientSession::spawn(server_end, test_ctx("nohello")).unwrap();

        send_one(&mut client, protocol::BeginFrame {}.into());

        // The worker tears the connection down without activating.
        let mut spins = 0;
        while !session.is_stopping() {
            std::thread::sleep(std::time::Duration::from_millis(1));
            spins += 1;
            assert!(spins < 5000, "worker did not stop");
        }
        assert!(!session.is_active());
        session.reap();
    }

    #[test]
    fn exit_on_disconnect_clears_running() {
        let (server_end, client) = UnixStream::pair().unwrap();
        let mut ctx = test_ctx("exitflag");
        ctx.exit_on_disconnect = true;
        let running = ctx.running.clone();

        let session = ClientSession::spawn(server_end, ctx).unwrap();

        drop(client);
        session.reap();
        assert!(!running.load(Ordering::Acquire));
    }
}
