// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Message payloads, hand-annotated rather than generated so the crate
//! builds without a protoc toolchain. Tags are wire-stable; never reuse a
//! retired tag.

/// Layer content flags, carried in [`Layer::flags`].
pub const LAYER_FLAG_UNPREMULTIPLIED_ALPHA: u32 = 1 << 0;
pub const LAYER_FLAG_FLIP_Y: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    /// A malformed or out-of-order message.
    Protocol = 1,
    /// Another client already holds the session slot.
    AlreadyConnected = 2,
    /// A swapchain id was out of range or the slot was occupied/empty.
    BadSwapchain = 3,
    /// An internal server failure; the connection is being torn down.
    Server = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LayerKind {
    None = 0,
    StereoProjection = 1,
    Quad = 2,
    // Reserved for compositor revisions that composite these natively.
    Cube = 3,
    Cylinder = 4,
    Equirect1 = 5,
    Equirect2 = 6,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// The first message on a fresh connection, client to server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHello {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub version: u32,
}

/// The handshake response. The shared device catalogue's file descriptor
/// rides along as SCM_RIGHTS ancillary data.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerHello {
    #[prost(uint64, tag = "1")]
    pub shm_size: u64,
    #[prost(uint32, tag = "2")]
    pub num_devices: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateSwapchain {
    /// Client-assigned slot id.
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub width: u32,
    #[prost(uint32, tag = "3")]
    pub height: u32,
    /// A VkFormat value; the server does not interpret it beyond bookkeeping.
    #[prost(uint32, tag = "4")]
    pub format: u32,
    #[prost(uint32, tag = "5")]
    pub array_size: u32,
    #[prost(uint32, tag = "6")]
    pub image_count: u32,
}

/// Acknowledges a swapchain; one buffer file descriptor per image is
/// attached as SCM_RIGHTS ancillary data, in image order.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapchainCreated {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub image_count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DestroySwapchain {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SwapchainDestroyed {
    #[prost(uint32, tag = "1")]
    pub id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BeginFrame {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameBegun {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EndFrame {
    #[prost(message, repeated, tag = "1")]
    pub layers: Vec<Layer>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameEnded {}

/// Requests frame timing. The client then blocks on the wait-frame
/// semaphore in the shared catalogue until the compositor signals.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WaitFrame {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameTiming {
    #[prost(uint64, tag = "1")]
    pub predicted_display_ns: u64,
    #[prost(uint64, tag = "2")]
    pub frame_id: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceStateRequest {
    #[prost(uint32, tag = "1")]
    pub device_index: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceState {
    #[prost(uint32, tag = "1")]
    pub device_index: u32,
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<InputValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InputValue {
    /// Index into the device's slice of the catalogue's flat input array.
    #[prost(uint32, tag = "1")]
    pub input_index: u32,
    #[prost(float, tag = "2")]
    pub value_x: f32,
    #[prost(float, tag = "3")]
    pub value_y: f32,
    #[prost(bool, tag = "4")]
    pub pressed: bool,
    #[prost(uint64, tag = "5")]
    pub timestamp_ns: u64,
}

/// A composition layer, submitted with EndFrame. Stereo projection layers
/// carry two views (left, right); quad layers carry one, plus a pose and
/// size in meters.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Layer {
    #[prost(enumeration = "LayerKind", tag = "1")]
    pub kind: i32,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
    #[prost(message, repeated, tag = "3")]
    pub views: Vec<LayerView>,
    #[prost(message, optional, tag = "4")]
    pub pose: Option<Pose>,
    #[prost(message, optional, tag = "5")]
    pub size: Option<Extent2D>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LayerView {
    #[prost(uint32, tag = "1")]
    pub swapchain_id: u32,
    #[prost(uint32, tag = "2")]
    pub image_index: u32,
    #[prost(uint32, tag = "3")]
    pub array_index: u32,
    #[prost(message, optional, tag = "4")]
    pub rect: Option<Rect>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rect {
    #[prost(sint32, tag = "1")]
    pub x: i32,
    #[prost(sint32, tag = "2")]
    pub y: i32,
    #[prost(uint32, tag = "3")]
    pub width: u32,
    #[prost(uint32, tag = "4")]
    pub height: u32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Vec3 {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Quat {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
    #[prost(float, tag = "4")]
    pub w: f32,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Pose {
    #[prost(message, optional, tag = "1")]
    pub orientation: Option<Quat>,
    #[prost(message, optional, tag = "2")]
    pub position: Option<Vec3>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Extent2D {
    #[prost(float, tag = "1")]
    pub width: f32,
    #[prost(float, tag = "2")]
    pub height: f32,
}
