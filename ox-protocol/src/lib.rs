// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! The IPC protocol spoken between the runtime server and its clients.
//!
//! Each frame is a varint message id, a varint payload length, and a
//! protobuf-encoded payload. Graphics buffers and the shared device
//! catalogue never travel in-band; their file descriptors are attached as
//! ancillary data (SCM_RIGHTS) to the message that announces them.

mod messages;

pub use messages::*;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("protobuf encode error: {0}")]
    ProtobufEncode(#[from] prost::EncodeError),
    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),
    #[error("short buffer, need {0} bytes")]
    ShortBuffer(usize),
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid message type: {0} (len={1})")]
    InvalidMessageType(u32, usize),
}

/// Frames larger than this are rejected outright; nothing the protocol
/// carries comes close.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Declares the message catalogue: wire id = payload struct. Generates the
/// dispatch enum plus the per-variant plumbing the framing layer needs.
macro_rules! define_messages {
    ($($id:literal = $name:ident),* $(,)?) => {
        /// Every message the runtime speaks, tagged with its wire id.
        #[derive(Clone, Debug, PartialEq)]
        pub enum MessageType {
            $($name($name),)*
        }

        $(impl From<$name> for MessageType {
            fn from(msg: $name) -> Self {
                MessageType::$name(msg)
            }
        })*

        impl MessageType {
            pub fn id(&self) -> u32 {
                match self {
                    $(MessageType::$name(_) => $id,)*
                }
            }

            fn name(&self) -> &'static str {
                match self {
                    $(MessageType::$name(_) => stringify!($name),)*
                }
            }

            fn payload_len(&self) -> usize {
                use prost::Message as _;

                match self {
                    $(MessageType::$name(m) => m.encoded_len(),)*
                }
            }

            fn write_payload<B: bytes::BufMut>(&self, out: &mut B) -> Result<(), ProtocolError> {
                use prost::Message as _;

                match self {
                    $(MessageType::$name(m) => m.encode(out).map_err(ProtocolError::from),)*
                }
            }

            fn read_payload(id: u32, frame_len: usize, payload: &[u8]) -> Result<Self, ProtocolError> {
                use prost::Message as _;

                match id {
                    $($id => Ok($name::decode(payload)?.into()),)*
                    other => Err(ProtocolError::InvalidMessageType(other, frame_len)),
                }
            }
        }

        impl std::fmt::Display for MessageType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", self.name(), self.id())
            }
        }
    };
}

define_messages! {
    1 = Error,
    10 = ClientHello,
    11 = ServerHello,
    20 = CreateSwapchain,
    21 = SwapchainCreated,
    22 = DestroySwapchain,
    23 = SwapchainDestroyed,
    30 = BeginFrame,
    31 = FrameBegun,
    32 = EndFrame,
    33 = FrameEnded,
    34 = WaitFrame,
    35 = FrameTiming,
    40 = DeviceStateRequest,
    41 = DeviceState,
}

/// Reads one frame from the front of `buf`, returning the message and the
/// number of bytes it occupied. A partial frame reports
/// [`ProtocolError::ShortBuffer`] with the byte count needed to make
/// progress.
pub fn decode_message(buf: &[u8]) -> Result<(MessageType, usize), ProtocolError> {
    let mut hdr = octets::Octets::with_slice(buf);

    // A truncated varint just means the header hasn't fully arrived.
    let Ok(id) = hdr.get_varint() else {
        return Err(ProtocolError::ShortBuffer(buf.len() + 1));
    };
    let Ok(payload_len) = hdr.get_varint() else {
        return Err(ProtocolError::ShortBuffer(buf.len() + 1));
    };

    let id = u32::try_from(id).map_err(|_| ProtocolError::InvalidMessage)?;
    let payload_len = usize::try_from(payload_len).map_err(|_| ProtocolError::InvalidMessage)?;

    let header_len = hdr.off();
    let frame_len = header_len + payload_len;

    if id == 0 || frame_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::InvalidMessage);
    }
    if buf.len() < frame_len {
        return Err(ProtocolError::ShortBuffer(frame_len));
    }

    let msg = MessageType::read_payload(id, frame_len, &buf[header_len..frame_len])?;
    Ok((msg, frame_len))
}

/// Writes one frame into `buf`, returning its length. Reports
/// [`ProtocolError::ShortBuffer`] when the slice is too small for the
/// whole frame.
pub fn encode_message(msg: &MessageType, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let payload_len = msg.payload_len();
    let header_len =
        octets::varint_len(msg.id() as u64) + octets::varint_len(payload_len as u64);
    let frame_len = header_len + payload_len;

    if frame_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::InvalidMessage);
    }
    if buf.len() < frame_len {
        return Err(ProtocolError::ShortBuffer(frame_len));
    }

    {
        let mut hdr = octets::OctetsMut::with_slice(buf);
        // Sized against frame_len above; the header always fits.
        hdr.put_varint(msg.id() as u64).expect("header fits");
        hdr.put_varint(payload_len as u64).expect("header fits");
        debug_assert_eq!(hdr.off(), header_len);
    }

    let mut payload = &mut buf[header_len..frame_len];
    msg.write_payload(&mut payload)?;

    Ok(frame_len)
}
