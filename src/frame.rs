//! WebSocket frame codec according to RFC 6455.
//!
//! Implements the wire format for framing messages: header parsing and
//! serialization across all three payload size classes, client-to-server
//! masking, and control frame validation.
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SockError;

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    // 0x3-0x7 reserved for non-control frames
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
    // 0xB-0xF reserved for control frames
}

impl Opcode {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Try to parse an opcode from a byte value. Reserved values are a
    /// protocol error.
    pub fn from_u8(value: u8) -> Result<Self, SockError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(SockError::DataFormat(format!(
                "reserved opcode 0x{value:X}"
            ))),
        }
    }
}

/// Close status codes carried in the first two payload bytes of a Close
/// frame.
///
/// `NoStatus` and `BadStatus` are internal sentinels for "no payload" and
/// "unrecognized code"; they are never serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Endpoint is going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data type (1003).
    Unsupported = 1003,
    /// Inconsistent payload data, e.g. non-UTF-8 text (1007).
    Inconsistent = 1007,
    /// Policy violation (1008).
    Policy = 1008,
    /// Message too big (1009).
    TooBig = 1009,
    /// Client expected an extension the server did not negotiate (1010).
    ExpectedExtension = 1010,
    /// Unexpected server-side error (1011).
    Unexpected = 1011,
    /// Sentinel: the close frame carried no status code (4000).
    NoStatus = 4000,
    /// Sentinel: the close frame carried an unrecognized code (4001).
    BadStatus = 4001,
}

impl CloseCode {
    /// Maps a wire value to a known code, or `BadStatus` when the value
    /// is not one this library recognizes.
    #[must_use]
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1007 => Self::Inconsistent,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::ExpectedExtension,
            1011 => Self::Unexpected,
            _ => Self::BadStatus,
        }
    }

    /// Returns true if this code may appear in a serialized close frame.
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        !matches!(self, Self::NoStatus | Self::BadStatus)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// A single WebSocket frame: header plus unmasked payload.
///
/// The payload is always plaintext in memory; masked frames are unmasked
/// in place during decode, and the encoder re-applies the mask when
/// `masked` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the frame was (or will be) masked on the wire.
    pub masked: bool,
    /// Masking key, present iff `masked`.
    pub mask_key: Option<[u8; 4]>,
    /// Payload data (plaintext).
    pub payload: Bytes,
}

impl Frame {
    /// Create a final, unmasked text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Create a final, unmasked ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Create a final, unmasked pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Create a final, unmasked close frame with an optional status code
    /// and reason text. A non-sendable sentinel code yields an empty
    /// payload.
    #[must_use]
    pub fn close(code: Option<CloseCode>, reason: Option<&str>) -> Self {
        let payload = match code.filter(|c| c.is_sendable()) {
            None => Bytes::new(),
            Some(code) => {
                let reason = reason.unwrap_or_default();
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(u16::from(code));
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
        };
        Self {
            fin: true,
            opcode: Opcode::Close,
            masked: false,
            mask_key: None,
            payload,
        }
    }

    /// Marks the frame for masked serialization with the given key.
    ///
    /// The in-memory payload stays plaintext; the encoder applies the
    /// XOR when writing. Used by client-side test harnesses.
    #[must_use]
    pub fn mask(mut self, key: [u8; 4]) -> Self {
        self.masked = true;
        self.mask_key = Some(key);
        self
    }

    /// A copy of this frame that will serialize unmasked. Used when a
    /// received frame is re-emitted verbatim (close echo).
    #[must_use]
    pub fn unmasked(&self) -> Self {
        Self {
            fin: self.fin,
            opcode: self.opcode,
            masked: false,
            mask_key: None,
            payload: self.payload.clone(),
        }
    }
}

/// Role in the connection; decides which side of the masking rule the
/// decoder enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client role: inbound (server-originated) frames must be unmasked.
    Client,
    /// Server role: inbound (client-originated) frames must be masked.
    Server,
}

/// Decode state machine for the frame codec.
#[derive(Debug)]
enum DecodeState {
    /// Waiting for the first 2 header bytes.
    Header,
    /// Reading the 2- or 8-byte extended payload length.
    ExtendedLength {
        fin: bool,
        opcode: Opcode,
        masked: bool,
        bytes_needed: usize,
    },
    /// Reading the 4-byte mask key.
    MaskKey {
        fin: bool,
        opcode: Opcode,
        payload_len: usize,
    },
    /// Reading the payload.
    Payload {
        fin: bool,
        opcode: Opcode,
        mask_key: Option<[u8; 4]>,
        payload_len: usize,
    },
}

/// WebSocket frame codec.
///
/// Decoding is an explicit state machine over a `BytesMut`; incomplete
/// input yields `Ok(None)` and consumed header bytes are remembered in
/// the state, so the caller may feed data in arbitrary chunks.
#[derive(Debug)]
pub struct FrameCodec {
    /// Maximum whole-frame size (header + payload) accepted on decode.
    max_receive_size: usize,
    /// Which masking rule to enforce on inbound frames.
    role: Role,
    /// Current decode state.
    state: DecodeState,
}

impl FrameCodec {
    /// Default maximum whole-frame size accepted on decode.
    pub const DEFAULT_MAX_RECEIVE_SIZE: usize = 16 * 1024;

    /// Creates a codec for the given role.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            max_receive_size: Self::DEFAULT_MAX_RECEIVE_SIZE,
            role,
            state: DecodeState::Header,
        }
    }

    /// Creates a server-role codec (inbound frames must be masked).
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Creates a client-role codec (inbound frames must be unmasked).
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Sets the maximum whole-frame size accepted on decode.
    #[must_use]
    pub fn max_receive_size(mut self, size: usize) -> Self {
        self.max_receive_size = size;
        self
    }

    /// Header length implied by the current state parameters.
    fn header_len(payload_len: usize, masked: bool) -> usize {
        let ext = if payload_len > 65_535 {
            8
        } else if payload_len > MAX_CONTROL_PAYLOAD {
            2
        } else {
            0
        };
        2 + ext + if masked { 4 } else { 0 }
    }

    fn check_frame_size(&self, payload_len: usize, masked: bool) -> Result<(), SockError> {
        let frame_len = payload_len.saturating_add(Self::header_len(payload_len, masked));
        if frame_len > self.max_receive_size {
            return Err(SockError::Oversize {
                size: frame_len,
                max: self.max_receive_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SockError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }

                    let first_byte = src[0];
                    let second_byte = src[1];

                    let fin = (first_byte & 0x80) != 0;
                    let rsv = first_byte & 0x70;
                    let opcode_raw = first_byte & 0x0F;
                    let masked = (second_byte & 0x80) != 0;
                    let len7 = second_byte & 0x7F;

                    // No extensions are negotiated, so any reserved bit
                    // is a protocol violation.
                    if rsv != 0 {
                        return Err(SockError::DataFormat("reserved bits set".into()));
                    }

                    let opcode = Opcode::from_u8(opcode_raw)?;

                    // Masking rules (RFC 6455 Section 5.1): client-to-server
                    // frames must be masked, server-to-client must not.
                    match self.role {
                        Role::Server if !masked => {
                            return Err(SockError::DataFormat(
                                "client frame must be masked".into(),
                            ));
                        }
                        Role::Client if masked => {
                            return Err(SockError::DataFormat(
                                "server frame must not be masked".into(),
                            ));
                        }
                        _ => {}
                    }

                    if opcode.is_control() {
                        if !fin {
                            return Err(SockError::DataFormat(
                                "control frame cannot be fragmented".into(),
                            ));
                        }
                        if usize::from(len7) > MAX_CONTROL_PAYLOAD {
                            return Err(SockError::DataFormat(format!(
                                "control frame payload of {len7} bytes exceeds 125"
                            )));
                        }
                    }

                    let _ = src.split_to(2);

                    match len7 {
                        126 => {
                            self.state = DecodeState::ExtendedLength {
                                fin,
                                opcode,
                                masked,
                                bytes_needed: 2,
                            };
                        }
                        127 => {
                            self.state = DecodeState::ExtendedLength {
                                fin,
                                opcode,
                                masked,
                                bytes_needed: 8,
                            };
                        }
                        _ => {
                            let payload_len = usize::from(len7);
                            self.check_frame_size(payload_len, masked)?;
                            if masked {
                                self.state = DecodeState::MaskKey {
                                    fin,
                                    opcode,
                                    payload_len,
                                };
                            } else {
                                self.state = DecodeState::Payload {
                                    fin,
                                    opcode,
                                    mask_key: None,
                                    payload_len,
                                };
                            }
                        }
                    }
                }

                DecodeState::ExtendedLength {
                    fin,
                    opcode,
                    masked,
                    bytes_needed,
                } => {
                    if src.len() < *bytes_needed {
                        return Ok(None);
                    }

                    let declared: u64 = if *bytes_needed == 2 {
                        let bytes = src.split_to(2);
                        u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                    } else {
                        let bytes = src.split_to(8);
                        u64::from_be_bytes([
                            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                            bytes[7],
                        ])
                    };

                    let fin = *fin;
                    let opcode = *opcode;
                    let masked = *masked;

                    let payload_len = usize::try_from(declared).map_err(|_| {
                        SockError::Oversize {
                            size: usize::MAX,
                            max: self.max_receive_size,
                        }
                    })?;
                    // Reset so a rejected frame does not poison the next
                    // decode attempt.
                    self.state = DecodeState::Header;
                    self.check_frame_size(payload_len, masked)?;

                    if masked {
                        self.state = DecodeState::MaskKey {
                            fin,
                            opcode,
                            payload_len,
                        };
                    } else {
                        self.state = DecodeState::Payload {
                            fin,
                            opcode,
                            mask_key: None,
                            payload_len,
                        };
                    }
                }

                DecodeState::MaskKey {
                    fin,
                    opcode,
                    payload_len,
                } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let fin = *fin;
                    let opcode = *opcode;
                    let payload_len = *payload_len;

                    let bytes = src.split_to(4);
                    let mut mask_key = [0u8; 4];
                    mask_key.copy_from_slice(&bytes);

                    self.state = DecodeState::Payload {
                        fin,
                        opcode,
                        mask_key: Some(mask_key),
                        payload_len,
                    };
                }

                DecodeState::Payload {
                    fin,
                    opcode,
                    mask_key,
                    payload_len,
                } => {
                    if src.len() < *payload_len {
                        return Ok(None);
                    }

                    let mut payload = src.split_to(*payload_len);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, *key);
                    }

                    let frame = Frame {
                        fin: *fin,
                        opcode: *opcode,
                        masked: mask_key.is_some(),
                        mask_key: *mask_key,
                        payload: payload.freeze(),
                    };

                    self.state = DecodeState::Header;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SockError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(SockError::DataFormat(
                    "control frame cannot be fragmented".into(),
                ));
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(SockError::DataFormat(format!(
                    "control frame payload of {payload_len} bytes exceeds 125"
                )));
            }
        }

        // Server-originated frames never carry a mask; a masked frame
        // reaching a server-role encoder means a received frame was
        // re-emitted without clearing the mask first.
        if frame.masked && self.role == Role::Server {
            return Err(SockError::Internal(
                "server frames must not be masked".into(),
            ));
        }
        let mask_key = if frame.masked {
            Some(frame.mask_key.ok_or_else(|| {
                SockError::Internal("masked frame without a mask key".into())
            })?)
        } else {
            None
        };

        let mut first_byte = frame.opcode as u8;
        if frame.fin {
            first_byte |= 0x80;
        }

        let mask_bit: u8 = if mask_key.is_some() { 0x80 } else { 0 };

        dst.reserve(Self::header_len(payload_len, mask_key.is_some()) + payload_len);
        dst.put_u8(first_byte);

        if payload_len <= MAX_CONTROL_PAYLOAD {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65_535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if let Some(key) = mask_key {
            dst.put_slice(&key);
            let mut masked_payload = BytesMut::from(frame.payload.as_ref());
            apply_mask(&mut masked_payload, key);
            dst.put_slice(&masked_payload);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

/// Apply XOR masking to payload data, in place.
///
/// Masking and unmasking are the same operation, so this serves both
/// directions.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Serializes a server-originated frame into a write-queue blob.
pub(crate) fn to_wire(frame: Frame) -> Result<Bytes, SockError> {
    let mut codec = FrameCodec::server();
    let mut buf = BytesMut::with_capacity(frame.payload.len() + 14);
    codec.encode(frame, &mut buf)?;
    Ok(buf.freeze())
}
