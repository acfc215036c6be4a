//! Close handshake protocol (RFC 6455 Section 7).
//!
//! The close handshake terminates a connection cleanly:
//!
//! 1. One side sends a Close frame with an optional status code and
//!    reason text.
//! 2. The other side echoes a Close frame back.
//! 3. Both sides stop sending data and tear the socket down.
//!
//! `CloseHandshake` tracks which phase this side is in so the close frame
//! is sent or echoed exactly once, and so a locally requested close is
//! idempotent.

use crate::error::SockError;
use crate::frame::{CloseCode, Frame, Opcode};

/// Parsed close frame payload.
///
/// A close payload is either empty, a bare 2-byte status code, or a
/// status code followed by UTF-8 reason text. An absent code is
/// represented by the `NoStatus` sentinel and an unrecognized one by
/// `BadStatus`; neither sentinel is ever serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code.
    pub code: CloseCode,
    /// Reason text, if any.
    pub text: Option<String>,
}

impl CloseReason {
    /// Create a close reason from a code and optional text.
    #[must_use]
    pub fn new(code: CloseCode, text: Option<&str>) -> Self {
        Self {
            code,
            text: text.map(String::from),
        }
    }

    /// Normal closure (1000).
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, None)
    }

    /// Going away (1001), used when this side shuts down.
    #[must_use]
    pub fn going_away() -> Self {
        Self::new(CloseCode::GoingAway, None)
    }

    /// Parse a close frame payload.
    ///
    /// # Errors
    ///
    /// Returns `SockError::DataFormat` for the two malformed shapes: a
    /// payload of exactly one byte, or reason text that is not UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Self, SockError> {
        match payload.len() {
            0 => Ok(Self {
                code: CloseCode::NoStatus,
                text: None,
            }),
            1 => Err(SockError::DataFormat(
                "close payload of a single byte".into(),
            )),
            _ => {
                let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
                let text = if payload.len() > 2 {
                    let text = std::str::from_utf8(&payload[2..]).map_err(|_| {
                        SockError::DataFormat("close reason is not valid UTF-8".into())
                    })?;
                    Some(text.to_string())
                } else {
                    None
                };
                Ok(Self { code, text })
            }
        }
    }

    /// Convert to an unmasked close frame. Sentinel codes produce an
    /// empty payload.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::close(Some(self.code), self.text.as_deref())
    }
}

/// Phase of the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseState {
    /// Normal operation.
    #[default]
    Open,
    /// We sent a close frame and await the peer's echo.
    CloseSent,
    /// The peer sent a close frame and we have echoed it.
    CloseReceived,
    /// Handshake complete; the socket can be torn down.
    Closed,
}

impl CloseState {
    /// True while data frames may still be exchanged.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// True once either side has sent its close frame.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Close handshake state machine.
#[derive(Debug, Default)]
pub struct CloseHandshake {
    state: CloseState,
    our_reason: Option<CloseReason>,
    peer_reason: Option<CloseReason>,
}

impl CloseHandshake {
    /// Create a tracker in the `Open` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> CloseState {
        self.state
    }

    /// True while data frames may still be exchanged.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// The peer's close reason, when they sent one.
    #[must_use]
    pub fn peer_reason(&self) -> Option<&CloseReason> {
        self.peer_reason.as_ref()
    }

    /// Initiate a close from this side.
    ///
    /// Returns the close frame to enqueue, or `None` when a close is
    /// already in flight (making local close requests idempotent).
    pub fn initiate(&mut self, reason: CloseReason) -> Option<Frame> {
        match self.state {
            CloseState::Open => {
                self.state = CloseState::CloseSent;
                let frame = reason.to_frame();
                self.our_reason = Some(reason);
                Some(frame)
            }
            CloseState::CloseSent | CloseState::CloseReceived | CloseState::Closed => None,
        }
    }

    /// Handle a close frame received from the peer.
    ///
    /// When the peer initiates, the returned echo is the peer's own frame
    /// with the mask cleared, so even status codes this library does not
    /// recognize round-trip byte-exactly. When the peer is answering our
    /// close, no echo is produced and the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns `SockError::DataFormat` when the close payload is
    /// malformed; the caller answers that with a protocol-error close.
    pub fn receive_close(&mut self, frame: &Frame) -> Result<Option<Frame>, SockError> {
        if frame.opcode != Opcode::Close {
            return Err(SockError::Internal(format!(
                "receive_close on a {:?} frame",
                frame.opcode
            )));
        }

        let reason = CloseReason::parse(&frame.payload)?;

        match self.state {
            CloseState::Open => {
                self.state = CloseState::CloseReceived;
                self.peer_reason = Some(reason);
                Ok(Some(frame.unmasked()))
            }
            CloseState::CloseSent => {
                self.state = CloseState::Closed;
                self.peer_reason = Some(reason);
                Ok(None)
            }
            // Duplicate close frames are ignored.
            CloseState::CloseReceived | CloseState::Closed => Ok(None),
        }
    }

    /// Force the handshake into `Closed` without further frames, for
    /// errors, timeouts, and abrupt peer disconnects.
    pub fn force_close(&mut self, reason: CloseReason) {
        self.state = CloseState::Closed;
        if self.our_reason.is_none() {
            self.our_reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn parse_empty_payload_is_no_status() {
        let reason = CloseReason::parse(&[]).unwrap();
        assert_eq!(reason.code, CloseCode::NoStatus);
        assert_eq!(reason.text, None);
    }

    #[test]
    fn parse_single_byte_is_rejected() {
        assert!(matches!(
            CloseReason::parse(&[0x03]),
            Err(SockError::DataFormat(_))
        ));
    }

    #[test]
    fn parse_code_and_text() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"going away");
        let reason = CloseReason::parse(&payload).unwrap();
        assert_eq!(reason.code, CloseCode::GoingAway);
        assert_eq!(reason.text.as_deref(), Some("going away"));
    }

    #[test]
    fn parse_unknown_code_is_bad_status() {
        let payload = 2999u16.to_be_bytes();
        let reason = CloseReason::parse(&payload).unwrap();
        assert_eq!(reason.code, CloseCode::BadStatus);
    }

    #[test]
    fn parse_invalid_utf8_reason_is_rejected() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            CloseReason::parse(&payload),
            Err(SockError::DataFormat(_))
        ));
    }

    #[test]
    fn reason_roundtrips_through_frame() {
        let reason = CloseReason::new(CloseCode::Normal, Some("goodbye"));
        let frame = reason.to_frame();
        assert_eq!(frame.opcode, Opcode::Close);
        assert!(!frame.masked);
        let parsed = CloseReason::parse(&frame.payload).unwrap();
        assert_eq!(parsed, reason);
    }

    #[test]
    fn initiate_is_idempotent() {
        let mut handshake = CloseHandshake::new();
        assert!(handshake.initiate(CloseReason::normal()).is_some());
        assert_eq!(handshake.state(), CloseState::CloseSent);
        assert!(handshake.initiate(CloseReason::normal()).is_none());
    }

    #[test]
    fn peer_initiated_close_is_echoed_once() {
        let mut handshake = CloseHandshake::new();
        let peer_close = Frame::close(Some(CloseCode::Normal), None).mask([1, 2, 3, 4]);

        let echo = handshake.receive_close(&peer_close).unwrap().unwrap();
        assert_eq!(echo.opcode, Opcode::Close);
        assert!(!echo.masked, "echo must serialize unmasked");
        assert_eq!(echo.payload, peer_close.payload);
        assert_eq!(handshake.state(), CloseState::CloseReceived);

        // A duplicate close is ignored.
        assert!(handshake.receive_close(&peer_close).unwrap().is_none());
    }

    #[test]
    fn unknown_code_echo_roundtrips_bytes() {
        let mut handshake = CloseHandshake::new();
        let peer_close = Frame {
            fin: true,
            opcode: Opcode::Close,
            masked: false,
            mask_key: None,
            payload: Bytes::copy_from_slice(&3333u16.to_be_bytes()),
        };
        let echo = handshake.receive_close(&peer_close).unwrap().unwrap();
        assert_eq!(echo.payload.as_ref(), &3333u16.to_be_bytes());
    }

    #[test]
    fn our_close_answered_by_peer_completes() {
        let mut handshake = CloseHandshake::new();
        handshake.initiate(CloseReason::normal());

        let peer_close = Frame::close(Some(CloseCode::Normal), None);
        let echo = handshake.receive_close(&peer_close).unwrap();
        assert!(echo.is_none(), "answering close needs no further echo");
        assert_eq!(handshake.state(), CloseState::Closed);
        assert_eq!(
            handshake.peer_reason().map(|r| r.code),
            Some(CloseCode::Normal)
        );
    }

    #[test]
    fn force_close_is_terminal() {
        let mut handshake = CloseHandshake::new();
        handshake.force_close(CloseReason::going_away());
        assert_eq!(handshake.state(), CloseState::Closed);
        assert!(handshake.initiate(CloseReason::normal()).is_none());
    }
}
