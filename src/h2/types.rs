use std::{
    collections::{HashSet, VecDeque},
    fmt,
    time::Instant,
};

use buffet::Piece;
use http::StatusCode;
use loona_hpack::decoder::DecoderError;
use tokio::sync::Notify;

use crate::{util::ReadAndParseError, Request, ResponderError, Response};

use super::{
    body::{StreamIncoming, StreamIncomingError},
    encode::H2EncoderError,
    flow::FlowControl,
    streams::StreamMap,
};
use loona_h2::{FrameType, KnownErrorCode, Settings, SettingsError, StreamId};

/// Sequence of states a connection moves through, cf. the GOAWAY and
/// graceful-pause handling in RFC 9113 section 6.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    New,
    Connected,
    /// A GOAWAY with the maximum stream id went out; we linger for one
    /// round-trip so in-flight streams can still land.
    Pausing,
    Paused,
    Closed,
}

impl ConnectionState {
    pub(crate) fn new_streams_allowed(self) -> bool {
        matches!(self, Self::New | Self::Connected | Self::Pausing)
    }
}

pub(crate) struct ConnState {
    pub(crate) lifecycle: ConnectionState,
    pub(crate) paused_at: Option<Instant>,

    pub(crate) streams: StreamMap,

    pub(crate) self_settings: Settings,
    pub(crate) peer_settings: Settings,

    /// Local SETTINGS frames sent and not yet acknowledged by the peer.
    pub(crate) settings_acks_pending: u32,

    /// Connection-level send window and the backlog of starved streams.
    pub(crate) flow: FlowControl,

    /// Connection-level receive window.
    pub(crate) incoming_capacity: i64,

    /// notified when we have data to send, like when:
    /// - an H2Body has been written to, AND
    /// - the corresponding stream has available capacity
    /// - the connection has available capacity
    pub(crate) send_data_maybe: Notify,
    pub(crate) streams_with_pending_data: HashSet<StreamId>,
}

impl Default for ConnState {
    fn default() -> Self {
        let mut s = Self {
            lifecycle: ConnectionState::New,
            paused_at: None,

            streams: Default::default(),

            self_settings: Default::default(),
            peer_settings: Default::default(),

            settings_acks_pending: 0,

            flow: Default::default(),
            incoming_capacity: 0,

            send_data_maybe: Default::default(),
            streams_with_pending_data: Default::default(),
        };
        s.incoming_capacity = s.self_settings.initial_window_size as _;

        s
    }
}

impl ConnState {
    /// create a new [StreamOutgoing] based on our current settings
    pub(crate) fn mk_stream_outgoing(&self) -> StreamOutgoing {
        StreamOutgoing {
            headers: HeadersOutgoing::WaitingForHeaders,
            body: BodyOutgoing::StillReceiving(Default::default()),
            capacity: self.peer_settings.initial_window_size as _,
            final_response: false,
        }
    }
}

// cf. RFC 9113, 5.1 Stream States:
//
//                               +--------+
//                       send PP |        | recv PP
//                      ,--------+  idle  +--------.
//                     /         |        |         \
//                    v          +--------+          v
//             +----------+          |           +----------+
//             |          |          | send H /  |          |
//      ,------+ reserved |          | recv H    | reserved +------.
//      |      | (local)  |          |           | (remote) |      |
//      |      +---+------+          v           +------+---+      |
//      |          |             +--------+             |          |
//      |          |     recv ES |        | send ES     |          |
//      |   send H |     ,-------+  open  +-------.     | recv H   |
//      |          |    /        |        |        \    |          |
//      |          v   v         +---+----+         v   v          |
//      |      +----------+          |           +----------+      |
//      |      |   half-  |          |           |   half-  |      |
//      |      |  closed  |          | send R /  |  closed  |      |
//      |      | (remote) |          | recv R    | (local)  |      |
//      |      +----+-----+          |           +-----+----+      |
//      |           |                |                 |           |
//      |           | send ES /      |       recv ES / |           |
//      |           |  send R /      v        send R / |           |
//      |           |  recv R    +--------+   recv R   |           |
//      | send R /  `----------->|        |<-----------'  send R / |
//      | recv R                 | closed |               recv R   |
//      `----------------------->|        |<-----------------------'
//                               +--------+
//
// Unlike half of this crate's ancestors, closed streams stay in the map:
// they may still be referenced by the priority tree, and are reaped
// lazily by the stream table's pruning pass.
#[derive(Default)]
pub(crate) enum StreamState {
    /// Known only through PRIORITY frames, no HEADERS yet.
    Idle,

    /// Promised to the peer via PUSH_PROMISE, response not started.
    ReservedLocal { outgoing: StreamOutgoing },

    // we have received full HEADERS
    Open {
        incoming: StreamIncoming,
        outgoing: StreamOutgoing,
    },

    // the peer has sent END_STREAM/RST_STREAM (but we might still send data to the peer)
    HalfClosedRemote {
        outgoing: StreamOutgoing,
    },

    // we have sent END_STREAM/RST_STREAM (but we might still receive data from the peer)
    HalfClosedLocal {
        incoming: StreamIncoming,
    },

    /// Both sides are done (or one of them reset). `final_closed` marks
    /// streams that went straight from idle to closed and only ever
    /// existed as priority-tree nodes; pruning holds on to those longest.
    Closed {
        final_closed: bool,
    },

    // A transition state used for state machine code
    #[default]
    Transition,
}

impl StreamState {
    /// Get the inner `StreamOutgoing` for states in which we may still
    /// send frames to the peer.
    pub(crate) fn outgoing_mut(&mut self) -> Option<&mut StreamOutgoing> {
        match self {
            StreamState::Open { outgoing, .. } => Some(outgoing),
            StreamState::HalfClosedRemote { outgoing, .. } => Some(outgoing),
            StreamState::ReservedLocal { outgoing, .. } => Some(outgoing),
            _ => None,
        }
    }

    pub(crate) fn incoming_mut(&mut self) -> Option<&mut StreamIncoming> {
        match self {
            StreamState::Open { incoming, .. } => Some(incoming),
            StreamState::HalfClosedLocal { incoming, .. } => Some(incoming),
            _ => None,
        }
    }

    /// Streams involved in request processing. Idle and closed streams
    /// exist purely for the priority tree.
    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self,
            StreamState::Open { .. }
                | StreamState::HalfClosedRemote { .. }
                | StreamState::HalfClosedLocal { .. }
                | StreamState::ReservedLocal { .. }
        )
    }

    /// true iff DATA frames may still go out on this stream
    pub(crate) fn can_write(&self) -> bool {
        matches!(
            self,
            StreamState::Open { .. }
                | StreamState::HalfClosedRemote { .. }
                | StreamState::ReservedLocal { .. }
        )
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed { .. })
    }
}

pub(crate) struct StreamOutgoing {
    pub(crate) headers: HeadersOutgoing,
    pub(crate) body: BodyOutgoing,

    // window size of the stream, ie. how many bytes
    // we can send to the receiver before waiting.
    // may go negative after the peer shrinks INITIAL_WINDOW_SIZE.
    pub(crate) capacity: i64,

    /// Set once a final (non-1xx) response went through the encoder, at
    /// which point an empty body means END_STREAM belongs on HEADERS.
    pub(crate) final_response: bool,
}

#[derive(Default)]
pub(crate) enum HeadersOutgoing {
    // We have not yet sent any headers, and are waiting for the user to send them
    WaitingForHeaders,

    // The user gave us headers to send, but we haven't started yet
    WroteNone(Piece),

    // We have sent some headers, but not all (we're still sending CONTINUATION frames)
    WroteSome(Piece),

    // We've sent everything
    #[default]
    WroteAll,
}

impl HeadersOutgoing {
    #[inline(always)]
    pub(crate) fn has_more_to_write(&self) -> bool {
        match self {
            HeadersOutgoing::WaitingForHeaders => true,
            HeadersOutgoing::WroteNone(_) => true,
            HeadersOutgoing::WroteSome(_) => true,
            HeadersOutgoing::WroteAll => false,
        }
    }

    #[inline(always)]
    pub(crate) fn take_piece(&mut self) -> Piece {
        match std::mem::take(self) {
            Self::WroteNone(piece) => piece,
            Self::WroteSome(piece) => piece,
            _ => Piece::empty(),
        }
    }
}

pub(crate) enum BodyOutgoing {
    /// We are still receiving body pieces from the user
    StillReceiving(VecDeque<Piece>),

    /// We have received all body pieces from the user
    DoneReceiving(VecDeque<Piece>),

    /// We have sent all data to the peer
    DoneSending,
}

impl fmt::Debug for BodyOutgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyOutgoing::StillReceiving(pieces) => f
                .debug_tuple("BodyOutgoing::StillReceiving")
                .field(&pieces.len())
                .finish(),
            BodyOutgoing::DoneReceiving(pieces) => f
                .debug_tuple("BodyOutgoing::DoneReceiving")
                .field(&pieces.len())
                .finish(),
            BodyOutgoing::DoneSending => f.debug_tuple("BodyOutgoing::DoneSending").finish(),
        }
    }
}

impl BodyOutgoing {
    /// It's still possible for the user to send more data
    #[inline(always)]
    pub(crate) fn might_receive_more(&self) -> bool {
        match self {
            BodyOutgoing::StillReceiving(_) => true,
            BodyOutgoing::DoneReceiving(_) => true,
            BodyOutgoing::DoneSending => false,
        }
    }

    #[inline(always)]
    pub(crate) fn has_more_to_write(&self) -> bool {
        match self {
            BodyOutgoing::StillReceiving(_) => true,
            BodyOutgoing::DoneReceiving(_) => true,
            BodyOutgoing::DoneSending => false,
        }
    }

    /// Bytes currently queued and ready to be framed.
    #[inline(always)]
    pub(crate) fn queued_len(&self) -> usize {
        match self {
            BodyOutgoing::StillReceiving(pieces) => pieces.iter().map(Piece::len).sum(),
            BodyOutgoing::DoneReceiving(pieces) => pieces.iter().map(Piece::len).sum(),
            BodyOutgoing::DoneSending => 0,
        }
    }

    /// true iff every piece has been received and none are queued
    #[inline(always)]
    pub(crate) fn is_drained_and_done(&self) -> bool {
        match self {
            BodyOutgoing::StillReceiving(_) => false,
            BodyOutgoing::DoneReceiving(pieces) => pieces.is_empty(),
            BodyOutgoing::DoneSending => true,
        }
    }

    #[inline(always)]
    pub(crate) fn pop_front(&mut self) -> Option<Piece> {
        match self {
            BodyOutgoing::StillReceiving(pieces) => pieces.pop_front(),
            BodyOutgoing::DoneReceiving(pieces) => {
                let piece = pieces.pop_front();
                if pieces.is_empty() {
                    *self = BodyOutgoing::DoneSending;
                }
                piece
            }
            BodyOutgoing::DoneSending => None,
        }
    }

    #[inline(always)]
    pub(crate) fn push_front(&mut self, piece: Piece) {
        match self {
            BodyOutgoing::StillReceiving(pieces) => pieces.push_front(piece),
            BodyOutgoing::DoneReceiving(pieces) => pieces.push_front(piece),
            BodyOutgoing::DoneSending => {
                *self = BodyOutgoing::DoneReceiving([piece].into());
            }
        }
    }

    #[inline(always)]
    pub(crate) fn push_back(&mut self, piece: Piece) {
        match self {
            BodyOutgoing::StillReceiving(pieces) => pieces.push_back(piece),
            BodyOutgoing::DoneReceiving(pieces) => pieces.push_back(piece),
            BodyOutgoing::DoneSending => {
                unreachable!("received a piece after we were done sending")
            }
        }
    }
}

/// An error that may either indicate the peer is misbehaving
/// or just a bad request from the client.
#[derive(Debug, thiserror::Error)]
pub(crate) enum H2ErrorLevel {
    #[error("connection error: {0}")]
    Connection(#[from] H2ConnectionError),

    #[error("stream error: {0}")]
    Stream(#[from] H2StreamError),

    #[error("request error: {0}")]
    Request(#[from] H2RequestError),
}

/// The client done goofed, we're returning 4xx most likely
#[derive(thiserror::Error)]
#[error("client error: {status:?}")]
pub(crate) struct H2RequestError {
    pub(crate) status: StatusCode,
    pub(crate) message: Piece,
}

impl fmt::Debug for H2RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("H2RequestError");
        s.field("status", &self.status);
        match std::str::from_utf8(&self.message[..]) {
            Ok(body) => s.field("body", &body),
            Err(_) => s.field("body", &"(not utf-8)"),
        };
        s.finish()
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2ConnectionError {
    #[error("frame too large: {frame_type:?} frame of size {frame_size} exceeds max frame size of {max_frame_size}")]
    FrameTooLarge {
        frame_type: FrameType,
        frame_size: u32,
        max_frame_size: u32,
    },

    #[error("remote hung up while reading payload of {frame_type:?} with length {frame_size}")]
    IncompleteFrame {
        frame_type: FrameType,
        frame_size: u32,
    },

    #[error("headers frame had invalid priority: stream {stream_id} depends on itself")]
    HeadersInvalidPriority { stream_id: StreamId },

    #[error("client tried to initiate an even-numbered stream")]
    ClientSidShouldBeOdd,

    #[error("client stream IDs should be numerically increasing: got {stream_id}, but {max_remote_stream_id} streams were already started")]
    ClientSidShouldBeNumericallyIncreasing {
        stream_id: StreamId,
        max_remote_stream_id: u32,
    },

    #[error("received {frame_type:?} frame with Padded flag but empty payload")]
    PaddedFrameEmpty { frame_type: FrameType },

    #[error("received {frame_type:?} with Padded flag but payload was shorter than padding")]
    PaddedFrameTooShort {
        frame_type: FrameType,
        padding_length: usize,
        frame_size: u32,
    },

    #[error("on stream {stream_id}, expected continuation frame, but got {frame_type:?}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_type: Option<FrameType>,
    },

    #[error("expected continuation for stream {stream_id}, but got continuation for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, received unexpected continuation frame")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("hpack decoding error: {0:?}")]
    HpackDecodingError(#[from] DecoderError),

    #[error("client sent a push promise frame, clients aren't allowed to do that, cf. RFC9113 section 8.4")]
    ClientSentPushPromise,

    #[error("received window update for unknown/closed stream {stream_id}")]
    WindowUpdateForUnknownOrClosedStream { stream_id: StreamId },

    #[error("stream-specific frame {frame_type:?} sent to stream ID 0 (connection-wide)")]
    StreamSpecificFrameToConnection { frame_type: FrameType },

    #[error("error reading/parsing H2 frame: {0:?}")]
    ReadAndParse(ReadAndParseError),

    #[error("error writing H2 frame: {0:?}")]
    WriteError(std::io::Error),

    #[error("H2 responder error: {0:?}")]
    ResponderError(#[from] ResponderError<H2EncoderError>),

    #[error("received rst frame for unknown stream")]
    RstStreamForUnknownStream { stream_id: StreamId },

    #[error("received frame for closed stream {stream_id}")]
    StreamClosed { stream_id: StreamId },

    #[error("received ping frame with non-zero stream id")]
    PingFrameWithNonZeroStreamId { stream_id: StreamId },

    #[error("received ping frame with invalid length {len}")]
    PingFrameInvalidLength { len: u32 },

    #[error("received settings frame with invalid length {len}")]
    SettingsInvalidLength { len: u32 },

    #[error("received settings frame with non-zero stream id")]
    SettingsWithNonZeroStreamId { stream_id: StreamId },

    #[error("received goaway frame with non-zero stream id")]
    GoAwayWithNonZeroStreamId { stream_id: StreamId },

    #[error("zero increment in window update frame for the connection")]
    WindowUpdateZeroIncrement,

    #[error("received window update that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("received frame that would cause the window size to underflow")]
    WindowUnderflow { stream_id: StreamId },

    #[error("received window update frame with invalid length {len}")]
    WindowUpdateInvalidLength { len: usize },

    #[error("bad setting value: {0}")]
    BadSettingValue(SettingsError),

    #[error("HTTP2-Settings header from the upgrade request was invalid")]
    BadUpgradeSettings,

    #[error("read timed out in the middle of a frame")]
    ReadTimedOutMidFrame,
}

impl H2ConnectionError {
    pub(crate) fn as_known_error_code(&self) -> KnownErrorCode {
        match self {
            // frame size errors
            H2ConnectionError::FrameTooLarge { .. } => KnownErrorCode::FrameSizeError,
            H2ConnectionError::PaddedFrameEmpty { .. } => KnownErrorCode::FrameSizeError,
            H2ConnectionError::PingFrameInvalidLength { .. } => KnownErrorCode::FrameSizeError,
            H2ConnectionError::SettingsInvalidLength { .. } => KnownErrorCode::FrameSizeError,
            H2ConnectionError::WindowUpdateInvalidLength { .. } => KnownErrorCode::FrameSizeError,
            // flow control errors
            H2ConnectionError::WindowUpdateOverflow => KnownErrorCode::FlowControlError,
            H2ConnectionError::WindowUnderflow { .. } => KnownErrorCode::FlowControlError,
            H2ConnectionError::BadSettingValue(SettingsError::InitialWindowSizeTooLarge {
                ..
            }) => KnownErrorCode::FlowControlError,
            // compression errors
            H2ConnectionError::HpackDecodingError(_) => KnownErrorCode::CompressionError,
            // stream closed error
            H2ConnectionError::StreamClosed { .. } => KnownErrorCode::StreamClosed,
            // protocol errors
            H2ConnectionError::PaddedFrameTooShort { .. } => KnownErrorCode::ProtocolError,
            H2ConnectionError::StreamSpecificFrameToConnection { .. } => {
                KnownErrorCode::ProtocolError
            }
            _ => KnownErrorCode::ProtocolError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2StreamError {
    #[error("received {data_length} bytes in data frames but content-length announced {content_length} bytes")]
    DataLengthDoesNotMatchContentLength {
        data_length: u64,
        content_length: u64,
    },

    #[error("overflow while calculating content length")]
    OverflowWhileCalculatingContentLength,

    #[error("refused stream (would exceed max concurrent streams)")]
    RefusedStream,

    #[error("trailers must have EndStream flag set")]
    TrailersNotEndStream,

    #[error("received PRIORITY frame with invalid size")]
    InvalidPriorityFrameSize { frame_size: u32 },

    #[error("stream closed")]
    StreamClosed,

    #[error("received RST_STREAM frame with invalid size, expected 4 got {frame_size}")]
    InvalidRstStreamFrameSize { frame_size: u32 },

    #[error("received WINDOW_UPDATE that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("received WINDOW_UPDATE with a zero increment")]
    WindowUpdateZeroIncrement,

    #[error("peer SETTINGS change made the stream's send window overflow")]
    WindowSizeOverflowDueToSettings,

    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("stream reset")]
    Cancel,
}

impl H2StreamError {
    pub(crate) fn as_known_error_code(&self) -> KnownErrorCode {
        use H2StreamError::*;
        use KnownErrorCode as Code;

        match self {
            Cancel => Code::Cancel,
            // stream closed error
            StreamClosed => Code::StreamClosed,
            // stream refused error
            RefusedStream => Code::RefusedStream,
            // frame size errors
            InvalidPriorityFrameSize { .. } => Code::FrameSizeError,
            InvalidRstStreamFrameSize { .. } => Code::FrameSizeError,
            // flow control errors
            WindowUpdateOverflow => Code::FlowControlError,
            WindowSizeOverflowDueToSettings => Code::FlowControlError,
            _ => Code::ProtocolError,
        }
    }
}

impl From<StreamIncomingError> for H2StreamError {
    fn from(e: StreamIncomingError) -> Self {
        match e {
            StreamIncomingError::StreamReset => H2StreamError::Cancel,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum HeadersOrTrailers {
    Headers,
    Trailers,
}

#[derive(Debug)]
pub(crate) struct H2Event {
    pub(crate) stream_id: StreamId,
    pub(crate) payload: H2EventPayload,
}

pub(crate) enum H2EventPayload {
    Headers(Response),
    BodyChunk(Piece),
    BodyEnd,
    /// The application asked to push `Request` as a new server-initiated
    /// stream, associated with `stream_id`.
    PushRequest(Request),
}

impl fmt::Debug for H2EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Headers(_) => f.debug_tuple("Headers").finish(),
            Self::BodyChunk(_) => f.debug_tuple("BodyChunk").finish(),
            Self::BodyEnd => write!(f, "BodyEnd"),
            Self::PushRequest(_) => f.debug_tuple("PushRequest").finish(),
        }
    }
}
