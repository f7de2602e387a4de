use std::{
    borrow::Cow,
    collections::{HashSet, VecDeque},
    io::Write,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use buffet::{Piece, PieceList, PieceStr, ReadOwned, Roll, RollMut, WriteOwned};
use byteorder::{BigEndian, WriteBytesExt};
use chrono::Utc;
use http::{
    header,
    uri::{Authority, PathAndQuery, Scheme},
    HeaderName, StatusCode, Version,
};
use loona_h2::{
    self as parse, enumflags2::BitFlags, nom::Finish, ContinuationFlags, DataFlags,
    EncodedFrameType, Frame, FrameType, HeadersFlags, KnownErrorCode, PingFlags, PrioritySpec,
    Setting, SettingPairs, Settings, SettingsFlags, StreamId, WindowUpdate,
};
use parse::IntoPiece;
use smallvec::{smallvec, SmallVec};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::{
    error::ServeError,
    h2::{
        body::{ChunkPosition, H2Body, SinglePieceBody, StreamIncoming, StreamIncomingError},
        encode::H2Encoder,
        flow::MAX_WINDOW_SIZE,
        ping::PingManager,
        types::{
            BodyOutgoing, ConnState, ConnectionState, H2ConnectionError, H2Event, H2EventPayload,
            H2RequestError, H2StreamError, HeadersOrTrailers, HeadersOutgoing, StreamState,
        },
    },
    util::{read_and_parse, ReadAndParseError, ReadTimeouts},
    Headers, Method, Request, Responder, ResponderOrBodyError, Response, ServeOutcome,
    ServerDriver,
};

use super::types::H2ErrorLevel;

/// The highest stream id expressible in 31 bits, sent in the first
/// GOAWAY of a graceful pause ("keep finishing everything in flight").
const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Granularity of the housekeeping tick (liveness pings, pause
/// transition); the pause state is also re-checked on every frame.
const UPKEEP_INTERVAL: Duration = Duration::from_millis(500);

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(0);

/// HTTP/2 server configuration
pub struct ServerConf {
    /// Advertised MAX_CONCURRENT_STREAMS; `None` means unlimited.
    pub max_streams: Option<u32>,

    /// How many stream handlers may run at once. When lower than
    /// `max_streams`, additional ready streams wait in a FIFO queue.
    pub max_concurrent_stream_execution: u32,

    /// Advertised per-stream receive window.
    pub initial_window_size: u32,

    /// Advertised SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,

    /// How long a read may block once part of a frame has arrived.
    pub read_timeout: Duration,

    /// How long the connection may sit idle between frames.
    pub keep_alive_timeout: Duration,

    /// How long a transport write may block.
    pub write_timeout: Duration,

    /// Notify to trigger a graceful pause (GOAWAY, then a second GOAWAY
    /// one round-trip later).
    pub pause: Option<Rc<Notify>>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            max_streams: Some(32),
            max_concurrent_stream_execution: 20,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            read_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(30),
            pause: None,
        }
    }
}

/// What an HTTP/1.1 `Upgrade: h2c` handshake hands over to this layer:
/// the already-parsed request (which becomes stream 1) and the value of
/// its `HTTP2-Settings` header.
pub struct H2cUpgrade {
    pub request: Request,

    /// base64url (no padding) encoded SETTINGS payload from the
    /// `HTTP2-Settings` header.
    pub http2_settings: PieceStr,
}

fn conf_settings(conf: &ServerConf) -> Settings {
    let mut settings = Settings::default();
    settings.max_concurrent_streams = conf.max_streams;
    settings.initial_window_size = conf.initial_window_size;
    settings.max_frame_size = conf.max_frame_size;
    settings
}

pub async fn serve<Driver>(
    (transport_r, transport_w): (impl ReadOwned, impl WriteOwned),
    conf: Rc<ServerConf>,
    client_buf: RollMut,
    driver: Rc<Driver>,
) -> Result<ServeOutcome, ServeError<Driver::Error>>
where
    Driver: ServerDriver<H2Encoder> + 'static,
{
    let mut state = ConnState::default();
    state.self_settings = conf_settings(&conf);

    let mut cx =
        ServerContext::new(driver.clone(), state, transport_w, conf).map_err(ServeError::Alloc)?;
    let outcome = cx.work(client_buf, transport_r).await?;

    debug!("finished serving");
    Ok(outcome)
}

/// Serves a connection that arrived through an HTTP/1.1 upgrade: the
/// upgraded request is synthesized as stream 1 (already half-closed,
/// the request was fully received over 1.1) and its response goes out
/// over HTTP/2 once the preface completes.
pub async fn serve_h2c_upgrade<Driver>(
    (transport_r, transport_w): (impl ReadOwned, impl WriteOwned),
    conf: Rc<ServerConf>,
    client_buf: RollMut,
    driver: Rc<Driver>,
    upgrade: H2cUpgrade,
) -> Result<ServeOutcome, ServeError<Driver::Error>>
where
    Driver: ServerDriver<H2Encoder> + 'static,
{
    let mut state = ConnState::default();
    state.self_settings = conf_settings(&conf);

    // The HTTP2-Settings header is a SETTINGS payload in base64url
    // clothing: sequence of 6-byte entries, 2-byte id then 4-byte value.
    let raw = URL_SAFE_NO_PAD
        .decode(upgrade.http2_settings.as_bytes())
        .map_err(|_| H2ConnectionError::BadUpgradeSettings)?;
    if raw.len() % 6 != 0 {
        return Err(H2ConnectionError::BadUpgradeSettings.into());
    }
    {
        let s = &mut state.peer_settings;
        Settings::parse(&raw[..], |code, value| s.apply(code, value))
            .map_err(H2ConnectionError::BadSettingValue)?;
    }

    let outgoing = state.mk_stream_outgoing();
    state.streams.seed_upgrade_stream(outgoing);

    let mut cx =
        ServerContext::new(driver.clone(), state, transport_w, conf).map_err(ServeError::Alloc)?;
    cx.upgraded_request = Some(upgrade.request);
    let outcome = cx.work(client_buf, transport_r).await?;

    debug!("finished serving upgraded connection");
    Ok(outcome)
}

/// A stream whose request is complete but whose handler hasn't been
/// given a slot yet.
struct QueuedStream {
    stream_id: StreamId,
    req: Request,
    req_body: H2Body,
}

/// Admission control for stream handlers. With no cap every ready
/// stream is spawned immediately; otherwise excess streams queue FIFO
/// and are drained as running handlers finish.
struct Dispatcher {
    cap: Option<u32>,
    running: u32,
    queue: VecDeque<QueuedStream>,
}

impl Dispatcher {
    fn new(max_execution: u32, max_streams: u32) -> Self {
        Self {
            // a cap at or above the advertised stream limit can never
            // bind, skip the bookkeeping entirely
            cap: (max_execution < max_streams).then_some(max_execution),
            running: 0,
            queue: VecDeque::new(),
        }
    }

    /// Claim a handler slot; false means the caller must queue.
    fn try_admit(&mut self) -> bool {
        match self.cap {
            None => true,
            Some(cap) => {
                if self.running < cap {
                    self.running += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// A handler finished; returns the next queued stream to run, with
    /// its slot already claimed.
    fn complete(&mut self) -> Option<QueuedStream> {
        let cap = self.cap?;
        self.running = self.running.saturating_sub(1);
        if self.running < cap {
            let next = self.queue.pop_front()?;
            self.running += 1;
            return Some(next);
        }
        None
    }
}

/// What ended the read loop, short of an error.
#[derive(Debug)]
enum DeframeEnd {
    /// Clean EOF at a frame boundary.
    Eof,
    /// Nothing arrived within the keep-alive window.
    IdleTimeout,
}

type FrameItem = (Frame, Roll, u32);

/// Reads and processes h2 frames from the client.
pub(crate) struct ServerContext<D: ServerDriver<H2Encoder> + 'static, W: WriteOwned> {
    driver: Rc<D>,
    conf: Rc<ServerConf>,
    state: ConnState,

    hpack_dec: loona_hpack::Decoder<'static>,
    hpack_enc: loona_hpack::Encoder<'static>,
    out_scratch: RollMut,

    /// Whether we've received a GOAWAY frame.
    pub goaway_recv: bool,

    transport_w: W,

    ev_tx: mpsc::Sender<H2Event>,
    ev_rx: mpsc::Receiver<H2Event>,

    ping: PingManager,
    dispatcher: Dispatcher,

    /// Request that rode in on the HTTP/1.1 upgrade, dispatched as
    /// stream 1 right after the preface.
    upgraded_request: Option<Request>,
}

impl<D, W> ServerContext<D, W>
where
    D: ServerDriver<H2Encoder> + 'static,
    W: WriteOwned,
{
    pub(crate) fn new(
        driver: Rc<D>,
        state: ConnState,
        transport_w: W,
        conf: Rc<ServerConf>,
    ) -> Result<Self, buffet::bufpool::Error> {
        let mut hpack_dec = loona_hpack::Decoder::new();
        hpack_dec
            .set_max_allowed_table_size(Settings::default().header_table_size.try_into().unwrap());

        let hpack_enc = loona_hpack::Encoder::new();

        let (ev_tx, ev_rx) = tokio::sync::mpsc::channel::<H2Event>(32);

        let dispatcher = Dispatcher::new(
            conf.max_concurrent_stream_execution,
            conf.max_streams.unwrap_or(u32::MAX),
        );

        Ok(Self {
            driver,
            conf,
            ev_tx,
            ev_rx,
            state,
            hpack_dec,
            hpack_enc,
            out_scratch: RollMut::alloc()?,
            goaway_recv: false,
            transport_w,
            ping: PingManager::new(),
            dispatcher,
            upgraded_request: None,
        })
    }

    fn max_concurrent_streams(&self) -> u32 {
        self.state.self_settings.max_concurrent_streams.unwrap_or(u32::MAX)
    }

    /// Reads and process h2 frames from the client.
    pub(crate) async fn work(
        &mut self,
        mut client_buf: RollMut,
        mut transport_r: impl ReadOwned,
    ) -> Result<ServeOutcome, ServeError<D::Error>> {
        let conn_id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
        debug!(%conn_id, "serving connection");

        self.state.lifecycle = ConnectionState::Connected;

        // first read the preface
        {
            (client_buf, _) = match read_and_parse(
                "Http2Preface",
                parse::preface,
                &mut transport_r,
                client_buf,
                parse::PREFACE.len(),
                ReadTimeouts::mid_item(Some(self.conf.read_timeout)),
            )
            .await
            .map_err(H2ConnectionError::ReadAndParse)?
            {
                Some((client_buf, frame)) => (client_buf, frame),
                None => {
                    return Ok(ServeOutcome::ClientDidntSpeakHttp2);
                }
            };
        }

        // then send our initial settings
        {
            debug!("Sending initial settings");
            let setting_payload = {
                let s = &self.state.self_settings;
                SettingPairs(&[
                    (Setting::EnablePush, 0),
                    (Setting::HeaderTableSize, s.header_table_size),
                    (Setting::InitialWindowSize, s.initial_window_size),
                    (
                        Setting::MaxConcurrentStreams,
                        s.max_concurrent_streams.unwrap_or(u32::MAX),
                    ),
                    (Setting::MaxFrameSize, s.max_frame_size),
                    (Setting::MaxHeaderListSize, s.max_header_list_size),
                ])
                .into_piece(&mut self.out_scratch)
                .map_err(ServeError::DownstreamWrite)?
            };
            let frame = Frame::new(
                FrameType::Settings(Default::default()),
                StreamId::CONNECTION,
            );
            self.write_frame(frame, PieceList::single(setting_payload))
                .await?;
            self.state.settings_acks_pending += 1;
        }

        // seed the round-trip estimate as early as possible, the pause
        // logic depends on it
        self.send_ping(true).await?;

        // the request that rode the HTTP/1.1 upgrade becomes stream 1
        if let Some(req) = self.upgraded_request.take() {
            self.dispatch_stream(StreamId(1), req, H2Body::empty());
        }

        let mut goaway_err: Option<H2ConnectionError> = None;
        let mut outcome = ServeOutcome::SuccessfulHttp2GracefulShutdown;

        {
            // read frames and send them into an mpsc buffer
            let (tx, rx) = mpsc::channel::<FrameItem>(32);

            let max_frame_size = self.state.self_settings.max_frame_size;
            let read_timeout = self.conf.read_timeout;
            let keep_alive_timeout = self.conf.keep_alive_timeout;

            let mut deframe_task = std::pin::pin!(Self::deframe_loop(
                client_buf,
                transport_r,
                tx,
                max_frame_size,
                read_timeout,
                keep_alive_timeout,
            ));
            let mut process_task = std::pin::pin!(self.process_loop(rx));

            debug!("Starting both deframe & process tasks");

            tokio::select! {
                res = &mut deframe_task => {
                    debug!(?res, "h2 deframe task finished");

                    match res {
                        Err(H2ConnectionError::ReadAndParse(e)) => {
                            let mut should_ignore_err = false;

                            // if this is a connection reset and we've sent a goaway, ignore it
                            if let ReadAndParseError::ReadError(io_error) = &e {
                                if io_error.kind() == std::io::ErrorKind::ConnectionReset {
                                    should_ignore_err = true;
                                }
                            }

                            debug!(%should_ignore_err, "deciding whether or not to propagate deframer error");
                            if !should_ignore_err {
                                return Err(H2ConnectionError::ReadAndParse(e).into());
                            }
                        }
                        Err(e) => {
                            debug!("turning error into GOAWAY");
                            goaway_err = Some(e);
                        }
                        Ok(DeframeEnd::IdleTimeout) => {
                            debug!("connection idled out");
                            outcome = ServeOutcome::IdleTimeout;
                        }
                        Ok(DeframeEnd::Eof) => {}
                    }

                    if let Err(e) = (&mut process_task).await {
                        debug!("h2 process task finished with error: {e}");
                        return Err(e.into());
                    }
                }
                res = &mut process_task => {
                    debug!(?res, "h2 process task finished");

                    if let Err(err) = res {
                        goaway_err = Some(err);
                    }
                }
            }
        }

        if let Some(err) = goaway_err {
            let error_code = err.as_known_error_code();
            debug!("Connection error: {err} ({err:?}) (code {error_code:?})");

            let additional_debug_data = format!("{err}").into_bytes();
            let max_processed_stream_id = self.state.streams.max_processed_stream_id;

            debug!(%max_processed_stream_id, ?error_code, "Sending GoAway");
            if let Err(e) = self
                .write_goaway(max_processed_stream_id, error_code, &additional_debug_data)
                .await
            {
                // GOAWAY goes out on a best-efforts basis, the
                // connection is closing either way
                debug!("could not send goaway: {e}");
            }
        }

        self.state.lifecycle = ConnectionState::Closed;
        Ok(outcome)
    }

    async fn deframe_loop(
        mut client_buf: RollMut,
        mut transport_r: impl ReadOwned,
        tx: mpsc::Sender<FrameItem>,
        max_frame_size: u32,
        read_timeout: Duration,
        keep_alive_timeout: Duration,
    ) -> Result<DeframeEnd, H2ConnectionError> {
        'read_frames: loop {
            const MAX_FRAME_HEADER_SIZE: usize = 128;
            let frame;
            trace!("Reading frame... Buffer length: {}", client_buf.len());
            let frame_res = read_and_parse(
                "Http2Frame",
                Frame::parse,
                &mut transport_r,
                client_buf,
                MAX_FRAME_HEADER_SIZE,
                ReadTimeouts::framing(Some(keep_alive_timeout), Some(read_timeout)),
            )
            .await;

            let maybe_frame = match frame_res {
                Ok(inner) => inner,
                Err(ReadAndParseError::IdleTimeout) => {
                    debug!("keep-alive timeout between frames");
                    return Ok(DeframeEnd::IdleTimeout);
                }
                Err(ReadAndParseError::ReadTimeout) => {
                    return Err(H2ConnectionError::ReadTimedOutMidFrame)
                }
                Err(e) => return Err(H2ConnectionError::ReadAndParse(e)),
            };
            (client_buf, frame) = match maybe_frame {
                Some((client_buf, frame)) => (client_buf, frame),
                None => {
                    debug!("Peer hung up");
                    break 'read_frames;
                }
            };
            trace!(
                "Reading frame... done! New buffer length: {}",
                client_buf.len()
            );
            debug!(?frame, "<");

            if frame.len > max_frame_size {
                return Err(H2ConnectionError::FrameTooLarge {
                    frame_type: frame.frame_type,
                    frame_size: frame.len,
                    max_frame_size,
                });
            }

            trace!(
                "Reading payload of size {}... Buffer length: {}",
                frame.len,
                client_buf.len()
            );
            let mut payload;
            (client_buf, payload) = match read_and_parse(
                "FramePayload",
                nom::bytes::streaming::take(frame.len as usize),
                &mut transport_r,
                client_buf,
                frame.len as usize,
                ReadTimeouts::mid_item(Some(read_timeout)),
            )
            .await
            .map_err(|e| match e {
                ReadAndParseError::IdleTimeout | ReadAndParseError::ReadTimeout => {
                    H2ConnectionError::ReadTimedOutMidFrame
                }
                e => H2ConnectionError::ReadAndParse(e),
            })? {
                Some((client_buf, payload)) => (client_buf, payload),
                None => {
                    return Err(H2ConnectionError::IncompleteFrame {
                        frame_type: frame.frame_type,
                        frame_size: frame.len,
                    })
                }
            };
            trace!(
                "Reading payload... done! New buffer length: {}",
                client_buf.len()
            );

            let has_padding = match frame.frame_type {
                FrameType::Data(flags) => flags.contains(DataFlags::Padded),
                FrameType::Headers(flags) => flags.contains(HeadersFlags::Padded),
                _ => false,
            };

            // flow-control credit consumed by padding (and the length
            // byte itself), restored by the process loop
            let mut pad_restore = 0u32;

            if has_padding {
                if payload.is_empty() {
                    return Err(H2ConnectionError::PaddedFrameEmpty {
                        frame_type: frame.frame_type,
                    });
                }

                let padding_length_roll;
                (padding_length_roll, payload) = payload.split_at(1);
                let padding_length = padding_length_roll[0] as usize;
                if payload.len() < padding_length {
                    return Err(H2ConnectionError::PaddedFrameTooShort {
                        frame_type: frame.frame_type,
                        padding_length,
                        frame_size: frame.len,
                    });
                }

                // padding is on the end of the payload
                let at = payload.len() - padding_length;
                (payload, _) = payload.split_at(at);

                pad_restore = padding_length as u32 + 1;
            }

            if tx.send((frame, payload, pad_restore)).await.is_err() {
                debug!("h2 deframer: receiver dropped, closing connection");
                return Ok(DeframeEnd::Eof);
            }
        }

        Ok(DeframeEnd::Eof)
    }

    async fn process_loop(
        &mut self,
        mut rx: mpsc::Receiver<FrameItem>,
    ) -> Result<(), H2ConnectionError> {
        let pause_signal = self.conf.pause.clone();

        loop {
            tokio::select! {
                biased;

                maybe_frame = rx.recv() => {
                    if let Some((frame, payload, pad_restore)) = maybe_frame {
                        self.process_frame(frame, payload, pad_restore, &mut rx).await?;
                    } else {
                        debug!("h2 process task: peer hung up");
                        break;
                    }
                }

                ev = self.ev_rx.recv() => {
                    match ev {
                        Some(ev) => self.handle_event(ev).await?,
                        None => unreachable!("the context owns a copy of the sender, and this method has &mut self, so the sender can't be dropped while this method is running"),
                    }
                }

                _ = self.state.send_data_maybe.notified() => {
                    self.send_data_maybe().await?;
                }

                _ = pause_requested(&pause_signal) => {
                    self.pause().await;
                }

                _ = tokio::time::sleep(UPKEEP_INTERVAL) => {
                    self.upkeep().await?;
                }
            }
        }

        Ok(())
    }

    /// Periodic housekeeping: opportunistic liveness ping, pause
    /// transition check.
    async fn upkeep(&mut self) -> Result<(), H2ConnectionError> {
        self.send_ping(false).await?;
        self.check_pause_state().await?;
        Ok(())
    }

    async fn send_ping(&mut self, force: bool) -> Result<(), H2ConnectionError> {
        let Some(payload) = self.ping.poll_send(Instant::now(), force) else {
            return Ok(());
        };
        let frame = Frame::new(FrameType::Ping(Default::default()), StreamId::CONNECTION);
        self.write_frame(frame, PieceList::single(payload.to_vec()))
            .await
    }

    /// Starts a graceful pause: tell the peer to wrap up (a GOAWAY with
    /// the maximum stream id refuses nothing that's already in flight),
    /// then give it one measured round-trip before the real GOAWAY.
    async fn pause(&mut self) {
        if self.state.lifecycle != ConnectionState::Connected {
            return;
        }
        debug!("pausing connection");
        self.state.lifecycle = ConnectionState::Pausing;
        self.state.paused_at = Some(Instant::now());

        if let Err(e) = self
            .write_goaway(MAX_STREAM_ID, KnownErrorCode::NoError, b"")
            .await
        {
            // follow-up I/O will surface a dead connection
            debug!("could not send pause goaway: {e}");
        }
    }

    async fn check_pause_state(&mut self) -> Result<(), H2ConnectionError> {
        if self.state.lifecycle != ConnectionState::Pausing {
            return Ok(());
        }
        let Some(paused_at) = self.state.paused_at else {
            return Ok(());
        };
        if paused_at.elapsed() >= self.ping.round_trip_time() {
            self.state.lifecycle = ConnectionState::Paused;
            let max_processed_stream_id = self.state.streams.max_processed_stream_id;
            debug!(%max_processed_stream_id, "pause grace elapsed, connection now paused");
            self.write_goaway(max_processed_stream_id, KnownErrorCode::NoError, b"")
                .await?;
        }
        Ok(())
    }

    async fn send_data_maybe(&mut self) -> Result<(), H2ConnectionError> {
        let mut not_pending: HashSet<StreamId> = Default::default();

        // this vec exists for borrow-checker reasons: we can't
        // borrow self mutably twice in 'each_stream
        let mut frames: Vec<(Frame, PieceList)> = vec![];

        let max_fram = self.state.peer_settings.max_frame_size as usize;

        let streams_with_pending_data: Vec<_> = self
            .state
            .streams_with_pending_data
            .iter()
            .copied()
            .collect();

        'each_stream: for id in streams_with_pending_data {
            // response headers first; they don't consume flow control
            {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(id)
                    .and_then(|s| s.state.outgoing_mut())
                else {
                    not_pending.insert(id);
                    continue 'each_stream;
                };

                if outgoing.headers.has_more_to_write() {
                    if matches!(&outgoing.headers, HeadersOutgoing::WaitingForHeaders) {
                        // shouldn't be pending then should it?
                        not_pending.insert(id);
                        continue 'each_stream;
                    }

                    // a final response with nothing queued behind it
                    // carries END_STREAM on the first HEADERS frame
                    let end_stream = outgoing.final_response
                        && matches!(&outgoing.body, BodyOutgoing::DoneReceiving(q) if q.is_empty());

                    let mut first = true;
                    'queue_header_frames: loop {
                        let is_continuation =
                            matches!(&outgoing.headers, HeadersOutgoing::WroteSome(_));
                        let piece = outgoing.headers.take_piece();
                        let piece_len = piece.len();

                        if piece_len > max_fram {
                            let write_size = max_fram;
                            let (written, requeued) = piece.split_at(write_size);
                            debug!(%write_size, requeued_len = %requeued.len(), "splitting headers");
                            let frame_type = if is_continuation {
                                FrameType::Continuation(Default::default())
                            } else {
                                let mut flags = BitFlags::<HeadersFlags>::default();
                                if first && end_stream {
                                    flags |= HeadersFlags::EndStream;
                                }
                                FrameType::Headers(flags)
                            };
                            outgoing.headers = HeadersOutgoing::WroteSome(requeued);

                            let frame = Frame::new(frame_type, id);
                            frames.push((frame, PieceList::single(written)));
                        } else {
                            let frame_type = if is_continuation {
                                FrameType::Continuation(
                                    BitFlags::<ContinuationFlags>::default()
                                        | ContinuationFlags::EndHeaders,
                                )
                            } else {
                                let mut flags =
                                    BitFlags::<HeadersFlags>::default() | HeadersFlags::EndHeaders;
                                if first && end_stream {
                                    flags |= HeadersFlags::EndStream;
                                }
                                FrameType::Headers(flags)
                            };

                            let frame = Frame::new(frame_type, id);
                            frames.push((frame, PieceList::single(piece)));

                            break 'queue_header_frames;
                        }

                        first = false;
                    }

                    if end_stream {
                        outgoing.body = BodyOutgoing::DoneSending;
                        not_pending.insert(id);
                        continue 'each_stream;
                    }
                }
            }

            // size up the body under a short-lived borrow, the window
            // reservation needs the stream table back
            let (queued, stream_cap, needs_empty_end_stream) = {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(id)
                    .and_then(|s| s.state.outgoing_mut())
                else {
                    not_pending.insert(id);
                    continue 'each_stream;
                };
                let queued = outgoing.body.queued_len() as i64;
                let needs_empty_end_stream = queued == 0
                    && matches!(&outgoing.body, BodyOutgoing::DoneReceiving(q) if q.is_empty())
                    && !outgoing.headers.has_more_to_write();
                (queued, outgoing.capacity.max(0), needs_empty_end_stream)
            };

            if queued == 0 {
                if needs_empty_end_stream {
                    // the only time we want to send a zero-length frame
                    // is if we have to send END_STREAM separately from
                    // the last chunk
                    let outgoing = self
                        .state
                        .streams
                        .get_mut(id)
                        .and_then(|s| s.state.outgoing_mut())
                        .unwrap();
                    outgoing.body = BodyOutgoing::DoneSending;
                    let frame = Frame::new(FrameType::Data(DataFlags::EndStream.into()), id);
                    frames.push((frame, PieceList::default()));
                }
                not_pending.insert(id);
                continue 'each_stream;
            }

            if stream_cap == 0 {
                // the stream window is shut; a WINDOW_UPDATE for this
                // stream re-queues us
                continue 'each_stream;
            }

            let want = queued.min(stream_cap);
            let granted = self.state.flow.reserve(&self.state.streams, id, want);
            if granted == 0 {
                trace!(%id, %want, "stream backlogged on connection window");
                continue 'each_stream;
            }

            let outgoing = self
                .state
                .streams
                .get_mut(id)
                .and_then(|s| s.state.outgoing_mut())
                .expect("stream was here a moment ago");

            let capacity = granted as usize;
            // bytes written this turn, possibly over multiple frames
            let mut total_bytes_written = 0;

            'queue_body_frames: while total_bytes_written < capacity {
                // send as much body data as we can, respecting max frame
                // size and the window bytes we were granted
                let mut plist = PieceList::default();
                let mut frame_len = 0;

                'build_frame: loop {
                    let piece = match outgoing.body.pop_front() {
                        None => break 'build_frame,
                        Some(piece) => piece,
                    };

                    // do we need to split the piece because we don't have
                    // enough capacity left / we hit the max frame size?
                    let piece_len = piece.len();
                    trace!(%piece_len, "popped a piece");

                    let fram_size_if_full_piece = frame_len + piece_len;

                    let cap_left = capacity - total_bytes_written;
                    let max_this_fram = max_fram.min(cap_left);

                    if fram_size_if_full_piece > max_this_fram {
                        // we can't fit this piece in the current frame,
                        // so we have to split it
                        let write_size = max_this_fram - frame_len;
                        let (written, requeued) = piece.split_at(write_size);
                        frame_len += write_size;
                        trace!(written_len = %written.len(), requeued_len = %requeued.len(), "splitting piece");

                        plist.push_back(written);
                        outgoing.body.push_front(requeued);

                        break 'build_frame;
                    } else {
                        // we can write the full piece
                        let write_size = piece_len;
                        frame_len += write_size;

                        plist.push_back(piece);
                    }
                }

                let mut flags: BitFlags<DataFlags> = Default::default();
                if outgoing.body.might_receive_more() {
                    if frame_len == 0 {
                        break 'queue_body_frames;
                    }
                } else {
                    flags |= DataFlags::EndStream;
                }

                let frame = Frame::new(FrameType::Data(flags), id);
                debug!(?frame, %frame_len, "queuing");
                frames.push((frame, plist));
                total_bytes_written += frame_len;

                if flags.contains(DataFlags::EndStream) {
                    break 'queue_body_frames;
                }
            }
        }

        for (frame, plist) in frames {
            debug!(?frame, plist_len = %plist.len(), "writing");
            self.write_frame(frame, plist).await?;
        }

        for id in not_pending {
            self.state.streams_with_pending_data.remove(&id);
        }

        Ok(())
    }

    async fn handle_event(&mut self, ev: H2Event) -> Result<(), H2ConnectionError> {
        trace!(?ev, "handling event");

        match ev.payload {
            H2EventPayload::Headers(res) => {
                // if the stream was reset while the handler was running,
                // drop the event before it can advance the HPACK encoder
                // state; the encoder finds out on its next write
                if self
                    .state
                    .streams
                    .get_mut(ev.stream_id)
                    .and_then(|s| s.state.outgoing_mut())
                    .is_none()
                {
                    return Ok(());
                }

                let block = self.encode_response_headers(&res)?;

                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(ev.stream_id)
                    .and_then(|s| s.state.outgoing_mut())
                else {
                    return Ok(());
                };

                outgoing.headers = HeadersOutgoing::WroteNone(block);
                if !res.status.is_informational() {
                    outgoing.final_response = true;
                }

                self.state.streams_with_pending_data.insert(ev.stream_id);
                self.state.send_data_maybe.notify_one();
            }
            H2EventPayload::BodyChunk(chunk) => {
                let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(ev.stream_id)
                    .and_then(|s| s.state.outgoing_mut())
                else {
                    return Ok(());
                };

                outgoing.body.push_back(chunk);

                self.state.streams_with_pending_data.insert(ev.stream_id);
                self.state.send_data_maybe.notify_one();
            }
            H2EventPayload::BodyEnd => {
                if let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(ev.stream_id)
                    .and_then(|s| s.state.outgoing_mut())
                {
                    match &mut outgoing.body {
                        BodyOutgoing::StillReceiving(pieces) => {
                            let pieces = std::mem::take(pieces);
                            outgoing.body = BodyOutgoing::DoneReceiving(pieces);
                            debug!(stream_id = %ev.stream_id, outgoing_body = ?outgoing.body, "got body end");
                            self.state.streams_with_pending_data.insert(ev.stream_id);
                            self.state.send_data_maybe.notify_one();
                        }
                        BodyOutgoing::DoneReceiving(_) => {
                            unreachable!("got body end twice")
                        }
                        BodyOutgoing::DoneSending => {
                            // everything already went out (END_STREAM on
                            // the headers frame)
                        }
                    }
                }

                // this stream's handler is done, a queued one may start
                if let Some(next) = self.dispatcher.complete() {
                    self.spawn_stream_handler(next.stream_id, next.req, next.req_body);
                }
            }
            H2EventPayload::PushRequest(req) => {
                self.push_promised_stream(ev.stream_id, req).await?;
            }
        }

        Ok(())
    }

    /// Runs the HPACK encoder over a response's header block: `:status`
    /// first, `date` added when the application didn't set one,
    /// entity headers dropped for statuses that can't carry a body.
    fn encode_response_headers(&mut self, res: &Response) -> Result<Piece, H2ConnectionError> {
        let status_code = res.status.as_u16();
        let body_allowed = !(status_code < 200 || status_code == 205 || status_code == 304);

        let date_value: Option<String> = if !res.status.is_informational()
            && res.headers.get(header::DATE).is_none()
        {
            Some(Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        } else {
            None
        };

        let mut headers: Vec<(&[u8], &[u8])> = vec![];
        headers.push((b":status", res.status.as_str().as_bytes()));
        if let Some(date) = &date_value {
            headers.push((b"date", date.as_bytes()));
        }

        for (name, value) in res.headers.iter() {
            if name == http::header::TRANSFER_ENCODING {
                // never chunked when doing HTTP/2
                continue;
            }
            if !body_allowed
                && (name == http::header::CONTENT_TYPE || name == http::header::CONTENT_LANGUAGE)
            {
                continue;
            }
            headers.push((name.as_str().as_bytes(), value));
        }

        debug_assert_eq!(self.out_scratch.len(), 0);
        self.hpack_enc
            .encode_into(headers, &mut self.out_scratch)
            .map_err(H2ConnectionError::WriteError)?;
        Ok(self.out_scratch.take_all().into())
    }

    /// Registers a promised stream and writes PUSH_PROMISE (+ any
    /// CONTINUATION frames) on the associated stream, then dispatches a
    /// handler for it. Quietly does nothing when the peer disabled push
    /// or the connection stopped taking new streams.
    async fn push_promised_stream(
        &mut self,
        associated: StreamId,
        req: Request,
    ) -> Result<(), H2ConnectionError> {
        if !self.state.peer_settings.enable_push
            || !self.state.lifecycle.new_streams_allowed()
        {
            debug!(%associated, "dropping push request (push disabled or connection going away)");
            return Ok(());
        }
        if associated.is_server_initiated() {
            // RFC 9113 section 8.4: PUSH_PROMISE only rides streams the
            // peer initiated; this also keeps pushed handlers from
            // pushing chains of their own
            debug!(%associated, "dropping push request from a pushed stream");
            return Ok(());
        }
        if !self
            .state
            .streams
            .get(associated)
            .map(|s| s.state.is_active())
            .unwrap_or(false)
        {
            debug!(%associated, "dropping push request for inactive stream");
            return Ok(());
        }

        let outgoing = self.state.mk_stream_outgoing();
        let promised = self
            .state
            .streams
            .create_local_stream(StreamState::ReservedLocal { outgoing });
        debug!(%associated, %promised, "pushing stream");

        // request header block: pseudo-headers, then the rest
        {
            let method = req.method.as_str();
            let scheme = req.uri.scheme_str().unwrap_or("https");
            let path = req
                .uri
                .path_and_query()
                .map(PathAndQuery::as_str)
                .unwrap_or("/");
            let authority = req.uri.authority().map(Authority::as_str).unwrap_or("");

            let mut headers: Vec<(&[u8], &[u8])> = vec![
                (b":method", method.as_bytes()),
                (b":scheme", scheme.as_bytes()),
                (b":authority", authority.as_bytes()),
                (b":path", path.as_bytes()),
            ];
            for (name, value) in req.headers.iter() {
                headers.push((name.as_str().as_bytes(), value));
            }

            debug_assert_eq!(self.out_scratch.len(), 0);
            self.hpack_enc
                .encode_into(headers, &mut self.out_scratch)
                .map_err(H2ConnectionError::WriteError)?;
        }
        let mut block: Piece = self.out_scratch.take_all().into();

        let promised_id_prefix = self
            .out_scratch
            .put_to_roll(4, |mut slice| {
                slice.write_u32::<BigEndian>(promised.0 & 0x7fff_ffff)?;
                Ok(())
            })
            .map_err(|e| H2ConnectionError::WriteError(std::io::Error::other(e)))?;

        let max_fram = self.state.peer_settings.max_frame_size as usize;
        let mut first = true;
        loop {
            // the promised stream id rides in the first fragment and
            // counts against its frame size
            let budget = if first { max_fram - 4 } else { max_fram };
            let (fragment, rest, done) = if block.len() > budget {
                let (written, requeued) = block.split_at(budget);
                (written, Some(requeued), false)
            } else {
                (block, None, true)
            };

            let (frame_type, plist) = if first {
                (
                    push_promise_frame_type(done),
                    PieceList::single(promised_id_prefix.clone()).followed_by(fragment),
                )
            } else if done {
                (
                    FrameType::Continuation(
                        BitFlags::<ContinuationFlags>::default() | ContinuationFlags::EndHeaders,
                    ),
                    PieceList::single(fragment),
                )
            } else {
                (
                    FrameType::Continuation(Default::default()),
                    PieceList::single(fragment),
                )
            };

            // we own the writer, so the whole sequence goes out without
            // anything interleaving
            self.write_frame(Frame::new(frame_type, associated), plist)
                .await?;

            match rest {
                Some(requeued) => {
                    block = requeued;
                    first = false;
                }
                None => break,
            }
        }

        self.dispatch_stream(promised, req, H2Body::empty());
        Ok(())
    }

    /// Hands a completed request to a handler, or queues it when the
    /// execution cap is reached.
    fn dispatch_stream(&mut self, stream_id: StreamId, req: Request, req_body: H2Body) {
        self.state.streams.note_processed(stream_id);
        if self.dispatcher.try_admit() {
            self.spawn_stream_handler(stream_id, req, req_body);
        } else {
            debug!(%stream_id, "execution cap reached, queueing stream");
            self.dispatcher.queue.push_back(QueuedStream {
                stream_id,
                req,
                req_body,
            });
        }
    }

    fn spawn_stream_handler(&self, stream_id: StreamId, req: Request, req_body: H2Body) {
        let responder = Responder::new(H2Encoder::new(stream_id, self.ev_tx.clone()));
        let driver = self.driver.clone();

        buffet::spawn(async move {
            let mut req_body = req_body;

            match driver.handle(req, &mut req_body, responder).await {
                Ok(_responder) => {
                    debug!("Handler completed successfully, gave us a responder");
                }
                Err(e) => {
                    debug!("Handler returned an error: {}", e.as_ref())
                }
            }
        });
    }

    async fn write_frame(
        &mut self,
        mut frame: Frame,
        payload: PieceList,
    ) -> Result<(), H2ConnectionError> {
        match &frame.frame_type {
            FrameType::Data(flags) => {
                if let Some(outgoing) = self
                    .state
                    .streams
                    .get_mut(frame.stream_id)
                    .and_then(|s| s.state.outgoing_mut())
                {
                    // the connection window was debited when the bytes
                    // were granted; only the stream window is settled
                    // here
                    let payload_len = payload.len() as i64;
                    let next_cap = outgoing.capacity - payload_len;
                    debug_assert!(
                        next_cap >= 0,
                        "should never write a frame that makes the stream capacity negative"
                    );
                    outgoing.capacity = next_cap;
                }

                if flags.contains(DataFlags::EndStream) {
                    self.finish_sending(frame.stream_id);
                }
            }
            FrameType::Headers(flags) => {
                if let Some(stream) = self.state.streams.get_mut(frame.stream_id) {
                    if matches!(stream.state, StreamState::ReservedLocal { .. }) {
                        // the pushed response has started
                        let outgoing = match std::mem::take(&mut stream.state) {
                            StreamState::ReservedLocal { outgoing } => outgoing,
                            _ => unreachable!(),
                        };
                        stream.state = StreamState::HalfClosedRemote { outgoing };
                    }
                }

                if flags.contains(HeadersFlags::EndStream) {
                    self.finish_sending(frame.stream_id);
                }
            }
            _ => {
                // muffin.
            }
        };

        frame.len = payload
            .len()
            .try_into()
            .map_err(|_| H2ConnectionError::FrameTooLarge {
                frame_type: frame.frame_type,
                frame_size: payload.len() as _,
                max_frame_size: u32::MAX,
            })?;
        debug!(?frame, ">");
        let frame_roll = frame
            .into_piece(&mut self.out_scratch)
            .map_err(H2ConnectionError::WriteError)?;

        let write_timeout = self.conf.write_timeout;
        let write = async {
            if payload.is_empty() {
                trace!("Writing frame without payload");
                self.transport_w.write_all_owned(frame_roll).await
            } else {
                trace!("Writing frame with payload");
                self.transport_w
                    .writev_all_owned(payload.preceded_by(frame_roll))
                    .await
            }
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(res) => res.map_err(H2ConnectionError::WriteError)?,
            Err(_elapsed) => {
                return Err(H2ConnectionError::WriteError(
                    std::io::ErrorKind::TimedOut.into(),
                ))
            }
        }

        Ok(())
    }

    /// We just sent END_STREAM: settle the stream's state machine and
    /// the bookkeeping that hangs off it.
    fn finish_sending(&mut self, stream_id: StreamId) {
        self.state.streams_with_pending_data.remove(&stream_id);

        let mut fully_closed = false;
        if let Some(stream) = self.state.streams.get_mut(stream_id) {
            match std::mem::take(&mut stream.state) {
                StreamState::Open { incoming, .. } => {
                    stream.state = StreamState::HalfClosedLocal { incoming };
                }
                StreamState::HalfClosedRemote { .. } | StreamState::ReservedLocal { .. } => {
                    stream.state = StreamState::Closed {
                        final_closed: false,
                    };
                    fully_closed = true;
                }
                other => {
                    stream.state = other;
                }
            }
        }

        if fully_closed {
            self.state.streams.deactivate(stream_id);
            self.state.flow.forget(stream_id);
            debug!(%stream_id, "closed stream (wrote end of stream)");
        }
    }

    async fn write_goaway(
        &mut self,
        last_stream_id: u32,
        error_code: KnownErrorCode,
        debug_data: &[u8],
    ) -> Result<(), H2ConnectionError> {
        let payload = self
            .out_scratch
            .put_to_roll(8 + debug_data.len(), |mut slice| {
                slice.write_u32::<BigEndian>(last_stream_id & 0x7fff_ffff)?;
                slice.write_u32::<BigEndian>(error_code.repr())?;
                slice.write_all(debug_data)?;
                Ok(())
            })
            .map_err(|e| H2ConnectionError::WriteError(std::io::Error::other(e)))?;

        let frame = Frame::new(FrameType::GoAway, StreamId::CONNECTION);
        self.write_frame(frame, PieceList::single(payload)).await
    }

    async fn write_window_update(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> Result<(), H2ConnectionError> {
        debug_assert!(increment > 0);
        let payload = self
            .out_scratch
            .put_to_roll(4, |mut slice| {
                slice.write_u32::<BigEndian>(increment & 0x7fff_ffff)?;
                Ok(())
            })
            .map_err(|e| H2ConnectionError::WriteError(std::io::Error::other(e)))?;

        let frame = Frame::new(FrameType::WindowUpdate, stream_id);
        self.write_frame(frame, PieceList::single(payload)).await
    }

    /// Returns flow-control credit for consumed bytes: one properly
    /// headed WINDOW_UPDATE for the connection, one for the stream.
    async fn write_window_updates(
        &mut self,
        stream_id: StreamId,
        increment: u32,
    ) -> Result<(), H2ConnectionError> {
        self.write_window_update(StreamId::CONNECTION, increment)
            .await?;
        self.write_window_update(stream_id, increment).await
    }

    async fn process_frame(
        &mut self,
        frame: Frame,
        mut payload: Roll,
        pad_restore: u32,
        rx: &mut mpsc::Receiver<FrameItem>,
    ) -> Result<(), H2ConnectionError> {
        // mirrors the original event loop, which re-evaluated the pause
        // deadline on every iteration
        self.check_pause_state().await?;

        match frame.frame_type {
            FrameType::Data(flags) => {
                if frame.stream_id == StreamId::CONNECTION {
                    return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                        frame_type: frame.frame_type,
                    });
                }

                // flow control covers the whole payload, padding included
                let frame_total = frame.len as i64;
                let data_len = payload.len() as u32;

                let next_conn_cap = self.state.incoming_capacity - frame_total;
                if next_conn_cap < 0 {
                    return Err(H2ConnectionError::WindowUnderflow {
                        stream_id: frame.stream_id,
                    });
                }
                self.state.incoming_capacity = next_conn_cap;

                enum DataVerdict {
                    Forward,
                    StreamError(H2StreamError),
                }

                let verdict = {
                    let stream = self.state.streams.get_mut(frame.stream_id).ok_or(
                        H2ConnectionError::StreamClosed {
                            stream_id: frame.stream_id,
                        },
                    )?;

                    match &mut stream.state {
                        StreamState::Open { incoming, .. }
                        | StreamState::HalfClosedLocal { incoming } => {
                            let next_cap = incoming.capacity - frame_total;
                            if next_cap < 0 {
                                return Err(H2ConnectionError::WindowUnderflow {
                                    stream_id: frame.stream_id,
                                });
                            }
                            incoming.capacity = next_cap;
                            DataVerdict::Forward
                        }
                        StreamState::HalfClosedRemote { .. } | StreamState::Closed { .. } => {
                            debug!(
                                stream_id = %frame.stream_id,
                                "Received data for closed stream"
                            );
                            DataVerdict::StreamError(H2StreamError::StreamClosed)
                        }
                        _ => {
                            return Err(H2ConnectionError::StreamClosed {
                                stream_id: frame.stream_id,
                            })
                        }
                    }
                };

                if let DataVerdict::StreamError(e) = verdict {
                    self.rst(frame.stream_id, e).await?;
                    return Ok(());
                }

                // padding consumed credit the peer gets back right away
                // (+1 for the padding length byte itself)
                if pad_restore > 0 {
                    self.restore_stream_capacity(frame.stream_id, pad_restore);
                    self.write_window_updates(frame.stream_id, pad_restore)
                        .await?;
                }

                let end_stream = flags.contains(DataFlags::EndStream);
                let which = if end_stream {
                    ChunkPosition::Last
                } else {
                    ChunkPosition::NotLast
                };

                let chunk_res = {
                    let incoming = self
                        .state
                        .streams
                        .get_mut(frame.stream_id)
                        .and_then(|s| s.state.incoming_mut())
                        .expect("stream was forwardable a moment ago");
                    incoming.write_chunk(payload.into(), which).await
                };

                if let Err(e) = chunk_res {
                    self.rst(frame.stream_id, e).await?;
                    return Ok(());
                }

                if data_len > 0 {
                    if end_stream {
                        // the stream is done, only the connection window
                        // needs topping up
                        self.state.incoming_capacity += data_len as i64;
                        self.write_window_update(StreamId::CONNECTION, data_len)
                            .await?;
                    } else {
                        self.restore_stream_capacity(frame.stream_id, data_len);
                        self.write_window_updates(frame.stream_id, data_len).await?;
                    }
                }

                if end_stream {
                    self.finish_receiving(frame.stream_id);
                }
            }
            FrameType::Headers(flags) => {
                if frame.stream_id == StreamId::CONNECTION {
                    return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                        frame_type: frame.frame_type,
                    });
                }

                let mut pri_spec: Option<PrioritySpec> = None;
                if flags.contains(HeadersFlags::Priority) {
                    let spec;
                    (payload, spec) = PrioritySpec::parse(payload).finish().map_err(|_| {
                        H2ConnectionError::ReadAndParse(ReadAndParseError::ParsingError {
                            parser: "PrioritySpec",
                        })
                    })?;
                    debug!(exclusive = %spec.exclusive, stream_dependency = ?spec.stream_dependency, weight = %spec.weight, "received priority");

                    if spec.stream_dependency == frame.stream_id {
                        return Err(H2ConnectionError::HeadersInvalidPriority {
                            stream_id: frame.stream_id,
                        });
                    }
                    pri_spec = Some(spec);
                }

                let headers_or_trailers;
                let mode;

                match self.state.streams.get(frame.stream_id).map(|s| &s.state) {
                    Some(StreamState::Open { .. }) | Some(StreamState::HalfClosedLocal { .. }) => {
                        headers_or_trailers = HeadersOrTrailers::Trailers;
                        debug!("Receiving trailers for stream {}", frame.stream_id);

                        if flags.contains(HeadersFlags::EndStream) {
                            // good, that's what we expect
                            mode = ReadHeadersMode::Process;
                        } else {
                            // ignore trailers, we're not accepting the stream
                            mode = ReadHeadersMode::Skip;

                            self.rst(frame.stream_id, H2StreamError::TrailersNotEndStream)
                                .await?;
                        }
                    }
                    Some(StreamState::HalfClosedRemote { .. }) => {
                        return Err(H2ConnectionError::StreamClosed {
                            stream_id: frame.stream_id,
                        });
                    }
                    Some(StreamState::Closed { .. }) => {
                        // a closed stream still in the table means the
                        // peer went back to an id it already used up
                        return Err(H2ConnectionError::ClientSidShouldBeNumericallyIncreasing {
                            stream_id: frame.stream_id,
                            max_remote_stream_id: self.state.streams.max_remote_stream_id,
                        });
                    }
                    Some(StreamState::ReservedLocal { .. }) => {
                        return Err(H2ConnectionError::StreamClosed {
                            stream_id: frame.stream_id,
                        });
                    }
                    Some(StreamState::Transition) => unreachable!(),
                    existing @ (Some(StreamState::Idle) | None) => {
                        let is_new = existing.is_none();
                        headers_or_trailers = HeadersOrTrailers::Headers;
                        debug!(
                            stream_id = %frame.stream_id,
                            max_remote_stream_id = %self.state.streams.max_remote_stream_id,
                            next_stream_count = %self.state.streams.len() + 1,
                            "Receiving headers",
                        );

                        if self.state.lifecycle != ConnectionState::Connected {
                            // pausing or paused: the GOAWAY already told
                            // the peer no new streams. Still route the
                            // block through the HPACK decoder so the
                            // dynamic table stays in sync, but refuse
                            // the stream.
                            debug!(
                                stream_id = %frame.stream_id,
                                "refusing new stream, connection is winding down"
                            );
                            self.rst(frame.stream_id, H2StreamError::RefusedStream)
                                .await?;
                            mode = ReadHeadersMode::Skip;
                        } else {
                            if is_new {
                                let max_concurrent = self.max_concurrent_streams();
                                self.state
                                    .streams
                                    .create_remote_stream(frame.stream_id, max_concurrent)?;
                            }

                            let max_concurrent = self.max_concurrent_streams();
                            match self
                                .state
                                .streams
                                .admit_remote_stream(frame.stream_id, max_concurrent)
                            {
                                Err(e) => {
                                    // refuse the stream, but still skip
                                    // over its continuation frames
                                    self.rst(frame.stream_id, e).await?;
                                    mode = ReadHeadersMode::Skip;
                                }
                                Ok(()) => {
                                    mode = ReadHeadersMode::Process;
                                }
                            }
                        }
                    }
                }

                if let Some(spec) = pri_spec {
                    if self.state.streams.contains(frame.stream_id) {
                        self.state.streams.reprioritise(
                            frame.stream_id,
                            spec.stream_dependency,
                            spec.exclusive,
                            spec.weight as u32 + 1,
                        );
                    }
                }

                if let Err(e) = self
                    .read_headers(
                        headers_or_trailers,
                        mode,
                        flags,
                        frame.stream_id,
                        payload,
                        rx,
                    )
                    .await
                {
                    match e {
                        H2ErrorLevel::Connection(e) => return Err(e),
                        H2ErrorLevel::Stream(e) => {
                            self.rst(frame.stream_id, e).await?;
                        }
                        H2ErrorLevel::Request(e) => {
                            let stream_id = frame.stream_id;

                            debug!(?e, %stream_id, "Responding to stream with error");
                            let outgoing = self.state.mk_stream_outgoing();
                            if let Some(stream) = self.state.streams.get_mut(stream_id) {
                                stream.state = StreamState::HalfClosedRemote { outgoing };
                            }
                            self.state.streams.note_processed(stream_id);

                            // respond with status code
                            let responder =
                                Responder::new(H2Encoder::new(stream_id, self.ev_tx.clone()));
                            responder
                                .write_final_response_with_body(
                                    Response {
                                        version: Version::HTTP_2,
                                        status: e.status,
                                        headers: Default::default(),
                                    },
                                    &mut SinglePieceBody::new(e.message),
                                )
                                .await
                                .map_err(|e| match e {
                                    ResponderOrBodyError::Responder(e) => {
                                        H2ConnectionError::ResponderError(e)
                                    }
                                    ResponderOrBodyError::Body(never) => match never {},
                                })?;
                        }
                    }
                }
            }
            FrameType::Priority => {
                if frame.stream_id == StreamId::CONNECTION {
                    return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                        frame_type: frame.frame_type,
                    });
                }

                let pri_spec = match PrioritySpec::parse(payload) {
                    Ok((_rest, pri_spec)) => pri_spec,
                    Err(_e) => {
                        self.rst(
                            frame.stream_id,
                            H2StreamError::InvalidPriorityFrameSize {
                                frame_size: frame.len,
                            },
                        )
                        .await?;
                        return Ok(());
                    }
                };
                debug!(?pri_spec, "received priority frame");

                if pri_spec.stream_dependency == frame.stream_id {
                    return Err(H2ConnectionError::HeadersInvalidPriority {
                        stream_id: frame.stream_id,
                    });
                }

                if !self.state.streams.contains(frame.stream_id) {
                    // a PRIORITY frame is allowed to create the stream
                    // (it stays idle until headers show up)
                    let max_concurrent = self.max_concurrent_streams();
                    self.state
                        .streams
                        .create_remote_stream(frame.stream_id, max_concurrent)?;
                }
                self.state.streams.reprioritise(
                    frame.stream_id,
                    pri_spec.stream_dependency,
                    pri_spec.exclusive,
                    pri_spec.weight as u32 + 1,
                );
            }
            // note: this always unconditionally transitions the stream to closed
            FrameType::RstStream => {
                if frame.stream_id == StreamId::CONNECTION {
                    return Err(H2ConnectionError::StreamSpecificFrameToConnection {
                        frame_type: frame.frame_type,
                    });
                }

                // a frame size of 4 is expected, if not send a FRAME_SIZE_ERROR
                if frame.len != 4 {
                    self.rst(
                        frame.stream_id,
                        H2StreamError::InvalidRstStreamFrameSize {
                            frame_size: frame.len,
                        },
                    )
                    .await?;
                    return Ok(());
                }

                let error_code = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                debug!(stream_id = %frame.stream_id, %error_code, "received rst stream");

                match self.state.streams.get_mut(frame.stream_id) {
                    None => {
                        return Err(H2ConnectionError::RstStreamForUnknownStream {
                            stream_id: frame.stream_id,
                        })
                    }
                    Some(stream) => {
                        if let Some(incoming) = stream.state.incoming_mut() {
                            incoming.send_error(StreamIncomingError::StreamReset).await;
                        }
                        stream.state = StreamState::Closed {
                            final_closed: false,
                        };
                        self.state.streams.deactivate(frame.stream_id);
                        self.state.flow.forget(frame.stream_id);
                        self.state.streams_with_pending_data.remove(&frame.stream_id);
                        debug!(
                            stream_id = %frame.stream_id,
                            "Closed stream (read RstStream)",
                        );
                    }
                }
            }
            FrameType::Settings(s) => {
                if frame.stream_id != StreamId::CONNECTION {
                    return Err(H2ConnectionError::SettingsWithNonZeroStreamId {
                        stream_id: frame.stream_id,
                    });
                }

                if payload.len() % 6 != 0 {
                    return Err(H2ConnectionError::SettingsInvalidLength {
                        len: payload.len() as _,
                    });
                }

                if s.contains(SettingsFlags::Ack) {
                    if !payload.is_empty() {
                        return Err(H2ConnectionError::SettingsInvalidLength {
                            len: payload.len() as _,
                        });
                    }
                    if self.state.settings_acks_pending == 0 {
                        warn!("peer acknowledged settings we never sent");
                    } else {
                        self.state.settings_acks_pending -= 1;
                        debug!("Peer has acknowledged our settings, cool");
                    }
                } else {
                    let original_initial_window_size = self.state.peer_settings.initial_window_size;
                    {
                        let s = &mut self.state.peer_settings;
                        Settings::parse(&payload[..], |code, value| {
                            s.apply(code, value)?;
                            Ok(())
                        })
                        .map_err(H2ConnectionError::BadSettingValue)?;
                    }
                    self.hpack_enc
                        .set_max_table_size(self.state.peer_settings.header_table_size as _);

                    let initial_window_size_delta = (self.state.peer_settings.initial_window_size
                        as i64)
                        - (original_initial_window_size as i64);

                    let mut maybe_send_data = false;
                    if initial_window_size_delta != 0 {
                        // apply that delta to all streams
                        let (overflowed, newly_positive) = self
                            .state
                            .streams
                            .apply_initial_window_delta(initial_window_size_delta);
                        maybe_send_data = newly_positive;

                        for stream_id in overflowed {
                            // stream-scoped: the connection survives
                            self.rst(stream_id, H2StreamError::WindowSizeOverflowDueToSettings)
                                .await?;
                        }
                    }

                    let frame = Frame::new(
                        FrameType::Settings(SettingsFlags::Ack.into()),
                        StreamId::CONNECTION,
                    );
                    self.write_frame(frame, PieceList::default()).await?;
                    debug!("Acknowledged peer settings");

                    if maybe_send_data {
                        self.state.send_data_maybe.notify_one();
                    }
                }
            }
            FrameType::PushPromise => {
                return Err(H2ConnectionError::ClientSentPushPromise);
            }
            FrameType::Ping(flags) => {
                if frame.stream_id != StreamId::CONNECTION {
                    return Err(H2ConnectionError::PingFrameWithNonZeroStreamId {
                        stream_id: frame.stream_id,
                    });
                }

                if frame.len != 8 {
                    return Err(H2ConnectionError::PingFrameInvalidLength { len: frame.len });
                }

                if flags.contains(PingFlags::Ack) {
                    let bytes: [u8; 8] = payload[..8].try_into().unwrap();
                    self.ping.receive_ack(&bytes, Instant::now());
                    return Ok(());
                }

                // send pong frame
                let flags = PingFlags::Ack.into();
                let frame = Frame::new(FrameType::Ping(flags), StreamId::CONNECTION)
                    .with_len(payload.len() as u32);
                self.write_frame(frame, PieceList::default().followed_by(payload))
                    .await?;
            }
            FrameType::GoAway => {
                if frame.stream_id != StreamId::CONNECTION {
                    return Err(H2ConnectionError::GoAwayWithNonZeroStreamId {
                        stream_id: frame.stream_id,
                    });
                }
                if payload.len() < 8 {
                    return Err(H2ConnectionError::ReadAndParse(
                        ReadAndParseError::ParsingError { parser: "GoAway" },
                    ));
                }

                let last_stream_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let error_code = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                debug!(
                    last_stream_id = %(last_stream_id & 0x7fff_ffff),
                    %error_code,
                    debug_data = %String::from_utf8_lossy(&payload[8..]),
                    "received goaway"
                );

                self.goaway_recv = true;
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(H2ConnectionError::WindowUpdateInvalidLength {
                        len: payload.len() as _,
                    });
                }

                let (_, update) = WindowUpdate::parse(payload).finish().map_err(|_| {
                    H2ConnectionError::ReadAndParse(ReadAndParseError::ParsingError {
                        parser: "WindowUpdate",
                    })
                })?;
                debug!(?update, "Received window update");

                if frame.stream_id == StreamId::CONNECTION {
                    if update.increment == 0 {
                        return Err(H2ConnectionError::WindowUpdateZeroIncrement);
                    }

                    let released = self
                        .state
                        .flow
                        .increment_connection_window(&self.state.streams, update.increment as i64)
                        .map_err(|()| H2ConnectionError::WindowUpdateOverflow)?;

                    for id in released {
                        if id != StreamId::CONNECTION {
                            self.state.streams_with_pending_data.insert(id);
                        }
                    }
                    // streams can also be waiting on this window without
                    // a backlog entry (their own window was the bottleneck
                    // when they last tried), so always take another pass
                    self.state.send_data_maybe.notify_one();
                } else {
                    if update.increment == 0 {
                        self.rst(frame.stream_id, H2StreamError::WindowUpdateZeroIncrement)
                            .await?;
                        return Ok(());
                    }

                    let (old_capacity, new_capacity) = {
                        let Some(stream) = self.state.streams.get_mut(frame.stream_id) else {
                            return Err(H2ConnectionError::WindowUpdateForUnknownOrClosedStream {
                                stream_id: frame.stream_id,
                            });
                        };
                        match stream.state.outgoing_mut() {
                            Some(outgoing) => {
                                let old_capacity = outgoing.capacity;
                                let new_capacity = old_capacity + update.increment as i64;
                                if new_capacity > MAX_WINDOW_SIZE {
                                    (old_capacity, new_capacity)
                                } else {
                                    outgoing.capacity = new_capacity;
                                    (old_capacity, new_capacity)
                                }
                            }
                            None => {
                                // window updates racing a stream we
                                // closed are the peer's prerogative
                                debug!(
                                    stream_id = %frame.stream_id,
                                    "ignoring window update for closed stream"
                                );
                                return Ok(());
                            }
                        }
                    };

                    if new_capacity > MAX_WINDOW_SIZE {
                        // reset the stream
                        self.rst(frame.stream_id, H2StreamError::WindowUpdateOverflow)
                            .await?;
                        return Ok(());
                    }

                    debug!(stream_id = %frame.stream_id, %old_capacity, %new_capacity, "stream window update");

                    // insert into streams_with_pending_data if the old
                    // capacity was <= zero and the new capacity is > zero
                    if old_capacity <= 0 && new_capacity > 0 {
                        self.state.streams_with_pending_data.insert(frame.stream_id);

                        // if the connection has capacity, notify!
                        if self.state.flow.send_window() > 0 {
                            debug!(stream_id = ?frame.stream_id, "stream window update, maybe send data");
                            self.state.send_data_maybe.notify_one();
                        }
                    }
                }
            }
            FrameType::Continuation(_flags) => {
                return Err(H2ConnectionError::UnexpectedContinuationFrame {
                    stream_id: frame.stream_id,
                });
            }
            FrameType::Unknown(ft) => {
                trace!(
                    "ignoring unknown frame with type 0x{:x}, flags 0x{:x}",
                    ft.ty,
                    ft.flags
                );
            }
        }

        Ok(())
    }

    /// The peer just sent END_STREAM: settle the stream's state machine
    /// and the active-stream count.
    fn finish_receiving(&mut self, stream_id: StreamId) {
        let mut fully_closed = false;
        if let Some(stream) = self.state.streams.get_mut(stream_id) {
            match std::mem::take(&mut stream.state) {
                StreamState::Open { outgoing, .. } => {
                    stream.state = StreamState::HalfClosedRemote { outgoing };
                }
                StreamState::HalfClosedLocal { .. } => {
                    stream.state = StreamState::Closed {
                        final_closed: false,
                    };
                    fully_closed = true;
                }
                other => {
                    stream.state = other;
                }
            }
        }

        if fully_closed {
            self.state.streams.deactivate(stream_id);
            self.state.flow.forget(stream_id);
            debug!(%stream_id, "Closed stream (read data w/EndStream)");
        }
    }

    fn restore_stream_capacity(&mut self, stream_id: StreamId, amount: u32) {
        self.state.incoming_capacity += amount as i64;
        if let Some(incoming) = self
            .state
            .streams
            .get_mut(stream_id)
            .and_then(|s| s.state.incoming_mut())
        {
            incoming.capacity += amount as i64;
        }
    }

    /// Send a RST_STREAM frame to the peer and close the stream locally.
    /// Unknown streams get a bare RST without creating any state.
    async fn rst(
        &mut self,
        stream_id: StreamId,
        e: H2StreamError,
    ) -> Result<(), H2ConnectionError> {
        if let Some(stream) = self.state.streams.get_mut(stream_id) {
            if let Some(incoming) = stream.state.incoming_mut() {
                incoming.send_error(StreamIncomingError::StreamReset).await;
            }
            stream.state = StreamState::Closed {
                final_closed: false,
            };
        }
        self.state.streams.deactivate(stream_id);
        self.state.flow.forget(stream_id);
        self.state.streams_with_pending_data.remove(&stream_id);

        let error_code = e.as_known_error_code();
        debug!("Sending rst because: {e} (known error code: {error_code:?})");

        debug!(%stream_id, ?error_code, "Sending RstStream");
        let payload = self
            .out_scratch
            .put_to_roll(4, |mut slice| {
                slice.write_u32::<BigEndian>(error_code.repr())?;
                Ok(())
            })
            .map_err(|e| H2ConnectionError::WriteError(std::io::Error::other(e)))?;

        let frame = Frame::new(FrameType::RstStream, stream_id)
            .with_len((payload.len()).try_into().unwrap());
        self.write_frame(frame, PieceList::single(payload)).await?;

        Ok(())
    }

    async fn read_headers(
        &mut self,
        headers_or_trailers: HeadersOrTrailers,
        mode: ReadHeadersMode,
        flags: BitFlags<HeadersFlags, u8>,
        stream_id: StreamId,
        payload: Roll,
        rx: &mut mpsc::Receiver<FrameItem>,
    ) -> Result<(), H2ErrorLevel> {
        let end_stream = flags.contains(HeadersFlags::EndStream);

        enum Data {
            Single(Roll),
            Multi(SmallVec<[Roll; 2]>),
        }

        let data = if flags.contains(HeadersFlags::EndHeaders) {
            // good, no continuation frames needed
            Data::Single(payload)
        } else {
            // read continuation frames

            #[allow(unused, clippy::let_unit_value)]
            let flags = (); // don't accidentally use the `flags` variable

            let mut fragments = smallvec![payload];

            loop {
                let (continuation_frame, continuation_payload, _) = match rx.recv().await {
                    Some(t) => t,
                    None => {
                        // even though this error is "for a stream", it's a
                        // connection error, because it means the peer doesn't
                        // know how to speak HTTP/2.
                        return Err(H2ConnectionError::ExpectedContinuationFrame {
                            stream_id,
                            frame_type: None,
                        }
                        .into());
                    }
                };

                if stream_id != continuation_frame.stream_id {
                    return Err(H2ConnectionError::ExpectedContinuationForStream {
                        stream_id,
                        continuation_stream_id: continuation_frame.stream_id,
                    }
                    .into());
                }

                let cont_flags = match continuation_frame.frame_type {
                    FrameType::Continuation(flags) => flags,
                    other => {
                        return Err(H2ConnectionError::ExpectedContinuationFrame {
                            stream_id,
                            frame_type: Some(other),
                        }
                        .into())
                    }
                };

                // add fragment
                fragments.push(continuation_payload);

                if cont_flags.contains(ContinuationFlags::EndHeaders) {
                    // we're done
                    break;
                }
            }

            Data::Multi(fragments)
        };

        if matches!(mode, ReadHeadersMode::Skip) {
            // the headers aren't going anywhere, but the HPACK dynamic
            // table must advance exactly as if they were: run the block
            // through the decoder into a sink
            let sink = |_k: Cow<[u8]>, _v: Cow<[u8]>| {};
            match data {
                Data::Single(payload) => {
                    self.hpack_dec
                        .decode_with_cb(&payload[..], sink)
                        .map_err(|e| H2ErrorLevel::Connection(e.into()))?;
                }
                Data::Multi(fragments) => {
                    let total_len = fragments.iter().map(|f| f.len()).sum();
                    let mut payload = Vec::with_capacity(total_len);
                    for frag in &fragments {
                        payload.extend_from_slice(&frag[..]);
                    }
                    self.hpack_dec
                        .decode_with_cb(&payload[..], sink)
                        .map_err(|e| H2ErrorLevel::Connection(e.into()))?;
                }
            }
            return Ok(());
        }

        let mut method: Option<Method> = None;
        let mut scheme: Option<Scheme> = None;
        let mut path: Option<PieceStr> = None;
        let mut authority: Option<Authority> = None;

        let mut headers = Headers::default();

        {
            // we assign to an outer variable because header decoding needs to finish no
            // matter what: if we receive invalid headers for one request, we should still
            // keep reading the next request's headers, and that requires advancing the
            // huffman decoder's state, etc.
            let mut req_error: Option<H2StreamError> = None;
            let mut saw_regular_header = false;

            let on_header_pair = |key: Cow<[u8]>, value: Cow<[u8]>| {
                if req_error.is_some() {
                    return;
                }

                debug!(
                    "{headers_or_trailers:?} | {}: {}",
                    std::str::from_utf8(&key).unwrap_or("<non-utf8-key>"),
                    std::str::from_utf8(&value).unwrap_or("<non-utf8-value>"),
                );

                if &key[..1] == b":" {
                    if saw_regular_header {
                        req_error = Some(H2StreamError::BadRequest(
                                "All pseudo-header fields MUST appear in a field block before all regular field lines (RFC 9113, section 8.3)"
                        ));
                        return;
                    }

                    if matches!(headers_or_trailers, HeadersOrTrailers::Trailers) {
                        req_error = Some(H2StreamError::BadRequest(
                            "Pseudo-header fields MUST NOT appear in a trailer section (RFC 9113, section 8.3)"
                        ));
                        return;
                    }

                    // it's a pseudo-header!
                    match &key[1..] {
                        b"method" => {
                            let value: PieceStr = match Piece::from(value.to_vec()).to_str() {
                                Ok(p) => p,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest(
                                        "invalid ':method' pseudo-header: not valid utf-8",
                                    ));
                                    return;
                                }
                            };
                            if method.replace(Method::from(value)).is_some() {
                                req_error = Some(H2StreamError::BadRequest("duplicate ':method' pseudo-header. All HTTP/2 requests MUST include exactly one valid value for the ':method', ':scheme', and ':path' pseudo-header fields, unless they are CONNECT requests (RFC 9113, section 8.3.1)"));
                            }
                        }
                        b"scheme" => {
                            let value: PieceStr = match Piece::from(value.to_vec()).to_str() {
                                Ok(p) => p,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest(
                                        "invalid ':scheme' pseudo-header: not valid utf-8",
                                    ));
                                    return;
                                }
                            };
                            let value: Scheme = match value.parse() {
                                Ok(s) => s,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest(
                                        "invalid ':scheme' pseudo-header: not a valid scheme",
                                    ));
                                    return;
                                }
                            };
                            if scheme.replace(value).is_some() {
                                req_error = Some(H2StreamError::BadRequest("duplicate ':scheme' pseudo-header (RFC 9113, section 8.3.1)"));
                            }
                        }
                        b"path" => {
                            let value: PieceStr = match Piece::from(value.to_vec()).to_str() {
                                Ok(val) => val,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest("invalid ':path' pseudo-header: not valid utf-8 (RFC 9113, section 8.3.1)"));
                                    return;
                                }
                            };

                            if path.replace(value).is_some() {
                                req_error = Some(H2StreamError::BadRequest("duplicate ':path' pseudo-header (RFC 9113, section 8.3.1)"));
                            }
                        }
                        b"authority" => {
                            let value: PieceStr = match Piece::from(value.to_vec()).to_str() {
                                Ok(p) => p,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest(
                                        "invalid ':authority' pseudo-header: not valid utf-8",
                                    ));
                                    return;
                                }
                            };
                            let value: Authority = match value.parse() {
                                Ok(a) => a,
                                Err(_) => {
                                    req_error = Some(H2StreamError::BadRequest("invalid ':authority' pseudo-header: not a valid authority (RFC 3986, section 3.2)"));
                                    return;
                                }
                            };
                            if authority.replace(value).is_some() {
                                req_error = Some(H2StreamError::BadRequest("duplicate ':authority' pseudo-header (RFC 9113, section 8.3.1)"));
                            }
                        }
                        _ => {
                            req_error = Some(H2StreamError::BadRequest(
                                "received invalid pseudo-header. the only defined request pseudo-headers are ':method', ':scheme', ':path', ':authority' (RFC 9113, section 8.1)",
                            ));
                        }
                    }
                } else {
                    saw_regular_header = true;

                    let name = match HeaderName::from_bytes(&key[..]) {
                        Ok(name) => name,
                        Err(_) => {
                            req_error = Some(H2StreamError::BadRequest(
                                "invalid header name. see RFC 9113, section 8.2.1, 'Field validity'",
                            ));
                            return;
                        }
                    };

                    // Note: An implementation that validates fields according to the definitions in
                    // Sections 5.1 and 5.5 of HTTP only needs an additional check that field
                    // names do not include uppercase characters.
                    if key.iter().any(|b: &u8| b.is_ascii_uppercase()) {
                        req_error = Some(H2StreamError::BadRequest(
                            "A field name MUST NOT contain uppercase characters ('A' to 'Z', ASCII 0x41 to 0x5a). See RFC 9113, section 8.2.1, 'Field Validity'",
                        ));
                        return;
                    }

                    // connection-specific headers are forbidden
                    static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
                    static PROXY_CONNECTION: HeaderName =
                        HeaderName::from_static("proxy-connection");

                    if name == http::header::CONNECTION
                        || name == KEEP_ALIVE
                        || name == PROXY_CONNECTION
                        || name == http::header::TRANSFER_ENCODING
                        || name == http::header::UPGRADE
                    {
                        req_error = Some(H2StreamError::BadRequest(
                            "connection-specific headers are forbidden. see RFC 9113, section 8.1.2",
                        ));
                        return;
                    }

                    if name == http::header::TE && &value[..] != b"trailers" {
                        req_error = Some(H2StreamError::BadRequest(
                            "the TE header field MUST NOT contain any value other than 'trailers'. cf. RFC 9113, section 8.2.2",
                        ));
                        return;
                    }

                    // field values can't start or end with whitespace,
                    // and can't contain CR, LF or NUL anywhere
                    let first = value.first();
                    let last = value.last();
                    if first == Some(&b' ')
                        || first == Some(&b'\x09')
                        || last == Some(&b' ')
                        || last == Some(&b'\x09')
                    {
                        req_error = Some(H2StreamError::BadRequest(
                            "A field value MUST NOT start or end with an ASCII whitespace character (RFC 9113, section 8.2.1, 'Field validity')",
                        ));
                        return;
                    }

                    if value
                        .iter()
                        .any(|&b| b == b'\r' || b == b'\n' || b == b'\0')
                    {
                        req_error = Some(H2StreamError::BadRequest(
                            "A field value MUST NOT contain NUL, LF or CR at any position (RFC 9113, section 8.2.1, 'Field validity')",
                        ));
                        return;
                    }

                    let value: Piece = value.to_vec().into();
                    headers.append(name, value);
                }
            };

            match data {
                Data::Single(payload) => {
                    self.hpack_dec
                        .decode_with_cb(&payload[..], on_header_pair)
                        .map_err(|e| H2ErrorLevel::Connection(e.into()))?;
                }
                Data::Multi(fragments) => {
                    let total_len = fragments.iter().map(|f| f.len()).sum();
                    // this is a slow path, let's do a little heap allocation. we could
                    // be using `RollMut` for this, but it would probably need to resize
                    // a bunch
                    let mut payload = Vec::with_capacity(total_len);
                    for frag in &fragments {
                        payload.extend_from_slice(&frag[..]);
                    }
                    self.hpack_dec
                        .decode_with_cb(&payload[..], on_header_pair)
                        .map_err(|e| H2ErrorLevel::Connection(e.into()))?;
                }
            };

            if let Some(req_error) = req_error {
                return Err(req_error.into());
            }
        }

        match headers_or_trailers {
            HeadersOrTrailers::Headers => {
                let method = match method {
                    Some(method) => {
                        if method == Method::Connect {
                            // RFC 9113, section 8.5 'The CONNECT method': The ":scheme" and ":path"
                            // pseudo-header fields MUST be omitted.
                            if scheme.is_some() {
                                return Err(H2StreamError::BadRequest(
                                    "CONNECT method MUST NOT include ':scheme' pseudo-header",
                                )
                                .into());
                            }
                            if path.is_some() {
                                return Err(H2StreamError::BadRequest(
                                    "CONNECT method MUST NOT include ':path' pseudo-header",
                                )
                                .into());
                            }
                            if authority.is_none() {
                                return Err(H2StreamError::BadRequest(
                                    "CONNECT method MUST include ':authority' pseudo-header",
                                )
                                .into());
                            }

                            // well, also, we just don't support the `CONNECT` method.
                            return Err(H2RequestError {
                                status: StatusCode::NOT_IMPLEMENTED,
                                message: "CONNECT method is not supported".into(),
                            }
                            .into());
                        }

                        method
                    }
                    None => {
                        return Err(
                            H2StreamError::BadRequest("missing :method pseudo-header").into()
                        )
                    }
                };

                let scheme = match scheme {
                    Some(scheme) => scheme,
                    None => {
                        return Err(
                            H2StreamError::BadRequest("missing :scheme pseudo-header").into()
                        );
                    }
                };

                let path = match path {
                    Some(path) => path,
                    None => {
                        return Err(
                            H2StreamError::BadRequest("missing :path pseudo-header (RFC 9113, section 8.3.1)").into()
                        );
                    }
                };

                if path.len() == 0 && (scheme == Scheme::HTTP || scheme == Scheme::HTTPS) {
                    return Err(H2StreamError::BadRequest(
                        "':path' header value MUST NOT be empty for 'http' and 'https' URIs (RFC 9113, section 8.3.1)",
                    ).into());
                }

                let path_and_query: PathAndQuery = match path.parse() {
                    Ok(p) => p,
                    Err(_) => {
                        return Err(H2StreamError::BadRequest(
                            "':path' header value is not a valid PathAndQuery",
                        )
                        .into());
                    }
                };

                let authority = match authority {
                    Some(authority) => {
                        // if there's a `host` header, it must match the `:authority` pseudo-header
                        if let Some(host) = headers.get(header::HOST) {
                            let host = std::str::from_utf8(host).map_err(|_| {
                                H2StreamError::BadRequest("'host' header value is not utf-8")
                            })?;
                            let host_authority: Authority = host.parse().map_err(|_| {
                                H2StreamError::BadRequest("'host' header value is not a valid URI")
                            })?;
                            if host_authority != authority {
                                return Err(H2StreamError::BadRequest(
                                    "'host' header value does not match ':authority' pseudo-header value (RFC 9113, section 8.3.1)"
                                ).into());
                            }
                        }

                        Some(authority)
                    }
                    None => match headers.get(header::HOST) {
                        Some(host) => {
                            let host = std::str::from_utf8(host).map_err(|_| {
                                H2StreamError::BadRequest("'host' header value is not utf-8")
                            })?;
                            let authority: Authority = host.parse().map_err(|_| {
                                H2StreamError::BadRequest("'host' header value is not a valid URI")
                            })?;
                            Some(authority)
                        }
                        None => None,
                    },
                };

                let mut uri_parts: http::uri::Parts = Default::default();
                uri_parts.scheme = Some(scheme);
                uri_parts.authority = authority;
                uri_parts.path_and_query = Some(path_and_query);

                let uri = match http::uri::Uri::from_parts(uri_parts) {
                    Ok(uri) => uri,
                    Err(_) => {
                        return Err(H2RequestError {
                            status: StatusCode::BAD_REQUEST,
                            message: "invalid URI parts".into(),
                        }
                        .into())
                    }
                };

                let req = Request {
                    method,
                    uri,
                    version: Version::HTTP_2,
                    headers,
                };
                let content_length: Option<u64> = match req
                    .headers
                    .get(http::header::CONTENT_LENGTH)
                {
                    Some(len) => {
                        let len = std::str::from_utf8(len).map_err(|_| {
                            H2StreamError::BadRequest("content-length header value is not utf-8")
                        })?;
                        let len = len.parse().map_err(|_| {
                            H2StreamError::BadRequest(
                                "content-length header value is not a valid integer",
                            )
                        })?;
                        Some(len)
                    }
                    None => {
                        if end_stream {
                            Some(0)
                        } else {
                            None
                        }
                    }
                };

                let (piece_tx, piece_rx) = mpsc::channel(1);

                let req_body = H2Body {
                    content_length,
                    eof: end_stream,
                    rx: piece_rx,
                };

                let incoming = StreamIncoming::new(
                    self.state.self_settings.initial_window_size,
                    content_length,
                    piece_tx,
                );
                let outgoing = self.state.mk_stream_outgoing();

                let stream = self
                    .state
                    .streams
                    .get_mut(stream_id)
                    .expect("the stream was admitted before its headers were read");
                stream.state = if end_stream {
                    StreamState::HalfClosedRemote { outgoing }
                } else {
                    StreamState::Open { incoming, outgoing }
                };

                self.dispatch_stream(stream_id, req, req_body);
            }
            HeadersOrTrailers::Trailers => {
                let stream = self
                    .state
                    .streams
                    .get_mut(stream_id)
                    .expect("trailers only arrive for streams still in the table");
                match std::mem::take(&mut stream.state) {
                    StreamState::Open { mut incoming, outgoing } => {
                        incoming.write_trailers(headers).await?;

                        // trailers carry END_STREAM, the read side is done
                        stream.state = StreamState::HalfClosedRemote { outgoing };
                    }
                    _ => {
                        unreachable!("stream state should be open when we receive trailers")
                    }
                }
            }
        }

        Ok(())
    }
}

async fn pause_requested(signal: &Option<Rc<Notify>>) {
    match signal {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// loona-h2 models PUSH_PROMISE without flags; go through the raw frame
/// type so END_HEADERS can be set on the closing fragment.
fn push_promise_frame_type(end_headers: bool) -> FrameType {
    FrameType::Unknown(EncodedFrameType {
        ty: 0x05,
        flags: if end_headers { 0x04 } else { 0x00 },
    })
}

enum ReadHeadersMode {
    // we're accepting the stream or processing trailers, we want to
    // process the headers we read.
    Process,
    // we're refusing the stream, we want to skip over the headers we read.
    Skip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_without_cap_admits_everything() {
        let mut d = Dispatcher::new(20, 10);
        assert!(d.cap.is_none());
        for _ in 0..100 {
            assert!(d.try_admit());
        }
        assert!(d.complete().is_none());
    }

    #[test]
    fn dispatcher_cap_queues_and_drains_fifo() {
        let mut d = Dispatcher::new(2, 10);

        assert!(d.try_admit());
        assert!(d.try_admit());
        assert!(!d.try_admit());

        for id in [5u32, 7] {
            d.queue.push_back(QueuedStream {
                stream_id: StreamId(id),
                req: Request::default(),
                req_body: H2Body::empty(),
            });
        }

        let next = d.complete().expect("a queued stream should get the slot");
        assert_eq!(next.stream_id, StreamId(5));
        assert_eq!(d.running, 2);

        let next = d.complete().expect("the second queued stream runs next");
        assert_eq!(next.stream_id, StreamId(7));
        assert_eq!(d.running, 2);

        assert!(d.complete().is_none());
        assert_eq!(d.running, 1);
    }
}
