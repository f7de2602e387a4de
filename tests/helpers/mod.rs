use std::{
    collections::HashMap,
    error::Error as StdError,
    fmt,
    future::Future,
    rc::Rc,
    time::Duration,
};

use petrel::{
    buffet::{self, Piece, PieceList, RollMut},
    h2::{serve, serve_h2c_upgrade, H2cUpgrade, H2Encoder, ServerConf},
    Body, BodyChunk, ExpectResponseHeaders, Responder, Response, ResponseDone, ServerDriver,
};

pub(crate) mod tracing_common;

use buffet::{PipeRead, PipeWrite, Roll, WriteOwned};
use loona_h2::{
    ContinuationFlags, DataFlags, Frame, FrameType, HeadersFlags, IntoPiece, PingFlags, Setting,
    SettingPairs, SettingsFlags, StreamId, PREFACE,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Runs a test body inside the buffet runtime with tracing set up.
pub(crate) fn run<F: Future<Output = ()>>(test: F) {
    buffet::start(async {
        tracing_common::setup_tracing();
        test.await;
    });
}

/// Boxed-string error for test drivers.
pub(crate) struct TestError(pub String);

pub(crate) fn te(e: impl fmt::Display) -> TestError {
    TestError(e.to_string())
}

impl fmt::Debug for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for TestError {}

impl AsRef<dyn StdError> for TestError {
    fn as_ref(&self) -> &(dyn StdError + 'static) {
        self
    }
}

/// Responds 200 with an empty body, unconditionally.
pub(crate) struct OkDriver;

impl ServerDriver<H2Encoder> for OkDriver {
    type Error = TestError;

    async fn handle(
        &self,
        _req: petrel::Request,
        _req_body: &mut impl Body,
        respond: Responder<H2Encoder, ExpectResponseHeaders>,
    ) -> Result<Responder<H2Encoder, ResponseDone>, Self::Error> {
        let respond = respond
            .write_final_response(Response::default())
            .await
            .map_err(te)?;
        respond.finish_body(None).await.map_err(te)
    }
}

/// Responds 200 with `len` bytes of body.
pub(crate) struct BigBodyDriver {
    pub(crate) len: usize,
}

impl ServerDriver<H2Encoder> for BigBodyDriver {
    type Error = TestError;

    async fn handle(
        &self,
        _req: petrel::Request,
        _req_body: &mut impl Body,
        respond: Responder<H2Encoder, ExpectResponseHeaders>,
    ) -> Result<Responder<H2Encoder, ResponseDone>, Self::Error> {
        let mut respond = respond
            .write_final_response(Response::default())
            .await
            .map_err(te)?;
        respond
            .write_chunk(vec![0x42u8; self.len].into())
            .await
            .map_err(te)?;
        respond.finish_body(None).await.map_err(te)
    }
}

/// Drains the request body to its end, then responds 200. Streams whose
/// body never ends keep their handler (and its concurrency slot) busy.
pub(crate) struct EchoDriver;

impl ServerDriver<H2Encoder> for EchoDriver {
    type Error = TestError;

    async fn handle(
        &self,
        _req: petrel::Request,
        req_body: &mut impl Body,
        respond: Responder<H2Encoder, ExpectResponseHeaders>,
    ) -> Result<Responder<H2Encoder, ResponseDone>, Self::Error> {
        let mut total = 0u64;
        loop {
            match req_body.next_chunk().await.map_err(te)? {
                BodyChunk::Chunk(chunk) => total += chunk.len() as u64,
                BodyChunk::Done { .. } => break,
            }
        }
        debug!(%total, "request body drained");

        let respond = respond
            .write_final_response(Response::default())
            .await
            .map_err(te)?;
        respond.finish_body(None).await.map_err(te)
    }
}

/// Responds 200 and pushes a companion resource on the side.
pub(crate) struct PushDriver;

impl ServerDriver<H2Encoder> for PushDriver {
    type Error = TestError;

    async fn handle(
        &self,
        _req: petrel::Request,
        _req_body: &mut impl Body,
        mut respond: Responder<H2Encoder, ExpectResponseHeaders>,
    ) -> Result<Responder<H2Encoder, ResponseDone>, Self::Error> {
        let pushed = petrel::Request {
            uri: "https://h/style.css".parse().unwrap(),
            ..Default::default()
        };
        respond
            .encoder_mut()
            .push_request(pushed)
            .await
            .map_err(te)?;

        let respond = respond
            .write_final_response(Response::default())
            .await
            .map_err(te)?;
        respond.finish_body(None).await.map_err(te)
    }
}

pub(crate) fn start_server<D>(conf: ServerConf, driver: D) -> TestConn
where
    D: ServerDriver<H2Encoder> + 'static,
    D::Error: fmt::Debug,
{
    let (client_write, server_read) = buffet::pipe();
    let (server_write, client_read) = buffet::pipe();

    let conf = Rc::new(conf);
    let driver = Rc::new(driver);

    buffet::spawn(async move {
        let client_buf = RollMut::alloc().unwrap();
        match serve((server_read, server_write), conf, client_buf, driver).await {
            Ok(outcome) => debug!(?outcome, "server side done"),
            Err(e) => debug!("server side errored: {e}"),
        }
    });

    TestConn::new(client_read, client_write)
}

pub(crate) fn start_upgrade_server<D>(conf: ServerConf, driver: D, upgrade: H2cUpgrade) -> TestConn
where
    D: ServerDriver<H2Encoder> + 'static,
    D::Error: fmt::Debug,
{
    let (client_write, server_read) = buffet::pipe();
    let (server_write, client_read) = buffet::pipe();

    let conf = Rc::new(conf);
    let driver = Rc::new(driver);

    buffet::spawn(async move {
        let client_buf = RollMut::alloc().unwrap();
        match serve_h2c_upgrade((server_read, server_write), conf, client_buf, driver, upgrade)
            .await
        {
            Ok(outcome) => debug!(?outcome, "server side done"),
            Err(e) => debug!("server side errored: {e}"),
        }
    });

    TestConn::new(client_read, client_write)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown,
}

pub(crate) fn frame_kind(frame: &Frame) -> FrameKind {
    match frame.frame_type {
        FrameType::Data(_) => FrameKind::Data,
        FrameType::Headers(_) => FrameKind::Headers,
        FrameType::Priority => FrameKind::Priority,
        FrameType::RstStream => FrameKind::RstStream,
        FrameType::Settings(_) => FrameKind::Settings,
        FrameType::PushPromise => FrameKind::PushPromise,
        FrameType::Ping(_) => FrameKind::Ping,
        FrameType::GoAway => FrameKind::GoAway,
        FrameType::WindowUpdate => FrameKind::WindowUpdate,
        FrameType::Continuation(_) => FrameKind::Continuation,
        FrameType::Unknown(ft) => {
            // a server may legitimately emit PUSH_PROMISE through the
            // raw frame type
            if ft.ty == 0x05 {
                FrameKind::PushPromise
            } else {
                FrameKind::Unknown
            }
        }
    }
}

pub(crate) enum Ev {
    Frame { frame: Frame, payload: Roll },
}

/// A raw-frame HTTP/2 client for driving the server over an in-memory
/// pipe: writes frames directly, reads everything the server emits into
/// an event queue.
pub(crate) struct TestConn {
    w: PipeWrite,
    scratch: RollMut,
    ev_rx: mpsc::Receiver<Ev>,
    pub(crate) hpack_enc: loona_hpack::Encoder<'static>,
    pub(crate) hpack_dec: loona_hpack::Decoder<'static>,
}

impl TestConn {
    pub(crate) fn new(mut r: PipeRead, w: PipeWrite) -> Self {
        let (ev_tx, ev_rx) = mpsc::channel::<Ev>(32);

        let recv_fut = async move {
            let mut res_buf = RollMut::alloc().unwrap();
            let mut eof = false;
            'read: loop {
                if !eof {
                    res_buf.reserve().unwrap();
                    let res;
                    (res, res_buf) = res_buf.read_into(16384, &mut r).await;
                    let n = match res {
                        Ok(n) => n,
                        Err(e) => {
                            debug!("test conn read error: {e}");
                            break 'read;
                        }
                    };
                    if n == 0 {
                        debug!("test conn reached EOF");
                        eof = true;
                    }
                }

                loop {
                    if eof && res_buf.is_empty() {
                        break 'read;
                    }

                    match Frame::parse(res_buf.filled()) {
                        Ok((rest, frame)) => {
                            res_buf.keep(rest);
                            debug!("test conn < {frame:?}");

                            let frame_len = frame.len as usize;
                            res_buf.reserve_at_least(frame_len).unwrap();

                            while res_buf.len() < frame_len {
                                let res;
                                (res, res_buf) = res_buf.read_into(16384, &mut r).await;
                                let n = res.unwrap();
                                if n == 0 {
                                    panic!("server sent a frame header then hung up mid-payload");
                                }
                            }

                            let payload = if frame_len == 0 {
                                Roll::empty()
                            } else {
                                res_buf.take_at_most(frame_len).unwrap()
                            };
                            assert_eq!(payload.len(), frame_len);

                            if ev_tx.send(Ev::Frame { frame, payload }).await.is_err() {
                                break 'read;
                            }
                        }
                        Err(loona_h2::nom::Err::Incomplete(_)) => {
                            if eof && !res_buf.is_empty() {
                                panic!(
                                    "server sent a partial frame header then hung up ({} bytes)",
                                    res_buf.len()
                                );
                            }
                            break;
                        }
                        Err(e) => {
                            panic!("test conn failed to parse frame header: {e}");
                        }
                    }
                }
            }
        };
        buffet::spawn(recv_fut);

        Self {
            w,
            scratch: RollMut::alloc().unwrap(),
            ev_rx,
            hpack_enc: Default::default(),
            hpack_dec: Default::default(),
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: Frame, payload: impl IntoPiece) {
        let payload = payload.into_piece(&mut self.scratch).unwrap();
        let frame = frame.with_len(payload.len().try_into().unwrap());

        let header = frame.into_piece(&mut self.scratch).unwrap();
        self.w
            .writev_all_owned(PieceList::single(header).followed_by(payload))
            .await
            .unwrap();
    }

    /// Client half of the connection preface: magic + SETTINGS, then
    /// wait for the server's SETTINGS and ack them, and for the server
    /// to ack ours.
    pub(crate) async fn handshake(&mut self) {
        self.handshake_without_ack_wait().await;

        let (frame, _payload) = self.wait_for_frame(&[FrameKind::Settings]).await;
        assert!(settings_is_ack(&frame), "server should ack our settings");
    }

    /// Like [TestConn::handshake], but doesn't wait for the server to
    /// ack our settings — needed when the server may already have
    /// response frames queued (e.g. an upgraded request), which a
    /// skipping wait would throw away.
    pub(crate) async fn handshake_without_ack_wait(&mut self) {
        self.w.write_all_owned(PREFACE).await.unwrap();

        self.write_frame(
            Frame::new(
                FrameType::Settings(Default::default()),
                StreamId::CONNECTION,
            ),
            SettingPairs(&[
                (Setting::InitialWindowSize, 65_535),
                (Setting::EnablePush, 1),
            ]),
        )
        .await;

        let (frame, _payload) = self.wait_for_frame(&[FrameKind::Settings]).await;
        assert!(
            !settings_is_ack(&frame),
            "server should send its settings first thing (no ack)"
        );

        self.write_frame(
            Frame::new(
                FrameType::Settings(SettingsFlags::Ack.into()),
                StreamId::CONNECTION,
            ),
            Piece::empty(),
        )
        .await;
    }

    pub(crate) async fn write_settings_pairs(&mut self, pairs: &[(Setting, u32)]) {
        self.write_frame(
            Frame::new(
                FrameType::Settings(Default::default()),
                StreamId::CONNECTION,
            ),
            SettingPairs(pairs),
        )
        .await;
    }

    /// Waits for a SETTINGS frame with the ACK flag, skipping anything
    /// else (including non-ack SETTINGS).
    pub(crate) async fn wait_for_settings_ack(&mut self) {
        loop {
            let (frame, _payload) = self.wait_for_frame(&[FrameKind::Settings]).await;
            if settings_is_ack(&frame) {
                return;
            }
        }
    }

    pub(crate) async fn write_request_headers(
        &mut self,
        stream_id: StreamId,
        path: &str,
        end_stream: bool,
    ) {
        let headers: Vec<(&[u8], &[u8])> = vec![
            (b":method", b"GET"),
            (b":scheme", b"https"),
            (b":path", path.as_bytes()),
            (b":authority", b"h"),
        ];
        debug_assert_eq!(self.scratch.len(), 0);
        self.hpack_enc
            .encode_into(headers, &mut self.scratch)
            .unwrap();
        let block: Piece = self.scratch.take_all().into();

        let mut flags = HeadersFlags::EndHeaders.into();
        if end_stream {
            flags |= HeadersFlags::EndStream;
        }
        self.write_frame(Frame::new(FrameType::Headers(flags), stream_id), block)
            .await;
    }

    pub(crate) async fn write_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let mut flags = loona_h2::enumflags2::BitFlags::<DataFlags>::default();
        if end_stream {
            flags |= DataFlags::EndStream;
        }
        self.write_frame(Frame::new(FrameType::Data(flags), stream_id), data.to_vec())
            .await;
    }

    /// DATA with a padding block: length byte + data + `pad_len` zeroes.
    pub(crate) async fn write_padded_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        pad_len: u8,
        end_stream: bool,
    ) {
        let mut payload = Vec::with_capacity(1 + data.len() + pad_len as usize);
        payload.push(pad_len);
        payload.extend_from_slice(data);
        payload.extend(std::iter::repeat(0u8).take(pad_len as usize));

        let mut flags = loona_h2::enumflags2::BitFlags::<DataFlags>::default()
            | DataFlags::Padded;
        if end_stream {
            flags |= DataFlags::EndStream;
        }
        self.write_frame(Frame::new(FrameType::Data(flags), stream_id), payload)
            .await;
    }

    pub(crate) async fn write_window_update(&mut self, stream_id: StreamId, increment: u32) {
        self.write_frame(
            Frame::new(FrameType::WindowUpdate, stream_id),
            (increment & 0x7fff_ffff).to_be_bytes().to_vec(),
        )
        .await;
    }

    pub(crate) async fn write_priority(
        &mut self,
        stream_id: StreamId,
        dependency: StreamId,
        weight_wire: u8,
    ) {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&(dependency.0 & 0x7fff_ffff).to_be_bytes());
        payload.push(weight_wire);
        self.write_frame(Frame::new(FrameType::Priority, stream_id), payload)
            .await;
    }

    pub(crate) async fn write_ping(&mut self, ack: bool, payload: [u8; 8]) {
        let flags = if ack {
            PingFlags::Ack.into()
        } else {
            Default::default()
        };
        self.write_frame(
            Frame::new(FrameType::Ping(flags), StreamId::CONNECTION),
            payload.to_vec(),
        )
        .await;
    }

    /// Waits (up to 5s) for a frame of one of the given kinds, skipping
    /// everything else.
    pub(crate) async fn wait_for_frame(&mut self, kinds: &[FrameKind]) -> (Frame, Roll) {
        let deadline = Duration::from_secs(5);
        loop {
            match tokio::time::timeout(deadline, self.ev_rx.recv()).await {
                Err(_) => panic!("timed out waiting for {kinds:?}"),
                Ok(None) => panic!("server hung up while waiting for {kinds:?}"),
                Ok(Some(Ev::Frame { frame, payload })) => {
                    if kinds.contains(&frame_kind(&frame)) {
                        return (frame, payload);
                    }
                    trace!(?frame, "skipping frame");
                }
            }
        }
    }

    /// Collects DATA payload bytes per stream until the server goes
    /// quiet for `quiet`.
    pub(crate) async fn drain_data(&mut self, quiet: Duration) -> HashMap<u32, usize> {
        let mut totals: HashMap<u32, usize> = HashMap::new();
        loop {
            match tokio::time::timeout(quiet, self.ev_rx.recv()).await {
                Err(_) => return totals,
                Ok(None) => return totals,
                Ok(Some(Ev::Frame { frame, payload })) => {
                    if matches!(frame_kind(&frame), FrameKind::Data) {
                        *totals.entry(frame.stream_id.0).or_default() += payload.len();
                    }
                }
            }
        }
    }

    /// Waits for a HEADERS frame for `stream_id` (plus any CONTINUATION
    /// frames) and returns its flags and decoded header list.
    pub(crate) async fn wait_for_headers(
        &mut self,
        stream_id: StreamId,
    ) -> (
        loona_h2::enumflags2::BitFlags<HeadersFlags>,
        Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        let (frame, payload) = self.wait_for_frame(&[FrameKind::Headers]).await;
        assert_eq!(frame.stream_id, stream_id, "unexpected stream id");
        let flags = match frame.frame_type {
            FrameType::Headers(flags) => flags,
            _ => unreachable!(),
        };

        let mut block = payload.to_vec();
        if !flags.contains(HeadersFlags::EndHeaders) {
            loop {
                let (cont, cont_payload) = self.wait_for_frame(&[FrameKind::Continuation]).await;
                assert_eq!(cont.stream_id, stream_id);
                block.extend_from_slice(&cont_payload[..]);
                let cont_flags = match cont.frame_type {
                    FrameType::Continuation(f) => f,
                    _ => unreachable!(),
                };
                if cont_flags.contains(ContinuationFlags::EndHeaders) {
                    break;
                }
            }
        }

        let mut decoded = Vec::new();
        self.hpack_dec
            .decode_with_cb(&block[..], |k, v| {
                decoded.push((k.to_vec(), v.to_vec()));
            })
            .unwrap();

        (flags, decoded)
    }
}

pub(crate) fn settings_is_ack(frame: &Frame) -> bool {
    match frame.frame_type {
        FrameType::Settings(flags) => flags.contains(SettingsFlags::Ack),
        _ => false,
    }
}

/// GOAWAY payload: 31-bit last stream id, 32-bit error code, debug bytes.
pub(crate) fn parse_goaway(payload: &Roll) -> (u32, u32, Vec<u8>) {
    assert!(payload.len() >= 8, "goaway payload too short");
    let last_stream_id =
        u32::from_be_bytes(payload[0..4].try_into().unwrap()) & 0x7fff_ffff;
    let error_code = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    (last_stream_id, error_code, payload[8..].to_vec())
}

/// RST_STREAM payload: a single 32-bit error code.
pub(crate) fn parse_rst(payload: &Roll) -> u32 {
    assert_eq!(payload.len(), 4, "rst payload must be 4 bytes");
    u32::from_be_bytes(payload[0..4].try_into().unwrap())
}

pub(crate) fn header_value<'a>(
    decoded: &'a [(Vec<u8>, Vec<u8>)],
    name: &[u8],
) -> Option<&'a [u8]> {
    decoded
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| &v[..])
}

// quiet period long enough for the server's event loop to settle, short
// enough to keep the suite fast
pub(crate) const QUIET: Duration = Duration::from_millis(300);
