//! TCP data server (C6, spec §4.6): per-subscriber session state machine progressing
//! `AwaitingRequest -> ParsingHeaders -> WritingResponse -> SendingTestPattern -> Streaming
//! -> Closing`.

use crate::codec::{self, ByteOrder, WireOptions};
use crate::descriptor::StreamInfo;
use crate::sample::{Pool, SendBuffer};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Registry of in-flight session sockets, so `end_serving` can cancel pending I/O before
/// the listener itself is torn down (spec §4.6).
#[derive(Default)]
struct InflightRegistry {
    sockets: Mutex<HashMap<u64, TcpStream>>,
    next_id: AtomicU64,
}

impl InflightRegistry {
    fn register(&self, stream: &TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(clone) = stream.try_clone() {
            self.sockets.lock().insert(id, clone);
        }
        id
    }

    fn unregister(&self, id: u64) {
        self.sockets.lock().remove(&id);
    }

    fn close_all(&self) {
        for (_, sock) in self.sockets.lock().drain() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// A bound TCP data server. Owns the accept loop and tracks in-flight sessions.
pub struct TcpServer {
    listener: TcpListener,
    info: Arc<RwLock<StreamInfo>>,
    send_buffer: Arc<SendBuffer>,
    pool_template: Pool,
    shutdown: Arc<AtomicBool>,
    inflight: Arc<InflightRegistry>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn bind(
        addr: SocketAddr,
        info: Arc<RwLock<StreamInfo>>,
        send_buffer: Arc<SendBuffer>,
        pool_template: Pool,
    ) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpServer {
            listener,
            info,
            send_buffer,
            pool_template,
            shutdown: Arc::new(AtomicBool::new(false)),
            inflight: Arc::new(InflightRegistry::default()),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn begin_serving(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::spawn(move || this.accept_loop());
        *self.accept_thread.lock() = Some(handle);
    }

    pub fn end_serving(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.inflight.close_all();
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn accept_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let info = self.info.clone();
                    let send_buffer = self.send_buffer.clone();
                    let pool_template = self.pool_template.clone();
                    let inflight = self.inflight.clone();
                    let shutdown = self.shutdown.clone();
                    std::thread::spawn(move || {
                        let id = inflight.register(&stream);
                        serve_session(stream, info, send_buffer, pool_template, &shutdown);
                        inflight.unregister(id);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    log::warn!("tcp accept error: {e}");
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingRequest,
    ParsingHeaders,
    WritingResponse,
    SendingTestPattern,
    Streaming,
    Closing,
}

struct RequestHeaders {
    native_byte_order: Option<u32>,
    has_ieee754: bool,
    supports_subnormals: bool,
    data_protocol_version: u32,
    max_buffer_length: usize,
    #[allow(dead_code)]
    max_chunk_length: usize,
    endian_performance: f64,
}

impl Default for RequestHeaders {
    fn default() -> Self {
        RequestHeaders {
            native_byte_order: None,
            has_ieee754: true,
            supports_subnormals: false,
            data_protocol_version: 110,
            max_buffer_length: 360,
            max_chunk_length: 0,
            endian_performance: 0.0,
        }
    }
}

fn serve_session(
    stream: TcpStream,
    info: Arc<RwLock<StreamInfo>>,
    send_buffer: Arc<SendBuffer>,
    pool_template: Pool,
    shutdown: &Arc<AtomicBool>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream.try_clone().expect("tcp stream clone"));
    let mut writer = stream;

    let mut state = SessionState::AwaitingRequest;
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    state = SessionState::ParsingHeaders;

    let Some(method) = super::parse_method_line(line.trim_end()) else { return };

    if let Some(rest) = method.strip_prefix("fullinfo") {
        let _ = rest;
        let xml = info.read().to_fullinfo();
        let _ = writer.write_all(xml.as_bytes());
        return;
    }

    if let Some(rest) = method.strip_prefix("streamfeed") {
        handle_streamfeed(rest, &mut reader, &mut writer, info, send_buffer, pool_template, &mut state, shutdown);
        return;
    }
    // unrecognized method: close
}

fn handle_streamfeed(
    version_suffix: &str,
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
    info: Arc<RwLock<StreamInfo>>,
    send_buffer: Arc<SendBuffer>,
    pool_template: Pool,
    state: &mut SessionState,
    shutdown: &Arc<AtomicBool>,
) {
    let is_v1_00 = !version_suffix.starts_with('/');

    if !is_v1_00 {
        let requested_uid = version_suffix.split_whitespace().nth(1).unwrap_or("");
        if requested_uid != info.read().uid() {
            let _ = writer.write_all(b"LSL/110 404 ERR stream UID no longer served\r\n\r\n");
            return;
        }
    }

    if is_v1_00 {
        // `LSL:streamfeed\r\n<max_buf> <max_chunk>\r\n`
        let mut params = String::new();
        if reader.read_line(&mut params).unwrap_or(0) == 0 {
            return;
        }
        let mut parts = params.split_whitespace();
        let max_buf: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(360);

        *state = SessionState::WritingResponse;
        let shortinfo = info.read().to_shortinfo();
        let mut out = Vec::new();
        let _ = codec::write_archive_header(&mut out);
        let _ = codec::write_archive_string(&mut out, &shortinfo);
        if writer.write_all(&out).is_err() {
            return;
        }

        let opts = WireOptions { protocol_version: 100, byte_order: ByteOrder::native(), suppress_subnormals: false };
        stream_loop(writer, send_buffer, pool_template, max_buf, &opts, shutdown);
        return;
    }

    // >=1.10: parse headers until blank line
    *state = SessionState::ParsingHeaders;
    let mut headers = RequestHeaders::default();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            match key {
                "Native-Byte-Order" => headers.native_byte_order = value.parse().ok(),
                "Endian-Performance" => headers.endian_performance = value.parse().unwrap_or(0.0),
                "Has-IEEE754-Floats" => headers.has_ieee754 = value == "1",
                "Supports-Subnormals" => headers.supports_subnormals = value == "1",
                "Data-Protocol-Version" => {
                    headers.data_protocol_version = value.parse().unwrap_or(110)
                }
                "Max-Buffer-Length" => headers.max_buffer_length = value.parse().unwrap_or(360),
                "Max-Chunk-Length" => headers.max_chunk_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    *state = SessionState::WritingResponse;
    let remote_order = headers
        .native_byte_order
        .and_then(ByteOrder::from_wire_token);
    let local_order = ByteOrder::native();
    // The server may pick a byte order to minimize combined conversion cost; since we
    // don't track per-value conversion cost here, prefer the remote's requested order
    // when given (matching the `Endian-Performance` hint's intent) and fall back to local.
    let chosen_order = remote_order.unwrap_or(local_order);

    let descriptor_format = info.read().descriptor.channel_format;
    if descriptor_format.is_ieee754() && !headers.has_ieee754 {
        let _ = writer.write_all(b"LSL/110 400 ERR Has-IEEE754-Floats required\r\n\r\n");
        return;
    }

    let negotiated_version = headers.data_protocol_version.min(110);
    let uid = info.read().uid().to_string();
    let response = format!(
        "LSL/110 200 OK\r\nByte-Order: {}\r\nSuppress-Subnormals: {}\r\nUID: {uid}\r\nData-Protocol-Version: {negotiated_version}\r\n\r\n",
        chosen_order.wire_token(),
        if headers.supports_subnormals { 1 } else { 0 },
    );
    if writer.write_all(response.as_bytes()).is_err() {
        return;
    }

    *state = SessionState::SendingTestPattern;
    let opts = WireOptions {
        protocol_version: negotiated_version,
        byte_order: chosen_order,
        suppress_subnormals: headers.supports_subnormals,
    };
    for idx in [2u32, 4u32] {
        let sample = codec::build_test_pattern(&pool_template, idx);
        if codec::write_sample(writer, &sample, &opts).is_err() {
            return;
        }
    }

    *state = SessionState::Streaming;
    stream_loop(writer, send_buffer, pool_template, headers.max_buffer_length, &opts, shutdown);
    *state = SessionState::Closing;
}

fn stream_loop(
    writer: &mut TcpStream,
    send_buffer: Arc<SendBuffer>,
    pool_template: Pool,
    max_buffered: usize,
    opts: &WireOptions,
    shutdown: &Arc<AtomicBool>,
) {
    let _ = &pool_template;
    let queue = send_buffer.new_consumer(max_buffered.max(1));
    while !shutdown.load(Ordering::Acquire) {
        match queue.pop(Duration::from_millis(200)) {
            Some(sample) => {
                if codec::write_sample(writer, &sample, opts).is_err() {
                    return;
                }
            }
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StreamDescriptor;
    use crate::format::ChannelFormat;
    use std::io::Read;

    fn make_info() -> Arc<RwLock<StreamInfo>> {
        Arc::new(RwLock::new(StreamInfo::new(
            StreamDescriptor {
                name: "Bounce".into(),
                stream_type: "Markers".into(),
                channel_count: 1,
                nominal_srate: 0.0,
                channel_format: ChannelFormat::Int8,
                source_id: String::new(),
            },
            10,
        )))
    }

    #[test]
    fn fullinfo_request_returns_xml() {
        let info = make_info();
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let sb = SendBuffer::new(1024);
        let server =
            Arc::new(TcpServer::bind("127.0.0.1:0".parse().unwrap(), info, sb, pool).unwrap());
        let addr = server.local_addr().unwrap();
        server.begin_serving();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"LSL:fullinfo\r\n").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = String::new();
        client.read_to_string(&mut buf).unwrap();
        assert!(buf.contains("<name>Bounce</name>"));

        server.end_serving();
    }

    #[test]
    fn streamfeed_handshake_and_bounce_sample() {
        let info = make_info();
        let uid = info.read().uid().to_string();
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let sb = SendBuffer::new(1024);
        let server =
            Arc::new(TcpServer::bind("127.0.0.1:0".parse().unwrap(), info, sb.clone(), pool.clone()).unwrap());
        let addr = server.local_addr().unwrap();
        server.begin_serving();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let request = format!(
            "LSL:streamfeed/110 {uid}\r\nNative-Byte-Order: {}\r\nHas-IEEE754-Floats: 1\r\nSupports-Subnormals: 0\r\nData-Protocol-Version: 110\r\nMax-Buffer-Length: 360\r\n\r\n",
            ByteOrder::native().wire_token()
        );
        client.write_all(request.as_bytes()).unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        assert!(status.starts_with("LSL/110 200"));
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).unwrap();
            if header.trim().is_empty() {
                break;
            }
        }

        // wait for consumers so the producer side knows a subscriber is attached
        assert!(sb.wait_for_consumers(Duration::from_secs(2)));
        let sample = pool.allocate(0.0, false);
        sb.push(sample);

        let opts = WireOptions { protocol_version: 110, byte_order: ByteOrder::native(), suppress_subnormals: false };
        // two test-pattern samples, then our pushed sample
        let _tp1 = codec::read_sample(&mut reader, &pool, &opts).unwrap();
        let _tp2 = codec::read_sample(&mut reader, &pool, &opts).unwrap();
        let got = codec::read_sample(&mut reader, &pool, &opts).unwrap();
        assert_eq!(got.timestamp, 0.0);

        server.end_serving();
    }

    #[test]
    fn streamfeed_with_stale_uid_gets_404() {
        let info = make_info();
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let sb = SendBuffer::new(1024);
        let server =
            Arc::new(TcpServer::bind("127.0.0.1:0".parse().unwrap(), info, sb, pool).unwrap());
        let addr = server.local_addr().unwrap();
        server.begin_serving();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let request = format!(
            "LSL:streamfeed/110 no-longer-served\r\nNative-Byte-Order: {}\r\nHas-IEEE754-Floats: 1\r\nSupports-Subnormals: 0\r\nData-Protocol-Version: 110\r\nMax-Buffer-Length: 360\r\n\r\n",
            ByteOrder::native().wire_token()
        );
        client.write_all(request.as_bytes()).unwrap();

        let mut reader = BufReader::new(client);
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        assert!(status.starts_with("LSL/110 404"));

        server.end_serving();
    }
}
