//! One-shot metadata fetch over TCP (part of C11, spec §4.11).

use crate::descriptor::StreamInfo;
use crate::error::{LslError, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Connect, send `LSL:fullinfo`, and parse the reply into a `StreamInfo`.
pub fn fetch_info(addr: SocketAddr, timeout: Duration, cache_capacity: usize) -> Result<StreamInfo> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(b"LSL:fullinfo\r\n")?;
    let mut xml = String::new();
    stream.read_to_string(&mut xml)?;
    StreamInfo::from_xml(&xml, cache_capacity)
}

/// Retry `fetch_info` a fixed number of times, spacing attempts by `retry_interval`.
/// Used by `stream_inlet::info(timeout)` (spec §6) which tolerates a momentarily
/// unreachable outlet without surfacing a hard error.
pub fn fetch_info_with_retry(
    addr: SocketAddr,
    per_attempt_timeout: Duration,
    retries: u32,
    retry_interval: Duration,
    cache_capacity: usize,
) -> Result<StreamInfo> {
    let mut last_err = LslError::Timeout;
    for attempt in 0..=retries {
        match fetch_info(addr, per_attempt_timeout, cache_capacity) {
            Ok(info) => return Ok(info),
            Err(e) => {
                last_err = e;
                if attempt < retries {
                    std::thread::sleep(retry_interval);
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StreamDescriptor;
    use crate::format::ChannelFormat;
    use crate::net::tcp::TcpServer;
    use crate::sample::{Pool, SendBuffer};
    use parking_lot::RwLock;
    use std::sync::Arc;

    #[test]
    fn fetch_info_parses_server_reply() {
        let info = Arc::new(RwLock::new(StreamInfo::new(
            StreamDescriptor {
                name: "Probe".into(),
                stream_type: "EEG".into(),
                channel_count: 2,
                nominal_srate: 100.0,
                channel_format: ChannelFormat::Float32,
                source_id: "src1".into(),
            },
            10,
        )));
        let pool = Pool::new(ChannelFormat::Float32, 2, 0);
        let sb = SendBuffer::new(16);
        let server = Arc::new(TcpServer::bind("127.0.0.1:0".parse().unwrap(), info, sb, pool).unwrap());
        let addr = server.local_addr().unwrap();
        server.begin_serving();

        let got = fetch_info(addr, Duration::from_secs(2), 10).unwrap();
        assert_eq!(got.descriptor.name, "Probe");
        assert_eq!(got.descriptor.channel_count, 2);

        server.end_serving();
    }
}
