//! UDP discovery/time server (C7, spec §4.7): handles `LSL:shortinfo` queries and
//! `LSL:timedata` NTP-style exchanges on a bound socket. A multicast-bound instance
//! disables the time service (discovery-only); both a unicast and a multicast instance
//! coexist per enabled IP stack.

use crate::clock::local_clock;
use crate::descriptor::StreamInfo;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::parse_method_line;

/// A bound UDP discovery/time responder. `is_multicast` instances skip `timedata`.
pub struct UdpServer {
    socket: UdpSocket,
    info: Arc<RwLock<StreamInfo>>,
    is_multicast: bool,
    shutdown: Arc<AtomicBool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    /// Bind a plain unicast service-port responder (enables both shortinfo and timedata).
    pub fn bind_unicast(addr: SocketAddr, info: Arc<RwLock<StreamInfo>>) -> crate::error::Result<Self> {
        let socket = new_socket(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        Ok(UdpServer {
            socket,
            info,
            is_multicast: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: parking_lot::Mutex::new(None),
        })
    }

    /// Bind a multicast-group discovery listener (shortinfo only) with the given TTL.
    pub fn bind_multicast(
        bind_addr: SocketAddr,
        group: std::net::Ipv4Addr,
        ttl: u32,
        info: Arc<RwLock<StreamInfo>>,
    ) -> crate::error::Result<Self> {
        let domain = Domain::IPV4;
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        #[cfg(unix)]
        sock.set_reuse_port(true)?;
        sock.bind(&bind_addr.into())?;
        if let SocketAddr::V4(v4) = bind_addr {
            sock.join_multicast_v4(&group, v4.ip())?;
        }
        sock.set_multicast_ttl_v4(ttl)?;
        let socket: UdpSocket = sock.into();
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        Ok(UdpServer {
            socket,
            info,
            is_multicast: true,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: parking_lot::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the worker thread that services this socket until `end_serving`.
    pub fn begin_serving(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::spawn(move || this.serve_loop());
        *self.worker.lock() = Some(handle);
    }

    pub fn end_serving(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn serve_loop(&self) {
        let mut buf = [0u8; 65536];
        while !self.shutdown.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(e) => {
                    log::warn!("udp discovery socket error: {e}");
                    continue;
                }
            }
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let text = String::from_utf8_lossy(datagram);
        let mut lines = text.lines();
        let Some(method_line) = lines.next() else { return };
        match parse_method_line(method_line) {
            Some("shortinfo") => self.handle_shortinfo(&mut lines, from),
            Some("timedata") => {
                if !self.is_multicast {
                    self.handle_timedata(&mut lines, from);
                }
            }
            _ => {}
        }
    }

    fn handle_shortinfo(&self, lines: &mut std::str::Lines, from: SocketAddr) {
        let query = lines.next().unwrap_or("");
        let Some(addr_line) = lines.next() else { return };
        let mut parts = addr_line.split_whitespace();
        let Some(port_str) = parts.next() else { return };
        let Ok(return_port) = port_str.parse::<u16>() else { return };
        let query_id = parts.next().unwrap_or("");

        let info = self.info.read();
        if !info.matches_query(query) {
            return;
        }
        let reply = format!("{query_id}\r\n{}", info.to_shortinfo());
        drop(info);
        let mut dest = from;
        dest.set_port(return_port);
        if let Err(e) = self.socket.send_to(reply.as_bytes(), dest) {
            log::warn!("shortinfo reply to {dest} failed: {e}");
        }
    }

    fn handle_timedata(&self, lines: &mut std::str::Lines, from: SocketAddr) {
        let t1 = local_clock();
        let Some(request_line) = lines.next() else { return };
        let mut parts = request_line.split_whitespace();
        let Some(wave_id) = parts.next() else { return };
        let Some(t0_str) = parts.next() else { return };
        let Ok(t0) = t0_str.parse::<f64>() else { return };
        let t2 = local_clock();
        let reply = format!("{wave_id} {t0} {t1} {t2}\r\n");
        if let Err(e) = self.socket.send_to(reply.as_bytes(), from) {
            log::warn!("timedata reply to {from} failed: {e}");
        }
    }
}

fn new_socket(addr: SocketAddr) -> crate::error::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{StreamDescriptor, StreamInfo};
    use crate::format::ChannelFormat;

    fn info() -> Arc<RwLock<StreamInfo>> {
        Arc::new(RwLock::new(StreamInfo::new(
            StreamDescriptor {
                name: "T".into(),
                stream_type: "EEG".into(),
                channel_count: 1,
                nominal_srate: 0.0,
                channel_format: ChannelFormat::Float32,
                source_id: String::new(),
            },
            10,
        )))
    }

    #[test]
    fn shortinfo_roundtrip_over_loopback() {
        let server_info = info();
        let server = Arc::new(
            UdpServer::bind_unicast("127.0.0.1:0".parse().unwrap(), server_info).unwrap(),
        );
        let server_addr = server.local_addr().unwrap();
        server.begin_serving();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let return_port = client.local_addr().unwrap().port();
        let request = format!("LSL:shortinfo\r\n\r\n{return_port} 42\r\n");
        client.send_to(request.as_bytes(), server_addr).unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = String::from_utf8_lossy(&buf[..len]);
        assert!(reply.starts_with("42\r\n"));
        assert!(reply.contains("<name>T</name>"));

        server.end_serving();
    }

    #[test]
    fn timedata_echoes_wave_id_and_fills_in_t1_t2() {
        let server = Arc::new(UdpServer::bind_unicast("127.0.0.1:0".parse().unwrap(), info()).unwrap());
        let server_addr = server.local_addr().unwrap();
        server.begin_serving();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let t0 = local_clock();
        let request = format!("LSL:timedata\r\nabc123 {t0}\r\n");
        client.send_to(request.as_bytes(), server_addr).unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let reply = String::from_utf8_lossy(&buf[..len]);
        let mut parts = reply.trim().split_whitespace();
        assert_eq!(parts.next(), Some("abc123"));
        let got_t0: f64 = parts.next().unwrap().parse().unwrap();
        assert_eq!(got_t0, t0);
        let t1: f64 = parts.next().unwrap().parse().unwrap();
        let t2: f64 = parts.next().unwrap().parse().unwrap();
        assert!(t2 >= t1);

        server.end_serving();
    }

    #[test]
    fn multicast_flag_disables_timedata_handling() {
        let mut server = UdpServer::bind_unicast("127.0.0.1:0".parse().unwrap(), info()).unwrap();
        assert!(!server.is_multicast);
        server.is_multicast = true;
        let server = Arc::new(server);
        let server_addr = server.local_addr().unwrap();
        server.begin_serving();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let request = format!("LSL:timedata\r\nabc123 {}\r\n", local_clock());
        client.send_to(request.as_bytes(), server_addr).unwrap();

        let mut buf = [0u8; 256];
        assert!(client.recv_from(&mut buf).is_err(), "multicast instance must not answer timedata");

        server.end_serving();
    }
}
