//! Outlet orchestrator (C8, spec §4.8): binds the TCP+UDP endpoints for one stream,
//! stamps the descriptor's network identity, and owns the IO worker lifecycle.

use crate::codec::ByteOrder;
use crate::config::{self, Config, Ipv6Mode};
use crate::descriptor::{NetworkIdentity, StreamDescriptor, StreamInfo};
use crate::error::{LslError, Result};
use crate::format::ChannelFormat;
use crate::net::tcp::TcpServer;
use crate::net::udp::UdpServer;
use crate::sample::{Payload, Pool, SampleRef, SendBuffer};
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Bind the data TCP listener on the first free port in `[BasePort, BasePort+PortRange)`,
/// falling back to an OS-assigned port when the range is exhausted and `AllowRandomPorts`
/// permits it (spec §9 "service UDP and data TCP each bind on a port in the configured range").
fn bind_tcp_in_range(
    ip: IpAddr,
    cfg: &Config,
    info: Arc<RwLock<StreamInfo>>,
    send_buffer: Arc<SendBuffer>,
    pool: Pool,
) -> Result<TcpServer> {
    for port in cfg.base_port..cfg.base_port.saturating_add(cfg.port_range) {
        match TcpServer::bind(SocketAddr::new(ip, port), info.clone(), send_buffer.clone(), pool.clone()) {
            Ok(server) => return Ok(server),
            Err(_) => continue,
        }
    }
    if cfg.allow_random_ports {
        TcpServer::bind(SocketAddr::new(ip, 0), info, send_buffer, pool)
    } else {
        Err(LslError::internal("no free TCP port in configured range and random ports disabled"))
    }
}

fn bind_udp_in_range(ip: IpAddr, cfg: &Config, info: Arc<RwLock<StreamInfo>>) -> Result<UdpServer> {
    for port in cfg.base_port..cfg.base_port.saturating_add(cfg.port_range) {
        match UdpServer::bind_unicast(SocketAddr::new(ip, port), info.clone()) {
            Ok(server) => return Ok(server),
            Err(_) => continue,
        }
    }
    if cfg.allow_random_ports {
        UdpServer::bind_unicast(SocketAddr::new(ip, 0), info)
    } else {
        Err(LslError::internal("no free UDP port in configured range and random ports disabled"))
    }
}

/// Flags controlling outlet construction (spec §6 `stream_outlet(descriptor, chunk_size,
/// max_buffered, flags)`); currently unused bits are reserved for binding layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutletFlags {
    pub force_default_timestamps: bool,
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// A published stream. Owns the sample pool, the fan-out dispatcher, and the bound
/// TCP/UDP servers. Constructed via `StreamOutlet::new`.
pub struct StreamOutlet {
    info: Arc<RwLock<StreamInfo>>,
    pool: Pool,
    send_buffer: Arc<SendBuffer>,
    chunk_size: u32,
    tcp_servers: Vec<Arc<TcpServer>>,
    udp_servers: Vec<Arc<UdpServer>>,
    next_sample_index: std::sync::atomic::AtomicU64,
}

impl StreamOutlet {
    pub fn new(
        descriptor: StreamDescriptor,
        chunk_size: u32,
        max_buffered: usize,
        _flags: OutletFlags,
    ) -> Result<Self> {
        let cfg = config::get();
        if descriptor.channel_format == ChannelFormat::Undefined {
            return Err(crate::error::LslError::argument("channel format must not be undefined"));
        }

        let reserve = if cfg.outlet_buffer_reserve_samples > 0 {
            cfg.outlet_buffer_reserve_samples
        } else if descriptor.nominal_srate > 0.0 {
            (cfg.outlet_buffer_reserve_ms as f64 / 1000.0 * descriptor.nominal_srate) as u32
        } else {
            0
        };
        let pool = Pool::new(descriptor.channel_format, descriptor.channel_count, reserve);
        let send_buffer = SendBuffer::new(max_buffered.max(1));

        let info_shared = Arc::new(RwLock::new(StreamInfo::new(descriptor, cfg.max_cached_queries)));
        let hostname = local_hostname();

        let mut tcp_servers = Vec::new();
        let mut udp_servers = Vec::new();

        let mut identity = NetworkIdentity {
            created_at: crate::clock::local_clock(),
            uid: info_shared.read().uid().to_string(),
            session_id: cfg.session_id.clone(),
            hostname: hostname.clone(),
            ..Default::default()
        };

        if cfg.ipv6 != Ipv6Mode::Forced {
            let bind_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
            let tcp = Arc::new(bind_tcp_in_range(
                bind_ip,
                cfg,
                info_shared.clone(),
                send_buffer.clone(),
                pool.clone(),
            )?);
            let udp = Arc::new(bind_udp_in_range(bind_ip, cfg, info_shared.clone())?);
            identity.v4data_port = tcp.local_addr()?.port();
            identity.v4service_port = udp.local_addr()?.port();
            identity.v4address = Some("0.0.0.0".to_string());
            tcp_servers.push(tcp);
            udp_servers.push(udp);

            for group in config::active_multicast_groups(cfg) {
                if let Ok(addr) = group.parse::<Ipv4Addr>() {
                    let ttl = config::multicast_ttl_for_scope(cfg.resolve_scope);
                    match UdpServer::bind_multicast(
                        SocketAddr::new(bind_ip, cfg.multicast_port),
                        addr,
                        ttl,
                        info_shared.clone(),
                    ) {
                        Ok(server) => udp_servers.push(Arc::new(server)),
                        Err(e) => log::warn!("multicast group {group} failed to bind: {e}"),
                    }
                }
            }
        }

        info_shared.write().stamp_network_identity(identity);

        let outlet = StreamOutlet {
            info: info_shared,
            pool,
            send_buffer,
            chunk_size: chunk_size.max(1),
            tcp_servers,
            udp_servers,
            next_sample_index: std::sync::atomic::AtomicU64::new(0),
        };
        outlet.begin_serving();
        Ok(outlet)
    }

    fn begin_serving(&self) {
        for s in &self.tcp_servers {
            s.begin_serving();
        }
        for s in &self.udp_servers {
            s.begin_serving();
        }
    }

    pub fn info(&self) -> Arc<RwLock<StreamInfo>> {
        self.info.clone()
    }

    /// Push a single sample with an explicit timestamp (`DEDUCED_TIMESTAMP` to deduce).
    pub fn push_sample_numeric_raw(&self, bytes: &[u8], timestamp: f64, pushthrough: bool) -> Result<()> {
        let mut sample = self.pool.allocate(timestamp, pushthrough);
        {
            let s = Arc::get_mut(&mut sample).expect("freshly allocated sample is unique");
            match s.payload_mut() {
                Payload::Numeric(buf) => {
                    if buf.len() != bytes.len() {
                        return Err(crate::error::LslError::argument("payload size mismatch"));
                    }
                    buf.copy_from_slice(bytes);
                }
                Payload::Strings(_) => {
                    return Err(crate::error::LslError::argument("use push_sample for string channels"))
                }
            }
        }
        self.push_prepared(sample);
        Ok(())
    }

    pub fn push_sample_strings(&self, values: &[Vec<u8>], timestamp: f64, pushthrough: bool) -> Result<()> {
        let mut sample = self.pool.allocate(timestamp, pushthrough);
        {
            let s = Arc::get_mut(&mut sample).expect("freshly allocated sample is unique");
            match s.payload_mut() {
                Payload::Strings(slots) => {
                    if slots.len() != values.len() {
                        return Err(crate::error::LslError::argument("channel count mismatch"));
                    }
                    for (slot, v) in slots.iter_mut().zip(values) {
                        *slot = v.clone();
                    }
                }
                Payload::Numeric(_) => {
                    return Err(crate::error::LslError::argument("this outlet is not string-typed"))
                }
            }
        }
        self.push_prepared(sample);
        Ok(())
    }

    fn push_prepared(&self, sample: SampleRef) {
        self.next_sample_index.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.send_buffer.push(sample);
    }

    pub fn have_consumers(&self) -> bool {
        self.send_buffer.have_consumers()
    }

    pub fn wait_for_consumers(&self, timeout: std::time::Duration) -> bool {
        self.send_buffer.wait_for_consumers(timeout)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }
}

impl Drop for StreamOutlet {
    fn drop(&mut self) {
        for s in &self.tcp_servers {
            s.end_serving();
        }
        for s in &self.udp_servers {
            s.end_serving();
        }
    }
}

/// Pick the negotiated byte order to minimize conversion cost: prefer whichever side
/// reported better conversion performance; default to native if unknown. Placeholder for
/// binding layers that want to surface this decision (the TCP server applies it inline).
pub fn preferred_byte_order(_remote_perf: Option<f64>, _local_perf: f64) -> ByteOrder {
    ByteOrder::native()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            name: "Bounce".into(),
            stream_type: "Markers".into(),
            channel_count: 1,
            nominal_srate: 0.0,
            channel_format: ChannelFormat::Int8,
            source_id: "S1".into(),
        }
    }

    #[test]
    fn construction_assigns_ports_and_begins_serving() {
        let outlet = StreamOutlet::new(descriptor(), 1, 360, OutletFlags::default()).unwrap();
        let info = outlet.info();
        let guard = info.read();
        assert_ne!(guard.network.v4data_port, 0);
        assert_ne!(guard.network.v4service_port, 0);
    }

    #[test]
    fn push_with_no_consumers_is_a_silent_no_op() {
        let outlet = StreamOutlet::new(descriptor(), 1, 360, OutletFlags::default()).unwrap();
        assert!(outlet.push_sample_numeric_raw(&[1], 0.0, false).is_ok());
        assert!(!outlet.have_consumers());
    }

    #[test]
    fn rejects_payload_size_mismatch() {
        let outlet = StreamOutlet::new(descriptor(), 1, 360, OutletFlags::default()).unwrap();
        assert!(outlet.push_sample_numeric_raw(&[1, 2], 0.0, false).is_err());
    }
}
