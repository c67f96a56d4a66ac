//! Process-wide configuration (C13). Loaded once at first use from a search path,
//! exactly as `examples/original_source/src/api_config.cpp` does: `$LSLAPICFG`, then
//! `./lsl_api.cfg`, `~/lsl_api/lsl_api.cfg`, `/etc/lsl_api/lsl_api.cfg`, else defaults.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolveScope {
    Machine = 0,
    Link = 1,
    Site = 2,
    Organization = 3,
    Global = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Mode {
    Disabled,
    Allowed,
    Forced,
}

#[derive(Debug, Clone)]
pub struct Config {
    // [ports]
    pub base_port: u16,
    pub port_range: u16,
    pub multicast_port: u16,
    pub allow_random_ports: bool,
    pub ipv6: Ipv6Mode,
    pub multicast_group_addresses: [Vec<String>; 5],

    // [multicast]
    pub resolve_scope: ResolveScope,
    pub listen_address: String,

    // [lab]
    pub known_peers: Vec<String>,
    pub session_id: String,

    // [log]
    pub log_level: i8,
    pub log_file: Option<String>,

    // [tuning]
    pub use_protocol_version: u32,
    pub continuous_resolve_interval: f64,
    pub inlet_buffer_reserve_ms: u32,
    pub inlet_buffer_reserve_samples: u32,
    pub outlet_buffer_reserve_ms: u32,
    pub outlet_buffer_reserve_samples: u32,
    pub max_cached_queries: usize,
    pub smoothing_halftime: f32,
    pub time_probe_count: u32,
    pub time_probe_interval: f64,
    pub time_probe_max_rtt: f64,
    pub time_update_interval: f64,
    pub time_update_min_probes: u32,
    pub watchdog_check_interval: f64,
    pub watchdog_time_threshold: f64,
    pub multicast_min_rtt: f64,
    pub multicast_max_rtt: f64,
    pub unicast_min_rtt: f64,
    pub unicast_max_rtt: f64,
    pub force_default_timestamps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_port: 16572,
            port_range: 32,
            multicast_port: 16571,
            allow_random_ports: true,
            ipv6: Ipv6Mode::Allowed,
            multicast_group_addresses: Default::default(),

            resolve_scope: ResolveScope::Site,
            listen_address: String::new(),

            known_peers: Vec::new(),
            session_id: "default".to_string(),

            log_level: 0,
            log_file: None,

            use_protocol_version: 110,
            continuous_resolve_interval: 5.0,
            inlet_buffer_reserve_ms: 5000,
            inlet_buffer_reserve_samples: 0,
            outlet_buffer_reserve_ms: 5000,
            outlet_buffer_reserve_samples: 0,
            max_cached_queries: 100,
            smoothing_halftime: 90.0,
            time_probe_count: 8,
            time_probe_interval: 0.2,
            time_probe_max_rtt: 1.0,
            time_update_interval: 2.0,
            time_update_min_probes: 4,
            watchdog_check_interval: 15.0,
            watchdog_time_threshold: 15.0,
            multicast_min_rtt: 0.5,
            multicast_max_rtt: 3.0,
            unicast_min_rtt: 0.75,
            unicast_max_rtt: 5.0,
            force_default_timestamps: false,
        }
    }
}

/// Groups to send discovery traffic to: the union of every scope from `Machine` up to and
/// including the configured `resolve_scope`, per `api_config::update_multicast_groups`
/// (a `Site`-scoped resolver also queries `Machine`- and `Link`-scoped groups).
pub fn active_multicast_groups(cfg: &Config) -> Vec<&str> {
    let mut out = Vec::new();
    for scope in 0..=cfg.resolve_scope as usize {
        out.extend(cfg.multicast_group_addresses[scope].iter().map(String::as_str));
    }
    out
}

/// Multicast TTL per resolve scope, per `api_config::update_multicast_groups`.
pub fn multicast_ttl_for_scope(scope: ResolveScope) -> u32 {
    const TTLS: [u32; 5] = [0, 1, 24, 32, 255];
    TTLS[scope as usize]
}

/// IPv6 multicast scope letter used to build the `FF0?<group>` address, or `None`
/// for the machine scope (which has no corresponding IPv6 multicast address).
pub fn ipv6_multicast_scope_letter(scope: ResolveScope) -> Option<char> {
    const LETTERS: [char; 5] = ['\0', '2', '5', '8', 'E'];
    let c = LETTERS[scope as usize];
    if c == '\0' {
        None
    } else {
        Some(c)
    }
}

fn expand_tilde(filename: &str) -> String {
    if let Some(rest) = filename.strip_prefix('~') {
        if let Ok(home) = env::var("HOME").or_else(|_| env::var("USERPROFILE")) {
            return format!("{home}{rest}");
        }
        log::warn!("cannot determine home directory; config files there won't be discovered");
    }
    filename.to_string()
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(envcfg) = env::var("LSLAPICFG") {
        out.push(PathBuf::from(envcfg));
    }
    out.push(PathBuf::from("lsl_api.cfg"));
    out.push(PathBuf::from(expand_tilde("~/lsl_api/lsl_api.cfg")));
    out.push(PathBuf::from("/etc/lsl_api/lsl_api.cfg"));
    out
}

fn parse_set(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.len() > 2 && value.starts_with('{') && value.ends_with('}') {
        value[1..value.len() - 1]
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        Vec::new()
    }
}

impl Config {
    fn apply_line(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("ports", "BasePort") => self.base_port = value.parse().unwrap_or(self.base_port),
            ("ports", "PortRange") => self.port_range = value.parse().unwrap_or(self.port_range),
            ("ports", "MulticastPort") => {
                self.multicast_port = value.parse().unwrap_or(self.multicast_port)
            }
            ("ports", "AllowRandomPorts") => {
                self.allow_random_ports = value.parse().unwrap_or(self.allow_random_ports)
            }
            ("ports", "IPv6") => {
                self.ipv6 = match value {
                    "disabled" | "disable" => Ipv6Mode::Disabled,
                    "allowed" | "allow" => Ipv6Mode::Allowed,
                    "forced" | "force" => Ipv6Mode::Forced,
                    _ => {
                        log::error!("unsupported IPv6 setting: {value}");
                        self.ipv6
                    }
                }
            }
            ("ports", "MachineAddresses") => {
                self.multicast_group_addresses[ResolveScope::Machine as usize] = parse_set(value)
            }
            ("ports", "LinkAddresses") => {
                self.multicast_group_addresses[ResolveScope::Link as usize] = parse_set(value)
            }
            ("ports", "SiteAddresses") => {
                self.multicast_group_addresses[ResolveScope::Site as usize] = parse_set(value)
            }
            ("ports", "OrganizationAddresses") => {
                self.multicast_group_addresses[ResolveScope::Organization as usize] =
                    parse_set(value)
            }
            ("ports", "GlobalAddresses") => {
                self.multicast_group_addresses[ResolveScope::Global as usize] = parse_set(value)
            }
            ("multicast", "ResolveScope") => {
                self.resolve_scope = match value {
                    "machine" => ResolveScope::Machine,
                    "link" => ResolveScope::Link,
                    "site" => ResolveScope::Site,
                    "organization" => ResolveScope::Organization,
                    "global" => ResolveScope::Global,
                    _ => {
                        log::error!("unsupported ResolveScope: {value}");
                        self.resolve_scope
                    }
                }
            }
            ("multicast", "ListenAddress") => self.listen_address = value.to_string(),
            ("lab", "KnownPeers") => self.known_peers = parse_set(value),
            ("lab", "SessionID") => self.session_id = value.to_string(),
            ("log", "level") => self.log_level = value.parse().unwrap_or(self.log_level),
            ("log", "file") => self.log_file = Some(value.to_string()),
            ("tuning", "UseProtocolVersion") => {
                self.use_protocol_version = value.parse().unwrap_or(self.use_protocol_version)
            }
            ("tuning", "ContinuousResolveInterval") => {
                self.continuous_resolve_interval =
                    value.parse().unwrap_or(self.continuous_resolve_interval)
            }
            ("tuning", "InletBufferReserveMs") => {
                self.inlet_buffer_reserve_ms = value.parse().unwrap_or(self.inlet_buffer_reserve_ms)
            }
            ("tuning", "InletBufferReserveSamples") => {
                self.inlet_buffer_reserve_samples =
                    value.parse().unwrap_or(self.inlet_buffer_reserve_samples)
            }
            ("tuning", "OutletBufferReserveMs") => {
                self.outlet_buffer_reserve_ms =
                    value.parse().unwrap_or(self.outlet_buffer_reserve_ms)
            }
            ("tuning", "OutletBufferReserveSamples") => {
                self.outlet_buffer_reserve_samples =
                    value.parse().unwrap_or(self.outlet_buffer_reserve_samples)
            }
            ("tuning", "MaxCachedQueries") => {
                self.max_cached_queries = value.parse().unwrap_or(self.max_cached_queries)
            }
            ("tuning", "SmoothingHalftime") => {
                self.smoothing_halftime = value.parse().unwrap_or(self.smoothing_halftime)
            }
            ("tuning", "TimeProbeCount") => {
                self.time_probe_count = value.parse().unwrap_or(self.time_probe_count)
            }
            ("tuning", "TimeProbeInterval") => {
                self.time_probe_interval = value.parse().unwrap_or(self.time_probe_interval)
            }
            ("tuning", "TimeProbeMaxRTT") => {
                self.time_probe_max_rtt = value.parse().unwrap_or(self.time_probe_max_rtt)
            }
            ("tuning", "TimeUpdateInterval") => {
                self.time_update_interval = value.parse().unwrap_or(self.time_update_interval)
            }
            ("tuning", "TimeUpdateMinProbes") => {
                self.time_update_min_probes = value.parse().unwrap_or(self.time_update_min_probes)
            }
            ("tuning", "WatchdogCheckInterval") => {
                self.watchdog_check_interval =
                    value.parse().unwrap_or(self.watchdog_check_interval)
            }
            ("tuning", "WatchdogTimeThreshold") => {
                self.watchdog_time_threshold =
                    value.parse().unwrap_or(self.watchdog_time_threshold)
            }
            ("tuning", "MulticastMinRTT") => {
                self.multicast_min_rtt = value.parse().unwrap_or(self.multicast_min_rtt)
            }
            ("tuning", "MulticastMaxRTT") => {
                self.multicast_max_rtt = value.parse().unwrap_or(self.multicast_max_rtt)
            }
            ("tuning", "UnicastMinRTT") => {
                self.unicast_min_rtt = value.parse().unwrap_or(self.unicast_min_rtt)
            }
            ("tuning", "UnicastMaxRTT") => {
                self.unicast_max_rtt = value.parse().unwrap_or(self.unicast_max_rtt)
            }
            ("tuning", "ForceDefaultTimestamps") => {
                self.force_default_timestamps =
                    value.parse().unwrap_or(self.force_default_timestamps)
            }
            _ => log::error!("unknown configuration option {section}.{key} = {value}"),
        }
    }

    fn load_text(text: &str) -> Config {
        let mut cfg = Config::default();
        let mut section = String::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_lowercase();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                cfg.apply_line(&section, key.trim(), value.trim());
            }
        }
        cfg
    }

    fn load_from_search_path() -> Config {
        for path in candidate_paths() {
            if let Ok(text) = fs::read_to_string(&path) {
                log::info!("configuration loaded from {}", path.display());
                return Config::load_text(&text);
            }
        }
        log::info!("loaded default config");
        Config::default()
    }
}

static INSTANCE: OnceLock<Config> = OnceLock::new();

/// Process-wide config singleton, loaded once from the search path on first use.
pub fn get() -> &'static Config {
    INSTANCE.get_or_init(Config::load_from_search_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_keys() {
        let cfg = Config::load_text(
            "[ports]\nBasePort = 17000\nPortRange=64\n\n[lab]\nSessionID = expt1\n",
        );
        assert_eq!(cfg.base_port, 17000);
        assert_eq!(cfg.port_range, 64);
        assert_eq!(cfg.session_id, "expt1");
    }

    #[test]
    fn ttl_table_matches_scopes() {
        assert_eq!(multicast_ttl_for_scope(ResolveScope::Machine), 0);
        assert_eq!(multicast_ttl_for_scope(ResolveScope::Global), 255);
        assert_eq!(ipv6_multicast_scope_letter(ResolveScope::Machine), None);
        assert_eq!(ipv6_multicast_scope_letter(ResolveScope::Global), Some('E'));
    }

    #[test]
    fn parse_set_handles_braces() {
        assert_eq!(parse_set("{a, b,c}"), vec!["a", "b", "c"]);
        assert_eq!(parse_set("notaset"), Vec::<String>::new());
    }
}
