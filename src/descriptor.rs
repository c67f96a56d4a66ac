//! Stream descriptor: typed identity, XML metadata tree, query matcher (C4, spec §4.4).

use crate::format::ChannelFormat;
use crate::xml::Element;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Typed, user-supplied identity of a stream. Immutable once a `StreamInfo` is built from
/// it, except for the network-identity fields the outlet orchestrator fills in at bind time.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub name: String,
    pub stream_type: String,
    pub channel_count: u32,
    pub nominal_srate: f64,
    pub channel_format: ChannelFormat,
    pub source_id: String,
}

/// Network identity assigned by the outlet orchestrator at bind time (spec §3).
#[derive(Debug, Clone, Default)]
pub struct NetworkIdentity {
    pub created_at: f64,
    pub uid: String,
    pub session_id: String,
    pub hostname: String,
    pub v4address: Option<String>,
    pub v4data_port: u16,
    pub v4service_port: u16,
    pub v6address: Option<String>,
    pub v6data_port: u16,
    pub v6service_port: u16,
}

/// XPath-predicate match cache entry: truthiness plus an age counter for half-eviction.
struct CacheEntry {
    matched: bool,
    age: u64,
}

/// Full stream descriptor: identity + network identity + `<info>` metadata tree, plus a
/// query-match cache (spec §4.4, §9 "XPath cache").
pub struct StreamInfo {
    pub descriptor: StreamDescriptor,
    pub network: NetworkIdentity,
    info: Element,
    cache: Mutex<QueryCache>,
}

struct QueryCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl QueryCache {
    fn new(capacity: usize) -> Self {
        QueryCache { entries: HashMap::new(), capacity, tick: 0 }
    }

    fn get_or_insert(&mut self, query: &str, compute: impl FnOnce() -> bool) -> bool {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(query) {
            entry.age = self.tick;
            return entry.matched;
        }
        if self.entries.len() >= self.capacity.max(1) {
            self.evict_half();
        }
        let matched = compute();
        self.entries.insert(query.to_string(), CacheEntry { matched, age: self.tick });
        matched
    }

    /// Trim half the cache by median age, per spec §9: "eviction trims half at a time, not
    /// one-at-a-time, to bound amortized cost." Ties at the median are broken by key order,
    /// which the spec leaves implementation-defined.
    fn evict_half(&mut self) {
        let mut ages: Vec<u64> = self.entries.values().map(|e| e.age).collect();
        ages.sort_unstable();
        let median = ages[ages.len() / 2];
        let target = self.entries.len() / 2;
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if removed >= target {
                return true;
            }
            if entry.age <= median {
                removed += 1;
                false
            } else {
                true
            }
        });
    }
}

impl StreamInfo {
    pub fn new(descriptor: StreamDescriptor, metadata_cache_capacity: usize) -> Self {
        let mut info = Element::new("info");
        info.append_child_value("name", &descriptor.name);
        info.append_child_value("type", &descriptor.stream_type);
        info.append_child_value("channel_count", descriptor.channel_count.to_string());
        info.append_child_value("channel_format", descriptor.channel_format.xml_token());
        info.append_child_value("source_id", &descriptor.source_id);
        info.append_child_value("nominal_srate", format!("{}", descriptor.nominal_srate));
        info.append_child_value("version", "110");
        info.append_child_value("created_at", "0");
        info.append_child_value("uid", crate::uid::fresh_uid());
        info.append_child_value("session_id", "");
        info.append_child_value("hostname", "");
        info.append_child_value("v4address", "");
        info.append_child_value("v4data_port", "0");
        info.append_child_value("v4service_port", "0");
        info.append_child_value("v6address", "");
        info.append_child_value("v6data_port", "0");
        info.append_child_value("v6service_port", "0");
        info.append_child("desc");

        let network = NetworkIdentity {
            uid: info.child_value("uid").to_string(),
            ..Default::default()
        };

        StreamInfo {
            descriptor,
            network,
            info,
            cache: Mutex::new(QueryCache::new(metadata_cache_capacity)),
        }
    }

    /// Mutable access to the `<desc>` subtree for attaching custom metadata.
    pub fn desc_mut(&mut self) -> &mut Element {
        self.info.child_or_append("desc")
    }

    pub fn desc(&self) -> &Element {
        self.info.child("desc").expect("desc always present")
    }

    pub fn uid(&self) -> &str {
        self.info.child_value("uid")
    }

    /// Stamp the network-identity fields into the descriptor and the XML tree. Must be
    /// called only before the outlet begins serving (spec §5: "written only before
    /// `begin_serving`").
    pub fn stamp_network_identity(&mut self, identity: NetworkIdentity) {
        self.info.child_mut("created_at").unwrap().set_value(format!("{}", identity.created_at));
        self.info.child_mut("session_id").unwrap().set_value(identity.session_id.clone());
        self.info.child_mut("hostname").unwrap().set_value(identity.hostname.clone());
        self.info
            .child_mut("v4address")
            .unwrap()
            .set_value(identity.v4address.clone().unwrap_or_default());
        self.info
            .child_mut("v4data_port")
            .unwrap()
            .set_value(identity.v4data_port.to_string());
        self.info
            .child_mut("v4service_port")
            .unwrap()
            .set_value(identity.v4service_port.to_string());
        self.info
            .child_mut("v6address")
            .unwrap()
            .set_value(identity.v6address.clone().unwrap_or_default());
        self.info
            .child_mut("v6data_port")
            .unwrap()
            .set_value(identity.v6data_port.to_string());
        self.info
            .child_mut("v6service_port")
            .unwrap()
            .set_value(identity.v6service_port.to_string());
        self.network = identity;
    }

    /// Generate a fresh random UUID and patch the XML tree (spec §4.4 "Reset operation").
    pub fn reset_uid(&mut self) {
        let fresh = crate::uid::fresh_uid();
        self.info.child_mut("uid").unwrap().set_value(fresh.clone());
        self.network.uid = fresh;
    }

    /// Identity-only serialization (spec §3, §6): `<info>` with every field except `<desc>`.
    pub fn to_shortinfo(&self) -> String {
        let mut shallow = Element::new("info");
        for child in self.info.children() {
            if child.name() != "desc" {
                let mut copy = Element::new(child.name());
                copy.set_value(child.value());
                shallow.push_child(copy);
            }
        }
        shallow.to_xml()
    }

    /// Full serialization: identity plus the `<desc>` subtree.
    pub fn to_fullinfo(&self) -> String {
        self.info.to_xml()
    }

    /// Parse a fullinfo (or shortinfo) document into descriptor + network identity + tree.
    pub fn from_xml(xml: &str, metadata_cache_capacity: usize) -> crate::error::Result<Self> {
        let info = Element::parse(xml)?;
        let channel_format = ChannelFormat::from_xml_token(info.child_value("channel_format"))
            .ok_or_else(|| crate::error::LslError::argument("unknown channel_format token"))?;
        let descriptor = StreamDescriptor {
            name: info.child_value("name").to_string(),
            stream_type: info.child_value("type").to_string(),
            channel_count: info.child_value("channel_count").parse().unwrap_or(0),
            nominal_srate: info.child_value("nominal_srate").parse().unwrap_or(0.0),
            channel_format,
            source_id: info.child_value("source_id").to_string(),
        };
        let network = NetworkIdentity {
            created_at: info.child_value("created_at").parse().unwrap_or(0.0),
            uid: info.child_value("uid").to_string(),
            session_id: info.child_value("session_id").to_string(),
            hostname: info.child_value("hostname").to_string(),
            v4address: non_empty(info.child_value("v4address")),
            v4data_port: info.child_value("v4data_port").parse().unwrap_or(0),
            v4service_port: info.child_value("v4service_port").parse().unwrap_or(0),
            v6address: non_empty(info.child_value("v6address")),
            v6data_port: info.child_value("v6data_port").parse().unwrap_or(0),
            v6service_port: info.child_value("v6service_port").parse().unwrap_or(0),
        };
        Ok(StreamInfo { descriptor, network, info, cache: Mutex::new(QueryCache::new(metadata_cache_capacity)) })
    }

    /// Whether the `<info>` tree, restricted to the predicate `query`, matches. `query` is
    /// the part of an XPath 1.0 expression that would go inside `[...]` on `<info>`
    /// (spec §4.4). The empty string always matches (spec §8).
    pub fn matches_query(&self, query: &str) -> bool {
        if query.trim().is_empty() {
            return true;
        }
        let mut cache = self.cache.lock();
        cache.get_or_insert(query, || crate::query::eval_predicate(query, &self.info))
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Converts a user-supplied `(requested_len, flags)` pair into a sample count
/// (spec §4.4 "Transport-buffer sizing"). `as_seconds` and `as_thousandths` are mutually
/// exclusive flag bits; if neither is set, `requested_len` is already a sample count.
pub fn buffer_len_to_samples(
    requested_len: f64,
    as_seconds: bool,
    as_thousandths: bool,
    nominal_srate: f64,
) -> u32 {
    let effective_rate = if nominal_srate > 0.0 { nominal_srate } else { 100.0 };
    let samples = if as_seconds {
        requested_len * effective_rate
    } else if as_thousandths {
        (requested_len / 1000.0) * effective_rate
    } else {
        requested_len
    };
    samples.floor().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            name: "BioSemi".to_string(),
            stream_type: "EEG".to_string(),
            channel_count: 32,
            nominal_srate: 512.0,
            channel_format: ChannelFormat::Float32,
            source_id: "S1".to_string(),
        }
    }

    #[test]
    fn shortinfo_omits_desc_fullinfo_includes_it() {
        let mut info = StreamInfo::new(descriptor(), 10);
        info.desc_mut().append_child_value("manufacturer", "BioSemi B.V.");
        assert!(!info.to_shortinfo().contains("manufacturer"));
        assert!(info.to_fullinfo().contains("manufacturer"));
    }

    #[test]
    fn roundtrips_through_fullinfo_xml() {
        let info = StreamInfo::new(descriptor(), 10);
        let xml = info.to_fullinfo();
        let parsed = StreamInfo::from_xml(&xml, 10).unwrap();
        assert_eq!(parsed.descriptor.name, "BioSemi");
        assert_eq!(parsed.descriptor.channel_count, 32);
        assert_eq!(parsed.descriptor.channel_format, ChannelFormat::Float32);
    }

    #[test]
    fn empty_query_always_matches() {
        let info = StreamInfo::new(descriptor(), 10);
        assert!(info.matches_query(""));
        assert!(info.matches_query("   "));
    }

    #[test]
    fn matches_cache_agrees_with_direct_eval() {
        let info = StreamInfo::new(descriptor(), 10);
        let direct = crate::query::eval_predicate("type='EEG'", &info.info);
        assert_eq!(info.matches_query("type='EEG'"), direct);
        // second call exercises the cache hit path
        assert_eq!(info.matches_query("type='EEG'"), direct);
    }

    #[test]
    fn reset_uid_changes_both_descriptor_and_tree() {
        let mut info = StreamInfo::new(descriptor(), 10);
        let before = info.uid().to_string();
        info.reset_uid();
        assert_ne!(before, info.uid());
        assert_eq!(info.network.uid, info.uid());
    }

    #[test]
    fn buffer_len_heuristics() {
        assert_eq!(buffer_len_to_samples(5.0, false, false, 512.0), 5);
        assert_eq!(buffer_len_to_samples(1.0, true, false, 512.0), 512);
        assert_eq!(buffer_len_to_samples(1.0, true, false, 0.0), 100);
        assert_eq!(buffer_len_to_samples(1000.0, false, true, 512.0), 512);
        assert_eq!(buffer_len_to_samples(0.0, false, false, 512.0), 1);
    }

    #[test]
    fn cache_half_eviction_keeps_capacity_bounded() {
        let info = StreamInfo::new(descriptor(), 4);
        for i in 0..20 {
            info.matches_query(&format!("channel_count={i}"));
        }
        assert!(info.cache.lock().entries.len() <= 4);
    }
}
