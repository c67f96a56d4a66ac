//! End-to-end scenarios driven entirely through the public API over real loopback
//! sockets: no mocked transport, no stubbed resolver.
//!
//! All tests in this binary share one process-wide `Config` (it's a `OnceLock`), so the
//! very first thing any test does is call `ensure_config()`, which installs a config file
//! tuned for fast, single-host discovery before the first real `config::get()` call races
//! ahead of it.

use lsl_core::postprocess::{TimePostprocessor, PROC_MONOTONIZE, PROC_NONE};
use lsl_core::sample::{ConsumerQueue, Pool};
use lsl_core::{resolve_by_predicate, stream_inlet, stream_outlet, ChannelFormat, StreamDescriptor, StreamInfo};
use std::sync::Once;
use std::time::Duration;

const TEST_CONFIG: &str = "
[lab]
KnownPeers = {127.0.0.1}
SessionID = loopback-tests

[tuning]
WatchdogCheckInterval = 0.15
WatchdogTimeThreshold = 0.3
TimeProbeCount = 2
TimeProbeInterval = 0.05
TimeProbeMaxRTT = 0.3
TimeUpdateInterval = 0.3
";

static INIT: Once = Once::new();

fn ensure_config() {
    INIT.call_once(|| {
        let path = std::env::temp_dir().join(format!("lsl_api_loopback_test_{}.cfg", std::process::id()));
        std::fs::write(&path, TEST_CONFIG).expect("write test config file");
        std::env::set_var("LSLAPICFG", &path);
        let _ = lsl_core::config::get();
    });
}

fn published_copy(outlet: &lsl_core::StreamOutlet) -> StreamInfo {
    let guard = outlet.info();
    let info = guard.read();
    StreamInfo::from_xml(&info.to_fullinfo(), 10).unwrap()
}

#[test]
fn bounce_single_sample_round_trips_with_a_sane_timestamp() {
    ensure_config();
    let descriptor = StreamDescriptor {
        name: "Bounce".into(),
        stream_type: "Markers".into(),
        channel_count: 1,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::Int8,
        source_id: String::new(),
    };
    let outlet = stream_outlet(descriptor, 1, 360).unwrap();
    let inlet = stream_inlet(published_copy(&outlet), 360, 0, false);
    inlet.open_stream(Duration::from_secs(2)).unwrap();
    assert!(outlet.wait_for_consumers(Duration::from_secs(2)));

    let push_time = lsl_core::local_clock();
    outlet.push_sample_numeric_raw(&[0x01], push_time, false).unwrap();

    let (sample, ts) = inlet.pull_sample(Duration::from_millis(500)).expect("sample not delivered");
    assert_eq!(sample.payload().as_numeric().unwrap(), &[0x01]);
    assert!(ts >= push_time - 0.01 && ts <= lsl_core::local_clock() + 0.01);
}

#[test]
fn multichannel_int16_preserves_every_channel_value() {
    ensure_config();
    let descriptor = StreamDescriptor {
        name: "MultiChannel16".into(),
        stream_type: "Markers".into(),
        channel_count: 16,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::Int16,
        source_id: String::new(),
    };
    let outlet = stream_outlet(descriptor, 1, 360).unwrap();
    let inlet = stream_inlet(published_copy(&outlet), 360, 0, false);
    inlet.open_stream(Duration::from_secs(2)).unwrap();
    assert!(outlet.wait_for_consumers(Duration::from_secs(2)));

    let values: Vec<i16> = (1i16..=8).flat_map(|v| [v, -v]).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    outlet.push_sample_numeric_raw(&bytes, 0.0, false).unwrap();

    let (sample, _) = inlet.pull_sample(Duration::from_secs(2)).expect("sample not delivered");
    let got: Vec<i16> = sample
        .payload()
        .as_numeric()
        .unwrap()
        .chunks_exact(2)
        .map(|c| i16::from_ne_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(got, values);
}

#[test]
fn large_string_channel_round_trips_byte_exact() {
    ensure_config();
    let descriptor = StreamDescriptor {
        name: "BigString".into(),
        stream_type: "Markers".into(),
        channel_count: 2,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::String,
        source_id: String::new(),
    };
    let outlet = stream_outlet(descriptor, 1, 16).unwrap();
    let inlet = stream_inlet(published_copy(&outlet), 16, 0, false);
    inlet.open_stream(Duration::from_secs(2)).unwrap();
    assert!(outlet.wait_for_consumers(Duration::from_secs(2)));

    let values = vec![Vec::new(), vec![b'x'; 1_048_576]];
    outlet.push_sample_strings(&values, 0.0, false).unwrap();

    let (sample, _) = inlet.pull_sample(Duration::from_secs(10)).expect("sample not delivered");
    assert_eq!(sample.payload().as_strings().unwrap(), values.as_slice());
}

#[test]
fn resolution_by_predicate_finds_the_matching_descriptor_only() {
    ensure_config();
    let descriptor = StreamDescriptor {
        name: "BioSemi".into(),
        stream_type: "EEG".into(),
        channel_count: 32,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::Float32,
        source_id: "S1".into(),
    };
    let outlet = stream_outlet(descriptor, 1, 360).unwrap();
    let expected_uid = outlet.info().read().uid().to_string();

    let results = resolve_by_predicate(
        "type='EEG' and count(info/desc/channel)=0",
        1,
        Duration::from_secs(2),
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].uid(), expected_uid.as_str());
}

#[test]
fn recovery_reconnects_to_replacement_outlet_with_same_identity() {
    ensure_config();
    let descriptor = || StreamDescriptor {
        name: "RecoverMe".into(),
        stream_type: "Markers".into(),
        channel_count: 1,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::Int8,
        source_id: "S1".into(),
    };

    let outlet1 = stream_outlet(descriptor(), 1, 360).unwrap();
    let inlet = stream_inlet(published_copy(&outlet1), 360, 0, true);
    inlet.open_stream(Duration::from_secs(2)).unwrap();
    assert!(outlet1.wait_for_consumers(Duration::from_secs(2)));

    outlet1.push_sample_numeric_raw(&[1u8], 1.0, false).unwrap();
    let (_, ts1) = inlet.pull_sample(Duration::from_secs(2)).expect("first sample not delivered");
    assert_eq!(ts1, 1.0);

    drop(outlet1); // abrupt teardown: the inlet's TCP session is closed out from under it

    let outlet2 = stream_outlet(descriptor(), 1, 360).unwrap();
    assert!(
        outlet2.wait_for_consumers(Duration::from_secs(5)),
        "recovered inlet never reconnected to the replacement outlet"
    );

    outlet2.push_sample_numeric_raw(&[2u8], 2.0, false).unwrap();
    let (sample, ts2) = inlet.pull_sample(Duration::from_secs(3)).expect("post-recovery sample not delivered");
    assert_eq!(sample.payload().as_numeric().unwrap(), &[2u8]);
    assert_eq!(ts2, 2.0);
}

#[test]
fn time_correction_is_near_zero_for_a_colocated_inlet_and_outlet() {
    ensure_config();
    let descriptor = StreamDescriptor {
        name: "TimeSync".into(),
        stream_type: "Markers".into(),
        channel_count: 1,
        nominal_srate: 0.0,
        channel_format: ChannelFormat::Int8,
        source_id: String::new(),
    };
    let outlet = stream_outlet(descriptor, 1, 360).unwrap();
    let inlet = stream_inlet(published_copy(&outlet), 360, 0, false);
    inlet.open_stream(Duration::from_secs(2)).unwrap();

    let offset = inlet.time_correction(Duration::from_secs(3)).expect("no time correction reading");
    assert!(offset.abs() < 0.01, "offset {offset} exceeds the 10ms bound");
}

#[test]
fn queue_eviction_drops_the_first_pushed_sample_past_capacity() {
    let pool = Pool::new(ChannelFormat::Int8, 1, 0);
    let q = ConsumerQueue::new(10);
    for i in 0..11 {
        q.push(pool.allocate(i as f64, false));
    }
    let mut seen = Vec::new();
    while let Some(s) = q.pop(Duration::ZERO) {
        seen.push(s.timestamp);
    }
    assert_eq!(seen.len(), 10);
    assert!(!seen.contains(&0.0), "first-pushed sample must have been evicted");
}

#[test]
fn postprocessing_is_identity_under_none_and_non_decreasing_under_monotonize() {
    let pp = TimePostprocessor::new(Box::new(|| 0.0), Box::new(|| 0.0), Box::new(|| false), 90.0);
    pp.set_options(PROC_NONE);
    for t in [0.0, -5.0, 3.25, 1_000_000.0] {
        assert_eq!(pp.process_timestamp(t), t);
    }

    pp.set_options(PROC_MONOTONIZE);
    let mut last = f64::NEG_INFINITY;
    for t in [5.0, 1.0, 1.0, 10.0, 2.0, 20.0] {
        let out = pp.process_timestamp(t);
        assert!(out >= last);
        last = out;
    }
}
