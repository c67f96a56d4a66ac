//! Peer-to-peer lab streaming middleware: discovery, sample transport, and time
//! synchronization between one producer (`outlet`) and any number of consumers (`inlet`)
//! on a local network, modeled after the original Lab Streaming Layer (liblsl).

pub mod clock;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod inlet;
pub mod net;
pub mod outlet;
pub mod postprocess;
pub mod query;
pub mod resolver;
pub mod sample;
pub mod uid;
pub mod xml;

pub use clock::local_clock;
pub use descriptor::{StreamDescriptor, StreamInfo};
pub use error::{ErrorKind, LslError, Result};
pub use format::ChannelFormat;
pub use inlet::StreamInlet;
pub use outlet::{OutletFlags, StreamOutlet};
pub use postprocess::{PROC_ALL, PROC_CLOCKSYNC, PROC_DEJITTER, PROC_MONOTONIZE, PROC_NONE, PROC_THREADSAFE};
pub use resolver::{resolve_by_predicate, resolve_by_property, resolve_streams, ContinuousResolver};
pub use sample::DEDUCED_TIMESTAMP;

use std::time::Duration;

/// `stream_outlet(descriptor, chunk_size, max_buffered)` (spec §6): publish a stream.
pub fn stream_outlet(
    descriptor: StreamDescriptor,
    chunk_size: u32,
    max_buffered: usize,
) -> Result<StreamOutlet> {
    StreamOutlet::new(descriptor, chunk_size, max_buffered, OutletFlags::default())
}

/// `stream_inlet(descriptor, max_buflen, max_chunklen, recover)` (spec §6): subscribe to
/// an already-resolved stream.
pub fn stream_inlet(info: StreamInfo, max_buflen: u32, max_chunklen: u32, recover: bool) -> StreamInlet {
    StreamInlet::new(info, max_buflen, max_chunklen, recover)
}

/// `continuous_resolver(query, forget_after)` (spec §6).
pub fn continuous_resolver(query: &str, forget_after: Duration) -> ContinuousResolver {
    ContinuousResolver::new(query, forget_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlet_inlet_roundtrip_over_loopback() {
        let descriptor = StreamDescriptor {
            name: "LibTest".into(),
            stream_type: "Markers".into(),
            channel_count: 1,
            nominal_srate: 0.0,
            channel_format: ChannelFormat::Int8,
            source_id: "lib-test".into(),
        };
        let outlet = stream_outlet(descriptor, 1, 360).unwrap();
        let published = outlet.info();
        let info_copy = {
            let guard = published.read();
            StreamInfo::from_xml(&guard.to_fullinfo(), 10).unwrap()
        };

        let inlet = stream_inlet(info_copy, 360, 0, true);
        inlet.open_stream(Duration::from_secs(2)).unwrap();
        assert!(outlet.wait_for_consumers(Duration::from_secs(2)));

        outlet.push_sample_numeric_raw(&[42i8 as u8], 5.0, false).unwrap();
        let (sample, ts) = inlet.pull_sample(Duration::from_secs(2)).unwrap();
        assert_eq!(sample.payload().as_numeric().unwrap(), &[42i8 as u8]);
        assert_eq!(ts, 5.0);
    }
}
