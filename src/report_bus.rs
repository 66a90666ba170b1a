//! Report bus adapter (C8).
//!
//! Serializes a stream's drained [`crate::lop::HostRecord`]s to the
//! protobuf wire format of spec §6 and hands the encoded bytes plus a topic
//! string to a send-queue. The bus itself (the message-bus process on the
//! other end) is an external collaborator per spec §1; this module's
//! contract ends at "bytes handed to `send`".
//!
//! Fire-and-forget per spec §5: a send failure is logged, never propagated
//! back into the LOP core, since the host records are freed either way.

use crate::lop::{HostRecord, ReportSink};
use eyre::Result;
use prost::Message;
use std::sync::{Arc, Mutex};

#[allow(clippy::doc_markdown)]
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/osp.report.rs"));
}

/// Hands an already-encoded message to the bus's send-queue. Injected by
/// value, same capability-interface treatment the rest of this crate gives
/// callback-laden adapters.
pub trait ReportBus: Send {
    fn send(&mut self, topic: &str, bytes: Vec<u8>) -> Result<()>;
}

/// A [`ReportBus`] that records every call, for tests.
#[derive(Debug, Default, Clone)]
pub struct Fake {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl Fake {
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ReportBus for Fake {
    fn send(&mut self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push((topic.to_string(), bytes));
        Ok(())
    }
}

/// Real bus transport: one `AF_UNIX` datagram per `send`, topic and
/// payload length-prefixed so a single collector socket can demultiplex
/// frames from every sender. Grounded on the queue-manager's unix-domain
/// send path the original daemons all shell their stats through; this
/// rewrite keeps the one-datagram-per-call shape but drops everything
/// about the wire format beyond what spec §6's report frame needs.
#[derive(Clone)]
pub struct Uds(Arc<std::os::unix::net::UnixDatagram>);

impl Uds {
    /// Connects to the bus collector socket at `path`.
    pub fn connect(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self(Arc::new(socket)))
    }
}

impl ReportBus for Uds {
    fn send(&mut self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        let topic = topic.as_bytes();
        let mut frame = Vec::with_capacity(4 + topic.len() + bytes.len());
        frame.extend_from_slice(&u32::try_from(topic.len()).unwrap_or(u32::MAX).to_be_bytes());
        frame.extend_from_slice(topic);
        frame.extend_from_slice(&bytes);
        self.0.send(&frame)?;
        Ok(())
    }
}

/// Encodes one batch of [`HostRecord`]s as a [`proto::Report`].
#[must_use]
pub fn encode(node_id: &str, hosts: &[HostRecord]) -> proto::Report {
    proto::Report { node_id: node_id.to_string(), hosts: hosts.iter().map(encode_host).collect() }
}

fn encode_host(record: &HostRecord) -> proto::Host {
    let key = record.key.as_ref();
    let timestamp_ms = record.samples.last().and_then(|s| s.timestamp_ms).unwrap_or(0);
    let (dscp_type, dscp_value) = match key.map(|k| k.dscp) {
        Some(crate::lop::DscpKey::None) | None => (None, None),
        Some(crate::lop::DscpKey::Missing) => (Some(proto::DscpType::Missing as i32), None),
        Some(crate::lop::DscpKey::Value(v)) => (Some(proto::DscpType::Present as i32), Some(u32::from(v))),
    };
    proto::Host {
        mac_address: key.map(|k| k.mac.to_vec()).unwrap_or_default(),
        if_name: key.map(|k| k.ifname.clone()).unwrap_or_default(),
        if_role: None,
        dscp_type,
        dscp_value,
        timestamp_ms,
        samples: record.samples.iter().map(encode_sample).collect(),
    }
}

fn encode_sample(sample: &crate::lop::Sample) -> proto::Sample {
    proto::Sample {
        min_ms: sample.min_ms,
        max_ms: sample.max_ms,
        avg_ms: sample.avg_ms(),
        last_ms: sample.last_ms,
        num_pkts: sample.num_pkts,
        timestamp_ms: sample.timestamp_ms,
    }
}

/// A [`ReportSink`] that encodes a drained batch and hands it to a
/// [`ReportBus`] under a fixed topic, one frame per `report()` call (the
/// core already chunks to [`crate::consts::LOP_REPORT_CHUNK_SIZE`] hosts).
pub struct BusSink<B> {
    node_id: String,
    topic: String,
    bus: B,
}

impl<B: ReportBus> BusSink<B> {
    pub fn new(node_id: impl Into<String>, topic: impl Into<String>, bus: B) -> Self {
        Self { node_id: node_id.into(), topic: topic.into(), bus }
    }
}

impl<B: ReportBus> ReportSink for BusSink<B> {
    fn report(&mut self, hosts: &[HostRecord]) {
        let report = encode(&self.node_id, hosts);
        let bytes = report.encode_to_vec();
        if let Err(err) = self.bus.send(&self.topic, bytes) {
            tracing::warn!(%err, "report bus send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lop::{DscpKey, HostKey};

    fn host(min: u32, max: u32, num_pkts: u32) -> HostRecord {
        HostRecord {
            key: Some(HostKey { ifname: "eth0".into(), mac: [1, 2, 3, 4, 5, 6], dscp: DscpKey::Value(10) }),
            samples: vec![crate::lop::Sample {
                min_ms: Some(min),
                max_ms: Some(max),
                num_pkts: Some(num_pkts),
                timestamp_ms: Some(42),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn unset_optional_fields_are_omitted_on_the_wire() {
        let report = encode("node-1", &[host(5, 9, 3)]);
        let encoded = report.encode_to_vec();
        let decoded = proto::Report::decode(encoded.as_slice()).unwrap();
        let sample = &decoded.hosts[0].samples[0];
        assert_eq!(sample.min_ms, Some(5));
        assert_eq!(sample.max_ms, Some(9));
        assert_eq!(sample.avg_ms, None);
        assert_eq!(sample.last_ms, None);
    }

    #[test]
    fn dscp_present_round_trips() {
        let report = encode("node-1", &[host(1, 1, 1)]);
        let decoded_host = &report.hosts[0];
        assert_eq!(decoded_host.dscp_type, Some(proto::DscpType::Present as i32));
        assert_eq!(decoded_host.dscp_value, Some(10));
    }

    #[test]
    fn bus_sink_forwards_encoded_bytes_to_the_bus() {
        let fake = Fake::default();
        let mut sink = BusSink::new("node-1", "LM.report", fake.clone());
        sink.report(&[host(5, 9, 3)]);
        let sent = fake.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "LM.report");
        assert!(proto::Report::decode(sent[0].1.as_slice()).is_ok());
    }
}
