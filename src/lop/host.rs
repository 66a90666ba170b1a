//! The `(ifname, mac, dscp)` observation key, and the sample values
//! accumulated under it.

use crate::sampler::{Dscp, RawSample};

/// The `dscp` component of a [`HostKey`].
///
/// `None` means the stream has DSCP reporting disabled entirely; `Missing`
/// means DSCP reporting is enabled but the sampler could not stamp a value
/// on this particular measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DscpKey {
    None,
    Missing,
    Value(u8),
}

impl DscpKey {
    pub(super) fn from_sample(dscp_enabled: bool, observed: Option<Dscp>) -> Self {
        if !dscp_enabled {
            return Self::None;
        }
        match observed {
            Some(Dscp::Value(value)) => Self::Value(value),
            Some(Dscp::Missing) | None => Self::Missing,
        }
    }
}

/// The composite key a stream groups observations under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostKey {
    pub ifname: String,
    pub mac: [u8; 6],
    pub dscp: DscpKey,
}

/// One accumulated measurement window. Fields are present only for the
/// kinds the owning stream has enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub min_ms: Option<u32>,
    pub max_ms: Option<u32>,
    pub last_ms: Option<u32>,
    pub avg_sum_ms: Option<u64>,
    pub avg_cnt: Option<u32>,
    pub num_pkts: Option<u32>,
    pub timestamp_ms: Option<u64>,
}

impl Sample {
    /// `avg_sum_ms / avg_cnt`, the value actually placed on the wire.
    #[must_use]
    pub fn avg_ms(&self) -> Option<u32> {
        match (self.avg_sum_ms, self.avg_cnt) {
            (Some(sum), Some(cnt)) if cnt > 0 => Some(u32::try_from(sum / u64::from(cnt)).unwrap_or(u32::MAX)),
            _ => None,
        }
    }
}

/// A key plus the sequence of samples accumulated under it during the
/// current report period.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostRecord {
    pub key: Option<HostKey>,
    pub samples: Vec<Sample>,
}

/// Kinds a stream can independently enable. Mirrors [`crate::sampler::Kind`]
/// but is kept as a distinct type since `lop` reasons about enabled-kind
/// *sets*, not individual sampler setter calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Kinds {
    pub min: bool,
    pub max: bool,
    pub avg: bool,
    pub last: bool,
    pub num_pkts: bool,
}

impl Kinds {
    #[must_use]
    pub fn any(&self) -> bool {
        self.min || self.max || self.avg || self.last || self.num_pkts
    }

    pub(super) fn update(&self, sample: &mut Sample, raw: &RawSample) {
        if self.min {
            sample.min_ms = Some(merge_min(sample.min_ms, raw.min_ms));
        }
        if self.max {
            sample.max_ms = Some(merge_max(sample.max_ms, raw.max_ms));
        }
        if self.last {
            if let Some(last) = raw.last_ms {
                sample.last_ms = Some(round_ms(last));
            }
        }
        if self.num_pkts {
            let n = raw.num_pkts.unwrap_or(0);
            sample.num_pkts = Some(sample.num_pkts.unwrap_or(0) + u32::try_from(n).unwrap_or(u32::MAX));
        }
        if self.avg {
            let n = raw.num_pkts.unwrap_or(1).max(1);
            let a = raw.avg_ms.unwrap_or(0.0);
            let contribution = (a * n as f64).round() as u64;
            sample.avg_sum_ms = Some(sample.avg_sum_ms.unwrap_or(0) + contribution);
            sample.avg_cnt = Some(sample.avg_cnt.unwrap_or(0) + u32::try_from(n).unwrap_or(u32::MAX));
        }
    }
}

fn round_ms(value: f64) -> u32 {
    u32::try_from(value.round() as i64).unwrap_or(u32::MAX)
}

fn merge_min(current: Option<u32>, incoming: Option<f64>) -> u32 {
    let incoming = incoming.map_or(u32::MAX, round_ms);
    current.map_or(incoming, |current| current.min(incoming))
}

fn merge_max(current: Option<u32>, incoming: Option<f64>) -> u32 {
    let incoming = incoming.map_or(0, round_ms);
    current.map_or(incoming, |current| current.max(incoming))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_key_none_when_stream_disabled() {
        assert_eq!(DscpKey::from_sample(false, Some(Dscp::Value(12))), DscpKey::None);
    }

    #[test]
    fn dscp_key_missing_when_sampler_omits_it() {
        assert_eq!(DscpKey::from_sample(true, None), DscpKey::Missing);
        assert_eq!(DscpKey::from_sample(true, Some(Dscp::Missing)), DscpKey::Missing);
    }

    #[test]
    fn kinds_min_max_num_pkts_merge_like_scenario_2() {
        let kinds = Kinds { min: true, max: true, num_pkts: true, ..Kinds::default() };
        let mut sample = Sample::default();
        for raw in
            [RawSample { min_ms: Some(5.0), max_ms: Some(9.0), num_pkts: Some(3), ..Default::default() }; 10]
        {
            kinds.update(&mut sample, &raw);
        }
        assert_eq!(sample.min_ms, Some(5));
        assert_eq!(sample.max_ms, Some(9));
        assert_eq!(sample.num_pkts, Some(30));
    }
}
