//! Latency Observation Core (C6, LOP).
//!
//! Multiplexes many independent [`Stream`]s over a single sampler adapter:
//! each stream owns its own filter, enabled kinds, and report timing, but
//! kind/DSCP enablement and ifname sampling are refcounted globally since
//! the sampler only has one "on" switch per kind/ifname. See `host.rs` for
//! the observation key and accumulated-sample types, and `ifname.rs` for
//! the MLD netdev-set resolution.
//!
//! Re-architected per the Design Notes: the libev `ev_async`/`ev_timer`
//! pending-flag state machine becomes the explicit [`PollState`] enum
//! below, and `ds_tree`-keyed intrusive host records become a `HashMap`
//! keyed on [`host::HostKey`].

mod driver;
mod host;
mod ifname;

use crate::{
    clock::Clock,
    consts::LOP_REPORT_CHUNK_SIZE,
    sampler::{self, Sampler},
};
use std::collections::HashMap;
use thiserror::Error;

pub use driver::{spawn, Handle};
pub use host::{DscpKey, HostKey, HostRecord, Kinds, Sample};

/// Identifies a [`Stream`] within a [`Core`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u64);

/// How observations accumulate across a report period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// Each poll close starts a fresh sample.
    #[default]
    Separate,
    /// Observations accumulate into a single sample for the whole report
    /// period.
    Merge,
}

/// A completed batch of hosts, handed to a stream's [`ReportSink`].
/// Chunked to at most [`LOP_REPORT_CHUNK_SIZE`] hosts per call.
pub type ReportBatch<'a> = &'a [HostRecord];

/// The sink a stream's reports are drained into. Injected by value rather
/// than as a raw function pointer + `void *userdata`, per the Design
/// Notes' capability-interface guidance.
pub trait ReportSink: Send {
    fn report(&mut self, hosts: ReportBatch<'_>);
}

/// A [`ReportSink`] that drops everything; installed by default so
/// hosts-close can still run (freeing memory under `Separate` policy) even
/// when no sink has been set yet.
#[derive(Debug, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn report(&mut self, _hosts: ReportBatch<'_>) {}
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("ifname refcount underflowed for {0:?} (disabling more than was enabled)")]
    IfnameRefUnderflow(sampler::Kind),
    #[error("sampler adapter call failed: {0}")]
    SamplerUnavailable(#[source] eyre::Error),
    #[error("unknown stream id")]
    UnknownStream,
}

/// The poll-cascade state of a single stream, mirroring the
/// `{poll_pending, poll_running}` flag pair from spec §4.1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum PollState {
    #[default]
    Idle,
    Pending,
    Running,
}

struct StreamState {
    report_ms: u32,
    poll_ms: u32,
    sampling: Sampling,
    kinds: Kinds,
    dscp: bool,
    ifnames: Vec<String>,
    sink: Box<dyn ReportSink>,
    poll_state: PollState,
    report_pending: bool,
    hosts_open: HashMap<HostKey, HostRecord>,
    hosts_closed: HashMap<HostKey, HostRecord>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            report_ms: 0,
            poll_ms: 0,
            sampling: Sampling::default(),
            kinds: Kinds::default(),
            dscp: false,
            ifnames: Vec::new(),
            sink: Box::new(NullSink),
            poll_state: PollState::default(),
            report_pending: false,
            hosts_open: HashMap::new(),
            hosts_closed: HashMap::new(),
        }
    }
}

impl StreamState {
    fn hosts_close(&mut self) {
        for (key, mut record) in self.hosts_open.drain() {
            self.hosts_closed.entry(key).or_default().samples.append(&mut record.samples);
        }
    }

    fn drain_report(&mut self) {
        let hosts: Vec<HostRecord> = self.hosts_closed.drain().map(|(_, v)| v).collect();
        for chunk in hosts.chunks(LOP_REPORT_CHUNK_SIZE) {
            self.sink.report(chunk);
        }
    }
}

/// A count of references per boolean kind/DSCP flag, `0→1`/`1→0`
/// transitions of which are the only times the sampler is actually called.
#[derive(Debug, Default)]
struct Refcounts {
    min: u32,
    max: u32,
    avg: u32,
    last: u32,
    num_pkts: u32,
    dscp: u32,
}

impl Refcounts {
    fn adjust(&mut self, field: fn(&mut Self) -> &mut u32, enabled: bool) -> Option<bool> {
        let count = field(self);
        if enabled {
            *count += 1;
            (*count == 1).then_some(true)
        } else if *count == 0 {
            None
        } else {
            *count -= 1;
            (*count == 0).then_some(false)
        }
    }
}

/// The Latency Observation Core: owns the sampler adapter, the ifname/MLD
/// registry, global kind/DSCP refcounts, and every [`Stream`] allocated
/// from it.
pub struct Core {
    sampler: Box<dyn Sampler>,
    refcounts: Refcounts,
    ifnames: ifname::Registry,
    mld: ifname::Mld,
    streams: HashMap<StreamId, StreamState>,
    next_id: u64,
    poll_in_flight: bool,
    poll_reissue: bool,
}

impl Core {
    /// Creates an empty core around `sampler`.
    #[must_use]
    pub fn new(sampler: Box<dyn Sampler>) -> Self {
        Self {
            sampler,
            refcounts: Refcounts::default(),
            ifnames: ifname::Registry::default(),
            mld: ifname::Mld::default(),
            streams: HashMap::new(),
            next_id: 0,
            poll_in_flight: false,
            poll_reissue: false,
        }
    }

    /// Allocates a stream with all kinds disabled, no filter, no sink, and
    /// zero periods.
    pub fn stream_new(&mut self) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;
        self.streams.insert(id, StreamState::default());
        id
    }

    /// Flushes any pending closed hosts through the report sink one last
    /// time, then tears the stream down: releases its ifname and
    /// kind/DSCP references.
    pub fn stream_drop(&mut self, id: StreamId) -> Result<(), Error> {
        let Some(mut state) = self.streams.remove(&id) else { return Ok(()) };
        state.hosts_close();
        state.drain_report();

        if state.kinds.min {
            self.adjust_kind(sampler::Kind::Min, false)?;
        }
        if state.kinds.max {
            self.adjust_kind(sampler::Kind::Max, false)?;
        }
        if state.kinds.avg {
            self.adjust_kind(sampler::Kind::Avg, false)?;
        }
        if state.kinds.last {
            self.adjust_kind(sampler::Kind::Last, false)?;
        }
        if state.kinds.num_pkts {
            self.adjust_kind(sampler::Kind::NumPkts, false)?;
        }
        if state.dscp {
            self.adjust_dscp(false)?;
        }
        for ifname in &state.ifnames {
            self.ifnames.set_reference(id, ifname, false);
            self.ifnames.reconcile(ifname, &self.mld, self.sampler.as_mut()).map_err(Error::SamplerUnavailable)?;
        }
        Ok(())
    }

    pub fn stream_set_report_fn(&mut self, id: StreamId, sink: Box<dyn ReportSink>) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.sink = sink;
        }
    }

    /// `0` disables the report periodic; any other value (re)arms it. The
    /// driver reads the returned period back via [`Core::report_period_ms`]
    /// to arm the actual timer.
    pub fn stream_set_report_ms(&mut self, id: StreamId, ms: u32) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.report_ms = ms;
        }
    }

    pub fn stream_set_poll_ms(&mut self, id: StreamId, ms: u32) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.poll_ms = ms;
        }
    }

    #[must_use]
    pub fn report_period_ms(&self, id: StreamId) -> Option<u32> {
        self.streams.get(&id).map(|s| s.report_ms)
    }

    #[must_use]
    pub fn poll_period_ms(&self, id: StreamId) -> Option<u32> {
        self.streams.get(&id).map(|s| s.poll_ms)
    }

    pub fn stream_set_sampling(&mut self, id: StreamId, sampling: Sampling) {
        if let Some(state) = self.streams.get_mut(&id) {
            state.sampling = sampling;
        }
    }

    pub fn stream_set_kind_min(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        self.set_kind(id, enabled, sampler::Kind::Min, |k| &mut k.min)
    }

    pub fn stream_set_kind_max(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        self.set_kind(id, enabled, sampler::Kind::Max, |k| &mut k.max)
    }

    pub fn stream_set_kind_avg(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        self.set_kind(id, enabled, sampler::Kind::Avg, |k| &mut k.avg)
    }

    pub fn stream_set_kind_last(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        self.set_kind(id, enabled, sampler::Kind::Last, |k| &mut k.last)
    }

    pub fn stream_set_kind_num_pkts(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        self.set_kind(id, enabled, sampler::Kind::NumPkts, |k| &mut k.num_pkts)
    }

    fn set_kind(
        &mut self,
        id: StreamId,
        enabled: bool,
        kind: sampler::Kind,
        field: fn(&mut Kinds) -> &mut bool,
    ) -> Result<(), Error> {
        let Some(state) = self.streams.get_mut(&id) else { return Ok(()) };
        let flag = field(&mut state.kinds);
        if *flag == enabled {
            return Ok(());
        }
        *flag = enabled;
        self.adjust_kind(kind, enabled)
    }

    fn adjust_kind(&mut self, kind: sampler::Kind, enabled: bool) -> Result<(), Error> {
        let field: fn(&mut Refcounts) -> &mut u32 = match kind {
            sampler::Kind::Min => |r| &mut r.min,
            sampler::Kind::Max => |r| &mut r.max,
            sampler::Kind::Avg => |r| &mut r.avg,
            sampler::Kind::Last => |r| &mut r.last,
            sampler::Kind::NumPkts => |r| &mut r.num_pkts,
        };
        match self.refcounts.adjust(field, enabled) {
            Some(transition) => {
                self.sampler.set_kind(kind, transition).map_err(Error::SamplerUnavailable)?;
            }
            None => {
                tracing::warn!(?kind, "ifname refcount underflow, clamped at zero");
            }
        }
        Ok(())
    }

    pub fn stream_set_dscp(&mut self, id: StreamId, enabled: bool) -> Result<(), Error> {
        let Some(state) = self.streams.get_mut(&id) else { return Ok(()) };
        if state.dscp == enabled {
            return Ok(());
        }
        state.dscp = enabled;
        self.adjust_dscp(enabled)
    }

    fn adjust_dscp(&mut self, enabled: bool) -> Result<(), Error> {
        match self.refcounts.adjust(|r| &mut r.dscp, enabled) {
            Some(transition) => self.sampler.set_dscp(transition).map_err(Error::SamplerUnavailable),
            None => {
                tracing::warn!("DSCP refcount underflow, clamped at zero");
                Ok(())
            }
        }
    }

    /// Adds or removes `ifname` from a stream's interface filter, with
    /// global, MLD-aware refcounting: the sampler call issued is the delta
    /// between the logical ifname's previous and new netdev set, not a
    /// direct call for `ifname` itself.
    pub fn stream_set_ifname(&mut self, id: StreamId, ifname: &str, enabled: bool) -> Result<(), Error> {
        if let Some(state) = self.streams.get_mut(&id) {
            if enabled {
                if !state.ifnames.iter().any(|n| n == ifname) {
                    state.ifnames.push(ifname.to_string());
                }
            } else {
                state.ifnames.retain(|n| n != ifname);
            }
        }
        if !self.ifnames.set_reference(id, ifname, enabled) {
            return Ok(());
        }
        self.ifnames.reconcile(ifname, &self.mld, self.sampler.as_mut()).map_err(Error::SamplerUnavailable)
    }

    /// Updates the MLD binding for `vif`, reconciling sampling on every
    /// logical ifname the change could affect.
    pub fn set_vif_mld_if_name(&mut self, vif: &str, mld: Option<&str>) -> Result<(), Error> {
        let mut affected: Vec<String> = self.mld.affected_logical_names(vif);
        self.mld.set_vif_mld(vif, mld);
        if let Some(mld_name) = mld {
            affected.push(mld_name.to_string());
        }
        for logical in affected {
            self.ifnames.reconcile(&logical, &self.mld, self.sampler.as_mut()).map_err(Error::SamplerUnavailable)?;
        }
        Ok(())
    }

    /// Call when the netif observer reports `vif`'s existence flipped.
    pub fn on_netif_event(&mut self, vif: &str, exists: bool) -> Result<(), Error> {
        self.mld.set_exists(vif, exists);
        for logical in self.mld.affected_logical_names(vif) {
            self.ifnames.reconcile(&logical, &self.mld, self.sampler.as_mut()).map_err(Error::SamplerUnavailable)?;
        }
        Ok(())
    }

    /// Merges one sampler measurement into every stream it matches.
    pub fn on_sample(&mut self, event: sampler::SampleEvent, clock: &dyn Clock) {
        let translated_ifname = self.mld.translate(&event.ifname);
        let now_ms = clock.now_ms();
        for state in self.streams.values_mut() {
            if !state.ifnames.is_empty() && !state.ifnames.iter().any(|n| *n == translated_ifname) {
                continue;
            }
            let dscp_key = DscpKey::from_sample(state.dscp, event.dscp);
            let key = HostKey { ifname: translated_ifname.clone(), mac: event.mac, dscp: dscp_key };
            let record = state.hosts_open.entry(key.clone()).or_insert_with(|| HostRecord {
                key: Some(key),
                samples: Vec::new(),
            });
            let sample = match state.sampling {
                Sampling::Separate => {
                    record.samples.push(Sample::default());
                    record.samples.last_mut().unwrap()
                }
                Sampling::Merge => {
                    if record.samples.is_empty() {
                        record.samples.push(Sample::default());
                    }
                    &mut record.samples[0]
                }
            };
            state.kinds.update(sample, &event.sample);
            sample.timestamp_ms = Some(now_ms);
        }
    }

    /// A per-stream poll-periodic fired. Signals the core-wide wake and
    /// returns whether the driver should now call [`Core::on_poll_done`]'s
    /// counterpart, i.e. issue `sampler.poll()` itself (the sampler trait's
    /// `poll` is synchronous from the core's point of view; completion
    /// arrives later as a separate event).
    pub fn poll_tick(&mut self, id: StreamId) -> Result<(), Error> {
        if let Some(state) = self.streams.get_mut(&id) {
            state.poll_state = PollState::Pending;
        }
        self.service_poll_wake()
    }

    fn service_poll_wake(&mut self) -> Result<(), Error> {
        let mut any_pending = false;
        for state in self.streams.values_mut() {
            if state.poll_state == PollState::Pending {
                state.poll_state = PollState::Running;
                any_pending = true;
            }
        }
        if !any_pending {
            return Ok(());
        }
        if self.poll_in_flight {
            self.poll_reissue = true;
            return Ok(());
        }
        self.poll_in_flight = true;
        self.sampler.poll().map_err(Error::SamplerUnavailable)
    }

    /// Called when the sampler signals the in-flight poll is done
    /// ([`sampler::Event::PollDone`]).
    pub fn on_poll_done(&mut self) -> Result<(), Error> {
        for state in self.streams.values_mut() {
            if state.poll_state != PollState::Running {
                continue;
            }
            state.poll_state = PollState::Idle;
            if matches!(state.sampling, Sampling::Separate) {
                state.hosts_close();
            }
            if std::mem::take(&mut state.report_pending) {
                state.hosts_close();
                state.drain_report();
            }
        }
        self.poll_in_flight = false;
        if std::mem::take(&mut self.poll_reissue) {
            self.poll_in_flight = true;
            return self.sampler.poll().map_err(Error::SamplerUnavailable);
        }
        Ok(())
    }

    /// A per-stream report-periodic fired. A no-op if the stream is
    /// currently mid-poll (serviced once that completes); otherwise closes
    /// and drains the stream's hosts through its sink.
    pub fn report_tick(&mut self, id: StreamId) {
        let Some(state) = self.streams.get_mut(&id) else { return };
        if state.poll_state != PollState::Idle {
            state.report_pending = true;
            return;
        }
        state.hosts_close();
        state.drain_report();
    }

    /// Returns whether `id` currently has any hosts buffered (diagnostics
    /// / tests only).
    #[must_use]
    pub fn stream_host_count(&self, id: StreamId) -> usize {
        self.streams.get(&id).map_or(0, |s| s.hosts_open.len() + s.hosts_closed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::FakeClock, sampler::MockSampler};
    use std::sync::{Arc, Mutex};

    struct RecordingSink(Arc<Mutex<Vec<HostRecord>>>);

    impl ReportSink for RecordingSink {
        fn report(&mut self, hosts: ReportBatch<'_>) {
            self.0.lock().unwrap().extend_from_slice(hosts);
        }
    }

    fn sampler_allow_all() -> MockSampler {
        let mut sampler = MockSampler::new();
        sampler.expect_set_kind().returning(|_, _| Ok(()));
        sampler.expect_set_dscp().returning(|_| Ok(()));
        sampler.expect_set_ifname().returning(|_, _| Ok(()));
        sampler.expect_poll().returning(|| Ok(()));
        sampler
    }

    fn sample(min: f64, max: f64, num_pkts: u64) -> sampler::SampleEvent {
        sampler::SampleEvent {
            ifname: "eth0".into(),
            mac: [1, 2, 3, 4, 5, 6],
            dscp: None,
            sample: sampler::RawSample {
                min_ms: Some(min),
                max_ms: Some(max),
                num_pkts: Some(num_pkts),
                ..Default::default()
            },
        }
    }

    #[test]
    fn scenario_2_merge_vs_separate() {
        let clock = FakeClock::new(0);
        let reports = Arc::new(Mutex::new(Vec::new()));

        let mut merge_core = Core::new(Box::new(sampler_allow_all()));
        let merge_id = merge_core.stream_new();
        merge_core.stream_set_kind_min(merge_id, true).unwrap();
        merge_core.stream_set_kind_max(merge_id, true).unwrap();
        merge_core.stream_set_kind_num_pkts(merge_id, true).unwrap();
        merge_core.stream_set_sampling(merge_id, Sampling::Merge);
        merge_core.stream_set_report_fn(merge_id, Box::new(RecordingSink(Arc::clone(&reports))));

        for _ in 0..10 {
            merge_core.on_sample(sample(5.0, 9.0, 3), &clock);
            merge_core.poll_tick(merge_id).unwrap();
            merge_core.on_poll_done().unwrap();
        }
        merge_core.report_tick(merge_id);

        let merged = reports.lock().unwrap().clone();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].samples.len(), 1);
        assert_eq!(merged[0].samples[0].min_ms, Some(5));
        assert_eq!(merged[0].samples[0].max_ms, Some(9));
        assert_eq!(merged[0].samples[0].num_pkts, Some(30));

        reports.lock().unwrap().clear();
        let mut separate_core = Core::new(Box::new(sampler_allow_all()));
        let separate_id = separate_core.stream_new();
        separate_core.stream_set_kind_min(separate_id, true).unwrap();
        separate_core.stream_set_kind_max(separate_id, true).unwrap();
        separate_core.stream_set_kind_num_pkts(separate_id, true).unwrap();
        separate_core.stream_set_sampling(separate_id, Sampling::Separate);
        separate_core.stream_set_report_fn(separate_id, Box::new(RecordingSink(Arc::clone(&reports))));

        for _ in 0..10 {
            separate_core.on_sample(sample(5.0, 9.0, 3), &clock);
            separate_core.poll_tick(separate_id).unwrap();
            separate_core.on_poll_done().unwrap();
        }
        separate_core.report_tick(separate_id);

        let separate = reports.lock().unwrap().clone();
        assert_eq!(separate.len(), 1);
        assert_eq!(separate[0].samples.len(), 10);
        for s in &separate[0].samples {
            assert_eq!(s.min_ms, Some(5));
            assert_eq!(s.max_ms, Some(9));
            assert_eq!(s.num_pkts, Some(3));
        }
    }

    #[test]
    fn kind_refcount_returns_to_prior_value_after_enable_disable() {
        let mut core = Core::new(Box::new(sampler_allow_all()));
        let a = core.stream_new();
        let b = core.stream_new();
        core.stream_set_kind_min(a, true).unwrap();
        assert_eq!(core.refcounts.min, 1);
        core.stream_set_kind_min(b, true).unwrap();
        assert_eq!(core.refcounts.min, 2);
        core.stream_set_kind_min(b, false).unwrap();
        assert_eq!(core.refcounts.min, 1);
    }

    #[test]
    fn ifname_enable_then_disable_is_a_no_op_on_the_sampler_set() {
        let mut sampler = MockSampler::new();
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-5" && *e).times(1).returning(|_, _| Ok(()));
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-5" && !*e).times(1).returning(|_, _| Ok(()));
        let mut core = Core::new(Box::new(sampler));
        let id = core.stream_new();
        core.stream_set_ifname(id, "wlan0-5", true).unwrap();
        core.stream_set_ifname(id, "wlan0-5", false).unwrap();
    }

    #[test]
    fn stream_drop_flushes_closed_hosts_once() {
        let clock = FakeClock::new(0);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let mut core = Core::new(Box::new(sampler_allow_all()));
        let id = core.stream_new();
        core.stream_set_kind_min(id, true).unwrap();
        core.stream_set_sampling(id, Sampling::Merge);
        core.stream_set_report_fn(id, Box::new(RecordingSink(Arc::clone(&reports))));
        core.on_sample(sample(1.0, 1.0, 1), &clock);

        core.stream_drop(id).unwrap();
        assert_eq!(reports.lock().unwrap().len(), 1);
    }
}
