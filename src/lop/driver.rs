//! Async glue wiring the sans-IO [`Core`] to real timers, the sampler's
//! event stream, and netif existence events.
//!
//! [`Core`] itself is a plain synchronous struct so its business logic
//! (refcounting, host merging, poll/report state machine) is unit-testable
//! by calling its methods directly, the same way `map`'s derivation or
//! `thermal`'s controller update are pure functions under test. This
//! module is the one place that actually owns tokio tasks: one
//! [`crate::clock::Periodic`] per stream per timer kind, all funneling
//! into a single tick channel the driver's select loop consumes alongside
//! the sampler and netif streams.
//!
//! Callers talk to a running driver through a cloneable [`Handle`], which
//! mirrors `Core`'s public contract as async methods over a command
//! channel — the same "never reach into another component's state
//! directly" discipline `agentwire::Port` enforces elsewhere in this
//! crate, generalized here to a request/response command enum since LOP's
//! surface has getters as well as setters.

use super::{Core, ReportSink, Sampling, StreamId};
use crate::{clock::Clock, netif::NetifEvent, sampler};
use futures::Stream;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Copy, PartialEq, Eq)]
enum TickKind {
    Poll,
    Report,
}

enum Command {
    StreamNew(oneshot::Sender<StreamId>),
    StreamDrop(StreamId),
    StreamSetReportFn(StreamId, Box<dyn ReportSink>),
    StreamSetReportMs(StreamId, u32),
    StreamSetPollMs(StreamId, u32),
    StreamSetSampling(StreamId, Sampling),
    StreamSetKindMin(StreamId, bool),
    StreamSetKindMax(StreamId, bool),
    StreamSetKindAvg(StreamId, bool),
    StreamSetKindLast(StreamId, bool),
    StreamSetKindNumPkts(StreamId, bool),
    StreamSetDscp(StreamId, bool),
    StreamSetIfname(StreamId, String, bool),
    SetVifMldIfName(String, Option<String>),
}

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const TICK_CHANNEL_CAPACITY: usize = 256;

/// A handle to a running [`Core`] driver, cloneable for every component
/// that needs to configure streams (chiefly the config-store adapter).
#[derive(Clone)]
pub struct Handle {
    command_tx: mpsc::Sender<Command>,
}

impl Handle {
    pub async fn stream_new(&self) -> StreamId {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.command_tx.send(Command::StreamNew(reply_tx)).await;
        reply_rx.await.expect("driver task exited")
    }

    pub async fn stream_drop(&self, id: StreamId) {
        let _ = self.command_tx.send(Command::StreamDrop(id)).await;
    }

    pub async fn stream_set_report_fn(&self, id: StreamId, sink: Box<dyn ReportSink>) {
        let _ = self.command_tx.send(Command::StreamSetReportFn(id, sink)).await;
    }

    pub async fn stream_set_report_ms(&self, id: StreamId, ms: u32) {
        let _ = self.command_tx.send(Command::StreamSetReportMs(id, ms)).await;
    }

    pub async fn stream_set_poll_ms(&self, id: StreamId, ms: u32) {
        let _ = self.command_tx.send(Command::StreamSetPollMs(id, ms)).await;
    }

    pub async fn stream_set_sampling(&self, id: StreamId, sampling: Sampling) {
        let _ = self.command_tx.send(Command::StreamSetSampling(id, sampling)).await;
    }

    pub async fn stream_set_kind_min(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetKindMin(id, enabled)).await;
    }

    pub async fn stream_set_kind_max(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetKindMax(id, enabled)).await;
    }

    pub async fn stream_set_kind_avg(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetKindAvg(id, enabled)).await;
    }

    pub async fn stream_set_kind_last(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetKindLast(id, enabled)).await;
    }

    pub async fn stream_set_kind_num_pkts(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetKindNumPkts(id, enabled)).await;
    }

    pub async fn stream_set_dscp(&self, id: StreamId, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetDscp(id, enabled)).await;
    }

    pub async fn stream_set_ifname(&self, id: StreamId, ifname: impl Into<String>, enabled: bool) {
        let _ = self.command_tx.send(Command::StreamSetIfname(id, ifname.into(), enabled)).await;
    }

    pub async fn set_vif_mld_if_name(&self, vif: impl Into<String>, mld: Option<String>) {
        let _ = self.command_tx.send(Command::SetVifMldIfName(vif.into(), mld)).await;
    }
}

/// Spawns the driver loop and returns a [`Handle`] to it.
pub fn spawn(
    core: Core,
    sampler_events: impl Stream<Item = sampler::Event> + Send + 'static,
    netif_events: impl Stream<Item = NetifEvent> + Send + 'static,
    clock: Arc<dyn Clock>,
) -> Handle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(run(core, command_rx, Box::pin(sampler_events), Box::pin(netif_events), clock));
    Handle { command_tx }
}

async fn run(
    mut core: Core,
    mut command_rx: mpsc::Receiver<Command>,
    mut sampler_events: Pin<Box<dyn Stream<Item = sampler::Event> + Send>>,
    mut netif_events: Pin<Box<dyn Stream<Item = NetifEvent> + Send>>,
    clock: Arc<dyn Clock>,
) {
    use futures::StreamExt;

    let (tick_tx, mut tick_rx) = mpsc::channel::<(StreamId, TickKind)>(TICK_CHANNEL_CAPACITY);
    let mut poll_timers = HashMap::new();
    let mut report_timers = HashMap::new();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                handle_command(&mut core, command, &tick_tx, &mut poll_timers, &mut report_timers);
            }
            Some(event) = sampler_events.next() => {
                match event {
                    sampler::Event::Sample(sample) => core.on_sample(sample, clock.as_ref()),
                    sampler::Event::PollDone => {
                        if let Err(err) = core.on_poll_done() {
                            tracing::warn!("lop: {err}");
                        }
                    }
                }
            }
            Some(event) = netif_events.next() => {
                if let Err(err) = core.on_netif_event(&event.ifname, event.exists) {
                    tracing::warn!("lop: {err}");
                }
            }
            Some((id, kind)) = tick_rx.recv() => {
                let result = match kind {
                    TickKind::Poll => core.poll_tick(id),
                    TickKind::Report => { core.report_tick(id); Ok(()) }
                };
                if let Err(err) = result {
                    tracing::warn!("lop: {err}");
                }
            }
            else => break,
        }
    }
}

fn handle_command(
    core: &mut Core,
    command: Command,
    tick_tx: &mpsc::Sender<(StreamId, TickKind)>,
    poll_timers: &mut HashMap<StreamId, crate::clock::Periodic<(StreamId, TickKind)>>,
    report_timers: &mut HashMap<StreamId, crate::clock::Periodic<(StreamId, TickKind)>>,
) {
    match command {
        Command::StreamNew(reply) => {
            let id = core.stream_new();
            poll_timers.insert(id, crate::clock::Periodic::new((id, TickKind::Poll), tick_tx.clone()));
            report_timers.insert(id, crate::clock::Periodic::new((id, TickKind::Report), tick_tx.clone()));
            let _ = reply.send(id);
        }
        Command::StreamDrop(id) => {
            poll_timers.remove(&id);
            report_timers.remove(&id);
            if let Err(err) = core.stream_drop(id) {
                tracing::warn!("lop: {err}");
            }
        }
        Command::StreamSetReportFn(id, sink) => core.stream_set_report_fn(id, sink),
        Command::StreamSetReportMs(id, ms) => {
            core.stream_set_report_ms(id, ms);
            if let Some(timer) = report_timers.get_mut(&id) {
                timer.set_period((ms > 0).then(|| std::time::Duration::from_millis(u64::from(ms))));
            }
        }
        Command::StreamSetPollMs(id, ms) => {
            core.stream_set_poll_ms(id, ms);
            if let Some(timer) = poll_timers.get_mut(&id) {
                timer.set_period((ms > 0).then(|| std::time::Duration::from_millis(u64::from(ms))));
            }
        }
        Command::StreamSetSampling(id, sampling) => core.stream_set_sampling(id, sampling),
        Command::StreamSetKindMin(id, enabled) => log_err(core.stream_set_kind_min(id, enabled)),
        Command::StreamSetKindMax(id, enabled) => log_err(core.stream_set_kind_max(id, enabled)),
        Command::StreamSetKindAvg(id, enabled) => log_err(core.stream_set_kind_avg(id, enabled)),
        Command::StreamSetKindLast(id, enabled) => log_err(core.stream_set_kind_last(id, enabled)),
        Command::StreamSetKindNumPkts(id, enabled) => log_err(core.stream_set_kind_num_pkts(id, enabled)),
        Command::StreamSetDscp(id, enabled) => log_err(core.stream_set_dscp(id, enabled)),
        Command::StreamSetIfname(id, ifname, enabled) => {
            log_err(core.stream_set_ifname(id, &ifname, enabled));
        }
        Command::SetVifMldIfName(vif, mld) => {
            log_err(core.set_vif_mld_if_name(&vif, mld.as_deref()));
        }
    }
}

fn log_err(result: Result<(), super::Error>) {
    if let Err(err) = result {
        tracing::warn!("lop: {err}");
    }
}
