//! Thermal Control Loop (C5, TCL).
//!
//! A closed-loop state machine driven by its own periodic timer rather
//! than by upstream agent messages: every [`CONFIG_PM_TM_PERIOD_INTERVAL`]
//! it reads every enabled temperature source through the [`Platform`]
//! adapter, updates each source's moving average, selects a new thermal
//! state with asymmetric hysteresis, rate-limits the transition to a
//! single step, applies the corresponding fan RPM and per-source radio
//! chainmask, and escalates fan failure / sustained over-temperature to
//! LED state changes and a reboot request.
//!
//! [`Controller`] is the synchronous half — one [`Controller::tick`] call
//! per period, unit-tested directly the same way `lop::Core`'s methods
//! are, with no agentwire/tokio machinery involved. [`Loop`] is the
//! `agentwire::Agent`/`Task` that owns a `Controller`, a boxed
//! [`Platform`], and a boxed [`RebootRequester`], the same
//! injected-capability-interface shape the teacher's `Agent` uses for the
//! fan-speed `Output`.

use crate::consts::{
    CONFIG_PM_TM_CRITICAL_TEMPERATURE_PERIOD_TOLERANCE, CONFIG_PM_TM_FAN_ERROR_PERIOD_TOLERANCE,
    CONFIG_PM_TM_FAN_RPM_TOLERANCE, CONFIG_PM_TM_PERIOD_INTERVAL, CONFIG_PM_TM_TEMPERATURE_HYSTERESIS,
    OSP_TM_TEMP_AVG_CNT,
};
use agentwire::port::{self, Port};
use eyre::Result;
use thiserror::Error;

/// One row of the thermal table: the per-source entry threshold, the
/// per-source radio TX-chainmask, and the fan RPM, all at a given thermal
/// state (row index = state; highest index = critical state).
#[derive(Debug, Clone)]
pub struct ThermalTableRow {
    pub temp_thresh: Vec<i32>,
    pub radio_txchainmask: Vec<u32>,
    pub fan_rpm: u32,
}

/// LED states the controller can assert or clear, independently of each
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    HwError,
    Thermal,
}

/// Why [`RebootRequester::reboot`] was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    Thermal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("source_count {source_count} exceeds a thermal table row's array length")]
    SourceCountMismatch { source_count: usize },
    #[error("temperature read failed for source {0}")]
    TempReadFailed(usize),
    #[error("fan RPM read failed")]
    FanRpmReadFailed,
    #[error("chainmask apply failed for radio {0}")]
    ChainmaskApplyFailed(usize),
    #[error("critical temperature sustained past tolerance, reboot requested")]
    CriticalTempReboot,
}

/// The platform actions the controller drives every tick. Injected by
/// value, per the Design Notes' capability-interface guidance, rather than
/// a global `tgt_priv` handle.
#[cfg_attr(test, mockall::automock)]
pub trait Platform: Send {
    fn read_temperature(&mut self, source: usize) -> Result<i32>;
    fn is_radio_enabled(&self, source: usize) -> bool;
    fn read_fan_rpm(&mut self) -> Result<u32>;
    fn set_fan_rpm(&mut self, rpm: u32) -> Result<()>;
    fn apply_chainmask(&mut self, source: usize, mask: u32) -> Result<()>;
    fn set_led_state(&mut self, state: LedState, asserted: bool) -> Result<()>;
}

/// Requests the process reboot. Kept separate from [`Platform`] since it
/// is the one non-recoverable action the controller can trigger, and a
/// caller may want to intercept it independently (e.g. a `Fake` in tests
/// that just records the call instead of aborting the test process).
#[cfg_attr(test, mockall::automock)]
pub trait RebootRequester: Send {
    fn reboot(&mut self, reason: RebootReason);
}

/// Real platform adapter. Temperature/fan/chainmask access is board-specific
/// sysfs plumbing the daemon doesn't have at rewrite time, so (like
/// [`crate::sampler::Linux`]) this logs the requested action instead of
/// performing it; a board integration replaces these bodies, not the
/// `Platform` contract.
#[derive(Debug, Default)]
pub struct Linux;

impl Platform for Linux {
    fn read_temperature(&mut self, source: usize) -> Result<i32> {
        tracing::debug!(source, "thermal platform read_temperature (no-op platform backend)");
        Ok(0)
    }

    fn is_radio_enabled(&self, source: usize) -> bool {
        tracing::debug!(source, "thermal platform is_radio_enabled (no-op platform backend)");
        true
    }

    fn read_fan_rpm(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn set_fan_rpm(&mut self, rpm: u32) -> Result<()> {
        tracing::debug!(rpm, "thermal platform set_fan_rpm (no-op platform backend)");
        Ok(())
    }

    fn apply_chainmask(&mut self, source: usize, mask: u32) -> Result<()> {
        tracing::debug!(source, mask, "thermal platform apply_chainmask (no-op platform backend)");
        Ok(())
    }

    fn set_led_state(&mut self, state: LedState, asserted: bool) -> Result<()> {
        tracing::debug!(?state, asserted, "thermal platform set_led_state (no-op platform backend)");
        Ok(())
    }
}

/// Requests a reboot by shelling out to `reboot`, the same
/// spawn-and-forget idiom [`crate::firewall`]/[`crate::ipset`] use for
/// their platform commands. Synchronous because [`Controller::tick`] is;
/// a reboot is rare and terminal enough that blocking here is fine.
#[derive(Debug, Default)]
pub struct Process;

impl RebootRequester for Process {
    fn reboot(&mut self, reason: RebootReason) {
        tracing::error!(?reason, "requesting system reboot");
        if let Err(err) = std::process::Command::new("reboot").status() {
            tracing::error!(%err, "reboot command failed to spawn");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SourceHistory {
    window: [i32; OSP_TM_TEMP_AVG_CNT],
    filled: usize,
    next: usize,
    sum: i64,
}

impl SourceHistory {
    fn push(&mut self, value: i32) -> i32 {
        if self.filled < self.window.len() {
            self.window[self.filled] = value;
            self.sum += i64::from(value);
            self.filled += 1;
        } else {
            let slot = self.next % self.window.len();
            self.sum -= i64::from(self.window[slot]);
            self.window[slot] = value;
            self.sum += i64::from(value);
        }
        self.next = (self.next + 1) % self.window.len().max(1);
        self.average()
    }

    fn average(&self) -> i32 {
        if self.filled == 0 {
            return 0;
        }
        let avg = self.sum as f64 / self.filled as f64;
        avg.round() as i32
    }
}

/// Events a [`Controller::tick`] produces, in the order they should be
/// applied/reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ThermalState(usize),
    FanRpm(u32),
    LedState { state: LedState, asserted: bool },
}

/// The synchronous thermal state machine: per-source moving averages,
/// hysteresis-based state selection, fan-failure and critical-temperature
/// escalation. Holds no I/O of its own — every external action goes
/// through the `platform`/`reboot` arguments passed to [`Controller::tick`].
#[derive(Debug)]
pub struct Controller {
    table: Vec<ThermalTableRow>,
    source_count: usize,
    histories: Vec<SourceHistory>,
    last_candidate: Vec<usize>,
    prev_state: usize,
    prev_fan_rpm: u32,
    fan_failure: u32,
    hwerror_asserted: bool,
    crit_temp_periods: u32,
    thermal_asserted: bool,
}

impl Controller {
    /// Validates `table` against `source_count` and creates a controller
    /// starting in thermal state 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceCountMismatch`] if `table` is empty or any
    /// row's `temp_thresh`/`radio_txchainmask` is shorter than
    /// `source_count`.
    pub fn new(table: Vec<ThermalTableRow>, source_count: usize) -> Result<Self, Error> {
        if table.is_empty()
            || table.iter().any(|row| row.temp_thresh.len() < source_count || row.radio_txchainmask.len() < source_count)
        {
            return Err(Error::SourceCountMismatch { source_count });
        }
        Ok(Self {
            table,
            source_count,
            histories: vec![SourceHistory::default(); source_count],
            last_candidate: vec![0; source_count],
            prev_state: 0,
            prev_fan_rpm: 0,
            fan_failure: 0,
            hwerror_asserted: false,
            crit_temp_periods: 0,
            thermal_asserted: true,
        })
    }

    fn top_row(&self) -> usize {
        self.table.len() - 1
    }

    fn candidate_state(&self, source: usize, reading: i32) -> usize {
        let mut highest = 0;
        let mut hysteresis = CONFIG_PM_TM_TEMPERATURE_HYSTERESIS;
        for (state, row) in self.table.iter().enumerate() {
            if state > self.prev_state {
                hysteresis = 0;
            }
            if reading < row.temp_thresh[source] - hysteresis {
                break;
            }
            highest = state;
        }
        highest
    }

    /// Runs one period: reads every enabled source, selects a new state,
    /// applies fan RPM/chainmask, and escalates failures. Returns the
    /// [`Event`]s produced, in order. `platform` errors other than a
    /// missed temperature reading are logged by the caller, not returned,
    /// per spec: only a sustained critical temperature is non-recoverable.
    pub fn tick(
        &mut self,
        platform: &mut dyn Platform,
        reboot: &mut dyn RebootRequester,
    ) -> Result<Vec<Event>, Error> {
        let mut events = Vec::new();
        let mut raw_state = self.prev_state;
        let mut any_source_enabled = false;

        for source in 0..self.source_count {
            if !platform.is_radio_enabled(source) {
                continue;
            }
            if !any_source_enabled {
                any_source_enabled = true;
                raw_state = 0;
            }
            match platform.read_temperature(source) {
                Ok(reading) => {
                    let avg = self.histories[source].push(reading);
                    self.last_candidate[source] = self.candidate_state(source, avg);
                }
                Err(err) => {
                    tracing::warn!(source, %err, "thermal: temperature read failed");
                }
            }
            raw_state = raw_state.max(self.last_candidate[source]);
        }

        let new_state = if raw_state > self.prev_state {
            self.prev_state + 1
        } else if raw_state < self.prev_state {
            self.prev_state - 1
        } else {
            self.prev_state
        };

        match platform.read_fan_rpm() {
            Ok(fan_rpm) => {
                let low = self.prev_fan_rpm as i32 - CONFIG_PM_TM_FAN_RPM_TOLERANCE;
                let high = self.prev_fan_rpm as i32 + CONFIG_PM_TM_FAN_RPM_TOLERANCE;
                if (fan_rpm as i32) < low || (fan_rpm as i32) > high {
                    self.fan_failure += 1;
                    if self.fan_failure > CONFIG_PM_TM_FAN_ERROR_PERIOD_TOLERANCE && !self.hwerror_asserted {
                        self.hwerror_asserted = true;
                        events.push(Event::LedState { state: LedState::HwError, asserted: false });
                    }
                } else if self.fan_failure != 0 {
                    self.fan_failure = 0;
                    if self.hwerror_asserted {
                        self.hwerror_asserted = false;
                        events.push(Event::LedState { state: LedState::HwError, asserted: true });
                    }
                }
            }
            Err(_) => tracing::warn!("thermal: fan RPM read failed"),
        }

        if new_state >= self.top_row() {
            if self.crit_temp_periods == 0 {
                self.thermal_asserted = false;
                events.push(Event::LedState { state: LedState::Thermal, asserted: false });
            }
            self.crit_temp_periods += 1;
            if self.crit_temp_periods > CONFIG_PM_TM_CRITICAL_TEMPERATURE_PERIOD_TOLERANCE {
                reboot.reboot(RebootReason::Thermal);
                return Err(Error::CriticalTempReboot);
            }
        } else if self.crit_temp_periods > 0 {
            self.crit_temp_periods = 0;
            self.thermal_asserted = true;
            events.push(Event::LedState { state: LedState::Thermal, asserted: true });
        }

        if new_state != self.prev_state {
            for source in 0..self.source_count {
                let old_mask = self.table[self.prev_state].radio_txchainmask[source];
                let new_mask = self.table[new_state].radio_txchainmask[source];
                if new_mask != old_mask {
                    if let Err(err) = platform.apply_chainmask(source, new_mask) {
                        tracing::warn!(source, %err, "thermal: chainmask apply failed");
                    }
                }
            }
            events.push(Event::ThermalState(new_state));
        }

        let target_fan_rpm = self.table[new_state].fan_rpm;
        if let Err(err) = platform.set_fan_rpm(target_fan_rpm) {
            tracing::warn!(%err, "thermal: set fan RPM failed");
        }
        events.push(Event::FanRpm(target_fan_rpm));

        self.prev_state = new_state;
        self.prev_fan_rpm = target_fan_rpm;
        Ok(events)
    }

    #[must_use]
    pub fn state(&self) -> usize {
        self.prev_state
    }
}

/// Config-store mutations the thermal loop accepts.
#[derive(Debug)]
pub enum Input {
    SetThermalTable(Vec<ThermalTableRow>),
}

/// Everything [`Controller::tick`] can produce, forwarded to the agent's
/// owner.
#[derive(Debug)]
pub enum Output {
    ThermalState(usize),
    FanRpm(u32),
    LedState { state: LedState, asserted: bool },
}

/// The Thermal Control Loop agent.
pub struct Loop {
    controller: Controller,
    platform: Box<dyn Platform>,
    reboot: Box<dyn RebootRequester>,
}

impl Loop {
    #[must_use]
    pub fn new(controller: Controller, platform: Box<dyn Platform>, reboot: Box<dyn RebootRequester>) -> Self {
        Self { controller, platform, reboot }
    }
}

impl Port for Loop {
    type Input = Input;
    type Output = Output;

    const INPUT_CAPACITY: usize = 4;
    const OUTPUT_CAPACITY: usize = 16;
}

impl agentwire::Agent for Loop {
    const NAME: &'static str = "thermal";
}

impl agentwire::agent::Task for Loop {
    type Error = eyre::Error;

    async fn run(mut self, mut port: port::Inner<Self>) -> Result<(), Self::Error> {
        let mut interval = tokio::time::interval(CONFIG_PM_TM_PERIOD_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.controller.tick(self.platform.as_mut(), self.reboot.as_mut()) {
                        Ok(events) => {
                            for event in events {
                                let output = match event {
                                    Event::ThermalState(state) => Output::ThermalState(state),
                                    Event::FanRpm(rpm) => Output::FanRpm(rpm),
                                    Event::LedState { state, asserted } => Output::LedState { state, asserted },
                                };
                                if port.send(port::Output::new(output)).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Err(Error::CriticalTempReboot) => return Err(Error::CriticalTempReboot.into()),
                        Err(err) => tracing::warn!("thermal: {err}"),
                    }
                }
                input = port.next() => {
                    let Some(input) = input else { break };
                    match input.value {
                        Input::SetThermalTable(table) => {
                            match Controller::new(table, self.controller.source_count) {
                                Ok(controller) => self.controller = controller,
                                Err(err) => tracing::warn!("thermal: {err}"),
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(thresh: &[&[i32]], chainmask: &[&[u32]], fan_rpm: &[u32]) -> Vec<ThermalTableRow> {
        thresh
            .iter()
            .zip(chainmask)
            .zip(fan_rpm)
            .map(|((t, c), f)| ThermalTableRow {
                temp_thresh: t.to_vec(),
                radio_txchainmask: c.to_vec(),
                fan_rpm: *f,
            })
            .collect()
    }

    fn one_source_table() -> Vec<ThermalTableRow> {
        table(
            &[&[40], &[60], &[80], &[95]],
            &[&[0b1111], &[0b0111], &[0b0011], &[0b0001]],
            &[1000, 2000, 3000, 4000],
        )
    }

    fn allow_all_platform(readings: Vec<i32>) -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.expect_is_radio_enabled().returning(|_| true);
        let mut readings = readings.into_iter();
        platform.expect_read_temperature().returning(move |_| Ok(readings.next().unwrap()));
        platform.expect_read_fan_rpm().returning(|| Ok(2000));
        platform.expect_set_fan_rpm().returning(|_| Ok(()));
        platform.expect_apply_chainmask().returning(|_, _| Ok(()));
        platform
    }

    #[test]
    fn source_count_mismatch_is_rejected_at_construction() {
        let table = table(&[&[40, 40]], &[&[1]], &[1000]);
        assert!(matches!(Controller::new(table, 2), Err(Error::SourceCountMismatch { source_count: 2 })));
    }

    #[test]
    fn single_step_rate_limiting_and_hysteresis() {
        // Thresholds [40, 60, 80, 95], hysteresis 5, one source.
        let readings = vec![55, 58, 70, 90, 58, 56, 40, 30];
        let mut platform = allow_all_platform(readings);
        let mut reboot = MockRebootRequester::new();
        let mut controller = Controller::new(one_source_table(), 1).unwrap();
        let mut states = Vec::new();
        for _ in 0..8 {
            controller.tick(&mut platform, &mut reboot).unwrap();
            states.push(controller.state());
        }
        for pair in states.windows(2) {
            assert!(pair[1].abs_diff(pair[0]) <= 1, "state jumped more than one step: {states:?}");
        }
        assert!(states.contains(&1), "a 90-degree reading never raised the state: {states:?}");
    }

    #[test]
    fn hysteresis_holds_state_past_its_falling_threshold() {
        let readings = vec![62, 58];
        let mut platform = allow_all_platform(readings);
        let mut reboot = MockRebootRequester::new();
        let mut controller = Controller::new(one_source_table(), 1).unwrap();
        controller.tick(&mut platform, &mut reboot).unwrap();
        assert_eq!(controller.state(), 1);
        controller.tick(&mut platform, &mut reboot).unwrap();
        assert_eq!(controller.state(), 1, "58 is above 60-5=55, state 1 should hold");
    }

    #[test]
    fn critical_reboot_after_sustained_over_temperature() {
        let readings = vec![96, 97, 97, 97];
        let mut platform = allow_all_platform(readings);
        let mut reboot = MockRebootRequester::new();
        reboot.expect_reboot().withf(|r| *r == RebootReason::Thermal).times(1).return_const(());
        let mut controller = Controller::new(one_source_table(), 1).unwrap();
        controller.prev_state = controller.top_row();
        let mut result = Ok(Vec::new());
        for _ in 0..4 {
            result = controller.tick(&mut platform, &mut reboot);
        }
        assert!(matches!(result, Err(Error::CriticalTempReboot)));
    }

    #[test]
    fn fan_failure_asserts_hwerror_after_tolerance_exceeded() {
        let mut platform = MockPlatform::new();
        platform.expect_is_radio_enabled().returning(|_| true);
        platform.expect_read_temperature().returning(|_| Ok(50));
        platform.expect_read_fan_rpm().returning(|| Ok(0));
        platform.expect_set_fan_rpm().returning(|_| Ok(()));
        platform.expect_apply_chainmask().returning(|_, _| Ok(()));
        let mut reboot = MockRebootRequester::new();
        let mut controller = Controller::new(one_source_table(), 1).unwrap();
        controller.prev_fan_rpm = 2000;

        let mut saw_hwerror = false;
        for _ in 0..(CONFIG_PM_TM_FAN_ERROR_PERIOD_TOLERANCE + 1) {
            let events = controller.tick(&mut platform, &mut reboot).unwrap();
            if events.contains(&Event::LedState { state: LedState::HwError, asserted: false }) {
                saw_hwerror = true;
            }
        }
        assert!(saw_hwerror);
    }
}
