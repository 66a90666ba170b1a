//! Watchdog proxy (supplement, spec §6).
//!
//! Grounded on `wpd.c`: a small standalone signal-driven loop, deliberately
//! kept outside `agentwire` since it has no message-passing relationship to
//! the rest of the process — it owns the one `/dev/watchdog` file
//! descriptor and reacts only to its own timer and `SIGUSR1`/`SIGUSR2`/
//! `SIGHUP`/`SIGINT`. [`Proxy`] is the synchronous auto/no-auto +
//! external-ping-deadline state machine, unit-tested directly; [`run`] is
//! the tokio driver that turns real signals and timer ticks into
//! [`Event`]s and carries out the [`Action`]s they produce.
//!
//! Reuses [`crate::agents::thermal::RebootRequester`] for the reboot
//! escalation: spec §6 calls the reason set on a missed deadline the
//! "thermal reboot reason", the same one the thermal control loop uses for
//! its own critical-temperature reboot.

use crate::agents::thermal::{RebootReason, RebootRequester};
use crate::consts::{
    WATCHDOG_EXTERNAL_PING_DEADLINE, WATCHDOG_EXTERNAL_PING_INITIAL_DEADLINE, WATCHDOG_INITIAL_TIMEOUT_SECS,
    WATCHDOG_REDUCED_TIMEOUT_SECS,
};
use eyre::Result;
use std::time::Duration;

/// Whether a missed external-ping deadline escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// External callers must ping via `SIGHUP` or the deadline escalates.
    Auto,
    /// The deadline timer runs but a miss is ignored.
    NoAuto,
}

/// Inputs to [`Proxy::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The steady-state 5s device-ping timer fired.
    WdTick,
    /// The external-ping deadline timer fired without being reset first.
    ExtDeadlineMissed,
    /// `SIGHUP`: an external caller pinged.
    ExtPing,
    /// `SIGUSR1`: switch to [`Mode::Auto`].
    SetAuto,
    /// `SIGUSR2`: switch to [`Mode::NoAuto`].
    SetNoAuto,
}

/// Outputs of [`Proxy::handle`], carried out by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write a ping to the watchdog device.
    PingDevice,
    /// (Re)start the external-ping deadline timer with this period.
    ArmExtDeadline(Duration),
    /// `WDIOC_SETTIMEOUT` the device to this many seconds.
    SetDeviceTimeout(u32),
    /// Request the thermal reboot reason and reboot.
    RequestReboot,
    /// Stop reacting to further events; the hardware watchdog will fire.
    Halt,
}

/// The auto/no-auto + external-ping-deadline state machine. Holds no I/O;
/// every external action is returned as an [`Action`] for the driver to
/// carry out.
#[derive(Debug)]
pub struct Proxy {
    mode: Mode,
}

impl Proxy {
    /// Starts in [`Mode::NoAuto`], matching the daemon's zero-initialized
    /// mode field. Returns the actions needed to bring the device to its
    /// initial timeout and arm the first external-ping deadline, which
    /// runs longer than every later re-arm to give external callers time
    /// to start pinging after boot.
    #[must_use]
    pub fn new() -> (Self, Vec<Action>) {
        (
            Self { mode: Mode::NoAuto },
            vec![
                Action::SetDeviceTimeout(WATCHDOG_INITIAL_TIMEOUT_SECS),
                Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_INITIAL_DEADLINE),
            ],
        )
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Advances the state machine one event, returning the actions it
    /// produced, in order.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::WdTick => {
                let mut actions = vec![Action::PingDevice];
                if self.mode == Mode::Auto {
                    actions.push(Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_DEADLINE));
                }
                actions
            }
            Event::ExtPing => {
                if self.mode == Mode::Auto {
                    vec![Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_DEADLINE)]
                } else {
                    Vec::new()
                }
            }
            Event::SetAuto => {
                self.mode = Mode::Auto;
                Vec::new()
            }
            Event::SetNoAuto => {
                self.mode = Mode::NoAuto;
                Vec::new()
            }
            Event::ExtDeadlineMissed if self.mode == Mode::Auto => {
                vec![Action::RequestReboot, Action::SetDeviceTimeout(WATCHDOG_REDUCED_TIMEOUT_SECS), Action::Halt]
            }
            Event::ExtDeadlineMissed => Vec::new(),
        }
    }
}

/// The watchdog device's two operations, injected by value so the driver
/// can be tested against a recording fake instead of a real
/// `/dev/watchdog`.
#[cfg_attr(test, mockall::automock)]
pub trait Device: Send {
    fn ping(&mut self) -> Result<()>;
    fn set_timeout(&mut self, secs: u32) -> Result<()>;
}

nix::ioctl_readwrite!(wdioc_set_timeout, b'W', 6, libc::c_int);

/// The real `/dev/watchdog` character device.
pub struct FileDevice(std::fs::File);

impl FileDevice {
    /// Opens `path` (`/dev/watchdog` in production) for reading and
    /// writing, matching the teacher's O_RDWR/O_CLOEXEC open idiom.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self(file))
    }
}

impl Device for FileDevice {
    fn ping(&mut self) -> Result<()> {
        use std::io::Write;
        self.0.write_all(b"w")?;
        Ok(())
    }

    fn set_timeout(&mut self, secs: u32) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let mut timeout = libc::c_int::try_from(secs).unwrap_or(libc::c_int::MAX);
        // SAFETY: `timeout` is a valid in/out pointer for WDIOC_SETTIMEOUT
        // for the lifetime of this call, and the fd is open on a character
        // device that understands the watchdog ioctl ABI.
        unsafe { wdioc_set_timeout(self.0.as_raw_fd(), &mut timeout) }?;
        Ok(())
    }
}

/// Drives a [`Proxy`] from real signals and timers until [`Action::Halt`]
/// or a `SIGINT`.
///
/// # Errors
///
/// Returns an error if installing a signal handler fails.
pub async fn run(mut device: impl Device, mut reboot: impl RebootRequester) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_set_auto = signal(SignalKind::user_defined1())?;
    let mut sig_set_noauto = signal(SignalKind::user_defined2())?;
    let mut sig_ping = signal(SignalKind::hangup())?;
    let mut sig_kill = signal(SignalKind::interrupt())?;

    let (mut proxy, initial) = Proxy::new();
    let mut wd_ping = tokio::time::interval(crate::consts::WATCHDOG_PING_INTERVAL);
    let ext_deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(ext_deadline);

    for action in initial {
        apply(action, &mut device, &mut reboot, &mut ext_deadline)?;
    }

    loop {
        let event = tokio::select! {
            _ = wd_ping.tick() => Event::WdTick,
            () = &mut ext_deadline => Event::ExtDeadlineMissed,
            _ = sig_set_auto.recv() => Event::SetAuto,
            _ = sig_set_noauto.recv() => Event::SetNoAuto,
            _ = sig_ping.recv() => Event::ExtPing,
            _ = sig_kill.recv() => return Ok(()),
        };
        let mut halted = false;
        for action in proxy.handle(event) {
            if action == Action::Halt {
                halted = true;
                continue;
            }
            apply(action, &mut device, &mut reboot, &mut ext_deadline)?;
        }
        if halted {
            // The kernel watchdog now has a 3s fuse; there is nothing left
            // to do but wait for it.
            std::future::pending::<()>().await;
        }
    }
}

fn apply(
    action: Action,
    device: &mut impl Device,
    reboot: &mut impl RebootRequester,
    ext_deadline: &mut std::pin::Pin<&mut tokio::time::Sleep>,
) -> Result<()> {
    match action {
        Action::PingDevice => device.ping(),
        Action::SetDeviceTimeout(secs) => device.set_timeout(secs),
        Action::ArmExtDeadline(period) => {
            ext_deadline.as_mut().reset(tokio::time::Instant::now() + period);
            Ok(())
        }
        Action::RequestReboot => {
            reboot.reboot(RebootReason::Thermal);
            Ok(())
        }
        Action::Halt => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::thermal::MockRebootRequester;

    #[test]
    fn starts_in_noauto_and_arms_initial_timeout() {
        let (proxy, actions) = Proxy::new();
        assert_eq!(proxy.mode(), Mode::NoAuto);
        assert!(actions.contains(&Action::SetDeviceTimeout(WATCHDOG_INITIAL_TIMEOUT_SECS)));
        assert!(actions.contains(&Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_INITIAL_DEADLINE)));
    }

    #[test]
    fn wd_tick_pings_always_but_only_arms_deadline_in_auto() {
        let (mut proxy, _) = Proxy::new();
        let actions = proxy.handle(Event::WdTick);
        assert_eq!(actions, vec![Action::PingDevice], "no-auto mode should not track the deadline");

        proxy.handle(Event::SetAuto);
        let actions = proxy.handle(Event::WdTick);
        assert_eq!(actions, vec![Action::PingDevice, Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_DEADLINE)]);
    }

    #[test]
    fn missed_deadline_in_noauto_mode_is_ignored() {
        let (mut proxy, _) = Proxy::new();
        assert!(proxy.handle(Event::ExtDeadlineMissed).is_empty());
    }

    #[test]
    fn missed_deadline_in_auto_mode_escalates() {
        let (mut proxy, _) = Proxy::new();
        proxy.handle(Event::SetAuto);
        let actions = proxy.handle(Event::ExtDeadlineMissed);
        assert_eq!(
            actions,
            vec![Action::RequestReboot, Action::SetDeviceTimeout(WATCHDOG_REDUCED_TIMEOUT_SECS), Action::Halt]
        );
    }

    #[test]
    fn ext_ping_resets_deadline_only_in_auto_mode() {
        let (mut proxy, _) = Proxy::new();
        assert!(proxy.handle(Event::ExtPing).is_empty());
        proxy.handle(Event::SetAuto);
        assert_eq!(proxy.handle(Event::ExtPing), vec![Action::ArmExtDeadline(WATCHDOG_EXTERNAL_PING_DEADLINE)]);
    }

    #[test]
    fn mode_round_trips_through_set_noauto() {
        let (mut proxy, _) = Proxy::new();
        proxy.handle(Event::SetAuto);
        assert_eq!(proxy.mode(), Mode::Auto);
        proxy.handle(Event::SetNoAuto);
        assert_eq!(proxy.mode(), Mode::NoAuto);
    }

    #[test]
    fn device_records_calls_the_proxy_requests() {
        let mut device = MockDevice::new();
        device.expect_ping().times(1).returning(|| Ok(()));
        device.expect_set_timeout().withf(|s| *s == WATCHDOG_REDUCED_TIMEOUT_SECS).times(1).returning(|_| Ok(()));
        let mut reboot = MockRebootRequester::new();
        reboot.expect_reboot().withf(|r| *r == RebootReason::Thermal).times(1).return_const(());

        let (mut proxy, _) = Proxy::new();
        proxy.handle(Event::SetAuto);
        for action in proxy.handle(Event::WdTick) {
            match action {
                Action::PingDevice => device.ping().unwrap(),
                Action::ArmExtDeadline(_) => {}
                Action::SetDeviceTimeout(secs) => device.set_timeout(secs).unwrap(),
                Action::RequestReboot => reboot.reboot(RebootReason::Thermal),
                Action::Halt => {}
            }
        }
        for action in proxy.handle(Event::ExtDeadlineMissed) {
            match action {
                Action::PingDevice => device.ping().unwrap(),
                Action::ArmExtDeadline(_) => {}
                Action::SetDeviceTimeout(secs) => device.set_timeout(secs).unwrap(),
                Action::RequestReboot => reboot.reboot(RebootReason::Thermal),
                Action::Halt => {}
            }
        }
    }
}
