//! Netif observer (C2).
//!
//! Subscribes to per-ifname up/down/exists changes and fans them out to
//! every interested component (chiefly the LOP core's MLD-to-vif
//! resolution in [`crate::lop`]). Same dual-implementation shape as the
//! teacher's `monitor::net`/`monitor::cpu`: a `trait Monitor: Stream<...>`
//! with a real backend and a `Fake` test double, generalized here to a
//! `NetifObserver` trait over interface existence events instead of ping
//! RTT/CPU load.

use std::{
    collections::HashSet,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

const REPORT_CAPACITY: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A netdev's existence flipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetifEvent {
    /// The netdev name (e.g. `wlan0-5`), never a logical/MLD name — the
    /// observer only ever reports on constituent vifs and plain netdevs.
    pub ifname: String,
    /// `true` if the netdev now exists, `false` if it was removed.
    pub exists: bool,
}

/// Observes interface existence changes.
pub trait NetifObserver: futures::Stream<Item = NetifEvent> + Send + Unpin {
    /// Returns a new handle to the same underlying observer.
    fn clone_observer(&self) -> Box<dyn NetifObserver>;

    /// Whether `ifname` is currently known to exist.
    fn exists(&self, ifname: &str) -> bool;
}

/// Real netif observer, polling `/sys/class/net`.
pub struct Linux {
    known: Arc<Mutex<HashSet<String>>>,
    event_tx: broadcast::Sender<NetifEvent>,
    event_rx: BroadcastStream<NetifEvent>,
}

impl Linux {
    /// Spawns the poller and returns a handle to it.
    #[must_use]
    pub fn spawn() -> Self {
        Self::spawn_from(Path::new("/sys/class/net"))
    }

    fn spawn_from(sysfs_net: &Path) -> Self {
        let (event_tx, event_rx) = broadcast::channel(REPORT_CAPACITY);
        let known: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(read_ifnames(sysfs_net)));
        let known2 = Arc::clone(&known);
        let event_tx2 = event_tx.clone();
        let sysfs_net = sysfs_net.to_path_buf();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                let current = read_ifnames(&sysfs_net);
                let mut known = known2.lock().unwrap();
                for added in current.difference(&known) {
                    let _ = event_tx2.send(NetifEvent { ifname: added.clone(), exists: true });
                }
                for removed in known.difference(&current) {
                    let _ = event_tx2.send(NetifEvent { ifname: removed.clone(), exists: false });
                }
                *known = current;
            }
        });
        Self { known, event_tx: event_tx.clone(), event_rx: BroadcastStream::new(event_rx) }
    }
}

fn read_ifnames(sysfs_net: &Path) -> HashSet<String> {
    std::fs::read_dir(sysfs_net)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect()
        })
        .unwrap_or_default()
}

impl NetifObserver for Linux {
    fn clone_observer(&self) -> Box<dyn NetifObserver> {
        Box::new(Self {
            known: Arc::clone(&self.known),
            event_tx: self.event_tx.clone(),
            event_rx: BroadcastStream::new(self.event_tx.subscribe()),
        })
    }

    fn exists(&self, ifname: &str) -> bool {
        self.known.lock().unwrap().contains(ifname)
    }
}

impl futures::Stream for Linux {
    type Item = NetifEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.event_rx).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

/// A netif observer whose existence set is mutated directly by tests.
pub struct Fake {
    known: Arc<Mutex<HashSet<String>>>,
    event_tx: broadcast::Sender<NetifEvent>,
    event_rx: BroadcastStream<NetifEvent>,
}

impl Fake {
    /// Creates a fake observer with no known interfaces.
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = broadcast::channel(REPORT_CAPACITY);
        Self { known: Arc::new(Mutex::new(HashSet::new())), event_tx, event_rx: BroadcastStream::new(event_rx) }
    }

    /// Sets whether `ifname` exists, broadcasting an event on change.
    pub fn set_exists(&self, ifname: &str, exists: bool) {
        let mut known = self.known.lock().unwrap();
        let changed = if exists { known.insert(ifname.to_string()) } else { known.remove(ifname) };
        if changed {
            let _ = self.event_tx.send(NetifEvent { ifname: ifname.to_string(), exists });
        }
    }
}

impl Default for Fake {
    fn default() -> Self {
        Self::new()
    }
}

impl NetifObserver for Fake {
    fn clone_observer(&self) -> Box<dyn NetifObserver> {
        Box::new(Self {
            known: Arc::clone(&self.known),
            event_tx: self.event_tx.clone(),
            event_rx: BroadcastStream::new(self.event_tx.subscribe()),
        })
    }

    fn exists(&self, ifname: &str) -> bool {
        self.known.lock().unwrap().contains(ifname)
    }
}

impl futures::Stream for Fake {
    type Item = NetifEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.event_rx).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}
