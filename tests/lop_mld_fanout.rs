//! Exercises spec.md §8 scenario 3 (MLD fan-out) through `lop::Core`'s
//! public contract, with a hand-written recording `Sampler` rather than
//! the crate-internal `mockall` double (integration tests can't reach
//! `#[cfg(test)]` items of the crate under test).

use eyre::Result;
use osp_agent::lop::Core;
use osp_agent::sampler::{Kind, Sampler};
use std::sync::{Arc, Mutex};

#[derive(Default, Clone)]
struct RecordingSampler {
    enabled: Arc<Mutex<Vec<String>>>,
}

impl Sampler for RecordingSampler {
    fn set_kind(&mut self, _kind: Kind, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn set_dscp(&mut self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn set_ifname(&mut self, ifname: &str, enabled: bool) -> Result<()> {
        let mut set = self.enabled.lock().unwrap();
        if enabled {
            if !set.iter().any(|n| n == ifname) {
                set.push(ifname.to_string());
            }
        } else {
            set.retain(|n| n != ifname);
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn enabling_an_mld_name_fans_out_to_its_existing_vifs() {
    let recording = RecordingSampler::default();
    let enabled = Arc::clone(&recording.enabled);
    let mut core = Core::new(Box::new(recording));

    core.set_vif_mld_if_name("wlan0-24", Some("mld0")).unwrap();
    core.set_vif_mld_if_name("wlan0-5", Some("mld0")).unwrap();
    core.on_netif_event("wlan0-24", true).unwrap();
    core.on_netif_event("wlan0-5", true).unwrap();

    let stream = core.stream_new();
    core.stream_set_ifname(stream, "mld0", true).unwrap();

    let mut current = enabled.lock().unwrap().clone();
    current.sort();
    assert_eq!(current, vec!["wlan0-24".to_string(), "wlan0-5".to_string()]);

    core.on_netif_event("wlan0-5", false).unwrap();
    let current = enabled.lock().unwrap().clone();
    assert_eq!(current, vec!["wlan0-24".to_string()]);

    core.on_netif_event("wlan0-5", true).unwrap();
    let mut current = enabled.lock().unwrap().clone();
    current.sort();
    assert_eq!(current, vec!["wlan0-24".to_string(), "wlan0-5".to_string()]);
}
