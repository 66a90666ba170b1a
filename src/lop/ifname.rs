//! Ifname refcounting and MLD (Multi-Link Device) netdev-set resolution.
//!
//! Enabling sampling on a logical ifname `L` does not directly enable the
//! sampler on `L`: it resolves `L` to the set of netdevs currently backing
//! it (its constituent vifs, if `L` is an MLD name with at least one
//! existing vif; otherwise `{L}`), diffs that set against whatever was
//! previously enabled for `L`, and applies only the delta. Re-architected
//! per the Design Notes from a shared, drop-callback-bearing refcounted
//! struct (`ifname`) into a structural refcount (a `HashSet<StreamId>` of
//! holders) plus an explicit `Mld` binding table the core owns outright.

use crate::sampler::Sampler;
use std::collections::{HashMap, HashSet};

use super::StreamId;

/// `vif -> mld` and its inverse, plus which vifs currently exist.
#[derive(Debug, Default)]
pub struct Mld {
    vif_to_mld: HashMap<String, String>,
    mld_to_vifs: HashMap<String, HashSet<String>>,
    existing: HashSet<String>,
}

impl Mld {
    pub fn set_vif_mld(&mut self, vif: &str, mld: Option<&str>) {
        if let Some(old_mld) = self.vif_to_mld.remove(vif) {
            if let Some(vifs) = self.mld_to_vifs.get_mut(&old_mld) {
                vifs.remove(vif);
            }
        }
        if let Some(mld) = mld {
            self.vif_to_mld.insert(vif.to_string(), mld.to_string());
            self.mld_to_vifs.entry(mld.to_string()).or_default().insert(vif.to_string());
        }
    }

    pub fn set_exists(&mut self, netdev: &str, exists: bool) {
        if exists {
            self.existing.insert(netdev.to_string());
        } else {
            self.existing.remove(netdev);
        }
    }

    /// Translates a sampler-reported netdev name to its MLD name, if one
    /// is bound; otherwise returns the name unchanged.
    #[must_use]
    pub fn translate(&self, netdev: &str) -> String {
        self.vif_to_mld.get(netdev).cloned().unwrap_or_else(|| netdev.to_string())
    }

    /// Every logical ifname whose netdev set could change because `vif`'s
    /// existence flipped: `vif`'s own MLD binding, if any.
    #[must_use]
    pub fn affected_logical_names(&self, vif: &str) -> Vec<String> {
        self.vif_to_mld.get(vif).cloned().into_iter().collect()
    }

    /// Resolves a logical ifname to the set of netdevs sampling should
    /// actually be enabled on.
    #[must_use]
    pub fn netdev_set(&self, logical: &str) -> HashSet<String> {
        if let Some(vifs) = self.mld_to_vifs.get(logical) {
            let existing: HashSet<String> =
                vifs.iter().filter(|vif| self.existing.contains(*vif)).cloned().collect();
            if !existing.is_empty() {
                return existing;
            }
        }
        HashSet::from([logical.to_string()])
    }
}

/// Per-logical-ifname state: which streams reference it, and which netdev
/// set the sampler currently has it enabled on.
#[derive(Debug, Default)]
struct Entry {
    holders: HashSet<StreamId>,
    applied: HashSet<String>,
}

/// Tracks which streams reference which logical ifnames, and reconciles
/// the sampler's actually-enabled netdev set whenever a reference count or
/// an MLD binding changes.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Adds or removes `stream`'s reference to `logical`. Returns whether
    /// the entry's netdev set should be (re)diffed against the sampler —
    /// i.e. always, except a no-op double-add/-remove.
    pub fn set_reference(&mut self, stream: StreamId, logical: &str, enabled: bool) -> bool {
        let entry = self.entries.entry(logical.to_string()).or_default();
        let changed = if enabled { entry.holders.insert(stream) } else { entry.holders.remove(&stream) };
        if !enabled && entry.holders.is_empty() {
            self.entries.remove(logical);
        }
        changed
    }

    /// Re-resolves `logical`'s netdev set from `mld` and applies the delta
    /// to `sampler`. Called after any reference-count change and after any
    /// MLD/existence change affecting `logical`.
    pub fn reconcile(&mut self, logical: &str, mld: &Mld, sampler: &mut dyn Sampler) -> eyre::Result<()> {
        let wanted = if self.entries.contains_key(logical) { mld.netdev_set(logical) } else { HashSet::new() };
        let entry = self.entries.entry(logical.to_string()).or_default();

        for removed in entry.applied.difference(&wanted).cloned().collect::<Vec<_>>() {
            sampler.set_ifname(&removed, false)?;
            entry.applied.remove(&removed);
        }
        for added in wanted.difference(&entry.applied).cloned().collect::<Vec<_>>() {
            sampler.set_ifname(&added, true)?;
            entry.applied.insert(added);
        }
        if entry.holders.is_empty() && entry.applied.is_empty() {
            self.entries.remove(logical);
        }
        Ok(())
    }

    /// All logical names any stream currently references.
    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::MockSampler;

    fn sid(n: u64) -> StreamId {
        StreamId(n)
    }

    #[test]
    fn plain_ifname_resolves_to_itself() {
        let mld = Mld::default();
        assert_eq!(mld.netdev_set("wlan0-5"), HashSet::from(["wlan0-5".to_string()]));
    }

    #[test]
    fn mld_fan_out_and_existence_tracking() {
        let mut mld = Mld::default();
        mld.set_vif_mld("wlan0-24", Some("mld0"));
        mld.set_vif_mld("wlan0-5", Some("mld0"));
        mld.set_exists("wlan0-24", true);
        mld.set_exists("wlan0-5", true);

        assert_eq!(mld.netdev_set("mld0"), HashSet::from(["wlan0-24".to_string(), "wlan0-5".to_string()]));

        mld.set_exists("wlan0-5", false);
        assert_eq!(mld.netdev_set("mld0"), HashSet::from(["wlan0-24".to_string()]));
    }

    #[test]
    fn mld_name_with_no_existing_vifs_falls_back_to_itself() {
        let mut mld = Mld::default();
        mld.set_vif_mld("wlan0-24", Some("mld0"));
        assert_eq!(mld.netdev_set("mld0"), HashSet::from(["mld0".to_string()]));
    }

    #[test]
    fn registry_diffs_delta_on_reconcile() {
        let mut registry = Registry::default();
        let mut mld = Mld::default();
        mld.set_vif_mld("wlan0-24", Some("mld0"));
        mld.set_vif_mld("wlan0-5", Some("mld0"));
        mld.set_exists("wlan0-24", true);

        let mut sampler = MockSampler::new();
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-24" && *e).times(1).returning(|_, _| Ok(()));
        registry.set_reference(sid(1), "mld0", true);
        registry.reconcile("mld0", &mld, &mut sampler).unwrap();

        let mut sampler = MockSampler::new();
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-5" && *e).times(1).returning(|_, _| Ok(()));
        mld.set_exists("wlan0-5", true);
        registry.reconcile("mld0", &mld, &mut sampler).unwrap();

        let mut sampler = MockSampler::new();
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-24" && !*e).times(1).returning(|_, _| Ok(()));
        sampler.expect_set_ifname().withf(|n, e| n == "wlan0-5" && !*e).times(1).returning(|_, _| Ok(()));
        registry.set_reference(sid(1), "mld0", false);
        registry.reconcile("mld0", &mld, &mut sampler).unwrap();
    }
}
