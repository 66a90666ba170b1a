//! MAP-T/MAP-E derivation engine (C4, MDE).
//!
//! Pure bit-math over IPv6 prefixes: given a rule list and an end-user
//! IPv6 prefix, derive the PSID, MAP IPv4 address, MAP IPv6 address, and
//! the port-set ranges this CE is allowed to use, per RFC 7597/7599. The
//! only side effect is an optional platform-apply step injected through
//! [`PlatformApply`] — same "capability interface, inject by value"
//! treatment the rest of this crate gives callback-laden adapters.

use eyre::Result;
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

mod bits;

pub use bits::PortSet;

/// MAP mode: stateless NAT64-free translation, or encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    MapT,
    MapE,
}

/// An explicit PSID override carried by a [`Rule`], as opposed to one
/// derived from the EA-bits split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplicitPsid {
    pub psid: u16,
    pub psid_len: u8,
}

/// A single Basic/Forwarding Mapping Rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub ipv6_prefix: Ipv6Net,
    pub ipv4_prefix: Ipv4Net,
    pub ea_len: u8,
    /// `None` ⇒ the default of 6 applies. An explicit `Some(0)` is a
    /// valid, distinct configuration — see `psid_offset` in DESIGN.md.
    pub psid_offset: Option<u8>,
    pub dmr: Ipv6Addr,
    pub is_fmr: bool,
    pub explicit_psid: Option<ExplicitPsid>,
}

impl Rule {
    fn psid_offset(&self) -> u8 {
        self.psid_offset.unwrap_or(crate::consts::MAP_DEFAULT_PSID_OFFSET)
    }
}

/// An ordered set of rules; lookup is longest-IPv6-prefix match.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Longest-prefix match against `end_user_prefix`; ties broken by
    /// insertion order (first candidate of the winning length wins).
    fn find_bmr(&self, end_user_prefix: &Ipv6Net) -> Option<&Rule> {
        // `max_by_key` keeps the *last* of equal-key elements; ties on
        // prefix length must keep the first encountered (stable) per
        // spec, so fold by hand instead.
        let mut best: Option<&Rule> = None;
        for rule in &self.rules {
            if !prefix_contains(&rule.ipv6_prefix, end_user_prefix) {
                continue;
            }
            let better = match best {
                Some(b) => rule.ipv6_prefix.prefix_len() > b.ipv6_prefix.prefix_len(),
                None => true,
            };
            if better {
                best = Some(rule);
            }
        }
        best
    }
}

fn prefix_contains(outer: &Ipv6Net, inner: &Ipv6Net) -> bool {
    inner.prefix_len() >= outer.prefix_len() && outer.contains(&inner.network())
}

/// Derived state produced by a successful [`Map::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct Derived {
    bmr: Rule,
    psid: u16,
    psid_len: u8,
    map_ipv4: Ipv4Addr,
    map_ipv6: Ipv6Addr,
    port_sets: Vec<PortSet>,
}

/// A MAP object bound to an output interface.
pub struct Map {
    ifname: String,
    r#type: Type,
    rules: RuleList,
    end_user_prefix: Option<Ipv6Net>,
    legacy_draft3: bool,
    uplink: Option<String>,
    derived: Option<Derived>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no rule in the rule list matches the end-user prefix")]
    NoMatchingRule,
    #[error("rule field out of range: {0}")]
    InvalidRule(&'static str),
    #[error("end-user prefix is not contained by the matched rule's IPv6 prefix")]
    PrefixMismatch,
    #[error("map_apply called before an end-user prefix was set")]
    MissingEndUserPrefix,
    #[error("MAP type not set before apply")]
    UnsupportedType,
    #[error("platform apply failed: {0}")]
    PlatformApplyFailed(#[source] eyre::Error),
    #[error("map_apply was not called, or failed; derived state is unavailable")]
    NotApplied,
}

/// Injected side effect for the platform-specific half of `map_apply`:
/// tunnel/nat46 setup and NDP-proxy configuration.
pub trait PlatformApply: Send {
    fn apply(&mut self, ifname: &str, r#type: Type, derived_ipv4: Ipv4Addr, derived_ipv6: Ipv6Addr) -> Result<()>;
    fn teardown(&mut self, ifname: &str) -> Result<()>;
}

/// A platform adapter that does nothing; used when no platform apply is
/// wired in (tests, or a dry-run daemon invocation).
#[derive(Debug, Default)]
pub struct NoopPlatform;

impl PlatformApply for NoopPlatform {
    fn apply(&mut self, _ifname: &str, _type: Type, _derived_ipv4: Ipv4Addr, _derived_ipv6: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    fn teardown(&mut self, _ifname: &str) -> Result<()> {
        Ok(())
    }
}

/// Real platform adapter. Like [`crate::sampler::Linux`] and
/// [`crate::agents::thermal::Linux`], the actual tunnel/nat46/NDP-proxy
/// shell-outs are board-specific and logged rather than run; swap this for
/// a board integration without touching [`PlatformApply`]'s contract.
#[derive(Debug, Default)]
pub struct Linux;

impl PlatformApply for Linux {
    fn apply(&mut self, ifname: &str, r#type: Type, derived_ipv4: Ipv4Addr, derived_ipv6: Ipv6Addr) -> Result<()> {
        tracing::info!(ifname, ?r#type, %derived_ipv4, %derived_ipv6, "map platform apply (no-op platform backend)");
        Ok(())
    }

    fn teardown(&mut self, ifname: &str) -> Result<()> {
        tracing::info!(ifname, "map platform teardown (no-op platform backend)");
        Ok(())
    }
}

impl Map {
    /// Creates an empty MAP object bound to `ifname`.
    #[must_use]
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
            r#type: Type::MapT,
            rules: RuleList::new(),
            end_user_prefix: None,
            legacy_draft3: false,
            uplink: None,
            derived: None,
        }
    }

    pub fn set_type(&mut self, r#type: Type) {
        self.r#type = r#type;
    }

    /// Replaces the rule list, clearing any previously matched BMR.
    pub fn set_rules(&mut self, rules: RuleList) {
        self.rules = rules;
        self.derived = None;
    }

    /// Convenience for a single-rule list.
    pub fn set_bmr(&mut self, rule: Rule) {
        let mut rules = RuleList::new();
        rules.push(rule);
        self.set_rules(rules);
    }

    pub fn set_end_user_prefix(&mut self, prefix: Ipv6Net) {
        self.end_user_prefix = Some(prefix);
        self.derived = None;
    }

    pub fn set_legacy_draft3(&mut self, legacy: bool) {
        self.legacy_draft3 = legacy;
    }

    pub fn set_uplink(&mut self, ifname: Option<String>) {
        self.uplink = ifname;
    }

    /// Validates, matches a BMR, derives state, and optionally applies it
    /// to the platform. Either fully succeeds (derived state populated,
    /// `cfg_applied` true) or leaves the object exactly as it was before
    /// the call.
    pub fn apply(&mut self, platform: &mut dyn PlatformApply) -> Result<(), Error> {
        let end_user_prefix = self.end_user_prefix.ok_or(Error::MissingEndUserPrefix)?;
        let bmr = self.rules.find_bmr(&end_user_prefix).cloned().ok_or(Error::NoMatchingRule)?;
        if !prefix_contains(&bmr.ipv6_prefix, &end_user_prefix) {
            return Err(Error::PrefixMismatch);
        }

        let v4offset = if self.legacy_draft3 { 9 } else { 10 };
        let derived_fields = bits::derive(&bmr, &end_user_prefix, v4offset)?;

        platform
            .apply(&self.ifname, self.r#type, derived_fields.map_ipv4, derived_fields.map_ipv6)
            .map_err(Error::PlatformApplyFailed)?;

        self.derived = Some(Derived {
            bmr,
            psid: derived_fields.psid,
            psid_len: derived_fields.psid_len,
            map_ipv4: derived_fields.map_ipv4,
            map_ipv6: derived_fields.map_ipv6,
            port_sets: derived_fields.port_sets,
        });
        Ok(())
    }

    /// Undo-applies platform state and clears derived state.
    pub fn del(&mut self, platform: &mut dyn PlatformApply) -> Result<(), Error> {
        if self.derived.take().is_some() {
            platform.teardown(&self.ifname).map_err(Error::PlatformApplyFailed)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn cfg_applied(&self) -> bool {
        self.derived.is_some()
    }

    pub fn rule_matched(&self) -> Result<&Rule, Error> {
        self.derived.as_ref().map(|d| &d.bmr).ok_or(Error::NotApplied)
    }

    pub fn psid(&self) -> Result<u16, Error> {
        self.derived.as_ref().map(|d| d.psid).ok_or(Error::NotApplied)
    }

    pub fn psid_len(&self) -> Result<u8, Error> {
        self.derived.as_ref().map(|d| d.psid_len).ok_or(Error::NotApplied)
    }

    pub fn ipv4(&self) -> Result<Ipv4Addr, Error> {
        self.derived.as_ref().map(|d| d.map_ipv4).ok_or(Error::NotApplied)
    }

    pub fn ipv6(&self) -> Result<Ipv6Addr, Error> {
        self.derived.as_ref().map(|d| d.map_ipv6).ok_or(Error::NotApplied)
    }

    pub fn port_sets(&self) -> Result<&[PortSet], Error> {
        self.derived.as_ref().map(|d| d.port_sets.as_slice()).ok_or(Error::NotApplied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc7599_rule() -> Rule {
        Rule {
            ipv6_prefix: "2001:db8::/40".parse().unwrap(),
            ipv4_prefix: "192.0.2.0/24".parse().unwrap(),
            ea_len: 16,
            psid_offset: Some(6),
            dmr: "2001:db8:ffff::".parse().unwrap(),
            is_fmr: true,
            explicit_psid: None,
        }
    }

    #[test]
    fn rfc7599_worked_example() {
        let mut map = Map::new("wan0");
        map.set_type(Type::MapT);
        map.set_bmr(rfc7599_rule());
        map.set_end_user_prefix("2001:db8:0012:3400::/56".parse().unwrap());

        let mut platform = NoopPlatform;
        map.apply(&mut platform).unwrap();

        assert!(map.cfg_applied());
        assert_eq!(map.psid_len().unwrap(), 8);
        assert_eq!(map.psid().unwrap(), 0x34);
        assert_eq!(map.ipv4().unwrap(), Ipv4Addr::new(192, 0, 2, 18));
        assert_eq!(map.ipv6().unwrap(), "2001:db8:12:3400:0:c000:212:3400".parse::<Ipv6Addr>().unwrap());

        let port_sets = map.port_sets().unwrap();
        assert_eq!(port_sets.len(), 63);
        // See bits.rs's rfc7599_first_port_set_matches_raw_psid_formula for
        // why this is 1232..1235 and not a normalized-PSID-based guess.
        assert_eq!(port_sets[0], PortSet { from: 1232, to: 1235 });
    }

    #[test]
    fn apply_without_end_user_prefix_fails() {
        let mut map = Map::new("wan0");
        map.set_bmr(rfc7599_rule());
        let mut platform = NoopPlatform;
        assert!(matches!(map.apply(&mut platform), Err(Error::MissingEndUserPrefix)));
    }

    #[test]
    fn apply_with_no_matching_rule_fails() {
        let mut map = Map::new("wan0");
        map.set_bmr(rfc7599_rule());
        map.set_end_user_prefix("2001:db9::/56".parse().unwrap());
        let mut platform = NoopPlatform;
        assert!(matches!(map.apply(&mut platform), Err(Error::NoMatchingRule)));
    }

    #[test]
    fn getters_fail_before_apply() {
        let map = Map::new("wan0");
        assert!(matches!(map.psid(), Err(Error::NotApplied)));
    }

    #[test]
    fn idempotent_reapply_yields_identical_state() {
        let mut map = Map::new("wan0");
        map.set_bmr(rfc7599_rule());
        map.set_end_user_prefix("2001:db8:0012:3400::/56".parse().unwrap());
        let mut platform = NoopPlatform;

        map.apply(&mut platform).unwrap();
        let first = (map.psid().unwrap(), map.ipv4().unwrap(), map.ipv6().unwrap());

        map.del(&mut platform).unwrap();
        map.apply(&mut platform).unwrap();
        let second = (map.psid().unwrap(), map.ipv4().unwrap(), map.ipv6().unwrap());

        assert_eq!(first, second);
    }

    #[test]
    fn longest_prefix_match_picks_more_specific_rule() {
        let mut rules = RuleList::new();
        rules.push(Rule { ipv6_prefix: "2001:db8::/32".parse().unwrap(), ..rfc7599_rule() });
        rules.push(rfc7599_rule()); // /40, more specific
        let bmr = rules.find_bmr(&"2001:db8:0012:3400::/56".parse().unwrap()).unwrap();
        assert_eq!(bmr.ipv6_prefix.prefix_len(), 40);
    }

    #[test]
    fn tied_prefix_length_picks_the_first_inserted_rule() {
        let mut rules = RuleList::new();
        rules.push(Rule { dmr: "2001:db8:ffff::1".parse().unwrap(), ..rfc7599_rule() });
        rules.push(Rule { dmr: "2001:db8:ffff::2".parse().unwrap(), ..rfc7599_rule() });
        let bmr = rules.find_bmr(&"2001:db8:0012:3400::/56".parse().unwrap()).unwrap();
        assert_eq!(bmr.dmr, "2001:db8:ffff::1".parse::<Ipv6Addr>().unwrap(), "a tie must keep the first encountered rule");
    }
}
