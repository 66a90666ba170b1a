//! End-to-end MAP-T derivation through the public `map` API, using the
//! RFC 7599 §7.2 worked example spec.md cites as an acceptance scenario.

use osp_agent::map::{Map, NoopPlatform, Rule, Type};
use std::net::{Ipv4Addr, Ipv6Addr};

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
fn full_derivation_matches_the_worked_example() {
    let mut map = Map::new("wan0");
    map.set_type(Type::MapT);
    map.set_bmr(rfc7599_rule());
    map.set_end_user_prefix("2001:db8:0012:3400::/56".parse().unwrap());

    let mut platform = NoopPlatform;
    map.apply(&mut platform).expect("a longest-prefix BMR exists and every field validates");

    assert_eq!(map.psid_len().unwrap(), 8);
    assert_eq!(map.psid().unwrap(), 0x34);
    assert_eq!(map.ipv4().unwrap(), Ipv4Addr::new(192, 0, 2, 18));
    assert_eq!(map.ipv6().unwrap(), "2001:db8:12:3400:0:c000:212:3400".parse::<Ipv6Addr>().unwrap());

    let port_sets = map.port_sets().unwrap();
    assert_eq!(port_sets.len(), 63);
    for window in port_sets.windows(2) {
        assert!(window[0].to < window[1].from, "port sets must be pairwise disjoint and ascending");
    }
    for set in port_sets {
        assert!(set.from >= 1 && set.from <= set.to && set.to <= 65535);
    }
}

#[test]
fn del_then_reapply_is_idempotent() {
    let mut map = Map::new("wan0");
    map.set_bmr(rfc7599_rule());
    map.set_end_user_prefix("2001:db8:0012:3400::/56".parse().unwrap());
    let mut platform = NoopPlatform;

    map.apply(&mut platform).unwrap();
    let before = (map.psid().unwrap(), map.ipv4().unwrap(), map.ipv6().unwrap());
    map.del(&mut platform).unwrap();
    assert!(!map.cfg_applied());
    map.apply(&mut platform).unwrap();
    let after = (map.psid().unwrap(), map.ipv4().unwrap(), map.ipv6().unwrap());

    assert_eq!(before, after);
}
