//! Pure bit-math for MAP derivation: PSID extraction, MAP IPv4/IPv6
//! construction, and port-set enumeration (spec §4.2 steps 1–6).
//!
//! The port-set formula needs one subtlety inherited directly from
//! `lnx_map_calculate`: the loop uses a pre-normalization, left-aligned
//! PSID bit pattern (`psid << (16 - psid_len)`), not the normalized PSID
//! value returned by the public getters. Using the normalized value there
//! instead produces a different (wrong) first range; see `DESIGN.md`.

use super::{Error, Rule};
use ipnet::Ipv6Net;
use std::net::{Ipv4Addr, Ipv6Addr};

/// An inclusive port range, `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub from: u16,
    pub to: u16,
}

pub(super) struct Derived {
    pub psid: u16,
    pub psid_len: u8,
    pub map_ipv4: Ipv4Addr,
    pub map_ipv6: Ipv6Addr,
    pub port_sets: Vec<PortSet>,
}

fn extract_bits(bytes: &[u8; 16], start_bit: u32, len_bits: u32) -> Option<u128> {
    if len_bits == 0 {
        return Some(0);
    }
    if start_bit.checked_add(len_bits)? > 128 {
        return None;
    }
    let value = u128::from_be_bytes(*bytes);
    let shift = 128 - start_bit - len_bits;
    let mask: u128 = if len_bits >= 128 { u128::MAX } else { (1u128 << len_bits) - 1 };
    Some((value >> shift) & mask)
}

fn zero_beyond(bytes: &mut [u8; 16], keep_bits: u32) {
    if keep_bits >= 128 {
        return;
    }
    let value = u128::from_be_bytes(*bytes);
    let mask: u128 = if keep_bits == 0 { 0 } else { u128::MAX << (128 - keep_bits) };
    *bytes = (value & mask).to_be_bytes();
}

pub(super) fn derive(rule: &Rule, end_user_prefix: &Ipv6Net, v4offset: usize) -> Result<Derived, Error> {
    let p6 = u32::from(rule.ipv6_prefix.prefix_len());
    let p4 = u32::from(rule.ipv4_prefix.prefix_len());
    let ea = u32::from(rule.ea_len);
    let o = u32::from(rule.psid_offset());
    let e_len = u32::from(end_user_prefix.prefix_len());

    if ea > u32::from(crate::consts::MAP_MAX_EA_LEN) {
        return Err(Error::InvalidRule("ea_len must be <= MAP_MAX_EA_LEN"));
    }

    let (psid_len, explicit_psid) = match rule.explicit_psid {
        Some(explicit) if explicit.psid_len > 0 => (explicit.psid_len, Some(explicit.psid)),
        _ => {
            let computed = i64::from(ea) - (32 - i64::from(p4));
            (u8::try_from(computed.max(0)).map_err(|_| Error::InvalidRule("psid_len overflow"))?, None)
        }
    };

    if psid_len > crate::consts::MAP_MAX_PSID_LEN {
        return Err(Error::InvalidRule("psid_len must be <= MAP_MAX_PSID_LEN"));
    }
    if u32::from(psid_len) > ea {
        return Err(Error::InvalidRule("ea_len must be >= psid_len"));
    }
    if p6 + ea > 128 {
        return Err(Error::InvalidRule("ipv6_prefix.len + ea_len exceeds 128 bits"));
    }

    let e_bytes = end_user_prefix.network().octets();

    let psid = match explicit_psid {
        Some(value) => value,
        None => {
            let start_bit = p6 + ea - u32::from(psid_len);
            let raw = extract_bits(&e_bytes, start_bit, u32::from(psid_len))
                .ok_or(Error::InvalidRule("psid bit offset out of range"))?;
            u16::try_from(raw).map_err(|_| Error::InvalidRule("psid value overflow"))?
        }
    };

    let suffix_len = ea - u32::from(psid_len);
    let raw_suffix =
        extract_bits(&e_bytes, p6, suffix_len).ok_or(Error::InvalidRule("ipv4 suffix bit offset out of range"))?;
    let ipv4_host_bits = 32 - p4;
    let suffix_value = if suffix_len > ipv4_host_bits {
        (raw_suffix >> (suffix_len - ipv4_host_bits)) as u32
    } else {
        raw_suffix as u32
    };
    let prefix_u32: u32 = rule.ipv4_prefix.network().into();
    let map_ipv4 = Ipv4Addr::from(prefix_u32 | suffix_value);

    let mut ipv6_bytes = e_bytes;
    zero_beyond(&mut ipv6_bytes, (p6 + ea).min(e_len));
    ipv6_bytes[v4offset..v4offset + 4].copy_from_slice(&map_ipv4.octets());
    let psid_field: u16 = if psid_len > 0 { psid << (16 - u32::from(psid_len)) } else { 0 };
    ipv6_bytes[v4offset + 4..v4offset + 6].copy_from_slice(&psid_field.to_be_bytes());
    let map_ipv6 = Ipv6Addr::from(ipv6_bytes);

    let port_sets = if psid_len > 0 {
        port_sets(psid, psid_len, o)
    } else {
        Vec::new()
    };

    Ok(Derived { psid, psid_len, map_ipv4, map_ipv6, port_sets })
}

fn port_sets(psid: u16, psid_len: u8, o: u32) -> Vec<PortSet> {
    let Some(j_bits) = 16u32.checked_sub(o).and_then(|v| v.checked_sub(u32::from(psid_len))) else {
        tracing::warn!(o, psid_len, "psid_offset + psid_len exceeds 16 bits; no port sets derived");
        return Vec::new();
    };

    // The port-set loop uses the pre-normalization, left-aligned PSID bit
    // pattern, not the normalized `psid` value the getters expose.
    let port_set_base = u32::from(psid) << (16 - u32::from(psid_len));

    let k_range: Vec<u32> = if o == 0 { vec![0] } else { (1..(1u32 << o)).collect() };

    let mut sets = Vec::new();
    for k in k_range {
        let mut start = (k << (16 - o)) | (port_set_base >> o);
        let end = start + (1u32 << j_bits) - 1;
        if start == 0 {
            start = 1;
        }
        if start <= end {
            let Ok(from) = u16::try_from(start) else { break };
            let Ok(to) = u16::try_from(end) else { break };
            sets.push(PortSet { from, to });
            if sets.len() == crate::consts::MAP_MAX_PORT_SETS {
                tracing::warn!("max number of port sets reached");
                break;
            }
        }
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ExplicitPsid;

    fn rule(explicit_psid: Option<ExplicitPsid>) -> Rule {
        Rule {
            ipv6_prefix: "2001:db8::/40".parse().unwrap(),
            ipv4_prefix: "192.0.2.0/24".parse().unwrap(),
            ea_len: 16,
            psid_offset: Some(6),
            dmr: "2001:db8:ffff::".parse().unwrap(),
            is_fmr: true,
            explicit_psid,
        }
    }

    #[test]
    fn rfc7599_first_port_set_matches_raw_psid_formula() {
        let end_user_prefix: Ipv6Net = "2001:db8:0012:3400::/56".parse().unwrap();
        let derived = derive(&rule(None), &end_user_prefix, 10).unwrap();
        assert_eq!(derived.psid, 0x34);
        assert_eq!(derived.psid_len, 8);
        assert_eq!(derived.port_sets.len(), 63);
        // port_set_base = 0x34 << 8 = 0x3400; k=1: start = (1<<10)|(0x3400>>6) = 1024|208 = 1232
        assert_eq!(derived.port_sets[0], PortSet { from: 1232, to: 1235 });
    }

    #[test]
    fn explicit_psid_overrides_derived_len() {
        let end_user_prefix: Ipv6Net = "2001:db8:0012:3400::/56".parse().unwrap();
        let explicit = ExplicitPsid { psid: 0x12, psid_len: 4 };
        let derived = derive(&rule(Some(explicit)), &end_user_prefix, 10).unwrap();
        assert_eq!(derived.psid, 0x12);
        assert_eq!(derived.psid_len, 4);
    }

    #[test]
    fn port_sets_are_pairwise_disjoint_and_in_range() {
        let end_user_prefix: Ipv6Net = "2001:db8:0012:3400::/56".parse().unwrap();
        let derived = derive(&rule(None), &end_user_prefix, 10).unwrap();
        for set in &derived.port_sets {
            assert!(set.from >= 1 && set.from <= set.to);
        }
        for window in derived.port_sets.windows(2) {
            assert!(window[0].to < window[1].from);
        }
    }
}
