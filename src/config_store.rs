//! Config-store adapter (C7).
//!
//! `spec.md` treats the configuration/state store as an external
//! collaborator and only describes the row shapes the core touches. This
//! module is the seam that turns a row mutation into the typed in-process
//! API calls the rest of the crate exposes, grounded on the teacher's
//! `Config` struct (`src/config.rs`): `serde` + `schemars` row types with
//! `#[serde(rename_all = ...)]` to match the store's column naming, plus
//! the Design Notes' "typed row structs + update monitor enum" guidance
//! for turning a watch stream into `New`/`Modify`/`Delete` events.

use crate::{agents::thermal, firewall, ipset, lop, map, report_bus::ReportBus};
use eyre::{Result, WrapErr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single row mutation, as an update-monitor would deliver it: enough
/// context (`old` alongside `new`) to diff and touch only what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<T> {
    New(T),
    Modify { old: T, new: T },
    Delete(T),
}

/// How a stream accumulates observations across a report period, mirrored
/// from [`lop::Sampling`] with `serde`/`schemars` attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum SamplingRow {
    #[default]
    Separate,
    Merge,
}

impl From<SamplingRow> for lop::Sampling {
    fn from(row: SamplingRow) -> Self {
        match row {
            SamplingRow::Separate => Self::Separate,
            SamplingRow::Merge => Self::Merge,
        }
    }
}

/// One row of the latency-observation stream table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct StreamRow {
    pub name: String,
    pub if_name: String,
    pub report_ms: u32,
    pub poll_ms: u32,
    pub min: bool,
    pub max: bool,
    pub avg: bool,
    pub last: bool,
    pub num_pkts: bool,
    pub dscp: bool,
    #[serde(default)]
    pub sampling: SamplingRow,
    pub report_topic: String,
}

/// MAP mode, mirrored from [`map::Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MapTypeRow {
    MapT,
    MapE,
}

impl From<MapTypeRow> for map::Type {
    fn from(row: MapTypeRow) -> Self {
        match row {
            MapTypeRow::MapT => Self::MapT,
            MapTypeRow::MapE => Self::MapE,
        }
    }
}

/// One row of the MAP rule table: a Basic/Forwarding Mapping Rule bound to
/// an output interface, plus the end-user prefix it should be applied
/// against once known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct MapRuleRow {
    pub if_name: String,
    pub map_type: MapTypeRow,
    pub ipv6_prefix: String,
    pub ipv4_prefix: String,
    pub ea_len: u8,
    pub psid_offset: Option<u8>,
    pub dmr: String,
    pub is_fmr: bool,
    pub end_user_prefix: Option<String>,
    #[serde(default)]
    pub legacy_draft3: bool,
    pub uplink: Option<String>,
}

impl MapRuleRow {
    fn rule(&self) -> Result<map::Rule> {
        Ok(map::Rule {
            ipv6_prefix: self.ipv6_prefix.parse().wrap_err("parsing ipv6_prefix")?,
            ipv4_prefix: self.ipv4_prefix.parse().wrap_err("parsing ipv4_prefix")?,
            ea_len: self.ea_len,
            psid_offset: self.psid_offset,
            dmr: self.dmr.parse().wrap_err("parsing dmr")?,
            is_fmr: self.is_fmr,
            explicit_psid: None,
        })
    }
}

/// A single thermal-table state row: the per-source entry threshold,
/// per-source radio TX-chainmask, and fan RPM, mirrored from
/// [`thermal::ThermalTableRow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct ThermalStateRow {
    pub temp_thresh: Vec<i32>,
    pub radio_txchainmask: Vec<u32>,
    pub fan_rpm: u32,
}

impl From<&ThermalStateRow> for thermal::ThermalTableRow {
    fn from(row: &ThermalStateRow) -> Self {
        Self {
            temp_thresh: row.temp_thresh.clone(),
            radio_txchainmask: row.radio_txchainmask.clone(),
            fan_rpm: row.fan_rpm,
        }
    }
}

/// The full thermal table, one row per thermal state, lowest state first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ThermalTableRow {
    pub states: Vec<ThermalStateRow>,
}

impl ThermalTableRow {
    fn table(&self) -> Vec<thermal::ThermalTableRow> {
        self.states.iter().map(Into::into).collect()
    }
}

/// IP family, mirrored from [`firewall::Family`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FirewallFamilyRow {
    Ipv4,
    Ipv6,
}

impl From<FirewallFamilyRow> for firewall::Family {
    fn from(row: FirewallFamilyRow) -> Self {
        match row {
            FirewallFamilyRow::Ipv4 => Self::Ipv4,
            FirewallFamilyRow::Ipv6 => Self::Ipv6,
        }
    }
}

/// One row of the firewall rule table, mirrored from [`firewall::Rule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct FirewallRuleRow {
    pub name: String,
    pub enable: bool,
    pub priority: i32,
    pub family: FirewallFamilyRow,
    pub table: String,
    pub chain: String,
    pub target: String,
    pub rule: String,
}

impl From<&FirewallRuleRow> for firewall::Rule {
    fn from(row: &FirewallRuleRow) -> Self {
        Self {
            name: row.name.clone(),
            enable: row.enable,
            priority: row.priority,
            family: row.family.into(),
            table: row.table.clone(),
            chain: row.chain.clone(),
            target: row.target.clone(),
            rule: row.rule.clone(),
        }
    }
}

/// One row of the "local" ipset table: identifies the kernel set and the
/// objm document on disk that defines its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct IpsetRow {
    pub name: String,
    pub r#type: String,
    pub objm_path: String,
}

/// Turns config-store row mutations into calls against the rest of the
/// crate's components. One method per table `spec.md` names.
pub trait Adapter: Send {
    async fn handle_stream(&mut self, update: Update<StreamRow>);
    async fn handle_map_rule(&mut self, update: Update<MapRuleRow>);
    async fn handle_thermal_table(&mut self, update: Update<ThermalTableRow>);
    async fn handle_firewall_rule(&mut self, update: Update<FirewallRuleRow>);
    async fn handle_ipset(&mut self, update: Update<IpsetRow>);
}

/// The adapter actually wired into the running daemon: a [`lop::Handle`]
/// for streams, one [`map::Map`] per MAP-configured interface, the thermal
/// loop's port handle, and a [`firewall::Registry`] applied as commands are
/// computed.
pub struct LiveAdapter<B> {
    node_id: String,
    bus: B,
    lop: lop::Handle,
    stream_ids: HashMap<String, lop::StreamId>,
    maps: HashMap<String, map::Map>,
    platform: Box<dyn map::PlatformApply>,
    thermal: agentwire::agent::Handle<thermal::Loop>,
    firewall: firewall::Registry,
}

impl<B: ReportBus + Clone + Send + 'static> LiveAdapter<B> {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        bus: B,
        lop: lop::Handle,
        platform: Box<dyn map::PlatformApply>,
        thermal: agentwire::agent::Handle<thermal::Loop>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            bus,
            lop,
            stream_ids: HashMap::new(),
            maps: HashMap::new(),
            platform,
            thermal,
            firewall: firewall::Registry::new(),
        }
    }

    async fn configure_stream(&self, id: lop::StreamId, row: &StreamRow) {
        self.lop.stream_set_ifname(id, &row.if_name, true).await;
        self.lop.stream_set_poll_ms(id, row.poll_ms).await;
        self.lop.stream_set_report_ms(id, row.report_ms).await;
        self.lop.stream_set_kind_min(id, row.min).await;
        self.lop.stream_set_kind_max(id, row.max).await;
        self.lop.stream_set_kind_avg(id, row.avg).await;
        self.lop.stream_set_kind_last(id, row.last).await;
        self.lop.stream_set_kind_num_pkts(id, row.num_pkts).await;
        self.lop.stream_set_dscp(id, row.dscp).await;
        self.lop.stream_set_sampling(id, row.sampling.into()).await;
        let sink = crate::report_bus::BusSink::new(self.node_id.clone(), row.report_topic.clone(), self.bus.clone());
        self.lop.stream_set_report_fn(id, Box::new(sink)).await;
    }
}

impl<B: ReportBus + Clone + Send + 'static> Adapter for LiveAdapter<B> {
    async fn handle_stream(&mut self, update: Update<StreamRow>) {
        match update {
            Update::New(row) => {
                let id = self.lop.stream_new().await;
                self.configure_stream(id, &row).await;
                self.stream_ids.insert(row.name.clone(), id);
            }
            Update::Modify { old, new } => {
                let Some(&id) = self.stream_ids.get(&old.name) else { return };
                if old.if_name != new.if_name {
                    self.lop.stream_set_ifname(id, &old.if_name, false).await;
                }
                self.configure_stream(id, &new).await;
            }
            Update::Delete(row) => {
                if let Some(id) = self.stream_ids.remove(&row.name) {
                    self.lop.stream_drop(id).await;
                }
            }
        }
    }

    async fn handle_map_rule(&mut self, update: Update<MapRuleRow>) {
        match update {
            Update::New(row) | Update::Modify { new: row, .. } => {
                let rule = match row.rule() {
                    Ok(rule) => rule,
                    Err(err) => {
                        tracing::warn!(%err, if_name = %row.if_name, "config_store: invalid MAP rule row");
                        return;
                    }
                };
                let map = self.maps.entry(row.if_name.clone()).or_insert_with(|| map::Map::new(row.if_name.clone()));
                map.set_type(row.map_type.into());
                map.set_bmr(rule);
                map.set_legacy_draft3(row.legacy_draft3);
                map.set_uplink(row.uplink.clone());
                if let Some(prefix) = &row.end_user_prefix {
                    match prefix.parse() {
                        Ok(prefix) => map.set_end_user_prefix(prefix),
                        Err(err) => {
                            tracing::warn!(%err, if_name = %row.if_name, "config_store: invalid end_user_prefix");
                            return;
                        }
                    }
                }
                if let Err(err) = map.apply(self.platform.as_mut()) {
                    tracing::warn!(%err, if_name = %row.if_name, "config_store: MAP apply failed");
                }
            }
            Update::Delete(row) => {
                if let Some(mut map) = self.maps.remove(&row.if_name) {
                    if let Err(err) = map.del(self.platform.as_mut()) {
                        tracing::warn!(%err, if_name = %row.if_name, "config_store: MAP teardown failed");
                    }
                }
            }
        }
    }

    async fn handle_thermal_table(&mut self, update: Update<ThermalTableRow>) {
        let row = match update {
            Update::New(row) | Update::Modify { new: row, .. } => row,
            Update::Delete(_) => return,
        };
        if self.thermal.send(thermal::Input::SetThermalTable(row.table())).await.is_err() {
            tracing::warn!("config_store: thermal loop has exited");
        }
    }

    async fn handle_firewall_rule(&mut self, update: Update<FirewallRuleRow>) {
        let (name, commands) = match &update {
            Update::New(row) | Update::Modify { new: row, .. } => {
                (row.name.clone(), self.firewall.upsert(row.into()))
            }
            Update::Delete(row) => (row.name.clone(), self.firewall.delete(&row.name)),
        };
        if let Err(err) = firewall::apply(&name, commands).await {
            tracing::warn!(%err, "config_store: firewall apply failed");
        }
    }

    async fn handle_ipset(&mut self, update: Update<IpsetRow>) {
        let row = match update {
            Update::New(row) | Update::Modify { new: row, .. } => row,
            Update::Delete(_) => return,
        };
        let json = match tokio::fs::read_to_string(&row.objm_path).await {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(%err, path = %row.objm_path, "config_store: reading objm document failed");
                return;
            }
        };
        let objm = match ipset::Objm::parse(&json, &row.r#type) {
            Ok(objm) => objm,
            Err(err) => {
                tracing::warn!(%err, name = %row.name, "config_store: invalid objm document");
                return;
            }
        };
        if let Err(err) = ipset::apply(&row.name, &objm).await {
            tracing::warn!(%err, name = %row.name, "config_store: ipset apply failed");
        }
    }
}

/// An [`Adapter`] that records every update it receives, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct Fake {
    pub streams: Vec<Update<StreamRow>>,
    pub map_rules: Vec<Update<MapRuleRow>>,
    pub thermal_tables: Vec<Update<ThermalTableRow>>,
    pub firewall_rules: Vec<Update<FirewallRuleRow>>,
    pub ipsets: Vec<Update<IpsetRow>>,
}

#[cfg(test)]
impl Adapter for Fake {
    async fn handle_stream(&mut self, update: Update<StreamRow>) {
        self.streams.push(update);
    }

    async fn handle_map_rule(&mut self, update: Update<MapRuleRow>) {
        self.map_rules.push(update);
    }

    async fn handle_thermal_table(&mut self, update: Update<ThermalTableRow>) {
        self.thermal_tables.push(update);
    }

    async fn handle_firewall_rule(&mut self, update: Update<FirewallRuleRow>) {
        self.firewall_rules.push(update);
    }

    async fn handle_ipset(&mut self, update: Update<IpsetRow>) {
        self.ipsets.push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_row(name: &str) -> StreamRow {
        StreamRow {
            name: name.to_string(),
            if_name: "eth0".into(),
            report_ms: 60_000,
            poll_ms: 1_000,
            min: true,
            max: true,
            avg: false,
            last: false,
            num_pkts: true,
            dscp: false,
            sampling: SamplingRow::Separate,
            report_topic: "LM.report".into(),
        }
    }

    #[tokio::test]
    async fn fake_adapter_records_stream_updates_in_order() {
        let mut fake = Fake::default();
        fake.handle_stream(Update::New(stream_row("wan"))).await;
        fake.handle_stream(Update::Delete(stream_row("wan"))).await;
        assert_eq!(fake.streams.len(), 2);
        assert!(matches!(fake.streams[0], Update::New(_)));
        assert!(matches!(fake.streams[1], Update::Delete(_)));
    }

    #[test]
    fn map_rule_row_parses_into_a_valid_rule() {
        let row = MapRuleRow {
            if_name: "wan0".into(),
            map_type: MapTypeRow::MapT,
            ipv6_prefix: "2001:db8::/40".into(),
            ipv4_prefix: "192.0.2.0/24".into(),
            ea_len: 16,
            psid_offset: Some(6),
            dmr: "2001:db8:ffff::".into(),
            is_fmr: true,
            end_user_prefix: Some("2001:db8:0012:3400::/56".into()),
            legacy_draft3: false,
            uplink: None,
        };
        let rule = row.rule().unwrap();
        assert_eq!(rule.ea_len, 16);
        assert!(rule.is_fmr);
    }

    #[test]
    fn map_rule_row_rejects_malformed_prefix() {
        let mut row = MapRuleRow {
            if_name: "wan0".into(),
            map_type: MapTypeRow::MapT,
            ipv6_prefix: "not-a-prefix".into(),
            ipv4_prefix: "192.0.2.0/24".into(),
            ea_len: 16,
            psid_offset: None,
            dmr: "2001:db8:ffff::".into(),
            is_fmr: true,
            end_user_prefix: None,
            legacy_draft3: false,
            uplink: None,
        };
        assert!(row.rule().is_err());
        row.ipv6_prefix = "2001:db8::/40".into();
        assert!(row.rule().is_ok());
    }

    #[test]
    fn thermal_table_row_converts_every_state() {
        let row = ThermalTableRow {
            states: vec![
                ThermalStateRow { temp_thresh: vec![40], radio_txchainmask: vec![0b1111], fan_rpm: 1000 },
                ThermalStateRow { temp_thresh: vec![60], radio_txchainmask: vec![0b0111], fan_rpm: 2000 },
            ],
        };
        let table = row.table();
        assert_eq!(table.len(), 2);
        assert_eq!(table[1].fan_rpm, 2000);
    }
}
