//! Firewall rule registry (C9).
//!
//! spec §6/§8 scenario 6: a name-keyed, idempotent rule upsert/delete table.
//! Per the Design Notes' nft-vs-iptables-race discussion, this resolves the
//! open question in favor of serializing all mutation through the registry
//! itself — `iptables -C`-style check-then-set races never happen because
//! the registry, not a shell round-trip, is the single source of truth for
//! "does this rule already exist". Shelling out only ever applies the
//! minimal diff needed to reconcile kernel state with the registry.

use eyre::{Result, WrapErr};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::process::Command;

/// IP family a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    fn binary(self) -> &'static str {
        match self {
            Self::Ipv4 => "iptables",
            Self::Ipv6 => "ip6tables",
        }
    }
}

/// A single firewall rule row, keyed by `name` (spec §6's `Netfilter`-style
/// table row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub enable: bool,
    pub priority: i32,
    pub family: Family,
    pub table: String,
    pub chain: String,
    pub target: String,
    /// Space-separated predicates, e.g. `"-o wan0"`.
    pub rule: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("rule upsert failed for {name}: {source}")]
    RuleUpsertFailed { name: String, #[source] source: eyre::Error },
}

/// In-process table of firewall rules. Upsert/delete mutate the table and
/// return the argv-level commands that must run to reconcile kernel state;
/// applying those commands is the caller's job (usually immediately after,
/// via [`Registry::apply`]).
#[derive(Debug, Default)]
pub struct Registry {
    rules: BTreeMap<String, Rule>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert keyed by `rule.name`: inserting the same rule twice
    /// leaves exactly one entry and is a no-op on the kernel side the second
    /// time (the commands returned the second call are the no-op delta,
    /// i.e. none, since `old == new`).
    ///
    /// Returns the argv commands needed to reconcile kernel state with the
    /// new table: a delete of the old incarnation (if one existed and
    /// differs) followed by an add of the new one.
    pub fn upsert(&mut self, rule: Rule) -> Vec<Vec<String>> {
        let mut commands = Vec::new();
        if let Some(old) = self.rules.get(&rule.name) {
            if *old == rule {
                return commands;
            }
            commands.push(delete_argv(old));
        }
        if rule.enable {
            commands.push(add_argv(&rule));
        }
        self.rules.insert(rule.name.clone(), rule);
        commands
    }

    /// Removes `name`; a no-op (empty command list) if absent.
    pub fn delete(&mut self, name: &str) -> Vec<Vec<String>> {
        match self.rules.remove(name) {
            Some(rule) if rule.enable => vec![delete_argv(&rule)],
            _ => Vec::new(),
        }
    }

    /// Rules currently in the table, ordered by `priority` then `name`
    /// (spec §4 "priority ordering").
    #[must_use]
    pub fn ordered(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.values().collect();
        rules.sort_by_key(|r| (r.priority, r.name.clone()));
        rules
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }
}

fn add_argv(rule: &Rule) -> Vec<String> {
    argv(rule, "-A")
}

fn delete_argv(rule: &Rule) -> Vec<String> {
    argv(rule, "-D")
}

fn argv(rule: &Rule, action: &str) -> Vec<String> {
    let mut argv = vec!["-t".to_string(), rule.table.clone(), action.to_string(), rule.chain.clone()];
    argv.extend(rule.rule.split_whitespace().map(str::to_string));
    argv.push("-j".to_string());
    argv.push(rule.target.clone());
    let mut full = vec![rule.family.binary().to_string()];
    full.extend(argv);
    full
}

/// Runs the argv commands [`Registry::upsert`]/[`Registry::delete`]
/// returned, via `tokio::process::Command` + `spawn_blocking`-free async
/// spawn (the teacher's shell-out idiom minus the `spawn_blocking`, since
/// `tokio::process` already runs children off-thread).
///
/// # Errors
///
/// Returns [`Error::RuleUpsertFailed`] on the first command that fails to
/// spawn or exits non-zero; later commands are not attempted.
pub async fn apply(name: &str, commands: Vec<Vec<String>>) -> Result<(), Error> {
    for mut argv in commands {
        if argv.is_empty() {
            continue;
        }
        let binary = argv.remove(0);
        run(&binary, &argv).await.map_err(|source| Error::RuleUpsertFailed { name: name.to_string(), source })?;
    }
    Ok(())
}

async fn run(binary: &str, args: &[String]) -> Result<()> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .wrap_err_with(|| format!("spawning `{binary}`"))?;
    if !output.status.success() {
        eyre::bail!(
            "`{binary} {}` exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wan_masquerade() -> Rule {
        Rule {
            name: "NM.wan0.ipv4.nat".into(),
            enable: true,
            priority: 100,
            family: Family::Ipv4,
            table: "nat".into(),
            chain: "NM_NAT".into(),
            target: "MASQUERADE".into(),
            rule: "-o wan0".into(),
        }
    }

    #[test]
    fn upsert_is_idempotent_on_name() {
        let mut registry = Registry::new();
        let first = registry.upsert(wan_masquerade());
        assert_eq!(first.len(), 1);
        let second = registry.upsert(wan_masquerade());
        assert!(second.is_empty(), "re-upserting an identical rule should issue no commands");
        assert_eq!(registry.ordered().len(), 1);
    }

    #[test]
    fn delete_of_absent_rule_is_a_no_op() {
        let mut registry = Registry::new();
        assert!(registry.delete("does.not.exist").is_empty());
    }

    #[test]
    fn changed_rule_deletes_old_then_adds_new() {
        let mut registry = Registry::new();
        registry.upsert(wan_masquerade());
        let mut changed = wan_masquerade();
        changed.priority = 50;
        let commands = registry.upsert(changed);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0][2], "-D");
        assert_eq!(commands[1][2], "-A");
    }

    #[test]
    fn ordered_sorts_by_priority() {
        let mut registry = Registry::new();
        let mut low = wan_masquerade();
        low.name = "low".into();
        low.priority = 200;
        let mut high = wan_masquerade();
        high.name = "high".into();
        high.priority = 10;
        registry.upsert(low);
        registry.upsert(high);
        let ordered = registry.ordered();
        assert_eq!(ordered[0].name, "high");
        assert_eq!(ordered[1].name, "low");
    }
}
