//! Ipset objm loader (supplement, spec §6).
//!
//! Grounded on `nfm_ipset.c`'s `nfm_osn_ipset_type_str` enumeration and the
//! "local" ipset kind, whose values come from an `objm` JSON file on disk
//! rather than the config-store row directly. Idempotent `ipset
//! create`/`ipset add` shell-outs use the same `Command` + `wrap_err` idiom
//! as [`crate::firewall`].

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// `osn_ipset_type` string enumeration, verbatim from `nfm_osn_ipset_type_str`.
pub const IPSET_TYPES: &[&str] = &[
    "bitmap:ip",
    "bitmap:ip,mac",
    "bitmap:port",
    "hash:ip",
    "hash:mac",
    "hash:ip,mac",
    "hash:net",
    "hash:net,net",
    "hash:ip,port",
    "hash:net,port",
    "hash:ip,port,ip",
    "hash:ip,port,net",
    "hash:ip,mark",
    "hash:net,port,net",
    "hash:net,iface",
    "list:set",
];

/// Characters an ipset `options` string is allowed to contain, beyond
/// alphanumerics and whitespace: spec §6's `/,.:-` grammar.
const OPTIONS_EXTRA_CHARS: &str = "/,.:-";

#[derive(Debug, Error)]
pub enum Error {
    #[error("ipset type {found:?} does not match row type {expected:?}")]
    TypeMismatch { expected: String, found: String },
    #[error("ipset options string contains disallowed character {0:?}")]
    InvalidOptions(char),
    #[error("unknown ipset type {0:?}")]
    UnknownType(String),
    #[error("malformed objm document: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("ipset shell-out failed: {0}")]
    ShellOut(#[source] eyre::Error),
}

/// The `objm` JSON document format, loaded per `local` ipset row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Objm {
    pub r#type: String,
    pub options: String,
    pub values: Vec<String>,
}

impl Objm {
    /// Parses and validates an objm document against the row's declared
    /// `type`: `type` must be one of [`IPSET_TYPES`] and match the row's
    /// type exactly, and `options` must only contain whitespace and
    /// [`OPTIONS_EXTRA_CHARS`] besides alphanumerics.
    pub fn parse(json: &str, row_type: &str) -> Result<Self, Error> {
        let objm: Objm = serde_json::from_str(json).map_err(Error::InvalidJson)?;
        if !IPSET_TYPES.contains(&objm.r#type.as_str()) {
            return Err(Error::UnknownType(objm.r#type.clone()));
        }
        if objm.r#type != row_type {
            return Err(Error::TypeMismatch { expected: row_type.to_string(), found: objm.r#type.clone() });
        }
        validate_options(&objm.options)?;
        Ok(objm)
    }
}

fn validate_options(options: &str) -> Result<(), Error> {
    for c in options.chars() {
        if !(c.is_alphanumeric() || c.is_whitespace() || OPTIONS_EXTRA_CHARS.contains(c)) {
            return Err(Error::InvalidOptions(c));
        }
    }
    Ok(())
}

/// Issues the `ipset create`/`ipset add` shell-outs to bring the kernel
/// ipset named `name` in line with `objm`. Idempotent: `ipset create` uses
/// `-exist`, and every value is (re-)added with `-exist` as well, so
/// repeated calls with the same `objm` are no-ops at the kernel level.
pub async fn apply(name: &str, objm: &Objm) -> Result<(), Error> {
    let mut create_args = vec!["create".to_string(), name.to_string(), objm.r#type.clone(), "-exist".to_string()];
    create_args.extend(objm.options.split_whitespace().map(str::to_string));
    run(&create_args).await?;
    for value in &objm.values {
        run(&["add".to_string(), name.to_string(), value.clone(), "-exist".to_string()]).await?;
    }
    Ok(())
}

async fn run(args: &[String]) -> Result<(), Error> {
    let output = Command::new("ipset")
        .args(args)
        .output()
        .await
        .wrap_err("spawning `ipset`")
        .map_err(Error::ShellOut)?;
    if !output.status.success() {
        return Err(Error::ShellOut(eyre::eyre!(
            "`ipset {}` exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_objm_document() {
        let json = r#"{"type": "hash:ip", "options": "family inet hashsize 1024", "values": ["10.0.0.1", "10.0.0.2"]}"#;
        let objm = Objm::parse(json, "hash:ip").unwrap();
        assert_eq!(objm.values.len(), 2);
    }

    #[test]
    fn rejects_type_mismatch_against_the_row() {
        let json = r#"{"type": "hash:ip", "options": "", "values": []}"#;
        assert!(matches!(Objm::parse(json, "hash:net"), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn rejects_unknown_ipset_type() {
        let json = r#"{"type": "not-a-real-type", "options": "", "values": []}"#;
        assert!(matches!(Objm::parse(json, "not-a-real-type"), Err(Error::UnknownType(_))));
    }

    #[test]
    fn rejects_options_with_disallowed_characters() {
        let json = r#"{"type": "hash:ip", "options": "family inet; rm -rf /", "values": []}"#;
        assert!(matches!(Objm::parse(json, "hash:ip"), Err(Error::InvalidOptions(';'))));
    }

    #[test]
    fn allows_the_documented_punctuation_grammar() {
        validate_options("family inet hashsize 1024 maxelem 65536, foo/bar:baz-qux.1").unwrap();
    }
}
