mod iptables;
mod nftables;

pub use iptables::IptablesFirewall;
pub use nftables::NftablesFirewall;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::strategy::Protocol;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("invalid port specification: {0:?}")]
    InvalidPorts(String),
    #[error("firewall not set up, call setup first")]
    NotSetup,
    #[error("cleanup errors: {0}")]
    Cleanup(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A normalized rule ready for installation, derived 1:1 from a parsed
/// strategy rule.
#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub protocol: Protocol,

    /// Port tokens; each token may itself contain commas and ranges,
    /// which the backend re-parses.
    pub ports: Vec<String>,

    /// NFQUEUE number packets are diverted to
    pub queue_num: u16,

    /// Outbound interface to match, `None` for all interfaces
    pub interface: Option<String>,

    pub comment: String,
}

/// Firewall backend contract.
///
/// `setup` must tolerate structures left behind by an unclean shutdown,
/// `add_rule` appends in call order, and `remove_all` is best-effort: it
/// attempts every teardown step and reports accumulated failures.
#[async_trait]
pub trait Firewall: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn setup(&mut self) -> Result<(), FirewallError>;

    async fn add_rule(&mut self, rule: &FirewallRule) -> Result<(), FirewallError>;

    async fn remove_all(&mut self) -> Result<(), FirewallError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Nftables,
    Iptables,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Nftables => "nftables",
            BackendKind::Iptables => "iptables",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nftables" => Ok(BackendKind::Nftables),
            "iptables" => Ok(BackendKind::Iptables),
            other => Err(format!(
                "invalid firewall backend: {other} (must be 'nftables' or 'iptables')"
            )),
        }
    }
}

/// Settings a backend is constructed from.
#[derive(Debug, Clone)]
pub struct FirewallSettings {
    pub backend: BackendKind,
    pub table_name: String,
    pub chain_name: String,
}

/// Pick the backend implementation from the configured name. This is the
/// single dispatch boundary; everything downstream talks to the trait.
pub fn new_firewall(settings: &FirewallSettings) -> Box<dyn Firewall> {
    match settings.backend {
        BackendKind::Nftables => Box::new(NftablesFirewall::new(
            settings.table_name.clone(),
            settings.chain_name.clone(),
        )),
        BackendKind::Iptables => Box::new(IptablesFirewall::new()),
    }
}

/// One element of a port specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

/// Flatten port tokens into parsed elements. Tokens may be single ports
/// (`443`), inclusive ranges (`1024-2048`), or comma-separated mixtures.
pub fn parse_port_spec(ports: &[String]) -> Result<Vec<PortSpec>, FirewallError> {
    let mut specs = Vec::new();

    for token in ports {
        for part in token.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((start, end)) = part.split_once('-') {
                let start = parse_port(start.trim(), part)?;
                let end = parse_port(end.trim(), part)?;
                specs.push(PortSpec::Range(start, end));
            } else {
                specs.push(PortSpec::Single(parse_port(part, part)?));
            }
        }
    }

    if specs.is_empty() {
        return Err(FirewallError::InvalidPorts(ports.join(",")));
    }

    Ok(specs)
}

fn parse_port(value: &str, context: &str) -> Result<u16, FirewallError> {
    value
        .parse::<u16>()
        .map_err(|_| FirewallError::InvalidPorts(context.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_port() {
        let specs = parse_port_spec(&["443".to_string()]).unwrap();
        assert_eq!(specs, vec![PortSpec::Single(443)]);
    }

    #[test]
    fn parse_range() {
        let specs = parse_port_spec(&["1024-2048".to_string()]).unwrap();
        assert_eq!(specs, vec![PortSpec::Range(1024, 2048)]);
    }

    #[test]
    fn parse_mixed_comma_list() {
        let specs = parse_port_spec(&["80,443,8080-8090".to_string()]).unwrap();
        assert_eq!(
            specs,
            vec![
                PortSpec::Single(80),
                PortSpec::Single(443),
                PortSpec::Range(8080, 8090),
            ]
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_port_spec(&["https".to_string()]).is_err());
        assert!(parse_port_spec(&["".to_string()]).is_err());
        assert!(parse_port_spec(&["70000".to_string()]).is_err());
    }

    #[test]
    fn backend_kind_round_trips() {
        assert_eq!("nftables".parse::<BackendKind>(), Ok(BackendKind::Nftables));
        assert_eq!("iptables".parse::<BackendKind>(), Ok(BackendKind::Iptables));
        assert!("pf".parse::<BackendKind>().is_err());
    }
}
