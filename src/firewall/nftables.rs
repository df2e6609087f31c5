use async_trait::async_trait;
use tokio::process::Command;

use super::{parse_port_spec, Firewall, FirewallError, FirewallRule, PortSpec};

/// Firewall backend driving the `nft` CLI.
///
/// Owns one `inet`-family table (dual-stack) with a single output-hook
/// chain; teardown deletes the table, which cascades to everything the
/// backend created.
pub struct NftablesFirewall {
    table_name: String,
    chain_name: String,
    initialized: bool,
}

impl NftablesFirewall {
    pub fn new(table_name: String, chain_name: String) -> Self {
        Self {
            table_name,
            chain_name,
            initialized: false,
        }
    }

    async fn run_nft(&self, cmd: &str) -> Result<(), FirewallError> {
        let output = Command::new("nft").arg(cmd).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FirewallError::Command {
                command: format!("nft {cmd}"),
                stderr,
            });
        }

        Ok(())
    }

    /// Render the match-and-verdict expression for a rule.
    ///
    /// Shape: `[oifname "IFACE"] proto dport SPEC counter queue num N bypass`.
    /// A multi-element port spec becomes an anonymous set so the kernel
    /// matches it as one lookup.
    fn rule_expr(&self, rule: &FirewallRule) -> Result<String, FirewallError> {
        let mut parts = Vec::new();

        if let Some(ref iface) = rule.interface {
            parts.push(format!("oifname \"{iface}\""));
        }

        let specs = parse_port_spec(&rule.ports)?;
        let dport = match specs.as_slice() {
            [PortSpec::Single(port)] => port.to_string(),
            [PortSpec::Range(start, end)] => format!("{start}-{end}"),
            many => {
                let elements: Vec<String> = many
                    .iter()
                    .map(|spec| match spec {
                        PortSpec::Single(port) => port.to_string(),
                        PortSpec::Range(start, end) => format!("{start}-{end}"),
                    })
                    .collect();
                format!("{{ {} }}", elements.join(", "))
            }
        };

        parts.push(format!("{} dport {}", rule.protocol, dport));
        parts.push(format!(
            "counter queue num {} bypass comment \"{}\"",
            rule.queue_num, rule.comment
        ));

        Ok(parts.join(" "))
    }
}

#[async_trait]
impl Firewall for NftablesFirewall {
    fn backend_name(&self) -> &'static str {
        "nftables"
    }

    async fn setup(&mut self) -> Result<(), FirewallError> {
        if self.initialized {
            return Ok(());
        }

        // A table of the same name may survive an unclean shutdown; tear
        // it down so the chain is rebuilt from scratch.
        let _ = self
            .run_nft(&format!("delete table inet {}", self.table_name))
            .await;

        self.run_nft(&format!("add table inet {}", self.table_name))
            .await?;
        self.run_nft(&format!(
            "add chain inet {} {} {{ type filter hook output priority 0; }}",
            self.table_name, self.chain_name
        ))
        .await?;

        self.initialized = true;
        Ok(())
    }

    async fn add_rule(&mut self, rule: &FirewallRule) -> Result<(), FirewallError> {
        if !self.initialized {
            return Err(FirewallError::NotSetup);
        }

        let expr = self.rule_expr(rule)?;
        tracing::debug!(queue = rule.queue_num, expr = %expr, "adding nftables rule");

        self.run_nft(&format!(
            "add rule inet {} {} {}",
            self.table_name, self.chain_name, expr
        ))
        .await
    }

    async fn remove_all(&mut self) -> Result<(), FirewallError> {
        let result = self
            .run_nft(&format!("delete table inet {}", self.table_name))
            .await;
        self.initialized = false;

        match result {
            Err(FirewallError::Command { ref stderr, .. })
                if stderr.contains("No such file") || stderr.contains("does not exist") =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Protocol;

    fn backend() -> NftablesFirewall {
        NftablesFirewall::new("zapretunix".to_string(), "output".to_string())
    }

    fn rule(protocol: Protocol, ports: &str, queue_num: u16, interface: Option<&str>) -> FirewallRule {
        FirewallRule {
            protocol,
            ports: vec![ports.to_string()],
            queue_num,
            interface: interface.map(str::to_string),
            comment: "Added by zapret".to_string(),
        }
    }

    #[test]
    fn single_port_uses_scalar_match() {
        let expr = backend()
            .rule_expr(&rule(Protocol::Tcp, "443", 0, None))
            .unwrap();
        assert_eq!(
            expr,
            "tcp dport 443 counter queue num 0 bypass comment \"Added by zapret\""
        );
    }

    #[test]
    fn range_renders_as_interval() {
        let expr = backend()
            .rule_expr(&rule(Protocol::Udp, "1024-65535", 2, None))
            .unwrap();
        assert!(expr.contains("udp dport 1024-65535"));
        assert!(expr.contains("queue num 2 bypass"));
    }

    #[test]
    fn mixed_ports_render_as_anonymous_set() {
        let expr = backend()
            .rule_expr(&rule(Protocol::Tcp, "80,443,8080-8090", 1, None))
            .unwrap();
        assert!(expr.contains("tcp dport { 80, 443, 8080-8090 }"));
    }

    #[test]
    fn interface_adds_oifname_predicate() {
        let expr = backend()
            .rule_expr(&rule(Protocol::Tcp, "443", 0, Some("eth0")))
            .unwrap();
        assert!(expr.starts_with("oifname \"eth0\" tcp dport 443"));
    }

    #[test]
    fn any_interface_has_no_oifname() {
        let expr = backend()
            .rule_expr(&rule(Protocol::Tcp, "443", 0, None))
            .unwrap();
        assert!(!expr.contains("oifname"));
    }

    #[tokio::test]
    async fn add_rule_requires_setup() {
        let err = backend()
            .add_rule(&rule(Protocol::Tcp, "443", 0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::NotSetup));
    }
}
