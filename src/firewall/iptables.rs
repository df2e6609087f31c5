use async_trait::async_trait;
use tokio::process::Command;

use super::{parse_port_spec, Firewall, FirewallError, FirewallRule, PortSpec};

const CHAIN_NAME: &str = "zapret_output";

/// Firewall backend driving the `iptables` and `ip6tables` CLIs.
///
/// Maintains a custom chain in the `filter` table on both families with a
/// jump from `OUTPUT`. The legacy toolchain has no dual-stack table, so
/// every operation runs once per family.
pub struct IptablesFirewall {
    initialized: bool,
}

impl IptablesFirewall {
    pub fn new() -> Self {
        Self { initialized: false }
    }

    async fn run(&self, binary: &str, args: &[String]) -> Result<(), FirewallError> {
        let output = Command::new(binary).args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FirewallError::Command {
                command: format!("{binary} {}", args.join(" ")),
                stderr,
            });
        }

        Ok(())
    }

    async fn rule_exists(&self, binary: &str, chain: &str, spec: &[String]) -> bool {
        let mut args = vec![
            "-t".to_string(),
            "filter".to_string(),
            "-C".to_string(),
            chain.to_string(),
        ];
        args.extend_from_slice(spec);
        Command::new(binary)
            .args(&args)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the match-and-target argument list for one rule.
///
/// Single ports and ranges use plain `--dport` (range as `A:B`);
/// multi-element specs use the multiport match, iptables' set construct.
fn rule_spec(rule: &FirewallRule) -> Result<Vec<String>, FirewallError> {
    let mut spec = vec!["-p".to_string(), rule.protocol.as_str().to_string()];

    if let Some(ref iface) = rule.interface {
        spec.push("-o".to_string());
        spec.push(iface.clone());
    }

    let ports = parse_port_spec(&rule.ports)?;
    match ports.as_slice() {
        [PortSpec::Single(port)] => {
            spec.push("--dport".to_string());
            spec.push(port.to_string());
        }
        [PortSpec::Range(start, end)] => {
            spec.push("--dport".to_string());
            spec.push(format!("{start}:{end}"));
        }
        many => {
            let elements: Vec<String> = many
                .iter()
                .map(|p| match p {
                    PortSpec::Single(port) => port.to_string(),
                    PortSpec::Range(start, end) => format!("{start}:{end}"),
                })
                .collect();
            spec.push("-m".to_string());
            spec.push("multiport".to_string());
            spec.push("--dports".to_string());
            spec.push(elements.join(","));
        }
    }

    spec.extend([
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        rule.comment.clone(),
        "-j".to_string(),
        "NFQUEUE".to_string(),
        "--queue-num".to_string(),
        rule.queue_num.to_string(),
        "--queue-bypass".to_string(),
    ]);

    Ok(spec)
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such file")
        || stderr.contains("does not exist")
        || stderr.contains("No chain/target/match")
}

#[async_trait]
impl Firewall for IptablesFirewall {
    fn backend_name(&self) -> &'static str {
        "iptables"
    }

    async fn setup(&mut self) -> Result<(), FirewallError> {
        for binary in ["iptables", "ip6tables"] {
            // Chain may already exist from a prior unclean shutdown.
            let new_chain: Vec<String> = ["-t", "filter", "-N", CHAIN_NAME]
                .iter()
                .map(|s| s.to_string())
                .collect();
            match self.run(binary, &new_chain).await {
                Ok(()) => {}
                Err(FirewallError::Command { stderr, .. })
                    if stderr.contains("File exists") || stderr.contains("already exists") => {}
                Err(err) => return Err(err),
            }

            let jump: Vec<String> = ["-j", CHAIN_NAME].iter().map(|s| s.to_string()).collect();
            if !self.rule_exists(binary, "OUTPUT", &jump).await {
                let mut append = vec![
                    "-t".to_string(),
                    "filter".to_string(),
                    "-A".to_string(),
                    "OUTPUT".to_string(),
                ];
                append.extend(jump);
                self.run(binary, &append).await?;
            }
        }

        self.initialized = true;
        Ok(())
    }

    async fn add_rule(&mut self, rule: &FirewallRule) -> Result<(), FirewallError> {
        if !self.initialized {
            return Err(FirewallError::NotSetup);
        }

        let spec = rule_spec(rule)?;
        tracing::debug!(queue = rule.queue_num, spec = %spec.join(" "), "adding iptables rule");

        for binary in ["iptables", "ip6tables"] {
            let mut args = vec![
                "-t".to_string(),
                "filter".to_string(),
                "-A".to_string(),
                CHAIN_NAME.to_string(),
            ];
            args.extend(spec.iter().cloned());
            self.run(binary, &args).await?;
        }

        Ok(())
    }

    async fn remove_all(&mut self) -> Result<(), FirewallError> {
        let mut errors = Vec::new();

        for binary in ["iptables", "ip6tables"] {
            let steps: [Vec<&str>; 3] = [
                vec!["-t", "filter", "-F", CHAIN_NAME],
                vec!["-t", "filter", "-D", "OUTPUT", "-j", CHAIN_NAME],
                vec!["-t", "filter", "-X", CHAIN_NAME],
            ];

            for step in steps {
                let args: Vec<String> = step.iter().map(|s| s.to_string()).collect();
                match self.run(binary, &args).await {
                    Ok(()) => {}
                    Err(FirewallError::Command { stderr, .. }) if is_not_found(&stderr) => {}
                    Err(err) => errors.push(err.to_string()),
                }
            }
        }

        self.initialized = false;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FirewallError::Cleanup(errors.join("; ")))
        }
    }

    fn close(&mut self) {}
}
