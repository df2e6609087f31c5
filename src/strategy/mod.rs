mod parser;

pub use parser::{ParseError, Parser};

use std::fmt;

/// Transport protocol matched by a filter rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule extracted from a strategy file
#[derive(Debug, Clone)]
pub struct ParsedRule {
    /// Matched protocol
    pub protocol: Protocol,

    /// Port specification as written in the file: a single port, a range
    /// `A-B`, or a comma-separated mixture. The firewall backend is the
    /// authority on this syntax; the parser keeps it opaque.
    pub ports: String,

    /// Arguments handed to the nfqws worker, cleaned but untokenized
    pub nfqws_args: String,

    /// Zero-based NFQUEUE number, dense over the whole strategy
    pub queue_num: u16,
}

/// An ordered set of parsed rules
#[derive(Debug, Clone)]
pub struct Strategy {
    pub rules: Vec<ParsedRule>,
}

/// Split a port specification into its elements.
///
/// Intentionally identity: the backends re-parse commas and ranges
/// themselves, and keeping a single opaque element here keeps them
/// authoritative.
pub fn split_ports(ports: &str) -> Vec<String> {
    vec![ports.to_string()]
}

/// Split an nfqws argument string on whitespace, honoring double-quoted
/// groups. Quote characters toggle grouping and are not emitted; empty
/// tokens are dropped.
pub fn tokenize_args(args: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in args.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_plain_args() {
        let tokens = tokenize_args("--dpi-desync=fake --dpi-desync-ttl=4");
        assert_eq!(tokens, vec!["--dpi-desync=fake", "--dpi-desync-ttl=4"]);
    }

    #[test]
    fn tokenize_preserves_quoted_groups() {
        let tokens = tokenize_args(r#"--hostlist="list with spaces.txt" --dpi-desync=split"#);
        assert_eq!(
            tokens,
            vec!["--hostlist=list with spaces.txt", "--dpi-desync=split"]
        );
    }

    #[test]
    fn tokenize_drops_empty_tokens() {
        let tokens = tokenize_args("  --dpi-desync=fake   --new  ");
        assert_eq!(tokens, vec!["--dpi-desync=fake", "--new"]);
    }

    #[test]
    fn split_ports_is_identity() {
        assert_eq!(split_ports("80,443,1024-2048"), vec!["80,443,1024-2048"]);
    }
}
