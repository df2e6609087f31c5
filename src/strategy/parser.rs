use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

use super::{ParsedRule, Protocol, Strategy};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read strategy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no filter rules found in strategy file")]
    EmptyStrategy,
}

/// Parses legacy `.bat` strategy files into an ordered rule list.
///
/// The dialect is line-oriented: comments and service directives are
/// skipped, `%BIN%`/`%LISTS%`/`%GameFilter%` variables substituted, and
/// each `--filter-tcp=`/`--filter-udp=` occurrence yields one rule.
pub struct Parser {
    bin_path: String,
    lists_path: String,
    game_filter: bool,
    game_filter_ports: String,
    filter_re: Regex,
}

impl Parser {
    pub fn new(
        bin_path: impl Into<String>,
        lists_path: impl Into<String>,
        game_filter_ports: impl Into<String>,
        game_filter: bool,
    ) -> Self {
        Self {
            bin_path: bin_path.into(),
            lists_path: lists_path.into(),
            game_filter,
            game_filter_ports: game_filter_ports.into(),
            filter_re: Regex::new(r"--filter-(tcp|udp)=([0-9,-]+)\s+(.*?)(?:--new|$)")
                .expect("filter regex is valid"),
        }
    }

    pub fn parse(&self, path: &Path) -> Result<Strategy, ParseError> {
        let text = fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut rules = Vec::new();
        let mut queue_num: u16 = 0;

        for line in logical_lines(&text) {
            if is_skip_line(&line) {
                continue;
            }

            let line = self.substitute_variables(&line);

            for caps in self.filter_re.captures_iter(&line) {
                let args = clean_args(caps.get(3).map_or("", |m| m.as_str()));
                if args.is_empty() {
                    continue;
                }

                let protocol = match &caps[1] {
                    "tcp" => Protocol::Tcp,
                    _ => Protocol::Udp,
                };
                let ports = caps[2].to_string();

                tracing::debug!(
                    protocol = protocol.as_str(),
                    ports = %ports,
                    queue = queue_num,
                    "parsed rule"
                );

                rules.push(ParsedRule {
                    protocol,
                    ports,
                    nfqws_args: args,
                    queue_num,
                });
                queue_num += 1;
            }
        }

        if rules.is_empty() {
            return Err(ParseError::EmptyStrategy);
        }

        Ok(Strategy { rules })
    }

    fn substitute_variables(&self, line: &str) -> String {
        let mut line = line
            .replace("%BIN%", &self.bin_path)
            .replace("%LISTS%", &self.lists_path);

        if self.game_filter {
            line = line.replace("%GameFilter%", &self.game_filter_ports);
        } else {
            // Drop the token together with an adjacent comma so port sets
            // stay well-formed, then collapse leftover artifacts.
            line = line
                .replace(",%GameFilter%", "")
                .replace("%GameFilter%,", "")
                .replace("%GameFilter%", "");
            while line.contains(",,") {
                line = line.replace(",,", ",");
            }
            while line.contains(",}") || line.contains("{,") {
                line = line.replace(",}", "}").replace("{,", "{");
            }
        }

        // Stray batch continuation characters carry no meaning here.
        line.replace('^', "")
    }
}

/// Join physical lines ending in the batch continuation `^` into logical
/// lines.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut buf = String::new();

    for line in text.lines() {
        let trimmed = line.trim_end();
        if let Some(head) = trimmed.strip_suffix('^') {
            buf.push_str(head);
            buf.push(' ');
        } else {
            buf.push_str(line);
            lines.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        lines.push(buf);
    }

    lines
}

fn is_skip_line(line: &str) -> bool {
    let line = line.trim();

    if line.is_empty() {
        return true;
    }

    let lower = line.to_ascii_lowercase();
    if lower.starts_with("::") || lower.starts_with("@echo") || lower.starts_with("rem ") {
        return true;
    }

    // Batch service directives
    if line.contains("chcp ")
        || line.contains("cd /d ")
        || line.contains("call service.bat")
        || line.contains("set \"BIN")
        || line.contains("set \"LISTS")
    {
        return true;
    }

    // Lines carrying no rule content
    if !line.contains("--filter-")
        && !line.contains("--hostlist")
        && !line.contains("--ipset")
        && !line.contains("--dpi-desync")
    {
        return true;
    }

    false
}

fn clean_args(args: &str) -> String {
    let args = args.trim().replace("\\\"", "\"");
    args.split_whitespace().collect::<Vec<_>>().join(" ")
}
