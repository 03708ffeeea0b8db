//! The config-file model and loader/saver (AMBIENT-3).
//!
//! `spec.md` treats the file-parsing *tool* as an external collaborator but
//! fixes its semantics exactly (§6): whitespace-tokenized lines, `#`/blank
//! lines ignored, case-insensitive keywords, `Node` lines regenerated from
//! the live ring on every save while every other line is preserved verbatim
//! and in its original position.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::Error;
use crate::node::Node;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Data,
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub host: String,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct TraceConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

/// One line of the config file, kept around verbatim so non-`Node` lines
/// round-trip byte-for-byte and in their original order (spec §6, §9).
#[derive(Clone, Debug)]
pub enum ConfigLine {
    Verbatim(String),
    Node { host: String, port: i32, max_bytes: i64 },
}

#[derive(Clone, Debug)]
pub struct Configuration {
    pub role: Role,
    pub listener: Option<ListenerConfig>,
    pub master_host: String,
    pub master_port: i32,
    pub trace: Option<TraceConfig>,
    /// The original line layout, preserved for round-tripping on save. Only
    /// meaningful (and maintained) for a master.
    pub lines: Vec<ConfigLine>,
}

impl Configuration {
    /// Parses a config file's text per spec §6.
    pub fn parse(text: &str) -> Result<Configuration, Error> {
        let mut role = Role::Data;
        let mut listener = None;
        let mut master_host = String::new();
        let mut master_port = 0i32;
        let mut trace = None;
        let mut lines = Vec::new();

        for raw_line in text.lines() {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(ConfigLine::Verbatim(raw_line.to_string()));
                continue;
            }

            let tokens: Vec<&str> = trimmed.split_whitespace().collect();
            let keyword = tokens[0].to_ascii_lowercase();

            match keyword.as_str() {
                "master" => {
                    let (host, port) = split_host_port(tokens.get(1).copied().unwrap_or_default())?;
                    master_host = host;
                    master_port = port;
                    role = Role::Master;
                    lines.push(ConfigLine::Verbatim(raw_line.to_string()));
                }
                "listener" => {
                    let host = tokens.get(1).copied().unwrap_or_default().to_string();
                    let ip_port = tokens.get(2).copied().unwrap_or_default();
                    let addr: SocketAddr = ip_port.parse().map_err(|_| {
                        Error::InvalidConfiguration(format!("bad Listener ip:port `{}`", ip_port))
                    })?;
                    listener = Some(ListenerConfig { host, addr });
                    // A `Listener ... No` line still marks this file as
                    // describing a data node unless a `Master` line already
                    // switched it to master role.
                    lines.push(ConfigLine::Verbatim(raw_line.to_string()));
                }
                "trace" => {
                    let on = tokens
                        .get(1)
                        .map(|t| t.eq_ignore_ascii_case("on"))
                        .unwrap_or(false);
                    let path = tokens.get(2).copied().unwrap_or_default();
                    trace = Some(TraceConfig {
                        enabled: on,
                        path: PathBuf::from(path),
                    });
                    lines.push(ConfigLine::Verbatim(raw_line.to_string()));
                }
                "node" => {
                    let (host, port) =
                        split_host_port(tokens.get(1).copied().unwrap_or_default())?;
                    let size_token = tokens.get(2).copied().unwrap_or_default();
                    let max_bytes = parse_size(size_token)?;
                    lines.push(ConfigLine::Node { host, port, max_bytes });
                }
                _ => {
                    lines.push(ConfigLine::Verbatim(raw_line.to_string()));
                }
            }
        }

        Ok(Configuration {
            role,
            listener,
            master_host,
            master_port,
            trace,
            lines,
        })
    }

    /// Collects the `Node` lines parsed from the file, in file order.
    pub fn configured_nodes(&self) -> Vec<Node> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                ConfigLine::Node { host, port, max_bytes } => {
                    Some(Node::new(host.clone(), *port, *max_bytes))
                }
                _ => None,
            })
            .collect()
    }

    /// Regenerates `Node` lines from `nodes` (the live ring) while keeping
    /// every other line exactly where it was (spec §6, §9).
    pub fn render(&self, nodes: &[Node]) -> String {
        let mut out = String::new();
        let mut wrote_nodes = false;

        for line in &self.lines {
            match line {
                ConfigLine::Verbatim(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
                ConfigLine::Node { .. } => {
                    if !wrote_nodes {
                        for node in nodes {
                            out.push_str(&format!(
                                "Node {}:{} {}\n",
                                node.host,
                                node.port,
                                format_size(node.max_bytes)
                            ));
                        }
                        wrote_nodes = true;
                    }
                }
            }
        }

        if !wrote_nodes {
            for node in nodes {
                out.push_str(&format!(
                    "Node {}:{} {}\n",
                    node.host,
                    node.port,
                    format_size(node.max_bytes)
                ));
            }
        }

        out
    }
}

fn split_host_port(token: &str) -> Result<(String, i32), Error> {
    let (host, port) = token.rsplit_once(':').ok_or_else(|| {
        Error::InvalidConfiguration(format!("expected HOST:PORT, got `{}`", token))
    })?;
    let port: i32 = port
        .parse()
        .map_err(|_| Error::InvalidConfiguration(format!("bad port in `{}`", token)))?;
    Ok((host.to_string(), port))
}

/// Parses a capacity token: a positive integer, optionally comma-grouped,
/// optionally suffixed with `Kb`/`Mb`/`Gb` (powers of 1024), per spec §6.
pub fn parse_size(token: &str) -> Result<i64, Error> {
    let token = token.trim();
    let lower = token.to_ascii_lowercase();

    let (digits, multiplier) = if let Some(stripped) = lower.strip_suffix("kb") {
        (stripped, 1024i64)
    } else if let Some(stripped) = lower.strip_suffix("mb") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix("gb") {
        (stripped, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };

    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();
    let base: i64 = cleaned
        .parse()
        .map_err(|_| Error::InvalidConfiguration(format!("bad size `{}`", token)))?;

    if base <= 0 {
        return Err(Error::InvalidConfiguration(format!(
            "size must be positive, got `{}`",
            token
        )));
    }

    Ok(base * multiplier)
}

/// Formats a byte count back into a size token, re-emitting `Kb`/`Mb`/`Gb`
/// when `bytes` is an exact power-of-1024 multiple (spec §9 round-trip
/// requirement), falling back to a plain decimal otherwise.
pub fn format_size(bytes: i64) -> String {
    const GB: i64 = 1024 * 1024 * 1024;
    const MB: i64 = 1024 * 1024;
    const KB: i64 = 1024;

    if bytes % GB == 0 {
        format!("{}Gb", bytes / GB)
    } else if bytes % MB == 0 {
        format!("{}Mb", bytes / MB)
    } else if bytes % KB == 0 {
        format!("{}Kb", bytes / KB)
    } else {
        bytes.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_master_and_node_lines() {
        let text = "\
            # cluster config\n\
            Master 127.0.0.1:12345\n\
            Node 127.0.0.1:12346 48Mb\n\
            Node 127.0.0.1:12347 64Mb\n\
        ";

        let config = Configuration::parse(text).unwrap();
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.master_host, "127.0.0.1");
        assert_eq!(config.master_port, 12345);

        let nodes = config.configured_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].max_bytes, 48 * 1024 * 1024);
        assert_eq!(nodes[1].max_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn size_suffixes_round_trip() {
        for (token, bytes) in [("48Mb", 48 * 1024 * 1024), ("1Gb", 1024 * 1024 * 1024), ("512Kb", 512 * 1024)] {
            let parsed = parse_size(token).unwrap();
            assert_eq!(parsed, bytes);
            assert_eq!(format_size(parsed), token);
        }
    }

    #[test]
    fn commas_are_accepted_as_thousands_separators() {
        assert_eq!(parse_size("1,048,576").unwrap(), 1_048_576);
    }

    #[test]
    fn non_positive_size_is_rejected() {
        assert!(parse_size("0").is_err());
        assert!(parse_size("-5Mb").is_err());
    }

    #[test]
    fn render_preserves_non_node_lines_and_regenerates_node_lines() {
        let text = "\
            # header comment\n\
            Master 127.0.0.1:12345\n\
            Node 127.0.0.1:12346 48Mb\n\
            Trace Off /var/log/loopcache.log\n\
        ";
        let config = Configuration::parse(text).unwrap();

        let new_nodes = vec![
            Node::new("127.0.0.1", 12346, 48 * 1024 * 1024),
            Node::new("127.0.0.1", 12348, 16 * 1024 * 1024),
        ];

        let rendered = config.render(&new_nodes);
        assert!(rendered.contains("# header comment"));
        assert!(rendered.contains("Master 127.0.0.1:12345"));
        assert!(rendered.contains("Trace Off /var/log/loopcache.log"));
        assert!(rendered.contains("Node 127.0.0.1:12346 48Mb"));
        assert!(rendered.contains("Node 127.0.0.1:12348 16Mb"));
    }
}
