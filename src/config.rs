//! Loads the sectioned `dataplicity.conf`-style configuration file.
//!
//! Grounded on `m2m.py`'s `M2MManager.init_from_conf` and
//! `portforward.py`'s `PortForwardManager.init_from_conf`: tolerant of a
//! missing file (an agent with no config behaves like one with an empty
//! config), and of missing individual keys (each has a documented default).

use std::path::Path;

use ini::Ini;
use tracing_subscriber::filter::LevelFilter;

use crate::error::ConfigError;

pub const DEFAULT_M2M_URL: &str = "wss://m2m.dataplicity.com/m2m/";

#[derive(Debug, Clone)]
pub struct M2mConfig {
    pub enabled: bool,
    pub url: String,
    /// Development-only: pins the identity a client presents on join
    /// instead of letting the broker assign one.
    pub identity: Option<String>,
    pub insecure_tls: bool,
}

impl Default for M2mConfig {
    fn default() -> Self {
        M2mConfig {
            enabled: true,
            url: DEFAULT_M2M_URL.to_string(),
            identity: None,
            insecure_tls: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub name: String,
    pub command: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortForwardConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_level: LevelFilter,
    pub log_file: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            log_level: LevelFilter::INFO,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub m2m: M2mConfig,
    pub terminals: Vec<TerminalConfig>,
    pub port_forwards: Vec<PortForwardConfig>,
    pub daemon: DaemonConfig,
}

impl AgentConfig {
    /// Load configuration from `path`. A missing file yields the default
    /// configuration rather than an error.
    pub fn load(path: &Path) -> Result<AgentConfig, ConfigError> {
        if !path.exists() {
            return Ok(AgentConfig::default());
        }

        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = AgentConfig::default();

        if let Some(section) = ini.section(Some("m2m")) {
            config.m2m.enabled = get_bool(section, "enabled", true);
            if let Some(url) = section.get("url") {
                config.m2m.url = url.to_string();
            }
            config.m2m.identity = section.get("identity").map(str::to_string);
            config.m2m.insecure_tls = get_bool(section, "insecure_tls", false);
        }

        if let Some(section) = ini.section(Some("daemon")) {
            if let Some(level) = section.get("log_level") {
                config.daemon.log_level = parse_level(level).ok_or_else(|| ConfigError::InvalidValue {
                    section: "daemon".to_string(),
                    key: "log_level".to_string(),
                    value: level.to_string(),
                })?;
            }
            config.daemon.log_file = section.get("log_file").map(str::to_string);
        }

        for (section_name, section) in ini.iter() {
            let Some(section_name) = section_name else { continue };
            if let Some(name) = section_name.strip_prefix("terminal:") {
                let command = section
                    .get("command")
                    .map(str::to_string)
                    .or_else(|| std::env::var("SHELL").ok())
                    .unwrap_or_else(|| "bash".to_string());
                config.terminals.push(TerminalConfig {
                    name: name.to_string(),
                    command,
                    user: section.get("user").map(str::to_string),
                    group: section.get("group").map(str::to_string),
                });
            } else if let Some(name) = section_name.strip_prefix("portforward:") {
                if !get_bool(section, "enabled", true) {
                    continue;
                }
                let port = match section.get("port") {
                    Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                        section: section_name.to_string(),
                        key: "port".to_string(),
                        value: raw.to_string(),
                    })?,
                    None => 80,
                };
                config.port_forwards.push(PortForwardConfig {
                    name: name.to_string(),
                    host: section
                        .get("host")
                        .map(str::to_string)
                        .unwrap_or_else(|| "127.0.0.1".to_string()),
                    port,
                    enabled: true,
                });
            }
        }

        Ok(config)
    }
}

fn get_bool(section: &ini::Properties, key: &str, default: bool) -> bool {
    match section.get(key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"),
        None => default,
    }
}

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AgentConfig::load(Path::new("/nonexistent/dataplicity.conf")).unwrap();
        assert!(config.m2m.enabled);
        assert_eq!(config.m2m.url, DEFAULT_M2M_URL);
        assert!(config.terminals.is_empty());
    }

    #[test]
    fn parses_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[m2m]\nenabled=yes\nurl=wss://example.test/m2m/\n\n\
             [terminal:console]\ncommand=/bin/sh\n\n\
             [portforward:web]\nhost=127.0.0.1\nport=8080\n"
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.m2m.url, "wss://example.test/m2m/");
        assert_eq!(config.terminals.len(), 1);
        assert_eq!(config.terminals[0].name, "console");
        assert_eq!(config.terminals[0].command, "/bin/sh");
        assert_eq!(config.port_forwards.len(), 1);
        assert_eq!(config.port_forwards[0].port, 8080);
    }

    #[test]
    fn disabled_portforward_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[portforward:web]\nenabled=no\nport=8080\n").unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert!(config.port_forwards.is_empty());
    }
}
