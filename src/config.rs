//! Properties-file configuration.
//!
//! The cluster is described by a flat `key=value` properties file: `#` starts
//! a comment line, there are no escapes, and the first occurrence of a key
//! wins. The keys the core reads are `password`, `clients`, `servers`, and
//! `root_dir`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read properties file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed property {line:?}")]
    MalformedProperty { line: String },
    #[error("property {line:?} does not have a value")]
    MissingValue { line: String },
    #[error("required property {key:?} is not set")]
    MissingKey { key: &'static str },
    #[error("malformed peer location {entry:?}")]
    MalformedPeer { entry: String },
    #[error("invalid port in {entry:?}")]
    InvalidPort { entry: String },
    #[error("malformed server location {entry:?}, expected host:port")]
    MalformedServer { entry: String },
}

/// Raw key/value view of a properties file.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for line in contents.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.find('=') {
                Some(0) => {
                    return Err(ConfigError::MalformedProperty {
                        line: line.to_string(),
                    });
                }
                Some(split) => {
                    // First occurrence of a key wins.
                    values
                        .entry(line[..split].to_string())
                        .or_insert_with(|| line[split + 1..].to_string());
                }
                None => {
                    return Err(ConfigError::MissingValue {
                        line: line.to_string(),
                    });
                }
            }
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A `host[:port]` peer entry from the `clients` property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
}

/// A `host:port` file-server entry from the `servers` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
}

/// Typed view of the properties the core consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub password: String,
    pub peers: Vec<PeerEntry>,
    pub servers: Vec<ServerEntry>,
    pub root_dir: Option<PathBuf>,
}

impl Config {
    /// Builds the typed config. `default_port` fills in peer entries that do
    /// not carry an explicit port; it is the local listening port.
    pub fn from_properties(props: &Properties, default_port: u16) -> Result<Self, ConfigError> {
        let password = props
            .get("password")
            .ok_or(ConfigError::MissingKey { key: "password" })?
            .to_string();

        let peers = match props.get("clients") {
            Some(list) => parse_peer_list(list, default_port)?,
            None => Vec::new(),
        };

        let servers = match props.get("servers") {
            Some(list) => parse_server_list(list)?,
            None => Vec::new(),
        };

        let root_dir = props.get("root_dir").map(PathBuf::from);

        Ok(Self {
            password,
            peers,
            servers,
            root_dir,
        })
    }

    pub fn load(path: &Path, default_port: u16) -> Result<Self, ConfigError> {
        let props = Properties::parse_file(path)?;
        Self::from_properties(&props, default_port)
    }
}

fn parse_peer_list(list: &str, default_port: u16) -> Result<Vec<PeerEntry>, ConfigError> {
    let mut peers = Vec::new();
    for entry in split_list(list) {
        let mut parts = entry.split(':');
        let host = match parts.next() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(ConfigError::MalformedPeer {
                    entry: entry.to_string(),
                });
            }
        };
        let port = match parts.next() {
            Some(port_text) => port_text
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| ConfigError::InvalidPort {
                    entry: entry.to_string(),
                })?,
            None => default_port,
        };
        if parts.next().is_some() {
            return Err(ConfigError::MalformedPeer {
                entry: entry.to_string(),
            });
        }
        peers.push(PeerEntry { host, port });
    }
    Ok(peers)
}

fn parse_server_list(list: &str) -> Result<Vec<ServerEntry>, ConfigError> {
    let mut servers = Vec::new();
    for entry in split_list(list) {
        let (host, port_text) = entry.split_once(':').ok_or_else(|| {
            ConfigError::MalformedServer {
                entry: entry.to_string(),
            }
        })?;
        if host.is_empty() {
            return Err(ConfigError::MalformedServer {
                entry: entry.to_string(),
            });
        }
        let port = port_text
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                entry: entry.to_string(),
            })?;
        servers.push(ServerEntry {
            host: host.to_string(),
            port,
        });
    }
    Ok(servers)
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_values() {
        let props = Properties::parse("# cluster\npassword=hunter2\n\nclients=a,b:9001\n").unwrap();
        assert_eq!(props.get("password"), Some("hunter2"));
        assert_eq!(props.get("clients"), Some("a,b:9001"));
        assert_eq!(props.get("missing"), None);
    }

    #[test]
    fn first_occurrence_of_a_key_wins() {
        let props = Properties::parse("password=first\npassword=second\n").unwrap();
        assert_eq!(props.get("password"), Some("first"));
    }

    #[test]
    fn rejects_key_without_value() {
        let err = Properties::parse("password\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue { .. }));
    }

    #[test]
    fn rejects_empty_key() {
        let err = Properties::parse("=value\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedProperty { .. }));
    }

    #[test]
    fn peer_list_defaults_to_local_port() {
        let props =
            Properties::parse("password=x\nclients=alpha, beta:9001 ,gamma\n").unwrap();
        let config = Config::from_properties(&props, 4000).unwrap();
        assert_eq!(
            config.peers,
            vec![
                PeerEntry {
                    host: "alpha".into(),
                    port: 4000
                },
                PeerEntry {
                    host: "beta".into(),
                    port: 9001
                },
                PeerEntry {
                    host: "gamma".into(),
                    port: 4000
                },
            ]
        );
    }

    #[test]
    fn rejects_bad_peer_port() {
        let props = Properties::parse("password=x\nclients=alpha:nope\n").unwrap();
        let err = Config::from_properties(&props, 4000).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn servers_require_explicit_port() {
        let props = Properties::parse("password=x\nservers=files1\n").unwrap();
        let err = Config::from_properties(&props, 4000).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedServer { .. }));
    }

    #[test]
    fn missing_password_is_fatal() {
        let props = Properties::parse("clients=alpha\n").unwrap();
        let err = Config::from_properties(&props, 4000).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { key: "password" }));
    }
}
