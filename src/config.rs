//! The `KEY=VALUE` config file reader described in spec §6.
//!
//! Grounded on `examples/original_source/src/global_config.cpp`: the same
//! `XDG_CONFIG_HOME` / `XDG_CONFIG_DIRS` / `HOME` search order, the same
//! "blank or unknown keys warn and are ignored" parsing rule, and the same
//! two settings (`initiate_peer_connections`, `listening_port`,
//! `connection_port`). The original's `bool`/`int` two-table
//! `settings_map` becomes one Rust struct with typed fields, since there's
//! no need to recover the original key name from a value the way the C++
//! `operator<<` dump did.
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subdirectory under a config root this client's config file lives in.
const CONFIG_SUBDIR: &str = "zit-rs";
/// The config file's name within [`CONFIG_SUBDIR`].
const CONFIG_FILE_NAME: &str = "config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config file: {0}")]
    Io(#[from] std::io::Error),
}

/// The effective configuration, after applying the `KEY=VALUE` file (if
/// any) found via the XDG search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub initiate_peer_connections: bool,
    pub listening_port: Option<u16>,
    pub connection_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initiate_peer_connections: true,
            listening_port: None,
            connection_port: None,
        }
    }
}

/// Candidate config directories in precedence order, per spec §6 and the
/// original's `config_dirs`: `XDG_CONFIG_HOME` (falling back to
/// `$HOME/.local/share`), then each entry of `XDG_CONFIG_DIRS`, then
/// `$HOME` itself as a last resort.
fn candidate_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let home = std::env::var_os("HOME").map(PathBuf::from);

    match std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        Some(dir) if dir.exists() => dirs.push(dir),
        _ => {
            if let Some(home) = &home {
                dirs.push(home.join(".local").join("share"));
            }
        }
    }

    if let Some(dirs_var) = std::env::var_os("XDG_CONFIG_DIRS") {
        for dir in std::env::split_paths(&dirs_var) {
            if dir.exists() {
                dirs.push(dir);
            }
        }
    }

    if let Some(home) = home {
        dirs.push(home);
    }
    dirs
}

/// Loads the config file from the first candidate directory that has one,
/// applying it over [`Config::default`]. Returns the default config
/// unchanged if no candidate directory holds a config file.
pub fn load() -> Result<Config, ConfigError> {
    let mut config = Config::default();
    for dir in candidate_dirs() {
        let path = dir.join(CONFIG_SUBDIR).join(CONFIG_FILE_NAME);
        if path.exists() {
            tracing::info!(path = %path.display(), "reading config from");
            apply_file(&path, &mut config)?;
            break;
        }
    }
    Ok(config)
}

/// Reads and applies every `KEY=VALUE` line of `path` onto `config`.
fn apply_file(path: &Path, config: &mut Config) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line, "ignoring invalid config line");
            continue;
        };
        apply_line(config, key.trim(), value.trim());
    }
    Ok(())
}

fn apply_line(config: &mut Config, key: &str, value: &str) {
    match key {
        "initiate_peer_connections" => match parse_bool(value) {
            Some(v) => config.initiate_peer_connections = v,
            None => tracing::warn!(key, value, "could not parse as a boolean"),
        },
        "listening_port" => match value.parse() {
            Ok(v) => config.listening_port = Some(v),
            Err(_) => tracing::warn!(key, value, "could not parse as an integer"),
        },
        "connection_port" => match value.parse() {
            Ok(v) => config.connection_port = Some(v),
            Err(_) => tracing::warn!(key, value, "could not parse as an integer"),
        },
        "" => {}
        other => tracing::warn!(key = other, "unknown key in config file ignored"),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_recognized_keys() {
        let mut config = Config::default();
        apply_line(&mut config, "initiate_peer_connections", "false");
        apply_line(&mut config, "listening_port", "6881");
        apply_line(&mut config, "connection_port", "6882");
        assert!(!config.initiate_peer_connections);
        assert_eq!(config.listening_port, Some(6881));
        assert_eq!(config.connection_port, Some(6882));
    }

    #[test]
    fn ignores_unknown_and_unparseable_values() {
        let mut config = Config::default();
        apply_line(&mut config, "nonsense_key", "whatever");
        apply_line(&mut config, "listening_port", "not-a-number");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parse_bool_accepts_true_false_and_numeric_forms() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn apply_file_skips_blank_lines_and_bad_lines_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "listening_port=7000\n\nmalformed line\n# also bad\n").unwrap();
        let mut config = Config::default();
        apply_file(&path, &mut config).unwrap();
        assert_eq!(config.listening_port, Some(7000));
    }
}
