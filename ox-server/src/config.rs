// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Layered configuration: built-in defaults, then an optional TOML file,
//! then environment variables, then command-line flags. Flags are applied
//! by main, everything else here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::catalogue;
use crate::listener;

/// Serde representation of the configuration file.
mod parsed {
    use super::*;

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(super) struct Config {
        pub(super) socket_path: Option<PathBuf>,
        pub(super) bind_systemd: Option<bool>,
        pub(super) headless: Option<bool>,
        pub(super) exit_on_disconnect: Option<bool>,
        pub(super) debug_vulkan: Option<bool>,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub socket_path: PathBuf,
    pub shm_name: String,
    /// Require a supervisor-passed socket; never bind the path ourselves.
    pub bind_systemd: bool,
    /// Exit when the active client disconnects (IPC_EXIT_ON_DISCONNECT).
    pub exit_on_disconnect: bool,
    /// Run without a GPU; the compositor ticks but draws nothing.
    pub headless: bool,
    pub debug_vulkan: bool,
}

impl Config {
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let parsed = if let Some(file) = file {
            let content = std::fs::read_to_string(file)
                .context(format!("reading configuration file {}", file.display()))?;
            toml::from_str(&content)
                .context(format!("parsing configuration file {}", file.display()))?
        } else {
            parsed::Config::default()
        };

        let mut this = Self {
            socket_path: parsed.socket_path.unwrap_or_else(default_socket_path),
            shm_name: catalogue::SHM_NAME_DEFAULT.to_string(),
            bind_systemd: parsed.bind_systemd.unwrap_or(false),
            exit_on_disconnect: parsed.exit_on_disconnect.unwrap_or(false),
            headless: parsed.headless.unwrap_or(false),
            debug_vulkan: parsed.debug_vulkan.unwrap_or(cfg!(debug_assertions)),
        };

        if let Some(v) = env_bool("IPC_EXIT_ON_DISCONNECT") {
            this.exit_on_disconnect = v;
        }

        Ok(this)
    }
}

/// `$XDG_RUNTIME_DIR/oxserver_ipc`, falling back to /tmp when the session
/// has no runtime dir.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(listener::SOCKET_NAME)
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match parse_bool(&value) {
        Some(v) => Some(v),
        None => {
            warn!(name, value, "ignoring unparseable boolean");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults() {
        let cfg = Config::load(None).unwrap();
        assert!(!cfg.headless);
        assert_eq!(cfg.shm_name, catalogue::SHM_NAME_DEFAULT);
        assert!(cfg.socket_path.ends_with(listener::SOCKET_NAME));
    }

    #[test]
    fn file_overrides() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let path = dir.join("oxserver.toml");
        std::fs::write(
            &path,
            "socket_path = \"/run/oxserver/sock\"\nheadless = true\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert!(cfg.headless);
        assert_eq!(cfg.socket_path, PathBuf::from("/run/oxserver/sock"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let path = dir.join("oxserver.toml");
        std::fs::write(&path, "sokcet_path = \"/tmp/x\"\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
    }
}
