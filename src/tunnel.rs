//! Local WireGuard client control and configuration editing.
//!
//! The reconciliation engine only sees the structured accessors defined by
//! [`TunnelClient`]; the flat `wg-quick` configuration format is entirely an
//! implementation detail of [`WgQuickTunnel`]. Interface control shells out
//! to `wg`/`wg-quick` through the [`CommandRunner`] seam.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::{CommandRunner, ProcessError};

const PEER_SECTION: &str = "[Peer]";
const ENDPOINT_KEY: &str = "Endpoint";
const PEER_KEY_KEY: &str = "PublicKey";
const ALLOWED_IPS_KEY: &str = "AllowedIPs";

/// Routing scope applied to the local tunnel.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Route all traffic through the tunnel.
    #[default]
    Vpn,
    /// Route only SOCKS5 proxy traffic (the server's tunnel address).
    Socks5,
}

impl TunnelMode {
    /// The `AllowedIPs` value implied by this mode.
    #[must_use]
    pub const fn allowed_routes(self) -> &'static str {
        match self {
            Self::Vpn => "0.0.0.0/0",
            Self::Socks5 => "10.0.0.1/32",
        }
    }

    /// Upper-case label shown to users.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Vpn => "VPN",
            Self::Socks5 => "SOCKS5",
        }
    }

    /// Returns the other mode.
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Vpn => Self::Socks5,
            Self::Socks5 => Self::Vpn,
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Vpn => "vpn",
            Self::Socks5 => "socks5",
        };
        formatter.write_str(name)
    }
}

impl std::str::FromStr for TunnelMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "vpn" => Ok(Self::Vpn),
            "socks5" => Ok(Self::Socks5),
            other => Err(format!("unknown tunnel mode '{other}' (expected vpn or socks5)")),
        }
    }
}

/// Errors raised by the local tunnel client.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Raised when a `wg`/`wg-quick` invocation cannot be spawned.
    #[error(transparent)]
    Spawn(#[from] ProcessError),
    /// Raised when bringing the interface up cannot be verified.
    #[error("failed to bring the tunnel up: {message}")]
    ConnectFailed {
        /// Stderr or a summary of the failure.
        message: String,
    },
    /// Raised when bringing the interface down cannot be verified.
    #[error("failed to bring the tunnel down: {message}")]
    DisconnectFailed {
        /// Stderr or a summary of the failure.
        message: String,
    },
    /// Raised when the configuration file cannot be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Configuration file path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the configuration has no `[Peer]` section to update.
    #[error("no [Peer] section in {path}")]
    MissingPeerSection {
        /// Configuration file path.
        path: Utf8PathBuf,
    },
}

/// Structured view of the local tunnel used by the reconciliation engine.
pub trait TunnelClient {
    /// Returns `true` when a WireGuard interface is currently up.
    fn is_connected(&self) -> bool;

    /// Brings the tunnel up and verifies the interface appeared.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConnectFailed`] when the interface cannot be
    /// confirmed up afterwards.
    fn connect(&self) -> Result<(), TunnelError>;

    /// Brings the tunnel down and verifies the interface disappeared.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::DisconnectFailed`] when the interface is still
    /// present afterwards.
    fn disconnect(&self) -> Result<(), TunnelError>;

    /// Sets the peer endpoint to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when the configuration cannot be rewritten.
    fn set_endpoint(&self, host: &str, port: u16) -> Result<(), TunnelError>;

    /// Sets the peer public key.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when the configuration cannot be rewritten.
    fn set_peer_key(&self, key: &str) -> Result<(), TunnelError>;

    /// Applies the routing scope implied by `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when the configuration cannot be rewritten.
    fn set_route_scope(&self, mode: TunnelMode) -> Result<(), TunnelError>;

    /// Reads the endpoint host from the configuration, if present.
    fn endpoint_host(&self) -> Option<String>;

    /// Returns the raw configuration file contents.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Io`] when the file cannot be read.
    fn raw_config(&self) -> Result<String, TunnelError>;
}

/// Tunnel client backed by `wg`, `wg-quick`, and a flat configuration file.
#[derive(Clone, Debug)]
pub struct WgQuickTunnel<R> {
    config_path: Utf8PathBuf,
    wg_bin: String,
    wg_quick_bin: String,
    use_sudo: bool,
    runner: R,
}

impl<R: CommandRunner> WgQuickTunnel<R> {
    /// Creates a tunnel client for the given configuration file and tools.
    pub fn new(
        config_path: impl Into<Utf8PathBuf>,
        wg_bin: impl Into<String>,
        wg_quick_bin: impl Into<String>,
        use_sudo: bool,
        runner: R,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            wg_bin: wg_bin.into(),
            wg_quick_bin: wg_quick_bin.into(),
            use_sudo,
            runner,
        }
    }

    /// Returns the configuration file path.
    #[must_use]
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    fn run_tool(&self, tool: &str, args: &[&str]) -> Result<crate::process::CommandOutput, ProcessError> {
        if self.use_sudo {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(OsString::from(tool));
            full.extend(args.iter().map(|arg| OsString::from(*arg)));
            self.runner.run("sudo", &full)
        } else {
            let full: Vec<OsString> = args.iter().map(|arg| OsString::from(*arg)).collect();
            self.runner.run(tool, &full)
        }
    }

    fn split_path(&self) -> Result<(&Utf8Path, &str), TunnelError> {
        let parent = match self.config_path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let file_name = self.config_path.file_name().ok_or_else(|| TunnelError::Io {
            path: self.config_path.clone(),
            message: String::from("configuration path is missing a filename"),
        })?;
        Ok((parent, file_name))
    }

    fn read_config(&self) -> Result<String, TunnelError> {
        let (parent, file_name) = self.split_path()?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            TunnelError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        dir.read_to_string(file_name).map_err(|err| TunnelError::Io {
            path: self.config_path.clone(),
            message: err.to_string(),
        })
    }

    fn write_config(&self, contents: &str) -> Result<(), TunnelError> {
        let (parent, file_name) = self.split_path()?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            TunnelError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        dir.write(file_name, contents).map_err(|err| TunnelError::Io {
            path: self.config_path.clone(),
            message: err.to_string(),
        })
    }

    /// Replaces the single `key = value` line, constrained to `section` when
    /// given. When no such line exists the entry is inserted right after the
    /// `[Peer]` header, which covers a config whose endpoint was stripped.
    fn upsert_entry(
        &self,
        section: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), TunnelError> {
        let contents = self.read_config()?;
        let mut lines: Vec<String> = Vec::new();
        let mut in_section = section.is_none();
        let mut replaced = false;

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') {
                in_section = section.is_none_or(|wanted| trimmed == wanted);
                lines.push(line.to_owned());
                continue;
            }

            if in_section && !replaced && entry_key_matches(trimmed, key) {
                lines.push(format!("{key} = {value}"));
                replaced = true;
            } else {
                lines.push(line.to_owned());
            }
        }

        if !replaced {
            let Some(position) = lines
                .iter()
                .position(|line| line.trim() == PEER_SECTION)
            else {
                return Err(TunnelError::MissingPeerSection {
                    path: self.config_path.clone(),
                });
            };
            lines.insert(position + 1, format!("{key} = {value}"));
        }

        let mut rendered = lines.join("\n");
        if contents.ends_with('\n') {
            rendered.push('\n');
        }
        self.write_config(&rendered)
    }
}

fn entry_key_matches(line: &str, key: &str) -> bool {
    line.strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

impl<R: CommandRunner> TunnelClient for WgQuickTunnel<R> {
    fn is_connected(&self) -> bool {
        match self.run_tool(&self.wg_bin, &["show", "interfaces"]) {
            Ok(output) => output.is_success() && !output.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    fn connect(&self) -> Result<(), TunnelError> {
        let output = self.run_tool(&self.wg_quick_bin, &["up", self.config_path.as_str()])?;
        if !output.is_success() {
            return Err(TunnelError::ConnectFailed {
                message: summarise(&output.stderr, output.code),
            });
        }
        if !self.is_connected() {
            return Err(TunnelError::ConnectFailed {
                message: String::from("interface not present after wg-quick up"),
            });
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TunnelError> {
        let output = self.run_tool(&self.wg_quick_bin, &["down", self.config_path.as_str()])?;
        if self.is_connected() {
            return Err(TunnelError::DisconnectFailed {
                message: summarise(&output.stderr, output.code),
            });
        }
        Ok(())
    }

    fn set_endpoint(&self, host: &str, port: u16) -> Result<(), TunnelError> {
        self.upsert_entry(None, ENDPOINT_KEY, &format!("{host}:{port}"))
    }

    fn set_peer_key(&self, key: &str) -> Result<(), TunnelError> {
        self.upsert_entry(Some(PEER_SECTION), PEER_KEY_KEY, key)
    }

    fn set_route_scope(&self, mode: TunnelMode) -> Result<(), TunnelError> {
        self.upsert_entry(None, ALLOWED_IPS_KEY, mode.allowed_routes())
    }

    fn endpoint_host(&self) -> Option<String> {
        let contents = self.read_config().ok()?;
        for line in contents.lines() {
            let trimmed = line.trim();
            if entry_key_matches(trimmed, ENDPOINT_KEY) {
                let value = trimmed.split_once('=')?.1.trim();
                let host = value.rsplit_once(':').map_or(value, |(host, _)| host);
                if host.is_empty() {
                    return None;
                }
                return Some(host.to_owned());
            }
        }
        None
    }

    fn raw_config(&self) -> Result<String, TunnelError> {
        self.read_config()
    }
}

fn summarise(stderr: &str, code: Option<i32>) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        code.map_or_else(
            || String::from("terminated without an exit status"),
            |status| format!("exited with status {status}"),
        )
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    const SAMPLE_CONFIG: &str = "[Interface]\n\
        PrivateKey = client-private\n\
        Address = 10.0.0.2/24\n\
        \n\
        [Peer]\n\
        PublicKey = old-server-key\n\
        AllowedIPs = 0.0.0.0/0\n\
        Endpoint = 1.2.3.4:51820\n";

    fn tunnel_in(tmp: &TempDir, runner: ScriptedRunner) -> WgQuickTunnel<ScriptedRunner> {
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("wg0.conf"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        std::fs::write(&path, SAMPLE_CONFIG).expect("seed config should write");
        WgQuickTunnel::new(path, "wg", "wg-quick", false, runner)
    }

    #[test]
    fn set_endpoint_rewrites_only_the_endpoint_line() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let tunnel = tunnel_in(&tmp, ScriptedRunner::new());

        tunnel
            .set_endpoint("203.0.113.9", 51820)
            .expect("endpoint update should succeed");

        let contents = tunnel.raw_config().expect("config should read");
        assert!(contents.contains("Endpoint = 203.0.113.9:51820"));
        assert!(contents.contains("PublicKey = old-server-key"));
        assert!(contents.contains("Address = 10.0.0.2/24"));
    }

    #[test]
    fn set_peer_key_updates_inside_peer_section() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let tunnel = tunnel_in(&tmp, ScriptedRunner::new());

        tunnel
            .set_peer_key("new-server-key")
            .expect("key update should succeed");

        let contents = tunnel.raw_config().expect("config should read");
        assert!(contents.contains("PublicKey = new-server-key"));
        // The interface private key must be untouched.
        assert!(contents.contains("PrivateKey = client-private"));
    }

    #[test]
    fn route_scope_switches_both_ways() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let tunnel = tunnel_in(&tmp, ScriptedRunner::new());

        tunnel
            .set_route_scope(TunnelMode::Socks5)
            .expect("socks5 scope should apply");
        assert!(
            tunnel
                .raw_config()
                .expect("config should read")
                .contains("AllowedIPs = 10.0.0.1/32")
        );

        tunnel
            .set_route_scope(TunnelMode::Vpn)
            .expect("vpn scope should apply");
        assert!(
            tunnel
                .raw_config()
                .expect("config should read")
                .contains("AllowedIPs = 0.0.0.0/0")
        );
    }

    #[test]
    fn missing_endpoint_is_inserted_into_peer_section() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let tunnel = tunnel_in(&tmp, ScriptedRunner::new());
        let stripped = SAMPLE_CONFIG.replace("Endpoint = 1.2.3.4:51820\n", "");
        std::fs::write(tunnel.config_path(), stripped).expect("strip endpoint");

        assert_eq!(tunnel.endpoint_host(), None);
        tunnel
            .set_endpoint("198.51.100.7", 51820)
            .expect("insertion should succeed");

        assert_eq!(tunnel.endpoint_host(), Some(String::from("198.51.100.7")));
    }

    #[test]
    fn endpoint_host_strips_the_port() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let tunnel = tunnel_in(&tmp, ScriptedRunner::new());
        assert_eq!(tunnel.endpoint_host(), Some(String::from("1.2.3.4")));
    }

    #[test]
    fn is_connected_requires_an_interface_name() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "wg0\n", "");
        runner.push_output(Some(0), "\n", "");
        let tunnel = tunnel_in(&tmp, runner);

        assert!(tunnel.is_connected());
        assert!(!tunnel.is_connected());
    }

    #[test]
    fn connect_verifies_the_interface_appeared() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_success(); // wg-quick up
        runner.push_output(Some(0), "", ""); // wg show interfaces: nothing up
        let tunnel = tunnel_in(&tmp, runner);

        let err = tunnel.connect().expect_err("unverified up should fail");
        assert!(matches!(err, TunnelError::ConnectFailed { .. }));
    }

    #[test]
    fn tunnel_mode_round_trips_serde_names() {
        assert_eq!(
            serde_json::to_string(&TunnelMode::Socks5).expect("serialise"),
            "\"socks5\""
        );
        assert_eq!(TunnelMode::Vpn.toggled(), TunnelMode::Socks5);
        assert_eq!("socks5".parse::<TunnelMode>(), Ok(TunnelMode::Socks5));
    }
}
