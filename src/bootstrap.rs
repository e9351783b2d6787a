//! Boot payload rendering for new VPN server instances.
//!
//! The startup script template installs WireGuard, publishes the server's
//! public key on the serial console (where the manager collects it), and
//! registers the configured static peers.

use crate::config::AppConfig;

const TEMPLATE: &str = include_str!("startup.sh");
const LISTEN_PORT_PLACEHOLDER: &str = "__LISTEN_PORT__";
const PEER_PLACEHOLDER: &str = "# PEER_CONFIGS_PLACEHOLDER";

/// Renders the startup script with the configured listen port and peers.
#[must_use]
pub fn render_startup_script(config: &AppConfig) -> String {
    let peer_commands = config
        .peers()
        .iter()
        .map(|peer| {
            format!(
                "wg set wg0 peer {} allowed-ips {}",
                peer.public_key, peer.allowed_ip
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    TEMPLATE
        .replace(LISTEN_PORT_PLACEHOLDER, &config.listen_port.to_string())
        .replace(PEER_PLACEHOLDER, &peer_commands)
        .trim()
        .to_owned()
}
