//! Terminal interaction: styled status lines, prompts, menus, and spinners.
//!
//! The reconciliation engine talks to the user exclusively through the
//! [`Console`] trait so headless runs and tests can substitute their own
//! implementations. Prompt rendering is delegated to `dialoguer` and the
//! spinner to `indicatif`; neither leaks past this module.

use std::future::Future;
use std::time::Duration;

use dialoguer::console::{Term, style};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::state::DeploymentState;
use crate::tunnel::TunnelMode;

/// Errors raised while prompting the user.
#[derive(Debug, Error)]
pub enum UiError {
    /// Raised when a prompt cannot be rendered or read.
    #[error("prompt failed: {0}")]
    Prompt(String),
}

impl From<dialoguer::Error> for UiError {
    fn from(value: dialoguer::Error) -> Self {
        Self::Prompt(value.to_string())
    }
}

/// User-facing output and confirmation surface used by the engine.
pub trait Console {
    /// Whether prompts may be shown. Non-interactive runs must never block
    /// on input.
    fn is_interactive(&self) -> bool;

    /// Prints an informational line.
    fn info(&self, message: &str);
    /// Prints a success line.
    fn success(&self, message: &str);
    /// Prints a warning line.
    fn warning(&self, message: &str);
    /// Prints an error line.
    fn error(&self, message: &str);

    /// Asks a yes/no question. Non-interactive consoles answer `false`
    /// without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`UiError`] when the prompt cannot be rendered.
    fn confirm(&self, prompt: &str) -> Result<bool, UiError>;

    /// Asks the user to pick a tunnel mode. Non-interactive consoles return
    /// the default mode.
    ///
    /// # Errors
    ///
    /// Returns [`UiError`] when the prompt cannot be rendered.
    fn choose_mode(&self) -> Result<TunnelMode, UiError>;

    /// Asks the user for a target zone; an empty answer means "keep the
    /// current one". Non-interactive consoles return `None`.
    ///
    /// # Errors
    ///
    /// Returns [`UiError`] when the prompt cannot be rendered.
    fn prompt_zone(&self) -> Result<Option<String>, UiError>;
}

/// Console writing styled lines to the terminal.
#[derive(Clone, Debug)]
pub struct TerminalConsole {
    term: Term,
    interactive: bool,
}

impl TerminalConsole {
    /// Creates a console that may prompt the user.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            term: Term::stdout(),
            interactive: true,
        }
    }

    /// Creates a console for flag-driven runs; prompts resolve to their
    /// conservative defaults.
    #[must_use]
    pub fn headless() -> Self {
        Self {
            term: Term::stdout(),
            interactive: false,
        }
    }

    fn write(&self, message: &str) {
        self.term.write_line(message).ok();
    }

    /// Prints the state summary banner shown at the top of each interactive
    /// loop iteration.
    pub fn display_banner(&self, header: &str, info_line: &str) {
        self.write("");
        self.write(&format!(
            "======================={}=======================",
            style(header).bold()
        ));
        self.write(info_line);
        self.write(&"-".repeat(76));
        self.write("");
    }

    /// Prints a raw block of text (for example a configuration file).
    pub fn display_block(&self, contents: &str) {
        self.write(contents);
    }

    /// Waits for the user to press Enter before redrawing the menu.
    pub fn pause(&self) {
        if !self.interactive {
            return;
        }
        let prompt: Result<String, dialoguer::Error> = Input::new()
            .with_prompt(style("Press Enter to continue").blue().to_string())
            .allow_empty(true)
            .interact_text();
        prompt.ok();
    }

    /// Shows the state-dependent main menu and returns the chosen action.
    ///
    /// # Errors
    ///
    /// Returns [`UiError`] when the menu cannot be rendered.
    pub fn main_menu(
        &self,
        state: &DeploymentState,
        tunnel_connected: bool,
    ) -> Result<MenuAction, UiError> {
        let actions = menu_actions(state, tunnel_connected);
        let labels: Vec<&str> = actions.iter().map(|action| action.label()).collect();
        let index = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Choose an action")
            .items(&labels)
            .default(0)
            .interact()?;
        Ok(actions.get(index).copied().unwrap_or(MenuAction::Exit))
    }
}

impl Console for TerminalConsole {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn info(&self, message: &str) {
        self.write(&style(message).blue().to_string());
    }

    fn success(&self, message: &str) {
        self.write(&style(message).green().to_string());
    }

    fn warning(&self, message: &str) {
        self.write(&style(message).yellow().to_string());
    }

    fn error(&self, message: &str) {
        self.write(&style(message).red().to_string());
    }

    fn confirm(&self, prompt: &str) -> Result<bool, UiError> {
        if !self.interactive {
            return Ok(false);
        }
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }

    fn choose_mode(&self) -> Result<TunnelMode, UiError> {
        if !self.interactive {
            return Ok(TunnelMode::default());
        }
        let index = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select connection mode")
            .items(&[
                "VPN (route all traffic through the tunnel)",
                "SOCKS5 (route only proxy traffic through the tunnel)",
            ])
            .default(0)
            .interact()?;
        Ok(if index == 1 {
            TunnelMode::Socks5
        } else {
            TunnelMode::Vpn
        })
    }

    fn prompt_zone(&self) -> Result<Option<String>, UiError> {
        if !self.interactive {
            return Ok(None);
        }
        let answer: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Target zone (e.g. us-central1-a, empty to keep current)")
            .allow_empty(true)
            .interact_text()?;
        let trimmed = answer.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_owned()))
        }
    }
}

/// Actions offered by the interactive main menu.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MenuAction {
    /// Deploy a new VPN server.
    Deploy,
    /// Start the stopped server.
    Start,
    /// Stop the running server.
    Stop,
    /// Disconnect the tunnel, then stop the server.
    DisconnectAndStop,
    /// Permanently delete the server.
    Delete,
    /// Connect the local tunnel.
    Connect,
    /// Disconnect the local tunnel.
    Disconnect,
    /// Switch between VPN and SOCKS5 routing.
    ChangeTunnelMode,
    /// Replace the server to obtain a new public address.
    RotateIp,
    /// Run the drift detection and repair checks.
    StatusCheck,
    /// Show the local WireGuard configuration.
    ShowConfig,
    /// Leave the menu loop.
    Exit,
}

impl MenuAction {
    /// Menu label shown to the user.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Deploy => "Deploy",
            Self::Start => "Start VPN Server",
            Self::Stop => "Stop VPN Server",
            Self::DisconnectAndStop => "Disconnect & Stop VPN Server",
            Self::Delete => "Delete VPN Server",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::ChangeTunnelMode => "Change Tunnel Mode",
            Self::RotateIp => "Rotate IP Address",
            Self::StatusCheck => "Run Status Check",
            Self::ShowConfig => "View WireGuard Config",
            Self::Exit => "Exit",
        }
    }
}

/// Builds the list of actions offered for the current state, mirroring what
/// is legal to attempt: deploy only when nothing is recorded, start only when
/// stopped, connect only when running and down, and so on.
#[must_use]
pub fn menu_actions(state: &DeploymentState, tunnel_connected: bool) -> Vec<MenuAction> {
    let mut actions: Vec<MenuAction> = Vec::new();
    match state.status.as_deref() {
        None => actions.push(MenuAction::Deploy),
        Some(crate::state::STATUS_RUNNING) => {
            if tunnel_connected {
                actions.extend([
                    MenuAction::DisconnectAndStop,
                    MenuAction::ChangeTunnelMode,
                    MenuAction::Disconnect,
                ]);
            } else {
                actions.extend([MenuAction::Stop, MenuAction::Connect]);
            }
            actions.extend([MenuAction::RotateIp, MenuAction::Delete]);
        }
        Some(_) => actions.extend([MenuAction::Start, MenuAction::Delete]),
    }
    actions.extend([
        MenuAction::StatusCheck,
        MenuAction::ShowConfig,
        MenuAction::Exit,
    ]);
    actions
}

/// Runs `future` while showing a spinner with `message`. The spinner is
/// skipped when the terminal is not a TTY.
pub async fn with_spinner<F, T>(message: &str, future: F) -> T
where
    F: Future<Output = T>,
{
    let term = Term::stdout();
    if !term.is_term() {
        return future.await;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_owned());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = future.await;
    spinner.finish_and_clear();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_state(connected: bool) -> (DeploymentState, bool) {
        let mut state = DeploymentState::default();
        state.record_deployment("vpn-server-us-central1-a", "us-central1", "us-central1-a");
        (state, connected)
    }

    #[test]
    fn menu_labels_are_unique() {
        let actions = [
            MenuAction::Deploy,
            MenuAction::Start,
            MenuAction::Stop,
            MenuAction::DisconnectAndStop,
            MenuAction::Delete,
            MenuAction::Connect,
            MenuAction::Disconnect,
            MenuAction::ChangeTunnelMode,
            MenuAction::RotateIp,
            MenuAction::StatusCheck,
            MenuAction::ShowConfig,
            MenuAction::Exit,
        ];
        let mut labels: Vec<&str> = actions.iter().map(|action| action.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), actions.len());
    }

    #[test]
    fn headless_console_answers_prompts_conservatively() {
        let console = TerminalConsole::headless();
        assert!(!console.is_interactive());
        assert!(!console.confirm("delete?").expect("no prompt"));
        assert_eq!(console.choose_mode().expect("no prompt"), TunnelMode::Vpn);
        assert_eq!(console.prompt_zone().expect("no prompt"), None);
    }

    #[test]
    fn empty_state_menu_offers_deploy_first() {
        let actions = menu_actions(&DeploymentState::default(), false);
        assert_eq!(actions.first(), Some(&MenuAction::Deploy));
        assert!(!actions.contains(&MenuAction::Stop));
    }

    #[test]
    fn running_disconnected_menu_offers_stop_and_connect() {
        let (state, connected) = running_state(false);
        let actions = menu_actions(&state, connected);
        assert!(actions.contains(&MenuAction::Stop));
        assert!(actions.contains(&MenuAction::Connect));
        assert!(actions.contains(&MenuAction::RotateIp));
        assert!(!actions.contains(&MenuAction::Disconnect));
    }

    #[test]
    fn running_connected_menu_offers_disconnect_paths() {
        let (state, connected) = running_state(true);
        let actions = menu_actions(&state, connected);
        assert!(actions.contains(&MenuAction::DisconnectAndStop));
        assert!(actions.contains(&MenuAction::ChangeTunnelMode));
        assert!(!actions.contains(&MenuAction::Connect));
    }

    #[test]
    fn stopped_menu_offers_start_and_delete() {
        let mut state = DeploymentState::default();
        state.record_deployment("vpn", "us-central1", "us-central1-a");
        state.status = Some(crate::state::STATUS_TERMINATED.to_owned());
        let actions = menu_actions(&state, false);
        assert_eq!(actions.first(), Some(&MenuAction::Start));
        assert!(actions.contains(&MenuAction::Delete));
    }
}
