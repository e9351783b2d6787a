//! Binary entry point for the stratus CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use stratus::{
    AppConfig, AuthConfig, AuthError, ConfigError, Console, EngineError, GceBackend, GceError,
    GcloudTokenSource, JsonStateStore, MenuAction, ProcessCommandRunner, Reconciler,
    SystemNetProbe, TerminalConsole, TunnelMode, UiError, WgQuickTunnel, expand_tilde,
    is_credential_error, ui,
};

mod cli;

use cli::{Cli, CliAction, ModeArg};

type Engine = Reconciler<
    GceBackend,
    WgQuickTunnel<ProcessCommandRunner>,
    JsonStateStore,
    TerminalConsole,
    SystemNetProbe<ProcessCommandRunner>,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error("backend error: {0}")]
    Backend(#[from] GceError),
    #[error(transparent)]
    Engine(#[from] EngineError<GceError>),
    #[error(transparent)]
    Ui(#[from] UiError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "stratus=debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config = AppConfig::load_without_cli_args()?;
    config.validate()?;

    let auth = AuthConfig::resolve(
        cli.adc,
        cli.impersonate.clone(),
        cli.sa_key.clone(),
        &config,
    )?;

    let console = if cli.action().is_some() {
        TerminalConsole::headless()
    } else {
        TerminalConsole::interactive()
    };

    let backend = initialise_backend(&config, &auth, &console)?;

    let runner = ProcessCommandRunner;
    let tunnel = WgQuickTunnel::new(
        expand_tilde(&config.tunnel_config_file),
        config.wg_bin.clone(),
        config.wg_quick_bin.clone(),
        config.use_sudo,
        runner.clone(),
    );
    let store = JsonStateStore::new(expand_tilde(&config.state_file));
    let probe = SystemNetProbe::new(runner);
    let engine = Reconciler::new(config, backend, tunnel, store, console.clone(), probe);

    match cli.action() {
        Some(action) => dispatch(&engine, &console, action, &cli).await,
        None => menu_loop(&engine, &console).await,
    }
}

/// Builds the backend, applying the interactive re-authentication policy:
/// on a first credential failure under ADC the user is offered a
/// `gcloud auth application-default login` run and one retry.
fn initialise_backend(
    config: &AppConfig,
    auth: &AuthConfig,
    console: &TerminalConsole,
) -> Result<GceBackend, CliError> {
    let connect = |config: &AppConfig| {
        let token_source = Arc::new(GcloudTokenSource::new(
            config.gcloud_bin.clone(),
            auth.clone(),
            ProcessCommandRunner,
        ));
        GceBackend::connect(config, token_source)
    };

    match connect(config) {
        Ok(backend) => Ok(backend),
        Err(GceError::Auth(err))
            if *auth == AuthConfig::Adc
                && console.is_interactive()
                && is_credential_error(&err.to_string()) =>
        {
            console.error(&format!("GCP auth error: {err}"));
            console.info("Try running 'gcloud auth application-default login'.");
            if console.confirm("Run 'gcloud auth application-default login' now?")? {
                let status = process::Command::new(&config.gcloud_bin)
                    .args(["auth", "application-default", "login"])
                    .status();
                if matches!(status, Ok(code) if code.success()) {
                    console.success("Re-auth successful. Retrying initialisation...");
                    return connect(config).map_err(CliError::from);
                }
                console.error("gcloud login failed or was cancelled.");
            }
            Err(CliError::Auth(err))
        }
        Err(err) => Err(err.into()),
    }
}

async fn dispatch(
    engine: &Engine,
    console: &TerminalConsole,
    action: CliAction,
    cli: &Cli,
) -> Result<i32, CliError> {
    match action {
        CliAction::Deploy => {
            let zone = cli.zone.clone().unwrap_or_default();
            ui::with_spinner("Deploying VPN instance...", engine.deploy(&zone)).await?;
            console.success("Deployment complete.");
        }
        CliAction::Start => {
            ui::with_spinner("Starting VPN instance...", engine.start()).await?;
            console.success("Instance started.");
        }
        CliAction::Stop => {
            ui::with_spinner("Stopping VPN instance...", engine.stop()).await?;
            console.success("Instance stopped.");
        }
        CliAction::Delete => {
            ui::with_spinner("Deleting VPN instance...", engine.delete(cli.force)).await?;
            console.success("Instance deleted.");
        }
        CliAction::Connect(mode) => {
            ui::with_spinner("Connecting...", engine.connect(Some(tunnel_mode(mode)))).await?;
            console.success("Connected.");
        }
        CliAction::Disconnect => {
            engine.disconnect()?;
            console.success("Disconnected.");
        }
        CliAction::RotateIp => {
            ui::with_spinner(
                "Rotating VPN server IP...",
                engine.rotate_ip(cli.zone.as_deref()),
            )
            .await?;
        }
        CliAction::Status => {
            engine.sync_status().await?;
        }
        CliAction::ShowConfig => {
            console.display_block(&engine.tunnel_config()?);
        }
    }
    Ok(0)
}

async fn menu_loop(engine: &Engine, console: &TerminalConsole) -> Result<i32, CliError> {
    loop {
        let (header, info_line) = engine.state_summary().await?;
        console.display_banner(&header, &info_line);

        let state = engine.state_snapshot()?;
        let connected = engine.tunnel_connected();
        let action = console.main_menu(&state, connected)?;

        if action == MenuAction::Exit {
            console.info("Exiting. Goodbye!");
            return Ok(0);
        }

        if let Err(err) = perform_menu_action(engine, console, action).await {
            console.error(&err.to_string());
            console.warning("Previous action encountered an issue.");
        }
        console.pause();
    }
}

async fn perform_menu_action(
    engine: &Engine,
    console: &TerminalConsole,
    action: MenuAction,
) -> Result<(), CliError> {
    match action {
        MenuAction::Deploy => match console.prompt_zone()? {
            Some(zone) => {
                ui::with_spinner("Deploying VPN instance...", engine.deploy(&zone)).await?;
                let connect_now = console
                    .confirm("Deployment successful. Would you like to connect to the VPN now?")?;
                if connect_now {
                    ui::with_spinner("Connecting...", engine.connect(None)).await?;
                }
            }
            None => console.warning("Zone selection cancelled."),
        },
        MenuAction::Start => {
            ui::with_spinner("Starting VPN instance...", engine.start()).await?;
        }
        MenuAction::Stop => {
            ui::with_spinner("Stopping VPN instance...", engine.stop()).await?;
        }
        MenuAction::DisconnectAndStop => {
            engine.disconnect()?;
            ui::with_spinner("Stopping VPN instance...", engine.stop()).await?;
        }
        MenuAction::Delete => {
            ui::with_spinner("Deleting VPN instance...", engine.delete(false)).await?;
        }
        MenuAction::Connect => {
            ui::with_spinner("Connecting...", engine.connect(None)).await?;
        }
        MenuAction::Disconnect => engine.disconnect()?,
        MenuAction::ChangeTunnelMode => engine.switch_mode(None).await?,
        MenuAction::RotateIp => engine.rotate_ip(None).await?,
        MenuAction::StatusCheck => {
            engine.sync_status().await?;
        }
        MenuAction::ShowConfig => console.display_block(&engine.tunnel_config()?),
        MenuAction::Exit => {}
    }
    Ok(())
}

const fn tunnel_mode(mode: ModeArg) -> TunnelMode {
    match mode {
        ModeArg::Vpn => TunnelMode::Vpn,
        ModeArg::Socks5 => TunnelMode::Socks5,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
    if is_credential_error(&err.to_string()) {
        writeln!(
            io::stderr(),
            "Hint: run 'gcloud auth application-default login' and retry."
        )
        .ok();
    }
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_arg_maps_onto_tunnel_mode() {
        assert_eq!(tunnel_mode(ModeArg::Vpn), TunnelMode::Vpn);
        assert_eq!(tunnel_mode(ModeArg::Socks5), TunnelMode::Socks5);
    }

    #[test]
    fn write_error_renders_the_message() {
        let mut buf = Vec::new();
        let err = CliError::Engine(EngineError::NoInstance);
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("no instance found in state"), "rendered: {rendered}");
    }
}
