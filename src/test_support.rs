//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::auth::{AuthError, TokenSource};
use crate::backend::{BackendFuture, CloudBackend, CreatedServer, DeployRequest, ServerStatus};
use crate::config::AppConfig;
use crate::netcheck::{NetProbe, PublicIpInfo};
use crate::process::{CommandOutput, CommandRunner, ProcessError};
use crate::state::{DeploymentState, StateStore, StateStoreError};
use crate::tunnel::{TunnelClient, TunnelError, TunnelMode};
use crate::ui::{Console, UiError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Returns a fully-populated configuration for tests.
#[must_use]
pub fn sample_config() -> AppConfig {
    AppConfig {
        project_id: String::from("test-project"),
        machine_type: String::from("e2-micro"),
        network_tier: String::from("PREMIUM"),
        firewall_tags: None,
        instance_prefix: String::from("vpn-server"),
        listen_port: 51820,
        peers: None,
        tunnel_config_file: String::from("/etc/wireguard/wg0.conf"),
        state_file: String::from("state.json"),
        ip_info_service: String::from("https://ipinfo.io/json"),
        connectivity_check_ip: String::from("8.8.8.8"),
        gcloud_bin: String::from("gcloud"),
        wg_bin: String::from("wg"),
        wg_quick_bin: String::from("wg-quick"),
        use_sudo: false,
        auth_method: None,
        service_account_email: None,
        service_account_key_path: None,
    }
}

/// A valid-looking WireGuard public key (44 chars, trailing `=`).
#[must_use]
pub fn sample_key() -> String {
    format!("{}=", "A".repeat(43))
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment supplied for the call.
    pub envs: Vec<(String, String)>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_with_env(
        &self,
        program: &str,
        args: &[OsString],
        envs: &[(String, String)],
    ) -> Result<CommandOutput, ProcessError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            envs: envs.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ProcessError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Token source returning a fixed token.
#[derive(Clone, Debug)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Creates a source that always yields `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

/// Error type produced by [`FakeBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake backend failure: {0}")]
pub struct FakeBackendError(pub String);

#[derive(Debug, Default)]
struct FakeBackendInner {
    create_results: VecDeque<Result<CreatedServer, FakeBackendError>>,
    start_results: VecDeque<Result<Option<String>, FakeBackendError>>,
    stop_results: VecDeque<Result<(), FakeBackendError>>,
    delete_results: VecDeque<Result<(), FakeBackendError>>,
    status_results: VecDeque<ServerStatus>,
    ip_results: VecDeque<Option<String>>,
    serial_results: VecDeque<String>,
    list_results: VecDeque<Result<Vec<String>, FakeBackendError>>,
    calls: Vec<String>,
}

/// Scripted [`CloudBackend`] recording every call it receives.
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeBackendInner>>,
}

impl FakeBackend {
    /// Creates a backend with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every call recorded so far, formatted as `verb name`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.inner).calls.clone()
    }

    /// Counts recorded calls starting with `verb`.
    #[must_use]
    pub fn call_count(&self, verb: &str) -> usize {
        lock(&self.inner)
            .calls
            .iter()
            .filter(|call| call.starts_with(verb))
            .count()
    }

    /// Queues a successful create result.
    pub fn push_create(&self, name: &str, public_ip: Option<&str>) {
        lock(&self.inner)
            .create_results
            .push_back(Ok(CreatedServer {
                name: name.to_owned(),
                public_ip: public_ip.map(str::to_owned),
            }));
    }

    /// Queues a failing create result.
    pub fn push_create_err(&self, message: &str) {
        lock(&self.inner)
            .create_results
            .push_back(Err(FakeBackendError(message.to_owned())));
    }

    /// Queues a start result carrying the assigned public IP.
    pub fn push_start(&self, public_ip: Option<&str>) {
        lock(&self.inner)
            .start_results
            .push_back(Ok(public_ip.map(str::to_owned)));
    }

    /// Queues a failing stop result.
    pub fn push_stop_err(&self, message: &str) {
        lock(&self.inner)
            .stop_results
            .push_back(Err(FakeBackendError(message.to_owned())));
    }

    /// Queues a failing delete result.
    pub fn push_delete_err(&self, message: &str) {
        lock(&self.inner)
            .delete_results
            .push_back(Err(FakeBackendError(message.to_owned())));
    }

    /// Queues a live status answer.
    pub fn push_status(&self, status: ServerStatus) {
        lock(&self.inner).status_results.push_back(status);
    }

    /// Queues a `RUNNING` status answer.
    pub fn push_status_running(&self) {
        self.push_status(ServerStatus::Known {
            raw: crate::state::STATUS_RUNNING.to_owned(),
        });
    }

    /// Queues a public IP answer.
    pub fn push_ip(&self, ip: Option<&str>) {
        lock(&self.inner)
            .ip_results
            .push_back(ip.map(str::to_owned));
    }

    /// Queues serial console contents.
    pub fn push_serial(&self, contents: &str) {
        lock(&self.inner)
            .serial_results
            .push_back(contents.to_owned());
    }

    /// Queues an instance listing.
    pub fn push_list(&self, names: &[&str]) {
        lock(&self.inner)
            .list_results
            .push_back(Ok(names.iter().map(|name| (*name).to_owned()).collect()));
    }

    /// Queues a failing instance listing.
    pub fn push_list_err(&self, message: &str) {
        lock(&self.inner)
            .list_results
            .push_back(Err(FakeBackendError(message.to_owned())));
    }

    fn record(&self, call: String) {
        lock(&self.inner).calls.push(call);
    }
}

impl CloudBackend for FakeBackend {
    type Error = FakeBackendError;

    fn create_server<'a>(
        &'a self,
        request: &'a DeployRequest,
    ) -> BackendFuture<'a, CreatedServer, Self::Error> {
        self.record(format!("create {}", request.name));
        let result = lock(&self.inner)
            .create_results
            .pop_front()
            .unwrap_or_else(|| Err(FakeBackendError(String::from("unscripted create"))));
        Box::pin(async move { result })
    }

    fn start_server<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        self.record(format!("start {name}"));
        let result = lock(&self.inner)
            .start_results
            .pop_front()
            .unwrap_or_else(|| Err(FakeBackendError(String::from("unscripted start"))));
        Box::pin(async move { result })
    }

    fn stop_server<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        self.record(format!("stop {name}"));
        let result = lock(&self.inner).stop_results.pop_front().unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn delete_server<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        self.record(format!("delete {name}"));
        let result = lock(&self.inner)
            .delete_results
            .pop_front()
            .unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn server_status<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, ServerStatus, Self::Error> {
        self.record(format!("status {name}"));
        let result = lock(&self.inner)
            .status_results
            .pop_front()
            .unwrap_or(ServerStatus::Unavailable {
                message: String::from("unscripted status"),
            });
        Box::pin(async move { Ok(result) })
    }

    fn public_ip<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        self.record(format!("public_ip {name}"));
        let result = lock(&self.inner).ip_results.pop_front().unwrap_or(None);
        Box::pin(async move { Ok(result) })
    }

    fn read_serial_console<'a>(
        &'a self,
        name: &'a str,
        _zone: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        self.record(format!("serial {name}"));
        let result = lock(&self.inner)
            .serial_results
            .pop_front()
            .unwrap_or_default();
        Box::pin(async move { Ok(result) })
    }

    fn list_server_names<'a>(
        &'a self,
        _zone: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error> {
        self.record(String::from("list"));
        let result = lock(&self.inner)
            .list_results
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()));
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct FakeTunnelInner {
    connected: bool,
    endpoint: Option<(String, u16)>,
    peer_key: Option<String>,
    route_scope: Option<TunnelMode>,
    fail_connect: bool,
    fail_disconnect: bool,
    fail_config: bool,
    events: Vec<String>,
}

/// In-memory [`TunnelClient`] recording every mutation.
#[derive(Clone, Debug, Default)]
pub struct FakeTunnel {
    inner: Arc<Mutex<FakeTunnelInner>>,
}

impl FakeTunnel {
    /// Creates a disconnected tunnel with an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the tunnel as currently connected.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.inner).connected = connected;
    }

    /// Seeds the configured endpoint host and port.
    pub fn seed_endpoint(&self, host: &str, port: u16) {
        lock(&self.inner).endpoint = Some((host.to_owned(), port));
    }

    /// Makes subsequent connect attempts fail.
    pub fn fail_connect(&self) {
        lock(&self.inner).fail_connect = true;
    }

    /// Makes subsequent disconnect attempts fail.
    pub fn fail_disconnect(&self) {
        lock(&self.inner).fail_disconnect = true;
    }

    /// Makes subsequent config rewrites fail.
    pub fn fail_config(&self) {
        lock(&self.inner).fail_config = true;
    }

    /// Returns every mutation recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        lock(&self.inner).events.clone()
    }

    /// Returns the configured peer key, if any.
    #[must_use]
    pub fn peer_key(&self) -> Option<String> {
        lock(&self.inner).peer_key.clone()
    }

    /// Returns the applied route scope, if any.
    #[must_use]
    pub fn route_scope(&self) -> Option<TunnelMode> {
        lock(&self.inner).route_scope
    }

    /// Returns the configured endpoint, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<(String, u16)> {
        lock(&self.inner).endpoint.clone()
    }

    fn config_guard(&self) -> Result<(), TunnelError> {
        if lock(&self.inner).fail_config {
            return Err(TunnelError::Io {
                path: camino::Utf8PathBuf::from("/fake/wg0.conf"),
                message: String::from("simulated config failure"),
            });
        }
        Ok(())
    }
}

impl TunnelClient for FakeTunnel {
    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    fn connect(&self) -> Result<(), TunnelError> {
        let mut inner = lock(&self.inner);
        inner.events.push(String::from("connect"));
        if inner.fail_connect {
            return Err(TunnelError::ConnectFailed {
                message: String::from("simulated connect failure"),
            });
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TunnelError> {
        let mut inner = lock(&self.inner);
        inner.events.push(String::from("disconnect"));
        if inner.fail_disconnect {
            return Err(TunnelError::DisconnectFailed {
                message: String::from("simulated disconnect failure"),
            });
        }
        inner.connected = false;
        Ok(())
    }

    fn set_endpoint(&self, host: &str, port: u16) -> Result<(), TunnelError> {
        self.config_guard()?;
        let mut inner = lock(&self.inner);
        inner.events.push(format!("set_endpoint {host}:{port}"));
        inner.endpoint = Some((host.to_owned(), port));
        Ok(())
    }

    fn set_peer_key(&self, key: &str) -> Result<(), TunnelError> {
        self.config_guard()?;
        let mut inner = lock(&self.inner);
        inner.events.push(format!("set_peer_key {key}"));
        inner.peer_key = Some(key.to_owned());
        Ok(())
    }

    fn set_route_scope(&self, mode: TunnelMode) -> Result<(), TunnelError> {
        self.config_guard()?;
        let mut inner = lock(&self.inner);
        inner.events.push(format!("set_route_scope {mode}"));
        inner.route_scope = Some(mode);
        Ok(())
    }

    fn endpoint_host(&self) -> Option<String> {
        lock(&self.inner)
            .endpoint
            .as_ref()
            .map(|(host, _)| host.clone())
    }

    fn raw_config(&self) -> Result<String, TunnelError> {
        let inner = lock(&self.inner);
        let endpoint = inner
            .endpoint
            .as_ref()
            .map_or_else(String::new, |(host, port)| {
                format!("Endpoint = {host}:{port}\n")
            });
        Ok(format!("[Interface]\n\n[Peer]\n{endpoint}"))
    }
}

/// In-memory [`StateStore`] counting persisted writes.
#[derive(Clone, Debug, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<DeploymentState>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStateStore {
    /// Creates a store holding the default (empty) state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `state`.
    #[must_use]
    pub fn with_state(state: DeploymentState) -> Self {
        let store = Self::new();
        *lock(&store.state) = state;
        store
    }

    /// Returns the currently persisted state.
    #[must_use]
    pub fn current(&self) -> DeploymentState {
        lock(&self.state).clone()
    }

    /// Returns the number of times `save` has been called.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<DeploymentState, StateStoreError> {
        Ok(lock(&self.state).clone())
    }

    fn save(&self, state: &DeploymentState) -> Result<(), StateStoreError> {
        *lock(&self.state) = state.clone();
        *lock(&self.saves) += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScriptedConsoleInner {
    interactive: bool,
    confirms: VecDeque<bool>,
    modes: VecDeque<TunnelMode>,
    zones: VecDeque<Option<String>>,
    lines: Vec<String>,
}

/// Console fake with scripted prompt answers and recorded output lines.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConsole {
    inner: Arc<Mutex<ScriptedConsoleInner>>,
}

impl ScriptedConsole {
    /// Creates a non-interactive console.
    #[must_use]
    pub fn headless() -> Self {
        Self::default()
    }

    /// Creates an interactive console whose prompts must be scripted.
    #[must_use]
    pub fn interactive() -> Self {
        let console = Self::default();
        lock(&console.inner).interactive = true;
        console
    }

    /// Queues a confirm answer.
    pub fn push_confirm(&self, answer: bool) {
        lock(&self.inner).confirms.push_back(answer);
    }

    /// Queues a mode selection answer.
    pub fn push_mode(&self, mode: TunnelMode) {
        lock(&self.inner).modes.push_back(mode);
    }

    /// Queues a zone prompt answer.
    pub fn push_zone(&self, zone: Option<&str>) {
        lock(&self.inner).zones.push_back(zone.map(str::to_owned));
    }

    /// Returns every line printed so far, prefixed with its level.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner).lines.clone()
    }

    /// Returns `true` when any printed line contains `needle`.
    #[must_use]
    pub fn printed(&self, needle: &str) -> bool {
        lock(&self.inner)
            .lines
            .iter()
            .any(|line| line.contains(needle))
    }

    fn push_line(&self, level: &str, message: &str) {
        lock(&self.inner).lines.push(format!("{level}: {message}"));
    }
}

impl Console for ScriptedConsole {
    fn is_interactive(&self) -> bool {
        lock(&self.inner).interactive
    }

    fn info(&self, message: &str) {
        self.push_line("INFO", message);
    }

    fn success(&self, message: &str) {
        self.push_line("SUCCESS", message);
    }

    fn warning(&self, message: &str) {
        self.push_line("WARNING", message);
    }

    fn error(&self, message: &str) {
        self.push_line("ERROR", message);
    }

    fn confirm(&self, _prompt: &str) -> Result<bool, UiError> {
        Ok(lock(&self.inner).confirms.pop_front().unwrap_or(false))
    }

    fn choose_mode(&self) -> Result<TunnelMode, UiError> {
        Ok(lock(&self.inner).modes.pop_front().unwrap_or_default())
    }

    fn prompt_zone(&self) -> Result<Option<String>, UiError> {
        Ok(lock(&self.inner).zones.pop_front().unwrap_or(None))
    }
}

/// Fixed-answer [`NetProbe`].
#[derive(Clone, Debug, Default)]
pub struct StaticProbe {
    /// Answer returned by `ping`.
    pub reachable: bool,
    /// Answer returned by `public_ip_info`.
    pub info: Option<PublicIpInfo>,
}

impl NetProbe for StaticProbe {
    fn ping(&self, _address: &str) -> bool {
        self.reachable
    }

    fn public_ip_info<'a>(
        &'a self,
        _service_url: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<PublicIpInfo>> + Send + 'a>>
    {
        let info = self.info.clone();
        Box::pin(async move { info })
    }
}
