//! Supervision of the per-service runtime processes
//!
//! One child is started per service. Output and exit are published as
//! [`LifecycleEvent`]s on a broadcast channel; logging is just one subscriber
//! (see [`spawn_event_logger`]). There is no restart policy: a child that
//! exits stays down until the gateway itself is restarted.

use crate::registry::Registry;
use dashmap::DashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long an exit waits for the output relays to flush their last lines
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Signal broadcast to children on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
}

impl StopSignal {
    pub fn name(&self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Interrupt => "SIGINT",
        }
    }

    /// Exit status of the gateway after shutting down on this signal
    pub fn exit_code(&self) -> i32 {
        match self {
            StopSignal::Terminate => 1,
            StopSignal::Interrupt => 0,
        }
    }

    #[cfg(unix)]
    fn as_raw(&self) -> libc::c_int {
        match self {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Interrupt => libc::SIGINT,
        }
    }
}

/// Listens for the signals that stop the gateway
///
/// Handlers are installed on construction, so a signal arriving while the
/// runtimes are still starting is held until [`recv`](Self::recv).
#[cfg(unix)]
pub struct StopListener {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl StopListener {
    pub fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
        let sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;
        Ok(Self { sigterm, sigint })
    }

    pub async fn recv(&mut self) -> StopSignal {
        tokio::select! {
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                StopSignal::Terminate
            }
            _ = self.sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                StopSignal::Interrupt
            }
        }
    }
}

#[cfg(not(unix))]
pub struct StopListener {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl StopListener {
    pub fn install() -> anyhow::Result<Self> {
        let ctrl_c = tokio::signal::windows::ctrl_c()
            .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))?;
        Ok(Self { ctrl_c })
    }

    pub async fn recv(&mut self) -> StopSignal {
        self.ctrl_c.recv().await;
        info!("Received Ctrl+C, shutting down...");
        StopSignal::Interrupt
    }
}

/// Lifecycle state of a service runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Spawned, no output seen yet
    Starting,
    /// Spawned and producing output
    Running,
    /// Exited with the given code (`None` when killed by a signal)
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Events published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started {
        service: String,
        pid: u32,
        port: u16,
    },
    OutputLine {
        service: String,
        stream: OutputStream,
        line: String,
    },
    Exited {
        service: String,
        code: Option<i32>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("service '{service}' is already running")]
    AlreadyTracked { service: String },
    #[error("failed to spawn runtime for service '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

/// The command used to start a service runtime
///
/// A child is invoked as `<program> <args..> <port_flag> <port> <extra..>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub port_flag: String,
}

impl RuntimeCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            port_flag: "--port".to_string(),
        }
    }

    /// Parse a shell-style command line such as `sls offline start`
    pub fn parse(command_line: &str) -> anyhow::Result<Self> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| anyhow::anyhow!("Invalid runtime command '{}': {}", command_line, e))?;
        if words.is_empty() {
            anyhow::bail!("Runtime command is empty");
        }
        let program = words.remove(0);
        Ok(Self::new(program, words))
    }

    pub fn with_port_flag(mut self, flag: impl Into<String>) -> Self {
        self.port_flag = flag.into();
        self
    }

    /// Full argument list for a child listening on `port`
    pub fn build_args(&self, port: u16, extra_args: &[String]) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(self.port_flag.clone());
        args.push(port.to_string());
        args.extend(extra_args.iter().cloned());
        args
    }
}

impl Default for RuntimeCommand {
    fn default() -> Self {
        Self::new("sls", vec!["offline".to_string(), "start".to_string()])
    }
}

/// Snapshot of a tracked child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcessHandle {
    pub service: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub state: ChildState,
}

struct TrackedChild {
    /// Distinguishes successive runs of the same service
    id: u64,
    handle: ChildProcessHandle,
    #[cfg(not(unix))]
    kill_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TrackedChild {
    #[cfg(unix)]
    fn signal(self, signal: StopSignal) {
        let Some(pid) = self.handle.pid else {
            return;
        };
        info!(service = %self.handle.service, pid, signal = signal.name(), "Signalling service runtime");
        let result = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            warn!(service = %self.handle.service, pid, error = %err, "Failed to signal service runtime");
        }
    }

    #[cfg(not(unix))]
    fn signal(mut self, signal: StopSignal) {
        info!(service = %self.handle.service, signal = signal.name(), "Killing service runtime");
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Owns every running service runtime, keyed by service name
pub struct Supervisor {
    runtime: RuntimeCommand,
    children: Arc<DashMap<String, TrackedChild>>,
    exits: Arc<DashMap<String, Option<i32>>>,
    events: broadcast::Sender<LifecycleEvent>,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(runtime: RuntimeCommand) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            runtime,
            children: Arc::new(DashMap::new()),
            exits: Arc::new(DashMap::new()),
            events,
            next_id: AtomicU64::new(0),
        })
    }

    /// Subscribe to lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Spawn the runtime for one service
    ///
    /// Returns as soon as the process is spawned; readiness is not awaited.
    pub async fn start_service(
        &self,
        service: &str,
        service_dir: &Path,
        extra_args: &[String],
        port: u16,
    ) -> Result<ChildProcessHandle, SupervisorError> {
        if self.children.contains_key(service) {
            return Err(SupervisorError::AlreadyTracked {
                service: service.to_string(),
            });
        }

        let args = self.runtime.build_args(port, extra_args);
        info!(
            service,
            program = %self.runtime.program,
            args = ?args,
            dir = %service_dir.display(),
            "Starting service runtime"
        );

        let mut cmd = Command::new(&self.runtime.program);
        cmd.args(&args);
        cmd.current_dir(service_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            service: service.to_string(),
            source,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let handle = ChildProcessHandle {
            service: service.to_string(),
            pid,
            port,
            state: ChildState::Starting,
        };

        #[cfg(not(unix))]
        let (kill_tx, kill_rx) = tokio::sync::oneshot::channel();

        // Tracked before monitoring starts so a fast exit still finds its entry
        self.exits.remove(service);
        self.children.insert(
            service.to_string(),
            TrackedChild {
                id,
                handle: handle.clone(),
                #[cfg(not(unix))]
                kill_tx: Some(kill_tx),
            },
        );

        if let Some(pid) = pid {
            let _ = self.events.send(LifecycleEvent::Started {
                service: service.to_string(),
                pid,
                port,
            });
        }

        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(self.spawn_relay(stdout, service, id, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.push(self.spawn_relay(stderr, service, id, OutputStream::Stderr));
        }

        let monitor = ExitMonitor {
            service: service.to_string(),
            id,
            children: Arc::clone(&self.children),
            exits: Arc::clone(&self.exits),
            events: self.events.clone(),
        };
        tokio::spawn(async move {
            #[cfg(unix)]
            monitor.run(child, relays).await;
            #[cfg(not(unix))]
            monitor.run(child, relays, kill_rx).await;
        });

        Ok(handle)
    }

    /// Start every discovered service, continuing past individual failures
    ///
    /// Returns the number of runtimes spawned.
    pub async fn start_all(&self, registry: &Registry, extra_args: &[String]) -> usize {
        let mut started = 0;
        for service in registry.services() {
            match self
                .start_service(&service.name, &service.dir, extra_args, service.port)
                .await
            {
                Ok(_) => started += 1,
                Err(e) => error!(service = %service.name, error = %e, "Failed to start service"),
            }
        }
        started
    }

    /// Send `signal` to every tracked child and forget them all
    ///
    /// Returns how many children were signalled; a repeated call is a no-op.
    pub fn stop_all(&self, signal: StopSignal) -> usize {
        let services: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        let mut signalled = 0;
        for service in services {
            if let Some((_, tracked)) = self.children.remove(&service) {
                tracked.signal(signal);
                signalled += 1;
            }
        }
        if signalled > 0 {
            info!(signalled, signal = signal.name(), "Stop broadcast to service runtimes");
        }
        signalled
    }

    pub fn is_tracked(&self, service: &str) -> bool {
        self.children.contains_key(service)
    }

    pub fn tracked_count(&self) -> usize {
        self.children.len()
    }

    /// Current state, including the exit code of a runtime that has stopped
    pub fn state(&self, service: &str) -> Option<ChildState> {
        self.children
            .get(service)
            .map(|t| t.handle.state)
            .or_else(|| self.exits.get(service).map(|code| ChildState::Exited(*code)))
    }

    /// Snapshot of all tracked children, sorted by service name
    pub fn list(&self) -> Vec<ChildProcessHandle> {
        let mut handles: Vec<ChildProcessHandle> =
            self.children.iter().map(|t| t.handle.clone()).collect();
        handles.sort_by(|a, b| a.service.cmp(&b.service));
        handles
    }

    fn spawn_relay<R>(&self, reader: R, service: &str, id: u64, stream: OutputStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let service = service.to_string();
        let children = Arc::clone(&self.children);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            let mut seen_output = false;

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if !seen_output {
                            seen_output = true;
                            if let Some(mut tracked) = children.get_mut(&service) {
                                if tracked.id == id && tracked.handle.state == ChildState::Starting {
                                    tracked.handle.state = ChildState::Running;
                                }
                            }
                        }
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        let _ = events.send(LifecycleEvent::OutputLine {
                            service: service.clone(),
                            stream,
                            line,
                        });
                    }
                    Err(e) => {
                        debug!(service = %service, stream = stream.as_str(), error = %e, "Output relay stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Waits for a child to exit, then untracks it and publishes the exit
struct ExitMonitor {
    service: String,
    id: u64,
    children: Arc<DashMap<String, TrackedChild>>,
    exits: Arc<DashMap<String, Option<i32>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ExitMonitor {
    #[cfg(unix)]
    async fn run(self, mut child: Child, relays: Vec<JoinHandle<()>>) {
        let status = child.wait().await;
        self.finish(status, relays).await;
    }

    #[cfg(not(unix))]
    async fn run(
        self,
        mut child: Child,
        relays: Vec<JoinHandle<()>>,
        kill_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        self.finish(status, relays).await;
    }

    async fn finish(self, status: std::io::Result<std::process::ExitStatus>, relays: Vec<JoinHandle<()>>) {
        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(service = %self.service, error = %e, "Failed to wait for service runtime");
                None
            }
        };

        // Untracked as soon as the pid is reaped
        let id = self.id;
        self.children.remove_if(&self.service, |_, tracked| tracked.id == id);
        self.exits.insert(self.service.clone(), code);

        // Bounded: a grandchild may hold the pipes open
        let _ = tokio::time::timeout(RELAY_DRAIN_TIMEOUT, async {
            for relay in relays {
                let _ = relay.await;
            }
        })
        .await;

        let _ = self.events.send(LifecycleEvent::Exited {
            service: self.service,
            code,
        });
    }
}

/// Log every lifecycle event until the channel closes
pub fn spawn_event_logger(mut events: broadcast::Receiver<LifecycleEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Started { service, pid, port } => {
            info!(service = %service, pid, port, "Service runtime started");
        }
        LifecycleEvent::OutputLine {
            service,
            stream: OutputStream::Stdout,
            line,
        } => {
            if !line.is_empty() {
                info!(target: "service", service = %service, stream = "stdout", "{}", line);
            }
        }
        LifecycleEvent::OutputLine {
            service,
            stream: OutputStream::Stderr,
            line,
        } => {
            if !line.is_empty() {
                warn!(target: "service", service = %service, stream = "stderr", "{}", line);
            }
        }
        LifecycleEvent::Exited { service, code: Some(0) } => {
            info!(service = %service, "Service runtime exited");
        }
        LifecycleEvent::Exited { service, code: Some(code) } => {
            error!(
                service = %service,
                code,
                "Service runtime failed, check its serverless.yml; it stays down until the gateway restarts"
            );
        }
        LifecycleEvent::Exited { service, code: None } => {
            warn!(service = %service, "Service runtime terminated by signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell runtime that prints its port (the second positional argument)
    fn shell_runtime(script: &str) -> RuntimeCommand {
        RuntimeCommand::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("event channel closed")
    }

    async fn wait_for_exit(rx: &mut broadcast::Receiver<LifecycleEvent>, service: &str) -> Option<i32> {
        loop {
            if let LifecycleEvent::Exited { service: s, code } = next_event(rx).await {
                if s == service {
                    return code;
                }
            }
        }
    }

    #[test]
    fn test_default_runtime_command() {
        let runtime = RuntimeCommand::default();
        assert_eq!(
            runtime.build_args(3003, &["--stage".to_string(), "dev".to_string()]),
            vec!["offline", "start", "--port", "3003", "--stage", "dev"]
        );
    }

    #[test]
    fn test_parse_runtime_command() {
        let runtime = RuntimeCommand::parse("npx serverless offline start --noTimeout")
            .unwrap()
            .with_port_flag("--httpPort");
        assert_eq!(runtime.program, "npx");
        assert_eq!(
            runtime.build_args(4001, &[]),
            vec!["serverless", "offline", "start", "--noTimeout", "--httpPort", "4001"]
        );

        assert!(RuntimeCommand::parse("   ").is_err());
        assert!(RuntimeCommand::parse("sls 'unterminated").is_err());
    }

    #[test]
    fn test_stop_signal_exit_codes() {
        assert_eq!(StopSignal::Terminate.exit_code(), 1);
        assert_eq!(StopSignal::Interrupt.exit_code(), 0);
        assert_eq!(StopSignal::Terminate.name(), "SIGTERM");
    }

    #[test]
    fn test_stop_all_without_children_is_noop() {
        let supervisor = Supervisor::new(RuntimeCommand::default());
        assert_eq!(supervisor.stop_all(StopSignal::Terminate), 0);
        assert_eq!(supervisor.tracked_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_relays_output_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(shell_runtime("echo \"listening on $2\"; exec sleep 30"));
        let mut rx = supervisor.subscribe();

        let handle = supervisor
            .start_service("items", dir.path(), &[], 4101)
            .await
            .unwrap();
        assert_eq!(handle.port, 4101);
        assert!(handle.pid.is_some());
        assert!(supervisor.is_tracked("items"));

        match next_event(&mut rx).await {
            LifecycleEvent::Started { service, port, .. } => {
                assert_eq!(service, "items");
                assert_eq!(port, 4101);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            next_event(&mut rx).await,
            LifecycleEvent::OutputLine {
                service: "items".to_string(),
                stream: OutputStream::Stdout,
                line: "listening on 4101".to_string(),
            }
        );
        assert_eq!(supervisor.state("items"), Some(ChildState::Running));

        supervisor.stop_all(StopSignal::Terminate);
        assert_eq!(wait_for_exit(&mut rx, "items").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_signals_every_child() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(shell_runtime("exec sleep 30"));
        let mut rx = supervisor.subscribe();

        supervisor.start_service("a", dir.path(), &[], 4201).await.unwrap();
        supervisor.start_service("b", dir.path(), &[], 4202).await.unwrap();
        assert_eq!(supervisor.tracked_count(), 2);

        assert_eq!(supervisor.stop_all(StopSignal::Interrupt), 2);
        assert_eq!(supervisor.tracked_count(), 0);
        assert!(supervisor.list().is_empty());

        // Both children actually received the signal
        let mut exited = Vec::new();
        while exited.len() < 2 {
            if let LifecycleEvent::Exited { service, code } = next_event(&mut rx).await {
                assert_eq!(code, None);
                exited.push(service);
            }
        }
        exited.sort();
        assert_eq!(exited, vec!["a", "b"]);

        assert_eq!(supervisor.stop_all(StopSignal::Interrupt), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_child_is_untracked_with_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(shell_runtime("echo boom >&2; exit 3"));
        let mut rx = supervisor.subscribe();

        supervisor.start_service("broken", dir.path(), &[], 4301).await.unwrap();

        let mut saw_stderr = false;
        loop {
            match next_event(&mut rx).await {
                LifecycleEvent::OutputLine { stream: OutputStream::Stderr, line, .. } => {
                    assert_eq!(line, "boom");
                    saw_stderr = true;
                }
                LifecycleEvent::Exited { code, .. } => {
                    assert_eq!(code, Some(3));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_stderr);
        assert!(!supervisor.is_tracked("broken"));
        assert_eq!(supervisor.state("broken"), Some(ChildState::Exited(Some(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_is_untracked_while_grandchild_holds_output() {
        let dir = tempfile::tempdir().unwrap();
        // The backgrounded sleep inherits stdout and keeps the relay open
        let supervisor = Supervisor::new(shell_runtime("sleep 5 & echo started; exit 0"));

        supervisor.start_service("forker", dir.path(), &[], 4351).await.unwrap();

        // Well inside the relay drain window
        let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
        while supervisor.is_tracked("forker") && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!supervisor.is_tracked("forker"));
        assert_eq!(supervisor.state("forker"), Some(ChildState::Exited(Some(0))));
        assert_eq!(supervisor.stop_all(StopSignal::Terminate), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_listener_holds_signal_raised_before_recv() {
        let mut listener = StopListener::install().unwrap();

        unsafe {
            libc::raise(libc::SIGTERM);
        }

        let signal = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .expect("signal was not delivered");
        assert_eq!(signal, StopSignal::Terminate);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_runs_in_service_dir_with_extra_args() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(shell_runtime("pwd -P; echo \"$3 $4\""));
        let mut rx = supervisor.subscribe();

        let extra = vec!["--stage".to_string(), "dev".to_string()];
        supervisor.start_service("svc", dir.path(), &extra, 4401).await.unwrap();

        let mut lines = Vec::new();
        loop {
            match next_event(&mut rx).await {
                LifecycleEvent::OutputLine { line, .. } => lines.push(line),
                LifecycleEvent::Exited { .. } => break,
                _ => {}
            }
        }

        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(lines, vec![expected_dir.display().to_string(), "--stage dev".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(shell_runtime("exec sleep 30"));

        supervisor.start_service("dup", dir.path(), &[], 4501).await.unwrap();
        let err = supervisor
            .start_service("dup", dir.path(), &[], 4502)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyTracked { .. }));

        supervisor.stop_all(StopSignal::Terminate);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(RuntimeCommand::new("/nonexistent/devgate-runtime", vec![]));

        let err = supervisor
            .start_service("ghost", dir.path(), &[], 4601)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(!supervisor.is_tracked("ghost"));
    }
}
