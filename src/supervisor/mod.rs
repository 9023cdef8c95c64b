//! Analysis server lifecycle
//!
//! The [`Supervisor`] owns the server process: it starts it and runs the
//! handshake, notices when it dies, restarts it within a bounded budget,
//! and shuts it down politely before escalating to signals.
//!
//! State transitions:
//!
//! ```text
//! Stopped -> Starting -> Running -> ShuttingDown -> Stopped
//!                ^          |
//!                |          v
//!                +------ Crashed   (restart budget permitting)
//! ```

mod process;

pub use process::ExitInfo;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::transport::{Dispatcher, Session};
use crate::{Error, Result};
use process::ServerProcess;

/// Lifecycle state of the analysis server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
    Crashed,
}

struct Core {
    process: Option<Arc<ServerProcess>>,
    /// Bumped on every successful launch
    generation: u64,
    shutting_down: bool,
    restart_attempts: u32,
    restart_task: Option<JoinHandle<()>>,
    server_capabilities: Option<JsonValue>,
}

struct SupervisorInner {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    core: Mutex<Core>,
    state_tx: watch::Sender<ProcessState>,
    /// Serializes launches and shutdowns
    lifecycle: tokio::sync::Mutex<()>,
}

/// Supervises a single analysis server process
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                dispatcher: Arc::new(Dispatcher::new()),
                core: Mutex::new(Core {
                    process: None,
                    generation: 0,
                    shutting_down: false,
                    restart_attempts: 0,
                    restart_task: None,
                    server_capabilities: None,
                }),
                state_tx,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start the server and complete the handshake.
    ///
    /// No-op when already running or starting. Resets the restart budget.
    pub async fn start(&self) -> Result<()> {
        if self.state() == ProcessState::Running {
            return Ok(());
        }

        let _lifecycle = self.inner.lifecycle.lock().await;

        {
            let mut core = self.inner.core.lock();
            match self.state() {
                ProcessState::Running | ProcessState::Starting => {
                    tracing::debug!("Analysis server already {:?}", self.state());
                    return Ok(());
                }
                _ => {}
            }
            if let Some(task) = core.restart_task.take() {
                task.abort();
            }
            core.shutting_down = false;
            core.restart_attempts = 0;
            self.inner.set_state(ProcessState::Starting);
        }

        match self.inner.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Failed to start analysis server: {}", e);
                let core = self.inner.core.lock();
                if !core.shutting_down {
                    self.inner.set_state(ProcessState::Stopped);
                }
                Err(e)
            }
        }
    }

    /// Stop the server: `shutdown` request, `exit` notification, then signals
    pub async fn shutdown(&self) -> Result<()> {
        let restart_task = {
            let mut core = self.inner.core.lock();
            core.shutting_down = true;
            if self.state() == ProcessState::Stopped && core.process.is_none() {
                return Ok(());
            }
            self.inner.set_state(ProcessState::ShuttingDown);
            core.restart_task.take()
        };
        if let Some(task) = restart_task {
            task.abort();
        }

        let _lifecycle = self.inner.lifecycle.lock().await;

        let process = self.inner.core.lock().process.take();
        if let Some(process) = process {
            self.inner.stop_process(&process).await;
        }

        {
            let mut core = self.inner.core.lock();
            core.server_capabilities = None;
            self.inner.set_state(ProcessState::Stopped);
        }

        tracing::info!("Analysis server stopped");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    /// The live session; fails unless the server is running
    pub fn session(&self) -> Result<Session> {
        let core = self.inner.core.lock();
        match (&core.process, self.state()) {
            (Some(process), ProcessState::Running) => Ok(process.session().clone()),
            _ => Err(Error::NotRunning),
        }
    }

    /// Request on the live session with the configured default timeout
    pub async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        self.session()?
            .request(method, params, self.inner.config.timeouts.request())
            .await
    }

    pub async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        self.session()?.notify(method, params).await
    }

    /// Handlers registered here survive restarts
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Successful launches so far; changes whenever the server is replaced
    pub fn generation(&self) -> u64 {
        self.inner.core.lock().generation
    }

    /// Restart attempts made since the last crash
    pub fn restart_attempts(&self) -> u32 {
        self.inner.core.lock().restart_attempts
    }

    /// `capabilities` from the last `initialize` result
    pub fn server_capabilities(&self) -> Option<JsonValue> {
        self.inner.core.lock().server_capabilities.clone()
    }

    /// OS process id of the running server
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .core
            .lock()
            .process
            .as_ref()
            .and_then(|p| p.pid())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("executable", &self.inner.config.executable)
            .finish()
    }
}

impl SupervisorInner {
    fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Analysis server state {:?} -> {:?}", previous, state);
        }
    }

    /// Spawn, handshake, and publish a new process. Caller holds `lifecycle`.
    async fn launch(self: &Arc<Self>) -> Result<()> {
        let process = ServerProcess::spawn(&self.config, self.dispatcher.clone()).await?;
        let root = self.config.working_dir()?;

        let init_result = match process.initialize(&self.config, &root).await {
            Ok(result) => result,
            Err(e) => {
                process.kill();
                let _ = process
                    .wait_exit_timeout(self.config.timeouts.kill_grace())
                    .await;
                return Err(Error::Process(format!("Handshake failed: {}", e)));
            }
        };

        let process = Arc::new(process);
        let exit_rx = process.exit_watch();

        let generation = {
            let mut core = self.core.lock();
            core.generation += 1;
            core.process = Some(process);
            core.server_capabilities = init_result.get("capabilities").cloned();
            if core.shutting_down {
                tracing::info!("Shutdown requested while starting; not marking ready");
            } else {
                self.set_state(ProcessState::Running);
            }
            core.generation
        };

        tracing::info!("Analysis server running (generation {})", generation);
        self.watch_exit(exit_rx, generation);
        Ok(())
    }

    fn watch_exit(self: &Arc<Self>, mut exit_rx: watch::Receiver<Option<ExitInfo>>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = match exit_rx.wait_for(|exit| exit.is_some()).await {
                Ok(exit) => *exit,
                Err(_) => None,
            };
            if let Some(inner) = weak.upgrade() {
                inner.handle_exit(generation, exit);
            }
        });
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, exit: Option<ExitInfo>) {
        let mut core = self.core.lock();

        if core.generation != generation {
            return;
        }
        if core.shutting_down || self.state() != ProcessState::Running {
            tracing::debug!("Analysis server exited during {:?}: {:?}", self.state(), exit);
            return;
        }

        tracing::error!("Analysis server exited unexpectedly: {:?}", exit);
        core.process = None;
        core.server_capabilities = None;
        core.restart_attempts = 0;
        self.set_state(ProcessState::Crashed);

        let inner = self.clone();
        core.restart_task = Some(tokio::spawn(async move { inner.restart_loop().await }));
    }

    async fn restart_loop(self: Arc<Self>) {
        let policy = &self.config.restart;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            tracing::warn!(
                "Restarting analysis server in {:?} (attempt {}/{})",
                delay,
                attempt,
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;

            let _lifecycle = self.lifecycle.lock().await;
            {
                let mut core = self.core.lock();
                if core.shutting_down || self.state() != ProcessState::Crashed {
                    return;
                }
                core.restart_attempts = attempt;
                self.set_state(ProcessState::Starting);
            }

            match self.launch().await {
                Ok(()) => {
                    tracing::info!("Analysis server restarted on attempt {}", attempt);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Restart attempt {} failed: {}", attempt, e);
                    let core = self.core.lock();
                    if core.shutting_down {
                        return;
                    }
                    self.set_state(ProcessState::Crashed);
                }
            }
        }

        tracing::error!(
            "Analysis server failed to restart after {} attempts; giving up",
            policy.max_attempts
        );
    }

    async fn stop_process(&self, process: &ServerProcess) {
        let timeouts = &self.config.timeouts;
        let session = process.session();

        if !process.has_exited() && !session.is_closed() {
            if let Err(e) = session
                .request("shutdown", JsonValue::Null, timeouts.shutdown())
                .await
            {
                tracing::warn!("Shutdown request failed: {}", e);
            }
            if let Err(e) = session.notify("exit", JsonValue::Null).await {
                tracing::debug!("Exit notification failed: {}", e);
            }
            if let Err(e) = session.close_writer().await {
                tracing::debug!("Failed to close server stdin: {}", e);
            }
        }

        if process.wait_exit_timeout(timeouts.exit_grace()).await.is_some() {
            return;
        }

        tracing::warn!("Analysis server did not exit gracefully, terminating...");
        process.terminate();
        if process.wait_exit_timeout(timeouts.kill_grace()).await.is_some() {
            return;
        }

        tracing::warn!("Analysis server ignored SIGTERM, killing...");
        process.kill();
        let _ = process.wait_exit_timeout(timeouts.kill_grace()).await;
    }
}
