//! Analysis server subprocess
//!
//! Spawns the configured server, wires its stdio into a [`Session`], and
//! watches for its exit from a monitor task that owns the `Child`.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::transport::{Dispatcher, Session};
use crate::utils::path_to_file_uri;
use crate::{Error, Result};

/// How the server process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// A running analysis server and its session
pub(crate) struct ServerProcess {
    pid: Option<u32>,
    session: Session,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

impl ServerProcess {
    /// Spawn the server and confirm it survives the first moments
    pub async fn spawn(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let executable = config.resolve_executable()?;
        let working_dir = config.working_dir()?;

        tracing::info!(
            "Spawning analysis server {:?} {:?} in {:?}",
            executable,
            config.args,
            working_dir
        );

        let mut child = tokio::process::Command::new(&executable)
            .args(&config.args)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {:?}: {}", executable, e)))?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(monitor(child, kill_rx, exit_tx));

        let session = Session::new(stdout, stdin, dispatcher);
        let process = Self {
            pid,
            session,
            exit_rx,
            kill_tx,
        };

        if let Some(exit) = process.wait_exit_timeout(config.timeouts.spawn_confirm()).await {
            return Err(Error::Process(format!(
                "Analysis server exited immediately (code {:?})",
                exit.code
            )));
        }

        Ok(process)
    }

    /// Run the `initialize` / `initialized` handshake
    pub async fn initialize(&self, config: &ServerConfig, root: &Path) -> Result<JsonValue> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ClientInfo {
            name: String,
            version: String,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct WorkspaceFolder {
            uri: String,
            name: String,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct InitializeParams {
            process_id: u32,
            client_info: ClientInfo,
            root_uri: String,
            workspace_folders: Vec<WorkspaceFolder>,
            capabilities: JsonValue,
            #[serde(skip_serializing_if = "Option::is_none")]
            initialization_options: Option<JsonValue>,
        }

        let root_uri = path_to_file_uri(root);
        let params = InitializeParams {
            process_id: std::process::id(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            root_uri: root_uri.clone(),
            workspace_folders: vec![WorkspaceFolder {
                uri: root_uri,
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string()),
            }],
            capabilities: client_capabilities(),
            initialization_options: config.initialization_options.clone(),
        };

        let result: JsonValue = self
            .session
            .call("initialize", params, config.timeouts.initialize())
            .await?;

        self.session.notify("initialized", json!({})).await?;

        tracing::info!("Analysis server initialized");
        Ok(result)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Receiver that flips to `Some` when the process exits
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_exit_timeout(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let exit = match tokio::time::timeout(timeout, rx.wait_for(|exit| exit.is_some())).await {
            Ok(Ok(exit)) => *exit,
            // Monitor gone means the child was reaped
            Ok(Err(_)) => Some(ExitInfo {
                code: None,
                success: false,
            }),
            Err(_) => None,
        };
        exit
    }

    /// Ask the process to stop (SIGTERM where available)
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("Failed to send SIGTERM to {}: {}", pid, e);
            }
            return;
        }

        let _ = self.kill_tx.try_send(());
    }

    /// Forcefully kill the process
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// Fixed capability set announced during the handshake
fn client_capabilities() -> JsonValue {
    json!({
        "textDocument": {
            "synchronization": {
                "dynamicRegistration": false,
                "willSave": false,
                "didSave": false
            },
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "definition": { "linkSupport": true },
            "typeDefinition": { "linkSupport": true },
            "implementation": { "linkSupport": true },
            "references": {},
            "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
            "callHierarchy": {},
            "publishDiagnostics": { "relatedInformation": true }
        },
        "workspace": {
            "workspaceFolders": true,
            "symbol": {},
            "configuration": false
        },
        "window": { "workDoneProgress": false }
    })
}

/// Owns the child: reaps it, or kills it on request or when the handle is dropped
async fn monitor(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx.recv() => {
            tracing::debug!("Killing analysis server");
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill analysis server: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::warn!("Failed to reap analysis server: {}", e);
            ExitInfo {
                code: None,
                success: false,
            }
        }
    };

    tracing::info!("Analysis server exited with status: {:?}", exit);
    exit_tx.send_replace(Some(exit));
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "analysis_bridge::server_stderr", "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading server stderr: {}", e);
                break;
            }
        }
    }
}
