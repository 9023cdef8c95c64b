//! Scripted analysis server used by the integration tests.
//!
//! Speaks the framed protocol on stdio, remembers which documents are open
//! (spy pattern, queried with `mock/openDocuments` and `mock/history`), and
//! can be told to misbehave: crash after the handshake, refuse to start
//! after N launches, ignore `exit`, or ignore SIGTERM.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use analysis_bridge::transport::codec::{encode_frame, FrameDecoder};
use analysis_bridge::transport::{Message, RequestId, RpcError};
use analysis_bridge::{INTERNAL_ERROR, METHOD_NOT_FOUND};

#[derive(Debug, Parser)]
struct Args {
    /// Append a line per launch to this file
    #[arg(long)]
    start_log: Option<PathBuf>,

    /// Exit immediately once the start log already has this many launches
    #[arg(long)]
    max_starts: Option<usize>,

    /// Exit with status 1 this long after `initialized`
    #[arg(long)]
    crash_after_init_ms: Option<u64>,

    /// Answer `initialize` with an error
    #[arg(long)]
    fail_initialize: bool,

    /// Keep running after the `exit` notification
    #[arg(long)]
    ignore_exit: bool,

    /// Keep running after SIGTERM
    #[arg(long)]
    ignore_sigterm: bool,
}

struct MockServer {
    args: Args,
    stdout: Mutex<Stdout>,
    open_documents: parking_lot::Mutex<BTreeSet<String>>,
    history: parking_lot::Mutex<Vec<String>>,
}

impl MockServer {
    async fn send(&self, message: &Message) {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode reply: {}", e);
                return;
            }
        };
        let mut stdout = self.stdout.lock().await;
        if stdout.write_all(&frame).await.is_err() || stdout.flush().await.is_err() {
            tracing::debug!("Client went away");
        }
    }

    async fn reply(&self, id: RequestId, outcome: std::result::Result<JsonValue, RpcError>) {
        self.send(&Message::Response {
            id: Some(id),
            outcome,
        })
        .await;
    }

    async fn handle(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request { id, method, params } => self.handle_request(id, &method, params).await,
            Message::Notification { method, params } => {
                self.history.lock().push(method.clone());
                self.handle_notification(&method, params).await;
            }
            Message::Response { .. } => {}
        }
    }

    async fn handle_request(self: &Arc<Self>, id: RequestId, method: &str, params: Option<JsonValue>) {
        let params = params.unwrap_or(JsonValue::Null);
        let outcome = match method {
            "initialize" if self.args.fail_initialize => {
                Err(RpcError::new(INTERNAL_ERROR, "refusing to initialize"))
            }
            "initialize" => Ok(json!({
                "capabilities": { "hoverProvider": true, "textDocumentSync": 1 },
                "serverInfo": { "name": "mock-analyzer" }
            })),
            "shutdown" => Ok(JsonValue::Null),
            "mock/echo" => Ok(params),
            "mock/sleep" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                let server = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    server.reply(id, Ok(params)).await;
                });
                return;
            }
            "mock/fail" => {
                let code = params["code"].as_i64().unwrap_or(INTERNAL_ERROR);
                Err(RpcError::new(code, "requested failure"))
            }
            "mock/openDocuments" => Ok(json!(self.open_documents.lock().iter().collect::<Vec<_>>())),
            "mock/history" => Ok(json!(*self.history.lock())),
            "textDocument/hover" => {
                let uri = params["textDocument"]["uri"].as_str().unwrap_or_default();
                if self.open_documents.lock().contains(uri) {
                    Ok(json!({ "contents": format!("hover for {}", uri) }))
                } else {
                    Err(RpcError::new(-32602, format!("document not open: {}", uri)))
                }
            }
            _ => Err(RpcError::new(METHOD_NOT_FOUND, format!("Unhandled method {}", method))),
        };
        self.reply(id, outcome).await;
    }

    async fn handle_notification(&self, method: &str, params: Option<JsonValue>) {
        let uri = params
            .as_ref()
            .and_then(|p| p["textDocument"]["uri"].as_str())
            .map(str::to_string);

        match method {
            "initialized" => {
                self.send(&Message::notification(
                    "window/logMessage",
                    Some(json!({ "type": 3, "message": "mock-analyzer ready" })),
                ))
                .await;

                if let Some(ms) = self.args.crash_after_init_ms {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        tracing::info!("Crashing on purpose");
                        std::process::exit(1);
                    });
                }
            }
            "exit" if !self.args.ignore_exit => std::process::exit(0),
            "textDocument/didOpen" => {
                if let Some(uri) = uri {
                    self.open_documents.lock().insert(uri);
                }
            }
            "textDocument/didClose" => {
                if let Some(uri) = uri {
                    self.open_documents.lock().remove(&uri);
                }
            }
            _ => {}
        }
    }
}

fn record_start(args: &Args) -> std::io::Result<()> {
    let Some(path) = &args.start_log else {
        return Ok(());
    };

    let previous = std::fs::read_to_string(path)
        .map(|log| log.lines().count())
        .unwrap_or(0);
    if args.max_starts.is_some_and(|max| previous >= max) {
        tracing::info!("Start {} exceeds the allowed {:?}; exiting", previous + 1, args.max_starts);
        std::fs::write(path, "start\n".repeat(previous + 1))?;
        std::process::exit(2);
    }
    std::fs::write(path, "start\n".repeat(previous + 1))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    analysis_bridge::init_tracing();

    let args = Args::parse();
    record_start(&args)?;

    #[cfg(unix)]
    if args.ignore_sigterm {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            while terminate.recv().await.is_some() {
                tracing::info!("Ignoring SIGTERM");
            }
        });
    }

    let ignore_exit = args.ignore_exit;
    let server = Arc::new(MockServer {
        args,
        stdout: Mutex::new(tokio::io::stdout()),
        open_documents: parking_lot::Mutex::new(BTreeSet::new()),
        history: parking_lot::Mutex::new(Vec::new()),
    });

    let mut stdin = tokio::io::stdin();
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 8 * 1024];

    loop {
        let n = stdin.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for message in decoder.decode(&chunk[..n]) {
            server.handle(message).await;
        }
    }

    if ignore_exit {
        // Stay alive until a signal takes us down
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
    Ok(())
}
