//! Request correlation over a framed duplex stream
//!
//! A [`Session`] owns the write half of the connection and a background
//! task draining the read half. Outgoing requests get a fresh numeric id
//! and park a oneshot sender in the pending table; the reader task
//! completes them by id as responses arrive, in whatever order the server
//! answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};

use super::codec::{read_frames, FrameWriter};
use super::dispatcher::Dispatcher;
use super::message::{Message, RequestId, RpcError};
use crate::{Error, Result};

struct PendingRequest {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<JsonValue>>,
}

struct SessionInner {
    writer: FrameWriter,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    dispatcher: Arc<Dispatcher>,
    /// Flipped once, while holding `pending`, when the read side ends
    closed: watch::Sender<bool>,
}

/// Handle to a live connection; cheap to clone
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Bind a session to a byte stream and start reading from it
    pub fn new<R, W>(reader: R, writer: W, dispatcher: Arc<Dispatcher>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            writer: FrameWriter::new(writer),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            dispatcher,
            closed,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let outcome = read_frames(reader, |message| reader_inner.handle_message(message)).await;
            match outcome {
                Ok(()) => tracing::info!("Analysis server stream closed (EOF)"),
                Err(e) => tracing::error!("Error reading from analysis server: {}", e),
            }
            reader_inner.terminate();
        });

        Self { inner }
    }

    /// Send a request and wait for its result, failing after `timeout`
    pub async fn request(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let params = (!params.is_null()).then_some(params);
        let (tx, mut rx) = oneshot::channel();

        let id = {
            let mut pending = self.inner.pending.lock();
            if *self.inner.closed.borrow() {
                return Err(Error::ProtocolClosed);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    created_at: Instant::now(),
                    tx,
                },
            );
            id
        };
        // Drops the entry if this future is cancelled mid-flight
        let _guard = PendingGuard {
            inner: &*self.inner,
            id,
        };

        tracing::debug!("-> request {} {}", id, method);
        self.inner
            .writer
            .send(&Message::request(id, method, params))
            .await?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ProtocolClosed),
            Err(_) => {
                if self.inner.pending.lock().remove(&id).is_some() {
                    tracing::warn!(
                        "Request {} ({}) timed out after {:?}",
                        id,
                        method,
                        timeout
                    );
                    return Err(Error::Timeout {
                        method: method.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                // The response won the race after the timer fired
                rx.try_recv().unwrap_or(Err(Error::ProtocolClosed))
            }
        }
    }

    /// Typed wrapper over [`Session::request`]
    pub async fn call<P, R>(&self, method: &str, params: P, timeout: Duration) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, params, timeout).await?;
        serde_json::from_value(result).map_err(Error::Json)
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ProtocolClosed);
        }
        let params = (!params.is_null()).then_some(params);
        tracing::debug!("-> notify {}", method);
        self.inner
            .writer
            .send(&Message::notification(method, params))
            .await
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the read side of the connection has ended
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // Sender lives in `inner`, which we hold, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Close the write half so the server sees EOF
    pub async fn close_writer(&self) -> Result<()> {
        self.inner.writer.close().await
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl SessionInner {
    fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response { id, outcome } => self.complete(id, outcome),
            Message::Notification { method, params } => {
                tracing::debug!("<- notification {}", method);
                self.dispatcher.dispatch_notification(&method, params);
            }
            Message::Request { id, method, params } => {
                tracing::debug!("<- server request {} {}", id, method);
                let outcome = self.dispatcher.handle_request(&method, params);
                let inner = self.clone();
                tokio::spawn(async move {
                    let reply = Message::Response {
                        id: Some(id),
                        outcome,
                    };
                    if let Err(e) = inner.writer.send(&reply).await {
                        tracing::warn!("Failed to answer server request {}: {}", method, e);
                    }
                });
            }
        }
    }

    fn complete(&self, id: Option<RequestId>, outcome: std::result::Result<JsonValue, RpcError>) {
        let key = match &id {
            Some(RequestId::Number(n)) => u64::try_from(*n).ok(),
            _ => None,
        };
        let entry = key.and_then(|key| self.pending.lock().remove(&key));

        let Some(entry) = entry else {
            tracing::warn!(
                "Discarding response for unknown or expired request {:?}",
                id
            );
            return;
        };

        tracing::debug!(
            "<- response {:?} ({}) after {:?}",
            id,
            entry.method,
            entry.created_at.elapsed()
        );
        // Receiver is gone if the caller stopped waiting; nothing to do
        let _ = entry.tx.send(outcome.map_err(Error::from));
    }

    /// Fail everything still waiting; runs once when the stream ends
    fn terminate(&self) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut pending = self.pending.lock();
            self.closed.send_replace(true);
            pending.drain().collect()
        };

        for (id, entry) in drained {
            tracing::debug!("Failing request {} ({}): stream closed", id, entry.method);
            let _ = entry.tx.send(Err(Error::ProtocolClosed));
        }
    }
}

struct PendingGuard<'a> {
    inner: &'a SessionInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::METHOD_NOT_FOUND;
    use crate::transport::codec::{encode_frame, FrameDecoder};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// The analysis-server end of an in-memory connection
    struct ServerEnd {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        decoder: FrameDecoder,
        queue: VecDeque<Message>,
    }

    impl ServerEnd {
        async fn next_message(&mut self) -> Message {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(message) = self.queue.pop_front() {
                    return message;
                }
                let n = self.reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the stream");
                self.queue.extend(self.decoder.decode(&buf[..n]));
            }
        }

        async fn next_request_id(&mut self) -> RequestId {
            match self.next_message().await {
                Message::Request { id, .. } => id,
                other => panic!("expected request, got {:?}", other),
            }
        }

        async fn send(&mut self, message: Message) {
            let frame = encode_frame(&message).unwrap();
            self.writer.write_all(&frame).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn reply(&mut self, id: RequestId, result: JsonValue) {
            self.send(Message::Response {
                id: Some(id),
                outcome: Ok(result),
            })
            .await;
        }
    }

    fn connect(dispatcher: Arc<Dispatcher>) -> (Session, ServerEnd) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let session = Session::new(client_read, client_write, dispatcher);
        let server = ServerEnd {
            reader: server_read,
            writer: server_write,
            decoder: FrameDecoder::new(),
            queue: VecDeque::new(),
        };
        (session, server)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_raw_response_resolves_request() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("X", JsonValue::Null, LONG).await }
        });

        match server.next_message().await {
            Message::Request { id, method, .. } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(method, "X");
            }
            other => panic!("expected request, got {:?}", other),
        }
        let body = r#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#;
        server
            .send_raw(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await;
        server.send_raw(body.as_bytes()).await;

        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let slow = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .request("slow", JsonValue::Null, Duration::from_millis(50))
                    .await
            }
        });
        let slow_id = server.next_request_id().await;

        let other = tokio::spawn({
            let session = session.clone();
            async move { session.request("other", JsonValue::Null, LONG).await }
        });
        let other_id = server.next_request_id().await;

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        server.reply(slow_id, json!("late")).await;
        server.reply(other_id, json!("fine")).await;

        assert_eq!(other.await.unwrap().unwrap(), json!("fine"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let mut calls = Vec::new();
        for i in 0..3 {
            let session = session.clone();
            calls.push(tokio::spawn(async move {
                session
                    .request("echo", json!({ "n": i }), LONG)
                    .await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            match server.next_message().await {
                Message::Request { id, params, .. } => requests.push((id, params)),
                other => panic!("expected request, got {:?}", other),
            }
        }
        for (id, params) in requests.into_iter().rev() {
            server.reply(id, params.unwrap()).await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!({ "n": i }));
        }
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_unique_and_increasing() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        for _ in 0..20 {
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.request("m", JsonValue::Null, LONG).await;
            });
        }

        let mut ids = Vec::new();
        for _ in 0..20 {
            match server.next_request_id().await {
                RequestId::Number(n) => ids.push(n),
                other => panic!("unexpected id {:?}", other),
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_error_response_becomes_protocol_error() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("bad", JsonValue::Null, LONG).await }
        });
        let id = server.next_request_id().await;
        server
            .send(Message::Response {
                id: Some(id),
                outcome: Err(RpcError {
                    code: -32602,
                    message: "invalid params".to_string(),
                    data: Some(json!("detail")),
                }),
            })
            .await;

        match call.await.unwrap().unwrap_err() {
            Error::Protocol { code, message, data } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "invalid params");
                assert_eq!(data, Some(json!("detail")));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_response_does_not_disturb_pending() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("m", JsonValue::Null, LONG).await }
        });
        let id = server.next_request_id().await;

        server.reply(RequestId::Number(999), json!("stray")).await;
        server.reply(RequestId::String("foreign".into()), json!("stray")).await;
        server.reply(id, json!(1)).await;

        assert_eq!(call.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_stream_end_fails_pending_and_rejects_new_requests() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("m", JsonValue::Null, LONG).await }
        });
        server.next_request_id().await;
        drop(server);

        assert!(matches!(
            call.await.unwrap().unwrap_err(),
            Error::ProtocolClosed
        ));
        session.closed().await;
        assert!(matches!(
            session.request("m", JsonValue::Null, LONG).await,
            Err(Error::ProtocolClosed)
        ));
        assert!(session.notify("n", JsonValue::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_huge_length_header_then_eof_closes_session() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("m", JsonValue::Null, LONG).await }
        });
        server.next_request_id().await;
        server
            .send_raw(b"Content-Length: 18446744073709551615\r\n\r\n{}")
            .await;
        drop(server);

        assert!(matches!(
            call.await.unwrap().unwrap_err(),
            Error::ProtocolClosed
        ));
        assert!(session.is_closed());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_between_request_and_response() {
        let dispatcher = Arc::new(Dispatcher::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let counter = progress.clone();
        dispatcher.on_notification("$/progress", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (session, mut server) = connect(dispatcher);

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.request("workspace/symbol", json!({"query": "x"}), LONG).await }
        });
        let id = server.next_request_id().await;

        server
            .send(Message::notification("$/progress", Some(json!({"token": 1}))))
            .await;
        server.send(Message::notification("unregistered", None)).await;
        server.reply(id, json!(["symbol"])).await;

        assert_eq!(call.await.unwrap().unwrap(), json!(["symbol"]));
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_notifications_and_server_requests_are_dispatched() {
        let dispatcher = Arc::new(Dispatcher::new());
        let diagnostics = Arc::new(AtomicUsize::new(0));
        let counter = diagnostics.clone();
        dispatcher.on_notification("textDocument/publishDiagnostics", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.on_notification("boom", |_| Err("handler failure".into()));

        let (_session, mut server) = connect(dispatcher);

        server.send(Message::notification("boom", None)).await;
        server
            .send(Message::notification(
                "textDocument/publishDiagnostics",
                Some(json!({"uri": "file:///a.rs", "diagnostics": []})),
            ))
            .await;
        server
            .send(Message::Request {
                id: RequestId::String("srv-1".into()),
                method: "window/workDoneProgress/create".into(),
                params: None,
            })
            .await;

        match server.next_message().await {
            Message::Response {
                id,
                outcome: Err(err),
            } => {
                assert_eq!(id, Some(RequestId::String("srv-1".into())));
                assert_eq!(err.code, METHOD_NOT_FOUND);
            }
            other => panic!("expected error response, got {:?}", other),
        }
        assert_eq!(diagnostics.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_writes_frames_in_call_order() {
        let (session, mut server) = connect(Arc::new(Dispatcher::new()));

        for i in 0..5 {
            session.notify(&format!("n{}", i), JsonValue::Null).await.unwrap();
        }
        for i in 0..5 {
            let message = server.next_message().await;
            assert_eq!(message.method(), Some(format!("n{}", i).as_str()));
        }
    }
}
