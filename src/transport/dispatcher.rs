//! Routing of server-initiated messages
//!
//! One handler per method name. The dispatcher is owned by the supervisor
//! and shared by every session it creates, so registrations survive
//! restarts of the analysis server.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use super::message::RpcError;
use crate::error::{INTERNAL_ERROR, METHOD_NOT_FOUND};

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler for a server notification
pub type NotificationHandler =
    Arc<dyn Fn(Option<JsonValue>) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Handler for a server request; the return value becomes the response
pub type RequestHandler =
    Arc<dyn Fn(Option<JsonValue>) -> std::result::Result<JsonValue, RpcError> + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    notifications: RwLock<HashMap<String, NotificationHandler>>,
    requests: RwLock<HashMap<String, RequestHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `method`, replacing any previous one
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<JsonValue>) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let method = method.into();
        if self
            .notifications
            .write()
            .insert(method.clone(), Arc::new(handler))
            .is_some()
        {
            tracing::debug!("Replaced notification handler for {}", method);
        }
    }

    pub fn remove_notification_handler(&self, method: &str) -> bool {
        self.notifications.write().remove(method).is_some()
    }

    /// Register the handler answering server requests for `method`
    pub fn on_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<JsonValue>) -> std::result::Result<JsonValue, RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.requests.write().insert(method.into(), Arc::new(handler));
    }

    /// Deliver a notification. Failures stay inside the handler boundary.
    pub fn dispatch_notification(&self, method: &str, params: Option<JsonValue>) {
        // Clone out so the handler runs without the table locked
        let Some(handler) = self.notifications.read().get(method).cloned() else {
            tracing::trace!("No handler for notification {}", method);
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Notification handler for {} failed: {}", method, e),
            Err(_) => tracing::error!("Notification handler for {} panicked", method),
        }
    }

    /// Compute the reply to a server request
    pub fn handle_request(
        &self,
        method: &str,
        params: Option<JsonValue>,
    ) -> std::result::Result<JsonValue, RpcError> {
        let Some(handler) = self.requests.read().get(method).cloned() else {
            return Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Unhandled method {}", method),
            ));
        };

        catch_unwind(AssertUnwindSafe(|| handler(params))).unwrap_or_else(|_| {
            tracing::error!("Request handler for {} panicked", method);
            Err(RpcError::new(INTERNAL_ERROR, "request handler panicked"))
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("notifications", &self.notifications.read().keys().collect::<Vec<_>>())
            .field("requests", &self.requests.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reregistration_replaces_handler() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        dispatcher.on_notification("diag", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = second.clone();
        dispatcher.on_notification("diag", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch_notification("diag", None);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(dispatcher.remove_notification_handler("diag"));
        assert!(!dispatcher.remove_notification_handler("diag"));
        dispatcher.dispatch_notification("diag", None);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_contained() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        dispatcher.on_notification("err", |_| Err("bad params".into()));
        dispatcher.on_notification("panic", |_| panic!("handler blew up"));
        let counter = seen.clone();
        dispatcher.on_notification("ok", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.dispatch_notification("err", None);
        dispatcher.dispatch_notification("panic", None);
        dispatcher.dispatch_notification("unknown", Some(json!({})));
        dispatcher.dispatch_notification("ok", None);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unhandled_request_is_method_not_found() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .handle_request("workspace/configuration", None)
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);

        dispatcher.on_request("workspace/configuration", |_| Ok(json!([null])));
        assert_eq!(
            dispatcher.handle_request("workspace/configuration", None).unwrap(),
            json!([null])
        );
    }
}
