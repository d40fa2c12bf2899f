//! Stand-in engine for environments without an object store.

use crate::engine::{DatabasesCallback, DeleteCallbacks, EngineFactory, OpenCallbacks};
use crate::error::EngineError;
use tracing::debug;

/// An engine that has no storage behind it.
///
/// Listing databases yields nothing; opening or deleting reports
/// [`EngineError::NotAvailable`]. Callbacks fire synchronously on the
/// calling thread because there is no event loop.
#[derive(Debug, Clone, Default)]
pub struct UnavailableEngine {
    reason: Option<String>,
}

impl UnavailableEngine {
    /// Creates the stand-in.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the stand-in with a reason reported in errors.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    fn error(&self) -> EngineError {
        EngineError::NotAvailable(
            self.reason
                .clone()
                .unwrap_or_else(|| "no storage engine in this environment".into()),
        )
    }
}

impl EngineFactory for UnavailableEngine {
    fn open(&self, name: &str, _version: Option<u32>, callbacks: OpenCallbacks) {
        debug!(database = name, "open on unavailable engine");
        (callbacks.on_error)(self.error());
    }

    fn delete_database(&self, name: &str, callbacks: DeleteCallbacks) {
        debug!(database = name, "delete on unavailable engine");
        (callbacks.on_error)(self.error());
    }

    fn databases(&self, callback: DatabasesCallback) {
        callback(Ok(Vec::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn open_reports_not_available() {
        let engine = UnavailableEngine::with_reason("server rendering");
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        engine.open(
            "db",
            Some(1),
            OpenCallbacks::new(
                move |_| tx.send(None).unwrap(),
                move |err| err_tx.send(Some(err)).unwrap(),
            ),
        );
        assert_eq!(
            rx.recv().unwrap(),
            Some(EngineError::NotAvailable("server rendering".into()))
        );
    }

    #[test]
    fn databases_is_empty() {
        let (tx, rx) = mpsc::channel();
        UnavailableEngine::new().databases(Box::new(move |list| tx.send(list).unwrap()));
        assert_eq!(rx.recv().unwrap().unwrap(), Vec::new());
    }
}
