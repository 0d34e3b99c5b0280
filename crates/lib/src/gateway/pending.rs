//! Outstanding-request table: correlates response frames to waiting callers by id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::GatewayError;
use super::protocol::{ErrorShape, ResponseFrame};

pub type RequestResult = Result<Value, GatewayError>;

/// In-memory map of request id to the slot its caller is waiting on. Never persisted.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, oneshot::Sender<RequestResult>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<RequestResult>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a pending request. Fails if `id` is already outstanding.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<RequestResult>, GatewayError> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(GatewayError::InvalidRequest(format!(
                "request id {} already outstanding",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Complete the entry for `id`. Returns false when nothing was waiting on it.
    pub fn resolve(&self, id: &str, result: RequestResult) -> bool {
        let Some(tx) = self.entries().remove(id) else {
            return false;
        };
        // The caller may have given up (timeout or dropped future) between lookup and send.
        let _ = tx.send(result);
        true
    }

    /// Complete the matching entry from a response frame.
    pub fn complete(&self, res: ResponseFrame) -> bool {
        let result = if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            Err(GatewayError::Server(
                res.error
                    .unwrap_or_else(|| ErrorShape::new("UNAVAILABLE", "request failed")),
            ))
        };
        self.resolve(&res.id, result)
    }

    /// Forget `id` without completing it (the caller stopped waiting).
    pub fn remove(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Fail every outstanding request with `error` and empty the table. Returns how many were failed.
    pub fn drain(&self, error: GatewayError) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }
}
