//! Outstanding calls and response matching.
//!
//! Every outbound call registers a one-shot [`Waiter`] in the connection's
//! [`PendingCalls`]. With correlation enabled the call id travels in the
//! call frame and the peer echoes it in the response, so concurrent calls
//! are paired exactly. A response without an id resolves the oldest
//! outstanding call.
//!
//! With correlation disabled nothing is sent and every response resolves
//! the oldest outstanding call. Responses that arrive out of issue order
//! then land on the wrong caller. Only use that mode against peers that
//! cannot echo ids and never see concurrent calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, SockRpcError};
use crate::protocol::{CallId, Response};

type Outcome = Result<Value>;

#[derive(Default)]
struct PendingState {
    next_id: CallId,
    waiters: HashMap<CallId, oneshot::Sender<Outcome>>,
    /// Issue order, for responses that carry no id.
    order: VecDeque<CallId>,
    closed: bool,
}

/// Calls awaiting a response on one connection.
pub struct PendingCalls {
    correlate: bool,
    state: Mutex<PendingState>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new(correlate: bool) -> Self {
        Self {
            correlate,
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Whether call frames carry ids.
    pub fn correlates(&self) -> bool {
        self.correlate
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        // A panic while holding the lock cannot leave the maps inconsistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a waiter for the next call.
    pub fn register(self: &Arc<Self>) -> Result<Waiter> {
        let mut state = self.lock();
        if state.closed {
            return Err(SockRpcError::ConnectionClosed);
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        state.order.push_back(id);

        Ok(Waiter {
            id,
            wire_id: self.correlate.then_some(id),
            rx,
            pending: Arc::clone(self),
        })
    }

    /// Route a response to its waiter. Returns false if nobody was waiting.
    pub fn resolve(&self, response: Response) -> bool {
        let outcome = response.outcome.map_err(SockRpcError::from);
        let mut state = self.lock();

        let waiter = match response.call_id {
            Some(id) if self.correlate => {
                let waiter = state.waiters.remove(&id);
                if waiter.is_some() {
                    state.order.retain(|&queued| queued != id);
                }
                waiter
            }
            _ => Self::pop_oldest(&mut state),
        };

        match waiter {
            Some(tx) => {
                // The caller may have given up already
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::warn!(
                    "Dropping response with no matching call (id {:?})",
                    response.call_id
                );
                false
            }
        }
    }

    fn pop_oldest(state: &mut PendingState) -> Option<oneshot::Sender<Outcome>> {
        while let Some(id) = state.order.pop_front() {
            if let Some(tx) = state.waiters.remove(&id) {
                return Some(tx);
            }
        }
        None
    }

    fn forget(&self, id: CallId) {
        let mut state = self.lock();
        if state.waiters.remove(&id).is_some() {
            state.order.retain(|&queued| queued != id);
        }
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.order.clear();
        let waiters: Vec<_> = state.waiters.drain().collect();
        drop(state);

        let n = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(SockRpcError::ConnectionClosed));
        }
        n
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// True if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One outstanding call. Dropping it unregisters the call.
pub struct Waiter {
    id: CallId,
    wire_id: Option<CallId>,
    rx: oneshot::Receiver<Outcome>,
    pending: Arc<PendingCalls>,
}

impl Waiter {
    /// Id to put on the wire, `None` when correlation is off.
    pub fn wire_id(&self) -> Option<CallId> {
        self.wire_id
    }

    /// Wait for the response.
    pub async fn wait(mut self) -> Result<Value> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SockRpcError::ConnectionClosed),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteError;
    use serde_json::json;

    fn data(id: Option<CallId>, v: Value) -> Response {
        Response {
            call_id: id,
            outcome: Ok(v),
        }
    }

    #[tokio::test]
    async fn test_correlated_responses_pair_by_id() {
        let pending = Arc::new(PendingCalls::new(true));
        let first = pending.register().unwrap();
        let second = pending.register().unwrap();
        let (id1, id2) = (first.wire_id().unwrap(), second.wire_id().unwrap());
        assert_ne!(id1, id2);

        // reverse order
        assert!(pending.resolve(data(Some(id2), json!("two"))));
        assert!(pending.resolve(data(Some(id1), json!("one"))));

        assert_eq!(first.wait().await.unwrap(), json!("one"));
        assert_eq!(second.wait().await.unwrap(), json!("two"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_positional_mode_pairs_by_arrival() {
        let pending = Arc::new(PendingCalls::new(false));
        let first = pending.register().unwrap();
        let second = pending.register().unwrap();
        assert_eq!(first.wire_id(), None);

        // the answer to the second call arrives first and lands on the first caller
        pending.resolve(data(None, json!("answer-to-second")));
        pending.resolve(data(None, json!("answer-to-first")));

        assert_eq!(first.wait().await.unwrap(), json!("answer-to-second"));
        assert_eq!(second.wait().await.unwrap(), json!("answer-to-first"));
    }

    #[tokio::test]
    async fn test_idless_response_falls_back_to_oldest() {
        let pending = Arc::new(PendingCalls::new(true));
        let first = pending.register().unwrap();
        let second = pending.register().unwrap();

        pending.resolve(data(second.wire_id(), json!(2)));
        pending.resolve(data(None, json!(1)));

        assert_eq!(first.wait().await.unwrap(), json!(1));
        assert_eq!(second.wait().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let pending = Arc::new(PendingCalls::new(true));
        let waiter = pending.register().unwrap();
        pending.resolve(Response {
            call_id: waiter.wire_id(),
            outcome: Err(RemoteError {
                message: "nope".to_string(),
                details: Some(json!({"code": 7})),
            }),
        });

        match waiter.wait().await {
            Err(SockRpcError::Remote { message, details }) => {
                assert_eq!(message, "nope");
                assert_eq!(details, Some(json!({"code": 7})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let pending = Arc::new(PendingCalls::new(true));
        let _waiter = pending.register().unwrap();
        assert!(!pending.resolve(data(Some(999), json!(null))));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_dropping_waiter_unregisters() {
        let pending = Arc::new(PendingCalls::new(true));
        let waiter = pending.register().unwrap();
        assert_eq!(pending.len(), 1);
        drop(waiter);
        assert!(pending.is_empty());
        assert!(!pending.resolve(data(None, json!(null))));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_and_new_calls() {
        let pending = Arc::new(PendingCalls::new(true));
        let waiter = pending.register().unwrap();

        assert_eq!(pending.close(), 1);
        assert!(matches!(
            waiter.wait().await,
            Err(SockRpcError::ConnectionClosed)
        ));
        assert!(matches!(
            pending.register(),
            Err(SockRpcError::ConnectionClosed)
        ));
    }
}
