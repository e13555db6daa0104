use bytes::Bytes;
use std::collections::HashMap;

use crate::{call::OutboundCall, error::RpcError, CallId};

/// Pending outbound calls of one connection, keyed by call id.
///
/// Only ever touched from the owning reactor thread, so no locking.
/// Responses are matched by call id, never by arrival order.
#[derive(Debug)]
pub struct PendingCalls {
    calls: HashMap<CallId, OutboundCall>,
    next_call_id: u32,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_call_id: 1,
        }
    }

    /// Assign a fresh call id and track the call
    pub fn register(&mut self, mut call: OutboundCall) -> CallId {
        let call_id = self.allocate_id();
        call.assign_call_id(call_id);
        self.calls.insert(call_id, call);
        tracing::debug!("[REGISTER] outbound call registered: call_id={}", call_id);
        call_id
    }

    pub fn get(&self, call_id: CallId) -> Option<&OutboundCall> {
        self.calls.get(&call_id)
    }

    /// Complete the call with `call_id`. Returns false for unknown ids.
    pub fn complete(&mut self, call_id: CallId, result: Result<Bytes, RpcError>) -> bool {
        match self.calls.remove(&call_id) {
            Some(call) => {
                tracing::debug!("[COMPLETE] outbound call completed: call_id={}", call_id);
                call.complete(result);
                true
            }
            None => {
                tracing::warn!("[WARNING] no pending call for response: call_id={}", call_id);
                false
            }
        }
    }

    /// Fail every pending call (connection closed). Returns the count.
    pub fn fail_all(&mut self, error: &RpcError) -> usize {
        let count = self.calls.len();
        let mut drained: Vec<_> = self.calls.drain().collect();
        // submission order, for deterministic callbacks
        drained.sort_by_key(|(call_id, _)| call_id.as_u32());
        for (_, call) in drained {
            call.complete(Err(error.clone()));
        }
        count
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        let mut ids: Vec<_> = self.calls.keys().copied().collect();
        ids.sort_by_key(|id| id.as_u32());
        ids
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn allocate_id(&mut self) -> CallId {
        // 0 is never used; skip ids still in flight after wrap-around
        loop {
            let candidate = self.next_call_id;
            self.next_call_id = self.next_call_id.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            let call_id = CallId::new(candidate);
            if !self.calls.contains_key(&call_id) {
                return call_id;
            }
        }
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn call(log: &Arc<Mutex<Vec<(u32, bool)>>>, tag: u32) -> OutboundCall {
        let log = log.clone();
        OutboundCall::new(
            "127.0.0.1:7100".parse().unwrap(),
            "echo",
            "ping",
            Bytes::new(),
            move |result| log.lock().unwrap().push((tag, result.is_ok())),
        )
    }

    #[test]
    fn test_out_of_order_completion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingCalls::new();
        let first = pending.register(call(&log, 1));
        let second = pending.register(call(&log, 2));
        assert_eq!(first, CallId::new(1));
        assert_eq!(second, CallId::new(2));

        assert!(pending.complete(second, Ok(Bytes::new())));
        assert!(pending.complete(first, Ok(Bytes::new())));
        assert!(!pending.complete(first, Ok(Bytes::new())));

        assert_eq!(*log.lock().unwrap(), vec![(2, true), (1, true)]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_fail_all_in_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingCalls::new();
        for tag in 0..5 {
            pending.register(call(&log, tag));
        }
        let err = RpcError::connectivity(None, "reset");
        assert_eq!(pending.fail_all(&err), 5);
        assert_eq!(
            *log.lock().unwrap(),
            (0..5).map(|tag| (tag, false)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_call_id_wraps_and_skips_zero() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingCalls::new();
        pending.next_call_id = u32::MAX;
        assert_eq!(pending.register(call(&log, 0)), CallId::new(u32::MAX));
        assert_eq!(pending.register(call(&log, 1)), CallId::new(1));
        assert_eq!(pending.call_ids(), vec![CallId::new(1), CallId::new(u32::MAX)]);
    }
}
