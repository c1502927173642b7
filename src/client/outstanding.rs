//! In-flight request table mapping message ids to waiter records

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Per-request record shared between the sending caller and the receiver
/// worker.
///
/// The result slot is a single-use mailbox: exactly one payload or error is
/// ever delivered, and delivery to a caller that has already gone away is
/// silently dropped.
pub(crate) struct RequestRecord {
    pub msg_id: u64,
    pub credit_request: u16,
    pub async_id: AtomicU64,
    slot: Mutex<Option<oneshot::Sender<Result<Vec<u8>>>>>,
}

impl RequestRecord {
    pub fn new(
        msg_id: u64,
        credit_request: u16,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                msg_id,
                credit_request,
                async_id: AtomicU64::new(0),
                slot: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Deliver the result exactly once. Returns false if the slot was
    /// already consumed or the waiter is gone.
    pub fn complete(&self, result: Result<Vec<u8>>) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn async_id(&self) -> u64 {
        self.async_id.load(Ordering::Acquire)
    }

    pub fn set_async_id(&self, async_id: u64) {
        self.async_id.store(async_id, Ordering::Release);
    }
}

/// Thread-safe table of requests awaiting a reply.
///
/// The sender inserts, the receiver (or a canceling caller, or shutdown)
/// removes. A message id present here implies the request has neither
/// completed nor been shut down.
pub(crate) struct OutstandingRequests {
    requests: Mutex<HashMap<u64, Arc<RequestRecord>>>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, msg_id: u64, record: Arc<RequestRecord>) {
        self.lock().insert(msg_id, record);
    }

    pub fn pop(&self, msg_id: u64) -> Option<Arc<RequestRecord>> {
        self.lock().remove(&msg_id)
    }

    /// Fail every outstanding request with `err` and empty the table
    pub fn shutdown(&self, err: Error) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, record) in drained {
            record.complete(Err(err.clone()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<RequestRecord>>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_pop() {
        let table = OutstandingRequests::new();
        let (record, _rx) = RequestRecord::new(7, 1);
        table.set(7, record);
        assert!(table.pop(7).is_some());
        assert!(table.pop(7).is_none());
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let (record, rx) = RequestRecord::new(1, 1);
        assert!(record.complete(Ok(vec![1, 2, 3])));
        assert!(!record.complete(Ok(vec![4])));
        assert_eq!(rx.await.unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_complete_after_waiter_dropped() {
        let (record, rx) = RequestRecord::new(1, 1);
        drop(rx);
        assert!(!record.complete(Ok(vec![1])));
    }

    #[tokio::test]
    async fn test_shutdown_fails_all_waiters() {
        let table = OutstandingRequests::new();
        let mut receivers = Vec::new();
        for msg_id in 0..3 {
            let (record, rx) = RequestRecord::new(msg_id, 1);
            table.set(msg_id, record);
            receivers.push(rx);
        }

        table.shutdown(Error::ConnectionClosed);
        assert_eq!(table.len(), 0);
        for rx in receivers {
            match rx.await.unwrap() {
                Err(Error::ConnectionClosed) => {}
                other => panic!("expected connection closed, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[tokio::test]
    async fn test_async_id_roundtrip() {
        let (record, _rx) = RequestRecord::new(1, 1);
        assert_eq!(record.async_id(), 0);
        record.set_async_id(0xAABB);
        assert_eq!(record.async_id(), 0xAABB);
    }
}
