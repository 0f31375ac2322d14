// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pending Call Table
//!
//! Maps correlation ids of in-flight calls to the slot their caller waits on.
//! An entry is inserted when a request is sent and removed exactly once: by the
//! reply listener when the matching response arrives, or by the caller's
//! [`PendingGuard`] when it stops waiting. The map is sharded, so unrelated
//! calls never contend on a single lock.

use crate::errors::RpcError;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Instant};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Creates a fresh, process-wide unique correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

struct PendingCall {
    slot: oneshot::Sender<Vec<u8>>,
    created_at: Instant,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Arc<PendingCalls> {
        Arc::new(PendingCalls::default())
    }

    /// Registers `correlation_id` and returns the guard that unregisters it
    /// plus the receiver the response will be delivered on.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<Vec<u8>>), RpcError> {
        let (slot, receiver) = oneshot::channel();

        match self.calls.entry(correlation_id.to_owned()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateCorrelation(correlation_id.to_owned())),
            Entry::Vacant(entry) => {
                entry.insert(PendingCall {
                    slot,
                    created_at: Instant::now(),
                });
                Ok((
                    PendingGuard {
                        table: self.clone(),
                        correlation_id: correlation_id.to_owned(),
                    },
                    receiver,
                ))
            }
        }
    }

    /// Hands `payload` to the caller waiting on `correlation_id`.
    ///
    /// Returns false when no call is pending under that id (an orphan response).
    pub fn resolve(&self, correlation_id: &str, payload: Vec<u8>) -> bool {
        match self.calls.remove(correlation_id) {
            Some((_, call)) => {
                debug!(
                    correlation_id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "response matched"
                );
                call.slot.send(payload).is_ok()
            }
            None => false,
        }
    }

    pub fn remove(&self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.calls.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes its entry from the table when dropped, whether the call completed,
/// timed out or was cancelled.
pub struct PendingGuard {
    table: Arc<PendingCalls>,
    correlation_id: String,
}

impl PendingGuard {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_payload_and_removes_entry() {
        let table = PendingCalls::new();
        let (_guard, receiver) = table.register("abc").unwrap();

        assert!(table.resolve("abc", b"5".to_vec()));
        assert_eq!(receiver.await.unwrap(), b"5".to_vec());
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_ids_are_orphans() {
        let table = PendingCalls::new();
        assert!(!table.resolve("nope", vec![]));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = PendingCalls::new();
        let (_guard, _rx) = table.register("abc").unwrap();

        assert!(matches!(
            table.register("abc"),
            Err(RpcError::DuplicateCorrelation(id)) if id == "abc"
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dropping_the_guard_unregisters() {
        let table = PendingCalls::new();
        let (guard, _rx) = table.register("abc").unwrap();
        assert!(table.contains("abc"));

        drop(guard);

        assert!(table.is_empty());
        assert!(!table.resolve("abc", vec![]));
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }
}
