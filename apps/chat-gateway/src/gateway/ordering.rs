//! Per-room sequencing of "append then publish".
//!
//! Holding a room's turn across both steps makes the live broadcast order of
//! a room identical to its storage order. Within one process the turn is an
//! async mutex per room; when several gateway processes share rooms a
//! [`SharedRoomLock`] extends the turn across processes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::RoomId;

#[derive(Debug, thiserror::Error)]
#[error("room ordering lock unavailable: {0}")]
pub struct GateError(pub String);

/// Mutual exclusion on a room's write path shared by every gateway process.
#[async_trait]
pub trait SharedRoomLock: Send + Sync {
    /// Wait for `room`'s turn. Returns a token identifying this holder.
    async fn acquire(&self, room: &RoomId) -> Result<String, GateError>;

    /// Give the turn back. Releasing a lock held by another token is a no-op.
    async fn release(&self, room: &RoomId, token: &str) -> Result<(), GateError>;
}

struct SharedLease {
    lock: Arc<dyn SharedRoomLock>,
    room: RoomId,
    token: String,
}

/// Exclusive right to append and publish in one room.
///
/// Call [`finish`](RoomTurn::finish) once the publish is done. A turn dropped
/// early (cancelled connection) releases its shared lease in the background.
pub struct RoomTurn {
    shared: Option<SharedLease>,
    _local: OwnedMutexGuard<()>,
}

impl RoomTurn {
    pub async fn finish(mut self) {
        if let Some(lease) = self.shared.take() {
            if let Err(err) = lease.lock.release(&lease.room, &lease.token).await {
                tracing::warn!(room_id = %lease.room, %err, "room lock release failed; waiting for expiry");
            }
        }
    }
}

impl Drop for RoomTurn {
    fn drop(&mut self) {
        let Some(lease) = self.shared.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = lease.lock.release(&lease.room, &lease.token).await;
            });
        }
    }
}

pub struct RoomGates {
    gates: DashMap<RoomId, Arc<Mutex<()>>>,
    shared: Option<Arc<dyn SharedRoomLock>>,
}

impl RoomGates {
    /// Gates for a single gateway process.
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
            shared: None,
        }
    }

    /// Gates that also take `shared` for every turn.
    pub fn with_shared_lock(shared: Arc<dyn SharedRoomLock>) -> Self {
        Self {
            gates: DashMap::new(),
            shared: Some(shared),
        }
    }

    /// Wait for exclusive use of `room`'s write path.
    ///
    /// Local contenders queue on the process mutex first so only one of them
    /// at a time competes for the shared lock.
    pub async fn enter(&self, room: &RoomId) -> Result<RoomTurn, GateError> {
        let gate = self.gates.entry(room.clone()).or_default().clone();
        let local = gate.lock_owned().await;

        let shared = match &self.shared {
            Some(lock) => Some(SharedLease {
                token: lock.acquire(room).await?,
                lock: lock.clone(),
                room: room.clone(),
            }),
            None => None,
        };

        Ok(RoomTurn {
            shared,
            _local: local,
        })
    }

    /// Drop `room`'s gate if nobody holds or waits on it.
    pub fn release_idle(&self, room: &RoomId) {
        self.gates
            .remove_if(room, |_, gate| Arc::strong_count(gate) == 1);
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

impl Default for RoomGates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    /// Shared lock stand-in: one holder per room, polled like a remote lock.
    #[derive(Default)]
    struct PolledLock {
        held: parking_lot::Mutex<HashMap<RoomId, String>>,
        issued: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SharedRoomLock for PolledLock {
        async fn acquire(&self, room: &RoomId) -> Result<String, GateError> {
            let n = self.issued.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let token = format!("t{n}");
            loop {
                {
                    let mut held = self.held.lock();
                    if !held.contains_key(room) {
                        held.insert(room.clone(), token.clone());
                        return Ok(token);
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn release(&self, room: &RoomId, token: &str) -> Result<(), GateError> {
            let mut held = self.held.lock();
            if held.get(room).map(String::as_str) == Some(token) {
                held.remove(room);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn same_room_is_serialized() {
        let gates = Arc::new(RoomGates::new());
        let room = RoomId::from("7");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = gates.enter(&room).await.unwrap();

        let task = {
            let gates = gates.clone();
            let room = room.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let _turn = gates.enter(&room).await.unwrap();
                log.lock().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.lock().push("first");
        first.finish().await;
        task.await.unwrap();

        assert_eq!(*log.lock(), ["first", "second"]);
    }

    #[tokio::test]
    async fn different_rooms_do_not_contend() {
        let gates = RoomGates::new();
        let _a = gates.enter(&RoomId::from("a")).await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(50), gates.enter(&RoomId::from("b")))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_gates_are_released() {
        let gates = RoomGates::new();
        let room = RoomId::from("7");

        let held = gates.enter(&room).await.unwrap();
        gates.release_idle(&room);
        assert_eq!(gates.len(), 1);

        drop(held);
        gates.release_idle(&room);
        assert!(gates.is_empty());
    }

    #[tokio::test]
    async fn shared_lock_serializes_separate_processes() {
        let lock = Arc::new(PolledLock::default());
        let process_a = Arc::new(RoomGates::with_shared_lock(lock.clone()));
        let process_b = Arc::new(RoomGates::with_shared_lock(lock.clone()));
        let room = RoomId::from("7");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let turn_a = process_a.enter(&room).await.unwrap();

        let task = {
            let room = room.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let turn = process_b.enter(&room).await.unwrap();
                log.lock().push("b");
                turn.finish().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        log.lock().push("a");
        turn_a.finish().await;
        task.await.unwrap();

        assert_eq!(*log.lock(), ["a", "b"]);
        assert!(lock.held.lock().is_empty());
    }

    #[tokio::test]
    async fn dropped_turn_releases_shared_lease() {
        let lock = Arc::new(PolledLock::default());
        let gates = RoomGates::with_shared_lock(lock.clone());
        let room = RoomId::from("7");

        let turn = gates.enter(&room).await.unwrap();
        drop(turn);

        let again = tokio::time::timeout(Duration::from_secs(1), gates.enter(&room)).await;
        assert!(again.is_ok());
    }

    struct BrokenLock;

    #[async_trait]
    impl SharedRoomLock for BrokenLock {
        async fn acquire(&self, _room: &RoomId) -> Result<String, GateError> {
            Err(GateError("unreachable".to_string()))
        }

        async fn release(&self, _room: &RoomId, _token: &str) -> Result<(), GateError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn shared_lock_failure_frees_local_gate() {
        let gates = RoomGates::with_shared_lock(Arc::new(BrokenLock));
        let room = RoomId::from("7");

        assert!(gates.enter(&room).await.is_err());
        gates.release_idle(&room);
        assert!(gates.is_empty());
    }
}
