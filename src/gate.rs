use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::types::ClientId;

/// serializes allocation runs per client
///
/// At most one unit of work touching a client's loan or standing credit
/// runs at a time; runs for different clients proceed independently.
#[derive(Debug, Default)]
pub struct ClientGate {
    slots: Mutex<HashMap<ClientId, Arc<Mutex<()>>>>,
}

/// held while a run owns its client; the slot is dropped once nobody needs it
pub struct ClientPermit<'a> {
    gate: &'a ClientGate,
    client_id: ClientId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for ClientPermit<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters clone the slot under the map lock, so a lone reference is ours to remove
        let mut slots = self.gate.slots.lock();
        if slots
            .get(&self.client_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.client_id);
        }
    }
}

impl ClientGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// block until no other run holds this client
    pub fn enter(&self, client_id: ClientId) -> ClientPermit<'_> {
        let slot = self
            .slots
            .lock()
            .entry(client_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // map lock is released before waiting on the client slot
        ClientPermit {
            gate: self,
            client_id,
            guard: Some(slot.lock_arc()),
        }
    }

    /// clients with a run in flight or waiting
    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_busy(&self, client_id: ClientId) -> bool {
        self.slots
            .lock()
            .get(&client_id)
            .map(|slot| slot.is_locked())
            .unwrap_or(false)
    }
}
