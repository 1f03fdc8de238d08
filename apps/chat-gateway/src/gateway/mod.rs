//! Real-time chat gateway: per-connection state machine, room fan-out and
//! the process-wide connection supervisor.

pub mod events;
pub mod fanout;
pub mod ordering;
pub mod redis;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;

use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::directory::RoomDirectory;
use crate::store::MessageStore;

use fanout::RoomBroker;
use ordering::{RoomGates, SharedRoomLock};

/// Per-connection outbound queue depth when not configured.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Collaborators shared by every connection task.
#[derive(Clone)]
pub struct Gateway {
    pub validator: Arc<dyn TokenValidator>,
    pub rooms: Arc<dyn RoomDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub broker: Arc<dyn RoomBroker>,
    pub gates: Arc<RoomGates>,
    pub outbound_buffer: usize,
}

impl Gateway {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        rooms: Arc<dyn RoomDirectory>,
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn RoomBroker>,
    ) -> Self {
        Self {
            validator,
            rooms,
            store,
            broker,
            gates: Arc::new(RoomGates::new()),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// Extend each room's ordering turn across every process sharing `lock`.
    pub fn with_shared_room_lock(mut self, lock: Arc<dyn SharedRoomLock>) -> Self {
        self.gates = Arc::new(RoomGates::with_shared_lock(lock));
        self
    }

    pub fn with_outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.outbound_buffer = outbound_buffer.max(1);
        self
    }
}
