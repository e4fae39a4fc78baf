// Document sessions: per-document CRDT state, connections and awareness.

pub mod awareness;
pub mod registry;
pub mod session;

pub use registry::{RegistryOptions, SessionRegistry};
pub use session::{
    ConnectionId, Outbound, Session, SessionHandle, SessionOptions, OUTBOUND_QUEUE_CAPACITY,
};
