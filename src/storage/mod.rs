//! Persistence seams the core depends on without owning a storage backend.

pub mod conversation_store;
pub mod event_sink;

pub use conversation_store::{ConversationStore, InMemoryConversationStore, StoreError};
pub use event_sink::{EventSink, FileEventSink, MemoryEventSink, SinkError};
