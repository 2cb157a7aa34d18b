//! Local-first chat data layer.
//!
//! A revisioned key-value store for chat sessions and their histories,
//! change notifications for UI reactivity, cooperative staleness detection
//! for async loads, and a pull-then-push snapshot sync against a remote
//! endpoint.

pub mod error;
pub mod events;
pub mod guard;
pub mod keys;
#[cfg(feature = "sync")]
pub mod remote;
pub mod session;
pub mod store;
pub mod sync;

pub use error::ChatVaultError;
pub use events::{ChangeBus, ChangeEvent, ChangeKind};
pub use guard::{LoadGuard, LoadTicket};
pub use keys::Topic;
#[cfg(feature = "sync")]
pub use remote::{SyncEngine, SyncReport};
pub use session::{ChatId, ChatItem, ChatRole, SessionConfig, SessionStore};
pub use store::{KvStore, Revision};
pub use sync::{apply_snapshot, merge_history};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, ChatVaultError>;
