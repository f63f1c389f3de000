//! Client-side synchronization and optimistic cache layer for evaluation
//! records.
//!
//! Keeps a local replica of server-owned records fresh under four concurrent
//! update sources:
//!
//! - **Interval polling** via the [`scheduler::RevalidationScheduler`]
//! - **Focus/reconnect revalidation** via explicit trigger entry points
//! - **Optimistic local mutations** via the [`mutation::MutationEngine`]
//! - **Server push notifications** via the [`channel::PushChannel`]
//!
//! All four write through a single [`store::EntityStore`]; no component holds
//! a private copy of record data. [`client::SyncClient`] wires the pieces
//! together for UI consumers.

pub mod channel;
pub mod client;
pub mod dispatch;
mod error;
pub mod key;
pub mod mutation;
pub mod scheduler;
pub mod store;

pub use channel::{
    ChannelEvent, ChannelStatus, PushChannel, PushConnection, PushTransport, WebSocketTransport,
};
pub use client::{RecordSubscription, SyncClient, SyncConfig};
pub use dispatch::{PushUpdate, apply_push_update, decode_push_message};
pub use error::{ChannelError, FetchError, MutationError};
pub use key::{KeyFamily, KeyFilter, RecordKey};
pub use mutation::{MutationEngine, RecordMutator};
pub use scheduler::{
    PolicySet, RecordFetcher, RevalidateTrigger, RevalidationPolicy, RevalidationScheduler,
};
pub use store::{CacheValue, EntityStore, EntrySnapshot, StoreEvent, SubscriptionGuard};
