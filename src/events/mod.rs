//! In-process subscriptions to lifecycle events.
//!
//! Events are collected while a transaction runs and published only after
//! it commits, so subscribers never see work that was rolled back.
//!
//! # Example
//!
//! ```ignore
//! let sub = store.subscribe(EventFilter::host(host.clone()));
//! manager.on_host_save(save)?;
//! for event in sub.drain() {
//!     if let LifecycleEvent::ChildArchived { item_id, .. } = event {
//!         println!("archived {}", item_id);
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{DropReason, EventFilter, LifecycleEvent, Subscription, SubscriptionId};
