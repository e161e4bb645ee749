//! Publish/subscribe.
//!
//! - [`Dispatcher`] - channel registry, publishing and subscription control
//! - [`Subscription`] - handle for one registered callback
//! - [`PublisherHandle`] - the live subscriber link

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{Dispatcher, PublisherHandle, Subscription};
pub use worker::{Callback, CHANNEL_MAILBOX_CAPACITY};
