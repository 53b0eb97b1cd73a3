//! Live comment and vote updates for a review
//!
//! `ChannelManager` holds the subscription lifecycle as plain state, and
//! `ReviewChannels` drives it against a `Realtime` backend.

mod backoff;
pub use backoff::{retry_delay, BACKOFF_AFTER_FAILURES, COOLDOWN, MAX_RETRY_DELAY, RETRY_DELAY};

mod dedup;
pub use dedup::{Deduplicator, VoteKey};

mod manager;
pub use manager::{ChannelKind, ChannelManager, Command, State};

mod driver;
pub use driver::{ChannelMessage, Realtime, ReviewChannels, Subscription};
