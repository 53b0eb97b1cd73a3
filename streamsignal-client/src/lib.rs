mod comment;
pub use comment::{normalize_comment, normalize_rows};

pub mod tree;

pub mod realtime;

mod thread;
pub use thread::ReviewThread;

pub mod api {
    pub use streamsignal_api::*;
}
