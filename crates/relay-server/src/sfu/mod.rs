//! Relay engine
//!
//! Sessions group members; every source a member publishes is forwarded to
//! all other members of its session without transcoding.

mod fanout;
mod member;
mod registry;
mod session;
mod source;

pub use member::{Member, Presence};
pub use registry::Registry;
pub use session::{Removal, Session};
pub use source::MediaSource;
