#![cfg_attr(not(test), warn(clippy::unwrap_used))]
pub mod cache;
pub mod fetch;
pub mod headers;
pub mod key;
pub mod serde_ext;

pub use cache::{Cache, Error, Stats, Writer};
pub use fetch::fetch;
pub use headers::Headers;
pub use key::Key;
