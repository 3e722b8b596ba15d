//! modhost-feed: a plugin registry backed by a directory of versioned packages
//!
//! ```text
//! <source>/
//! ├── greeter/
//! │   ├── 1.0.0/libgreeter.so
//! │   └── 1.1.0/libgreeter.so
//! └── discounts/
//!     └── 0.3.0/libdiscounts.so
//! ```
//!
//! [`FeedRegistry`] offers the highest version of each package to the plugin
//! host and, when monitored, polls the source for newer ones. A
//! [`PackageLock`] remembers what was already offered.

pub mod config;
pub mod error;
pub mod feed;
pub mod lock;
pub mod monitor;
pub mod registry;

pub use config::FeedConfig;
pub use error::FeedError;
pub use feed::{DirectoryFeed, FeedEntry, FeedPackage};
pub use lock::{LockRecord, PackageLock};
pub use monitor::FeedMonitor;
pub use registry::FeedRegistry;
