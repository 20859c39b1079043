//! Apiprobe fixture servers
//!
//! Suite-scoped helpers tests run against: a static-file HTTP server
//! with bounce endpoints, a recording proxy store, and an SMTP capture
//! server whose mailbox is inspectable over HTTP.

pub mod proxy;
pub mod server;
pub mod smtp;

pub use proxy::{ProxyStore, StoredRequest};
pub use server::{FixtureConfig, FixtureServer};
pub use smtp::{SmtpServer, SmtpStore};
