//! ses-proxy: store-and-forward email proxy on top of a managed
//! mail-receiving service.
//!
//! Inbound mail is archived by the receiving edge, then forwarded to a real
//! mailbox after alias resolution and header rewriting.

pub mod alias;
pub mod archive;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forwarder;
pub mod message;
pub mod retry;
pub mod rules;
pub mod server;
pub mod store;
