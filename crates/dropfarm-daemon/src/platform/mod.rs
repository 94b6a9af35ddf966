//! Platform client boundary.
//!
//! The daemon never speaks the platform's wire protocol directly; it
//! depends on the two traits here. [`client::PlatformClient`] covers the
//! persistent session (connect, logon, playing notifications, key
//! redemption) and delivers protocol callbacks through a channel.
//! [`web::WebSession`] covers the authenticated web surface (badge pages,
//! inventory, trade offers, confirmations).

pub mod client;
pub mod sim;
pub mod types;
pub mod web;

pub use client::{PlatformClient, PlatformError};
pub use types::*;
pub use web::{HttpClient, WebError, WebSession, fetch_with_retries};
