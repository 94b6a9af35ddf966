//! `dropfarm` daemon library.
//!
//! One [`bot::Bot`] per managed account keeps a platform session alive,
//! farms trading-card drops, redeems keys, loots to its master and confirms
//! pending two-factor actions. The [`supervisor::Supervisor`] owns the
//! fleet; process-wide login and gift gates live in [`limiter`].

pub mod authenticator;
pub mod bot;
pub mod farmer;
pub mod limiter;
pub mod platform;
pub mod supervisor;
pub mod trading;
