//! Session-level platform operations.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    AccountId, AppId, LogOnDetails, MachineAuthResponse, MessageTarget, RedeemResult,
};

/// Errors surfaced by session-level operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Platform error: {0}")]
    Remote(String),
}

/// The persistent protocol session for one account.
///
/// Implementations deliver [`Callback`](super::types::Callback)s through
/// the channel handed to the bot at construction; every callback for one
/// account arrives in FIFO order. All methods are fire-and-forget unless
/// they document a reply.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Open the connection. Outcome arrives as `Callback::Connected`.
    async fn connect(&self);

    /// Tear the connection down. Produces `Callback::Disconnected` with
    /// the given initiator flag.
    async fn disconnect(&self, user_initiated: bool);

    /// Attempt a logon. Outcome arrives as `Callback::LoggedOn`.
    async fn log_on(&self, details: LogOnDetails);

    /// Acknowledge a received login key so the platform finalizes it.
    async fn accept_login_key(&self, unique_id: u64);

    /// Answer a machine-auth sentry challenge.
    async fn send_machine_auth_response(&self, response: MachineAuthResponse);

    /// Report the given games (or a custom name) as currently played.
    /// An empty set with no name stops playing.
    async fn play_games(&self, apps: &[AppId], custom_name: Option<&str>);

    /// Announce online presence (or stay invisible when `false`).
    async fn set_presence_online(&self, online: bool);

    /// Ask for a free license; returns the granted app ids.
    async fn request_free_license(&self, app: AppId) -> Result<Vec<AppId>, PlatformError>;

    /// Redeem an activation key. `None` means the request timed out.
    async fn redeem_key(&self, key: &str) -> Option<RedeemResult>;

    /// Request a fresh nonce for web-session bootstrap. `None` on timeout.
    async fn request_web_api_nonce(&self) -> Option<String>;

    /// Ask the platform to flush offline messages to this session.
    async fn request_offline_messages(&self);

    /// Send a chat message to a user or chat room.
    async fn send_message(&self, target: MessageTarget, text: &str);

    /// Join a group chat.
    async fn join_chat(&self, clan_id: u64);

    /// Accept or decline a pending friend request.
    async fn respond_friend_request(&self, from: AccountId, accept: bool);
}
