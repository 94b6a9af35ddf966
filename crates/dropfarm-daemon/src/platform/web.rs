//! Authenticated web surface of the platform.
//!
//! Page fetches return raw documents; the callers own the parsing (the
//! farmer for badge pages, the authenticator for confirmation payloads).
//! Everything rides on [`HttpClient`], a thin reqwest wrapper with the
//! bounded-retry policy the rest of the daemon assumes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{AccountId, AppId, InventoryItem, TradeOffer};

/// Attempts per request before giving up.
pub const DEFAULT_RETRIES: u32 = 5;

/// Errors surfaced by web-session operations.
#[derive(Debug, Error)]
pub enum WebError {
    /// The web session token is no longer valid; the caller should refresh
    /// the session and retry once.
    #[error("Web session expired")]
    SessionExpired,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Parameters of a signed confirmation request.
#[derive(Debug, Clone)]
pub struct ConfirmationQuery {
    pub device_id: String,
    pub account_id: AccountId,
    pub unix_time: u64,
    /// Base64 HMAC-SHA1 over time and tag, keyed with the identity secret.
    pub signature: String,
    /// Operation tag the signature covers ("list", "details", "allow", "cancel").
    pub tag: String,
}

/// The authenticated web session for one account.
#[async_trait]
pub trait WebSession: Send + Sync {
    /// Bootstrap the session from a logon nonce. Returns `false` when the
    /// platform rejects the nonce (the caller requests a fresh one and
    /// retries once).
    async fn init(&self, account_id: AccountId, nonce: &str, parental_pin: &str) -> bool;

    /// Badge page `n` (1-based) as an HTML document. `None` after retries.
    async fn badge_page(&self, page: u32) -> Option<String>;

    /// A game's trading-card page as an HTML document.
    async fn game_cards_page(&self, app: AppId) -> Option<String>;

    /// The account's inventory.
    async fn inventory(&self, tradable_only: bool) -> Option<Vec<InventoryItem>>;

    /// Active incoming trade offers.
    async fn active_trade_offers(&self) -> Option<Vec<TradeOffer>>;

    async fn accept_trade_offer(&self, offer_id: u64) -> bool;

    async fn decline_trade_offer(&self, offer_id: u64) -> bool;

    /// Send a single outbound offer; `token` authorizes offers to accounts
    /// not on the friends list.
    async fn send_trade_offer(
        &self,
        items: Vec<InventoryItem>,
        recipient: AccountId,
        token: Option<&str>,
    ) -> bool;

    async fn accept_gift(&self, gift_id: u64) -> bool;

    /// Mark the inventory as viewed, clearing the new-items badge.
    async fn mark_inventory(&self);

    async fn join_group(&self, clan_id: u64) -> bool;

    /// Owned games, keyed by app id.
    async fn owned_games(&self) -> Option<HashMap<AppId, String>>;

    /// The signed confirmations listing (JSON payload).
    async fn confirmations_page(&self, query: &ConfirmationQuery) -> Result<String, WebError>;

    /// The signed details payload for one confirmation.
    async fn confirmation_details(
        &self,
        id: u64,
        query: &ConfirmationQuery,
    ) -> Result<String, WebError>;

    /// Issue a signed accept/deny ("allow"/"cancel") for one confirmation.
    async fn send_confirmation_op(
        &self,
        op: &str,
        id: u64,
        nonce: u64,
        query: &ConfirmationQuery,
    ) -> Result<bool, WebError>;
}

/// Run a fallible fetch up to `attempts` times, immediately retrying on
/// failure; `None` plus a warning on exhaustion.
pub async fn fetch_with_retries<T, F, Fut>(what: &str, attempts: u32, mut fetch: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WebError>>,
{
    for attempt in 1..=attempts {
        match fetch().await {
            Ok(value) => return Some(value),
            Err(e) => {
                debug!(what, attempt, error = %e, "Request attempt failed");
            }
        }
    }
    warn!(what, attempts, "Request failed after retries");
    None
}

/// Plain HTTP helper real [`WebSession`] implementations build on.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
}

impl HttpClient {
    /// Build a client with the configured connection timeout.
    pub fn new(connection_timeout: Duration) -> Result<Self, WebError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connection_timeout)
            .timeout(connection_timeout * 3)
            .cookie_store(true)
            .build()?;
        Ok(Self { http })
    }

    /// GET a page as text, treating auth redirects as an expired session.
    pub async fn get_text(&self, url: &str) -> Result<String, WebError> {
        let resp = self.http.get(url).send().await?;
        Self::check_status(&resp)?;
        Ok(resp.text().await?)
    }

    /// POST a form, returning the body as text.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<String, WebError> {
        let resp = self.http.post(url).form(form).send().await?;
        Self::check_status(&resp)?;
        Ok(resp.text().await?)
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), WebError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status.is_redirection() {
            return Err(WebError::SessionExpired);
        }
        if !status.is_success() {
            return Err(WebError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }
}
