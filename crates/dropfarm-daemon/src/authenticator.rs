//! Mobile two-factor authenticator.
//!
//! Generates the 5-character time-based login codes and drives the
//! confirmation pipeline: fetch the pending list, resolve details, accept
//! or deny individual entries. The accept/deny call is serialized per
//! account because the platform rejects parallel confirmation operations.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dropfarm_core::database::AuthenticatorSecrets;

use crate::platform::web::{ConfirmationQuery, WebError, WebSession};
use crate::platform::{AccountId, Confirmation, ConfirmationKind};

type HmacSha1 = Hmac<Sha1>;

/// Code alphabet the platform's authenticator uses.
const CODE_CHARSET: &[u8] = b"23456789BCDFGHJKMNPQRTVWXY";
/// Length of a login code.
const CODE_LENGTH: usize = 5;
/// Width of one time bucket in seconds.
const CODE_INTERVAL: u64 = 30;

/// Authenticator failures.
#[derive(Debug, Error)]
pub enum AuthenticatorError {
    #[error("Malformed authenticator secret: {0}")]
    BadSecret(String),

    /// Retryable: the bot refreshes the web session and tries again.
    #[error("Web session expired")]
    SessionExpired,

    #[error("Confirmation request failed: {0}")]
    Web(#[from] WebError),

    #[error("Malformed confirmation payload: {0}")]
    Parse(String),
}

/// Which confirmations an [`accept_confirmations`] pass should touch.
///
/// [`accept_confirmations`]: MobileAuthenticator::accept_confirmations
#[derive(Debug, Clone)]
pub enum ConfirmationFilter {
    All,
    /// Only confirmations of the given kind.
    Kind(ConfirmationKind),
    /// Only confirmations whose details resolve to this other party.
    OtherParty(AccountId),
    /// Only confirmations created by one of these trade-offer ids.
    TradeOfferIds(HashSet<u64>),
}

/// Generate the login code for the bucket containing `unix_time`.
pub fn generate_token(secrets: &AuthenticatorSecrets, unix_time: u64) -> Result<String, AuthenticatorError> {
    let key = BASE64
        .decode(&secrets.shared_secret)
        .map_err(|e| AuthenticatorError::BadSecret(e.to_string()))?;

    let bucket = unix_time / CODE_INTERVAL;
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| AuthenticatorError::BadSecret(e.to_string()))?;
    mac.update(&bucket.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation, then 5 base-26 characters.
    let start = (digest[19] & 0x0f) as usize;
    let mut value = u32::from_be_bytes([
        digest[start] & 0x7f,
        digest[start + 1],
        digest[start + 2],
        digest[start + 3],
    ]);

    let mut code = String::with_capacity(CODE_LENGTH);
    for _ in 0..CODE_LENGTH {
        code.push(CODE_CHARSET[value as usize % CODE_CHARSET.len()] as char);
        value /= CODE_CHARSET.len() as u32;
    }
    Ok(code)
}

/// Seconds left before the code for `unix_time` rotates.
pub fn seconds_until_next_bucket(unix_time: u64) -> u64 {
    CODE_INTERVAL - (unix_time % CODE_INTERVAL)
}

/// Base64 HMAC-SHA1 signature over the current time and operation tag,
/// keyed with the identity secret.
fn sign_operation(
    identity_secret: &str,
    unix_time: u64,
    tag: &str,
) -> Result<String, AuthenticatorError> {
    let key = BASE64
        .decode(identity_secret)
        .map_err(|e| AuthenticatorError::BadSecret(e.to_string()))?;
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| AuthenticatorError::BadSecret(e.to_string()))?;
    mac.update(&unix_time.to_be_bytes());
    mac.update(tag.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wire shape of the confirmations listing.
#[derive(Debug, Deserialize)]
struct ConfirmationListPayload {
    success: bool,
    #[serde(default)]
    conf: Vec<ConfirmationEntry>,
}

#[derive(Debug, Deserialize)]
struct ConfirmationEntry {
    id: u64,
    nonce: u64,
    creator_id: u64,
    #[serde(rename = "type")]
    kind: u32,
}

/// Wire shape of a confirmation details payload.
#[derive(Debug, Deserialize)]
struct ConfirmationDetailsPayload {
    success: bool,
    creator_id: u64,
    #[serde(rename = "type")]
    kind: u32,
}

/// The enrolled authenticator for one account.
pub struct MobileAuthenticator {
    secrets: AuthenticatorSecrets,
    account_id: AccountId,
    web: Arc<dyn WebSession>,
    /// The platform rejects parallel accepts; serialize them per account.
    handle_lock: Mutex<()>,
}

impl MobileAuthenticator {
    pub fn new(
        secrets: AuthenticatorSecrets,
        account_id: AccountId,
        web: Arc<dyn WebSession>,
    ) -> Self {
        Self {
            secrets,
            account_id,
            web,
            handle_lock: Mutex::new(()),
        }
    }

    /// Generate a login code for the current time bucket.
    pub fn current_token(&self) -> Result<String, AuthenticatorError> {
        generate_token(&self.secrets, now_unix())
    }

    fn query(&self, tag: &str) -> Result<ConfirmationQuery, AuthenticatorError> {
        let unix_time = now_unix();
        Ok(ConfirmationQuery {
            device_id: self.secrets.device_id.clone(),
            account_id: self.account_id,
            unix_time,
            signature: sign_operation(&self.secrets.identity_secret, unix_time, tag)?,
            tag: tag.to_string(),
        })
    }

    /// Fetch the pending confirmations for this account.
    pub async fn fetch_confirmations(&self) -> Result<Vec<Confirmation>, AuthenticatorError> {
        let query = self.query("list")?;
        let payload = match self.web.confirmations_page(&query).await {
            Ok(payload) => payload,
            Err(WebError::SessionExpired) => return Err(AuthenticatorError::SessionExpired),
            Err(e) => return Err(e.into()),
        };

        let parsed: ConfirmationListPayload = serde_json::from_str(&payload)
            .map_err(|e| AuthenticatorError::Parse(e.to_string()))?;
        if !parsed.success {
            // The usual cause is an expired web-session token.
            return Err(AuthenticatorError::SessionExpired);
        }

        Ok(parsed
            .conf
            .into_iter()
            .map(|c| Confirmation {
                id: c.id,
                nonce: c.nonce,
                creator_id: c.creator_id,
                kind: ConfirmationKind::from_code(c.kind),
            })
            .collect())
    }

    /// Resolve the creator id and kind of one confirmation.
    pub async fn confirmation_details(
        &self,
        confirmation: &Confirmation,
    ) -> Result<(u64, ConfirmationKind), AuthenticatorError> {
        let query = self.query("details")?;
        let payload = match self.web.confirmation_details(confirmation.id, &query).await {
            Ok(payload) => payload,
            Err(WebError::SessionExpired) => return Err(AuthenticatorError::SessionExpired),
            Err(e) => return Err(e.into()),
        };

        let parsed: ConfirmationDetailsPayload = serde_json::from_str(&payload)
            .map_err(|e| AuthenticatorError::Parse(e.to_string()))?;
        if !parsed.success {
            return Err(AuthenticatorError::SessionExpired);
        }
        Ok((parsed.creator_id, ConfirmationKind::from_code(parsed.kind)))
    }

    /// Accept or deny a single confirmation. Serialized per account.
    pub async fn handle(
        &self,
        confirmation: &Confirmation,
        accept: bool,
    ) -> Result<bool, AuthenticatorError> {
        let _serialized = self.handle_lock.lock().await;

        let op = if accept { "allow" } else { "cancel" };
        let query = self.query(op)?;
        match self
            .web
            .send_confirmation_op(op, confirmation.id, confirmation.nonce, &query)
            .await
        {
            Ok(success) => {
                debug!(
                    id = confirmation.id,
                    creator_id = confirmation.creator_id,
                    accept,
                    success,
                    "Confirmation handled"
                );
                Ok(success)
            }
            Err(WebError::SessionExpired) => Err(AuthenticatorError::SessionExpired),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch all pending confirmations and accept the ones the filter
    /// matches; the rest stay pending. Each confirmation id is handled at
    /// most once per fetched batch. Returns how many were accepted.
    pub async fn accept_confirmations(
        &self,
        filter: &ConfirmationFilter,
    ) -> Result<usize, AuthenticatorError> {
        let confirmations = self.fetch_confirmations().await?;
        if confirmations.is_empty() {
            return Ok(0);
        }

        let mut accepted = 0usize;
        for confirmation in confirmations {
            let matches = match filter {
                ConfirmationFilter::All => true,
                ConfirmationFilter::Kind(kind) => confirmation.kind == *kind,
                ConfirmationFilter::TradeOfferIds(ids) => ids.contains(&confirmation.creator_id),
                ConfirmationFilter::OtherParty(other) => {
                    match self.confirmation_details(&confirmation).await {
                        Ok((creator, _)) => creator == *other,
                        Err(AuthenticatorError::SessionExpired) => {
                            return Err(AuthenticatorError::SessionExpired);
                        }
                        Err(e) => {
                            warn!(id = confirmation.id, error = %e, "Skipping confirmation without details");
                            false
                        }
                    }
                }
            };
            if !matches {
                continue;
            }
            if self.handle(&confirmation, true).await? {
                accepted += 1;
            }
        }

        if accepted > 0 {
            info!(accepted, "Confirmations accepted");
        }
        Ok(accepted)
    }
}
