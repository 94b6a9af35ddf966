//! In-memory platform used by tests and offline dry runs.
//!
//! [`SimPlatform`] and [`SimWebSession`] implement the two boundary traits
//! with scriptable responses and call recording. Callbacks are injected by
//! the driver; nothing here talks to a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::client::{PlatformClient, PlatformError};
use super::types::{
    AccountId, AppId, Callback, InventoryItem, LogOnDetails, MachineAuthResponse, MessageTarget,
    RedeemResult, TradeOffer,
};
use super::web::{ConfirmationQuery, WebError, WebSession};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Everything a [`SimPlatform`] has been asked to do.
#[derive(Debug, Default)]
pub struct SimPlatformLog {
    pub connects: u32,
    pub disconnects: Vec<bool>,
    pub logons: Vec<LogOnDetails>,
    /// History of play-games notifications (sorted app sets).
    pub played: Vec<Vec<AppId>>,
    pub custom_names: Vec<Option<String>>,
    pub accepted_login_keys: Vec<u64>,
    pub machine_auth_responses: Vec<MachineAuthResponse>,
    pub messages: Vec<(MessageTarget, String)>,
    pub joined_chats: Vec<u64>,
    pub free_licenses: Vec<AppId>,
    pub offline_message_requests: u32,
    pub presence: Vec<bool>,
    pub friend_responses: Vec<(AccountId, bool)>,
}

/// Scriptable session-level platform.
pub struct SimPlatform {
    log: Mutex<SimPlatformLog>,
    redeem_results: Mutex<VecDeque<Option<RedeemResult>>>,
    web_api_nonces: Mutex<VecDeque<Option<String>>>,
    callback_tx: mpsc::Sender<Callback>,
}

impl SimPlatform {
    /// Create a simulator together with the callback stream a bot consumes.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Callback>) {
        let (callback_tx, callback_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                log: Mutex::new(SimPlatformLog::default()),
                redeem_results: Mutex::new(VecDeque::new()),
                web_api_nonces: Mutex::new(VecDeque::new()),
                callback_tx,
            }),
            callback_rx,
        )
    }

    /// Inject a protocol callback, as the platform would.
    pub async fn push_callback(&self, callback: Callback) {
        let _ = self.callback_tx.send(callback).await;
    }

    /// Queue the reply for the next `redeem_key` call (`None` = timeout).
    pub fn script_redeem(&self, result: Option<RedeemResult>) {
        lock(&self.redeem_results).push_back(result);
    }

    /// Queue the reply for the next `request_web_api_nonce` call.
    pub fn script_nonce(&self, nonce: Option<String>) {
        lock(&self.web_api_nonces).push_back(nonce);
    }

    /// Inspect the recorded interactions.
    pub fn with_log<R>(&self, f: impl FnOnce(&SimPlatformLog) -> R) -> R {
        f(&lock(&self.log))
    }
}

#[async_trait]
impl PlatformClient for SimPlatform {
    async fn connect(&self) {
        lock(&self.log).connects += 1;
    }

    async fn disconnect(&self, user_initiated: bool) {
        lock(&self.log).disconnects.push(user_initiated);
        let _ = self
            .callback_tx
            .send(Callback::Disconnected { user_initiated })
            .await;
    }

    async fn log_on(&self, details: LogOnDetails) {
        lock(&self.log).logons.push(details);
    }

    async fn accept_login_key(&self, unique_id: u64) {
        lock(&self.log).accepted_login_keys.push(unique_id);
    }

    async fn send_machine_auth_response(&self, response: MachineAuthResponse) {
        lock(&self.log).machine_auth_responses.push(response);
    }

    async fn play_games(&self, apps: &[AppId], custom_name: Option<&str>) {
        let mut sorted: Vec<AppId> = apps.to_vec();
        sorted.sort_unstable();
        let mut log = lock(&self.log);
        log.played.push(sorted);
        log.custom_names.push(custom_name.map(str::to_string));
    }

    async fn set_presence_online(&self, online: bool) {
        lock(&self.log).presence.push(online);
    }

    async fn request_free_license(&self, app: AppId) -> Result<Vec<AppId>, PlatformError> {
        lock(&self.log).free_licenses.push(app);
        Ok(vec![app])
    }

    async fn redeem_key(&self, _key: &str) -> Option<RedeemResult> {
        lock(&self.redeem_results).pop_front().flatten()
    }

    async fn request_web_api_nonce(&self) -> Option<String> {
        lock(&self.web_api_nonces)
            .pop_front()
            .unwrap_or(Some("fresh-nonce".to_string()))
    }

    async fn request_offline_messages(&self) {
        lock(&self.log).offline_message_requests += 1;
    }

    async fn send_message(&self, target: MessageTarget, text: &str) {
        lock(&self.log).messages.push((target, text.to_string()));
    }

    async fn join_chat(&self, clan_id: u64) {
        lock(&self.log).joined_chats.push(clan_id);
    }

    async fn respond_friend_request(&self, from: AccountId, accept: bool) {
        lock(&self.log).friend_responses.push((from, accept));
    }
}

/// Everything a [`SimWebSession`] has been asked to do.
#[derive(Debug, Default)]
pub struct SimWebLog {
    pub inits: Vec<(AccountId, String, String)>,
    pub accepted_offers: Vec<u64>,
    pub declined_offers: Vec<u64>,
    pub sent_offers: Vec<(Vec<InventoryItem>, AccountId, Option<String>)>,
    pub accepted_gifts: Vec<u64>,
    pub inventory_marks: u32,
    pub joined_groups: Vec<u64>,
    pub confirmation_ops: Vec<(String, u64)>,
    pub badge_fetches: u32,
}

/// Scriptable web session.
pub struct SimWebSession {
    log: Mutex<SimWebLog>,
    init_results: Mutex<VecDeque<bool>>,
    /// Successive fetches pop from the queue; the last entry repeats.
    badge_pages: Mutex<HashMap<u32, VecDeque<String>>>,
    /// Successive polls pop from the queue; the last entry repeats.
    game_pages: Mutex<HashMap<AppId, VecDeque<String>>>,
    inventory: Mutex<Vec<InventoryItem>>,
    trade_offers: Mutex<Vec<TradeOffer>>,
    confirmation_payloads: Mutex<VecDeque<Result<String, WebError>>>,
    detail_payloads: Mutex<HashMap<u64, String>>,
    confirmation_op_result: Mutex<Result<bool, WebError>>,
}

impl SimWebSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(SimWebLog::default()),
            init_results: Mutex::new(VecDeque::new()),
            badge_pages: Mutex::new(HashMap::new()),
            game_pages: Mutex::new(HashMap::new()),
            inventory: Mutex::new(Vec::new()),
            trade_offers: Mutex::new(Vec::new()),
            confirmation_payloads: Mutex::new(VecDeque::new()),
            detail_payloads: Mutex::new(HashMap::new()),
            confirmation_op_result: Mutex::new(Ok(true)),
        })
    }

    pub fn script_init(&self, result: bool) {
        lock(&self.init_results).push_back(result);
    }

    /// Queue successive badge-page documents for a page index.
    pub fn push_badge_page(&self, page: u32, html: impl Into<String>) {
        lock(&self.badge_pages)
            .entry(page)
            .or_default()
            .push_back(html.into());
    }

    /// Queue successive card-page documents for a game.
    pub fn push_game_page(&self, app: AppId, html: impl Into<String>) {
        lock(&self.game_pages)
            .entry(app)
            .or_default()
            .push_back(html.into());
    }

    pub fn set_inventory(&self, items: Vec<InventoryItem>) {
        *lock(&self.inventory) = items;
    }

    pub fn set_trade_offers(&self, offers: Vec<TradeOffer>) {
        *lock(&self.trade_offers) = offers;
    }

    pub fn script_confirmations(&self, payload: Result<String, WebError>) {
        lock(&self.confirmation_payloads).push_back(payload);
    }

    pub fn set_detail_payload(&self, id: u64, payload: impl Into<String>) {
        lock(&self.detail_payloads).insert(id, payload.into());
    }

    pub fn set_confirmation_op_result(&self, result: Result<bool, WebError>) {
        *lock(&self.confirmation_op_result) = result;
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&SimWebLog) -> R) -> R {
        f(&lock(&self.log))
    }
}

#[async_trait]
impl WebSession for SimWebSession {
    async fn init(&self, account_id: AccountId, nonce: &str, parental_pin: &str) -> bool {
        lock(&self.log)
            .inits
            .push((account_id, nonce.to_string(), parental_pin.to_string()));
        lock(&self.init_results).pop_front().unwrap_or(true)
    }

    async fn badge_page(&self, page: u32) -> Option<String> {
        lock(&self.log).badge_fetches += 1;
        let mut pages = lock(&self.badge_pages);
        let queue = pages.get_mut(&page)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    async fn game_cards_page(&self, app: AppId) -> Option<String> {
        let mut pages = lock(&self.game_pages);
        let queue = pages.get_mut(&app)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    async fn inventory(&self, tradable_only: bool) -> Option<Vec<InventoryItem>> {
        let items = lock(&self.inventory).clone();
        Some(if tradable_only {
            items.into_iter().filter(|i| i.tradable).collect()
        } else {
            items
        })
    }

    async fn active_trade_offers(&self) -> Option<Vec<TradeOffer>> {
        Some(lock(&self.trade_offers).clone())
    }

    async fn accept_trade_offer(&self, offer_id: u64) -> bool {
        lock(&self.log).accepted_offers.push(offer_id);
        true
    }

    async fn decline_trade_offer(&self, offer_id: u64) -> bool {
        lock(&self.log).declined_offers.push(offer_id);
        true
    }

    async fn send_trade_offer(
        &self,
        items: Vec<InventoryItem>,
        recipient: AccountId,
        token: Option<&str>,
    ) -> bool {
        lock(&self.log)
            .sent_offers
            .push((items, recipient, token.map(str::to_string)));
        true
    }

    async fn accept_gift(&self, gift_id: u64) -> bool {
        lock(&self.log).accepted_gifts.push(gift_id);
        true
    }

    async fn mark_inventory(&self) {
        lock(&self.log).inventory_marks += 1;
    }

    async fn join_group(&self, clan_id: u64) -> bool {
        lock(&self.log).joined_groups.push(clan_id);
        true
    }

    async fn owned_games(&self) -> Option<HashMap<AppId, String>> {
        Some(HashMap::new())
    }

    async fn confirmations_page(&self, _query: &ConfirmationQuery) -> Result<String, WebError> {
        lock(&self.confirmation_payloads)
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"success": true, "conf": []}"#.to_string()))
    }

    async fn confirmation_details(
        &self,
        id: u64,
        _query: &ConfirmationQuery,
    ) -> Result<String, WebError> {
        lock(&self.detail_payloads)
            .get(&id)
            .cloned()
            .ok_or(WebError::Api {
                status: 404,
                message: "no details scripted".into(),
            })
    }

    async fn send_confirmation_op(
        &self,
        op: &str,
        id: u64,
        _nonce: u64,
        _query: &ConfirmationQuery,
    ) -> Result<bool, WebError> {
        lock(&self.log).confirmation_ops.push((op.to_string(), id));
        match &*lock(&self.confirmation_op_result) {
            Ok(b) => Ok(*b),
            Err(WebError::SessionExpired) => Err(WebError::SessionExpired),
            Err(_) => Err(WebError::Api {
                status: 500,
                message: "scripted failure".into(),
            }),
        }
    }
}
