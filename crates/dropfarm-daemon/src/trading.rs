//! Trade-offer policy and loot.
//!
//! Incoming offers are decided by a fixed ladder: the master is always
//! trusted, pure donations are welcome, one-sided losses are declined, and
//! anything else must be a neutral-or-better card swap per set. Outbound
//! loot gathers every card, foil and booster pack and offers it to the
//! master in one trade.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::authenticator::{AuthenticatorError, ConfirmationFilter, MobileAuthenticator};
use crate::limiter::GateLimiter;
use crate::platform::{AccountId, AppId, InventoryItem, ItemType, TradeOffer, WebSession};

/// How long to let an accepted offer settle before confirming it.
const CONFIRMATION_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// What to do with one incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDecision {
    Accept,
    Decline,
    /// Leave the offer pending for the operator.
    Ignore,
}

/// Decide an incoming offer.
///
/// `sets_owned` maps card-set ids to how many cards of that set we hold;
/// it feeds the neutral-swap evaluation for offers between strangers.
pub fn evaluate_offer(
    offer: &TradeOffer,
    master_id: AccountId,
    sets_owned: &HashMap<AppId, u32>,
) -> TradeDecision {
    if offer.other_id == master_id {
        return TradeDecision::Accept;
    }

    // A donation costs us nothing.
    if offer.items_to_give.is_empty() {
        return TradeDecision::Accept;
    }

    // Giving something for nothing is robbery.
    if offer.items_to_receive.is_empty() {
        return TradeDecision::Decline;
    }

    // Strangers may only swap cards, and only neutral-or-better per set.
    let card_types = [ItemType::TradingCard, ItemType::FoilTradingCard];
    if !offer
        .items_to_give
        .iter()
        .chain(offer.items_to_receive.iter())
        .all(|item| card_types.contains(&item.item_type))
    {
        return TradeDecision::Ignore;
    }

    let mut balance: HashMap<AppId, i64> = HashMap::new();
    for item in &offer.items_to_give {
        *balance.entry(item.real_app_id).or_default() -= 1;
    }
    for item in &offer.items_to_receive {
        *balance.entry(item.real_app_id).or_default() += 1;
    }

    // Every set we give from must come back at least even, and must be a
    // set we actually track; otherwise leave the decision to a human.
    for (set, delta) in &balance {
        if *delta < 0 {
            return TradeDecision::Ignore;
        }
        if !sets_owned.contains_key(set) && *delta != 0 {
            return TradeDecision::Ignore;
        }
    }

    TradeDecision::Accept
}

/// Per-bot trading pipeline.
pub struct Trading {
    bot_name: String,
    master_id: AccountId,
    trade_token: Option<String>,
    web: Arc<dyn WebSession>,
    /// At most one `check_trades` per bot.
    check_lock: Mutex<()>,
    /// At most one `send_loot` per bot.
    loot_lock: Mutex<()>,
    gifts_limiter: GateLimiter,
}

impl Trading {
    pub fn new(
        bot_name: impl Into<String>,
        master_id: AccountId,
        trade_token: Option<String>,
        web: Arc<dyn WebSession>,
        gifts_limiter: GateLimiter,
    ) -> Self {
        Self {
            bot_name: bot_name.into(),
            master_id,
            trade_token,
            web,
            check_lock: Mutex::new(()),
            loot_lock: Mutex::new(()),
            gifts_limiter,
        }
    }

    /// Fetch active incoming offers and decide each one. Offers accepted
    /// with a pending confirmation get exactly that confirmation accepted.
    pub async fn check_trades(&self, authenticator: Option<&MobileAuthenticator>) {
        let _serialized = self.check_lock.lock().await;

        let Some(offers) = self.web.active_trade_offers().await else {
            warn!(bot = %self.bot_name, "Could not fetch trade offers");
            return;
        };
        if offers.is_empty() {
            return;
        }

        let sets_owned = self.owned_card_sets().await;
        let mut accepted_needing_confirmation: HashSet<u64> = HashSet::new();

        for offer in &offers {
            match evaluate_offer(offer, self.master_id, &sets_owned) {
                TradeDecision::Accept => {
                    info!(bot = %self.bot_name, offer = offer.id, from = offer.other_id, "Accepting trade offer");
                    if self.web.accept_trade_offer(offer.id).await && offer.needs_confirmation {
                        accepted_needing_confirmation.insert(offer.id);
                    }
                }
                TradeDecision::Decline => {
                    info!(bot = %self.bot_name, offer = offer.id, from = offer.other_id, "Declining trade offer");
                    self.web.decline_trade_offer(offer.id).await;
                }
                TradeDecision::Ignore => {
                    debug!(bot = %self.bot_name, offer = offer.id, "Leaving trade offer pending");
                }
            }
        }

        if accepted_needing_confirmation.is_empty() {
            return;
        }
        let Some(authenticator) = authenticator else {
            warn!(bot = %self.bot_name, "Accepted offers need confirmation but no authenticator is enrolled");
            return;
        };
        if let Err(e) = authenticator
            .accept_confirmations(&ConfirmationFilter::TradeOfferIds(
                accepted_needing_confirmation,
            ))
            .await
        {
            warn!(bot = %self.bot_name, error = %e, "Confirming accepted offers failed");
        }
    }

    /// Offer every lootable item to the master. Returns whether an offer
    /// went out.
    pub async fn send_loot(&self, authenticator: Option<&MobileAuthenticator>) -> bool {
        let _serialized = self.loot_lock.lock().await;

        if self.master_id == 0 {
            debug!(bot = %self.bot_name, "No master configured, nothing to loot to");
            return false;
        }

        let Some(items) = self.web.inventory(true).await else {
            warn!(bot = %self.bot_name, "Could not fetch inventory for looting");
            return false;
        };
        let loot: Vec<InventoryItem> = items
            .into_iter()
            .filter(|item| item.item_type.is_lootable())
            .collect();
        if loot.is_empty() {
            debug!(bot = %self.bot_name, "Nothing to loot");
            return false;
        }

        let count = loot.len();
        if !self
            .web
            .send_trade_offer(loot, self.master_id, self.trade_token.as_deref())
            .await
        {
            warn!(bot = %self.bot_name, "Loot offer failed");
            return false;
        }
        info!(bot = %self.bot_name, items = count, master = self.master_id, "Loot offer sent");

        // Give the platform a moment to materialize the confirmation.
        tokio::time::sleep(CONFIRMATION_SETTLE_DELAY).await;

        if let Some(authenticator) = authenticator {
            match authenticator
                .accept_confirmations(&ConfirmationFilter::OtherParty(self.master_id))
                .await
            {
                Ok(_) | Err(AuthenticatorError::SessionExpired) => {}
                Err(e) => {
                    warn!(bot = %self.bot_name, error = %e, "Confirming loot offer failed");
                }
            }
        }
        true
    }

    /// Accept an incoming guest pass, throttled by the process-wide gifts
    /// gate.
    pub async fn accept_gift(&self, gift_id: u64) -> bool {
        let _pass = self.gifts_limiter.acquire().await;
        let accepted = self.web.accept_gift(gift_id).await;
        if accepted {
            info!(bot = %self.bot_name, gift_id, "Gift accepted");
        } else {
            warn!(bot = %self.bot_name, gift_id, "Gift accept failed");
        }
        accepted
    }

    /// Count how many cards we hold per set, for swap evaluation.
    async fn owned_card_sets(&self) -> HashMap<AppId, u32> {
        let mut sets: HashMap<AppId, u32> = HashMap::new();
        if let Some(items) = self.web.inventory(false).await {
            for item in items {
                if matches!(
                    item.item_type,
                    ItemType::TradingCard | ItemType::FoilTradingCard
                ) {
                    *sets.entry(item.real_app_id).or_default() += 1;
                }
            }
        }
        sets
    }
}
