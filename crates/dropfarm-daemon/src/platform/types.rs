//! Shared types crossing the platform-client boundary.

use std::collections::BTreeMap;

/// Account identifier on the platform.
pub type AccountId = u64;
/// Game (application) identifier.
pub type AppId = u32;

/// Outcome of a session-level operation, mirroring the platform's result
/// codes the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Ok,
    /// An email auth code is required.
    AccountLogonDenied,
    /// A two-factor code is required (or the supplied one was invalid).
    NeedTwoFactor,
    InvalidPassword,
    /// Another session is already using the account's playing slot.
    LoggedInElsewhere,
    NoConnection,
    Timeout,
    ServiceUnavailable,
    /// Anything the daemon has no specific handling for.
    Other(u32),
}

/// Outcome of redeeming one activation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurchaseResult {
    Ok,
    AlreadyOwned,
    BaseGameRequired,
    DuplicatedKey,
    InvalidKey,
    OnCooldown,
    RegionLocked,
}

impl PurchaseResult {
    /// Terminal results burn the key: there is no point retrying it on
    /// another account.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::DuplicatedKey | Self::InvalidKey)
    }
}

impl std::fmt::Display for PurchaseResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::AlreadyOwned => "AlreadyOwned",
            Self::BaseGameRequired => "BaseGameRequired",
            Self::DuplicatedKey => "DuplicatedKey",
            Self::InvalidKey => "InvalidKey",
            Self::OnCooldown => "OnCooldown",
            Self::RegionLocked => "RegionLocked",
        };
        f.write_str(s)
    }
}

/// Reply to a key redemption: the result plus the granted items, keyed by
/// game id.
#[derive(Debug, Clone)]
pub struct RedeemResult {
    pub result: PurchaseResult,
    pub items: BTreeMap<AppId, String>,
}

/// Server-side notification categories flushed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// New items arrived in the inventory.
    Items,
    /// Trade offers await a decision.
    Trading,
    Other,
}

/// Where a chat message came from, and where the reply must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    User(AccountId),
    Chat(u64),
}

/// Everything needed for one logon attempt.
#[derive(Debug, Clone, Default)]
pub struct LogOnDetails {
    pub login: String,
    /// Plain password; omitted when a remembered login key is used.
    pub password: Option<String>,
    pub login_key: Option<String>,
    /// One-time email code, when the platform demanded one.
    pub auth_code: Option<String>,
    /// Mobile-authenticator code, when the account is enrolled.
    pub two_factor_code: Option<String>,
    /// SHA-1 over the machine's sentry file, when one exists.
    pub sentry_hash: Option<Vec<u8>>,
    pub should_remember_password: bool,
    /// Server-selection hint from the global database.
    pub cell_id: u32,
}

/// Machine-auth challenge delivered by the platform after logon.
#[derive(Debug, Clone)]
pub struct MachineAuthChunk {
    pub job_id: u64,
    pub file_name: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub one_time_password: u32,
}

/// Reply to a [`MachineAuthChunk`].
#[derive(Debug, Clone)]
pub struct MachineAuthResponse {
    pub job_id: u64,
    pub file_name: String,
    pub bytes_written: u32,
    pub file_size: u64,
    pub offset: u64,
    pub result: SessionResult,
    pub last_error: u32,
    pub one_time_password: u32,
    pub sentry_hash: Vec<u8>,
}

/// Protocol callbacks, dispatched to each bot in FIFO order.
#[derive(Debug, Clone)]
pub enum Callback {
    Connected {
        result: SessionResult,
    },
    Disconnected {
        user_initiated: bool,
    },
    LoggedOn {
        result: SessionResult,
        account_id: AccountId,
        cell_id: u32,
        /// Nonce for bootstrapping the web session after an OK logon.
        web_api_nonce: String,
        /// The account has a parental lock that must be unlocked with a PIN.
        parental_lock: bool,
    },
    /// A new remembered session key; must be persisted and acknowledged.
    LoginKey {
        key: String,
        unique_id: u64,
    },
    MachineAuth(MachineAuthChunk),
    /// Someone (possibly another device) started or stopped playing.
    PlayingSessionState {
        blocked: bool,
    },
    Notifications {
        kinds: Vec<NotificationKind>,
    },
    /// Guest passes (gifts) waiting for a decision.
    GuestPasses {
        gift_ids: Vec<u64>,
    },
    FriendRequest {
        from: AccountId,
    },
    Message {
        sender: AccountId,
        target: MessageTarget,
        text: String,
    },
}

/// One item in the account's web inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub asset_id: u64,
    pub class_id: u64,
    /// Game the item belongs to (the card-set id for cards).
    pub real_app_id: AppId,
    pub item_type: ItemType,
    pub tradable: bool,
}

/// Item classes relevant to looting and trade evaluation, matching the
/// platform's trading-type tag category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    TradingCard,
    FoilTradingCard,
    BoosterPack,
    Emoticon,
    ProfileBackground,
    Unknown,
}

impl ItemType {
    /// Whether the item is loot we forward to the master.
    pub fn is_lootable(self) -> bool {
        matches!(
            self,
            Self::TradingCard | Self::FoilTradingCard | Self::BoosterPack
        )
    }
}

/// An incoming trade offer pending a decision.
#[derive(Debug, Clone)]
pub struct TradeOffer {
    pub id: u64,
    pub other_id: AccountId,
    pub items_to_give: Vec<InventoryItem>,
    pub items_to_receive: Vec<InventoryItem>,
    /// Whether accepting requires a mobile confirmation afterwards.
    pub needs_confirmation: bool,
}

/// A pending two-factor confirmation.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub id: u64,
    pub nonce: u64,
    /// Maps to either a trade-offer id or a market-listing id.
    pub creator_id: u64,
    pub kind: ConfirmationKind,
}

/// Confirmation categories the platform distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Generic,
    Trade,
    Market,
    Other,
}

impl ConfirmationKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Generic,
            2 => Self::Trade,
            3 => Self::Market,
            _ => Self::Other,
        }
    }
}
