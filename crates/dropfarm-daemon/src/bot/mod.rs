//! Per-account orchestrator.
//!
//! A [`Bot`] owns one platform session and everything attached to it: the
//! connection state machine, the card farmer, trading, the mobile
//! authenticator and the periodic timers. Protocol callbacks arrive on a
//! channel and are consumed by a single task per bot, so ordering is
//! preserved and handler errors stay observable.

pub mod commands;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use dropfarm_core::config::{BotConfig, GlobalConfig, IdleGames};
use dropfarm_core::database::{BotDatabase, GlobalDatabase, sentry_hash, write_sentry_chunk};

use crate::authenticator::{ConfirmationFilter, MobileAuthenticator};
use crate::farmer::{CardsFarmer, FarmerConfig, FarmerEvent};
use crate::limiter::GateLimiter;
use crate::platform::{
    AccountId, Callback, LogOnDetails, MachineAuthChunk, MachineAuthResponse, MessageTarget,
    NotificationKind, PlatformClient, RedeemResult, SessionResult, WebSession,
};
use crate::supervisor::Supervisor;
use crate::trading::Trading;

/// Pause after web bootstrap before farming starts, giving a pending
/// playing-session callback time to arrive.
const PRE_FARM_GRACE: Duration = Duration::from_secs(1);

/// Process-wide pieces every bot shares.
pub struct BotContext {
    pub global_config: GlobalConfig,
    pub global_db: Arc<GlobalDatabase>,
    pub login_limiter: GateLimiter,
    pub gifts_limiter: GateLimiter,
}

impl BotContext {
    pub fn new(global_config: GlobalConfig, global_db: Arc<GlobalDatabase>) -> Arc<Self> {
        let login_limiter =
            GateLimiter::new(Duration::from_secs(global_config.login_limiter_delay));
        let gifts_limiter =
            GateLimiter::new(Duration::from_secs(global_config.gifts_limiter_delay));
        Arc::new(Self {
            global_config,
            global_db,
            login_limiter,
            gifts_limiter,
        })
    }
}

#[derive(Default)]
struct BotState {
    keep_running: bool,
    connected: bool,
    logged_on: bool,
    account_id: AccountId,
    /// Sticky flag set by an invalid-password logon result; consumed by
    /// the next disconnect.
    invalid_password: bool,
    /// Whether the last logon attempt used the remembered login key.
    used_login_key: bool,
    /// One-time email code for the next logon.
    auth_code: Option<String>,
    /// One-time two-factor code for the next logon (manual accounts).
    two_factor_code: Option<String>,
    /// Sleep before the next reconnect, set by logon failures.
    reconnect_delay: Option<Duration>,
    /// Cancels the timers of the current start-to-stop run.
    run_shutdown: Option<watch::Sender<bool>>,
    timers_started: bool,
}

pub struct Bot {
    name: String,
    config: BotConfig,
    db: BotDatabase,
    sentry_path: PathBuf,
    ctx: Arc<BotContext>,
    client: Arc<dyn PlatformClient>,
    web: Arc<dyn WebSession>,
    farmer: Arc<CardsFarmer>,
    trading: Arc<Trading>,
    authenticator: StdMutex<Option<Arc<MobileAuthenticator>>>,
    state: StdMutex<BotState>,
    fleet: StdMutex<Weak<Supervisor>>,
}

impl Bot {
    /// Build a bot and spawn its callback consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        config: BotConfig,
        db: BotDatabase,
        sentry_path: PathBuf,
        ctx: Arc<BotContext>,
        client: Arc<dyn PlatformClient>,
        callbacks: mpsc::Receiver<Callback>,
        web: Arc<dyn WebSession>,
    ) -> Arc<Self> {
        let name = name.into();

        let mut blacklist = ctx.global_config.blacklist.clone();
        blacklist.extend(config.blacklist.iter().copied());
        let (farmer_tx, farmer_rx) = mpsc::channel(8);
        let farmer = CardsFarmer::new(
            name.clone(),
            FarmerConfig {
                restricted: config.card_drops_restricted,
                farming_delay: Duration::from_secs(ctx.global_config.farming_delay * 60),
                max_farming_time: Duration::from_secs(ctx.global_config.max_farming_time * 3600),
                blacklist,
            },
            Arc::clone(&client),
            Arc::clone(&web),
            farmer_tx,
        );

        let trading = Arc::new(Trading::new(
            name.clone(),
            config.master_id,
            config.trade_token.clone(),
            Arc::clone(&web),
            ctx.gifts_limiter.clone(),
        ));

        let bot = Arc::new(Self {
            name,
            config,
            db,
            sentry_path,
            ctx,
            client,
            web,
            farmer,
            trading,
            authenticator: StdMutex::new(None),
            state: StdMutex::new(BotState::default()),
            fleet: StdMutex::new(Weak::new()),
        });

        bot.spawn_consumer(callbacks, farmer_rx);
        bot
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn keep_running(&self) -> bool {
        self.st().keep_running
    }

    pub fn connected(&self) -> bool {
        self.st().connected
    }

    pub fn farmer(&self) -> &Arc<CardsFarmer> {
        &self.farmer
    }

    pub fn trading(&self) -> &Arc<Trading> {
        &self.trading
    }

    pub fn authenticator(&self) -> Option<Arc<MobileAuthenticator>> {
        self.lock_auth().clone()
    }

    /// Wire up the fleet handle for cross-bot commands.
    pub fn set_fleet(&self, fleet: &Arc<Supervisor>) {
        *self
            .fleet
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(fleet);
    }

    pub(crate) fn fleet(&self) -> Option<Arc<Supervisor>> {
        self.fleet
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }

    fn st(&self) -> MutexGuard<'_, BotState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_auth(&self) -> MutexGuard<'_, Option<Arc<MobileAuthenticator>>> {
        self.authenticator
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// One human-readable status line for command replies.
    pub fn status_line(&self) -> String {
        let (keep_running, connected, logged_on) = {
            let st = self.st();
            (st.keep_running, st.connected, st.logged_on)
        };
        if !keep_running {
            return format!("<{}> Bot is stopped", self.name);
        }
        if !connected {
            return format!("<{}> Bot is connecting", self.name);
        }
        if !logged_on {
            return format!("<{}> Bot is logging in", self.name);
        }
        let snap = self.farmer.snapshot();
        if snap.manual_mode {
            format!("<{}> Bot is in manual play mode", self.name)
        } else if snap.now_farming {
            format!(
                "<{}> Bot is farming {} games ({} total left)",
                self.name,
                snap.currently_farming.len(),
                snap.games_to_farm
            )
        } else {
            format!("<{}> Bot is idle", self.name)
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the bot: raise `keep_running` and connect.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut st = self.st();
            if st.keep_running {
                return;
            }
            st.keep_running = true;
            let (tx, _) = watch::channel(false);
            st.run_shutdown = Some(tx);
            st.timers_started = false;
        }
        info!(bot = %self.name, "Starting");
        self.connect_gated().await;
    }

    /// Stop the bot: clear `keep_running`, cancel timers, disconnect.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut st = self.st();
            if !st.keep_running {
                return;
            }
            st.keep_running = false;
            st.timers_started = false;
            if let Some(tx) = st.run_shutdown.take() {
                let _ = tx.send(true);
            }
        }
        info!(bot = %self.name, "Stopping");
        self.farmer.stop().await;
        self.client.disconnect(true).await;
        self.notify_stopped();
    }

    /// Stop with a reason, for fatal conditions.
    async fn stop_with_reason(self: &Arc<Self>, reason: &str) {
        error!(bot = %self.name, reason, "Stopping bot");
        self.stop().await;
    }

    /// Connect through the process-wide login gate. A pre-acquired
    /// two-factor code skips the gate: the code expires quickly and the
    /// wait could burn it.
    async fn connect_gated(self: &Arc<Self>) {
        if !self.keep_running() {
            return;
        }
        let has_token = self.st().two_factor_code.is_some();
        if has_token {
            self.client.connect().await;
        } else {
            let _pass = self.ctx.login_limiter.acquire().await;
            self.client.connect().await;
        }
    }

    fn notify_stopped(&self) {
        if let Some(fleet) = self.fleet() {
            fleet.on_bot_stopped();
        }
    }

    /// Supply a one-time email auth code for the next logon.
    pub fn set_auth_code(&self, code: impl Into<String>) {
        self.st().auth_code = Some(code.into());
    }

    // =========================================================================
    // Callback consumer
    // =========================================================================

    fn spawn_consumer(
        self: &Arc<Self>,
        mut callbacks: mpsc::Receiver<Callback>,
        mut farmer_events: mpsc::Receiver<FarmerEvent>,
    ) {
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    callback = callbacks.recv() => {
                        match callback {
                            Some(callback) => bot.handle_callback(callback).await,
                            None => {
                                debug!(bot = %bot.name, "Callback channel closed");
                                break;
                            }
                        }
                    }
                    event = farmer_events.recv() => {
                        if let Some(event) = event {
                            bot.handle_farmer_event(event).await;
                        }
                    }
                }
            }
        });
    }

    async fn handle_callback(self: &Arc<Self>, callback: Callback) {
        match callback {
            Callback::Connected { result } => self.on_connected(result).await,
            Callback::Disconnected { user_initiated } => {
                self.on_disconnected(user_initiated).await;
            }
            Callback::LoggedOn {
                result,
                account_id,
                cell_id,
                web_api_nonce,
                parental_lock,
            } => {
                self.on_logged_on(result, account_id, cell_id, &web_api_nonce, parental_lock)
                    .await;
            }
            Callback::LoginKey { key, unique_id } => self.on_login_key(key, unique_id).await,
            Callback::MachineAuth(chunk) => self.on_machine_auth(chunk).await,
            Callback::PlayingSessionState { blocked } => {
                self.on_playing_session_state(blocked).await;
            }
            Callback::Notifications { kinds } => self.on_notifications(&kinds).await,
            Callback::GuestPasses { gift_ids } => self.on_guest_passes(gift_ids).await,
            Callback::FriendRequest { from } => self.on_friend_request(from).await,
            Callback::Message {
                sender,
                target,
                text,
            } => {
                let bot = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(reply) = commands::handle_message(&bot, sender, &text).await {
                        bot.send_response(target, &reply).await;
                    }
                });
            }
        }
    }

    async fn handle_farmer_event(self: &Arc<Self>, event: FarmerEvent) {
        match event {
            FarmerEvent::FarmingFinished { farmed_something } => {
                self.on_farming_finished(farmed_something).await;
            }
        }
    }

    // =========================================================================
    // Connection state machine
    // =========================================================================

    async fn on_connected(self: &Arc<Self>, result: SessionResult) {
        if result != SessionResult::Ok {
            warn!(bot = %self.name, ?result, "Connection failed");
            self.stop_with_reason("connection failed").await;
            return;
        }
        self.st().connected = true;
        info!(bot = %self.name, "Connected, logging in");

        let sentry = match sentry_hash(&self.sentry_path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(bot = %self.name, error = %e, "Unreadable sentry file, logging in without it");
                None
            }
        };

        let login_key = self.db.login_key();
        let two_factor_code = {
            let enrolled = self.lock_auth().clone();
            match enrolled {
                Some(authenticator) => match authenticator.current_token() {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!(bot = %self.name, error = %e, "Token generation failed");
                        None
                    }
                },
                None => {
                    let secrets = self.db.authenticator();
                    match secrets {
                        Some(secrets) => {
                            // Enrollment discovered in the database; the
                            // account id arrives with the logon reply, so
                            // the full authenticator is built there.
                            crate::authenticator::generate_token(&secrets, unix_now()).ok()
                        }
                        None => self.st().two_factor_code.take(),
                    }
                }
            }
        };

        let details = {
            let mut st = self.st();
            st.used_login_key = login_key.is_some();
            LogOnDetails {
                login: self.config.login.clone(),
                password: if login_key.is_some() {
                    None
                } else {
                    Some(self.config.password.clone())
                },
                login_key,
                auth_code: st.auth_code.take(),
                two_factor_code,
                sentry_hash: sentry,
                should_remember_password: true,
                cell_id: self.ctx.global_db.cell_id(),
            }
        };
        self.client.log_on(details).await;
    }

    async fn on_logged_on(
        self: &Arc<Self>,
        result: SessionResult,
        account_id: AccountId,
        cell_id: u32,
        web_api_nonce: &str,
        parental_lock: bool,
    ) {
        match result {
            SessionResult::Ok => {
                self.on_logon_ok(account_id, cell_id, web_api_nonce, parental_lock)
                    .await;
            }
            SessionResult::AccountLogonDenied => {
                self.stop_with_reason(
                    "the platform demands an email auth code; supply one in the bot config",
                )
                .await;
            }
            SessionResult::NeedTwoFactor => {
                if self.lock_auth().is_some() || self.db.authenticator().is_some() {
                    warn!(bot = %self.name, "Two-factor code rejected, retrying with a fresh one");
                    self.client.disconnect(false).await;
                } else {
                    self.stop_with_reason(
                        "the account needs a two-factor code and no authenticator is enrolled",
                    )
                    .await;
                }
            }
            SessionResult::InvalidPassword => {
                warn!(bot = %self.name, "Invalid password");
                self.st().invalid_password = true;
                self.client.disconnect(false).await;
            }
            SessionResult::LoggedInElsewhere => {
                let retry = self.ctx.global_config.logged_elsewhere_retry;
                if retry == 0 {
                    self.stop_with_reason("account is in use elsewhere").await;
                } else {
                    warn!(bot = %self.name, minutes = retry, "Account in use elsewhere, will retry");
                    self.st().reconnect_delay = Some(Duration::from_secs(retry * 60));
                    self.client.disconnect(false).await;
                }
            }
            SessionResult::NoConnection
            | SessionResult::Timeout
            | SessionResult::ServiceUnavailable => {
                warn!(bot = %self.name, ?result, "Transient logon failure");
                self.client.disconnect(false).await;
            }
            SessionResult::Other(code) => {
                self.stop_with_reason(&format!("unrecognized logon result {code}"))
                    .await;
            }
        }
    }

    async fn on_logon_ok(
        self: &Arc<Self>,
        account_id: AccountId,
        cell_id: u32,
        web_api_nonce: &str,
        parental_lock: bool,
    ) {
        info!(bot = %self.name, account_id, "Logged on");
        {
            let mut st = self.st();
            st.logged_on = true;
            st.account_id = account_id;
            st.two_factor_code = None;
            st.auth_code = None;
        }

        if cell_id != 0
            && let Err(e) = self.ctx.global_db.set_cell_id(cell_id)
        {
            warn!(bot = %self.name, error = %e, "Persisting cell id failed");
        }

        // Build the authenticator now that the account id is known.
        let authenticator_missing = self.lock_auth().is_none();
        if authenticator_missing
            && let Some(secrets) = self.db.authenticator()
        {
            let authenticator = Arc::new(MobileAuthenticator::new(
                secrets,
                account_id,
                Arc::clone(&self.web),
            ));
            *self.lock_auth() = Some(authenticator);
            info!(bot = %self.name, "Mobile authenticator ready");
        }

        if parental_lock && self.config.parental_pin.is_empty() {
            self.stop_with_reason("account has a parental lock but no PIN is configured")
                .await;
            return;
        }

        // Web session bootstrap: one refresh-and-retry before giving up.
        let pin = self.config.parental_pin.as_str();
        let mut web_ready = self.web.init(account_id, web_api_nonce, pin).await;
        if !web_ready {
            warn!(bot = %self.name, "Web session init failed, refreshing nonce");
            if let Some(fresh) = self.client.request_web_api_nonce().await {
                web_ready = self.web.init(account_id, &fresh, pin).await;
            }
        }
        if !web_ready {
            warn!(bot = %self.name, "Web session bootstrap failed, reconnecting");
            self.client.disconnect(false).await;
            return;
        }

        self.on_web_ready().await;
    }

    /// The session is fully usable: presence, group joins, trades, timers,
    /// and finally farming.
    async fn on_web_ready(self: &Arc<Self>) {
        if !self.config.farm_offline {
            self.client.set_presence_online(true).await;
        }
        if self.config.handle_offline_messages {
            self.client.request_offline_messages().await;
        }
        if self.config.dismiss_inventory_notifications {
            self.web.mark_inventory().await;
        }
        if self.config.master_clan_id != 0 {
            self.web.join_group(self.config.master_clan_id).await;
            self.client.join_chat(self.config.master_clan_id).await;
        }
        let stats_group = self.ctx.global_config.statistics_group_id;
        if stats_group != 0 {
            self.web.join_group(stats_group).await;
        }

        {
            let bot = Arc::clone(self);
            tokio::spawn(async move {
                let authenticator = bot.authenticator();
                bot.trading.check_trades(authenticator.as_deref()).await;
            });
        }

        self.start_timers();

        // Give a pending playing-session callback a moment, then farm.
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            sleep(PRE_FARM_GRACE).await;
            bot.farmer.start().await;
        });
    }

    async fn on_disconnected(self: &Arc<Self>, user_initiated: bool) {
        {
            let mut st = self.st();
            st.connected = false;
            st.logged_on = false;
        }
        self.farmer.on_disconnected().await;

        if user_initiated || !self.keep_running() {
            debug!(bot = %self.name, "Disconnected, staying down");
            self.notify_stopped();
            return;
        }

        // Invalid password: an expired login key is cleared and retried
        // immediately; a real password failure throttles the reconnect.
        let (delay, clear_login_key) = {
            let mut st = self.st();
            if st.invalid_password {
                st.invalid_password = false;
                if st.used_login_key {
                    st.used_login_key = false;
                    (None, true)
                } else {
                    (
                        Some(Duration::from_secs(
                            self.ctx.global_config.invalid_password_retry * 60,
                        )),
                        false,
                    )
                }
            } else {
                (st.reconnect_delay.take(), false)
            }
        };
        if clear_login_key && self.take_expired_login_key() {
            info!(bot = %self.name, "Cleared expired login key");
        }

        let bot = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                warn!(bot = %bot.name, secs = delay.as_secs(), "Reconnect throttled");
                sleep(delay).await;
            } else {
                info!(bot = %bot.name, "Reconnecting");
            }
            bot.connect_gated().await;
        });
    }

    /// Clear the remembered login key after it failed a logon.
    fn take_expired_login_key(&self) -> bool {
        match self.db.set_login_key(None) {
            Ok(()) => true,
            Err(e) => {
                warn!(bot = %self.name, error = %e, "Clearing login key failed");
                false
            }
        }
    }

    // =========================================================================
    // Session callbacks
    // =========================================================================

    async fn on_login_key(&self, key: String, unique_id: u64) {
        if let Err(e) = self.db.set_login_key(Some(key)) {
            warn!(bot = %self.name, error = %e, "Persisting login key failed");
            return;
        }
        self.client.accept_login_key(unique_id).await;
        debug!(bot = %self.name, "Login key stored");
    }

    async fn on_machine_auth(&self, chunk: MachineAuthChunk) {
        let (hash, file_size) =
            match write_sentry_chunk(&self.sentry_path, chunk.offset, &chunk.data) {
                Ok(result) => result,
                Err(e) => {
                    error!(bot = %self.name, error = %e, "Sentry write failed");
                    return;
                }
            };
        let response = MachineAuthResponse {
            job_id: chunk.job_id,
            file_name: chunk.file_name,
            bytes_written: chunk.data.len() as u32,
            file_size,
            offset: chunk.offset,
            result: SessionResult::Ok,
            last_error: 0,
            one_time_password: chunk.one_time_password,
            sentry_hash: hash,
        };
        self.client.send_machine_auth_response(response).await;
        info!(bot = %self.name, "Sentry updated");
    }

    async fn on_playing_session_state(self: &Arc<Self>, blocked: bool) {
        let was_blocked = self.farmer.playing_blocked();
        self.farmer.set_playing_blocked(blocked);
        if blocked {
            info!(bot = %self.name, "Another session is playing, farming suppressed");
        } else if was_blocked {
            info!(bot = %self.name, "Playing slot free again");
            let farmer = Arc::clone(&self.farmer);
            tokio::spawn(async move { farmer.start().await });
        }
    }

    async fn on_notifications(self: &Arc<Self>, kinds: &[NotificationKind]) {
        for kind in kinds {
            match kind {
                NotificationKind::Items => {
                    self.farmer.on_new_items_notification();
                    if self.config.dismiss_inventory_notifications {
                        self.web.mark_inventory().await;
                    }
                }
                NotificationKind::Trading => {
                    let bot = Arc::clone(self);
                    tokio::spawn(async move {
                        let authenticator = bot.authenticator();
                        bot.trading.check_trades(authenticator.as_deref()).await;
                    });
                }
                NotificationKind::Other => {}
            }
        }
    }

    async fn on_guest_passes(self: &Arc<Self>, gift_ids: Vec<u64>) {
        if !self.config.accept_gifts {
            return;
        }
        let bot = Arc::clone(self);
        tokio::spawn(async move {
            for gift_id in gift_ids {
                bot.trading.accept_gift(gift_id).await;
            }
        });
    }

    async fn on_friend_request(&self, from: AccountId) {
        let trusted = from == self.config.master_id
            || (self.config.owner_id != 0 && from == self.config.owner_id);
        if trusted {
            self.client.respond_friend_request(from, true).await;
        } else if self.config.is_bot_account {
            self.client.respond_friend_request(from, false).await;
        }
    }

    async fn on_farming_finished(self: &Arc<Self>, farmed_something: bool) {
        info!(bot = %self.name, farmed_something, "Farming cycle done");
        if farmed_something && self.config.send_on_farming_finished {
            let authenticator = self.authenticator();
            self.trading.send_loot(authenticator.as_deref()).await;
        }
        if self.config.shutdown_on_farming_finished {
            self.stop().await;
            return;
        }
        if let Some(idle) = &self.config.idle_games {
            match idle {
                IdleGames::Apps(apps) => self.client.play_games(apps, None).await,
                IdleGames::Custom(name) => self.client.play_games(&[], Some(name)).await,
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn start_timers(self: &Arc<Self>) {
        let shutdown = {
            let mut st = self.st();
            if st.timers_started {
                return;
            }
            st.timers_started = true;
            st.run_shutdown.as_ref().map(watch::Sender::subscribe)
        };
        let Some(shutdown) = shutdown else {
            return;
        };

        let confirm_minutes = self.config.accept_confirmations_period;
        if confirm_minutes > 0 {
            let bot = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let period = Duration::from_secs(confirm_minutes * 60);
                let mut timer = tokio::time::interval(period);
                timer.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            if let Some(authenticator) = bot.authenticator()
                                && let Err(e) = authenticator
                                    .accept_confirmations(&ConfirmationFilter::All)
                                    .await
                            {
                                warn!(bot = %bot.name, error = %e, "Periodic confirmation accept failed");
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }

        let trade_hours = self.config.send_trade_period;
        if trade_hours > 0 {
            let bot = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let period = Duration::from_secs(trade_hours * 3600);
                let mut timer = tokio::time::interval(period);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            let authenticator = bot.authenticator();
                            bot.trading.send_loot(authenticator.as_deref()).await;
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }
    }

    // =========================================================================
    // Operations used by command handlers
    // =========================================================================

    /// Redeem one key on this bot's account.
    pub async fn redeem_one(&self, key: &str) -> Option<RedeemResult> {
        self.client.redeem_key(key).await
    }

    pub async fn add_license(&self, app: u32) -> Option<Vec<u32>> {
        self.client.request_free_license(app).await.ok()
    }

    pub async fn owned_games(&self) -> Option<std::collections::HashMap<u32, String>> {
        self.web.owned_games().await
    }

    /// Honor a manual play request literally.
    pub async fn play_manual(&self, apps: &[u32], custom_name: Option<&str>) {
        self.farmer.switch_to_manual_mode(true).await;
        self.client.play_games(apps, custom_name).await;
    }

    pub async fn rejoin_chat(&self) {
        if self.config.master_clan_id != 0 {
            self.client.join_chat(self.config.master_clan_id).await;
        }
    }

    /// Send a (possibly long) reply, chunked to the platform's message
    /// limit with ellipses stitching the parts together.
    pub async fn send_response(&self, target: MessageTarget, text: &str) {
        let max = self.ctx.global_config.max_message_length;
        for part in chunk_message(text, max) {
            self.client.send_message(target, &part).await;
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Split a message into parts of at most `max` characters, reserving room
/// for a continuation ellipsis on both sides of interior parts.
fn chunk_message(text: &str, max: usize) -> Vec<String> {
    const ELLIPSIS: &str = "…";
    const RESERVED: usize = 6;

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max {
        return vec![text.to_string()];
    }

    let payload = max.saturating_sub(RESERVED).max(1);
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        let end = (pos + payload).min(chars.len());
        let mut part = String::new();
        if pos > 0 {
            part.push_str(ELLIPSIS);
        }
        part.extend(&chars[pos..end]);
        if end < chars.len() {
            part.push_str(ELLIPSIS);
        }
        parts.push(part);
        pos = end;
    }
    parts
}
