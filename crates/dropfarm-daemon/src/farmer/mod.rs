//! Card-drop farming scheduler.
//!
//! One [`CardsFarmer`] per bot enumerates the games that still have card
//! drops, then rotates which of them are reported as played. Accounts with
//! restricted drops go through the hours-threshold algorithm (batch games
//! below two hours, solo the rest); unrestricted accounts just farm one
//! game at a time. A round keeps re-discovering until nothing is left.

pub mod badge;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::platform::{AppId, PlatformClient, WebSession};

/// The platform caps how many games one session may play concurrently.
pub const MAX_GAMES_PLAYED_CONCURRENTLY: usize = 32;

/// Hours of playtime after which a restricted account may earn drops from
/// a game, and therefore farms it solo.
pub const HOURS_TO_UNRESTRICT: f32 = 2.0;

/// How long `stop` waits for an active round to notice the flag.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Knobs the farmer reads; assembled by the bot from its configs.
#[derive(Debug, Clone)]
pub struct FarmerConfig {
    /// Selects the hours-threshold algorithm over the simple one.
    pub restricted: bool,
    /// Sleep between drop-status checks.
    pub farming_delay: Duration,
    /// Hard ceiling on farming a single game.
    pub max_farming_time: Duration,
    /// Per-bot and operator blacklists, merged.
    pub blacklist: HashSet<AppId>,
}

/// Events the farmer reports back to its bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmerEvent {
    /// A round ran to natural completion (no games left to farm).
    FarmingFinished { farmed_something: bool },
}

/// Point-in-time view of the farmer, for status replies.
#[derive(Debug, Clone)]
pub struct FarmerSnapshot {
    pub now_farming: bool,
    pub manual_mode: bool,
    pub games_to_farm: usize,
    pub currently_farming: Vec<AppId>,
}

#[derive(Debug, Default)]
struct FarmerState {
    /// App id -> accumulated playtime hours.
    games_to_farm: HashMap<AppId, f32>,
    /// Invariant: subset of `games_to_farm` keys while a round runs.
    currently_farming: HashSet<AppId>,
    manual_mode: bool,
    keep_farming: bool,
    now_farming: bool,
    playing_blocked: bool,
}

pub struct CardsFarmer {
    bot_name: String,
    config: FarmerConfig,
    client: Arc<dyn PlatformClient>,
    web: Arc<dyn WebSession>,
    events: mpsc::Sender<FarmerEvent>,
    /// Serializes the start preamble; at most one round per bot.
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<FarmerState>,
    /// Single-slot signal that wakes the farming sleep for a re-check.
    reset_event: Notify,
    /// Wakes the farming sleep when `keep_farming` drops.
    stop_event: Notify,
    round_active: watch::Sender<bool>,
}

impl CardsFarmer {
    pub fn new(
        bot_name: impl Into<String>,
        config: FarmerConfig,
        client: Arc<dyn PlatformClient>,
        web: Arc<dyn WebSession>,
        events: mpsc::Sender<FarmerEvent>,
    ) -> Arc<Self> {
        let (round_active, _) = watch::channel(false);
        Arc::new(Self {
            bot_name: bot_name.into(),
            config,
            client,
            web,
            events,
            start_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(FarmerState::default()),
            reset_event: Notify::new(),
            stop_event: Notify::new(),
            round_active,
        })
    }

    fn st(&self) -> MutexGuard<'_, FarmerState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn keep_farming(&self) -> bool {
        self.st().keep_farming
    }

    pub fn snapshot(&self) -> FarmerSnapshot {
        let st = self.st();
        let mut currently: Vec<AppId> = st.currently_farming.iter().copied().collect();
        currently.sort_unstable();
        FarmerSnapshot {
            now_farming: st.now_farming,
            manual_mode: st.manual_mode,
            games_to_farm: st.games_to_farm.len(),
            currently_farming: currently,
        }
    }

    pub fn manual_mode(&self) -> bool {
        self.st().manual_mode
    }

    /// Someone else is (or stopped) using the account's playing slot.
    /// Set while blocked; new rounds short-circuit until cleared.
    pub fn set_playing_blocked(&self, blocked: bool) {
        self.st().playing_blocked = blocked;
    }

    pub fn playing_blocked(&self) -> bool {
        self.st().playing_blocked
    }

    /// Begin a farming round. Idempotent: a second caller finds the round
    /// already running (or farming suppressed) and returns.
    pub async fn start(self: &Arc<Self>) {
        let _preamble = self.start_lock.lock().await;
        {
            let mut st = self.st();
            if st.now_farming {
                return;
            }
            if st.manual_mode {
                debug!(bot = %self.bot_name, "Manual mode, not farming");
                return;
            }
            if st.playing_blocked {
                debug!(bot = %self.bot_name, "Playing blocked, not farming");
                return;
            }
            st.keep_farming = true;
            st.now_farming = true;
            st.games_to_farm.clear();
            st.currently_farming.clear();
        }
        let _ = self.round_active.send(true);

        let farmer = Arc::clone(self);
        tokio::spawn(async move { farmer.farm().await });
    }

    /// Stop farming. Idempotent; wakes an in-flight sleep and waits
    /// briefly for the round to observe the flag.
    pub async fn stop(&self) {
        let was_farming = {
            let mut st = self.st();
            let was = st.now_farming;
            st.keep_farming = false;
            was
        };
        if !was_farming {
            return;
        }
        self.stop_event.notify_one();

        let mut rx = self.round_active.subscribe();
        let _ = tokio::time::timeout(STOP_WAIT, rx.wait_for(|active| !active)).await;
    }

    /// New items arrived: re-evaluate drop status without waiting out the
    /// sleep period.
    pub fn on_new_items_notification(&self) {
        self.reset_event.notify_one();
    }

    /// A game was added to the account.
    ///
    /// Starts farming when idle. When a restricted round is batching games
    /// below the hours threshold, the round restarts so the new game joins
    /// the current multi-play.
    pub async fn on_new_game_added(self: &Arc<Self>) {
        let restart = {
            let st = self.st();
            if !st.now_farming {
                false
            } else if self.config.restricted
                && st.games_to_farm.values().any(|h| *h < HOURS_TO_UNRESTRICT)
            {
                true
            } else {
                return;
            }
        };
        if restart {
            self.stop().await;
        }
        self.start().await;
    }

    pub async fn on_disconnected(&self) {
        self.stop().await;
    }

    /// Enter or leave manual mode. Entering stops automatic farming;
    /// leaving starts it again.
    pub async fn switch_to_manual_mode(self: &Arc<Self>, manual: bool) {
        if self.st().manual_mode == manual {
            return;
        }
        if manual {
            self.st().manual_mode = true;
            self.stop().await;
            info!(bot = %self.bot_name, "Manual play mode on");
        } else {
            self.st().manual_mode = false;
            info!(bot = %self.bot_name, "Manual play mode off");
            self.start().await;
        }
    }

    async fn farm(self: Arc<Self>) {
        info!(bot = %self.bot_name, "Farming round starting");
        let mut farmed_something = false;

        let finished_naturally = loop {
            if !self.keep_farming() {
                break false;
            }
            let discovered = self.discover().await;
            if discovered == 0 {
                break true;
            }
            info!(bot = %self.bot_name, games = discovered, "Games with drops remaining");

            let completed = if self.config.restricted {
                self.farm_restricted().await
            } else {
                self.farm_unrestricted().await
            };
            if !completed {
                break false;
            }
            farmed_something = true;
            // Re-discover: drops may have been miscounted or games added.
        };

        {
            let mut st = self.st();
            st.games_to_farm.clear();
            st.currently_farming.clear();
            st.now_farming = false;
        }
        self.client.play_games(&[], None).await;
        let _ = self.round_active.send(false);

        if finished_naturally {
            info!(bot = %self.bot_name, farmed_something, "Farming finished");
            let _ = self
                .events
                .send(FarmerEvent::FarmingFinished { farmed_something })
                .await;
        } else {
            info!(bot = %self.bot_name, "Farming stopped");
        }
    }

    /// Fill `games_to_farm` from the badge pages. Returns how many games
    /// still have drops to earn.
    async fn discover(&self) -> usize {
        let Some(first) = self.web.badge_page(1).await else {
            warn!(bot = %self.bot_name, "Badge page unavailable");
            return 0;
        };

        let pages = badge::parse_page_count(&first);
        let mut entries = badge::parse_badge_entries(&first);

        if pages > 1 {
            let mut handles = Vec::with_capacity(pages as usize - 1);
            for page in 2..=pages {
                let web = Arc::clone(&self.web);
                handles.push(tokio::spawn(async move { web.badge_page(page).await }));
            }
            for handle in handles {
                if let Ok(Some(html)) = handle.await {
                    entries.extend(badge::parse_badge_entries(&html));
                }
            }
        }

        let mut st = self.st();
        st.games_to_farm.clear();
        for entry in entries {
            if self.config.blacklist.contains(&entry.app_id) {
                debug!(bot = %self.bot_name, app = entry.app_id, "Blacklisted, skipping");
                continue;
            }
            st.games_to_farm.insert(entry.app_id, entry.hours);
        }
        st.games_to_farm.len()
    }

    /// Simple algorithm: farm any game solo until its drops run out,
    /// remove it, repeat.
    async fn farm_unrestricted(&self) -> bool {
        loop {
            let next = {
                let st = self.st();
                st.games_to_farm.keys().min().copied()
            };
            let Some(app) = next else {
                return true;
            };
            if !self.farm_solo(app).await {
                return false;
            }
        }
    }

    /// Hours-threshold algorithm: solo everything at or above the
    /// threshold, otherwise batch the rest until one member crosses it.
    async fn farm_restricted(&self) -> bool {
        loop {
            let (solo, multi) = {
                let st = self.st();
                let mut solo: Vec<AppId> = Vec::new();
                let mut multi: Vec<AppId> = Vec::new();
                for (&app, &hours) in &st.games_to_farm {
                    if hours >= HOURS_TO_UNRESTRICT {
                        solo.push(app);
                    } else {
                        multi.push(app);
                    }
                }
                solo.sort_unstable();
                multi.sort_unstable();
                (solo, multi)
            };

            if solo.is_empty() && multi.is_empty() {
                return true;
            }

            if solo.is_empty() {
                let batch: Vec<AppId> = multi
                    .into_iter()
                    .take(MAX_GAMES_PLAYED_CONCURRENTLY)
                    .collect();
                if !self.farm_batch(&batch).await {
                    return false;
                }
            } else {
                for app in solo {
                    if !self.farm_solo(app).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Farm one game until its drops run out, the deadline passes, or the
    /// round is stopped. Returns whether the round may continue.
    async fn farm_solo(&self, app: AppId) -> bool {
        {
            let mut st = self.st();
            st.currently_farming.clear();
            st.currently_farming.insert(app);
        }
        info!(bot = %self.bot_name, app, "Farming solo");
        self.client.play_games(&[app], None).await;

        let deadline = Instant::now() + self.config.max_farming_time;
        loop {
            if !self.keep_farming() {
                break;
            }
            match self.cards_remaining(app).await {
                Some(0) => {
                    info!(bot = %self.bot_name, app, "All drops earned");
                    self.complete_game(app);
                    break;
                }
                Some(remaining) => {
                    debug!(bot = %self.bot_name, app, remaining, "Drops remaining");
                }
                None => {
                    debug!(bot = %self.bot_name, app, "Card page unreadable, will retry");
                }
            }
            if Instant::now() >= deadline {
                warn!(bot = %self.bot_name, app, "Farming deadline reached, moving on");
                self.complete_game(app);
                break;
            }
            let elapsed = self.farm_sleep().await;
            self.add_hours(&[app], elapsed);
        }

        self.st().currently_farming.clear();
        self.keep_farming()
    }

    /// Farm a batch of games simultaneously until the highest playtime in
    /// it reaches the threshold. Returns whether the round may continue.
    async fn farm_batch(&self, apps: &[AppId]) -> bool {
        {
            let mut st = self.st();
            st.currently_farming.clear();
            st.currently_farming.extend(apps.iter().copied());
        }
        info!(bot = %self.bot_name, games = apps.len(), "Farming batch");
        self.client.play_games(apps, None).await;

        loop {
            if !self.keep_farming() {
                break;
            }
            let max_hours = {
                let st = self.st();
                apps.iter()
                    .filter_map(|a| st.games_to_farm.get(a))
                    .fold(0.0f32, |acc, h| acc.max(*h))
            };
            if max_hours >= HOURS_TO_UNRESTRICT {
                break;
            }
            let elapsed = self.farm_sleep().await;
            self.add_hours(apps, elapsed);
        }

        self.st().currently_farming.clear();
        self.keep_farming()
    }

    /// Sleep one farming period, waking early on the reset event or stop.
    /// Returns the real time spent asleep.
    pub(crate) async fn farm_sleep(&self) -> Duration {
        let started = Instant::now();
        tokio::select! {
            () = sleep(self.config.farming_delay) => {}
            () = self.reset_event.notified() => {
                debug!(bot = %self.bot_name, "Drop status re-check requested");
            }
            () = self.stop_event.notified() => {}
        }
        started.elapsed()
    }

    async fn cards_remaining(&self, app: AppId) -> Option<u32> {
        let html = self.web.game_cards_page(app).await?;
        badge::parse_cards_remaining(&html)
    }

    /// Drop a finished game from the round, keeping `currently_farming`
    /// consistent with it.
    fn complete_game(&self, app: AppId) {
        let mut st = self.st();
        st.games_to_farm.remove(&app);
        st.currently_farming.remove(&app);
    }

    fn add_hours(&self, apps: &[AppId], elapsed: Duration) {
        let hours = elapsed.as_secs_f32() / 3600.0;
        let mut st = self.st();
        for app in apps {
            if let Some(h) = st.games_to_farm.get_mut(app) {
                *h += hours;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::platform::sim::{SimPlatform, SimWebSession};

    fn badge_row(app_id: AppId, drops: u32, hours: f32) -> String {
        format!(
            r#"<div class="badge_row">
                 <a href="/gamecards/{app_id}/"></a>
                 <div>{hours:.1} hrs on record</div>
                 <span class="progress_info_bold">{drops} card drops remaining</span>
               </div>"#
        )
    }

    const EMPTY_BADGE_PAGE: &str = "<html><body>all done</body></html>";
    const DONE_GAME_PAGE: &str =
        r#"<span class="progress_info_bold">No card drops remaining</span>"#;

    fn drops_page(n: u32) -> String {
        format!(r#"<span class="progress_info_bold">{n} card drops remaining</span>"#)
    }

    struct Harness {
        farmer: Arc<CardsFarmer>,
        platform: Arc<SimPlatform>,
        web: Arc<SimWebSession>,
        events: mpsc::Receiver<FarmerEvent>,
    }

    fn harness(restricted: bool, blacklist: HashSet<AppId>) -> Harness {
        let (platform, _callbacks) = SimPlatform::new();
        let web = SimWebSession::new();
        let (tx, events) = mpsc::channel(8);
        let farmer = CardsFarmer::new(
            "main",
            FarmerConfig {
                restricted,
                farming_delay: Duration::from_secs(30 * 60),
                max_farming_time: Duration::from_secs(10 * 3600),
                blacklist,
            },
            Arc::clone(&platform) as Arc<dyn PlatformClient>,
            Arc::clone(&web) as Arc<dyn WebSession>,
            tx,
        );
        Harness {
            farmer,
            platform,
            web,
            events,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    // =========================================================================
    // Simple algorithm
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn simple_algorithm_farms_single_game_to_completion() {
        let mut h = harness(false, HashSet::new());
        h.web.push_badge_page(1, badge_row(440, 2, 3.2));
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);
        h.web.push_game_page(440, drops_page(2));
        h.web.push_game_page(440, drops_page(1));
        h.web.push_game_page(440, DONE_GAME_PAGE);

        h.farmer.start().await;
        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            FarmerEvent::FarmingFinished {
                farmed_something: true
            }
        );

        h.platform.with_log(|log| {
            assert!(log.played.contains(&vec![440]));
            // Final play_games([]) clears the playing state.
            assert_eq!(log.played.last().unwrap(), &Vec::<AppId>::new());
        });
        let snap = h.farmer.snapshot();
        assert!(!snap.now_farming);
        assert_eq!(snap.games_to_farm, 0);
        assert!(snap.currently_farming.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_to_farm_reports_finished_without_success() {
        let mut h = harness(false, HashSet::new());
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);

        h.farmer.start().await;
        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            FarmerEvent::FarmingFinished {
                farmed_something: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blacklisted_games_are_never_farmed() {
        let mut h = harness(false, [730].into());
        h.web
            .push_badge_page(1, format!("{}{}", badge_row(440, 1, 0.0), badge_row(730, 5, 0.0)));
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);
        h.web.push_game_page(440, DONE_GAME_PAGE);

        h.farmer.start().await;
        h.events.recv().await.unwrap();

        h.platform.with_log(|log| {
            assert!(log.played.contains(&vec![440]));
            assert!(!log.played.iter().any(|set| set.contains(&730)));
        });
    }

    // =========================================================================
    // Hours-threshold algorithm
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn restricted_solos_threshold_games_then_batches_the_rest() {
        let mut h = harness(true, HashSet::new());
        let rows = format!(
            "{}{}{}{}",
            badge_row(10, 1, 2.5),
            badge_row(20, 1, 0.5),
            badge_row(30, 1, 0.8),
            badge_row(40, 1, 1.0),
        );
        h.web.push_badge_page(1, rows);
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);
        for app in [10, 20, 30, 40] {
            h.web.push_game_page(app, DONE_GAME_PAGE);
        }

        h.farmer.start().await;
        h.events.recv().await.unwrap();

        h.platform.with_log(|log| {
            // Solo phase first: the only game at or above the threshold.
            assert_eq!(log.played[0], vec![10]);
            // Then the remaining games batched together.
            assert_eq!(log.played[1], vec![20, 30, 40]);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn batch_caps_at_concurrent_play_limit() {
        let h = harness(true, HashSet::new());
        let rows: String = (1..=40).map(|app| badge_row(app, 1, 0.0)).collect();
        h.web.push_badge_page(1, rows);

        h.farmer.start().await;
        wait_until(|| h.platform.with_log(|log| !log.played.is_empty())).await;

        h.platform
            .with_log(|log| assert_eq!(log.played[0].len(), MAX_GAMES_PLAYED_CONCURRENTLY));

        h.farmer.stop().await;
        let snap = h.farmer.snapshot();
        assert!(!snap.now_farming);
        assert!(snap.currently_farming.is_empty());
    }

    // =========================================================================
    // Start/stop semantics
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_running() {
        let h = harness(false, HashSet::new());
        h.web.push_badge_page(1, badge_row(440, 3, 0.0));
        h.web.push_game_page(440, drops_page(3));

        h.farmer.start().await;
        wait_until(|| h.platform.with_log(|log| !log.played.is_empty())).await;
        let plays_after_first = h.platform.with_log(|log| log.played.len());

        h.farmer.start().await;
        h.farmer.start().await;
        assert_eq!(h.platform.with_log(|log| log.played.len()), plays_after_first);

        h.farmer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_restart_rediscovers() {
        let h = harness(false, HashSet::new());
        h.web.push_badge_page(1, badge_row(440, 3, 0.0));
        h.web.push_game_page(440, drops_page(3));

        h.farmer.start().await;
        wait_until(|| h.platform.with_log(|log| !log.played.is_empty())).await;
        let fetches_before = h.web.with_log(|log| log.badge_fetches);

        h.farmer.stop().await;
        h.farmer.stop().await;
        assert!(!h.farmer.snapshot().now_farming);

        h.farmer.start().await;
        wait_until(|| h.web.with_log(|log| log.badge_fetches > fetches_before)).await;
        h.farmer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_is_a_noop() {
        let h = harness(false, HashSet::new());
        h.farmer.stop().await;
        assert!(!h.farmer.snapshot().now_farming);
    }

    #[tokio::test(start_paused = true)]
    async fn playing_blocked_short_circuits_start() {
        let h = harness(false, HashSet::new());
        h.web.push_badge_page(1, badge_row(440, 3, 0.0));

        h.farmer.set_playing_blocked(true);
        h.farmer.start().await;
        sleep(Duration::from_secs(1)).await;
        assert!(!h.farmer.snapshot().now_farming);
        h.platform.with_log(|log| assert!(log.played.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_round_trip_triggers_one_start() {
        let mut h = harness(false, HashSet::new());
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);

        h.farmer.switch_to_manual_mode(true).await;
        assert!(h.farmer.manual_mode());

        // No farming while manual.
        h.farmer.start().await;
        assert!(!h.farmer.snapshot().now_farming);

        h.farmer.switch_to_manual_mode(false).await;
        assert!(!h.farmer.manual_mode());
        // Leaving manual mode started exactly one round.
        let event = h.events.recv().await.unwrap();
        assert_eq!(
            event,
            FarmerEvent::FarmingFinished {
                farmed_something: false
            }
        );
        assert!(h.events.try_recv().is_err());
    }

    // =========================================================================
    // Sleep / reset event
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn reset_event_wakes_the_sleep_early() {
        let h = harness(false, HashSet::new());
        let farmer = Arc::clone(&h.farmer);
        let sleeper = tokio::spawn(async move { farmer.farm_sleep().await });

        // Let the sleeper register its timer, then advance four minutes.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(240)).await;
        h.farmer.on_new_items_notification();

        let elapsed = sleeper.await.unwrap();
        assert_eq!(elapsed.as_secs(), 240);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_the_full_delay_without_signals() {
        let h = harness(false, HashSet::new());
        let elapsed = h.farmer.farm_sleep().await;
        assert_eq!(elapsed.as_secs(), 30 * 60);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_sleep_time_accrues_to_hours() {
        let mut h = harness(false, HashSet::new());
        // One full sleep (30 min) between the first and second poll.
        h.web.push_badge_page(1, badge_row(7, 1, 1.0));
        h.web.push_badge_page(1, EMPTY_BADGE_PAGE);
        h.web.push_game_page(7, drops_page(1));
        h.web.push_game_page(7, DONE_GAME_PAGE);

        h.farmer.start().await;
        h.events.recv().await.unwrap();
        // 1.0h on record + 0.5h slept; the game completed and was removed,
        // so the observable effect is just a clean finish.
        assert_eq!(h.farmer.snapshot().games_to_farm, 0);
    }
}
