//! Configuration loading for dropfarm.
//!
//! Each managed account has one JSON file (`<name>.json`) in the config
//! directory; process-wide settings live in `global.json` next to them.
//! Bot names must be filesystem-safe because they key both the config and
//! the persisted database files. Environment variables (`DROPFARM_*`)
//! override the global knobs.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Reserved file stem for the global configuration.
const GLOBAL_STEM: &str = "global";

/// What a bot reports as "playing" while it is not farming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdleGames {
    /// Game ids to idle in.
    Apps(Vec<u32>),
    /// A free-form custom game name.
    Custom(String),
}

/// Per-account configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotConfig {
    /// Disabled bots are not instantiated at all.
    pub enabled: bool,
    /// Whether the bot starts together with the daemon.
    pub start_on_launch: bool,
    /// Account login name.
    pub login: String,
    /// Account password. May be empty when a remembered login key exists.
    pub password: String,
    /// Parental PIN, required to bootstrap the web session when the
    /// account has one set.
    pub parental_pin: String,
    /// Account id authorized to command this bot and receive loot.
    pub master_id: u64,
    /// Group to join (with its chat) after logging in. 0 = none.
    pub master_clan_id: u64,
    /// Super-user authorized across all bots. 0 = none.
    pub owner_id: u64,
    /// Friend requests from anyone but the masters are declined.
    pub is_bot_account: bool,
    /// Suppress online presence after login.
    pub farm_offline: bool,
    /// Account is still drop-restricted: use the hours-threshold algorithm.
    pub card_drops_restricted: bool,
    /// Request the offline-message flush on login.
    pub handle_offline_messages: bool,
    /// Auto-accept incoming guest passes.
    pub accept_gifts: bool,
    /// Retry keys that fail with region-lock-like results on sibling bots.
    pub forward_keys_to_other_bots: bool,
    /// Round-robin each key across bots instead of sticking to one.
    pub distribute_keys: bool,
    /// Mark inventory viewed after items arrive.
    pub dismiss_inventory_notifications: bool,
    /// Minutes between automatic accept-all-confirmations runs. 0 = off.
    pub accept_confirmations_period: u64,
    /// Hours between automatic loot-to-master runs. 0 = off.
    pub send_trade_period: u64,
    /// Loot to master once a farm cycle completes.
    pub send_on_farming_finished: bool,
    /// Stop the bot once a farm cycle completes.
    pub shutdown_on_farming_finished: bool,
    /// Games (or a custom name) reported as played while idle.
    pub idle_games: Option<IdleGames>,
    /// Trade token presented when the master is not on the friends list.
    pub trade_token: Option<String>,
    /// Games this bot must never farm.
    pub blacklist: HashSet<u32>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_on_launch: true,
            login: String::new(),
            password: String::new(),
            parental_pin: String::new(),
            master_id: 0,
            master_clan_id: 0,
            owner_id: 0,
            is_bot_account: true,
            farm_offline: false,
            card_drops_restricted: false,
            handle_offline_messages: false,
            accept_gifts: false,
            forward_keys_to_other_bots: false,
            distribute_keys: false,
            dismiss_inventory_notifications: false,
            accept_confirmations_period: 0,
            send_trade_period: 0,
            send_on_farming_finished: false,
            shutdown_on_farming_finished: false,
            idle_games: None,
            trade_token: None,
            blacklist: HashSet::new(),
        }
    }
}

impl BotConfig {
    /// Validate fields that would make the bot unusable at runtime.
    pub fn validate(&self, name: &str) -> Result<()> {
        if !is_valid_bot_name(name) {
            return Err(CoreError::Config(format!(
                "Bot name '{name}' is not filesystem-safe"
            )));
        }
        if self.enabled && self.login.is_empty() {
            return Err(CoreError::Config(format!(
                "Bot '{name}' is enabled but has no login configured"
            )));
        }
        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Minutes a farming round sleeps between drop-status checks.
    pub farming_delay: u64,
    /// Hard ceiling, in hours, on farming a single game.
    pub max_farming_time: u64,
    /// Seconds the login gate stays closed after each login attempt.
    pub login_limiter_delay: u64,
    /// Seconds the gift-accept gate stays closed after each accept.
    pub gifts_limiter_delay: u64,
    /// Minutes to wait before reconnecting after an invalid-password result.
    pub invalid_password_retry: u64,
    /// Minutes to wait before reconnecting when another session holds the
    /// playing slot. 0 stops the bot instead.
    pub logged_elsewhere_retry: u64,
    /// HTTP connection timeout in seconds.
    pub connection_timeout: u64,
    /// Games no bot may ever farm, maintained by the operator.
    pub blacklist: HashSet<u32>,
    /// Group joined after login when participation is enabled. 0 = none.
    pub statistics_group_id: u64,
    /// Maximum chat message length the platform accepts.
    pub max_message_length: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            farming_delay: 15,
            max_farming_time: 10,
            login_limiter_delay: 7,
            gifts_limiter_delay: 5,
            invalid_password_retry: 25,
            logged_elsewhere_retry: 5,
            connection_timeout: 60,
            blacklist: HashSet::new(),
            statistics_group_id: 0,
            max_message_length: 2048,
        }
    }
}

/// Load the global configuration from `<dir>/global.json`, falling back to
/// defaults when the file does not exist, then apply `DROPFARM_*`
/// environment overrides.
pub fn load_global_config(dir: &Path) -> Result<GlobalConfig> {
    let path = dir.join(format!("{GLOBAL_STEM}.json"));
    let mut config = if path.exists() {
        load_json_file(&path)?
    } else {
        GlobalConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Enumerate bot configurations in a directory.
///
/// Every `*.json` file except `global.json` is treated as one bot, keyed by
/// its file stem. Files that fail to parse or validate are returned as
/// errors together with the ones that loaded, so a single bad file does not
/// take the whole fleet down.
pub fn load_bot_configs(dir: &Path) -> Result<(Vec<(String, BotConfig)>, Vec<CoreError>)> {
    let mut configs = Vec::new();
    let mut errors = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(|e| {
        CoreError::Config(format!("Cannot read config directory {}: {e}", dir.display()))
    })?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == GLOBAL_STEM {
            continue;
        }

        match load_json_file::<BotConfig>(&path) {
            Ok(config) => match config.validate(stem) {
                Ok(()) => configs.push((stem.to_string(), config)),
                Err(e) => errors.push(e),
            },
            Err(e) => errors.push(e),
        }
    }

    configs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((configs, errors))
}

/// Bot names key files on disk, so they must stay inside one path segment.
pub fn is_valid_bot_name(name: &str) -> bool {
    !name.is_empty()
        && name != GLOBAL_STEM
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        CoreError::Config(format!("Failed to parse config file {}: {e}", path.display()))
    })
}

fn apply_env_overrides(config: &mut GlobalConfig) {
    if let Ok(val) = std::env::var("DROPFARM_FARMING_DELAY")
        && let Ok(n) = val.parse()
    {
        config.farming_delay = n;
    }
    if let Ok(val) = std::env::var("DROPFARM_MAX_FARMING_TIME")
        && let Ok(n) = val.parse()
    {
        config.max_farming_time = n;
    }
    if let Ok(val) = std::env::var("DROPFARM_LOGIN_LIMITER_DELAY")
        && let Ok(n) = val.parse()
    {
        config.login_limiter_delay = n;
    }
    if let Ok(val) = std::env::var("DROPFARM_CONNECTION_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.connection_timeout = n;
    }
}
