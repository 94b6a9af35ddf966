//! Fleet supervision.
//!
//! The supervisor owns the map of all bots, brings the fleet up from the
//! configuration directory and signals process exit once every bot has
//! stopped. Only the supervisor mutates the map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{error, info, warn};

use dropfarm_core::config::{self, BotConfig};
use dropfarm_core::database::{BotDatabase, GlobalDatabase};

use crate::bot::{Bot, BotContext};
use crate::platform::{Callback, PlatformClient, WebSession};

/// Builds the platform boundary for one account.
///
/// The wire transport is an external collaborator; the daemon links
/// whatever implements the two traits (the bundled simulator in offline
/// runs and tests).
pub trait PlatformFactory: Send + Sync {
    fn build(
        &self,
        bot_name: &str,
    ) -> (
        Arc<dyn PlatformClient>,
        mpsc::Receiver<Callback>,
        Arc<dyn WebSession>,
    );
}

pub struct Supervisor {
    ctx: Arc<BotContext>,
    bots: RwLock<HashMap<String, Arc<Bot>>>,
    exit: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(ctx: Arc<BotContext>) -> Arc<Self> {
        let (exit, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            bots: RwLock::new(HashMap::new()),
            exit,
        })
    }

    pub fn context(&self) -> &Arc<BotContext> {
        &self.ctx
    }

    /// Resolves once every bot reports `keep_running = false`.
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }

    /// Instantiate one bot and take ownership of it.
    ///
    /// A bot makes it into the map only when it is enabled and its
    /// database loads; anything else is reported and skipped.
    pub async fn add_bot(
        self: &Arc<Self>,
        name: &str,
        config: BotConfig,
        data_dir: &Path,
        factory: &dyn PlatformFactory,
    ) -> Option<Arc<Bot>> {
        if !config.enabled {
            info!(bot = name, "Disabled, not instantiating");
            return None;
        }
        let db = match BotDatabase::load(data_dir.join(format!("{name}.db.json"))) {
            Ok(db) => db,
            Err(e) => {
                error!(bot = name, error = %e, "Bot database failed to load, skipping bot");
                return None;
            }
        };

        let (client, callbacks, web) = factory.build(name);
        let bot = Bot::new(
            name,
            config,
            db,
            data_dir.join(format!("{name}.sentry.bin")),
            Arc::clone(&self.ctx),
            client,
            callbacks,
            web,
        );
        bot.set_fleet(self);
        self.bots
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&bot));
        Some(bot)
    }

    /// Bring the whole fleet up from a configuration directory.
    pub async fn start_all(
        self: &Arc<Self>,
        config_dir: &Path,
        data_dir: &Path,
        factory: &dyn PlatformFactory,
    ) -> dropfarm_core::Result<()> {
        let (configs, errors) = config::load_bot_configs(config_dir)?;
        for e in &errors {
            warn!(error = %e, "Skipping invalid bot configuration");
        }

        for (name, bot_config) in configs {
            let start = bot_config.start_on_launch;
            if let Some(bot) = self.add_bot(&name, bot_config, data_dir, factory).await
                && start
            {
                bot.start().await;
            }
        }

        let count = self.bots.read().await.len();
        info!(bots = count, "Fleet up");
        Ok(())
    }

    pub async fn bot(&self, name: &str) -> Option<Arc<Bot>> {
        self.bots.read().await.get(name).cloned()
    }

    /// All bots, sorted by name.
    pub async fn all_bots(&self) -> Vec<Arc<Bot>> {
        let bots = self.bots.read().await;
        let mut all: Vec<Arc<Bot>> = bots.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Bots with a live platform connection, sorted by name.
    pub async fn connected_bots(&self) -> Vec<Arc<Bot>> {
        self.all_bots()
            .await
            .into_iter()
            .filter(|b| b.connected())
            .collect()
    }

    /// Stop every bot; the exit signal fires once they all report down.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Fleet shutdown requested");
        for bot in self.all_bots().await {
            bot.stop().await;
        }
        self.check_exit().await;
    }

    /// Called by bots when they stop; fires the exit signal when no bot
    /// is running anymore.
    pub(crate) fn on_bot_stopped(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.check_exit().await });
    }

    async fn check_exit(&self) {
        let bots = self.bots.read().await;
        if bots.values().all(|b| !b.keep_running()) {
            info!("No bot is running, signalling exit");
            let _ = self.exit.send(true);
        }
    }
}

/// Default data directory next to the config directory.
pub fn default_data_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("data")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use dropfarm_core::config::GlobalConfig;
    use crate::platform::sim::{SimPlatform, SimWebSession};

    struct SimFactory;

    impl PlatformFactory for SimFactory {
        fn build(
            &self,
            _bot_name: &str,
        ) -> (
            Arc<dyn PlatformClient>,
            mpsc::Receiver<Callback>,
            Arc<dyn WebSession>,
        ) {
            let (platform, callbacks) = SimPlatform::new();
            (platform, callbacks, SimWebSession::new())
        }
    }

    fn ctx(dir: &Path) -> Arc<BotContext> {
        let global_db = Arc::new(GlobalDatabase::load(dir.join("global.db.json")).unwrap());
        BotContext::new(GlobalConfig::default(), global_db)
    }

    #[tokio::test]
    async fn disabled_bots_are_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(ctx(dir.path()));

        let registered = supervisor
            .add_bot("off", BotConfig::default(), dir.path(), &SimFactory)
            .await;
        assert!(registered.is_none());
        assert!(supervisor.bot("off").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_database_prevents_registration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.db.json"), "{nope").unwrap();
        let supervisor = Supervisor::new(ctx(dir.path()));

        let config = BotConfig {
            enabled: true,
            login: "bad".into(),
            ..Default::default()
        };
        let registered = supervisor.add_bot("bad", config, dir.path(), &SimFactory).await;
        assert!(registered.is_none());
    }

    #[tokio::test]
    async fn start_all_honors_start_on_launch() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(
            config_dir.join("auto.json"),
            r#"{"enabled": true, "login": "auto"}"#,
        )
        .unwrap();
        std::fs::write(
            config_dir.join("lazy.json"),
            r#"{"enabled": true, "login": "lazy", "startOnLaunch": false}"#,
        )
        .unwrap();

        let supervisor = Supervisor::new(ctx(dir.path()));
        supervisor
            .start_all(&config_dir, &data_dir, &SimFactory)
            .await
            .unwrap();

        let auto = supervisor.bot("auto").await.unwrap();
        let lazy = supervisor.bot("lazy").await.unwrap();
        assert!(auto.keep_running());
        assert!(!lazy.keep_running());
    }

    #[tokio::test]
    async fn exit_fires_once_all_bots_stop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(ctx(dir.path()));
        let config = BotConfig {
            enabled: true,
            login: "one".into(),
            ..Default::default()
        };
        let bot = supervisor
            .add_bot("one", config, dir.path(), &SimFactory)
            .await
            .unwrap();
        bot.start().await;

        let mut exit = supervisor.subscribe_exit();
        assert!(!*exit.borrow());

        supervisor.shutdown().await;
        exit.wait_for(|fired| *fired).await.unwrap();
    }
}
