#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the bot connection state machine.
//!
//! Drives a full bot against the simulated platform: login flow, login-key
//! persistence, sentry updates and the invalid-password throttle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use dropfarm_core::config::{BotConfig, GlobalConfig};
use dropfarm_core::database::{BotDatabase, GlobalDatabase};

use dropfarm_daemon::bot::{Bot, BotContext};
use dropfarm_daemon::platform::sim::{SimPlatform, SimWebSession};
use dropfarm_daemon::platform::{
    Callback, MachineAuthChunk, PlatformClient, SessionResult, WebSession,
};

const MASTER: u64 = 76_561_198_000_000_001;
const ACCOUNT: u64 = 76_561_198_000_000_100;

struct Rig {
    bot: Arc<Bot>,
    platform: Arc<SimPlatform>,
    web: Arc<SimWebSession>,
    dir: tempfile::TempDir,
}

fn rig_with(
    global_patch: impl FnOnce(&mut GlobalConfig),
    config_patch: impl FnOnce(&mut BotConfig),
) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut global = GlobalConfig::default();
    global_patch(&mut global);
    let global_db = Arc::new(GlobalDatabase::load(dir.path().join("global.db.json")).unwrap());
    let ctx = BotContext::new(global, global_db);

    let mut config = BotConfig {
        enabled: true,
        login: "main".into(),
        password: "hunter2".into(),
        master_id: MASTER,
        ..Default::default()
    };
    config_patch(&mut config);

    let (platform, callbacks) = SimPlatform::new();
    let web = SimWebSession::new();
    let db = BotDatabase::load(dir.path().join("main.db.json")).unwrap();
    let bot = Bot::new(
        "main",
        config,
        db,
        dir.path().join("main.sentry.bin"),
        ctx,
        Arc::clone(&platform) as Arc<dyn PlatformClient>,
        callbacks,
        Arc::clone(&web) as Arc<dyn WebSession>,
    );
    Rig {
        bot,
        platform,
        web,
        dir,
    }
}

fn rig() -> Rig {
    rig_with(|_| {}, |_| {})
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn logged_on_ok() -> Callback {
    Callback::LoggedOn {
        result: SessionResult::Ok,
        account_id: ACCOUNT,
        cell_id: 92,
        web_api_nonce: "nonce-1".into(),
        parental_lock: false,
    }
}

// =========================================================================
// Happy-path login
// =========================================================================

#[tokio::test(start_paused = true)]
async fn start_connects_and_logs_on_with_password() {
    let r = rig();
    r.bot.start().await;
    wait_until(|| r.platform.with_log(|log| log.connects == 1)).await;

    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;

    r.platform.with_log(|log| {
        let details = &log.logons[0];
        assert_eq!(details.login, "main");
        assert_eq!(details.password.as_deref(), Some("hunter2"));
        assert_eq!(details.login_key, None);
        assert!(details.should_remember_password);
        assert_eq!(details.sentry_hash, None);
    });
}

#[tokio::test(start_paused = true)]
async fn successful_logon_bootstraps_web_session_and_persists_cell_id() {
    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;

    r.platform.push_callback(logged_on_ok()).await;
    wait_until(|| r.web.with_log(|log| !log.inits.is_empty())).await;

    r.web.with_log(|log| {
        assert_eq!(log.inits[0], (ACCOUNT, "nonce-1".to_string(), String::new()));
    });
    // Presence announced (farm_offline defaults to false).
    wait_until(|| r.platform.with_log(|log| log.presence == vec![true])).await;

    // Cell id persisted for the next process start.
    let reloaded = GlobalDatabase::load(r.dir.path().join("global.db.json")).unwrap();
    assert_eq!(reloaded.cell_id(), 92);
}

#[tokio::test(start_paused = true)]
async fn failed_web_init_refreshes_nonce_once() {
    let r = rig();
    r.web.script_init(false);
    r.web.script_init(true);
    r.platform.script_nonce(Some("nonce-2".into()));

    r.bot.start().await;
    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;
    r.platform.push_callback(logged_on_ok()).await;

    wait_until(|| r.web.with_log(|log| log.inits.len() == 2)).await;
    r.web.with_log(|log| {
        assert_eq!(log.inits[0].1, "nonce-1");
        assert_eq!(log.inits[1].1, "nonce-2");
    });
}

// =========================================================================
// Login key handling
// =========================================================================

#[tokio::test(start_paused = true)]
async fn login_key_is_persisted_and_acknowledged() {
    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::LoginKey {
            key: "remembered-key".into(),
            unique_id: 777,
        })
        .await;

    wait_until(|| r.platform.with_log(|log| log.accepted_login_keys == vec![777])).await;

    let db = BotDatabase::load(r.dir.path().join("main.db.json")).unwrap();
    assert_eq!(db.login_key(), Some("remembered-key".to_string()));
}

#[tokio::test(start_paused = true)]
async fn remembered_key_replaces_password_on_next_logon() {
    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::LoginKey {
            key: "remembered-key".into(),
            unique_id: 777,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.accepted_login_keys.is_empty())).await;

    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;

    r.platform.with_log(|log| {
        let details = &log.logons[0];
        assert_eq!(details.login_key.as_deref(), Some("remembered-key"));
        assert_eq!(details.password, None);
    });
}

// =========================================================================
// Invalid password
// =========================================================================

#[tokio::test(start_paused = true)]
async fn invalid_password_throttles_reconnect() {
    let r = rig();
    let started = tokio::time::Instant::now();

    r.bot.start().await;
    wait_until(|| r.platform.with_log(|log| log.connects == 1)).await;
    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;

    r.platform
        .push_callback(Callback::LoggedOn {
            result: SessionResult::InvalidPassword,
            account_id: 0,
            cell_id: 0,
            web_api_nonce: String::new(),
            parental_lock: false,
        })
        .await;

    // The reconnect happens, but only after the throttling window.
    wait_until(|| r.platform.with_log(|log| log.connects == 2)).await;
    assert!(started.elapsed() >= Duration::from_secs(25 * 60));
    assert!(r.bot.keep_running());
}

#[tokio::test(start_paused = true)]
async fn invalid_password_with_login_key_clears_it_and_retries_promptly() {
    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::LoginKey {
            key: "expired-key".into(),
            unique_id: 1,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.accepted_login_keys.is_empty())).await;

    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;

    let before_retry = tokio::time::Instant::now();
    r.platform
        .push_callback(Callback::LoggedOn {
            result: SessionResult::InvalidPassword,
            account_id: 0,
            cell_id: 0,
            web_api_nonce: String::new(),
            parental_lock: false,
        })
        .await;

    wait_until(|| r.platform.with_log(|log| log.connects == 2)).await;
    // No 25-minute window on the key path.
    assert!(before_retry.elapsed() < Duration::from_secs(5 * 60));

    let db = BotDatabase::load(r.dir.path().join("main.db.json")).unwrap();
    assert_eq!(db.login_key(), None);
}

// =========================================================================
// Sentry machine auth
// =========================================================================

#[tokio::test(start_paused = true)]
async fn machine_auth_writes_sentry_and_replies_with_full_file_hash() {
    use sha1::{Digest, Sha1};

    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::MachineAuth(MachineAuthChunk {
            job_id: 42,
            file_name: "sentry.bin".into(),
            offset: 0,
            data: b"attestation-bytes".to_vec(),
            one_time_password: 9,
        }))
        .await;

    wait_until(|| r.platform.with_log(|log| !log.machine_auth_responses.is_empty())).await;

    r.platform.with_log(|log| {
        let response = &log.machine_auth_responses[0];
        assert_eq!(response.job_id, 42);
        assert_eq!(response.bytes_written, 17);
        assert_eq!(response.file_size, 17);
        assert_eq!(response.offset, 0);
        assert_eq!(response.result, SessionResult::Ok);
        assert_eq!(response.one_time_password, 9);
        assert_eq!(
            response.sentry_hash,
            Sha1::digest(b"attestation-bytes").to_vec()
        );
    });

    // The next logon presents the sentry hash.
    r.platform
        .push_callback(Callback::Connected {
            result: SessionResult::Ok,
        })
        .await;
    wait_until(|| r.platform.with_log(|log| !log.logons.is_empty())).await;
    r.platform.with_log(|log| {
        assert!(log.logons[0].sentry_hash.is_some());
    });
}

// =========================================================================
// Playing-session state
// =========================================================================

#[tokio::test(start_paused = true)]
async fn playing_blocked_suppresses_farming_until_cleared() {
    let r = rig();
    r.bot.start().await;
    r.platform
        .push_callback(Callback::PlayingSessionState { blocked: true })
        .await;
    wait_until(|| r.bot.farmer().playing_blocked()).await;

    // Farming attempts short-circuit while blocked.
    r.bot.farmer().start().await;
    assert!(!r.bot.farmer().snapshot().now_farming);

    // The unblock callback starts a fresh round (nothing to farm here, so
    // it just runs to a clean finish).
    r.platform
        .push_callback(Callback::PlayingSessionState { blocked: false })
        .await;
    wait_until(|| !r.bot.farmer().playing_blocked()).await;
}

// =========================================================================
// Stop semantics
// =========================================================================

#[tokio::test(start_paused = true)]
async fn stop_disconnects_and_stays_down() {
    let r = rig();
    r.bot.start().await;
    wait_until(|| r.platform.with_log(|log| log.connects == 1)).await;

    r.bot.stop().await;
    wait_until(|| !r.bot.keep_running()).await;

    // The user-initiated disconnect must not trigger a reconnect.
    sleep(Duration::from_secs(60)).await;
    r.platform.with_log(|log| {
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, vec![true]);
    });
}
