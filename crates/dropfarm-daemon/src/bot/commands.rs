//! Chat command handling.
//!
//! Messages starting with `!` are verb commands; anything else from the
//! master is a pasted batch of activation keys. Verbs are matched
//! case-insensitively and arguments tolerate any amount of whitespace.
//! Unauthorized senders get no reply at all.

use std::sync::Arc;

use tracing::info;

use dropfarm_core::keys::{is_possibly_valid_key, split_keys};

use crate::authenticator::{AuthenticatorError, ConfirmationFilter};
use crate::platform::{AccountId, RedeemResult};

use super::Bot;

/// Privilege a verb demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Privilege {
    Master,
    Owner,
    Unknown,
}

fn required_privilege(verb: &str) -> Privilege {
    match verb {
        "api" | "exit" | "lootall" | "restart" | "statusall" | "update" => Privilege::Owner,
        "2fa" | "2faok" | "2fano" | "addlicense" | "farm" | "help" | "loot" | "owns"
        | "password" | "pause" | "play" | "redeem" | "rejoinchat" | "resume" | "start"
        | "status" | "stop" | "version" => Privilege::Master,
        _ => Privilege::Unknown,
    }
}

/// Handle one incoming message; `None` means no reply is sent.
pub async fn handle_message(bot: &Arc<Bot>, sender: AccountId, text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let owner_id = bot.config.owner_id;
    let is_owner = owner_id != 0 && sender == owner_id;
    let is_master = is_owner || (bot.config.master_id != 0 && sender == bot.config.master_id);

    let reply = if let Some(rest) = text.strip_prefix('!') {
        let mut parts = rest.split_whitespace();
        let verb = parts.next()?.to_lowercase();
        let args: Vec<&str> = parts.collect();

        match required_privilege(&verb) {
            Privilege::Unknown => {
                if is_master {
                    Some("ERROR: Unknown command!".to_string())
                } else {
                    None
                }
            }
            Privilege::Owner if !is_owner => None,
            Privilege::Master if !is_master => None,
            _ => {
                info!(bot = %bot.name, sender, verb = %verb, "Command");
                Some(dispatch(bot, &verb, &args).await)
            }
        }
    } else if is_master {
        Some(redeem_keys(bot, text).await)
    } else {
        None
    }?;

    // Multi-line replies begin with a newline.
    if reply.contains('\n') && !reply.starts_with('\n') {
        Some(format!("\n{reply}"))
    } else {
        Some(reply)
    }
}

async fn dispatch(bot: &Arc<Bot>, verb: &str, args: &[&str]) -> String {
    match verb {
        "2fa" => two_factor_token(bot),
        "2faok" => confirm_all(bot, true).await,
        "2fano" => confirm_all(bot, false).await,
        "addlicense" => add_license(bot, args).await,
        "api" => "The IPC control surface is handled by the service manager".to_string(),
        "exit" => exit_fleet(bot),
        "farm" => {
            bot.farmer().start().await;
            "Done!".to_string()
        }
        "help" => help_text(),
        "loot" => {
            let authenticator = bot.authenticator();
            if bot.trading().send_loot(authenticator.as_deref()).await {
                "Done!".to_string()
            } else {
                "Nothing to send!".to_string()
            }
        }
        "lootall" => loot_all(bot).await,
        "owns" => owns(bot, args).await,
        "password" => {
            if bot.config.password.is_empty() {
                "No password is configured".to_string()
            } else {
                format!("Password: {}", bot.config.password)
            }
        }
        "pause" => {
            bot.farmer().switch_to_manual_mode(true).await;
            "Done!".to_string()
        }
        "play" => play(bot, args).await,
        "redeem" => redeem_keys(bot, &args.join("\n")).await,
        "rejoinchat" => {
            bot.rejoin_chat().await;
            "Done!".to_string()
        }
        "restart" => {
            bot.stop().await;
            bot.start().await;
            "Done!".to_string()
        }
        "resume" => {
            bot.farmer().switch_to_manual_mode(false).await;
            "Done!".to_string()
        }
        "start" => {
            if bot.keep_running() {
                "Already running!".to_string()
            } else {
                bot.start().await;
                "Done!".to_string()
            }
        }
        "status" => bot.status_line(),
        "statusall" => status_all(bot).await,
        "stop" => {
            bot.stop().await;
            "Done!".to_string()
        }
        "update" => "Updates are handled by the service manager".to_string(),
        "version" => format!("dropfarm {}", env!("CARGO_PKG_VERSION")),
        _ => "ERROR: Unknown command!".to_string(),
    }
}

fn two_factor_token(bot: &Arc<Bot>) -> String {
    match bot.authenticator() {
        Some(authenticator) => match authenticator.current_token() {
            Ok(token) => format!("2FA token: {token}"),
            Err(e) => format!("ERROR: {e}"),
        },
        None => "No authenticator is enrolled".to_string(),
    }
}

async fn confirm_all(bot: &Arc<Bot>, accept: bool) -> String {
    let Some(authenticator) = bot.authenticator() else {
        return "No authenticator is enrolled".to_string();
    };
    if accept {
        match authenticator
            .accept_confirmations(&ConfirmationFilter::All)
            .await
        {
            Ok(count) => format!("Done! Accepted {count} confirmations"),
            Err(AuthenticatorError::SessionExpired) => {
                "ERROR: Web session expired, try again shortly".to_string()
            }
            Err(e) => format!("ERROR: {e}"),
        }
    } else {
        let confirmations = match authenticator.fetch_confirmations().await {
            Ok(confirmations) => confirmations,
            Err(AuthenticatorError::SessionExpired) => {
                return "ERROR: Web session expired, try again shortly".to_string();
            }
            Err(e) => return format!("ERROR: {e}"),
        };
        let mut denied = 0usize;
        for confirmation in &confirmations {
            if matches!(authenticator.handle(confirmation, false).await, Ok(true)) {
                denied += 1;
            }
        }
        format!("Done! Denied {denied} confirmations")
    }
}

async fn add_license(bot: &Arc<Bot>, args: &[&str]) -> String {
    let Some(app) = args.first().and_then(|a| a.parse::<u32>().ok()) else {
        return "ERROR: Usage: !addlicense <appId>".to_string();
    };
    match bot.add_license(app).await {
        Some(granted) if !granted.is_empty() => {
            bot.farmer().on_new_game_added().await;
            let ids: Vec<String> = granted.iter().map(u32::to_string).collect();
            format!("Granted: {}", ids.join(", "))
        }
        _ => "ERROR: License request failed".to_string(),
    }
}

fn exit_fleet(bot: &Arc<Bot>) -> String {
    if let Some(fleet) = bot.fleet() {
        tokio::spawn(async move { fleet.shutdown().await });
        "Exiting...".to_string()
    } else {
        "ERROR: Not managed by a supervisor".to_string()
    }
}

async fn loot_all(bot: &Arc<Bot>) -> String {
    let Some(fleet) = bot.fleet() else {
        return "ERROR: Not managed by a supervisor".to_string();
    };
    let mut sent = 0usize;
    for sibling in fleet.connected_bots().await {
        let authenticator = sibling.authenticator();
        if sibling.trading().send_loot(authenticator.as_deref()).await {
            sent += 1;
        }
    }
    format!("Done! {sent} loot offers sent")
}

async fn owns(bot: &Arc<Bot>, args: &[&str]) -> String {
    if args.is_empty() {
        return "ERROR: Usage: !owns <appId|name>".to_string();
    }
    let query = args.join(" ");
    let Some(games) = bot.owned_games().await else {
        return "ERROR: Could not fetch owned games".to_string();
    };

    let mut matches: Vec<String> = if let Ok(app) = query.parse::<u32>() {
        games
            .get(&app)
            .map(|title| format!("{app} | {title}"))
            .into_iter()
            .collect()
    } else {
        let needle = query.to_lowercase();
        let mut found: Vec<(u32, &String)> = games
            .iter()
            .filter(|(_, title)| title.to_lowercase().contains(&needle))
            .map(|(app, title)| (*app, title))
            .collect();
        found.sort_by_key(|(app, _)| *app);
        found
            .into_iter()
            .map(|(app, title)| format!("{app} | {title}"))
            .collect()
    };

    if matches.is_empty() {
        format!("Not owned yet: {query}")
    } else {
        matches.insert(0, "Owned already:".to_string());
        matches.join("\n")
    }
}

async fn play(bot: &Arc<Bot>, args: &[&str]) -> String {
    if args.is_empty() {
        return "ERROR: Usage: !play <appId,appId,...|name>".to_string();
    }
    let joined = args.join(" ");
    let ids: Option<Vec<u32>> = joined
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok())
        .collect();

    match ids {
        Some(apps) if !apps.is_empty() => {
            bot.play_manual(&apps, None).await;
            "Done!".to_string()
        }
        _ => {
            // Not a list of ids: play it as a custom game name.
            bot.play_manual(&[], Some(&joined)).await;
            "Done!".to_string()
        }
    }
}

async fn status_all(bot: &Arc<Bot>) -> String {
    let Some(fleet) = bot.fleet() else {
        return bot.status_line();
    };
    let lines: Vec<String> = fleet
        .all_bots()
        .await
        .iter()
        .map(|b| b.status_line())
        .collect();
    lines.join("\n")
}

// =========================================================================
// Key redemption
// =========================================================================

fn format_redeem_line(bot_name: &str, key: &str, result: &RedeemResult) -> String {
    if result.items.is_empty() {
        format!("<{bot_name}> Key: {key} | Status: {}", result.result)
    } else {
        let items: Vec<String> = result
            .items
            .iter()
            .map(|(app, title)| format!("{app}: {title}"))
            .collect();
        format!(
            "<{bot_name}> Key: {key} | Status: {} | Items: {}",
            result.result,
            items.join(", ")
        )
    }
}

/// Run the redemption pipeline over a pasted batch of keys.
///
/// Terminal results (`OK`, `DuplicatedKey`, `InvalidKey`) burn the key and,
/// with key distribution on, rotate to the next bot. Region-lock-like
/// results are retried on the sibling bots when forwarding or distribution
/// asks for it. Timeouts are recorded and skipped.
pub(crate) async fn redeem_keys(bot: &Arc<Bot>, input: &str) -> String {
    let keys: Vec<String> = split_keys(input)
        .into_iter()
        .filter(|k| is_possibly_valid_key(k))
        .collect();
    if keys.is_empty() {
        return "ERROR: No valid keys found".to_string();
    }

    let distribute = bot.config.distribute_keys;
    let forward = bot.config.forward_keys_to_other_bots;

    // Rotation ring: every connected bot, this one first.
    let ring: Vec<Arc<Bot>> = match bot.fleet() {
        Some(fleet) => {
            let mut bots = fleet.connected_bots().await;
            if !bots.iter().any(|b| Arc::ptr_eq(b, bot)) {
                bots.insert(0, Arc::clone(bot));
            }
            if let Some(pos) = bots.iter().position(|b| Arc::ptr_eq(b, bot)) {
                bots.rotate_left(pos);
            }
            bots
        }
        None => vec![Arc::clone(bot)],
    };

    let mut lines: Vec<String> = Vec::new();
    // Ring position the next key starts at (advanced by distribution).
    let mut ring_start = 0usize;

    for key in keys {
        let mut offset = 0usize;
        loop {
            let current = &ring[(ring_start + offset) % ring.len()];
            match current.redeem_one(&key).await {
                None => {
                    lines.push(format!(
                        "<{}> Key: {} | Status: Timeout!",
                        current.name(),
                        key
                    ));
                    break;
                }
                Some(result) => {
                    lines.push(format_redeem_line(current.name(), &key, &result));
                    if result.result.is_terminal() {
                        if !result.items.is_empty() {
                            current.farmer().on_new_game_added().await;
                        }
                        if distribute {
                            ring_start = (ring_start + offset + 1) % ring.len();
                        }
                        break;
                    }
                    // AlreadyOwned-like: maybe hand the key to a sibling.
                    if (distribute || forward) && offset + 1 < ring.len() {
                        offset += 1;
                        continue;
                    }
                    if distribute {
                        ring_start = (ring_start + offset + 1) % ring.len();
                    }
                    break;
                }
            }
        }
    }

    lines.join("\n")
}

fn help_text() -> String {
    [
        "Commands:",
        "!2fa | !2faok | !2fano",
        "!addlicense <appId>",
        "!farm | !pause | !resume | !play <apps|name>",
        "!loot | !lootall",
        "!owns <appId|name>",
        "!redeem <keys> (or just paste keys)",
        "!start | !stop | !restart | !status | !statusall",
        "!rejoinchat | !password | !version | !api | !update | !exit",
    ]
    .join("\n")
}
