//! External ACL hook
//!
//! The configured command is run as `<cmd> <action> <user-json> <host-json>`.
//! If it prints `allow` or `deny` within two seconds that replaces the resolved
//! action. Anything else (failure, timeout, other output) keeps the resolved action.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::AclAction;
use crate::store::{Host, User};

const HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// User fields exposed to the hook
#[derive(Serialize)]
struct HookUser<'a> {
    id: u64,
    name: &'a str,
    email: &'a str,
    roles: &'a [String],
    group_ids: &'a [u64],
}

/// Host fields exposed to the hook; credentials are never passed
#[derive(Serialize)]
struct HookHost<'a> {
    id: u64,
    name: &'a str,
    addr: &'a str,
    user: &'a str,
    hop_id: Option<u64>,
    group_ids: &'a [u64],
}

pub async fn consult_hook(cmd: &str, action: AclAction, user: &User, host: &Host) -> AclAction {
    match run_hook(cmd, action, user, host).await {
        Ok(Some(decision)) => {
            if decision != action {
                debug!(
                    "ACL hook changed decision for {} on {}: {} -> {}",
                    user.name, host.name, action, decision
                );
            }
            decision
        }
        Ok(None) => action,
        Err(e) => {
            warn!("ACL hook {:?} failed, keeping {}: {}", cmd, action, e);
            action
        }
    }
}

async fn run_hook(
    cmd: &str,
    action: AclAction,
    user: &User,
    host: &Host,
) -> Result<Option<AclAction>, String> {
    let user_json = serde_json::to_string(&HookUser {
        id: user.id,
        name: &user.name,
        email: &user.email,
        roles: &user.roles,
        group_ids: &user.group_ids,
    })
    .map_err(|e| e.to_string())?;
    let host_json = serde_json::to_string(&HookHost {
        id: host.id,
        name: &host.name,
        addr: &host.addr,
        user: &host.user,
        hop_id: host.hop_id,
        group_ids: &host.group_ids,
    })
    .map_err(|e| e.to_string())?;

    let child = Command::new(cmd)
        .arg(action.as_str())
        .arg(user_json)
        .arg(host_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn: {}", e))?;

    let output = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    match stdout.trim() {
        "allow" => Ok(Some(AclAction::Allow)),
        "deny" => Ok(Some(AclAction::Deny)),
        other => {
            debug!("ACL hook printed {:?}, ignoring", other);
            Ok(None)
        }
    }
}
