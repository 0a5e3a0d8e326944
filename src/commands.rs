//! Command registry (spec §4.E command catalog, spec §9 design note): a
//! table of slash-commands, each gated by a required permission tier.

use std::future::Future;
use std::pin::Pin;

use crate::config::Settings;
use crate::docker::DockerManager;
use crate::error::{AppError, Result};
use crate::executor::Executor;
use crate::store::{Permission, Store};

pub struct CommandContext<'a> {
    pub settings: &'a Settings,
    pub store: &'a Store,
    pub docker: &'a DockerManager,
    pub executor: &'a Executor,
    pub caller_wxid: &'a str,
    pub caller_display_name: &'a str,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
type Handler = for<'a> fn(&'a CommandContext<'a>, &'a str) -> HandlerFuture<'a>;

pub struct CommandSpec {
    pub name: &'static str,
    pub tier: Permission,
    pub description: &'static str,
    pub handler: Handler,
}

pub fn registry() -> &'static [CommandSpec] {
    &[
        CommandSpec {
            name: "/help",
            tier: Permission::Normal,
            description: "List commands available to you.",
            handler: |ctx, args| Box::pin(cmd_help(ctx, args)),
        },
        CommandSpec {
            name: "/status",
            tier: Permission::Normal,
            description: "Show your friend summary, session state, and container stats.",
            handler: |ctx, args| Box::pin(cmd_status(ctx, args)),
        },
        CommandSpec {
            name: "/clear",
            tier: Permission::Normal,
            description: "Clear your session; the next message starts a new one.",
            handler: |ctx, args| Box::pin(cmd_clear(ctx, args)),
        },
        CommandSpec {
            name: "/allow",
            tier: Permission::Admin,
            description: "/allow <name> [tier] - grant a friend a permission tier.",
            handler: |ctx, args| Box::pin(cmd_allow(ctx, args)),
        },
        CommandSpec {
            name: "/block",
            tier: Permission::Admin,
            description: "/block <name> - block a friend and destroy their container.",
            handler: |ctx, args| Box::pin(cmd_block(ctx, args)),
        },
        CommandSpec {
            name: "/list",
            tier: Permission::Admin,
            description: "List all friends grouped by tier.",
            handler: |ctx, args| Box::pin(cmd_list(ctx, args)),
        },
        CommandSpec {
            name: "/logs",
            tier: Permission::Admin,
            description: "/logs [name] - recent audit entries.",
            handler: |ctx, args| Box::pin(cmd_logs(ctx, args)),
        },
        CommandSpec {
            name: "/kill",
            tier: Permission::Admin,
            description: "/kill <name> - kill Claude inside the target's container.",
            handler: |ctx, args| Box::pin(cmd_kill(ctx, args)),
        },
        CommandSpec {
            name: "/containers",
            tier: Permission::Admin,
            description: "List app-labeled containers.",
            handler: |ctx, args| Box::pin(cmd_containers(ctx, args)),
        },
        CommandSpec {
            name: "/restart",
            tier: Permission::Admin,
            description: "/restart <name> - stop container and clear session.",
            handler: |ctx, args| Box::pin(cmd_restart(ctx, args)),
        },
        CommandSpec {
            name: "/destroy",
            tier: Permission::Admin,
            description: "/destroy <name> - remove a friend's container.",
            handler: |ctx, args| Box::pin(cmd_destroy(ctx, args)),
        },
        CommandSpec {
            name: "/rebuild",
            tier: Permission::Admin,
            description: "/rebuild <name> - destroy then recreate a friend's container.",
            handler: |ctx, args| Box::pin(cmd_rebuild(ctx, args)),
        },
        CommandSpec {
            name: "/stopall",
            tier: Permission::Admin,
            description: "Stop every app-labeled container.",
            handler: |ctx, args| Box::pin(cmd_stopall(ctx, args)),
        },
    ]
}

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    registry().iter().find(|c| c.name == name)
}

async fn resolve_one_friend(store: &Store, q: &str) -> Result<crate::store::Friend> {
    let mut matches = store.friend_find_by_nickname(q).await?;
    match matches.len() {
        0 => Err(AppError::NotFound(q.to_string())),
        1 => Ok(matches.remove(0)),
        n => Err(AppError::Ambiguous(n)),
    }
}

async fn cmd_help(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    let caller_tier = ctx
        .store
        .friend_get_permission(ctx.caller_wxid)
        .await?
        .unwrap_or(Permission::Normal);

    let mut lines = vec!["Available commands:".to_string()];
    for spec in registry() {
        if caller_tier >= spec.tier {
            lines.push(format!("{} - {}", spec.name, spec.description));
        }
    }
    Ok(lines.join("\n"))
}

async fn cmd_status(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    let friend = ctx
        .store
        .friend_get(ctx.caller_wxid)
        .await?
        .ok_or_else(|| AppError::NotFound(ctx.caller_wxid.to_string()))?;
    let session = ctx.store.session_get_active(ctx.caller_wxid).await?;

    let mut out = format!(
        "wxid: {}\nname: {}\npermission: {}\n",
        friend.wxid,
        friend.display_name(),
        friend.permission(),
    );

    match session {
        Some(s) => out.push_str(&format!(
            "session: active, {} messages, last active {}\n",
            s.message_count, s.last_active
        )),
        None => out.push_str("session: none\n"),
    }

    if let Ok(stats) = ctx.docker.stats(ctx.settings, ctx.caller_wxid).await {
        out.push_str(&format!(
            "container: cpu {:.1}%, mem {}/{} bytes, pids {}\n",
            stats.cpu_percent, stats.mem_bytes, stats.mem_limit_bytes, stats.pids
        ));
    }
    if let Ok(disk) = ctx.docker.disk_usage(ctx.settings, ctx.caller_wxid).await {
        out.push_str(&format!("disk: {}\n", disk.trim()));
    }

    Ok(out)
}

async fn cmd_clear(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    ctx.store.session_clear_user(ctx.caller_wxid).await?;
    Ok("Session cleared.".to_string())
}

async fn cmd_allow(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let mut parts = args.split_whitespace();
    let name = parts.next().ok_or_else(|| AppError::BadArgs("usage: /allow <name> [tier]".into()))?;
    let tier_token = parts.next().unwrap_or("trusted");
    let tier = match tier_token {
        "trusted" => Permission::Trusted,
        "normal" => Permission::Normal,
        "admin" => Permission::Admin,
        other => return Err(AppError::BadArgs(format!("invalid tier: {other}"))),
    };

    let friend = resolve_one_friend(ctx.store, name).await?;
    ctx.store.friend_set_permission(&friend.wxid, tier).await?;
    Ok(format!("{} is now {}.", friend.display_name(), tier.as_str()))
}

async fn cmd_block(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let name = args.trim();
    if name.is_empty() {
        return Err(AppError::BadArgs("usage: /block <name>".into()));
    }
    let friend = resolve_one_friend(ctx.store, name).await?;
    ctx.store
        .friend_set_permission(&friend.wxid, Permission::Blocked)
        .await?;
    ctx.docker.destroy(ctx.settings, &friend.wxid).await?;
    Ok(format!("{} is now blocked.", friend.display_name()))
}

async fn cmd_list(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    let mut out = String::new();
    for tier in [
        Permission::Admin,
        Permission::Trusted,
        Permission::Normal,
        Permission::Blocked,
    ] {
        let friends = ctx.store.friend_list_by_permission(tier).await?;
        out.push_str(&format!("{}:\n", tier.as_str()));
        for friend in friends {
            out.push_str(&format!("  {} ({})\n", friend.display_name(), friend.wxid));
        }
    }
    Ok(out)
}

async fn cmd_logs(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    const LIMIT: i64 = 20;
    let name = args.trim();
    let entries = if name.is_empty() {
        ctx.store.audit_get_recent(LIMIT).await?
    } else {
        let friend = resolve_one_friend(ctx.store, name).await?;
        ctx.store.audit_get_by_user(&friend.wxid, LIMIT).await?
    };

    if entries.is_empty() {
        return Ok("No audit entries.".to_string());
    }

    let mut lines = Vec::new();
    for entry in entries {
        lines.push(format!(
            "[{}] {} {} {}",
            entry.timestamp,
            entry.nickname,
            entry.direction,
            entry.message.unwrap_or_default()
        ));
    }
    Ok(lines.join("\n"))
}

async fn cmd_kill(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let name = args.trim();
    if name.is_empty() {
        return Err(AppError::BadArgs("usage: /kill <name>".into()));
    }
    let friend = resolve_one_friend(ctx.store, name).await?;
    let _ = ctx
        .docker
        .exec_command(ctx.settings, &friend.wxid, "pkill -f claude || true", true)
        .await;
    ctx.executor.release(&friend.wxid);
    Ok(format!("Killed Claude processes for {}.", friend.display_name()))
}

async fn cmd_containers(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    let containers = ctx.docker.list_containers(ctx.settings).await?;
    if containers.is_empty() {
        return Ok("No containers.".to_string());
    }
    let mut lines = Vec::new();
    for c in containers {
        lines.push(format!(
            "{} [{}] wxid={} permission={}",
            c.name,
            c.status,
            c.wxid.unwrap_or_default(),
            c.permission.unwrap_or_default()
        ));
    }
    Ok(lines.join("\n"))
}

async fn cmd_restart(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let name = args.trim();
    if name.is_empty() {
        return Err(AppError::BadArgs("usage: /restart <name>".into()));
    }
    let friend = resolve_one_friend(ctx.store, name).await?;
    ctx.docker.stop(ctx.settings, &friend.wxid).await?;
    ctx.store.session_clear_user(&friend.wxid).await?;
    Ok(format!("{} will restart on next message.", friend.display_name()))
}

async fn cmd_destroy(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let name = args.trim();
    if name.is_empty() {
        return Err(AppError::BadArgs("usage: /destroy <name>".into()));
    }
    let friend = resolve_one_friend(ctx.store, name).await?;
    ctx.docker.destroy(ctx.settings, &friend.wxid).await?;
    Ok(format!("{}'s container destroyed; data preserved.", friend.display_name()))
}

async fn cmd_rebuild(ctx: &CommandContext<'_>, args: &str) -> Result<String> {
    let name = args.trim();
    if name.is_empty() {
        return Err(AppError::BadArgs("usage: /rebuild <name>".into()));
    }
    let friend = resolve_one_friend(ctx.store, name).await?;
    ctx.docker
        .rebuild(ctx.settings, &friend.wxid, friend.permission())
        .await?;
    Ok(format!("{}'s container rebuilt.", friend.display_name()))
}

async fn cmd_stopall(ctx: &CommandContext<'_>, _args: &str) -> Result<String> {
    let stopped = ctx.docker.stop_all(ctx.settings).await?;
    Ok(format!("Stopped {stopped} containers."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_one_entry_per_catalog_command() {
        let names: Vec<&str> = registry().iter().map(|c| c.name).collect();
        assert_eq!(names.len(), 13);
        assert!(names.contains(&"/help"));
        assert!(names.contains(&"/stopall"));
    }

    #[test]
    fn lookup_finds_known_command() {
        assert!(lookup("/status").is_some());
        assert!(lookup("/unknown").is_none());
    }

    #[test]
    fn admin_commands_require_admin_tier() {
        for spec in registry() {
            if spec.name == "/help" || spec.name == "/status" || spec.name == "/clear" {
                assert_eq!(spec.tier, Permission::Normal);
            } else {
                assert_eq!(spec.tier, Permission::Admin);
            }
        }
    }
}
