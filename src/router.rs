//! Message Router (spec §4.E): admission control, command dispatch,
//! security filter, audit emission, outbound chunking.

use regex::Regex;

use crate::commands::{self, CommandContext};
use crate::config::Settings;
use crate::docker::DockerManager;
use crate::error::Result;
use crate::executor::{Executor, FriendInfo};
use crate::store::{Direction, FriendUpdate, Permission, Store};
use crate::text::chunk_message;

const AUDIT_EGRESS_SNIPPET_CHARS: usize = 200;
const OUTBOUND_SOFT_CAP: usize = 2_000;

pub struct Contact {
    pub wxid: String,
    pub nickname: String,
    pub remark_name: Option<String>,
}

pub struct Router {
    store: Store,
    docker: DockerManager,
    executor: Executor,
    blocked_patterns: Vec<Regex>,
}

impl Router {
    pub fn new(settings: &Settings, store: Store, docker: DockerManager, executor: Executor) -> Self {
        let blocked_patterns = settings
            .security
            .blocked_patterns
            .iter()
            .filter_map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .inspect_err(|e| tracing::warn!(pattern = %p, error = %e, "invalid blocked_patterns regex"))
                    .ok()
            })
            .collect();

        Self {
            store,
            docker,
            executor,
            blocked_patterns,
        }
    }

    /// Handle one inbound message, returning the chunks to send back (empty
    /// if no reply is due, e.g. a blocked user).
    pub async fn handle(&self, settings: &Settings, contact: &Contact, text: &str) -> Result<Vec<String>> {
        if contact.wxid.is_empty() {
            tracing::warn!("rejecting message with empty wxid at admission");
            return Ok(vec![]);
        }

        let display_name = display_name(contact);

        self.store
            .audit_log(&contact.wxid, &display_name, Direction::In, ingress_audit_body(settings, text), None)
            .await?;

        self.ensure_friend_registered(settings, contact).await?;

        let permission = self.effective_permission(settings, &contact.wxid).await?;

        let Some(permission) = permission else {
            if settings.permissions.notify_unauthorized {
                return Ok(vec![settings.permissions.unauthorized_message.clone()]);
            }
            return Ok(vec![]);
        };

        if permission == Permission::Blocked {
            return Ok(vec![]);
        }

        let decision = self
            .store
            .rate_check_and_increment(
                &contact.wxid,
                settings.rate_limit.max_per_minute,
                settings.rate_limit.max_per_day,
            )
            .await?;
        if !decision.allowed {
            return Ok(vec![decision.reason.unwrap_or_else(|| "Rate limited.".to_string())]);
        }

        let reply = if let Some((command, args)) = parse_command(text) {
            self.dispatch_command(settings, &contact.wxid, &display_name, permission, command, args)
                .await?
        } else {
            if permission != Permission::Admin {
                if let Some(pattern) = self.blocked_patterns.iter().find(|re| re.is_match(text)) {
                    tracing::warn!(wxid = %contact.wxid, pattern = %pattern.as_str(), "message blocked by security filter");
                    return Ok(vec!["Your message was blocked by a security filter.".to_string()]);
                }
            }

            let friend = FriendInfo {
                wxid: contact.wxid.clone(),
                display_name: display_name.clone(),
                permission,
            };
            self.executor.execute(settings, &friend, text).await?
        };

        let snippet: String = reply.chars().take(AUDIT_EGRESS_SNIPPET_CHARS).collect();
        self.store
            .audit_log(&contact.wxid, &display_name, Direction::Out, Some(&snippet), None)
            .await?;

        Ok(chunk_message(&reply, OUTBOUND_SOFT_CAP))
    }

    async fn ensure_friend_registered(&self, settings: &Settings, contact: &Contact) -> Result<()> {
        let existing = self.store.friend_get(&contact.wxid).await?;
        match existing {
            None => {
                let permission = if contact.wxid == settings.admin_wxid {
                    Permission::Admin
                } else {
                    settings.permissions.default_level.parse().unwrap_or(Permission::Normal)
                };
                self.store
                    .friend_upsert(
                        &contact.wxid,
                        FriendUpdate {
                            nickname: Some(contact.nickname.clone()),
                            remark_name: contact.remark_name.clone(),
                            permission: Some(permission),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Some(friend) => {
                if friend.nickname != contact.nickname || friend.remark_name != contact.remark_name {
                    self.store
                        .friend_upsert(
                            &contact.wxid,
                            FriendUpdate {
                                nickname: Some(contact.nickname.clone()),
                                remark_name: contact.remark_name.clone(),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn effective_permission(&self, settings: &Settings, wxid: &str) -> Result<Option<Permission>> {
        if wxid == settings.admin_wxid {
            return Ok(Some(Permission::Admin));
        }
        if let Some(tier) = self.store.friend_get_permission(wxid).await? {
            return Ok(Some(tier));
        }
        Ok(settings.permissions.default_level.parse().ok())
    }

    async fn dispatch_command(
        &self,
        settings: &Settings,
        wxid: &str,
        display_name: &str,
        caller_tier: Permission,
        command: &str,
        args: &str,
    ) -> Result<String> {
        let Some(spec) = commands::lookup(command) else {
            // Not a recognized command word; fall through to Claude dispatch.
            let friend = FriendInfo {
                wxid: wxid.to_string(),
                display_name: display_name.to_string(),
                permission: caller_tier,
            };
            return self
                .executor
                .execute(settings, &friend, &format!("{command} {args}"))
                .await;
        };

        if caller_tier < spec.tier {
            return Ok("Insufficient permission.".to_string());
        }

        let ctx = CommandContext {
            settings,
            store: &self.store,
            docker: &self.docker,
            executor: &self.executor,
            caller_wxid: wxid,
            caller_display_name: display_name,
        };

        match (spec.handler)(&ctx, args.trim()).await {
            Ok(reply) => Ok(reply),
            Err(e) => Ok(e.user_message()),
        }
    }
}

fn display_name(contact: &Contact) -> String {
    if let Some(remark) = &contact.remark_name {
        if !remark.is_empty() {
            return remark.clone();
        }
    }
    if !contact.nickname.is_empty() {
        return contact.nickname.clone();
    }
    contact.wxid.clone()
}

fn ingress_audit_body<'a>(settings: &Settings, text: &'a str) -> Option<&'a str> {
    if settings.logging.log_message_content {
        Some(text)
    } else {
        None
    }
}

/// `/command args...` -> `Some(("/command", "args..."))`; anything not
/// starting with `/` is not a command.
fn parse_command(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((cmd, rest)) => Some((cmd, rest.trim())),
        None => Some((text, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_prefers_remark_then_nickname_then_wxid() {
        let contact = Contact {
            wxid: "u1".into(),
            nickname: "Nick".into(),
            remark_name: Some("Remark".into()),
        };
        assert_eq!(display_name(&contact), "Remark");

        let contact = Contact {
            wxid: "u1".into(),
            nickname: "Nick".into(),
            remark_name: None,
        };
        assert_eq!(display_name(&contact), "Nick");

        let contact = Contact {
            wxid: "u1".into(),
            nickname: "".into(),
            remark_name: None,
        };
        assert_eq!(display_name(&contact), "u1");
    }

    #[test]
    fn parse_command_splits_command_and_args() {
        assert_eq!(parse_command("/allow Alice trusted"), Some(("/allow", "Alice trusted")));
        assert_eq!(parse_command("/help"), Some(("/help", "")));
        assert_eq!(parse_command("hello there"), None);
    }

    #[test]
    fn display_name_falls_back_to_empty_wxid_if_no_names_present() {
        // display_name itself doesn't reject empty wxid; Router::handle does
        // that at admission, before display_name is ever consulted.
        let contact = Contact {
            wxid: "".into(),
            nickname: "".into(),
            remark_name: None,
        };
        assert_eq!(display_name(&contact), "");
    }
}
