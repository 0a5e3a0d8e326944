//! Claude Executor (spec §4.D): session lookup/expiry, system-prompt
//! composition, one-at-a-time dispatch into the user's container, output
//! capture, truncation, session-id extraction.

use std::sync::Arc;

use dashmap::DashSet;
use regex::Regex;
use std::sync::LazyLock;

use crate::config::Settings;
use crate::docker::DockerManager;
use crate::error::{AppError, Result};
use crate::store::{Permission, Store};
use crate::text::{placeholder_if_empty, truncate_output};

const OUTPUT_CHAR_BUDGET: usize = 4_000;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)session[^a-fA-F0-9-]{0,3}([0-9a-f-]{8,})").expect("valid regex")
});

/// Releases its `wxid` from the in-flight set on every exit path,
/// including early returns via `?` and panics, per spec §4.D step 1/9.
struct InFlightGuard {
    wxid: String,
    set: Arc<DashSet<String>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.wxid);
    }
}

pub struct Executor {
    store: Store,
    docker: DockerManager,
    in_flight: Arc<DashSet<String>>,
}

pub struct FriendInfo {
    pub wxid: String,
    pub display_name: String,
    pub permission: Permission,
}

impl Executor {
    pub fn new(store: Store, docker: DockerManager) -> Self {
        Self {
            store,
            docker,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// True if `wxid` currently has an in-flight request guard held, used
    /// by `/kill` to report whether a release is needed.
    pub fn is_busy(&self, wxid: &str) -> bool {
        self.in_flight.contains(wxid)
    }

    /// Forcibly release the in-flight guard for `wxid`, used by `/kill`.
    pub fn release(&self, wxid: &str) {
        self.in_flight.remove(wxid);
    }

    pub async fn execute(
        &self,
        settings: &Settings,
        friend: &FriendInfo,
        message: &str,
    ) -> Result<String> {
        if !self.in_flight.insert(friend.wxid.clone()) {
            return Ok("I'm still working on your previous message, please wait.".to_string());
        }
        let _guard = InFlightGuard {
            wxid: friend.wxid.clone(),
            set: self.in_flight.clone(),
        };

        match self.run(settings, friend, message).await {
            Ok(reply) => Ok(reply),
            Err(AppError::ExecTimeout(_)) => Ok("Request timed out. Please try again.".to_string()),
            Err(e) => {
                tracing::warn!(wxid = %friend.wxid, error = %e, "execution failed");
                Ok(e.user_message())
            }
        }
    }

    async fn run(&self, settings: &Settings, friend: &FriendInfo, message: &str) -> Result<String> {
        self.docker
            .ensure_container(settings, &friend.wxid, friend.permission)
            .await?;

        let session = self.resolve_session(settings, &friend.wxid).await?;
        let system_prompt = compose_system_prompt(friend);

        let (stdout, stderr) = self
            .docker
            .exec_claude(
                settings,
                &friend.wxid,
                &system_prompt,
                message,
                session.claude_session.as_deref(),
                friend.permission,
                settings.claude.timeout,
            )
            .await?;

        if let Some(captured) = capture_session_id(&stderr) {
            self.store
                .session_set_claude_session(&session.id, &captured)
                .await?;
        }

        let output = placeholder_if_empty(stdout.trim());
        Ok(truncate_output(&output, OUTPUT_CHAR_BUDGET))
    }

    async fn resolve_session(
        &self,
        settings: &Settings,
        wxid: &str,
    ) -> Result<crate::store::Session> {
        let existing = self.store.session_get_active(wxid).await?;

        let session = match existing {
            Some(session) if !session.is_expired(settings.session.expire_minutes) => session,
            Some(_) => {
                self.store.session_clear_user(wxid).await?;
                self.store.session_create_new(wxid).await?
            }
            None => self.store.session_create_new(wxid).await?,
        };

        self.store.session_touch(&session.id).await?;
        Ok(session)
    }
}

fn compose_system_prompt(friend: &FriendInfo) -> String {
    let mut prompt = format!(
        "You are assisting wxid={} (\"{}\"), permission tier: {}.",
        friend.wxid,
        friend.display_name,
        friend.permission.as_str(),
    );
    if friend.permission == Permission::Normal {
        prompt.push_str(" Do not execute code or shell commands.");
    }
    prompt
}

fn capture_session_id(stderr: &str) -> Option<String> {
    for line in stderr.lines() {
        if let Some(captures) = SESSION_ID_RE.captures(line) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_includes_no_shell_instruction_for_normal() {
        let friend = FriendInfo {
            wxid: "u1".into(),
            display_name: "Alice".into(),
            permission: Permission::Normal,
        };
        let prompt = compose_system_prompt(&friend);
        assert!(prompt.contains("Do not execute code or shell"));
    }

    #[test]
    fn system_prompt_omits_restriction_for_trusted() {
        let friend = FriendInfo {
            wxid: "u1".into(),
            display_name: "Alice".into(),
            permission: Permission::Trusted,
        };
        let prompt = compose_system_prompt(&friend);
        assert!(!prompt.contains("Do not execute"));
    }

    #[test]
    fn captures_session_id_from_stderr() {
        let stderr = "some noise\nsession: 123e4567-e89b-12d3-a456-426614174000\nmore noise";
        let captured = capture_session_id(stderr).unwrap();
        assert_eq!(captured, "123e4567-e89b-12d3-a456-426614174000");
    }

    #[test]
    fn no_session_id_returns_none() {
        assert!(capture_session_id("nothing relevant here").is_none());
    }
}
