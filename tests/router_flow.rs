//! Message Router integration tests covering the admission-control pipeline
//! end to end against a real temporary store. Scenarios are restricted to
//! paths that never reach the container engine (command replies that don't
//! touch Docker, and the permission/rate-limit short-circuits that return
//! before dispatch), so these tests don't require a Docker daemon.

use claude_bridge::config::Settings;
use claude_bridge::docker::{DockerManager, Engine};
use claude_bridge::executor::Executor;
use claude_bridge::router::{Contact, Router};
use claude_bridge::store::Store;

async fn test_router(settings: &Settings) -> Router {
    let store = Store::open(":memory:").await.unwrap();
    let engine = Engine::connect().expect("engine construction does not dial the daemon");
    let docker = DockerManager::new(engine);
    let executor = Executor::new(store.clone(), docker.clone());
    Router::new(settings, store, docker, executor)
}

fn contact(wxid: &str, nickname: &str) -> Contact {
    Contact {
        wxid: wxid.to_string(),
        nickname: nickname.to_string(),
        remark_name: None,
    }
}

#[tokio::test]
async fn first_message_from_new_normal_user_can_run_help() {
    let settings = Settings::default();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("u1", "Alice"), "/help")
        .await
        .unwrap();

    assert_eq!(reply.len(), 1);
    assert!(reply[0].contains("/help"));
    // A normal user never sees admin-only commands in their /help output.
    assert!(!reply[0].contains("/stopall"));
}

#[tokio::test]
async fn admin_wxid_sees_full_command_catalog() {
    let mut settings = Settings::default();
    settings.admin_wxid = "admin1".to_string();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("admin1", "Root"), "/help")
        .await
        .unwrap();

    assert!(reply[0].contains("/stopall"));
    assert!(reply[0].contains("/allow"));
}

#[tokio::test]
async fn blocked_default_tier_receives_no_reply() {
    let mut settings = Settings::default();
    settings.permissions.default_level = "blocked".to_string();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("u1", "Alice"), "hello there")
        .await
        .unwrap();
    assert!(reply.is_empty());
}

#[tokio::test]
async fn unrecognized_default_level_still_resolves_to_normal() {
    // `Permission::from_str` never fails to parse (spec §3: unknown tokens
    // default to `normal`), so a typo'd `default_level` config value still
    // admits the user rather than silently dropping them.
    let mut settings = Settings::default();
    settings.permissions.default_level = "not-a-real-tier".to_string();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("u1", "Alice"), "/help")
        .await
        .unwrap();
    assert_eq!(reply.len(), 1);
    assert!(reply[0].contains("/help"));
}

#[tokio::test]
async fn rate_limit_boundary_denies_the_next_message_in_window() {
    let mut settings = Settings::default();
    settings.rate_limit.max_per_minute = 1;
    settings.rate_limit.max_per_day = 100;
    let router = test_router(&settings).await;

    let first = router
        .handle(&settings, &contact("u1", "Alice"), "/help")
        .await
        .unwrap();
    assert!(first[0].contains("/help"));

    let second = router
        .handle(&settings, &contact("u1", "Alice"), "/clear")
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert!(second[0].to_lowercase().contains("rate limit"));
}

#[tokio::test]
async fn non_admin_insufficient_tier_is_rejected_before_dispatch() {
    let settings = Settings::default();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("u1", "Alice"), "/stopall")
        .await
        .unwrap();
    assert_eq!(reply, vec!["Insufficient permission.".to_string()]);
}

#[tokio::test]
async fn empty_wxid_is_rejected_at_admission_with_no_reply() {
    // An empty wxid would otherwise collide with every other empty-wxid
    // caller in the shared sandbox namespace; reject it before it ever
    // reaches friend registration or dispatch.
    let settings = Settings::default();
    let router = test_router(&settings).await;

    let reply = router.handle(&settings, &contact("", "Nobody"), "/help").await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test]
async fn unknown_slash_word_is_not_treated_as_a_command_error() {
    // `/explain` is not in the registry, so it falls through to Claude
    // dispatch rather than producing an "unknown command" reply. Without a
    // live container engine the executor degrades gracefully to a friendly
    // error string instead of propagating a failure to the caller.
    let settings = Settings::default();
    let router = test_router(&settings).await;

    let reply = router
        .handle(&settings, &contact("u1", "Alice"), "/explain this code")
        .await
        .unwrap();
    assert_eq!(reply.len(), 1);
    assert_ne!(reply[0], "Insufficient permission.".to_string());
}
