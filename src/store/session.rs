use chrono::NaiveDateTime;
use sqlx::FromRow;
use uuid::Uuid;

use super::{now, Store};
use crate::error::Result;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub wxid: String,
    pub claude_session: Option<String>,
    pub created_at: String,
    pub last_active: String,
    pub message_count: i64,
}

impl Session {
    /// Strict `YYYY-MM-DD HH:MM:SS` parse, no ISO-8601 `T` separator
    /// accepted. Unparseable timestamps are treated as expired by the
    /// caller (see [`Session::is_expired`]).
    fn parse_last_active(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.last_active, TIMESTAMP_FORMAT).ok()
    }

    /// Expired iff `last_active` is strictly more than `window_minutes` in
    /// the past. A `last_active` in the future is never expired, and an
    /// unparseable timestamp is always expired (safe default).
    pub fn is_expired(&self, window_minutes: i64) -> bool {
        let Some(last_active) = self.parse_last_active() else {
            return true;
        };
        let current = now().naive_utc();
        if last_active > current {
            return false;
        }
        let age = current - last_active;
        age.num_minutes() > window_minutes
    }
}

fn format_now() -> String {
    now().format(TIMESTAMP_FORMAT).to_string()
}

impl Store {
    /// The session row with the latest `last_active` for `wxid`, if any.
    pub async fn session_get_active(&self, wxid: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE wxid = ?1 ORDER BY last_active DESC LIMIT 1",
        )
        .bind(wxid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn session_create(
        &self,
        id: &str,
        wxid: &str,
        claude_session: Option<&str>,
    ) -> Result<()> {
        let ts = format_now();
        sqlx::query(
            "INSERT INTO sessions (id, wxid, claude_session, created_at, last_active, message_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        )
        .bind(id)
        .bind(wxid)
        .bind(claude_session)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fresh UUID, created and immediately returned.
    pub async fn session_create_new(&self, wxid: &str) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        self.session_create(&id, wxid, None).await?;
        Ok(self
            .session_get_active(wxid)
            .await?
            .expect("session just inserted"))
    }

    /// Refresh `last_active` and atomically bump `message_count`.
    pub async fn session_touch(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET last_active = ?1, message_count = message_count + 1 WHERE id = ?2",
        )
        .bind(format_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session_set_claude_session(&self, id: &str, claude_session: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET claude_session = ?1 WHERE id = ?2")
            .bind(claude_session)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn session_clear_user(&self, wxid: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE wxid = ?1")
            .bind(wxid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete sessions whose `last_active` is unambiguously older than
    /// `now - minutes`. Rows with an unparseable or future `last_active`
    /// are left for the live expiry check in [`Session::is_expired`] rather
    /// than deleted here, since the comparison is done in SQL on the raw
    /// string and we only want to sweep clearly-past timestamps.
    pub async fn session_clean_expired(&self, minutes: i64) -> Result<u64> {
        let cutoff = (now() - chrono::Duration::minutes(minutes))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let result = sqlx::query("DELETE FROM sessions WHERE last_active < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(last_active: &str) -> Session {
        Session {
            id: "s1".into(),
            wxid: "u1".into(),
            claude_session: None,
            created_at: last_active.into(),
            last_active: last_active.into(),
            message_count: 0,
        }
    }

    #[test]
    fn future_timestamp_is_not_expired() {
        let future = (now() + chrono::Duration::minutes(5))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let session = session_with(&future);
        assert!(!session.is_expired(60));
    }

    #[test]
    fn past_timestamp_beyond_window_is_expired() {
        let past = (now() - chrono::Duration::minutes(61))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let session = session_with(&past);
        assert!(session.is_expired(60));
    }

    #[test]
    fn past_timestamp_within_window_is_not_expired() {
        let past = (now() - chrono::Duration::minutes(30))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let session = session_with(&past);
        assert!(!session.is_expired(60));
    }

    #[test]
    fn unparseable_timestamp_is_expired() {
        let session = session_with("2026-01-01T00:00:00");
        assert!(session.is_expired(60));
    }

    #[tokio::test]
    async fn create_then_touch_bumps_message_count() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                crate::store::friend::FriendUpdate {
                    nickname: Some("N".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let session = store.session_create_new("u1").await.unwrap();
        store.session_touch(&session.id).await.unwrap();
        store.session_touch(&session.id).await.unwrap();

        let active = store.session_get_active("u1").await.unwrap().unwrap();
        assert_eq!(active.message_count, 2);
    }

    #[tokio::test]
    async fn clear_user_removes_all_sessions() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                crate::store::friend::FriendUpdate {
                    nickname: Some("N".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.session_create_new("u1").await.unwrap();
        store.session_clear_user("u1").await.unwrap();
        assert!(store.session_get_active("u1").await.unwrap().is_none());
    }
}
