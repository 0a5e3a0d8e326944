use sqlx::FromRow;

use super::{now, Store};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub wxid: String,
    pub nickname: String,
    pub direction: String,
    pub message: Option<String>,
    pub claude_session: Option<String>,
    pub timestamp: String,
}

impl Store {
    /// Append-only audit write at router ingress or egress (spec §3, §4.E).
    pub async fn audit_log(
        &self,
        wxid: &str,
        nickname: &str,
        direction: Direction,
        message: Option<&str>,
        claude_session: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (wxid, nickname, direction, message, claude_session, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(wxid)
        .bind(nickname)
        .bind(direction.as_str())
        .bind(message)
        .bind(claude_session)
        .bind(now().format("%Y-%m-%d %H:%M:%S").to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn audit_get_by_user(&self, wxid: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log WHERE wxid = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )
        .bind(wxid)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn audit_get_recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingress_then_egress_ordered_descending_by_timestamp() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .audit_log("u1", "Alice", Direction::In, Some("hi"), None)
            .await
            .unwrap();
        store
            .audit_log("u1", "Alice", Direction::Out, Some("hello"), None)
            .await
            .unwrap();

        let entries = store.audit_get_by_user("u1", 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent (egress) first.
        assert_eq!(entries[0].direction, "out");
        assert_eq!(entries[1].direction, "in");
    }

    #[tokio::test]
    async fn get_recent_spans_all_users() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .audit_log("u1", "Alice", Direction::In, Some("hi"), None)
            .await
            .unwrap();
        store
            .audit_log("u2", "Bob", Direction::In, Some("yo"), None)
            .await
            .unwrap();

        let entries = store.audit_get_recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn limit_is_respected() {
        let store = Store::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .audit_log("u1", "Alice", Direction::In, Some(&format!("msg{i}")), None)
                .await
                .unwrap();
        }
        let entries = store.audit_get_by_user("u1", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
