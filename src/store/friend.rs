use sqlx::FromRow;

use super::{now, Permission, Store};
use crate::error::Result;

#[derive(Debug, Clone, FromRow)]
pub struct Friend {
    pub wxid: String,
    pub nickname: String,
    pub remark_name: Option<String>,
    pub permission: String,
    pub added_at: String,
    pub added_by: Option<String>,
    pub notes: Option<String>,
}

impl Friend {
    pub fn permission(&self) -> Permission {
        self.permission.parse().unwrap_or(Permission::Normal)
    }

    /// First non-empty of remark_name, nickname, wxid (spec §4.E step 1).
    pub fn display_name(&self) -> &str {
        if let Some(remark) = &self.remark_name {
            if !remark.is_empty() {
                return remark;
            }
        }
        if !self.nickname.is_empty() {
            return &self.nickname;
        }
        &self.wxid
    }
}

#[derive(Debug, Default)]
pub struct FriendUpdate {
    pub nickname: Option<String>,
    pub remark_name: Option<String>,
    pub permission: Option<Permission>,
    pub added_by: Option<String>,
    pub notes: Option<String>,
}

/// Escape `%` and `_` so a nickname search substring is matched literally,
/// per spec §4.A ("q must be treated as a literal substring").
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl Store {
    pub async fn friend_get(&self, wxid: &str) -> Result<Option<Friend>> {
        let row = sqlx::query_as::<_, Friend>("SELECT * FROM friends WHERE wxid = ?1")
            .bind(wxid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Coalesce-on-conflict upsert: fields left absent in `update` never
    /// overwrite existing non-null values. On first insert, a missing
    /// permission defaults to `normal`.
    pub async fn friend_upsert(&self, wxid: &str, update: FriendUpdate) -> Result<()> {
        let existing = self.friend_get(wxid).await?;

        match existing {
            None => {
                let nickname = update.nickname.unwrap_or_default();
                let permission = update.permission.unwrap_or(Permission::Normal);
                sqlx::query(
                    "INSERT INTO friends (wxid, nickname, remark_name, permission, added_at, added_by, notes) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(wxid)
                .bind(&nickname)
                .bind(&update.remark_name)
                .bind(permission.as_str())
                .bind(now().format("%Y-%m-%d %H:%M:%S").to_string())
                .bind(&update.added_by)
                .bind(&update.notes)
                .execute(&self.pool)
                .await?;
            }
            Some(current) => {
                let nickname = update.nickname.unwrap_or(current.nickname);
                let remark_name = update.remark_name.or(current.remark_name);
                let permission = update
                    .permission
                    .map(|p| p.as_str().to_string())
                    .unwrap_or(current.permission);
                let added_by = update.added_by.or(current.added_by);
                let notes = update.notes.or(current.notes);

                sqlx::query(
                    "UPDATE friends SET nickname = ?1, remark_name = ?2, permission = ?3, \
                     added_by = ?4, notes = ?5 WHERE wxid = ?6",
                )
                .bind(nickname)
                .bind(remark_name)
                .bind(permission)
                .bind(added_by)
                .bind(notes)
                .bind(wxid)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    pub async fn friend_get_permission(&self, wxid: &str) -> Result<Option<Permission>> {
        Ok(self.friend_get(wxid).await?.map(|f| f.permission()))
    }

    pub async fn friend_set_permission(&self, wxid: &str, tier: Permission) -> Result<()> {
        sqlx::query("UPDATE friends SET permission = ?1 WHERE wxid = ?2")
            .bind(tier.as_str())
            .bind(wxid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn friend_list_all(&self) -> Result<Vec<Friend>> {
        let rows = sqlx::query_as::<_, Friend>("SELECT * FROM friends ORDER BY added_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn friend_list_by_permission(&self, tier: Permission) -> Result<Vec<Friend>> {
        let rows = sqlx::query_as::<_, Friend>(
            "SELECT * FROM friends WHERE permission = ?1 ORDER BY added_at DESC",
        )
        .bind(tier.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn friend_remove(&self, wxid: &str) -> Result<()> {
        sqlx::query("DELETE FROM friends WHERE wxid = ?1")
            .bind(wxid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Substring match against nickname or remark_name, treating `q` as a
    /// literal string even if it contains SQL LIKE wildcards.
    pub async fn friend_find_by_nickname(&self, q: &str) -> Result<Vec<Friend>> {
        let pattern = format!("%{}%", escape_like(q));
        let rows = sqlx::query_as::<_, Friend>(
            "SELECT * FROM friends WHERE (nickname LIKE ?1 ESCAPE '\\' OR remark_name LIKE ?1 ESCAPE '\\') \
             ORDER BY added_at DESC",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_does_not_clobber_absent_fields() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    nickname: Some("N1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    remark_name: Some("R1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let f = store.friend_get("u1").await.unwrap().unwrap();
        assert_eq!(f.nickname, "N1");
        assert_eq!(f.remark_name.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn insert_defaults_permission_to_normal() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    nickname: Some("N1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let f = store.friend_get("u1").await.unwrap().unwrap();
        assert_eq!(f.permission(), Permission::Normal);
    }

    #[tokio::test]
    async fn wildcard_characters_are_treated_as_literals() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    nickname: Some("Alice_Underscore".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .friend_upsert(
                "u2",
                FriendUpdate {
                    nickname: Some("AliceXUnderscore".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Searching for the literal "_" must not match u2's "X" stand-in.
        let matches = store.friend_find_by_nickname("Alice_Under").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].wxid, "u1");
    }

    #[tokio::test]
    async fn percent_wildcard_is_treated_as_literal() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    nickname: Some("100%sure".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .friend_upsert(
                "u2",
                FriendUpdate {
                    nickname: Some("100xsure".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let matches = store.friend_find_by_nickname("100%sure").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].wxid, "u1");
    }

    #[tokio::test]
    async fn list_all_orders_by_added_at_desc() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .friend_upsert(
                "u1",
                FriendUpdate {
                    nickname: Some("First".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .friend_upsert(
                "u2",
                FriendUpdate {
                    nickname: Some("Second".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let all = store.friend_list_all().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
