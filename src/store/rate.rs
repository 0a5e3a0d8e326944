use super::{now, Store};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

fn minute_window(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:00").to_string()
}

fn day_window_prefix(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

impl Store {
    /// Atomically check and, if admitted, record one request for `wxid` in
    /// the current minute window (spec §3, §4.A). A limit of `0` denies
    /// unconditionally, for either window.
    pub async fn rate_check_and_increment(
        &self,
        wxid: &str,
        max_per_minute: i64,
        max_per_day: i64,
    ) -> Result<RateDecision> {
        if max_per_minute == 0 {
            return Ok(RateDecision::deny("Rate limit exceeded: no requests allowed this minute."));
        }
        if max_per_day == 0 {
            return Ok(RateDecision::deny("Rate limit exceeded: no requests allowed today."));
        }

        let current = now();
        let window = minute_window(current);
        let day_prefix = day_window_prefix(current);

        let minute_count: i64 = sqlx::query_scalar(
            "SELECT COALESCE(request_count, 0) FROM rate_counters WHERE wxid = ?1 AND window_start = ?2",
        )
        .bind(wxid)
        .bind(&window)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        if minute_count >= max_per_minute {
            return Ok(RateDecision::deny(format!(
                "Rate limit exceeded: max {max_per_minute} requests per minute."
            )));
        }

        let day_count: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(request_count), 0) FROM rate_counters WHERE wxid = ?1 AND window_start LIKE ?2",
        )
        .bind(wxid)
        .bind(format!("{day_prefix}%"))
        .fetch_one(&self.pool)
        .await?;

        if day_count >= max_per_day {
            return Ok(RateDecision::deny(format!(
                "Rate limit exceeded: max {max_per_day} requests per day."
            )));
        }

        sqlx::query(
            "INSERT INTO rate_counters (wxid, window_start, request_count) VALUES (?1, ?2, 1) \
             ON CONFLICT(wxid, window_start) DO UPDATE SET request_count = request_count + 1",
        )
        .bind(wxid)
        .bind(&window)
        .execute(&self.pool)
        .await?;

        Ok(RateDecision::allow())
    }

    /// Delete counters whose minute window is older than one day.
    pub async fn rate_cleanup(&self) -> Result<u64> {
        let cutoff = (now() - chrono::Duration::days(1))
            .format("%Y-%m-%d %H:%M:00")
            .to_string();
        let result = sqlx::query("DELETE FROM rate_counters WHERE window_start < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_minute_limit_denies_unconditionally() {
        let store = Store::open_in_memory().await.unwrap();
        let decision = store.rate_check_and_increment("u1", 0, 200).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn zero_day_limit_denies_unconditionally() {
        let store = Store::open_in_memory().await.unwrap();
        let decision = store.rate_check_and_increment("u1", 10, 0).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn admits_up_to_minute_limit_then_denies() {
        let store = Store::open_in_memory().await.unwrap();
        for _ in 0..3 {
            let decision = store.rate_check_and_increment("u1", 3, 10).await.unwrap();
            assert!(decision.allowed);
        }
        let fourth = store.rate_check_and_increment("u1", 3, 10).await.unwrap();
        assert!(!fourth.allowed);
        assert!(fourth.reason.unwrap().contains("minute"));
    }

    #[tokio::test]
    async fn distinguishes_minute_and_day_denial_reasons() {
        let store = Store::open_in_memory().await.unwrap();
        // Exhaust the day limit directly via repeated minute-window inserts
        // is impractical in a single real minute, so validate the day path
        // by driving the day limit below what the minute limit would allow.
        for _ in 0..2 {
            let decision = store.rate_check_and_increment("u1", 10, 2).await.unwrap();
            assert!(decision.allowed);
        }
        let third = store.rate_check_and_increment("u1", 10, 2).await.unwrap();
        assert!(!third.allowed);
        assert!(third.reason.unwrap().contains("day"));
    }

    #[tokio::test]
    async fn independent_users_have_independent_counters() {
        let store = Store::open_in_memory().await.unwrap();
        for _ in 0..3 {
            assert!(
                store
                    .rate_check_and_increment("u1", 3, 10)
                    .await
                    .unwrap()
                    .allowed
            );
        }
        assert!(
            store
                .rate_check_and_increment("u2", 3, 10)
                .await
                .unwrap()
                .allowed
        );
    }
}
