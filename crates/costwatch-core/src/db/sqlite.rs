//! SQLite state store: sync watermarks, alert rules and notification state

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::alerting::AlertRepository;
use crate::error::{Error, Result};
use crate::models::AlertRule;

use super::WatermarkStore;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_state (
        service TEXT NOT NULL,
        metric TEXT NOT NULL,
        last_synced_ms INTEGER NOT NULL,
        PRIMARY KEY (service, metric)
    )",
    "CREATE TABLE IF NOT EXISTS alert_rules (
        service TEXT NOT NULL,
        metric TEXT NOT NULL,
        threshold REAL NOT NULL,
        updated_ms INTEGER NOT NULL,
        PRIMARY KEY (service, metric)
    )",
    "CREATE TABLE IF NOT EXISTS notifications (
        service TEXT NOT NULL,
        metric TEXT NOT NULL,
        last_notified_ms INTEGER NOT NULL,
        PRIMARY KEY (service, metric)
    )",
];

/// Relational state shared by the sync engine and the alerting pipeline
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (or create) the database file and run migrations
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        info!(path = %path.display(), "Opened state store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::internal(format!("stored timestamp out of range: {ms}")))
}

#[async_trait]
impl WatermarkStore for SqliteStateStore {
    async fn get(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_synced_ms FROM sync_state WHERE service = ? AND metric = ?",
        )
        .bind(service)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let ms: i64 = row.try_get("last_synced_ms")?;
                // a zero watermark predates any real sync
                if ms == 0 {
                    return Ok(None);
                }
                Ok(Some(from_millis(ms)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_state (service, metric, last_synced_ms) VALUES (?, ?, ?)
             ON CONFLICT (service, metric) DO UPDATE
             SET last_synced_ms = excluded.last_synced_ms
             WHERE excluded.last_synced_ms > sync_state.last_synced_ms",
        )
        .bind(service)
        .bind(metric)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for SqliteStateStore {
    async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query(
            "SELECT service, metric, threshold FROM alert_rules ORDER BY service, metric",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AlertRule> {
                Ok(AlertRule {
                    service: row.try_get("service")?,
                    metric: row.try_get("metric")?,
                    threshold: row.try_get("threshold")?,
                })
            })
            .collect()
    }

    async fn upsert_rule(&self, rule: &AlertRule) -> Result<()> {
        rule.validate()?;
        sqlx::query(
            "INSERT INTO alert_rules (service, metric, threshold, updated_ms) VALUES (?, ?, ?, ?)
             ON CONFLICT (service, metric) DO UPDATE
             SET threshold = excluded.threshold, updated_ms = excluded.updated_ms",
        )
        .bind(&rule.service)
        .bind(&rule.metric)
        .bind(rule.threshold)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_last_notified(&self, service: &str, metric: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_notified_ms FROM notifications WHERE service = ? AND metric = ?",
        )
        .bind(service)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| from_millis(row.try_get("last_notified_ms")?))
            .transpose()
    }

    async fn set_last_notified(&self, service: &str, metric: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (service, metric, last_notified_ms) VALUES (?, ?, ?)
             ON CONFLICT (service, metric) DO UPDATE
             SET last_notified_ms = excluded.last_notified_ms",
        )
        .bind(service)
        .bind(metric)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn open_temp() -> (tempfile::TempDir, SqliteStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(&dir.path().join("state/costwatch.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn opened_store_is_healthy() {
        let (_dir, store) = open_temp().await;
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn watermark_round_trips_and_never_regresses() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get("svc", "m").await.unwrap(), None);

        store.set("svc", "m", at(10)).await.unwrap();
        assert_eq!(store.get("svc", "m").await.unwrap(), Some(at(10)));

        store.set("svc", "m", at(8)).await.unwrap();
        assert_eq!(store.get("svc", "m").await.unwrap(), Some(at(10)));

        store.set("svc", "m", at(12)).await.unwrap();
        assert_eq!(store.get("svc", "m").await.unwrap(), Some(at(12)));

        // other keys are independent
        assert_eq!(store.get("svc", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn epoch_watermark_reads_as_missing() {
        let (_dir, store) = open_temp().await;
        store
            .set("svc", "m", DateTime::<Utc>::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(store.get("svc", "m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watermarks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costwatch.db");
        {
            let store = SqliteStateStore::open(&path).await.unwrap();
            store.set("svc", "m", at(10)).await.unwrap();
        }
        let store = SqliteStateStore::open(&path).await.unwrap();
        assert_eq!(store.get("svc", "m").await.unwrap(), Some(at(10)));
    }

    #[tokio::test]
    async fn rules_upsert_last_write_wins() {
        let (_dir, store) = open_temp().await;
        store
            .upsert_rule(&AlertRule::new("svc", "m", 1.0))
            .await
            .unwrap();
        store
            .upsert_rule(&AlertRule::new("svc", "m", 2.0))
            .await
            .unwrap();
        store
            .upsert_rule(&AlertRule::new("alpha", "m", 0.5))
            .await
            .unwrap();

        let rules = store.list_rules().await.unwrap();
        assert_eq!(
            rules,
            vec![AlertRule::new("alpha", "m", 0.5), AlertRule::new("svc", "m", 2.0)]
        );
    }

    #[tokio::test]
    async fn invalid_rule_is_rejected() {
        let (_dir, store) = open_temp().await;
        let err = store
            .upsert_rule(&AlertRule::new("", "m", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_notified_round_trips() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get_last_notified("svc", "m").await.unwrap(), None);
        store.set_last_notified("svc", "m", at(3)).await.unwrap();
        store.set_last_notified("svc", "m", at(4)).await.unwrap();
        assert_eq!(store.get_last_notified("svc", "m").await.unwrap(), Some(at(4)));
    }
}
