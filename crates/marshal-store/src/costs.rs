use chrono::Utc;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// Aggregated cost records per project and day. The numbers originate from
/// external provider polling; the store only keeps the totals the
/// kill-on-cost policy consumes.
pub struct CostRepo {
    db: Database,
}

impl CostRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(project, provider, amount_usd))]
    pub fn record(
        &self,
        project: &str,
        provider: &str,
        amount_usd: f64,
        day: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO costs (project, provider, amount_usd, day, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![project, provider, amount_usd, day, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Sum of all cost records for a project on the given day.
    pub fn daily_total(&self, project: &str, day: &str) -> Result<f64, StoreError> {
        self.db.with_conn(|conn| {
            let total: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount_usd), 0.0) FROM costs WHERE project = ?1 AND day = ?2",
                rusqlite::params![project, day],
                |row| row.get(0),
            )?;
            Ok(total)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_total() {
        let repo = CostRepo::new(Database::in_memory().unwrap());
        repo.record("api", "anthropic", 5.0, "2026-08-31").unwrap();
        repo.record("api", "anthropic", 2.5, "2026-08-31").unwrap();
        repo.record("api", "anthropic", 9.0, "2026-08-30").unwrap();
        repo.record("web", "anthropic", 1.0, "2026-08-31").unwrap();
        let total = repo.daily_total("api", "2026-08-31").unwrap();
        assert!((total - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_total_is_zero() {
        let repo = CostRepo::new(Database::in_memory().unwrap());
        assert_eq!(repo.daily_total("nothing", "2026-08-31").unwrap(), 0.0);
    }
}
