use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use mathstar_core::{
    local_date, now_utc, AnswerInput, AnswerOutcome, AnswerRecord, CollectionSummary, DrawOutcome,
    GachaCatalog, RewardError, RewardPolicy, RewardSummary, StreakState, StreakUpdate, StudentId,
    StudentStats,
};
use mathstar_store_sqlite::SqliteRewardStore;
use time::{Date, UtcOffset};

/// Blocking facade over the store. Each call opens its own connection against
/// an already migrated database.
#[derive(Debug, Clone)]
pub struct RewardApi {
    db_path: PathBuf,
    policy: RewardPolicy,
    catalog: Arc<GachaCatalog>,
    utc_offset: UtcOffset,
    deadline: Option<Instant>,
}

impl RewardApi {
    /// # Errors
    /// Returns [`RewardError::Configuration`] when the policy is invalid.
    pub fn new(
        db_path: PathBuf,
        policy: RewardPolicy,
        utc_offset: UtcOffset,
    ) -> Result<Self, RewardError> {
        policy.validate()?;
        Ok(Self {
            db_path,
            policy,
            catalog: Arc::new(GachaCatalog::standard()),
            utc_offset,
            deadline: None,
        })
    }

    /// Copy whose writes roll back instead of committing after `deadline`.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    #[must_use]
    pub fn catalog(&self) -> &GachaCatalog {
        &self.catalog
    }

    /// Calendar day used for streak bookkeeping.
    #[must_use]
    pub fn today(&self) -> Date {
        local_date(now_utc(), self.utc_offset)
    }

    fn store(&self) -> Result<SqliteRewardStore> {
        let store = SqliteRewardStore::open(&self.db_path)?.with_policy(self.policy)?;
        match self.deadline {
            Some(deadline) => store.with_deadline(deadline),
            None => Ok(store),
        }
    }

    /// Creates or upgrades the schema. Run once before serving requests.
    pub fn migrate(&self) -> Result<()> {
        SqliteRewardStore::open(&self.db_path)?
            .migrate()
            .with_context(|| format!("failed to migrate database at {}", self.db_path.display()))
    }

    /// Records the answer and marks today as a practice day in one transaction.
    pub fn record_answer(&self, student: StudentId, input: &AnswerInput) -> Result<AnswerOutcome> {
        self.store()?
            .record_answer_with_practice(student, input, self.today())
    }

    pub fn recent_answers(
        &self,
        student: StudentId,
        limit: Option<usize>,
    ) -> Result<Vec<AnswerRecord>> {
        self.store()?.recent_answers(student, limit)
    }

    pub fn rewards(&self, student: StudentId) -> Result<RewardSummary> {
        Ok(self.store()?.get_rewards(student)?.summary())
    }

    pub fn record_practice(&self, student: StudentId) -> Result<StreakUpdate> {
        self.store()?.record_practice(student, self.today())
    }

    pub fn streak(&self, student: StudentId) -> Result<StreakState> {
        self.store()?.get_streak(student)
    }

    pub fn draw(&self, student: StudentId) -> Result<DrawOutcome> {
        let mut rng = rand::rng();
        self.store()?.draw(student, &self.catalog, &mut rng)
    }

    pub fn collection(&self, student: StudentId) -> Result<CollectionSummary> {
        self.store()?.collection_summary(student, &self.catalog)
    }

    pub fn stats(&self, student: StudentId) -> Result<StudentStats> {
        self.store()?.student_stats(student)
    }
}
