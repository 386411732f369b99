#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use mathstar_core::{
    format_iso_date, format_rfc3339, now_utc, parse_iso_date, parse_rfc3339_utc,
    rounded_percentage, AnswerDetails, AnswerInput, AnswerOutcome, AnswerRecord, CollectionRecord,
    CollectionSummary, DrawOutcome, GachaCatalog, QuestionType, QuestionTypeProgress, Rarity,
    RewardError, RewardLedger, RewardPolicy, StreakState, StreakTransition, StreakUpdate,
    StudentId, StudentStats, MASTERY_WINDOW,
};
use rand::Rng;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use ulid::Ulid;

const REWARD_MIGRATION_VERSION: i64 = 1;

pub const DEFAULT_RECENT_ANSWERS: usize = 20;
pub const MAX_RECENT_ANSWERS: usize = 200;

const SCHEMA_REWARDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS students (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reward_ledgers (
  student_id INTEGER PRIMARY KEY,
  stars INTEGER NOT NULL DEFAULT 0 CHECK (stars >= 0),
  total_correct INTEGER NOT NULL DEFAULT 0 CHECK (total_correct >= 0),
  total_questions INTEGER NOT NULL DEFAULT 0,
  last_updated TEXT NOT NULL,
  CHECK (total_questions >= total_correct),
  FOREIGN KEY (student_id) REFERENCES students(id)
);

CREATE TABLE IF NOT EXISTS streak_states (
  student_id INTEGER PRIMARY KEY,
  streak_days INTEGER NOT NULL DEFAULT 0 CHECK (streak_days >= 0),
  longest_streak INTEGER NOT NULL DEFAULT 0,
  last_practice_date TEXT,
  total_practice_days INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL,
  CHECK (longest_streak >= streak_days),
  CHECK (total_practice_days >= streak_days),
  FOREIGN KEY (student_id) REFERENCES students(id)
);

CREATE TABLE IF NOT EXISTS collection_records (
  record_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  student_id INTEGER NOT NULL,
  item_id TEXT NOT NULL,
  item_name TEXT NOT NULL,
  item_glyph TEXT NOT NULL,
  rarity TEXT NOT NULL CHECK (rarity IN ('common', 'rare', 'epic', 'legendary')),
  collected_at TEXT NOT NULL,
  FOREIGN KEY (student_id) REFERENCES students(id)
);

CREATE TRIGGER IF NOT EXISTS trg_collection_records_no_update
BEFORE UPDATE ON collection_records
BEGIN
  SELECT RAISE(FAIL, 'collection_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_collection_records_no_delete
BEFORE DELETE ON collection_records
BEGIN
  SELECT RAISE(FAIL, 'collection_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_collection_records_student_seq
  ON collection_records(student_id, record_seq);

CREATE TABLE IF NOT EXISTS answer_records (
  answer_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  student_id INTEGER NOT NULL,
  is_correct INTEGER NOT NULL CHECK (is_correct IN (0, 1)),
  question_type TEXT CHECK (
    question_type IN ('addition', 'subtraction', 'compare', 'counting', 'missing_number')
    OR question_type IS NULL
  ),
  difficulty INTEGER CHECK (difficulty BETWEEN 1 AND 4 OR difficulty IS NULL),
  question TEXT,
  correct_answer TEXT,
  user_answer TEXT,
  time_spent_ms INTEGER CHECK (time_spent_ms >= 0 OR time_spent_ms IS NULL),
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (student_id) REFERENCES students(id)
);

CREATE TRIGGER IF NOT EXISTS trg_answer_records_no_update
BEFORE UPDATE ON answer_records
BEGIN
  SELECT RAISE(FAIL, 'answer_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_answer_records_no_delete
BEFORE DELETE ON answer_records
BEGIN
  SELECT RAISE(FAIL, 'answer_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_answer_records_student_seq
  ON answer_records(student_id, answer_seq);
";

pub struct SqliteRewardStore {
    conn: Connection,
    policy: RewardPolicy,
    deadline: Option<Instant>,
}

impl SqliteRewardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            policy: RewardPolicy::standard(),
            deadline: None,
        })
    }

    /// Replaces the reward economy used by answer and draw operations.
    pub fn with_policy(mut self, policy: RewardPolicy) -> Result<Self> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    #[must_use]
    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Bounds every later write by `deadline`.
    ///
    /// Lock waits are capped at the remaining time, and a transaction that is
    /// still open when the deadline passes is rolled back instead of committed.
    /// Either case fails with [`RewardError::DeadlineExceeded`].
    pub fn with_deadline(mut self, deadline: Instant) -> Result<Self> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(deadline_exceeded("before opening a transaction").into());
        }
        self.conn
            .busy_timeout(remaining)
            .context("failed to configure sqlite busy timeout")?;
        self.deadline = Some(deadline);
        Ok(self)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REWARDS_V1)
            .context("failed to apply reward schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REWARD_MIGRATION_VERSION, now],
            )
            .context("failed to register reward schema migration")?;

        Ok(())
    }

    /// Applies one answer to the ledger and appends it to the answer log.
    pub fn record_answer(
        &mut self,
        student_id: StudentId,
        input: &AnswerInput,
    ) -> Result<RewardLedger> {
        input.validate()?;

        let now = format_rfc3339(now_utc())?;
        let tx = begin_immediate(&mut self.conn, self.deadline)?;
        ensure_student(&tx, student_id, &now)?;

        let ledger = apply_answer(&tx, student_id, input, &self.policy, &now)?;
        commit(tx, self.deadline, "answer")?;

        tracing::debug!(
            student_id = student_id.0,
            is_correct = input.is_correct,
            stars = ledger.stars,
            "answer recorded"
        );

        Ok(ledger)
    }

    /// Records an answer and marks `today` as practiced in one transaction.
    /// Either both the ledger and the streak change, or neither does.
    pub fn record_answer_with_practice(
        &mut self,
        student_id: StudentId,
        input: &AnswerInput,
        today: time::Date,
    ) -> Result<AnswerOutcome> {
        input.validate()?;

        let now = format_rfc3339(now_utc())?;
        let tx = begin_immediate(&mut self.conn, self.deadline)?;
        ensure_student(&tx, student_id, &now)?;

        let ledger = apply_answer(&tx, student_id, input, &self.policy, &now)?;
        let streak = advance_streak(&tx, student_id, today, &now)?;
        commit(tx, self.deadline, "answer")?;

        tracing::debug!(
            student_id = student_id.0,
            is_correct = input.is_correct,
            stars = ledger.stars,
            transition = streak.transition.as_str(),
            "answer and practice recorded"
        );

        Ok(AnswerOutcome {
            rewards: ledger.summary(),
            streak,
        })
    }

    /// Deducts stars with a single conditional update; nothing changes on failure.
    pub fn spend_stars(&mut self, student_id: StudentId, amount: u32) -> Result<RewardLedger> {
        let now = format_rfc3339(now_utc())?;
        let tx = begin_immediate(&mut self.conn, self.deadline)?;
        ensure_student(&tx, student_id, &now)?;

        let ledger = deduct_stars(&tx, student_id, amount, &now)?;
        commit(tx, self.deadline, "spend")?;

        tracing::info!(
            student_id = student_id.0,
            amount,
            stars = ledger.stars,
            "stars spent"
        );

        Ok(ledger)
    }

    pub fn get_rewards(&self, student_id: StudentId) -> Result<RewardLedger> {
        let ledger = self
            .conn
            .query_row(
                "SELECT student_id, stars, total_correct, total_questions
                 FROM reward_ledgers WHERE student_id = ?1",
                params![student_id.0],
                parse_ledger_row,
            )
            .optional()
            .context("failed to load reward ledger")?;

        Ok(ledger.unwrap_or_else(|| RewardLedger::empty(student_id)))
    }

    /// Advances the daily streak for `today`. Same-day calls leave the row untouched.
    pub fn record_practice(
        &mut self,
        student_id: StudentId,
        today: time::Date,
    ) -> Result<StreakUpdate> {
        let now = format_rfc3339(now_utc())?;
        let tx = begin_immediate(&mut self.conn, self.deadline)?;
        ensure_student(&tx, student_id, &now)?;

        let update = advance_streak(&tx, student_id, today, &now)?;
        commit(tx, self.deadline, "streak")?;

        tracing::debug!(
            student_id = student_id.0,
            transition = update.transition.as_str(),
            streak_days = update.state.streak_days,
            "practice recorded"
        );

        Ok(update)
    }

    pub fn get_streak(&self, student_id: StudentId) -> Result<StreakState> {
        Ok(load_streak(&self.conn, student_id)?.unwrap_or_else(|| StreakState::empty(student_id)))
    }

    /// Spends the gacha cost, draws one item and appends it to the collection
    /// in a single transaction.
    pub fn draw<R: Rng + ?Sized>(
        &mut self,
        student_id: StudentId,
        catalog: &GachaCatalog,
        rng: &mut R,
    ) -> Result<DrawOutcome> {
        let cost = self.policy.gacha_cost;
        let collected_at = now_utc();
        let now = format_rfc3339(collected_at)?;
        let tx = begin_immediate(&mut self.conn, self.deadline)?;
        ensure_student(&tx, student_id, &now)?;

        let ledger = deduct_stars(&tx, student_id, cost, &now)?;
        let item = catalog.draw(rng)?;
        let record = CollectionRecord::for_item(student_id, &item, collected_at);

        tx.execute(
            "INSERT INTO collection_records(
                record_id, student_id, item_id, item_name, item_glyph, rarity, collected_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.record_id.to_string(),
                student_id.0,
                record.item_id,
                record.item_name,
                record.item_glyph,
                record.rarity.as_str(),
                now,
            ],
        )
        .context("failed to append collection record")?;

        if let Err(err) = commit(tx, self.deadline, "gacha draw") {
            tracing::error!(
                student_id = student_id.0,
                item_id = item.id,
                error = %err,
                "gacha draw rolled back"
            );
            return Err(err);
        }

        tracing::info!(
            student_id = student_id.0,
            item_id = item.id,
            rarity = item.rarity.as_str(),
            stars = ledger.stars,
            "gacha draw committed"
        );

        Ok(DrawOutcome {
            item,
            record,
            rewards: ledger.summary(),
        })
    }

    /// Collection records for the student, newest first.
    pub fn get_collection(&self, student_id: StudentId) -> Result<Vec<CollectionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_id, student_id, item_id, item_name, item_glyph, rarity, collected_at
                 FROM collection_records
                 WHERE student_id = ?1
                 ORDER BY record_seq DESC",
            )
            .context("failed to prepare collection query")?;

        let rows = stmt
            .query_map(params![student_id.0], parse_collection_row)
            .context("failed to query collection records")?;
        collect_rows(rows).context("failed to read collection records")
    }

    pub fn collection_summary(
        &self,
        student_id: StudentId,
        catalog: &GachaCatalog,
    ) -> Result<CollectionSummary> {
        let collections = self.get_collection(student_id)?;
        let progress = catalog.progress(collections.iter().map(|record| record.item_id.as_str()));
        Ok(CollectionSummary {
            collections,
            progress,
        })
    }

    /// Most recent answers first. `limit` defaults to [`DEFAULT_RECENT_ANSWERS`].
    pub fn recent_answers(
        &self,
        student_id: StudentId,
        limit: Option<usize>,
    ) -> Result<Vec<AnswerRecord>> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_ANSWERS);
        if limit == 0 || limit > MAX_RECENT_ANSWERS {
            return Err(RewardError::Validation(format!(
                "limit MUST be in [1, {MAX_RECENT_ANSWERS}]"
            ))
            .into());
        }
        let limit = i64::try_from(limit).with_context(|| format!("invalid limit: {limit}"))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT
                    answer_seq, student_id, is_correct, question_type, difficulty,
                    question, correct_answer, user_answer, time_spent_ms, recorded_at
                 FROM answer_records
                 WHERE student_id = ?1
                 ORDER BY answer_seq DESC
                 LIMIT ?2",
            )
            .context("failed to prepare recent answers query")?;

        let rows = stmt
            .query_map(params![student_id.0, limit], parse_answer_row)
            .context("failed to query answer records")?;
        collect_rows(rows).context("failed to read answer records")
    }

    /// Per question type totals, latest difficulty and recent mastery,
    /// ordered by question type. Answers without details are not counted.
    pub fn progress_by_type(&self, student_id: StudentId) -> Result<Vec<QuestionTypeProgress>> {
        let mut stmt = self
            .conn
            .prepare(
                "WITH ranked AS (
                    SELECT
                        question_type, is_correct, difficulty, recorded_at,
                        ROW_NUMBER() OVER (
                            PARTITION BY question_type ORDER BY answer_seq DESC
                        ) AS recency
                    FROM answer_records
                    WHERE student_id = ?1 AND question_type IS NOT NULL
                 )
                 SELECT
                    question_type,
                    COUNT(*),
                    SUM(is_correct),
                    SUM(CASE WHEN recency <= ?2 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN recency <= ?2 THEN is_correct ELSE 0 END),
                    MAX(CASE WHEN recency = 1 THEN difficulty END),
                    MAX(CASE WHEN recency = 1 THEN recorded_at END)
                 FROM ranked
                 GROUP BY question_type
                 ORDER BY question_type",
            )
            .context("failed to prepare progress query")?;

        let rows = stmt
            .query_map(
                params![student_id.0, i64::from(MASTERY_WINDOW)],
                parse_progress_row,
            )
            .context("failed to query progress by question type")?;
        collect_rows(rows).context("failed to read progress by question type")
    }

    /// Rewards, streak, per type progress and the default page of recent answers.
    pub fn student_stats(&self, student_id: StudentId) -> Result<StudentStats> {
        Ok(StudentStats {
            rewards: self.get_rewards(student_id)?.summary(),
            streak: self.get_streak(student_id)?,
            progress_by_type: self.progress_by_type(student_id)?,
            recent_answers: self.recent_answers(student_id, None)?,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn begin_immediate(conn: &mut Connection, deadline: Option<Instant>) -> Result<Transaction<'_>> {
    match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(tx) => Ok(tx),
        Err(err) if deadline.is_some() && is_busy(&err) => {
            Err(anyhow::Error::new(err).context(deadline_exceeded("waiting for the write lock")))
        }
        Err(err) => Err(anyhow!(err).context("failed to start immediate transaction")),
    }
}

/// Commits unless the deadline has passed; dropping `tx` rolls it back.
fn commit(tx: Transaction<'_>, deadline: Option<Instant>, what: &str) -> Result<()> {
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(deadline_exceeded(&format!("{what} rolled back before commit")).into());
    }
    tx.commit()
        .with_context(|| format!("failed to commit {what} transaction"))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn deadline_exceeded(stage: &str) -> RewardError {
    RewardError::DeadlineExceeded(stage.to_string())
}

fn apply_answer(
    tx: &Transaction<'_>,
    student_id: StudentId,
    input: &AnswerInput,
    policy: &RewardPolicy,
    now: &str,
) -> Result<RewardLedger> {
    let stars = if input.is_correct {
        i64::from(policy.stars_per_correct)
    } else {
        0
    };
    let ledger = tx
        .query_row(
            "UPDATE reward_ledgers SET
               total_questions = MIN(total_questions + 1, ?1),
               total_correct = MIN(total_correct + ?2, ?1),
               stars = MIN(stars + ?3, ?1),
               last_updated = ?4
             WHERE student_id = ?5
             RETURNING student_id, stars, total_correct, total_questions",
            params![
                i64::from(u32::MAX),
                i64::from(input.is_correct),
                stars,
                now,
                student_id.0,
            ],
            parse_ledger_row,
        )
        .context("failed to update reward ledger")?;

    insert_answer_record(tx, student_id, input, now)?;
    Ok(ledger)
}

fn advance_streak(
    tx: &Transaction<'_>,
    student_id: StudentId,
    today: time::Date,
    now: &str,
) -> Result<StreakUpdate> {
    let current = load_streak(tx, student_id)?
        .ok_or_else(|| RewardError::NotFound(format!("streak row for student {student_id}")))?;
    let update = current.advance(today);
    update.state.check_invariants()?;

    if update.transition != StreakTransition::Unchanged {
        let last_practice_date = update
            .state
            .last_practice_date
            .map(format_iso_date)
            .transpose()?;
        tx.execute(
            "UPDATE streak_states SET
               streak_days = ?1,
               longest_streak = ?2,
               last_practice_date = ?3,
               total_practice_days = ?4,
               updated_at = ?5
             WHERE student_id = ?6",
            params![
                i64::from(update.state.streak_days),
                i64::from(update.state.longest_streak),
                last_practice_date,
                i64::from(update.state.total_practice_days),
                now,
                student_id.0,
            ],
        )
        .context("failed to update streak state")?;
    }

    Ok(update)
}

fn ensure_student(tx: &Transaction<'_>, student_id: StudentId, now: &str) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO students(id, name, created_at) VALUES (?1, ?2, ?3)",
        params![student_id.0, format!("student-{student_id}"), now],
    )
    .context("failed to ensure student row")?;

    tx.execute(
        "INSERT OR IGNORE INTO reward_ledgers(student_id, stars, total_correct, total_questions, last_updated)
         VALUES (?1, 0, 0, 0, ?2)",
        params![student_id.0, now],
    )
    .context("failed to ensure reward ledger row")?;

    tx.execute(
        "INSERT OR IGNORE INTO streak_states(
            student_id, streak_days, longest_streak, last_practice_date, total_practice_days, updated_at
         ) VALUES (?1, 0, 0, NULL, 0, ?2)",
        params![student_id.0, now],
    )
    .context("failed to ensure streak state row")?;

    Ok(())
}

fn deduct_stars(
    tx: &Transaction<'_>,
    student_id: StudentId,
    amount: u32,
    now: &str,
) -> Result<RewardLedger> {
    if amount == 0 {
        return Err(RewardError::Validation("spend amount MUST be >= 1".to_string()).into());
    }

    let updated = tx
        .query_row(
            "UPDATE reward_ledgers SET stars = stars - ?1, last_updated = ?2
             WHERE student_id = ?3 AND stars >= ?1
             RETURNING student_id, stars, total_correct, total_questions",
            params![i64::from(amount), now, student_id.0],
            parse_ledger_row,
        )
        .optional()
        .context("failed to deduct stars")?;

    if let Some(ledger) = updated {
        return Ok(ledger);
    }

    let balance = tx
        .query_row(
            "SELECT student_id, stars, total_correct, total_questions
             FROM reward_ledgers WHERE student_id = ?1",
            params![student_id.0],
            parse_ledger_row,
        )
        .optional()
        .context("failed to load reward ledger")?
        .map_or(0, |ledger| ledger.stars);

    Err(RewardError::InsufficientFunds {
        balance,
        required: amount,
    }
    .into())
}

fn load_streak(conn: &Connection, student_id: StudentId) -> Result<Option<StreakState>> {
    conn.query_row(
        "SELECT student_id, streak_days, longest_streak, last_practice_date, total_practice_days
         FROM streak_states WHERE student_id = ?1",
        params![student_id.0],
        parse_streak_row,
    )
    .optional()
    .context("failed to load streak state")
}

fn insert_answer_record(
    tx: &Transaction<'_>,
    student_id: StudentId,
    input: &AnswerInput,
    now: &str,
) -> Result<()> {
    let details = input.details.as_ref();
    tx.execute(
        "INSERT INTO answer_records(
            student_id, is_correct, question_type, difficulty,
            question, correct_answer, user_answer, time_spent_ms, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            student_id.0,
            bool_to_sql(input.is_correct),
            details.map(|d| d.question_type.as_str()),
            details.map(|d| i64::from(d.difficulty)),
            details.map(|d| d.question.as_str()),
            details.map(|d| d.correct_answer.as_str()),
            details.map(|d| d.user_answer.as_str()),
            details.map(|d| i64::from(d.time_spent_ms)),
            now,
        ],
    )
    .context("failed to append answer record")?;
    Ok(())
}

fn parse_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardLedger> {
    Ok(RewardLedger {
        student_id: StudentId(row.get(0)?),
        stars: u32_column(row, 1, "stars")?,
        total_correct: u32_column(row, 2, "total_correct")?,
        total_questions: u32_column(row, 3, "total_questions")?,
    })
}

fn parse_streak_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreakState> {
    let last_practice_date = row
        .get::<_, Option<String>>(3)?
        .as_deref()
        .map(parse_iso_date)
        .transpose()
        .map_err(|err| to_sql_error(3, &err))?;

    Ok(StreakState {
        student_id: StudentId(row.get(0)?),
        streak_days: u32_column(row, 1, "streak_days")?,
        longest_streak: u32_column(row, 2, "longest_streak")?,
        last_practice_date,
        total_practice_days: u32_column(row, 4, "total_practice_days")?,
    })
}

fn parse_collection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionRecord> {
    let record_id_raw: String = row.get(0)?;
    let rarity_raw: String = row.get(5)?;

    let record_id = Ulid::from_string(&record_id_raw)
        .map_err(|_| invalid_data(0, format!("invalid record_id ULID: {record_id_raw}")))?;
    let rarity = Rarity::parse(&rarity_raw)
        .ok_or_else(|| invalid_data(5, format!("invalid rarity: {rarity_raw}")))?;
    let collected_at =
        parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(|err| to_sql_error(6, &err))?;

    Ok(CollectionRecord {
        record_id,
        student_id: StudentId(row.get(1)?),
        item_id: row.get(2)?,
        item_name: row.get(3)?,
        item_glyph: row.get(4)?,
        rarity,
        collected_at,
    })
}

fn parse_answer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnswerRecord> {
    let question_type_raw: Option<String> = row.get(3)?;
    let recorded_at =
        parse_rfc3339_utc(&row.get::<_, String>(9)?).map_err(|err| to_sql_error(9, &err))?;

    let details = match question_type_raw {
        Some(raw) => {
            let question_type = QuestionType::parse(&raw)
                .ok_or_else(|| invalid_data(3, format!("invalid question_type: {raw}")))?;
            let difficulty_i64: i64 = row.get(4)?;
            let difficulty = u8::try_from(difficulty_i64)
                .map_err(|_| invalid_data(4, format!("invalid difficulty: {difficulty_i64}")))?;
            Some(AnswerDetails {
                question_type,
                difficulty,
                question: row.get(5)?,
                correct_answer: row.get(6)?,
                user_answer: row.get(7)?,
                time_spent_ms: u32_column(row, 8, "time_spent_ms")?,
            })
        }
        None => None,
    };

    Ok(AnswerRecord {
        answer_seq: row.get(0)?,
        student_id: StudentId(row.get(1)?),
        is_correct: row.get::<_, i64>(2)? == 1,
        details,
        recorded_at,
    })
}

fn parse_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuestionTypeProgress> {
    let question_type_raw: String = row.get(0)?;
    let question_type = QuestionType::parse(&question_type_raw)
        .ok_or_else(|| invalid_data(0, format!("invalid question_type: {question_type_raw}")))?;
    let attempts = u32_column(row, 1, "attempts")?;
    let correct = u32_column(row, 2, "correct")?;
    let recent_attempts = u32_column(row, 3, "recent_attempts")?;
    let recent_correct = u32_column(row, 4, "recent_correct")?;
    let difficulty_i64: i64 = row.get(5)?;
    let current_difficulty = u8::try_from(difficulty_i64)
        .map_err(|_| invalid_data(5, format!("invalid difficulty: {difficulty_i64}")))?;
    let last_practiced =
        parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(|err| to_sql_error(6, &err))?;

    Ok(QuestionTypeProgress {
        question_type,
        attempts,
        correct,
        accuracy: rounded_percentage(u64::from(correct), u64::from(attempts)),
        current_difficulty,
        mastery: rounded_percentage(u64::from(recent_correct), u64::from(recent_attempts)),
        last_practiced,
    })
}

fn u32_column(row: &rusqlite::Row<'_>, idx: usize, name: &str) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|_| invalid_data(idx, format!("invalid {name}: {raw}")))
}

fn invalid_data(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(idx: usize, err: &RewardError) -> rusqlite::Error {
    invalid_data(idx, err.to_string())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use mathstar_core::MAX_DIFFICULTY;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;
    use time::macros::date;

    const STUDENT: StudentId = StudentId::DEFAULT;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteRewardStore {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn reward_error(result: Result<impl std::fmt::Debug>) -> RewardError {
        let err = match result {
            Ok(value) => panic!("expected an error, got {value:?}"),
            Err(err) => err,
        };
        match err.downcast_ref::<RewardError>() {
            Some(value) => value.clone(),
            None => panic!("expected RewardError, got: {err:#}"),
        }
    }

    fn answer_correct(store: &mut SqliteRewardStore, count: usize) {
        for _ in 0..count {
            let _ = must(store.record_answer(STUDENT, &AnswerInput::bare(true)));
        }
    }

    fn count_rows(store: &SqliteRewardStore, table: &str) -> i64 {
        match store.connection().query_row(
            &format!("SELECT COUNT(*) FROM {table}"),
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count {table}: {err}"),
        }
    }

    fn temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mathstar-{label}-{}.sqlite3", Ulid::new()))
    }

    fn detailed_answer(is_correct: bool, question: &str) -> AnswerInput {
        AnswerInput {
            is_correct,
            details: Some(AnswerDetails {
                question_type: QuestionType::Subtraction,
                difficulty: 2,
                question: question.to_string(),
                correct_answer: "4".to_string(),
                user_answer: if is_correct { "4" } else { "5" }.to_string(),
                time_spent_ms: 3_100,
            }),
        }
    }

    #[test]
    fn reads_default_to_zero_for_unknown_student() {
        let store = fixture_store();
        let ledger = must(store.get_rewards(StudentId(42)));
        assert_eq!(ledger, RewardLedger::empty(StudentId(42)));
        assert_eq!(ledger.accuracy(), 0);

        let streak = must(store.get_streak(StudentId(42)));
        assert_eq!(streak, StreakState::empty(StudentId(42)));
        assert!(must(store.get_collection(StudentId(42))).is_empty());
        assert_eq!(count_rows(&store, "students"), 0);
    }

    #[test]
    fn record_answer_creates_student_lazily_and_updates_counts() {
        let mut store = fixture_store();

        let first = must(store.record_answer(STUDENT, &AnswerInput::bare(true)));
        assert_eq!(first.stars, 1);
        assert_eq!(first.total_correct, 1);
        assert_eq!(first.total_questions, 1);

        let second = must(store.record_answer(STUDENT, &AnswerInput::bare(false)));
        assert_eq!(second.stars, 1);
        assert_eq!(second.total_correct, 1);
        assert_eq!(second.total_questions, 2);
        assert_eq!(second.accuracy(), 50);

        assert_eq!(must(store.get_rewards(STUDENT)), second);
        assert_eq!(count_rows(&store, "students"), 1);
        assert_eq!(count_rows(&store, "answer_records"), 2);
    }

    #[test]
    fn record_answer_rejects_invalid_details_without_mutation() {
        let mut store = fixture_store();
        let mut input = detailed_answer(true, "9 - 5 = ?");
        if let Some(details) = input.details.as_mut() {
            details.difficulty = MAX_DIFFICULTY + 1;
        }

        assert!(matches!(
            reward_error(store.record_answer(STUDENT, &input)),
            RewardError::Validation(_)
        ));
        assert_eq!(must(store.get_rewards(STUDENT)), RewardLedger::empty(STUDENT));
        assert_eq!(count_rows(&store, "answer_records"), 0);
    }

    #[test]
    fn configured_policy_changes_star_reward_and_cost() {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        let mut store = must(store.with_policy(RewardPolicy {
            stars_per_correct: 5,
            gacha_cost: 15,
        }));
        must(store.migrate());

        answer_correct(&mut store, 3);
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 15);

        let mut rng = StdRng::seed_from_u64(11);
        let outcome = must(store.draw(STUDENT, &GachaCatalog::standard(), &mut rng));
        assert_eq!(outcome.rewards.stars, 0);
    }

    #[test]
    fn zero_gacha_cost_policy_is_rejected() {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        let result = store.with_policy(RewardPolicy {
            stars_per_correct: 1,
            gacha_cost: 0,
        });
        assert!(matches!(
            reward_error(result.map(|_| ())),
            RewardError::Configuration(_)
        ));
    }

    #[test]
    fn spend_stars_is_conditional() {
        let mut store = fixture_store();
        answer_correct(&mut store, 4);

        assert_eq!(
            reward_error(store.spend_stars(STUDENT, 5)),
            RewardError::InsufficientFunds {
                balance: 4,
                required: 5
            }
        );
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 4);

        assert!(matches!(
            reward_error(store.spend_stars(STUDENT, 0)),
            RewardError::Validation(_)
        ));

        let after = must(store.spend_stars(STUDENT, 4));
        assert_eq!(after.stars, 0);
        assert_eq!(after.total_correct, 4);
    }

    #[test]
    fn twelve_correct_answers_buy_exactly_one_draw() {
        let mut store = fixture_store();
        let catalog = GachaCatalog::standard();
        let mut rng = StdRng::seed_from_u64(12);

        answer_correct(&mut store, 12);
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 12);

        let outcome = must(store.draw(STUDENT, &catalog, &mut rng));
        assert_eq!(outcome.rewards.stars, 2);
        assert!(catalog.find(outcome.item.id).is_some());
        assert_eq!(outcome.record.item_id, outcome.item.id);

        assert_eq!(
            reward_error(store.draw(STUDENT, &catalog, &mut rng)),
            RewardError::InsufficientFunds {
                balance: 2,
                required: 10
            }
        );
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 2);
        assert_eq!(must(store.get_collection(STUDENT)).len(), 1);
    }

    #[test]
    fn draw_without_balance_changes_nothing() {
        let mut store = fixture_store();
        answer_correct(&mut store, 9);
        let before = must(store.get_rewards(STUDENT));

        let mut rng = StdRng::seed_from_u64(9);
        let err = reward_error(store.draw(STUDENT, &GachaCatalog::standard(), &mut rng));
        assert!(matches!(err, RewardError::InsufficientFunds { .. }));
        assert_eq!(must(store.get_rewards(STUDENT)), before);
        assert_eq!(count_rows(&store, "collection_records"), 0);
    }

    #[test]
    fn collection_is_newest_first_and_progress_tracks_distinct_items() {
        let mut store = fixture_store();
        let catalog = GachaCatalog::standard();
        let mut rng = StdRng::seed_from_u64(2026);
        answer_correct(&mut store, 60);

        let mut drawn = Vec::new();
        let mut previous_percentage = 0;
        let mut distinct = BTreeSet::new();
        for _ in 0..6 {
            let outcome = must(store.draw(STUDENT, &catalog, &mut rng));
            let is_new = distinct.insert(outcome.item.id);
            drawn.push(outcome.record.record_id);

            let summary = must(store.collection_summary(STUDENT, &catalog));
            assert!(summary.progress.percentage <= 100);
            if is_new {
                assert!(summary.progress.percentage > previous_percentage);
            } else {
                assert_eq!(summary.progress.percentage, previous_percentage);
            }
            previous_percentage = summary.progress.percentage;
        }

        let listed: Vec<Ulid> = must(store.get_collection(STUDENT))
            .into_iter()
            .map(|record| record.record_id)
            .collect();
        drawn.reverse();
        assert_eq!(listed, drawn);
    }

    #[test]
    fn practice_on_days_one_two_four_resets_after_gap() {
        let mut store = fixture_store();
        let days = [date!(2026 - 10 - 01), date!(2026 - 10 - 02), date!(2026 - 10 - 04)];

        let streaks: Vec<u32> = days
            .iter()
            .map(|day| must(store.record_practice(STUDENT, *day)).state.streak_days)
            .collect();
        assert_eq!(streaks, vec![1, 2, 1]);

        let state = must(store.get_streak(STUDENT));
        assert_eq!(state.total_practice_days, 3);
        assert_eq!(state.longest_streak, 2);
        assert_eq!(state.last_practice_date, Some(date!(2026 - 10 - 04)));
    }

    #[test]
    fn practice_is_idempotent_within_a_day() {
        let mut store = fixture_store();
        let first = must(store.record_practice(STUDENT, date!(2026 - 10 - 19)));
        assert_eq!(first.transition, StreakTransition::Started);

        let again = must(store.record_practice(STUDENT, date!(2026 - 10 - 19)));
        assert_eq!(again.transition, StreakTransition::Unchanged);
        assert_eq!(again.state, first.state);
        assert_eq!(must(store.get_streak(STUDENT)), first.state);
    }

    #[test]
    fn answers_are_listed_newest_first_with_details() {
        let mut store = fixture_store();
        let _ = must(store.record_answer(STUDENT, &detailed_answer(true, "9 - 5 = ?")));
        let _ = must(store.record_answer(STUDENT, &AnswerInput::bare(false)));
        let _ = must(store.record_answer(STUDENT, &detailed_answer(false, "8 - 4 = ?")));

        let recent = must(store.recent_answers(STUDENT, Some(2)));
        assert_eq!(recent.len(), 2);
        assert!(recent[0].answer_seq > recent[1].answer_seq);
        assert_eq!(
            recent[0].details.as_ref().map(|d| d.question.as_str()),
            Some("8 - 4 = ?")
        );
        assert!(recent[1].details.is_none());

        let all = must(store.recent_answers(STUDENT, None));
        assert_eq!(all.len(), 3);
        assert!(all[2].is_correct);

        assert!(matches!(
            reward_error(store.recent_answers(STUDENT, Some(MAX_RECENT_ANSWERS + 1))),
            RewardError::Validation(_)
        ));
        assert!(must(store.recent_answers(StudentId(7), None)).is_empty());
    }

    #[test]
    fn students_are_isolated() {
        let mut store = fixture_store();
        answer_correct(&mut store, 3);
        let other = must(store.record_answer(StudentId(2), &AnswerInput::bare(false)));

        assert_eq!(other.stars, 0);
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 3);
        let _ = must(store.record_practice(StudentId(2), date!(2026 - 10 - 19)));
        assert_eq!(must(store.get_streak(STUDENT)), StreakState::empty(STUDENT));
    }

    #[test]
    fn append_only_triggers_block_updates_and_deletes() {
        let mut store = fixture_store();
        answer_correct(&mut store, 10);
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = must(store.draw(STUDENT, &GachaCatalog::standard(), &mut rng));

        let update_result = store.connection().execute(
            "UPDATE collection_records SET item_id = 'crown' WHERE record_id = ?1",
            params![outcome.record.record_id.to_string()],
        );
        assert!(update_result.is_err());

        let delete_result = store
            .connection()
            .execute("DELETE FROM collection_records", []);
        assert!(delete_result.is_err());

        let delete_result = store.connection().execute("DELETE FROM answer_records", []);
        assert!(delete_result.is_err());

        let update_result = store
            .connection()
            .execute("UPDATE answer_records SET is_correct = 0", []);
        assert!(update_result.is_err());

        assert_eq!(count_rows(&store, "collection_records"), 1);
        assert_eq!(count_rows(&store, "answer_records"), 10);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let mut store = fixture_store();
        answer_correct(&mut store, 3);
        let _ = must(store.record_practice(STUDENT, date!(2026 - 10 - 19)));

        must(store.migrate());
        must(store.migrate());

        assert_eq!(must(store.get_rewards(STUDENT)).stars, 3);
        assert_eq!(must(store.get_streak(STUDENT)).streak_days, 1);
        assert_eq!(count_rows(&store, "schema_migrations"), 1);
    }

    #[test]
    fn schema_contains_expected_triggers() {
        let store = fixture_store();
        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN (
                 'trg_collection_records_no_update',
                 'trg_collection_records_no_delete',
                 'trg_answer_records_no_update',
                 'trg_answer_records_no_delete'
               )",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 4);
    }

    #[test]
    fn corrupted_timestamp_is_reported_clearly() {
        let mut store = fixture_store();
        answer_correct(&mut store, 1);
        if let Err(err) = store.connection().execute(
            "INSERT INTO collection_records(record_id, student_id, item_id, item_name, item_glyph, rarity, collected_at)
             VALUES (?1, 1, 'dog', 'Puppy', 'x', 'common', 'not-a-timestamp')",
            params![Ulid::new().to_string()],
        ) {
            panic!("failed to seed corrupted row: {err}");
        }

        let err = match store.get_collection(STUDENT) {
            Ok(_) => panic!("expected corrupted timestamp to fail"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid RFC3339 timestamp"));
    }

    #[test]
    fn concurrent_draws_against_single_draw_balance_yield_one_success() {
        let db_path = temp_db_path("concurrent-draw");
        {
            let mut setup = must(SqliteRewardStore::open(&db_path));
            must(setup.migrate());
            answer_correct(&mut setup, 10);
        }

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2_u64)
            .map(|seed| {
                let path = db_path.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut store = match SqliteRewardStore::open(&path) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open draw store: {err}"),
                    };
                    let mut rng = StdRng::seed_from_u64(seed);
                    barrier.wait();
                    store
                        .draw(STUDENT, &GachaCatalog::standard(), &mut rng)
                        .map_err(|err| err.downcast_ref::<RewardError>().cloned())
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(err) => panic!("draw thread join failed: {err:?}"),
            })
            .collect();

        let successes = results.iter().filter(|result| result.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|result| {
                matches!(
                    result,
                    Err(Some(RewardError::InsufficientFunds {
                        balance: 0,
                        required: 10
                    }))
                )
            })
            .count();
        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);

        let store = must(SqliteRewardStore::open(&db_path));
        assert_eq!(must(store.get_rewards(STUDENT)).stars, 0);
        assert_eq!(must(store.get_collection(STUDENT)).len(), 1);

        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn busy_timeout_allows_answer_after_lock_release() {
        let db_path = temp_db_path("lock");
        let setup = must(SqliteRewardStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let answer_path = db_path.clone();
        let answer_handle = std::thread::spawn(move || {
            let mut store = match SqliteRewardStore::open(&answer_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open answer store: {err}"),
            };
            store.record_answer(STUDENT, &AnswerInput::bare(true))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let answer_result = match answer_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("answer thread join failed: {err:?}"),
        };
        assert!(
            answer_result.is_ok(),
            "answer should succeed after lock release: {:?}",
            answer_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    fn typed_answer(question_type: QuestionType, difficulty: u8, is_correct: bool) -> AnswerInput {
        AnswerInput {
            is_correct,
            details: Some(AnswerDetails {
                question_type,
                difficulty,
                question: "?".to_string(),
                correct_answer: "1".to_string(),
                user_answer: if is_correct { "1" } else { "2" }.to_string(),
                time_spent_ms: 1_000,
            }),
        }
    }

    fn hold_write_lock(db_path: &Path) -> Connection {
        let conn = match Connection::open(db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }
        conn
    }

    #[test]
    fn answer_with_practice_updates_ledger_and_streak_together() {
        let mut store = fixture_store();

        let first = must(store.record_answer_with_practice(
            STUDENT,
            &AnswerInput::bare(true),
            date!(2026 - 10 - 19),
        ));
        assert_eq!(first.rewards.stars, 1);
        assert_eq!(first.streak.transition, StreakTransition::Started);

        let second = must(store.record_answer_with_practice(
            STUDENT,
            &AnswerInput::bare(false),
            date!(2026 - 10 - 19),
        ));
        assert_eq!(second.rewards.total_questions, 2);
        assert_eq!(second.streak.transition, StreakTransition::Unchanged);
        assert_eq!(must(store.get_streak(STUDENT)).total_practice_days, 1);
    }

    #[test]
    fn answer_with_practice_rolls_back_ledger_when_streak_step_fails() {
        let mut store = fixture_store();
        let _ = must(store.record_practice(STUDENT, date!(2026 - 10 - 18)));
        if let Err(err) = store.connection().execute(
            "UPDATE streak_states SET last_practice_date = 'not-a-date' WHERE student_id = ?1",
            params![STUDENT.0],
        ) {
            panic!("failed to corrupt streak row: {err}");
        }

        let result = store.record_answer_with_practice(
            STUDENT,
            &AnswerInput::bare(true),
            date!(2026 - 10 - 19),
        );
        assert!(result.is_err());
        assert_eq!(must(store.get_rewards(STUDENT)), RewardLedger::empty(STUDENT));
        assert_eq!(count_rows(&store, "answer_records"), 0);
    }

    #[test]
    fn concurrent_answers_are_never_lost() {
        const THREADS: u32 = 4;
        const ANSWERS_PER_THREAD: u32 = 25;

        let db_path = temp_db_path("concurrent-answers");
        {
            let setup = must(SqliteRewardStore::open(&db_path));
            must(setup.migrate());
        }

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(THREADS as usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let path = db_path.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut store = match SqliteRewardStore::open(&path) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open answer store: {err}"),
                    };
                    barrier.wait();
                    for index in 0..ANSWERS_PER_THREAD {
                        if let Err(err) =
                            store.record_answer(STUDENT, &AnswerInput::bare(index % 5 != 0))
                        {
                            panic!("concurrent answer failed: {err:#}");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            if let Err(err) = handle.join() {
                panic!("answer thread join failed: {err:?}");
            }
        }

        let store = must(SqliteRewardStore::open(&db_path));
        let ledger = must(store.get_rewards(STUDENT));
        assert_eq!(ledger.total_questions, THREADS * ANSWERS_PER_THREAD);
        assert_eq!(ledger.total_correct, THREADS * 20);
        assert_eq!(ledger.stars, THREADS * 20);
        assert_eq!(
            count_rows(&store, "answer_records"),
            i64::from(THREADS * ANSWERS_PER_THREAD)
        );

        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_practice_on_the_next_day_counts_once() {
        let db_path = temp_db_path("concurrent-practice");
        {
            let mut setup = must(SqliteRewardStore::open(&db_path));
            must(setup.migrate());
            let _ = must(setup.record_practice(STUDENT, date!(2026 - 10 - 18)));
        }

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = db_path.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut store = match SqliteRewardStore::open(&path) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open practice store: {err}"),
                    };
                    barrier.wait();
                    match store.record_practice(STUDENT, date!(2026 - 10 - 19)) {
                        Ok(update) => update.transition,
                        Err(err) => panic!("concurrent practice failed: {err:#}"),
                    }
                })
            })
            .collect();

        let mut transitions: Vec<StreakTransition> = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(transition) => transition,
                Err(err) => panic!("practice thread join failed: {err:?}"),
            })
            .collect();
        transitions.sort_by_key(|transition| transition.as_str());
        assert_eq!(
            transitions,
            vec![StreakTransition::Continued, StreakTransition::Unchanged]
        );

        let store = must(SqliteRewardStore::open(&db_path));
        let state = must(store.get_streak(STUDENT));
        assert_eq!(state.streak_days, 2);
        assert_eq!(state.total_practice_days, 2);
        assert_eq!(state.longest_streak, 2);

        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn read_failures_name_the_failing_query() {
        let store = fixture_store();
        if let Err(err) = store
            .connection()
            .execute_batch("DROP TABLE collection_records; DROP TABLE answer_records;")
        {
            panic!("failed to drop tables: {err}");
        }

        let collection = match store.get_collection(STUDENT) {
            Ok(_) => panic!("expected collection query to fail"),
            Err(err) => format!("{err:#}"),
        };
        assert!(collection.contains("failed to prepare collection query"), "{collection}");

        let answers = match store.recent_answers(STUDENT, None) {
            Ok(_) => panic!("expected answer query to fail"),
            Err(err) => format!("{err:#}"),
        };
        assert!(answers.contains("failed to prepare recent answers query"), "{answers}");

        let progress = match store.progress_by_type(STUDENT) {
            Ok(_) => panic!("expected progress query to fail"),
            Err(err) => format!("{err:#}"),
        };
        assert!(progress.contains("failed to prepare progress query"), "{progress}");
    }

    #[test]
    fn expired_deadline_is_rejected_up_front() {
        let store = must(SqliteRewardStore::open(Path::new(":memory:")));
        let result = store.with_deadline(Instant::now());
        assert!(matches!(
            reward_error(result.map(|_| ())),
            RewardError::DeadlineExceeded(_)
        ));
    }

    #[test]
    fn draw_past_deadline_under_lock_changes_nothing() {
        let db_path = temp_db_path("deadline-draw");
        {
            let mut setup = must(SqliteRewardStore::open(&db_path));
            must(setup.migrate());
            answer_correct(&mut setup, 10);
        }

        let lock_conn = hold_write_lock(&db_path);
        let store = must(SqliteRewardStore::open(&db_path));
        let mut store = must(
            store.with_deadline(Instant::now() + std::time::Duration::from_millis(150)),
        );

        let mut rng = StdRng::seed_from_u64(5);
        let err = reward_error(store.draw(STUDENT, &GachaCatalog::standard(), &mut rng));
        assert!(matches!(err, RewardError::DeadlineExceeded(_)), "{err:?}");
        let err = reward_error(store.record_answer_with_practice(
            STUDENT,
            &AnswerInput::bare(true),
            date!(2026 - 10 - 19),
        ));
        assert!(matches!(err, RewardError::DeadlineExceeded(_)), "{err:?}");

        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }
        drop(lock_conn);

        let reader = must(SqliteRewardStore::open(&db_path));
        let ledger = must(reader.get_rewards(STUDENT));
        assert_eq!(ledger.stars, 10);
        assert_eq!(ledger.total_questions, 10);
        assert!(must(reader.get_collection(STUDENT)).is_empty());
        assert_eq!(must(reader.get_streak(STUDENT)).total_practice_days, 0);

        drop(reader);
        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn progress_by_type_tracks_accuracy_difficulty_and_mastery() {
        let mut store = fixture_store();
        for _ in 0..2 {
            let _ = must(store.record_answer(
                STUDENT,
                &typed_answer(QuestionType::Addition, 1, false),
            ));
        }
        for _ in 0..10 {
            let _ = must(store.record_answer(
                STUDENT,
                &typed_answer(QuestionType::Addition, 2, true),
            ));
        }
        let _ = must(store.record_answer(
            STUDENT,
            &typed_answer(QuestionType::Counting, 3, false),
        ));
        let _ = must(store.record_answer(STUDENT, &AnswerInput::bare(true)));
        let _ = must(store.record_answer(
            StudentId(2),
            &typed_answer(QuestionType::Compare, 1, true),
        ));

        let progress = must(store.progress_by_type(STUDENT));
        let types: Vec<QuestionType> = progress.iter().map(|entry| entry.question_type).collect();
        assert_eq!(types, vec![QuestionType::Addition, QuestionType::Counting]);

        let addition = &progress[0];
        assert_eq!(addition.attempts, 12);
        assert_eq!(addition.correct, 10);
        assert_eq!(addition.accuracy, 83);
        assert_eq!(addition.current_difficulty, 2);
        assert_eq!(addition.mastery, 100);

        let counting = &progress[1];
        assert_eq!(counting.attempts, 1);
        assert_eq!(counting.accuracy, 0);
        assert_eq!(counting.current_difficulty, 3);
        assert!(counting.last_practiced >= addition.last_practiced);

        assert!(must(store.progress_by_type(StudentId(3))).is_empty());
    }

    #[test]
    fn student_stats_combine_rewards_streak_progress_and_answers() {
        let mut store = fixture_store();
        let _ = must(store.record_answer_with_practice(
            STUDENT,
            &typed_answer(QuestionType::Subtraction, 2, true),
            date!(2026 - 10 - 19),
        ));
        let _ = must(store.record_answer_with_practice(
            STUDENT,
            &AnswerInput::bare(false),
            date!(2026 - 10 - 19),
        ));

        let stats = must(store.student_stats(STUDENT));
        assert_eq!(stats.rewards.total_questions, 2);
        assert_eq!(stats.rewards.accuracy, 50);
        assert_eq!(stats.streak.streak_days, 1);
        assert_eq!(stats.progress_by_type.len(), 1);
        assert_eq!(stats.recent_answers.len(), 2);
        assert!(!stats.recent_answers[0].is_correct);

        assert_eq!(
            must(store.student_stats(StudentId(9))),
            StudentStats::empty(StudentId(9))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_ledger_matches_answer_model(answers in prop::collection::vec(any::<bool>(), 0..60)) {
            let mut store = fixture_store();
            let policy = RewardPolicy::standard();
            let mut model = RewardLedger::empty(STUDENT);

            for is_correct in &answers {
                let stored = must(store.record_answer(STUDENT, &AnswerInput::bare(*is_correct)));
                model = model.apply_answer(*is_correct, &policy);
                prop_assert_eq!(stored, model);
            }

            let correct = u32::try_from(answers.iter().filter(|value| **value).count()).unwrap_or(u32::MAX);
            let total = u32::try_from(answers.len()).unwrap_or(u32::MAX);
            let ledger = must(store.get_rewards(STUDENT));
            prop_assert_eq!(ledger.total_correct, correct);
            prop_assert_eq!(ledger.total_questions, total);
            prop_assert_eq!(ledger.stars, correct);
            prop_assert!(ledger.total_questions >= ledger.total_correct);
        }

        #[test]
        fn prop_streak_invariants_hold_for_any_date_sequence(offsets in prop::collection::vec(-3_i64..6, 1..40)) {
            let mut store = fixture_store();
            let mut day = date!(2026 - 01 - 15);
            let mut previous_longest = 0;

            for offset in offsets {
                day = day.saturating_add(time::Duration::days(offset));
                let update = must(store.record_practice(STUDENT, day));
                prop_assert!(update.state.longest_streak >= update.state.streak_days);
                prop_assert!(update.state.longest_streak >= previous_longest);
                prop_assert!(update.state.streak_days <= update.state.total_practice_days);
                prop_assert_eq!(update.state.last_practice_date, Some(day));
                previous_longest = update.state.longest_streak;
            }
        }
    }
}
