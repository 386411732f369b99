use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Upper bound (exclusive) of the uniform roll used to pick a rarity tier.
pub const ROLL_RANGE: u32 = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RewardError {
    #[error("insufficient funds: {required} stars required, balance is {balance}")]
    InsufficientFunds { balance: u32, required: u32 },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StudentId(pub i64);

impl StudentId {
    pub const DEFAULT: Self = Self(1);
}

impl Display for StudentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RewardPolicy {
    pub stars_per_correct: u32,
    pub gacha_cost: u32,
}

impl RewardPolicy {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            stars_per_correct: 1,
            gacha_cost: 10,
        }
    }

    /// Validates the reward economy.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when the gacha cost is zero.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.gacha_cost == 0 {
            return Err(RewardError::Configuration(
                "gacha_cost MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RewardLedger {
    pub student_id: StudentId,
    pub stars: u32,
    pub total_correct: u32,
    pub total_questions: u32,
}

/// Canonical reward shape returned to every client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RewardSummary {
    pub student_id: StudentId,
    pub stars: u32,
    pub total_correct: u32,
    pub total_questions: u32,
    pub accuracy: u32,
}

impl RewardLedger {
    #[must_use]
    pub fn empty(student_id: StudentId) -> Self {
        Self {
            student_id,
            stars: 0,
            total_correct: 0,
            total_questions: 0,
        }
    }

    /// Percentage of correct answers, rounded half up. Zero before the first answer.
    #[must_use]
    pub fn accuracy(&self) -> u32 {
        rounded_percentage(
            u64::from(self.total_correct),
            u64::from(self.total_questions),
        )
    }

    #[must_use]
    pub fn apply_answer(&self, is_correct: bool, policy: &RewardPolicy) -> Self {
        let mut next = *self;
        next.total_questions = next.total_questions.saturating_add(1);
        if is_correct {
            next.total_correct = next.total_correct.saturating_add(1);
            next.stars = next.stars.saturating_add(policy.stars_per_correct);
        }
        next
    }

    /// Deducts `amount` stars.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] for a zero amount and
    /// [`RewardError::InsufficientFunds`] when the balance is too small.
    pub fn spend(&self, amount: u32) -> Result<Self, RewardError> {
        if amount == 0 {
            return Err(RewardError::Validation(
                "spend amount MUST be >= 1".to_string(),
            ));
        }

        let Some(stars) = self.stars.checked_sub(amount) else {
            return Err(RewardError::InsufficientFunds {
                balance: self.stars,
                required: amount,
            });
        };

        Ok(Self { stars, ..*self })
    }

    /// Checks the counter relationship stored rows must satisfy.
    ///
    /// # Errors
    /// Returns [`RewardError::InconsistentState`] when `total_correct`
    /// exceeds `total_questions`.
    pub fn check_invariants(&self) -> Result<(), RewardError> {
        if self.total_correct > self.total_questions {
            return Err(RewardError::InconsistentState(format!(
                "ledger for student {} has total_correct {} > total_questions {}",
                self.student_id, self.total_correct, self.total_questions
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn summary(&self) -> RewardSummary {
        RewardSummary {
            student_id: self.student_id,
            stars: self.stars,
            total_correct: self.total_correct,
            total_questions: self.total_questions,
            accuracy: self.accuracy(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreakTransition {
    Started,
    Unchanged,
    Continued,
    Reset,
}

impl StreakTransition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Unchanged => "unchanged",
            Self::Continued => "continued",
            Self::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreakState {
    pub student_id: StudentId,
    pub streak_days: u32,
    pub longest_streak: u32,
    #[serde(with = "iso_date::option")]
    pub last_practice_date: Option<Date>,
    pub total_practice_days: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreakUpdate {
    #[serde(flatten)]
    pub state: StreakState,
    pub transition: StreakTransition,
}

impl StreakState {
    #[must_use]
    pub fn empty(student_id: StudentId) -> Self {
        Self {
            student_id,
            streak_days: 0,
            longest_streak: 0,
            last_practice_date: None,
            total_practice_days: 0,
        }
    }

    /// Applies one practice event on `today`.
    ///
    /// Same-day calls are no-ops. Any date other than the day after the last
    /// practice (including an earlier date) breaks the streak.
    #[must_use]
    pub fn advance(&self, today: Date) -> StreakUpdate {
        let Some(last) = self.last_practice_date else {
            return StreakUpdate {
                state: Self {
                    student_id: self.student_id,
                    streak_days: 1,
                    longest_streak: self.longest_streak.max(1),
                    last_practice_date: Some(today),
                    total_practice_days: self.total_practice_days.saturating_add(1),
                },
                transition: StreakTransition::Started,
            };
        };

        if last == today {
            return StreakUpdate {
                state: *self,
                transition: StreakTransition::Unchanged,
            };
        }

        let mut next = *self;
        next.last_practice_date = Some(today);
        next.total_practice_days = next.total_practice_days.saturating_add(1);

        if today.previous_day() == Some(last) {
            next.streak_days = next.streak_days.saturating_add(1);
            next.longest_streak = next.longest_streak.max(next.streak_days);
            StreakUpdate {
                state: next,
                transition: StreakTransition::Continued,
            }
        } else {
            next.streak_days = 1;
            next.longest_streak = next.longest_streak.max(1);
            StreakUpdate {
                state: next,
                transition: StreakTransition::Reset,
            }
        }
    }

    /// Checks the ordering invariants between the streak counters.
    ///
    /// # Errors
    /// Returns [`RewardError::InconsistentState`] when `longest_streak <
    /// streak_days` or `streak_days > total_practice_days`.
    pub fn check_invariants(&self) -> Result<(), RewardError> {
        if self.longest_streak < self.streak_days {
            return Err(RewardError::InconsistentState(format!(
                "streak for student {} has longest_streak {} < streak_days {}",
                self.student_id, self.longest_streak, self.streak_days
            )));
        }
        if self.streak_days > self.total_practice_days {
            return Err(RewardError::InconsistentState(format!(
                "streak for student {} has streak_days {} > total_practice_days {}",
                self.student_id, self.streak_days, self.total_practice_days
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    pub const ALL: [Self; 4] = [Self::Common, Self::Rare, Self::Epic, Self::Legendary];

    // Smallest bands first so each threshold is exclusive of the next tier.
    const DRAW_ORDER: [Self; 4] = [Self::Legendary, Self::Epic, Self::Rare, Self::Common];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "common" => Some(Self::Common),
            "rare" => Some(Self::Rare),
            "epic" => Some(Self::Epic),
            "legendary" => Some(Self::Legendary),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Common => "Common",
            Self::Rare => "Rare",
            Self::Epic => "Epic",
            Self::Legendary => "Legendary",
        }
    }

    /// Share of [`ROLL_RANGE`] assigned to the tier.
    #[must_use]
    pub fn weight(self) -> u32 {
        match self {
            Self::Common => 60,
            Self::Rare => 25,
            Self::Epic => 12,
            Self::Legendary => 3,
        }
    }

    /// Maps a roll in `[0, ROLL_RANGE)` onto a tier.
    #[must_use]
    pub fn from_roll(roll: u32) -> Self {
        let mut threshold = 0;
        for rarity in Self::DRAW_ORDER {
            threshold += rarity.weight();
            if roll < threshold {
                return rarity;
            }
        }
        Self::Common
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct GachaItem {
    pub id: &'static str,
    pub display_name: &'static str,
    pub glyph: &'static str,
    pub rarity: Rarity,
    pub category: &'static str,
}

const STANDARD_ITEMS: [GachaItem; 18] = [
    item("dog", "Puppy", "🐶", Rarity::Common, "animals"),
    item("cat", "Kitten", "🐱", Rarity::Common, "animals"),
    item("rabbit", "Bunny", "🐰", Rarity::Common, "animals"),
    item("bear", "Bear", "🐻", Rarity::Common, "animals"),
    item("panda", "Panda", "🐼", Rarity::Common, "animals"),
    item("monkey", "Monkey", "🐵", Rarity::Common, "animals"),
    item("tiger", "Tiger", "🐯", Rarity::Rare, "animals"),
    item("lion", "Lion", "🦁", Rarity::Rare, "animals"),
    item("fox", "Fox", "🦊", Rarity::Rare, "animals"),
    item("koala", "Koala", "🐨", Rarity::Rare, "animals"),
    item("penguin", "Penguin", "🐧", Rarity::Rare, "animals"),
    item("unicorn", "Unicorn", "🦄", Rarity::Epic, "magic"),
    item("dragon", "Dragon", "🐉", Rarity::Epic, "magic"),
    item("phoenix", "Phoenix", "🦅", Rarity::Epic, "magic"),
    item("alien", "Alien", "👽", Rarity::Epic, "space"),
    item("trophy", "Golden Trophy", "🏆", Rarity::Legendary, "awards"),
    item("crown", "Crown", "👑", Rarity::Legendary, "awards"),
    item("star", "Shining Star", "✨", Rarity::Legendary, "special"),
];

const fn item(
    id: &'static str,
    display_name: &'static str,
    glyph: &'static str,
    rarity: Rarity,
    category: &'static str,
) -> GachaItem {
    GachaItem {
        id,
        display_name,
        glyph,
        rarity,
        category,
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct CollectionProgress {
    pub collected: u32,
    pub total: u32,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct GachaCatalog {
    items: Vec<GachaItem>,
}

impl GachaCatalog {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            items: STANDARD_ITEMS.to_vec(),
        }
    }

    /// Builds a catalog from an ordered item list.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when an id is empty or
    /// duplicated, or when a rarity tier has no items.
    pub fn new(items: Vec<GachaItem>) -> Result<Self, RewardError> {
        let mut seen = BTreeSet::new();
        for entry in &items {
            if entry.id.trim().is_empty() {
                return Err(RewardError::Configuration(
                    "catalog item id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(entry.id) {
                return Err(RewardError::Configuration(format!(
                    "duplicate catalog item id: {}",
                    entry.id
                )));
            }
        }

        for rarity in Rarity::ALL {
            if !items.iter().any(|entry| entry.rarity == rarity) {
                return Err(RewardError::Configuration(format!(
                    "catalog has no {} items",
                    rarity.as_str()
                )));
            }
        }

        Ok(Self { items })
    }

    #[must_use]
    pub fn items(&self) -> &[GachaItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<&GachaItem> {
        self.items.iter().find(|entry| entry.id == id)
    }

    pub fn items_of(&self, rarity: Rarity) -> impl Iterator<Item = &GachaItem> {
        self.items.iter().filter(move |entry| entry.rarity == rarity)
    }

    /// Draws one item: a rarity tier by weight, then a uniform pick inside it.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when the sampled tier is empty.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<GachaItem, RewardError> {
        let rarity = Rarity::from_roll(rng.random_range(0..ROLL_RANGE));
        let pool: Vec<&GachaItem> = self.items_of(rarity).collect();
        if pool.is_empty() {
            return Err(RewardError::Configuration(format!(
                "catalog has no {} items",
                rarity.as_str()
            )));
        }

        let index = rng.random_range(0..pool.len());
        pool.get(index).map(|entry| **entry).ok_or_else(|| {
            RewardError::InconsistentState(format!(
                "draw index {index} outside {} pool",
                rarity.as_str()
            ))
        })
    }

    /// Tier odds, rarest first.
    #[must_use]
    pub fn odds(&self) -> Vec<RarityOdds> {
        Rarity::DRAW_ORDER
            .iter()
            .map(|rarity| RarityOdds {
                rarity: *rarity,
                label: rarity.label(),
                weight_percent: rarity.weight(),
                items: self.items_of(*rarity).count(),
            })
            .collect()
    }

    #[must_use]
    pub fn view(&self, policy: &RewardPolicy) -> CatalogView<'_> {
        CatalogView {
            gacha_cost: policy.gacha_cost,
            odds: self.odds(),
            items: &self.items,
        }
    }

    /// Counts distinct collected ids that exist in this catalog.
    #[must_use]
    pub fn progress<'a>(
        &self,
        collected_item_ids: impl IntoIterator<Item = &'a str>,
    ) -> CollectionProgress {
        let distinct: BTreeSet<&str> = collected_item_ids
            .into_iter()
            .filter(|id| self.find(id).is_some())
            .collect();

        let collected = u32::try_from(distinct.len()).unwrap_or(u32::MAX);
        let total = u32::try_from(self.items.len()).unwrap_or(u32::MAX);

        CollectionProgress {
            collected,
            total,
            percentage: rounded_percentage(u64::from(collected), u64::from(total)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RarityOdds {
    pub rarity: Rarity,
    pub label: &'static str,
    pub weight_percent: u32,
    pub items: usize,
}

/// Catalog as shown to players: cost, tier odds and the item list.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogView<'a> {
    pub gacha_cost: u32,
    pub odds: Vec<RarityOdds>,
    pub items: &'a [GachaItem],
}

impl Default for GachaCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionRecord {
    pub record_id: Ulid,
    pub student_id: StudentId,
    pub item_id: String,
    pub item_name: String,
    pub item_glyph: String,
    pub rarity: Rarity,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

impl CollectionRecord {
    #[must_use]
    pub fn for_item(student_id: StudentId, item: &GachaItem, collected_at: OffsetDateTime) -> Self {
        Self {
            record_id: Ulid::new(),
            student_id,
            item_id: item.id.to_string(),
            item_name: item.display_name.to_string(),
            item_glyph: item.glyph.to_string(),
            rarity: item.rarity,
            collected_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DrawOutcome {
    pub item: GachaItem,
    pub record: CollectionRecord,
    pub rewards: RewardSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub collections: Vec<CollectionRecord>,
    pub progress: CollectionProgress,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Addition,
    Subtraction,
    Compare,
    Counting,
    MissingNumber,
}

impl QuestionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Addition => "addition",
            Self::Subtraction => "subtraction",
            Self::Compare => "compare",
            Self::Counting => "counting",
            Self::MissingNumber => "missing_number",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "addition" => Some(Self::Addition),
            "subtraction" => Some(Self::Subtraction),
            "compare" => Some(Self::Compare),
            "counting" => Some(Self::Counting),
            "missing_number" => Some(Self::MissingNumber),
            _ => None,
        }
    }
}

pub const MAX_DIFFICULTY: u8 = 4;
pub const MAX_TIME_SPENT_MS: u32 = 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnswerDetails {
    pub question_type: QuestionType,
    pub difficulty: u8,
    pub question: String,
    pub correct_answer: String,
    pub user_answer: String,
    #[serde(default)]
    pub time_spent_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnswerInput {
    pub is_correct: bool,
    #[serde(default)]
    pub details: Option<AnswerDetails>,
}

impl AnswerInput {
    #[must_use]
    pub fn bare(is_correct: bool) -> Self {
        Self {
            is_correct,
            details: None,
        }
    }

    /// Validates the optional question metadata attached to an answer.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] when difficulty, question text,
    /// expected answer, or time spent are out of bounds.
    pub fn validate(&self) -> Result<(), RewardError> {
        let Some(details) = &self.details else {
            return Ok(());
        };

        if !(1..=MAX_DIFFICULTY).contains(&details.difficulty) {
            return Err(RewardError::Validation(format!(
                "difficulty MUST be in [1, {MAX_DIFFICULTY}]"
            )));
        }

        if details.question.trim().is_empty() {
            return Err(RewardError::Validation(
                "question MUST be provided with answer details".to_string(),
            ));
        }

        if details.correct_answer.trim().is_empty() {
            return Err(RewardError::Validation(
                "correct_answer MUST be provided with answer details".to_string(),
            ));
        }

        if details.time_spent_ms > MAX_TIME_SPENT_MS {
            return Err(RewardError::Validation(format!(
                "time_spent_ms MUST be <= {MAX_TIME_SPENT_MS}"
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnswerRecord {
    pub answer_seq: i64,
    pub student_id: StudentId,
    pub is_correct: bool,
    pub details: Option<AnswerDetails>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Ledger and streak after one answer; both are written in one transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnswerOutcome {
    pub rewards: RewardSummary,
    pub streak: StreakUpdate,
}

/// Number of most recent answers of a type that make up its mastery score.
pub const MASTERY_WINDOW: u32 = 10;

/// Per question type performance derived from the answer log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionTypeProgress {
    pub question_type: QuestionType,
    pub attempts: u32,
    pub correct: u32,
    pub accuracy: u32,
    /// Difficulty of the latest answer of this type.
    pub current_difficulty: u8,
    /// Accuracy over the last [`MASTERY_WINDOW`] answers of this type.
    pub mastery: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_practiced: OffsetDateTime,
}

/// Dashboard aggregate for one student.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudentStats {
    pub rewards: RewardSummary,
    pub streak: StreakState,
    pub progress_by_type: Vec<QuestionTypeProgress>,
    pub recent_answers: Vec<AnswerRecord>,
}

impl StudentStats {
    #[must_use]
    pub fn empty(student_id: StudentId) -> Self {
        Self {
            rewards: RewardLedger::empty(student_id).summary(),
            streak: StreakState::empty(student_id),
            progress_by_type: Vec::new(),
            recent_answers: Vec::new(),
        }
    }
}

/// `part / whole` as a whole percentage, rounded half up and capped at 100.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn rounded_percentage(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    let rounded = (part.min(whole) * 200 + whole) / (whole * 2);
    rounded.min(100) as u32
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RewardError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RewardError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RewardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RewardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RewardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            RewardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`RewardError::Validation`] for malformed or impossible dates.
pub fn parse_iso_date(value: &str) -> Result<Date, RewardError> {
    Date::parse(value, &time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("invalid date {value:?}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_iso_date(value: Date) -> Result<String, RewardError> {
    value
        .format(&time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Calendar date of `now` as seen from a fixed UTC offset.
#[must_use]
pub fn local_date(now: OffsetDateTime, offset: UtcOffset) -> Date {
    now.to_offset(offset).date()
}
