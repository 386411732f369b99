//! Operator command surface for the reward ledger.
//!
//! Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteRewardStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use mathstar_core::{
    local_date, now_utc, parse_iso_date, AnswerDetails, AnswerInput, GachaCatalog, QuestionType,
    RewardPolicy, StudentId,
};
use mathstar_store_sqlite::SqliteRewardStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use time::{Date, UtcOffset};

#[derive(Debug, Parser)]
#[command(name = "ms")]
#[command(about = "Mathstar reward, streak and gacha CLI")]
pub struct Cli {
    #[arg(long, env = "MATHSTAR_DB", default_value = "./mathstar.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "MATHSTAR_STUDENT_ID", default_value_t = 1)]
    student: i64,

    #[arg(long, env = "MATHSTAR_STARS_PER_CORRECT", default_value_t = 1)]
    stars_per_correct: u32,

    #[arg(long, env = "MATHSTAR_GACHA_COST", default_value_t = 10)]
    gacha_cost: u32,

    #[arg(
        long,
        env = "MATHSTAR_UTC_OFFSET_HOURS",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    utc_offset_hours: i8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record one answer, mark the day as practiced and print both updates.
    Answer(AnswerArgs),
    /// Print stars and accuracy.
    Rewards,
    /// Record practice for a calendar day (defaults to today).
    Practice(PracticeArgs),
    /// Print the current streak.
    Streak,
    /// Print rewards, streak, per-question-type progress and recent answers.
    Stats,
    Gacha {
        #[command(subcommand)]
        command: Box<GachaCommand>,
    },
    Answers {
        #[command(subcommand)]
        command: Box<AnswersCommand>,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("outcome").required(true).args(["correct", "incorrect"])))]
pub struct AnswerArgs {
    #[arg(long)]
    correct: bool,
    #[arg(long)]
    incorrect: bool,
    #[arg(long)]
    question_type: Option<QuestionTypeArg>,
    #[arg(long)]
    difficulty: Option<u8>,
    #[arg(long)]
    question: Option<String>,
    #[arg(long)]
    correct_answer: Option<String>,
    #[arg(long)]
    user_answer: Option<String>,
    #[arg(long)]
    time_spent_ms: Option<u32>,
    /// Practice day credited for the answer, as YYYY-MM-DD (defaults to today).
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
pub struct PracticeArgs {
    /// Calendar date as YYYY-MM-DD.
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum GachaCommand {
    /// Spend stars on one draw.
    Draw(DrawArgs),
    Collection,
    Catalog,
}

#[derive(Debug, Args)]
pub struct DrawArgs {
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum AnswersCommand {
    Recent(RecentArgs),
}

#[derive(Debug, Args)]
pub struct RecentArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QuestionTypeArg {
    Addition,
    Subtraction,
    Compare,
    Counting,
    MissingNumber,
}

/// Identity and calendar settings shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub student: StudentId,
    pub utc_offset: UtcOffset,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            student: StudentId::DEFAULT,
            utc_offset: UtcOffset::UTC,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration is invalid, migration fails, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let policy = RewardPolicy {
        stars_per_correct: cli.stars_per_correct,
        gacha_cost: cli.gacha_cost,
    };
    let utc_offset = UtcOffset::from_hms(cli.utc_offset_hours, 0, 0)
        .with_context(|| format!("invalid --utc-offset-hours value: {}", cli.utc_offset_hours))?;
    let session = Session {
        student: StudentId(cli.student),
        utc_offset,
    };

    run_with_db(&cli.db, policy, session, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(
    db_path: &Path,
    policy: RewardPolicy,
    session: Session,
    command: Command,
) -> Result<()> {
    policy.validate()?;
    let mut store = SqliteRewardStore::open(db_path)?.with_policy(policy)?;
    store.migrate()?;
    run_command(command, &mut store, session)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation or the store operation fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteRewardStore,
    session: Session,
) -> Result<()> {
    match command {
        Command::Answer(args) => {
            let today = practice_date(args.date.as_deref(), session)?;
            let input = answer_input(args)?;
            print_json(&store.record_answer_with_practice(session.student, &input, today)?)
        }
        Command::Rewards => print_json(&store.get_rewards(session.student)?.summary()),
        Command::Practice(args) => {
            let today = practice_date(args.date.as_deref(), session)?;
            print_json(&store.record_practice(session.student, today)?)
        }
        Command::Streak => print_json(&store.get_streak(session.student)?),
        Command::Stats => print_json(&store.student_stats(session.student)?),
        Command::Gacha { command } => run_gacha(*command, store, session),
        Command::Answers { command } => match *command {
            AnswersCommand::Recent(args) => {
                print_json(&store.recent_answers(session.student, args.limit)?)
            }
        },
    }
}

fn run_gacha(command: GachaCommand, store: &mut SqliteRewardStore, session: Session) -> Result<()> {
    let catalog = GachaCatalog::standard();
    match command {
        GachaCommand::Draw(args) => {
            let mut rng = match args.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let outcome = store.draw(session.student, &catalog, &mut rng)?;
            print_json(&outcome)
        }
        GachaCommand::Collection => {
            print_json(&store.collection_summary(session.student, &catalog)?)
        }
        GachaCommand::Catalog => print_json(&catalog.view(store.policy())),
    }
}

fn practice_date(raw: Option<&str>, session: Session) -> Result<Date> {
    match raw {
        Some(raw) => parse_iso_date(raw).map_err(|err| anyhow!("invalid --date value: {err}")),
        None => Ok(local_date(now_utc(), session.utc_offset)),
    }
}

fn answer_input(args: AnswerArgs) -> Result<AnswerInput> {
    let is_correct = args.correct && !args.incorrect;

    let Some(question_type) = args.question_type else {
        if args.difficulty.is_some()
            || args.question.is_some()
            || args.correct_answer.is_some()
            || args.user_answer.is_some()
            || args.time_spent_ms.is_some()
        {
            return Err(anyhow!("--question-type is required when answer details are given"));
        }
        return Ok(AnswerInput::bare(is_correct));
    };

    Ok(AnswerInput {
        is_correct,
        details: Some(AnswerDetails {
            question_type: map_question_type(question_type),
            difficulty: args.difficulty.unwrap_or(1),
            question: args.question.unwrap_or_default(),
            correct_answer: args.correct_answer.unwrap_or_default(),
            user_answer: args.user_answer.unwrap_or_default(),
            time_spent_ms: args.time_spent_ms.unwrap_or(0),
        }),
    })
}

fn map_question_type(value: QuestionTypeArg) -> QuestionType {
    match value {
        QuestionTypeArg::Addition => QuestionType::Addition,
        QuestionTypeArg::Subtraction => QuestionType::Subtraction,
        QuestionTypeArg::Compare => QuestionType::Compare,
        QuestionTypeArg::Counting => QuestionType::Counting,
        QuestionTypeArg::MissingNumber => QuestionType::MissingNumber,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
