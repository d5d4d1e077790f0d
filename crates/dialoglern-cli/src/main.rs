//! CLI for dialoglern.
//!
//! Provides commands for choosing the next action of a conversation, feeding
//! rewards back into the policy, running simulated conversations, and
//! inspecting the learned arm statistics. The policy is persisted as a JSON
//! snapshot between invocations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoglern_bandits::{ArmStats, BanditConfig, ContextualBandit, EpsilonGreedy, EpsilonGreedyConfig};
use dialoglern_core::{ActionSpace, ConversationState, MemoryStorage, Policy, Sentiment};
use dialoglern_env::{Environment, EnvironmentConfig, UserResponse};
use dialoglern_feedback::{
    ConversationOutcome, OutcomeMetrics, OutcomeStatistics, RewardCalculator, RewardConfig,
};
use dialoglern_guardrails::GuardrailSettings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const DEFAULT_SNAPSHOT: &str = "data/dialoglern.policy.json";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose the next action for a conversation state
    Decide {
        /// Conversation state JSON (`-` reads stdin)
        #[arg(long)]
        state: PathBuf,

        /// Action space JSON (array of actions)
        #[arg(long)]
        actions: PathBuf,

        /// Path to the policy snapshot
        #[arg(long, default_value = DEFAULT_SNAPSHOT)]
        snapshot: PathBuf,

        /// Guardrail settings JSON
        #[arg(long)]
        guardrails: Option<PathBuf>,
    },
    /// Record the reward an action earned in a state
    Update {
        /// Conversation state JSON the action was taken in (`-` reads stdin)
        #[arg(long)]
        state: PathBuf,

        /// Action space JSON (array of actions)
        #[arg(long)]
        actions: PathBuf,

        /// Type of the action that was taken
        #[arg(long)]
        action_type: String,

        /// Reward in [-1, 1]
        #[arg(long, allow_hyphen_values = true, value_parser = parse_reward)]
        reward: f64,

        /// Path to the policy snapshot
        #[arg(long, default_value = DEFAULT_SNAPSHOT)]
        snapshot: PathBuf,
    },
    /// Run simulated conversations and credit their outcomes
    Simulate {
        /// Action space JSON (array of actions)
        #[arg(long)]
        actions: PathBuf,

        /// Number of conversations to simulate
        #[arg(long, default_value = "10")]
        episodes: u32,

        /// Probability that a simulated conversation succeeds
        #[arg(long, default_value = "0.5", value_parser = parse_probability)]
        success_rate: f64,

        /// Turn limit per conversation
        #[arg(long, default_value = "8")]
        max_turns: u32,

        /// Seed for the simulated users and the policy's exploration
        #[arg(long)]
        seed: Option<u64>,

        /// Wrap the bandit in epsilon-greedy exploration with this epsilon
        #[arg(long, value_parser = parse_probability)]
        epsilon: Option<f64>,

        /// Path to the policy snapshot
        #[arg(long, default_value = DEFAULT_SNAPSHOT)]
        snapshot: PathBuf,
    },
    /// Print learned arm statistics
    Inspect {
        /// Only show arms of this context key
        #[arg(long)]
        context: Option<String>,

        /// Path to the policy snapshot
        #[arg(long, default_value = DEFAULT_SNAPSHOT)]
        snapshot: PathBuf,
    },
}

/// Policy snapshot persisted between CLI runs.
#[derive(Serialize, Deserialize, Debug)]
struct PolicyFile {
    policy: String,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    snapshot: Value,
}

impl PolicyFile {
    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let policy_file: PolicyFile = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid snapshot file {}", path.display()))?;
        Ok(Some(policy_file))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct DecisionRecord {
    ts: String,
    policy: String,
    context_key: String,
    decision: dialoglern_core::Action,
    /// The policy drew its pick at random; `analysis` shows the ranked best.
    explored: bool,
    exploration_rate: f64,
    analysis: dialoglern_core::Explanation,
    guardrail: Option<dialoglern_guardrails::Validation>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ArmRow {
    context: String,
    action_type: String,
    #[serde(flatten)]
    stats: ArmStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationReport {
    episodes: u32,
    successes: usize,
    success_rate: f64,
    average_outcome_reward: f64,
    average_turns: f64,
    actions: BTreeMap<String, u64>,
}

fn parse_reward(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !(-1.0..=1.0).contains(&value) {
        return Err(format!("reward {value} is outside [-1, 1]"));
    }
    Ok(value)
}

fn parse_probability(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{value} is outside [0, 1]"));
    }
    Ok(value)
}

fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if path.as_os_str() == "-" {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input)?;
        return serde_json::from_str(&input).context("Invalid JSON on stdin");
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn read_actions(path: &Path) -> Result<ActionSpace> {
    let actions: ActionSpace = read_json(path)?;
    if actions.is_empty() {
        anyhow::bail!("Action space in {} is empty", path.display());
    }
    Ok(actions)
}

/// Builds a memory-backed bandit and restores the snapshot at `path`, if any.
async fn open_bandit(path: &Path, actions: ActionSpace) -> Result<Arc<ContextualBandit>> {
    let bandit = ContextualBandit::new(Arc::new(MemoryStorage::new()), BanditConfig::default())
        .with_actions(actions);
    if let Some(file) = PolicyFile::load(path)? {
        bandit
            .load(file.snapshot)
            .await
            .context("Failed to restore policy snapshot")?;
    }
    Ok(Arc::new(bandit))
}

async fn save_bandit(path: &Path, bandit: &ContextualBandit) -> Result<()> {
    PolicyFile {
        policy: bandit.name().to_string(),
        saved_at: OffsetDateTime::now_utc(),
        snapshot: bandit.snapshot().await?,
    }
    .save(path)
    .context("Failed to save policy snapshot")
}

/// Splits `<prefix>:arm:<context>:<actionType>` into context and action type.
fn parse_arm_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(":arm:")?;
    rest.rsplit_once(':')
}

fn arm_rows(snapshot: &Value, context: Option<&str>) -> Result<Vec<ArmRow>> {
    let prefix = snapshot
        .pointer("/config/keyPrefix")
        .and_then(Value::as_str)
        .unwrap_or("bandit");
    let Some(arms) = snapshot.get("armStats").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for (key, value) in arms {
        let Some((ctx, action_type)) = parse_arm_key(prefix, key) else {
            continue;
        };
        if context.is_some_and(|c| c != ctx) {
            continue;
        }
        let stats: ArmStats = serde_json::from_value(value.clone())
            .with_context(|| format!("Invalid arm statistics under {key}"))?;
        rows.push(ArmRow {
            context: ctx.to_string(),
            action_type: action_type.to_string(),
            stats,
        });
    }
    Ok(rows)
}

async fn decide(
    state: &Path,
    actions: &Path,
    snapshot: &Path,
    guardrails: Option<&Path>,
) -> Result<DecisionRecord> {
    let state: ConversationState = read_json(state)?;
    let bandit = open_bandit(snapshot, read_actions(actions)?).await?;

    let choice = bandit.choose(&state).await?;
    let action = choice.action;
    let analysis = bandit.analyze_action(&state).await?;

    let guardrail = match guardrails {
        Some(path) => {
            let settings: GuardrailSettings = read_json(path)?;
            let validation = settings
                .build()
                .validate(&state, &action)
                .await
                .context("Guardrails rejected the decision")?;
            Some(validation)
        }
        None => None,
    };
    let decision = guardrail
        .as_ref()
        .map_or_else(|| action.clone(), |v| v.action.clone());

    Ok(DecisionRecord {
        ts: iso8601_now(),
        policy: bandit.name().to_string(),
        context_key: state.context_key(),
        decision,
        explored: choice.explored,
        exploration_rate: choice.exploration_rate,
        analysis: analysis.explanation,
        guardrail,
    })
}

async fn update(
    state: &Path,
    actions: &Path,
    action_type: &str,
    reward: f64,
    snapshot: &Path,
) -> Result<ArmRow> {
    let state: ConversationState = read_json(state)?;
    let space = read_actions(actions)?;
    let action = space
        .get_action(action_type)
        .cloned()
        .with_context(|| format!("Unknown action type: {action_type}"))?;
    let bandit = open_bandit(snapshot, space).await?;

    bandit.update(&state, &action, reward).await?;
    save_bandit(snapshot, &bandit).await?;

    let context = state.context_key();
    let stats = bandit
        .arm_stats(&context, action_type)
        .await?
        .context("Arm statistics missing after update")?;
    Ok(ArmRow {
        context,
        action_type: action_type.to_string(),
        stats,
    })
}

const SIM_INTENTS: &[&str] = &["billing", "support", "sales"];

/// Scripted user: mostly cooperative, occasionally annoyed.
fn simulated_reply(rng: &mut StdRng) -> UserResponse {
    let roll: f64 = rng.gen();
    let sentiment = if roll < 0.4 {
        Sentiment::Positive
    } else if roll < 0.8 {
        Sentiment::Neutral
    } else {
        Sentiment::Negative
    };
    UserResponse::new("simulated reply").with_sentiment(sentiment)
}

async fn simulate(
    actions: &Path,
    episodes: u32,
    success_rate: f64,
    max_turns: u32,
    seed: Option<u64>,
    epsilon: Option<f64>,
    snapshot: &Path,
) -> Result<SimulationReport> {
    let bandit = open_bandit(snapshot, read_actions(actions)?).await?;
    // Seeds only this run; the saved snapshot keeps its own config.
    if seed.is_some() {
        bandit.reseed(seed);
    }
    let policy: Arc<dyn Policy> = match epsilon {
        Some(epsilon) => Arc::new(EpsilonGreedy::new(
            bandit.clone(),
            EpsilonGreedyConfig {
                epsilon,
                seed,
                ..EpsilonGreedyConfig::default()
            },
        )),
        None => bandit.clone(),
    };

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let mut env = Environment::new(
        policy,
        RewardCalculator::new(RewardConfig::default()),
        EnvironmentConfig { max_turns },
    );

    let mut outcomes = OutcomeStatistics::default();
    let mut action_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut total_turns = 0u64;

    for episode in 0..episodes {
        let intent = SIM_INTENTS[rng.gen_range(0..SIM_INTENTS.len())];
        let initial = ConversationState::new(format!("sim-{episode}")).with_intent(intent);
        let summary = env
            .run_episode(initial, |_, action| {
                (!action.is_terminal()).then(|| simulated_reply(&mut rng))
            })
            .await?;

        let outcome = ConversationOutcome {
            success: rng.gen_bool(success_rate),
            metrics: Some(OutcomeMetrics {
                duration: Some(f64::from(summary.turns) * 45.0),
                user_satisfaction: Some(rng.gen()),
                ..OutcomeMetrics::default()
            }),
        };
        let report = env.process_outcome(&outcome).await?;
        outcomes.record(&outcome, report.delayed_reward);

        total_turns += u64::from(summary.turns);
        for action in summary.actions {
            *action_counts.entry(action).or_insert(0) += 1;
        }
    }

    save_bandit(snapshot, &bandit).await?;

    #[allow(clippy::cast_precision_loss)]
    let average_turns = if episodes == 0 {
        0.0
    } else {
        total_turns as f64 / f64::from(episodes)
    };
    Ok(SimulationReport {
        episodes,
        successes: outcomes.successes,
        success_rate: outcomes.success_rate(),
        average_outcome_reward: outcomes.average_reward(),
        average_turns,
        actions: action_counts,
    })
}

fn inspect(snapshot: &Path, context: Option<&str>) -> Result<Vec<ArmRow>> {
    let file = PolicyFile::load(snapshot)?
        .with_context(|| format!("No snapshot at {}", snapshot.display()))?;
    arm_rows(&file.snapshot, context)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout(), value)?;
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Decide {
            state,
            actions,
            snapshot,
            guardrails,
        } => {
            let record = decide(&state, &actions, &snapshot, guardrails.as_deref()).await?;
            print_json(&record)?;
        }
        Commands::Update {
            state,
            actions,
            action_type,
            reward,
            snapshot,
        } => {
            let row = update(&state, &actions, &action_type, reward, &snapshot).await?;
            print_json(&row)?;
        }
        Commands::Simulate {
            actions,
            episodes,
            success_rate,
            max_turns,
            seed,
            epsilon,
            snapshot,
        } => {
            let report = simulate(
                &actions,
                episodes,
                success_rate,
                max_turns,
                seed,
                epsilon,
                &snapshot,
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Inspect { context, snapshot } => {
            let rows = inspect(&snapshot, context.as_deref())?;
            print_json(&rows)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arm_key() {
        assert_eq!(
            parse_arm_key("bandit", "bandit:arm:intent:billing|mood:calm:ask_question"),
            Some(("intent:billing|mood:calm", "ask_question"))
        );
        assert_eq!(parse_arm_key("bandit", "bandit:arm::end_call"), Some(("", "end_call")));
        // Text features may hold the separator; action types never do.
        assert_eq!(
            parse_arm_key("bandit", "bandit:arm:intent:support|url:http://x:end_call"),
            Some(("intent:support|url:http://x", "end_call"))
        );
        assert_eq!(parse_arm_key("bandit", "bandit:pulls:intent:billing"), None);
        assert_eq!(parse_arm_key("other", "bandit:arm::end_call"), None);
    }

    #[test]
    fn test_parse_reward_bounds() {
        assert_eq!(parse_reward("-1"), Ok(-1.0));
        assert_eq!(parse_reward("0.25"), Ok(0.25));
        assert!(parse_reward("1.5").is_err());
        assert!(parse_reward("abc").is_err());
        assert!(parse_probability("-0.1").is_err());
    }

    #[test]
    fn test_arm_rows_filters_by_context() {
        let snapshot = json!({
            "config": {"keyPrefix": "bandit"},
            "armStats": {
                "bandit:arm:intent:billing:ask_question": {"pulls": 2, "totalReward": 1.0, "averageReward": 0.5},
                "bandit:arm::end_call": {"pulls": 1, "totalReward": -1.0, "averageReward": -1.0},
                "bandit:pulls:intent:billing": 2
            }
        });

        let all = arm_rows(&snapshot, None).unwrap();
        assert_eq!(all.len(), 2);

        let billing = arm_rows(&snapshot, Some("intent:billing")).unwrap();
        assert_eq!(billing.len(), 1);
        assert_eq!(billing[0].action_type, "ask_question");
        assert_eq!(billing[0].stats.pulls, 2);
    }

    #[test]
    fn test_policy_file_roundtrip() {
        let dir = std::env::temp_dir().join("dialoglern_test_policy_file");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("policy.json");

        assert!(PolicyFile::load(&path).unwrap().is_none());

        PolicyFile {
            policy: "contextual-bandit".into(),
            saved_at: OffsetDateTime::now_utc(),
            snapshot: json!({"config": {"initialReward": 0.0}}),
        }
        .save(&path)
        .unwrap();

        let loaded = PolicyFile::load(&path).unwrap().unwrap();
        assert_eq!(loaded.policy, "contextual-bandit");
        assert_eq!(loaded.snapshot["config"]["initialReward"], json!(0.0));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
