//! sift - pull request review triage
//!
//! Breaks review comments into items, walks them one at a time through an
//! external evaluator and fixer, records an immutable decision per item and
//! syncs the outcome back to the pull request.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use sift_adapters::capability::parse_capability_result;
use sift_adapters::project::ProjectOverrides;
use sift_adapters::{
    git_ops, keyring, CommandEvaluator, CommandFixer, Config, GitHubClient, StateStore,
};
use sift_core::duplicates::DuplicateDetector;
use sift_core::{CapabilityResult, Outcome, PullRequestRef, Recommendation, TriageError};
use sift_engine::{
    initialize_run, ContextAssembler, DecisionInput, DecisionRecorder, GitCommitVerifier,
    InitOptions, Orchestrator, StepOutcome, StepPolicy, SyncEngine,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code when `run` stops on a failure worth retrying.
const EXIT_RETRYABLE: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "sift",
    about = "Triage pull request review comments one item at a time",
    version
)]
struct Args {
    /// Path inside the repository (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a pull request's comments and start a triage run
    Init {
        /// `owner/repo#N`, `#N`, `N` or a pull request URL
        pr: String,
        /// Discard any existing run
        #[arg(long)]
        force: bool,
        /// Override the detected build command
        #[arg(long)]
        build: Option<String>,
        /// Override the detected test command
        #[arg(long)]
        test: Option<String>,
        /// Override the detected lint command
        #[arg(long)]
        lint: Option<String>,
    },
    /// Print the next unresolved item
    Brief,
    /// Print resolved / total counts
    Status,
    /// Write a context bundle for the current item and print its path
    Context {
        #[command(subcommand)]
        kind: ContextKind,
    },
    /// Run the evaluator on the current item and print its recommendation
    Evaluate,
    /// Record the outcome for the current item
    Decide {
        /// fixed, ignored, obsolete, deferred or duplicate
        outcome: Outcome,
        #[arg(long, default_value = "")]
        reason: String,
        /// Commit that fixed the item (FIXED)
        #[arg(long)]
        commit: Option<String>,
        /// Item this one repeats (DUPLICATE)
        #[arg(long)]
        duplicate_of: Option<String>,
        /// Tracking issue (DEFERRED)
        #[arg(long)]
        issue: Option<String>,
        /// Decide a specific item instead of the current one
        #[arg(long)]
        item: Option<String>,
    },
    /// Evaluate, fix and decide items until done or a human is needed
    Run {
        /// Stop after this many items
        #[arg(long)]
        max: Option<usize>,
    },
    /// Reply to and minimize every resolved comment
    Sync {
        /// Print what would be done without touching GitHub
        #[arg(long)]
        dry_run: bool,
    },
    /// Store a GitHub token in the system credential store
    Auth {
        #[arg(long)]
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum ContextKind {
    Evaluate,
    Fix {
        /// Evaluator result to build from (defaults to the last evaluation)
        #[arg(long)]
        recommendation: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SIFT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(args: Args) -> Result<ExitCode> {
    let root = repo_root(&args.repo)?;
    let config = Config::load();
    let store = StateStore::new(&root);

    match args.command {
        Command::Init {
            pr,
            force,
            build,
            test,
            lint,
        } => {
            let default_repo = git_ops::get_remote_info(&root).ok();
            let pr = PullRequestRef::parse(
                &pr,
                default_repo.as_ref().map(|(o, r)| (o.as_str(), r.as_str())),
            )
            .map_err(|e| anyhow!(e))?;
            let backend = github_client(&config)?;
            let options = InitOptions {
                force,
                overrides: ProjectOverrides { build, test, lint },
            };
            let summary = initialize_run(&store, &backend, &pr, &options).await?;
            println!(
                "{}: {} comments, {} items",
                summary.pr, summary.comments, summary.items
            );
            if let Some(tooling) = summary.project.detected_from.as_deref() {
                println!("project tooling: {}", tooling);
            }
            print_brief(&open_orchestrator(&store, &config, &root)?)?;
        }
        Command::Brief => print_brief(&open_orchestrator(&store, &config, &root)?)?,
        Command::Status => {
            let counts = open_orchestrator(&store, &config, &root)?.status()?;
            println!(
                "{}/{} items resolved ({} in review, {} pending); {}/{} comments resolved",
                counts.resolved,
                counts.total,
                counts.in_review,
                counts.pending,
                counts.comments_resolved,
                counts.comments_total
            );
        }
        Command::Context { kind } => {
            let orchestrator = open_orchestrator(&store, &config, &root)?;
            let bundle = match kind {
                ContextKind::Evaluate => orchestrator.begin_evaluation()?,
                ContextKind::Fix { recommendation } => {
                    let recommendation = match recommendation {
                        Some(path) => read_recommendation(&path)?,
                        None => orchestrator.last_recommendation()?.ok_or_else(|| {
                            anyhow!("no evaluation for the current item; run `sift evaluate` or pass --recommendation")
                        })?,
                    };
                    orchestrator.fix_bundle(&recommendation)?
                }
            };
            println!("{}", bundle.path.display());
        }
        Command::Evaluate => {
            let orchestrator = open_orchestrator(&store, &config, &root)?;
            let (line, recommendation) = orchestrator.evaluate()?;
            println!("{}", line);
            println!(
                "recommend {} ({:?} confidence): {}",
                recommendation.recommended_outcome,
                recommendation.confidence,
                recommendation.reasoning
            );
            if let Some(candidate) = recommendation.duplicate_candidate.as_deref() {
                println!("possible duplicate of {}", candidate);
            }
        }
        Command::Decide {
            outcome,
            reason,
            commit,
            duplicate_of,
            issue,
            item,
        } => {
            let orchestrator = open_orchestrator(&store, &config, &root)?;
            let item_id = match item {
                Some(id) => id,
                None => orchestrator
                    .current_item()?
                    .map(|item| item.id)
                    .ok_or(TriageError::NoCurrentItem)?,
            };
            let mut input = DecisionInput::new(item_id, outcome, reason);
            input.commit_ref = commit;
            input.duplicate_of = duplicate_of;
            input.linked_issue = issue;
            let (decision, next) = orchestrator.decide(input)?;
            println!("{} {}", decision.item_id, decision.outcome);
            match next {
                Some(line) => println!("next: {}", line),
                None => println!("all items resolved; run `sift sync`"),
            }
        }
        Command::Run { max } => return run_loop(&store, &config, &root, max).await,
        Command::Sync { dry_run } => {
            let backend = github_client(&config)?;
            if !dry_run {
                require_token(&backend)?;
            }
            let report = SyncEngine::new(&store, &backend).run(dry_run).await?;
            for action in &report.planned {
                println!(
                    "would reply to {} and minimize as {}{}",
                    action.comment_id,
                    action.reason.classifier(),
                    if action.reply_posted { " (reply already posted)" } else { "" }
                );
            }
            for (comment_id, err) in &report.failed {
                eprintln!("comment {}: {}", comment_id, err);
            }
            if !dry_run {
                println!(
                    "{} synced, {} already synced, {} failed",
                    report.synced.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
            }
            if report.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Auth { token } => {
            keyring::set_github_token(&token).map_err(|e| anyhow!(e))?;
            println!(
                "GitHub token saved to {}",
                keyring::credentials_store_label()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Step through items until the run completes, an item needs a human, or
/// `max` items have been decided.
async fn run_loop(
    store: &StateStore,
    config: &Config,
    root: &Path,
    max: Option<usize>,
) -> Result<ExitCode> {
    let orchestrator = open_orchestrator(store, config, root)?;
    let backend = github_client(config)?;
    let policy = StepPolicy::default();
    let mut decided = 0usize;

    while max.is_none_or(|max| decided < max) {
        let report = match orchestrator.step(&policy, Some(&backend)).await {
            Ok(report) => report,
            Err(err) if err.is_retryable() => {
                eprintln!("stopped: {}", err);
                return Ok(ExitCode::from(EXIT_RETRYABLE));
            }
            Err(err) => return Err(err.into()),
        };
        match report.outcome {
            StepOutcome::Complete => {
                println!("all items resolved; run `sift sync`");
                break;
            }
            StepOutcome::NeedsDecision { reason } => {
                if let Some(line) = report.item {
                    println!("{}", line);
                }
                println!("needs a decision: {}", reason);
                break;
            }
            StepOutcome::Decided { outcome } => {
                decided += 1;
                if let Some(line) = report.item {
                    println!("{} -> {}", line, outcome);
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn repo_root(path: &Path) -> Result<PathBuf> {
    match git_ops::workdir(path) {
        Ok(root) => Ok(root),
        Err(err) => {
            tracing::debug!(error = %err, "not inside a git repository; using path as-is");
            path.canonicalize()
                .with_context(|| format!("Failed to resolve '{}'", path.display()))
        }
    }
}

fn github_client(config: &Config) -> Result<GitHubClient> {
    GitHubClient::from_env(&config.github_api_url).map_err(|e| anyhow!(e))
}

/// Writes need a token; say so once instead of failing every comment.
fn require_token(client: &GitHubClient) -> Result<()> {
    if client.is_authenticated() {
        return Ok(());
    }
    Err(anyhow!(
        "not authenticated with GitHub; set GITHUB_TOKEN or run `sift auth --token <T>` (stored in {})",
        keyring::credentials_store_label()
    ))
}

fn open_orchestrator(store: &StateStore, config: &Config, root: &Path) -> Result<Orchestrator> {
    let assembler = ContextAssembler::new(
        store.clone(),
        DuplicateDetector::new(config.duplicate_threshold),
        config.context_radius,
    );
    let recorder = DecisionRecorder::new(store.clone())
        .with_verifier(Box::new(GitCommitVerifier::new(root)));
    Ok(Orchestrator::open(
        store.clone(),
        assembler,
        recorder,
        Box::new(CommandEvaluator::from_config(config, store.clone())),
        Box::new(CommandFixer::from_config(config, store.clone())),
    )?)
}

fn print_brief(orchestrator: &Orchestrator) -> Result<()> {
    match orchestrator.brief()? {
        Some(line) => println!("{}", line),
        None => println!("all items resolved; run `sift sync`"),
    }
    Ok(())
}

fn read_recommendation(path: &Path) -> Result<Recommendation> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    match parse_capability_result::<Recommendation>(&raw).map_err(|e| anyhow!(e))? {
        CapabilityResult::Ok { payload } => Ok(payload),
        CapabilityResult::Failed { reason } => {
            Err(anyhow!("evaluation in '{}' failed: {}", path.display(), reason))
        }
    }
}
