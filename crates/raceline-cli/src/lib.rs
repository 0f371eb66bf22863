//! Batch command surface for the raceline store.
//!
//! Embedders can call:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an open [`SqliteRaceStore`].
//!
//! Reports go to stdout (JSON with `--json`); logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use raceline_core::{
    parse_event_date, ExtractedEvent, FailurePhase, FetchState, LinkagePolicy, NonFinishPolicy,
    ScopeFilter,
};
use raceline_store_sqlite::{
    EventQuality, FailureFilter, FailureLedgerEntry, FetchStateRecord, ImputedRow, JoinedRow,
    LinkageCheck, LinkageIssueSeverity, LinkageReport, LoadReport, SqliteRaceStore, StoreSummary,
    UnresolvedName,
};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Raceline ingestion, linkage and projection CLI")]
pub struct Cli {
    #[arg(long, default_value = "./raceline.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the schema.
    Migrate(JsonArgs),
    /// Load extraction bundles (JSON files or directories of them).
    Load(LoadArgs),
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Views {
        #[command(subcommand)]
        command: Box<ViewsCommand>,
    },
    Failures {
        #[command(subcommand)]
        command: Box<FailuresCommand>,
    },
    Fetch {
        #[command(subcommand)]
        command: Box<FetchCommand>,
    },
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ScopeArgs {
    #[arg(long)]
    from_date: Option<String>,
    #[arg(long)]
    to_date: Option<String>,
    #[arg(long = "event-id")]
    event_ids: Vec<String>,
    #[arg(long = "participant")]
    participant_ids: Vec<String>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(long)]
    from_date: Option<String>,
    #[arg(long)]
    to_date: Option<String>,
    #[arg(long = "event-id")]
    event_ids: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    /// Recompute prior-outcome links for participants in scope.
    Run(LinkRunArgs),
    /// Compare stored links with a fresh recomputation.
    Check(LinkCheckArgs),
}

#[derive(Debug, Args)]
pub struct PolicyArgs {
    #[arg(long, value_enum)]
    non_finish: Option<NonFinishArg>,
    #[arg(long)]
    policy_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct LinkRunArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[command(flatten)]
    policy: PolicyArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LinkCheckArgs {
    #[command(flatten)]
    policy: PolicyArgs,
    #[arg(long, default_value_t = 20)]
    sample: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ViewsCommand {
    /// Outcomes joined with event, course and dimension names.
    Joined(ViewArgs),
    /// Per-event median imputation of split and margin.
    Imputed(ViewArgs),
    /// Rebuild the materialized `outcome_imputed` table.
    Materialize(JsonArgs),
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum FailuresCommand {
    List(FailuresListArgs),
    /// Record a fetch or parse failure reported by a collaborator.
    Record(FailuresRecordArgs),
}

#[derive(Debug, Args)]
pub struct FailuresListArgs {
    #[arg(long, value_enum)]
    phase: Option<PhaseArg>,
    #[arg(long)]
    source_id: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct FailuresRecordArgs {
    #[arg(long)]
    source_id: String,
    #[arg(long, value_enum)]
    phase: PhaseArg,
    #[arg(long, default_value = "external")]
    kind: String,
    #[arg(long)]
    message: String,
}

#[derive(Debug, Subcommand)]
pub enum FetchCommand {
    Mark(FetchMarkArgs),
    Show(FetchShowArgs),
    List(FetchListArgs),
    /// Print the given sources that still need fetching.
    Pending(FetchPendingArgs),
}

#[derive(Debug, Args)]
pub struct FetchMarkArgs {
    #[arg(long)]
    source_id: String,
    #[arg(long, value_enum)]
    state: FetchStateArg,
    #[arg(long)]
    detail: Option<String>,
}

#[derive(Debug, Args)]
pub struct FetchShowArgs {
    #[arg(long)]
    source_id: String,
}

#[derive(Debug, Args)]
pub struct FetchListArgs {
    #[arg(long, value_enum)]
    state: Option<FetchStateArg>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct FetchPendingArgs {
    #[arg(long = "source-id")]
    source_ids: Vec<String>,
    /// File with one source id per line.
    #[arg(long)]
    from_file: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Summary(JsonArgs),
    Quality(QualityArgs),
    Unresolved(UnresolvedArgs),
}

#[derive(Debug, Args)]
pub struct QualityArgs {
    #[arg(long)]
    event_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct UnresolvedArgs {
    #[arg(long, default_value = "UNKNOWN")]
    prefix: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum NonFinishArg {
    Propagate,
    NullMetrics,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseArg {
    Fetch,
    Parse,
    Load,
    Linkage,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FetchStateArg {
    Fetched,
    Failed,
    Skipped,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails or finishes with failed units.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteRaceStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle. Every
/// invocation gets a fresh run id that tags its ledger entries.
///
/// # Errors
/// Returns an error when a command fails, or when a load, linkage run or
/// check completes with failed units.
pub fn run_command(command: Command, store: &mut SqliteRaceStore) -> Result<()> {
    let run_id = Ulid::new().to_string();
    match command {
        Command::Migrate(args) => {
            store.migrate()?;
            let version = store.schema_version()?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "schema_version": version }))?
                );
            } else {
                println!(
                    "schema_version={}",
                    version.map_or_else(|| "none".to_string(), |value| value.to_string())
                );
            }
            Ok(())
        }
        Command::Load(args) => run_load(args, store, &run_id),
        Command::Link { command } => run_link(*command, store, &run_id),
        Command::Views { command } => run_views(*command, store),
        Command::Failures { command } => run_failures(*command, store, &run_id),
        Command::Fetch { command } => run_fetch(*command, store, &run_id),
        Command::Report { command } => run_report(*command, store),
    }
}

fn run_load(args: LoadArgs, store: &mut SqliteRaceStore, run_id: &str) -> Result<()> {
    let scope = build_scope(
        args.from_date.as_deref(),
        args.to_date.as_deref(),
        args.event_ids,
        Vec::new(),
    )?;
    let sources = collect_bundle_paths(&args.paths)?;

    let mut report = LoadReport::new(run_id);
    for path in sources {
        let source_id = path.display().to_string();
        let bundles = match read_bundles(&path) {
            Ok(bundles) => bundles,
            Err(err) => {
                let message = format!("{err:#}");
                store.record_failure(&source_id, FailurePhase::Parse, "decode", &message, Some(run_id))?;
                tracing::warn!(source_id = %source_id, error = %message, "bundle file rejected");
                report.note_unparsed(&source_id);
                continue;
            }
        };
        report.merge(store.load_batch(&bundles, &scope, run_id)?);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_load_report(&report);
    }

    if report.has_failures() {
        return Err(anyhow!(
            "load finished with {} rejected sources: {}",
            report.rejected,
            report.rejected_sources.join(", ")
        ));
    }
    Ok(())
}

fn run_link(command: LinkCommand, store: &mut SqliteRaceStore, run_id: &str) -> Result<()> {
    match command {
        LinkCommand::Run(args) => {
            let scope = scope_from_args(args.scope)?;
            let policy = resolve_policy(&args.policy)?;
            let report = store.run_linkage(&scope, &policy, run_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_linkage_report(&report);
            }

            if report.has_failures() {
                return Err(anyhow!(
                    "linkage failed for {} participants: {}",
                    report.participants_failed,
                    report.failed_participants.join(", ")
                ));
            }
            Ok(())
        }
        LinkCommand::Check(args) => {
            let policy = resolve_policy(&args.policy)?;
            let check = store.linkage_check(&policy, args.sample)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else {
                print_linkage_check(&check);
            }

            if !check.healthy {
                return Err(anyhow!(
                    "linkage consistency check failed: {}",
                    check
                        .issues
                        .iter()
                        .filter(|item| item.severity == LinkageIssueSeverity::Error)
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn run_views(command: ViewsCommand, store: &mut SqliteRaceStore) -> Result<()> {
    match command {
        ViewsCommand::Joined(args) => {
            let scope = scope_from_args(args.scope)?;
            let rows = store.joined_projection(&scope, args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_joined_rows(&rows);
            }
            Ok(())
        }
        ViewsCommand::Imputed(args) => {
            let scope = scope_from_args(args.scope)?;
            let mut rows = store.imputed_projection(&scope)?;
            if let Some(limit) = args.limit {
                rows.truncate(limit);
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_imputed_rows(&rows);
            }
            Ok(())
        }
        ViewsCommand::Materialize(args) => {
            let rows = store.rebuild_imputed_table()?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "outcome_imputed_rows": rows }))?
                );
            } else {
                println!("outcome_imputed_rows={rows}");
            }
            Ok(())
        }
    }
}

fn run_failures(command: FailuresCommand, store: &SqliteRaceStore, run_id: &str) -> Result<()> {
    match command {
        FailuresCommand::List(args) => {
            let entries = store.list_failures(&FailureFilter {
                phase: args.phase.map(map_phase),
                source_id: args.source_id,
                run_id: args.run_id,
                limit: args.limit,
            })?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_failures(&entries);
            }
            Ok(())
        }
        FailuresCommand::Record(args) => {
            let entry = store.record_failure(
                &args.source_id,
                map_phase(args.phase),
                &args.kind,
                &args.message,
                Some(run_id),
            )?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
    }
}

fn run_fetch(command: FetchCommand, store: &mut SqliteRaceStore, run_id: &str) -> Result<()> {
    match command {
        FetchCommand::Mark(args) => {
            let record = store.record_fetch_state(
                &args.source_id,
                map_fetch_state(args.state),
                args.detail.as_deref(),
                Some(run_id),
            )?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        FetchCommand::Show(args) => {
            let record = store
                .fetch_state(&args.source_id)?
                .ok_or_else(|| anyhow!("no fetch state recorded for {}", args.source_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        FetchCommand::List(args) => {
            let records = store.list_fetch_states(args.state.map(map_fetch_state))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_fetch_states(&records);
            }
            Ok(())
        }
        FetchCommand::Pending(args) => {
            let mut candidates = args.source_ids;
            if let Some(path) = &args.from_file {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read source list {}", path.display()))?;
                candidates.extend(
                    raw.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(ToString::to_string),
                );
            }
            let pending = store.sources_needing_fetch(&candidates)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else {
                for source_id in &pending {
                    println!("{source_id}");
                }
            }
            Ok(())
        }
    }
}

fn run_report(command: ReportCommand, store: &SqliteRaceStore) -> Result<()> {
    match command {
        ReportCommand::Summary(args) => {
            let summary = store.summary()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        ReportCommand::Quality(args) => {
            let rows = store.quality_report(args.event_id.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_quality(&rows);
            }
            Ok(())
        }
        ReportCommand::Unresolved(args) => {
            let rows = store.unresolved_names(&args.prefix)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_unresolved(&rows);
            }
            Ok(())
        }
    }
}

fn build_scope(
    from_date: Option<&str>,
    to_date: Option<&str>,
    event_ids: Vec<String>,
    participant_ids: Vec<String>,
) -> Result<ScopeFilter> {
    let scope = ScopeFilter {
        from_date: from_date
            .map(parse_event_date)
            .transpose()
            .map_err(|err| anyhow!("invalid --from-date: {err}"))?,
        to_date: to_date
            .map(parse_event_date)
            .transpose()
            .map_err(|err| anyhow!("invalid --to-date: {err}"))?,
        event_ids,
        participant_ids,
    };
    scope.validate().map_err(|err| anyhow!(err.to_string()))?;
    Ok(scope)
}

fn scope_from_args(args: ScopeArgs) -> Result<ScopeFilter> {
    build_scope(
        args.from_date.as_deref(),
        args.to_date.as_deref(),
        args.event_ids,
        args.participant_ids,
    )
}

/// Policy file first, then the `--non-finish` flag on top of it.
fn resolve_policy(args: &PolicyArgs) -> Result<LinkagePolicy> {
    let mut policy = match &args.policy_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read policy file {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("policy file must be valid JSON: {}", path.display()))?;
            LinkagePolicy::from_json(&value).map_err(|err| anyhow!(err.to_string()))?
        }
        None => LinkagePolicy::default(),
    };
    if let Some(non_finish) = args.non_finish {
        policy.non_finish = map_non_finish(non_finish);
    }
    Ok(policy)
}

/// Expands directories into their `*.json` files, sorted by path.
fn collect_bundle_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path)
                .with_context(|| format!("failed to read bundle directory {}", path.display()))?
            {
                let entry = entry
                    .with_context(|| format!("failed to list bundle directory {}", path.display()))?;
                let candidate = entry.path();
                if candidate.is_file() && candidate.extension().is_some_and(|ext| ext == "json") {
                    files.push(candidate);
                }
            }
            files.sort();
            collected.extend(files);
        } else {
            collected.push(path.clone());
        }
    }
    Ok(collected)
}

/// A bundle file holds either one extraction object or an array of them.
fn read_bundles(path: &Path) -> Result<Vec<ExtractedEvent>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("bundle file is not valid JSON: {}", path.display()))?;

    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("bundle[{index}] in {} does not decode", path.display()))
            })
            .collect(),
        other => {
            let bundle = serde_json::from_value(other)
                .with_context(|| format!("bundle in {} does not decode", path.display()))?;
            Ok(vec![bundle])
        }
    }
}

fn map_non_finish(value: NonFinishArg) -> NonFinishPolicy {
    match value {
        NonFinishArg::Propagate => NonFinishPolicy::Propagate,
        NonFinishArg::NullMetrics => NonFinishPolicy::NullMetrics,
    }
}

fn map_phase(value: PhaseArg) -> FailurePhase {
    match value {
        PhaseArg::Fetch => FailurePhase::Fetch,
        PhaseArg::Parse => FailurePhase::Parse,
        PhaseArg::Load => FailurePhase::Load,
        PhaseArg::Linkage => FailurePhase::Linkage,
    }
}

fn map_fetch_state(value: FetchStateArg) -> FetchState {
    match value {
        FetchStateArg::Fetched => FetchState::Fetched,
        FetchStateArg::Failed => FetchState::Failed,
        FetchStateArg::Skipped => FetchState::Skipped,
    }
}

fn opt_f64(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |raw| format!("{raw:.2}"))
}

fn opt_display<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |raw| raw.to_string())
}

fn print_load_report(report: &LoadReport) {
    println!(
        "run_id={} processed={} committed={} rejected={} skipped={} outcome_rows={} created_entities={}",
        report.run_id,
        report.processed,
        report.committed,
        report.rejected,
        report.skipped,
        report.outcome_rows,
        report.created_entities
    );
    if !report.rejected_sources.is_empty() {
        println!("rejected_sources={}", report.rejected_sources.join(","));
        println!(
            "hint=run `rl failures list --run-id {}` for the recorded errors",
            report.run_id
        );
    }
}

fn print_linkage_report(report: &LinkageReport) {
    println!(
        "run_id={} policy={} participants={} failed={} rows={} linked={} unlinked={} undated={} ambiguous_dates={}",
        report.run_id,
        report.non_finish_policy.as_str(),
        report.participants_processed,
        report.participants_failed,
        report.rows_processed,
        report.rows_linked,
        report.rows_unlinked,
        report.undated_rows,
        report.ambiguities.len()
    );
    for ambiguity in &report.ambiguities {
        println!(
            "ambiguity participant={} date={} events={}",
            ambiguity.participant_id,
            ambiguity.event_date,
            ambiguity.event_ids.join(",")
        );
    }
}

fn print_linkage_check(check: &LinkageCheck) {
    println!(
        "contract={} policy={} participants={} rows={} never_linked={} drifted={} ambiguous_dates={} undated={}",
        check.contract_version,
        check.non_finish_policy.as_str(),
        check.participants_checked,
        check.rows_checked,
        check.never_linked_rows,
        check.drifted_rows,
        check.ambiguous_dates,
        check.undated_rows
    );
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    if !check.issues.is_empty() {
        let formatted = check
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    LinkageIssueSeverity::Warning => "warning",
                    LinkageIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
    for drift in &check.drift_sample {
        println!(
            "drift participant={} event={} stored_prev={} expected_prev={}",
            drift.participant_id,
            drift.event_id,
            drift.stored.prev_event_id.as_deref().unwrap_or("none"),
            drift.expected.prev_event_id.as_deref().unwrap_or("none")
        );
    }
    if check.drifted_rows > 0 || check.never_linked_rows > 0 {
        println!("hint=run `rl link run` to recompute links");
    }
}

fn print_joined_rows(rows: &[JoinedRow]) {
    println!(
        "{:<16} {:<10} {:<4} {:<14} {:<5} {:<14} {:>7} {:>7} {:<16} {:>5}",
        "event_id", "date", "race", "participant", "rank", "status", "split", "margin", "prev_event", "days"
    );
    println!("{}", "-".repeat(110));
    for row in rows {
        println!(
            "{:<16} {:<10} {:<4} {:<14} {:<5} {:<14} {:>7} {:>7} {:<16} {:>5}",
            row.event_id,
            row.event_date.as_deref().unwrap_or("-"),
            row.race_no,
            row.participant_id,
            opt_display(row.rank),
            row.status.as_str(),
            opt_f64(row.split_sec),
            opt_f64(row.margin_sec),
            row.prev_event_id.as_deref().unwrap_or("-"),
            opt_display(row.days_since_last)
        );
    }
}

fn print_imputed_rows(rows: &[ImputedRow]) {
    println!(
        "{:<16} {:<14} {:>7} {:<8} {:>7} {:<8}",
        "event_id", "participant", "split", "imputed", "margin", "imputed"
    );
    println!("{}", "-".repeat(70));
    for row in rows {
        println!(
            "{:<16} {:<14} {:>7} {:<8} {:>7} {:<8}",
            row.event_id,
            row.participant_id,
            opt_f64(row.split_sec),
            if row.split_missing { "yes" } else { "no" },
            opt_f64(row.margin_sec),
            if row.margin_missing { "yes" } else { "no" }
        );
    }
}

fn print_failures(entries: &[FailureLedgerEntry]) {
    println!(
        "{:<6} {:<24} {:<8} {:<12} {:<26} message",
        "seq", "source_id", "phase", "kind", "run_id"
    );
    println!("{}", "-".repeat(110));
    for entry in entries {
        println!(
            "{:<6} {:<24} {:<8} {:<12} {:<26} {}",
            entry.entry_seq,
            entry.source_id,
            entry.phase.as_str(),
            entry.error_kind,
            entry.run_id.as_deref().unwrap_or("-"),
            entry.error_message
        );
    }
}

fn print_fetch_states(records: &[FetchStateRecord]) {
    println!(
        "{:<24} {:<8} {:<8} {:<22} detail",
        "source_id", "state", "attempts", "updated_at"
    );
    println!("{}", "-".repeat(80));
    for record in records {
        println!(
            "{:<24} {:<8} {:<8} {:<22} {}",
            record.source_id,
            record.state.as_str(),
            record.attempts,
            record.updated_at,
            record.detail.as_deref().unwrap_or("-")
        );
    }
}

fn print_summary(summary: &StoreSummary) {
    println!(
        "contract={} events={} undated_events={} first_date={} last_date={}",
        summary.contract_version,
        summary.events,
        summary.undated_events,
        summary.first_event_date.as_deref().unwrap_or("n/a"),
        summary.last_event_date.as_deref().unwrap_or("n/a")
    );
    println!(
        "outcomes={} linked={} never_linked={} participants={} handlers={} operators={} courses={}",
        summary.outcomes,
        summary.linked_outcomes,
        summary.never_linked_outcomes,
        summary.participants,
        summary.handlers,
        summary.operators,
        summary.courses
    );
    for (phase, count) in &summary.failures_by_phase {
        println!("failures.{phase}={count}");
    }
    for (state, count) in &summary.fetch_states {
        println!("fetch_state.{state}={count}");
    }
}

fn print_quality(rows: &[EventQuality]) {
    println!(
        "{:<16} {:<10} {:>5} {:>5} {:>7} {:>6} {:>5} {:>6} {:>7} {:>8}",
        "event_id", "date", "rows", "rank", "elapsed", "margin", "split", "corner", "handler", "operator"
    );
    println!("{}", "-".repeat(90));
    for row in rows {
        println!(
            "{:<16} {:<10} {:>5} {:>5} {:>7} {:>6} {:>5} {:>6} {:>7} {:>8}",
            row.event_id,
            row.event_date.as_deref().unwrap_or("-"),
            row.outcome_rows,
            row.rank_nulls,
            row.elapsed_nulls,
            row.margin_nulls,
            row.split_nulls,
            row.corner_nulls,
            row.handler_nulls,
            row.operator_nulls
        );
    }
}

fn print_unresolved(rows: &[UnresolvedName]) {
    println!("{:<12} {:<20} {:<24} outcome_rows", "kind", "entity_id", "name");
    println!("{}", "-".repeat(72));
    for row in rows {
        println!(
            "{:<12} {:<20} {:<24} {}",
            row.kind.as_str(),
            row.entity_id,
            row.name,
            row.outcome_rows
        );
    }
}
