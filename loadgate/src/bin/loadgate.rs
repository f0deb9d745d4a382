use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use loadgate::{
    Reporter,
    config::{Document, LoadConfig, parse_duration, split_list},
    error::{ConfigError, Error},
    executor::UserExecutor,
    gate::Verdict,
    pipeline::{self, AnalysisPlan, ExitStatus, Plan, RunOptions, RunOutcome},
    report::{JsonReporter, StdoutReporter},
    starter,
    transport::HttpTransport,
};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "loadgate")]
#[command(about = "Run declarative HTTP load scenarios and gate them against baselines", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration document (JSON, or YAML by extension)
    #[arg(long, short, global = true, default_value = starter::DEFAULT_PATH)]
    config: PathBuf,

    /// Artifacts storage directory
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration document
    Init {
        /// Output path (defaults to --config)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Target host written into the document
        #[arg(long, default_value = starter::DEFAULT_HOST)]
        host: String,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Run the scenario and record metrics, without judging them
    Run(RunArgs),

    /// Judge a stored run against the baseline and gate
    Analyze {
        /// Run to analyze
        #[arg(long, env = "LOADGATE_RUN_ID")]
        run_id: Option<String>,

        #[command(flatten)]
        analysis: AnalysisArgs,

        /// Make the run the baseline when it passes
        #[arg(long, alias = "set-baseline")]
        promote: bool,
    },

    /// Run, analyze and exit non-zero when the verdict reaches fail_on
    Ci(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Unique run identifier
    #[arg(long, env = "LOADGATE_RUN_ID")]
    run_id: Option<String>,

    /// Target host URL
    #[arg(long)]
    host: Option<String>,

    /// Number of virtual users
    #[arg(long, short)]
    users: Option<u32>,

    /// Users started per second
    #[arg(long)]
    spawn_rate: Option<f64>,

    /// Test duration, e.g. 1m or 30s
    #[arg(long, value_parser = parse_duration)]
    run_time: Option<Duration>,

    /// Grace period for in-flight requests once run time is over
    #[arg(long, value_parser = parse_duration)]
    stop_timeout: Option<Duration>,

    /// Only requests carrying one of these tags (comma-separated)
    #[arg(long)]
    tags: Option<String>,

    /// Drop requests carrying any of these tags (comma-separated)
    #[arg(long)]
    exclude_tags: Option<String>,

    /// Seed for request selection and think times
    #[arg(long)]
    seed: Option<u64>,

    #[command(flatten)]
    analysis: AnalysisArgs,

    /// Make this run the baseline when it passes
    #[arg(long, alias = "set-baseline")]
    promote: bool,
}

#[derive(Args, Debug)]
struct AnalysisArgs {
    /// Compare against this stored run instead of the promoted baseline
    #[arg(long)]
    baseline: Option<String>,

    /// Rules file (JSON, `{"rules": [...]}`)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Lowest verdict that fails the process
    #[arg(long, value_parser = parse_verdict)]
    fail_on: Option<Verdict>,

    /// Also write the analysis (or, without one, the metrics) as JSON here
    #[arg(long)]
    json_out: Option<PathBuf>,
}

fn parse_verdict(raw: &str) -> Result<Verdict, String> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_uppercase()))
        .map_err(|_| format!("`{raw}` is not one of PASS, WARNING, DEGRADATION"))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            tracing::error!(error = %e, "loadgate failed");
            eprintln!("error: {e}");
            ExitStatus::for_error(&e).into()
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<ExitStatus, Error> {
    match cli.command {
        Commands::Init {
            output,
            host,
            force,
        } => {
            let path = output.unwrap_or(cli.config);
            starter::write(&path, &host, force)?;
            println!("Created {}", path.display());
            println!("Next steps:");
            println!("  1. Edit {} for your service", path.display());
            println!("  2. Run: loadgate ci --config {}", path.display());
            Ok(ExitStatus::Success)
        }
        Commands::Run(args) => run(&cli.config, cli.storage, args, false).await,
        Commands::Ci(args) => run(&cli.config, cli.storage, args, true).await,
        Commands::Analyze {
            run_id,
            analysis,
            promote,
        } => {
            let mut doc = Document::from_path(&cli.config)?;
            apply_artifacts(&mut doc, cli.storage);
            apply_analysis(&mut doc, &analysis);
            let plan = AnalysisPlan::prepare(&doc)?;

            let run_id = run_id
                .or_else(|| doc.artifacts.run_id.clone())
                .ok_or_else(|| ConfigError::missing("--run-id"))?;
            let opts = options(None, &analysis, promote, true);
            let outcome = pipeline::analyze(&plan, &run_id, &opts).await?;
            report(&outcome, analysis.json_out).await?;
            Ok(outcome.exit)
        }
    }
}

async fn run(
    config: &Path,
    storage: Option<PathBuf>,
    args: RunArgs,
    analyze: bool,
) -> Result<ExitStatus, Error> {
    let mut doc = Document::from_path(config)?;
    apply_artifacts(&mut doc, storage);
    apply_analysis(&mut doc, &args.analysis);
    apply_load(&mut doc, &args);
    let plan = Plan::prepare(&doc)?;

    let transport = HttpTransport::new(&plan.params.host)?;
    let mut executor = UserExecutor::builder()
        .transport(Arc::new(transport))
        .build();

    let run_id = args.run_id.clone().or_else(|| doc.artifacts.run_id.clone());
    let mut opts = options(run_id, &args.analysis, args.promote, analyze);
    opts.config_path = Some(config.to_path_buf());

    let outcome = pipeline::execute(&plan, &mut executor, &opts).await?;
    report(&outcome, args.analysis.json_out).await?;
    Ok(outcome.exit)
}

fn options(
    run_id: Option<String>,
    analysis: &AnalysisArgs,
    promote: bool,
    analyze: bool,
) -> RunOptions {
    let mut opts = RunOptions::builder().analyze(analyze).promote(promote).build();
    opts.run_id = run_id;
    opts.baseline_run = analysis.baseline.clone();
    opts
}

async fn report(outcome: &RunOutcome, json_out: Option<PathBuf>) -> Result<(), Error> {
    println!("run {}", outcome.run_id);
    StdoutReporter.report(&outcome.metrics).await?;
    if let Some(analysis) = &outcome.analysis {
        StdoutReporter.report(analysis).await?;
    }
    if outcome.promoted {
        println!("baseline updated to {}", outcome.run_id);
    }

    if let Some(path) = json_out {
        let reporter = JsonReporter { path };
        match &outcome.analysis {
            Some(analysis) => reporter.report(analysis).await?,
            None => reporter.report(&outcome.metrics).await?,
        }
    }
    Ok(())
}

fn apply_artifacts(doc: &mut Document, storage: Option<PathBuf>) {
    if let Some(storage) = storage {
        doc.artifacts.storage = Some(storage.to_string_lossy().into_owned());
    }
}

fn apply_analysis(doc: &mut Document, args: &AnalysisArgs) {
    if let Some(rules) = &args.rules {
        doc.analysis.rules_file = Some(rules.clone());
    }
    if let Some(fail_on) = args.fail_on {
        doc.analysis.fail_on = Some(fail_on);
    }
}

/// Command-line load settings win over the document's.
fn apply_load(doc: &mut Document, args: &RunArgs) {
    let overrides = LoadConfig {
        host: args.host.clone(),
        users: args.users.map(i64::from),
        spawn_rate: args.spawn_rate,
        run_time: args.run_time,
        stop_timeout: args.stop_timeout,
        tags: args.tags.as_deref().map(|t| split_list(t.split(','))).unwrap_or_default(),
        exclude_tags: args
            .exclude_tags
            .as_deref()
            .map(|t| split_list(t.split(',')))
            .unwrap_or_default(),
        seed: args.seed,
        ..Default::default()
    };
    match doc.locust.as_mut() {
        Some(locust) => locust.load = overrides.or(&locust.load),
        None => doc.load = Some(overrides.or(&doc.load.clone().unwrap_or_default())),
    }
}
