//! # Harvest CLI (`harvest`)
//!
//! Runs a single harvest task, given as a JSON file or inline JSON, or
//! schedules it with a trigger.
//!
//! ## Usage
//!
//! ```bash
//! harvest [--config ./config/harvest.toml] [-V] -f <task.json>
//! harvest -t '<task definition json>'
//! harvest -f task.json --trigger PERIOD --trigger-arg t-period=P1D
//! harvest --list
//! ```
//!
//! ## Task file
//!
//! ```json
//! {
//!   "source": { "type": "WAF", "properties": { "waf-host-url": "http://host/waf/" } },
//!   "destinations": [
//!     { "action": { "type": "FOLDER", "properties": { "folder-root-folder": "./out" } } }
//!   ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgAction, CommandFactory, Parser};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use harvester::config::{self, Config};
use harvester::engine::Engine;
use harvester::models::{TaskDefinition, TriggerDefinition};
use harvester::report::ReportCounters;
use harvester::traits::IteratorContext;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Harvests metadata from a source and publishes it to destinations.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Harvests catalog metadata from a source and publishes it to destinations",
    disable_version_flag = true
)]
struct Cli {
    /// Print the version information and exit.
    #[arg(short = 'v', long)]
    version: bool,

    /// Be extra verbose; repeat for more detail.
    #[arg(short = 'V', long, action = ArgAction::Count)]
    verbose: u8,

    /// Execute the task defined in the file.
    #[arg(short = 'f', long, value_name = "FILE", conflicts_with = "task")]
    file: Option<PathBuf>,

    /// Execute the task defined as JSON.
    #[arg(short = 't', long, value_name = "JSON")]
    task: Option<String>,

    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml` when that file exists.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// List the templates of every connector, filter, transformer and
    /// trigger type.
    #[arg(long)]
    list: bool,

    /// Schedule the task with this trigger type (NOW, AT, PERIOD) and keep
    /// running until interrupted.
    #[arg(long, value_name = "TYPE")]
    trigger: Option<String>,

    /// Trigger property, e.g. `t-period=P1D`. May be repeated.
    #[arg(long = "trigger-arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    trigger_args: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn print_header() {
    println!("Harvest ver. {}", VERSION);
}

fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harvester={level},harvest={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_task(file: Option<&Path>, inline: Option<&str>) -> Result<TaskDefinition> {
    let json = match (file, inline) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file: {}", path.display()))?,
        (None, Some(json)) => json.to_string(),
        (None, None) => bail!("no task given"),
    };
    serde_json::from_str(&json).context("Failed to parse task definition")
}

fn print_templates(engine: &Engine) {
    for (kind, templates) in engine.templates() {
        println!("[{}]", kind);
        for template in templates {
            print!("{}", template);
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("Version: {}", VERSION);
        return Ok(());
    }
    if !cli.list && cli.file.is_none() && cli.task.is_none() {
        print_header();
        Cli::command().print_help()?;
        println!();
        return Ok(());
    }

    let cfg: Config = config::load_or_default(cli.config.as_deref())?;
    init_logging(cli.verbose, &cfg.logging.level);

    let engine = Engine::bootstrap(&cfg)
        .await
        .context("Failed to start the harvesting engine")?;

    if cli.list {
        print_templates(&engine);
        if cli.file.is_none() && cli.task.is_none() {
            return Ok(());
        }
    }

    let task = read_task(cli.file.as_deref(), cli.task.as_deref())?;
    engine
        .validate_task(&task)
        .context("Invalid task definition")?;

    match cli.trigger {
        Some(trigger_type) => schedule(&engine, task, trigger_type, cli.trigger_args).await,
        None => run_once(&engine, &task).await,
    }
}

async fn run_once(engine: &Engine, task: &TaskDefinition) -> Result<()> {
    let process = engine.prepare(task, None, IteratorContext::default())?;
    let report = Arc::new(ReportCounters::default());
    process.add_listener(report.clone());
    process.begin().await?;

    tokio::select! {
        _ = process.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, stopping harvest...");
            let _ = process.abort().await;
            process.wait().await;
        }
    }
    println!("{}", report.summary());
    Ok(())
}

async fn schedule(
    engine: &Arc<Engine>,
    task: TaskDefinition,
    trigger_type: String,
    args: Vec<(String, String)>,
) -> Result<()> {
    let task_id = engine.create_task(task);
    let definition = TriggerDefinition {
        trigger_type: trigger_type.to_ascii_uppercase(),
        task_definition: None,
        properties: args.into_iter().collect::<BTreeMap<_, _>>(),
    };
    let trigger_id = engine
        .schedule(Some(task_id), definition)
        .await
        .context("Failed to schedule task")?;
    println!("Trigger {} scheduled, press Ctrl-C to stop.", trigger_id);

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;

    let history = engine.task_history(&task_id).await?;
    for event in history.events() {
        let r = &event.report;
        println!(
            "{} acquired: {}, created: {}, updated: {}, failed: {}",
            event.started.to_rfc3339(),
            r.acquired,
            r.created,
            r.updated,
            r.failed
        );
    }
    Ok(())
}
