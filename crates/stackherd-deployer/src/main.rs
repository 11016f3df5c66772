//! stackherd: deploy, delete and clean up sets of CloudFormation stacks
//!
//! Reads a JSON stack file and runs one operation over the stacks it
//! defines, in dependency order where that matters.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use stackherd::config::EngineConfig;
use stackherd::{CleanupReport, Deployer, GraphReport, StackConfig, StackFile};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stackherd")]
#[command(about = "Dependency-ordered CloudFormation deployments")]
#[command(version)]
struct Args {
    /// Stack file to read
    #[arg(short, long, default_value = "stackherd.json")]
    file: PathBuf,

    /// Only operate on stacks with these names (repeatable)
    #[arg(short, long = "stack")]
    stacks: Vec<String>,

    /// AWS calls admitted per rate-limit window
    #[arg(long, env = "STACKHERD_RATE_LIMIT")]
    rate_limit: Option<usize>,

    /// Rate-limit window in milliseconds
    #[arg(long, env = "STACKHERD_RATE_INTERVAL_MS")]
    rate_interval_ms: Option<u64>,

    /// AWS profile to use (overrides the stack file)
    #[arg(long, env = "AWS_PROFILE")]
    aws_profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package and deploy stacks, dependencies first
    Deploy,
    /// Delete stacks, dependents first, then collect what they left behind
    Delete,
    /// Collect retained resources and unreferenced artifacts
    Cleanup,
    /// Package templates and print the results without deploying
    Package,
    /// Fetch stack outputs and write configured output files
    Sync,
    /// Print the status of each stack
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if let Some(hint) = stackherd::aws::classify_anyhow_error(e).suggestion() {
        let _ = writeln!(stderr, "\n\x1b[36mHint:\x1b[0m {hint}");
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("aws_config=warn".parse()?)
                .add_directive("aws_sdk_cloudformation=warn".parse()?)
                .add_directive("aws_sdk_s3=warn".parse()?)
                .add_directive("aws_smithy_runtime=warn".parse()?),
        )
        .init();

    let file = StackFile::load(&args.file)?;
    let config = engine_config(file.engine, &args);
    let stacks = select_stacks(file.stacks, &args.stacks)?;
    let region = stacks
        .first()
        .map(|s| s.region.clone())
        .context("Stack file defines no stacks")?;

    if let Some(profile) = &config.profile {
        info!(profile = %profile, "Using AWS profile");
    }
    let deployer = Deployer::connect(&config, &region).await?;

    if let Some(limiter) = deployer.limiter().cloned() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting pending AWS calls");
                limiter.abort();
            }
        });
    }

    match args.command {
        Command::Deploy => {
            let report = deployer.deploy(&stacks).await?;
            print_graph(&report, "deployed");
            ensure_success(&report)?;
        }
        Command::Delete => {
            let report = deployer.del(&stacks).await?;
            print_graph(&report.graph, "deleted");
            print_cleanup(&report.cleanup);
            ensure_success(&report.graph)?;
            if !report.cleanup.is_success() {
                bail!("Cleanup after delete finished with failures");
            }
        }
        Command::Cleanup => {
            let report = deployer.cleanup(&stacks).await?;
            print_cleanup(&report);
            if !report.is_success() {
                bail!("Cleanup finished with failures");
            }
        }
        Command::Package => {
            for packaged in deployer.pkg(&stacks).await? {
                match &packaged.url {
                    Some(url) => println!("{}: {url}", packaged.stack),
                    None => println!("{}: nothing to upload", packaged.stack),
                }
                println!("{}", packaged.body);
            }
        }
        Command::Sync => {
            let synced = deployer.sync(&stacks).await?;
            println!("{}", serde_json::to_string_pretty(&outputs_json(&synced))?);
        }
        Command::Status => {
            let mut table = new_table(&["Stack", "Status"]);
            for stack in &stacks {
                let status = deployer.status(stack).await?;
                table.add_row(vec![Cell::new(stack.id()), Cell::new(status)]);
            }
            println!("{table}");
        }
    }

    Ok(())
}

/// Stack file settings, overridden by flags and environment.
fn engine_config(mut config: EngineConfig, args: &Args) -> EngineConfig {
    if let Some(limit) = args.rate_limit {
        config.rate_limit = limit;
    }
    if let Some(interval) = args.rate_interval_ms {
        config.rate_interval_ms = interval;
    }
    if args.aws_profile.is_some() {
        config.profile = args.aws_profile.clone();
    }
    config
}

fn select_stacks(stacks: Vec<StackConfig>, names: &[String]) -> Result<Vec<StackConfig>> {
    if names.is_empty() {
        return Ok(stacks);
    }
    for name in names {
        if !stacks.iter().any(|s| &s.name == name) {
            bail!("Stack file has no stack named '{name}'");
        }
    }
    Ok(stacks
        .into_iter()
        .filter(|s| names.contains(&s.name))
        .collect())
}

fn outputs_json(
    synced: &std::collections::BTreeMap<stackherd::StackRef, stackherd::deployer::Outputs>,
) -> serde_json::Value {
    synced
        .iter()
        .map(|(id, outputs)| (id.to_string(), serde_json::json!(outputs)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn print_graph(report: &GraphReport, verb: &str) {
    for id in &report.succeeded {
        println!("\x1b[32m✓\x1b[0m {id} {verb}");
    }
    for (id, error) in &report.failed {
        println!("\x1b[31m✗\x1b[0m {id}: {error:#}");
    }
    for id in &report.blocked {
        println!("\x1b[33m-\x1b[0m {id} skipped, a prerequisite failed");
    }
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(Cell::new));
    table
}

fn print_cleanup(report: &CleanupReport) {
    if !report.retained.entries.is_empty() {
        let mut table = new_table(&["Result", "Stack", "Region", "Resource"]);
        for entry in &report.retained.entries {
            table.add_row(vec![
                Cell::new(entry.result),
                Cell::new(&entry.stack),
                Cell::new(&entry.region),
                Cell::new(&entry.arn),
            ]);
        }
        println!("{table}");
    }
    let skipped = report.retained.skipped().count();
    if skipped > 0 {
        println!("{skipped} retained resources were kept; set flags.forceDelete to remove them.");
    }

    let pruned = &report.pruned;
    if !pruned.deleted.is_empty() || !pruned.failed.is_empty() {
        let mut table = new_table(&["Result", "Object"]);
        for (result, objects) in [("Pruned", &pruned.deleted), ("Failed", &pruned.failed)] {
            for object in objects {
                table.add_row(vec![
                    Cell::new(result),
                    Cell::new(format!("s3://{}/{}", object.bucket, object.key)),
                ]);
            }
        }
        println!("{table}");
    }
    println!(
        "Artifacts examined: {}, kept: {}, deleted: {}",
        pruned.examined,
        pruned.kept,
        pruned.deleted.len()
    );
}

fn ensure_success(report: &GraphReport) -> Result<()> {
    if report.is_success() {
        Ok(())
    } else {
        bail!(
            "{} stacks failed, {} skipped",
            report.failed.len(),
            report.blocked.len()
        )
    }
}
