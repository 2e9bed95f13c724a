/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{bail, Context};
use colored::Colorize;
use scalebench::{
    clap_args::{self, Commands},
    cluster::KubernetesPlatform,
    config::Config,
    executor::{ExecutorSettings, ScenarioExecutor},
    governor::ResourceGovernor,
    images::{credentials_from_env, planned_images, ImageBuilder},
    orchestrator::Orchestrator,
    report,
    results::{write_summary, ResultLog},
    runtime::DockerRuntime,
    slots::{SlotManager, SlotSettings},
};
use std::{path::Path, process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, warn, Subscriber};
use tracing_subscriber::EnvFilter;

const EXAMPLE_CONFIG_PATH: &str = "scalebench.toml";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = clap_args::parse();

    let config = match &args.command {
        Commands::Init => {
            init_subscriber(get_subscriber(log_level(args.verbose, None)));
            let path = Path::new(EXAMPLE_CONFIG_PATH);
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            Config::write_example_to_file(path)?;
            println!("Written example config to {}", path.display().to_string().green());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Build { config, .. }
        | Commands::Run { config, .. }
        | Commands::Status { config } => load_config(config)?,
    };
    init_subscriber(get_subscriber(log_level(
        args.verbose,
        config.log_level.as_deref(),
    )));

    match args.command {
        Commands::Init => Ok(ExitCode::SUCCESS),

        Commands::Build { force, variant, .. } => {
            let variants = selected_variants(&config, &variant)?;
            let runtime = DockerRuntime::connect()?;
            runtime.ensure_reachable().await?;
            build_images(&runtime, &config, &variants, force).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            keep_data,
            skip_build,
            variant,
            ..
        } => {
            let variants = selected_variants(&config, &variant)?;
            let passed = run(config, variants, keep_data, skip_build).await?;
            Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Status { .. } => {
            let platform = Arc::new(KubernetesPlatform::new(&config, None)?);
            let slots = slot_manager(&config, platform);
            let status = slots.resource_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::try_from_path(path)
        .context(format!("Unable to load {}, try `scalebench init`", path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// RUST_LOG wins, then -v, then the config file.
fn log_level(verbose: u8, configured: Option<&str>) -> String {
    match (verbose, configured) {
        (0, Some(level)) => level.to_string(),
        (0, None) => "info".to_string(),
        (1, _) => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn selected_variants(config: &Config, requested: &[String]) -> anyhow::Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.matrix.variants.clone());
    }
    for variant in requested {
        if !config.matrix.variants.contains(variant) {
            bail!(
                "Unknown variant {}, expected one of {}",
                variant,
                config.matrix.variants.join(", ")
            );
        }
    }
    Ok(requested.to_vec())
}

async fn build_images(
    runtime: &DockerRuntime,
    config: &Config,
    variants: &[String],
    force: bool,
) -> anyhow::Result<()> {
    let specs = planned_images(&config.images, variants)?;
    println!("> preparing {} images", specs.len());
    let builder = ImageBuilder::new(
        runtime.docker().clone(),
        config.images.push,
        credentials_from_env(),
    );
    builder.build_and_push_all(specs, force).await
}

fn slot_manager(config: &Config, health: Arc<KubernetesPlatform>) -> Arc<SlotManager> {
    let governor = Arc::new(ResourceGovernor::with_sysinfo(config.resources.clone()));
    Arc::new(SlotManager::new(
        governor,
        health,
        SlotSettings::from(&config.concurrency),
    ))
}

async fn run(
    config: Config,
    variants: Vec<String>,
    keep_data: bool,
    skip_build: bool,
) -> anyhow::Result<bool> {
    // pre-flight
    let runtime = DockerRuntime::connect()?;
    runtime.ensure_reachable().await?;

    if skip_build {
        info!("Skipping image build");
    } else {
        build_images(&runtime, &config, &variants, false).await?;
    }

    let platform = Arc::new(KubernetesPlatform::new(&config, Some(runtime))?);
    platform.setup().await?;

    let slots = slot_manager(&config, platform.clone());
    let executor = Arc::new(ScenarioExecutor::new(
        platform.clone(),
        platform.clone(),
        slots.clone(),
        ExecutorSettings::from_config(&config),
    ));

    let clear_previous = config.output.clear_previous && !keep_data;
    let log = ResultLog::create(&config.output.results_dir, clear_previous)?;
    let results_dir = log.dir().to_path_buf();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        println!("\n{}", "Interrupted, finishing running scenarios (Ctrl-C again to exit)".yellow());
        token.cancel();
    })
    .context("Unable to install the Ctrl-C handler")?;

    let mut orchestrator = Orchestrator::from_config(executor, Box::new(log), &config, cancel);
    let passed = orchestrator.run_all(&variants).await;

    slots.reset();
    if let Err(e) = platform.cleanup_all().await {
        warn!("{:#}", e);
    }

    let summary_path = write_summary(&results_dir, orchestrator.summaries())?;
    report::print_summary(orchestrator.summaries());
    println!(
        "\nResults written to {} (summary in {})",
        results_dir.display().to_string().green(),
        summary_path.display()
    );

    Ok(passed)
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .pretty()
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) {
    if let Err(e) = set_global_default(subscriber) {
        eprintln!("Unable to set the tracing subscriber: {}", e);
    }
}
