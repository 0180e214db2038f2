use anyhow::{anyhow, Result};
use is_terminal::IsTerminal;
use nsharness::{Config, Runner, Scenario, SharedConfig};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut args = std::env::args();
    let program_name = args.next().unwrap_or("nsharness".to_string());
    let config = config_init(&program_name, args.next())?;
    let scenario_files: Vec<String> = args.collect();
    if scenario_files.is_empty() {
        return Err(usage(&program_name));
    }

    let mut scenarios = Vec::new();
    for file in &scenario_files {
        let loaded = Scenario::load_all(file).await?;
        tracing::debug!("loaded {} scenario(s) from {file}", loaded.len());
        scenarios.extend(loaded);
    }

    let mut servers = config.servers();
    let engine = config.template_engine();
    let mut runner = Runner::new(
        &mut servers,
        &engine,
        config.transport_options(),
        config.log_timeout,
    );

    let run_all = async {
        let mut failed = Vec::new();
        for scenario in &scenarios {
            tracing::info!("running \"{}\"", scenario.name);
            if let Err(err) = runner.run(scenario).await {
                tracing::error!("FAIL \"{}\": {err}", scenario.name);
                failed.push(scenario.name.as_str());
            } else {
                tracing::info!("PASS \"{}\"", scenario.name);
            }
        }
        failed
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
            Err(anyhow!("interrupted"))
        },
        failed = run_all => {
            if failed.is_empty() {
                tracing::info!("all {} scenario(s) passed", scenarios.len());
                Ok(())
            } else {
                Err(anyhow!(
                    "{} of {} scenario(s) failed: {}",
                    failed.len(),
                    scenarios.len(),
                    failed.join(", ")
                ))
            }
        }
    }
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nsharness=info".into()),
        )
        .init();
}

fn usage(program_name: &str) -> anyhow::Error {
    anyhow!("usage: {program_name} /path/to/config.json /path/to/scenarios.json...")
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(usage(program_name)),
        Some(config_file) => {
            let config = Config::try_from_file(&config_file)?;
            tracing::debug!("loaded config from {config_file}");
            Ok(Arc::new(config))
        }
    }
}
