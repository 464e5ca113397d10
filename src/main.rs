use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::EngineArgs;
use crate::core::domain::{ExecuteRequest, JudgeRequest, RunMode};
use crate::core::engine::JudgeEngine;
use crate::core::languages::LanguageRegistry;
use crate::core::pool::PoolManager;
use crate::core::traits::backend::Backend;
use crate::docker::backend::DockerBackend;

mod config;
mod constants;
mod core;
mod docker;
#[cfg(test)]
mod stubs;

#[derive(Parser)]
#[command(name = "judge-core", version)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Judge a submission against its test cases and print the verdict as JSON
    Judge {
        /// JSON file with language, code, test_cases and optional limits
        #[arg(long)]
        request: PathBuf,

        /// Evaluate every case instead of stopping at the first failure
        #[arg(long)]
        run_all: bool,
    },
    /// Run a program once on a given stdin and print what it did
    Run {
        #[arg(long)]
        language: String,

        #[arg(long)]
        source: PathBuf,

        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        #[arg(long)]
        time_limit_ms: Option<u64>,

        #[arg(long)]
        memory_limit_mb: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();

    let backend: Arc<dyn Backend> = Arc::new(DockerBackend::new(&cli.engine.docker_bin));
    let settings = cli.engine.pool_settings();
    let pools = Arc::new(PoolManager::new(backend.clone(), settings));
    let engine = JudgeEngine::new(
        backend,
        pools.clone(),
        Arc::new(LanguageRegistry::default()),
        cli.engine.judge_settings(),
    );

    let result = tokio::select! {
        result = dispatch(&engine, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, tearing down slots");
            Ok(ExitCode::from(130))
        }
    };
    pools.shutdown().await;

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(
    engine: &JudgeEngine,
    command: Command,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let json = match command {
        Command::Judge { request, run_all } => {
            let mut request: JudgeRequest =
                serde_json::from_str(&tokio::fs::read_to_string(request).await?)?;
            if run_all {
                request.mode = RunMode::RunAll;
            }
            serde_json::to_string_pretty(&engine.judge(&request).await?)?
        }
        Command::Run {
            language,
            source,
            stdin,
            time_limit_ms,
            memory_limit_mb,
        } => {
            let input = match stdin {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => String::new(),
            };
            let request = ExecuteRequest {
                language,
                code: tokio::fs::read_to_string(source).await?,
                input,
                time_limit_ms,
                memory_limit_mb,
            };
            serde_json::to_string_pretty(&engine.run(&request).await?)?
        }
    };

    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
