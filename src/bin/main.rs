use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use capsule_orchestrator::{
    ExecutionRequest, FileName, JsonObject, Orchestrator, OrchestratorClient, OrchestratorConfig,
    WorkflowDefinition,
};

#[derive(Parser)]
#[command(name = "capsule-orchestrator")]
#[command(about = "Runs isolated capsules, routes handoffs between them and chains workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator HTTP server
    Serve {
        /// Config file (defaults to $ORCHESTRATOR_CONFIG or the XDG location)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides server.bind from the config
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load the config, check the capsule topology and list capsules
    Capsules {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a capsule on a running server
    Execute {
        capsule: String,
        /// JSON object passed as the capsule input
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// Input file to stage, as name=path (repeatable)
        #[arg(short, long = "file", value_parser = parse_file_arg)]
        files: Vec<(FileName, PathBuf)>,
        #[arg(long, env = "ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8000")]
        url: String,
    },
    /// Run a workflow file on a running server
    Workflow {
        file: PathBuf,
        #[arg(short, long, default_value = "{}")]
        input: String,
        #[arg(long, env = "ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8000")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("capsule_orchestrator=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut config = OrchestratorConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let bind = config.server.bind.clone();

            let orchestrator = Arc::new(Orchestrator::from_config(config)?);
            let swept = orchestrator.initialize().await;
            if swept > 0 {
                info!(swept, "Removed stale session directories");
            }

            let app = capsule_orchestrator::api::create_router(orchestrator.clone());
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {}", bind))?;
            info!("Orchestrator listening on http://{}", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            orchestrator.shutdown().await;
        }
        Commands::Capsules { config } => {
            let config = OrchestratorConfig::load(config.as_deref())?;
            let orchestrator = Orchestrator::from_config(config)?;
            let capsules = orchestrator.registry().list();

            println!("{} capsule(s) registered:", capsules.len());
            for capsule in capsules {
                println!("  {} ({})", capsule.name, capsule.runnable);
                if let Some(desc) = &capsule.description {
                    println!("    {}", desc);
                }
                if !capsule.callable.is_empty() {
                    let callable: Vec<&str> =
                        capsule.callable.iter().map(|c| c.as_str()).collect();
                    println!("    callable: {}", callable.join(", "));
                }
            }
        }
        Commands::Execute {
            capsule,
            input,
            files,
            url,
        } => {
            let client = OrchestratorClient::new(&url)?;
            let mut request = ExecutionRequest::new(capsule, parse_object(&input)?);
            for (name, path) in files {
                // Staging does not follow links, so resolve them here.
                let path = std::fs::canonicalize(&path)
                    .with_context(|| format!("cannot resolve {}", path.display()))?;
                request = request.with_file(name, path);
            }

            let result = client.execute(&request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Workflow { file, input, url } => {
            let client = OrchestratorClient::new(&url)?;
            let workflow = WorkflowDefinition::from_file(&file)?;

            let result = client.run_workflow(&workflow, &parse_object(&input)?).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn parse_object(raw: &str) -> Result<JsonObject> {
    match serde_json::from_str(raw).context("--input is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(anyhow!("--input must be a JSON object, got {}", other)),
    }
}

fn parse_file_arg(raw: &str) -> Result<(FileName, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=path, got '{}'", raw))?;
    let name = FileName::parse(name).map_err(|e| e.to_string())?;
    Ok((name, PathBuf::from(path)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
