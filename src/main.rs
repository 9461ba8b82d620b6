//! graph-agent - command line entry point
//!
//! Runs a compiled task graph against the configured browser endpoint and
//! model API, then prints the execution result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use graph_agent::browser::HttpBrowser;
use graph_agent::llm::{ModelBackend, OpenAiClient};
use graph_agent::{Config, CostAwareRouter, ExecutionContext, GraphExecutor, TaskGraph};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: graph-agent <graph.json> [config.yaml]";

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let completed = runtime.block_on(async_main())?;
    drop(runtime);
    if !completed {
        std::process::exit(2);
    }
    Ok(())
}

/// Returns whether the task completed.
async fn async_main() -> anyhow::Result<bool> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graph_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let graph_path = PathBuf::from(args.next().context(USAGE)?);
    let config_path = args.next().map(PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    info!(
        small_model = %config.small_model,
        large_model = %config.large_model,
        max_steps = config.max_steps,
        "Loaded configuration"
    );

    let doc = std::fs::read_to_string(&graph_path)
        .with_context(|| format!("Failed to read {}", graph_path.display()))?;
    let mut graph = TaskGraph::from_json(&doc)?;
    info!(task_id = graph.task_id(), nodes = graph.len(), "Loaded task graph");

    let client = OpenAiClient::new(config.llm_api_base.clone(), config.llm_api_key.clone());
    let backend = ModelBackend::new(Arc::new(client), &config);
    let router = Arc::new(CostAwareRouter::new(&config, backend));
    let browser = HttpBrowser::new(config.browser_endpoint.clone())?;

    let mut ctx = ExecutionContext::new(&config);
    let cancel = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling task");
            cancel.cancel();
        }
    });

    let mut executor = GraphExecutor::new(config, Box::new(browser), router);
    let result = executor.execute(&mut graph, &mut ctx).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_completed())
}
