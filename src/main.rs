use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowcast_config::{GraphDef, PipelineConfig};
use flowcast_pipeline::{
  ApplicationContext, PipelineOutput, QueueEvent, WorkflowStreamPipeline, channel,
};
use flowcast_store::{SqliteStore, Store};
use flowcast_workflow::Workflow;

/// Flowcast - streams workflow run events to clients and records the run
#[derive(Parser)]
#[command(name = "flowcast")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.flowcast)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// SQLite database file (default: <data-dir>/flowcast.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Feed a recorded event log through the pipeline
  Replay {
    /// Path to the graph definition (JSON)
    #[arg(long)]
    graph: PathBuf,

    /// Path to the engine events, one JSON object per line
    #[arg(long)]
    events: PathBuf,

    /// Path to a pipeline configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// The user's query
    #[arg(long, default_value = "")]
    query: String,

    /// Print one aggregated response instead of streaming
    #[arg(long)]
    blocking: bool,

    #[arg(long, default_value = "default")]
    app: String,

    #[arg(long, default_value = "cli")]
    user: String,
  },

  /// List recorded runs of an app with their node executions
  History {
    #[arg(long, default_value = "default")]
    app: String,
  },
}

fn main() -> Result<()> {
  init_tracing();
  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".flowcast"),
  };
  let db_path = cli.db.unwrap_or_else(|| data_dir.join("flowcast.db"));

  match cli.command {
    Some(Commands::Replay {
      graph,
      events,
      config,
      query,
      blocking,
      app,
      user,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async {
        let store = open_store(&db_path).await?;
        let request = ReplayRequest {
          graph,
          events,
          config,
          query,
          blocking,
          app,
          user,
        };
        replay(store, request).await
      })?;
    }
    Some(Commands::History { app }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async {
        let store = open_store(&db_path).await?;
        history(store, &app).await
      })?;
    }
    None => {
      println!("flowcast - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}

async fn open_store(db_path: &Path) -> Result<Arc<SqliteStore>> {
  if let Some(parent) = db_path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
  }

  let url = format!("sqlite://{}?mode=rwc", db_path.display());
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect(&url)
    .await
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;

  let store = SqliteStore::new(pool);
  store.migrate().await.context("failed to migrate database")?;
  Ok(Arc::new(store))
}

struct ReplayRequest {
  graph: PathBuf,
  events: PathBuf,
  config: Option<PathBuf>,
  query: String,
  blocking: bool,
  app: String,
  user: String,
}

async fn replay(store: Arc<SqliteStore>, request: ReplayRequest) -> Result<()> {
  let graph_def: GraphDef = read_json(&request.graph).await?;
  let workflow = Workflow::from_def(graph_def).context("invalid graph definition")?;
  info!(workflow_id = %workflow.workflow_id(), name = %workflow.name(), "workflow_loaded");

  let config: PipelineConfig = match &request.config {
    Some(path) => read_json(path).await?,
    None => PipelineConfig::default(),
  };

  let events = read_events(&request.events).await?;
  info!(events = events.len(), "replay_started");

  let context = ApplicationContext::new(request.app, request.user, request.query);
  let (publisher, listener) = channel(context.task_id.clone());

  // Stands in for the engine: the source closes once every event is sent.
  tokio::spawn(async move {
    for event in events {
      publisher.publish(event);
      tokio::task::yield_now().await;
    }
  });

  let pipeline =
    WorkflowStreamPipeline::new(context, Arc::new(workflow), store, listener, config);

  match pipeline.process(!request.blocking).await {
    Ok(PipelineOutput::Stream(mut responses)) => {
      while let Some(response) = responses.next().await {
        println!("{}", serde_json::to_string(&response)?);
      }
    }
    Ok(PipelineOutput::Blocking(response)) => {
      println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Err(e) => return Err(e).context("pipeline failed"),
  }

  Ok(())
}

async fn history(store: Arc<SqliteStore>, app_id: &str) -> Result<()> {
  let runs = store
    .list_runs(app_id)
    .await
    .context("failed to list runs")?;

  if runs.is_empty() {
    info!(app_id = %app_id, "no_runs_recorded");
    return Ok(());
  }

  for run in runs {
    println!(
      "#{} {} {:?} steps={} tokens={} elapsed={:.3}s",
      run.sequence_number, run.id, run.status, run.total_steps, run.total_tokens, run.elapsed_time
    );
    if let Some(error) = &run.error {
      println!("  error: {}", error);
    }

    let executions = store
      .list_node_executions(&run.id)
      .await
      .with_context(|| format!("failed to list node executions for run {}", run.id))?;
    for execution in executions {
      println!(
        "  {:>3} {} ({}) {:?}",
        execution.index, execution.node_id, execution.node_type, execution.status
      );
    }
  }

  Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read file: {}", path.display()))?;
  serde_json::from_str(&content).with_context(|| format!("failed to parse file: {}", path.display()))
}

async fn read_events(path: &Path) -> Result<Vec<QueueEvent>> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read events file: {}", path.display()))?;

  content
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(number, line)| {
      serde_json::from_str(line)
        .with_context(|| format!("invalid event on line {} of {}", number + 1, path.display()))
    })
    .collect()
}
