use anyhow::{anyhow, Context, Result};
use clap::Parser;
use console::style;
use indicatif::ProgressBar;
use prettytable::{format, Cell, Row, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use headshot_processor::cli::{Args, Command, EnqueueArgs, RunArgs};
use headshot_processor::config_file::AppConfig;
use headshot_processor::queue::{LogLevel, TracingObserver};
use headshot_processor::utils::{
    create_spinner, format_duration, has_valid_extension, sanitize_base_name, IMAGE_EXTENSIONS, RAW_EXTENSIONS,
};
use headshot_processor::{
    CropEngine, HttpTransport, JsonLinesObserver, JsonMessage, Pipeline, QueueEvent, QueueObserver, QueueStore,
    Scheduler,
};

type AppScheduler = Scheduler<Pipeline<HttpTransport>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json);

    let mut config = AppConfig::load(args.config_file.as_deref())?;
    config.set_queue_file(args.queue_file.clone());
    if let Command::Run(run) = &args.command {
        config.apply_run_args(run);
    }

    let scheduler = open_scheduler(&config)?;

    match args.command {
        Command::Enqueue(enqueue) => handle_enqueue(&scheduler, &enqueue, args.json),
        Command::Run(run) => handle_run(&scheduler, &config, &run, args.json).await,
        Command::Status => handle_status(&scheduler, args.json),
        Command::Failed => handle_failed(&scheduler, args.json),
        Command::Retry { id, all } => handle_retry(&scheduler, id.as_deref(), all),
        Command::Clear {
            completed,
            include_failed,
        } => handle_clear(&scheduler, completed, include_failed),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "headshot_processor=debug,info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_scheduler(config: &AppConfig) -> Result<AppScheduler> {
    let transport = HttpTransport::new(&config.remote.base_url, config.remote.request_timeout())?;
    let engine = CropEngine::new(config.framing.clone(), config.color.clone());
    let pipeline = Pipeline::new(transport, config.remote.clone(), engine)
        .with_upscale_input_max(config.pipeline.upscale_input_max);

    let store = QueueStore::new(&config.queue.file);
    Scheduler::open(store, pipeline, config.queue.scheduler_settings())
        .with_context(|| format!("Failed to open queue file {:?}", config.queue.file))
}

/// Expand files and directories into the list of images to queue
fn discover_images(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let is_image = |path: &Path| has_valid_extension(path, IMAGE_EXTENSIONS) || has_valid_extension(path, RAW_EXTENSIONS);

    let mut images = Vec::new();
    for input in inputs {
        if input.is_file() {
            images.push(input.clone());
            continue;
        }
        if !input.is_dir() {
            return Err(anyhow!("Input path does not exist: {}", input.display()));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut found: Vec<PathBuf> = WalkDir::new(input)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        found.sort();
        images.extend(found);
    }
    Ok(images)
}

fn handle_enqueue(scheduler: &AppScheduler, args: &EnqueueArgs, json: bool) -> Result<()> {
    let images = discover_images(&args.inputs, args.recursive)?;
    if images.is_empty() {
        return Err(anyhow!("No images found in the given inputs"));
    }

    let output = std::path::absolute(&args.output)
        .with_context(|| format!("Invalid output folder: {:?}", args.output))?;

    let mut queued = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let source = std::path::absolute(image).with_context(|| format!("Invalid input path: {:?}", image))?;
        let base_name = match &args.name {
            Some(name) if images.len() == 1 => sanitize_base_name(name),
            Some(name) => format!("{}_{:02}", sanitize_base_name(name), index + 1),
            None => sanitize_base_name(&image.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default()),
        };
        let id = scheduler.enqueue(source, &output, &args.group, base_name.clone());
        queued.push((id, base_name));
    }
    scheduler.save().context("Failed to write queue file")?;

    if json {
        for (id, base_name) in &queued {
            println!("{}", serde_json::json!({ "type": "queued", "jobId": id, "baseName": base_name }));
        }
    } else {
        for (id, base_name) in &queued {
            println!("  {} {}", style(base_name).green(), style(id).dim());
        }
        println!(
            "{} {} image(s) to {}",
            style("Queued").bold().green(),
            queued.len(),
            style(&args.group).cyan()
        );
    }
    Ok(())
}

/// Human progress: spinner for status, one line per log message
struct ConsoleObserver {
    spinner: ProgressBar,
}

impl QueueObserver for ConsoleObserver {
    fn on_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::StatusChanged(status) => {
                let current = status
                    .current
                    .as_ref()
                    .map(|c| format!(" | {}/{}", c.group_label, c.base_name))
                    .unwrap_or_default();
                self.spinner.set_message(format!(
                    "{} pending, {} done, {} failed{}",
                    status.pending, status.completed, status.failed, current
                ));
            }
            QueueEvent::Log { level, message } => {
                let line = match level {
                    LogLevel::Info => style(message.as_str()).dim(),
                    LogLevel::Success => style(message.as_str()).green(),
                    LogLevel::Warning => style(message.as_str()).yellow(),
                    LogLevel::Error => style(message.as_str()).red().bold(),
                };
                self.spinner.println(line.to_string());
            }
            QueueEvent::JobCompleted { outputs, .. } => {
                for path in outputs.paths() {
                    self.spinner.println(format!("    {}", style(path.display()).cyan()));
                }
            }
        }
    }
}

async fn handle_run(scheduler: &AppScheduler, config: &AppConfig, args: &RunArgs, json: bool) -> Result<()> {
    let token = args
        .api_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow!("No API token: pass --api-token or set REPLICATE_API_TOKEN"))?;
    scheduler
        .set_config(config.enhancement.clone())
        .context("Invalid enhancement settings")?;

    if scheduler.status().pending == 0 {
        if !json {
            println!("{}", style("Nothing to process").yellow());
        }
        return Ok(());
    }

    let spinner = if json {
        scheduler.subscribe(Arc::new(JsonLinesObserver::default()));
        scheduler.subscribe(Arc::new(TracingObserver));
        None
    } else {
        println!("{}", style("Headshot Processor").bold().blue());
        let spinner = create_spinner("Starting...");
        scheduler.subscribe(Arc::new(ConsoleObserver {
            spinner: spinner.clone(),
        }));
        Some(spinner)
    };

    let started = Instant::now();
    scheduler.set_credential(Some(token));
    scheduler.set_enabled(true);

    tokio::select! {
        _ = scheduler.wait_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, current job goes back to the queue");
        }
    }
    scheduler.shutdown().await;

    let status = scheduler.status();
    let elapsed = started.elapsed();
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
        println!();
        println!("{}", style("Results Summary:").bold().green());
        println!("  Completed: {}", style(status.completed).bold().green());
        if status.failed > 0 {
            println!("  Failed: {}", style(status.failed).bold().red());
        }
        if status.pending > 0 {
            println!("  Pending: {}", style(status.pending).bold().yellow());
        }
        println!("  Time: {}", format_duration(elapsed));
    } else {
        JsonMessage::summary(status.completed, status.failed, status.pending, elapsed.as_secs_f64());
    }
    Ok(())
}

fn handle_status(scheduler: &AppScheduler, json: bool) -> Result<()> {
    let status = scheduler.status();
    if json {
        println!("{}", serde_json::to_string(&status)?);
        return Ok(());
    }

    println!("{}", style("Queue Status:").bold());
    println!("  Pending:    {}", style(status.pending).yellow());
    println!("  Processing: {}", style(status.processing).cyan());
    println!("  Completed:  {}", style(status.completed).green());
    println!("  Failed:     {}", style(status.failed).red());
    Ok(())
}

fn handle_failed(scheduler: &AppScheduler, json: bool) -> Result<()> {
    let failed = scheduler.failed_jobs();
    if json {
        println!("{}", serde_json::to_string(&failed)?);
        return Ok(());
    }
    if failed.is_empty() {
        println!("{}", style("No failed jobs").green());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table.add_row(Row::new(vec![
        Cell::new("Id"),
        Cell::new("Group"),
        Cell::new("Name"),
        Cell::new("Retries"),
        Cell::new("Error"),
    ]));
    for job in &failed {
        table.add_row(Row::new(vec![
            Cell::new(&job.id),
            Cell::new(&job.group_label),
            Cell::new(&job.base_name),
            Cell::new(&job.retries.to_string()),
            Cell::new(job.error.as_deref().unwrap_or("-")),
        ]));
    }
    table.printstd();
    Ok(())
}

fn handle_retry(scheduler: &AppScheduler, id: Option<&str>, all: bool) -> Result<()> {
    let count = match id {
        Some(id) if !all => {
            if !scheduler.retry(id) {
                return Err(anyhow!("No failed job with id {}", id));
            }
            1
        }
        _ => scheduler.retry_all(),
    };
    scheduler.save().context("Failed to write queue file")?;
    println!("{} {} job(s) back to pending", style("Moved").bold().green(), count);
    Ok(())
}

fn handle_clear(scheduler: &AppScheduler, completed: bool, include_failed: bool) -> Result<()> {
    let removed = if completed {
        scheduler.clear_completed()
    } else {
        scheduler.clear_queue(include_failed)
    };
    scheduler.save().context("Failed to write queue file")?;
    println!("{} {} job(s)", style("Removed").bold().green(), removed);
    Ok(())
}
