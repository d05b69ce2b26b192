use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drivebatch::command::{Command, load_batch_file};
use drivebatch::config::AppConfig;
use drivebatch::engine::BatchEngine;
use drivebatch::engine::executor::Progress;
use drivebatch::engine::operation::Outcome;
use drivebatch::engine::report::Report;
use drivebatch::engine::store::RemoteStore;
use drivebatch_core::DriveClient;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_BATCH_FILE: &str = "batch_commands.json";

#[derive(Parser, Debug)]
#[command(name = "drivebatch", version)]
#[command(about = "Batch copy, rename and delete for Google Drive folders")]
struct Cli {
    /// Print the planned operations as JSON and change nothing
    #[arg(long, global = true)]
    dry_run: bool,
    /// Operations allowed in flight at once
    #[arg(long, global = true, value_name = "N")]
    concurrency: Option<usize>,
    /// Attempts per operation before giving up
    #[arg(long, global = true, value_name = "N")]
    max_retries: Option<u32>,
    /// Directory for JSON run reports
    #[arg(long, global = true, value_name = "PATH")]
    report_dir: Option<PathBuf>,
    /// API access token (defaults to DRIVEBATCH_TOKEN)
    #[arg(long, global = true, value_name = "TOKEN")]
    token: Option<String>,
    /// Hide the progress bar
    #[arg(long, global = true)]
    no_progress: bool,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum CliCommand {
    /// Copy a file or folder given by id or shared link
    Copy {
        #[arg(long)]
        url: String,
        /// Destination folder id (defaults to the drive root)
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        new_name: Option<String>,
    },
    /// Add a prefix and/or suffix to every item matching a pattern
    Modify {
        #[arg(long)]
        folder_id: String,
        /// Wildcard pattern, e.g. "*.docx"
        #[arg(long)]
        target: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        suffix: Option<String>,
        /// Put the suffix before a file's extension
        #[arg(long)]
        keep_extension: bool,
    },
    /// Delete every item matching a pattern
    Delete {
        #[arg(long)]
        folder_id: String,
        #[arg(long)]
        pattern: String,
    },
    /// Copy one file into every direct subfolder of a folder
    CopyToSubfolders {
        #[arg(long)]
        source_id: String,
        #[arg(long)]
        folder_id: String,
    },
    /// Run the commands listed in a JSON batch file
    Batch {
        #[arg(long, default_value = DEFAULT_BATCH_FILE)]
        file: PathBuf,
    },
}

impl CliCommand {
    async fn into_command(self) -> anyhow::Result<Command> {
        Ok(match self {
            CliCommand::Copy {
                url,
                destination,
                new_name,
            } => Command::Copy {
                source: url,
                destination,
                new_name,
            },
            CliCommand::Modify {
                folder_id,
                target,
                prefix,
                suffix,
                keep_extension,
            } => Command::Modify {
                folder_id,
                target,
                prefix,
                suffix,
                keep_extension,
            },
            CliCommand::Delete { folder_id, pattern } => Command::Delete { folder_id, pattern },
            CliCommand::CopyToSubfolders {
                source_id,
                folder_id,
            } => Command::CopyToSubfolders {
                source_id,
                folder_id,
            },
            CliCommand::Batch { file } => load_batch_file(&file)
                .await
                .with_context(|| format!("cannot load batch file {}", file.display()))?,
        })
    }
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(concurrency) = self.concurrency {
            config.engine.max_concurrency = concurrency.max(1);
        }
        if let Some(max_retries) = self.max_retries {
            config.engine.max_retries = max_retries;
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = Some(dir.clone());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DRIVEBATCH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// The bar grows as batch entries are planned.
fn spawn_progress() -> (mpsc::UnboundedSender<Progress>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    let handle = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.completed as u64);
            bar.set_message(format!("{} {}", progress.outcome, progress.path));
        }
        bar.finish_and_clear();
    });
    (tx, handle)
}

fn print_summary(report: &Report) {
    println!("{}: {}", report.command, report.tally);
    if report.cancelled {
        println!("  run was cancelled before every operation started");
    }
    for record in report.failures() {
        if let Outcome::Failed { error, .. } = &record.outcome {
            println!(
                "  failed #{} {} {}: {error}",
                record.index,
                record.operation.kind_label(),
                record.path
            );
        }
    }
    for failure in &report.planning_failures {
        println!(
            "  batch entry {} ({}) not planned: {}",
            failure.entry,
            failure.description.as_deref().unwrap_or("no description"),
            failure.error
        );
    }
    for folder in &report.unreachable {
        println!("  unreachable folder {} ({}): {}", folder.path, folder.folder_id, folder.error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::from_env();
    cli.apply(&mut config);
    let show_progress = !cli.no_progress;
    let dry_run = cli.dry_run;
    let command = cli.command.into_command().await?;

    let token = config.token()?;
    let client = match &config.api_url {
        Some(url) => DriveClient::with_base_url(url, token),
        None => DriveClient::new(token),
    }
    .context("cannot build the API client")?;
    let store: Arc<dyn RemoteStore> = Arc::new(client);
    let mut engine = BatchEngine::new(store, &config.engine);

    if dry_run {
        let plan = engine
            .plan(&command)
            .await
            .with_context(|| format!("cannot plan `{command}`"))?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(if plan.failures.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, waiting for in-flight operations");
            interrupt.cancel();
        }
    });

    let mut progress_task = None;
    if show_progress {
        let (tx, handle) = spawn_progress();
        engine = engine.with_progress(tx);
        progress_task = Some(handle);
    }

    let report = engine
        .run(&command, cancel)
        .await
        .with_context(|| format!("cannot plan `{command}`"));
    drop(engine);
    if let Some(handle) = progress_task {
        handle.await.ok();
    }
    let report = report?;

    print_summary(&report);
    match config.report_dir() {
        Ok(dir) => match report.write_json(dir).await {
            Ok(path) => tracing::info!(path = %path.display(), "report saved"),
            Err(err) => tracing::warn!(error = %err, "could not save report"),
        },
        Err(err) => tracing::warn!(error = %err, "report not saved"),
    }

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_copy_with_global_flags() {
        let cli = Cli::try_parse_from([
            "drivebatch",
            "copy",
            "--url",
            "https://drive.google.com/file/d/abc/view",
            "--destination",
            "dst",
            "--dry-run",
            "--concurrency",
            "4",
        ])
        .unwrap();

        assert!(cli.dry_run);
        assert_eq!(cli.concurrency, Some(4));
        assert_eq!(
            cli.command,
            CliCommand::Copy {
                url: "https://drive.google.com/file/d/abc/view".into(),
                destination: Some("dst".into()),
                new_name: None,
            }
        );
    }

    #[test]
    fn copy_to_subfolders_uses_kebab_case() {
        let cli = Cli::try_parse_from([
            "drivebatch",
            "copy-to-subfolders",
            "--source-id",
            "s",
            "--folder-id",
            "f",
        ])
        .unwrap();
        assert!(matches!(cli.command, CliCommand::CopyToSubfolders { .. }));
    }

    #[test]
    fn batch_file_has_a_default() {
        let cli = Cli::try_parse_from(["drivebatch", "batch"]).unwrap();
        assert_eq!(
            cli.command,
            CliCommand::Batch {
                file: PathBuf::from(DEFAULT_BATCH_FILE)
            }
        );
    }

    #[test]
    fn modify_requires_target() {
        assert!(Cli::try_parse_from(["drivebatch", "modify", "--folder-id", "f"]).is_err());
    }

    #[test]
    fn flags_override_environment_config() {
        let cli = Cli::try_parse_from([
            "drivebatch",
            "--max-retries",
            "9",
            "--concurrency",
            "0",
            "--token",
            "t",
            "delete",
            "--folder-id",
            "f",
            "--pattern",
            "*.tmp",
        ])
        .unwrap();
        let mut config = AppConfig {
            engine: Default::default(),
            token: None,
            api_url: None,
            report_dir: None,
        };
        cli.apply(&mut config);
        assert_eq!(config.engine.max_retries, 9);
        assert_eq!(config.engine.max_concurrency, 1);
        assert_eq!(config.token.as_deref(), Some("t"));
    }
}
