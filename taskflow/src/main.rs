//! `Taskflow`: command-line task client.
//!
//! Talks to a Taskflow API server. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/taskflow/config.toml`).
//!
//! ```bash
//! # Log in and keep the token for later commands
//! export TASKFLOW_TOKEN=$(cargo run --bin taskflow -- login demo demo)
//!
//! cargo run --bin taskflow -- add "Buy milk" --priority high --due 2026-03-01
//! cargo run --bin taskflow -- list --status pending --sort due
//! cargo run --bin taskflow -- --user-id 1 watch
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskflow::auth::AuthClient;
use taskflow::config::{CliArgs, ClientConfig, Command};
use taskflow::http::Session;
use taskflow::http::remote::ReqwestTransport;
use taskflow::realtime::NotificationChannel;
use taskflow::resource::TaskClient;
use taskflow::view::{SortKey, TaskFilter, TaskView};
use taskflow_proto::task::{Task, TaskInput, TaskPatch};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(api_url = %config.api_url, "taskflow starting");

    let command = cli.command.clone().unwrap_or(Command::List {
        status: None,
        priority: None,
        tag: None,
        search: None,
        sort: SortKey::default(),
    });

    match run(&config, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!(%message, "command failed");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with command output.
/// Returns a guard that must be held for the lifetime of the program.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("taskflow.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig, command: Command) -> Result<(), String> {
    let session = Session::new(config.token.clone());
    let transport = ReqwestTransport::new(&config.api_url, config.request_timeout, session.clone())
        .map_err(|e| e.to_string())?;

    match command {
        Command::Login { username, password } => {
            let auth = AuthClient::new(transport, session);
            let token = auth
                .login(&username, &password)
                .await
                .map_err(|e| e.user_message())?;
            let user = auth.me().await.map_err(|e| e.user_message())?;
            eprintln!("logged in as {} (user id {})", user.username, user.id);
            println!("{}", token.access_token);
            Ok(())
        }
        Command::Watch => watch(config, &session).await,
        other => {
            let view = TaskView::dashboard(TaskClient::with_ttl(transport, config.cache_ttl));
            run_task_command(&view, other).await
        }
    }
}

async fn run_task_command(
    view: &TaskView<ReqwestTransport>,
    command: Command,
) -> Result<(), String> {
    match command {
        Command::List {
            status,
            priority,
            tag,
            search,
            sort,
        } => {
            load(view).await?;
            let filter = TaskFilter {
                status,
                priority,
                tag,
                project_id: None,
                search,
            };
            let tasks = view.visible(&filter, sort);
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in &tasks {
                println!("{}", summary(task));
            }
        }
        Command::Show { id } => {
            let task = view.client().get_one(&id).await.map_err(|e| e.message)?;
            print_task(&task);
        }
        Command::Add {
            title,
            description,
            priority,
            due,
            tags,
            project,
        } => {
            let input = TaskInput {
                title,
                description,
                priority: priority.unwrap_or_default(),
                due_date: due,
                tags: tags.into_iter().collect(),
                project_id: project,
            };
            let task = view.create(&input).await.map_err(|e| e.message)?;
            println!("created {}", summary(&task));
        }
        Command::Edit {
            id,
            title,
            description,
            priority,
            due,
            tags,
            project,
        } => {
            let patch = TaskPatch {
                title,
                description,
                completed: None,
                priority,
                due_date: due,
                tags: (!tags.is_empty()).then(|| tags.into_iter().collect::<BTreeSet<_>>()),
                project_id: project,
            };
            if patch.is_empty() {
                return Err("nothing to change".to_string());
            }
            let task = view.update(&id, &patch).await.map_err(|e| e.message)?;
            println!("updated {}", summary(&task));
        }
        Command::Toggle { id } => {
            let task = view.toggle(&id).await.map_err(|e| e.message)?;
            println!("{}", summary(&task));
        }
        Command::Rm { id } => {
            view.delete(&id).await.map_err(|e| e.message)?;
            println!("deleted {id}");
        }
        Command::Stats => {
            load(view).await?;
            let stats = view.stats(chrono::Local::now().date_naive());
            println!("total:         {}", stats.total);
            println!("completed:     {} ({}%)", stats.completed, stats.completion_percent());
            println!("pending:       {}", stats.pending);
            println!("overdue:       {}", stats.overdue);
            println!("high priority: {}", stats.high_priority);
        }
        Command::Login { .. } | Command::Watch => {}
    }
    Ok(())
}

async fn load(view: &TaskView<ReqwestTransport>) -> Result<(), String> {
    view.load().await;
    view.snapshot().error.map_or(Ok(()), Err)
}

async fn watch(config: &ClientConfig, session: &Session) -> Result<(), String> {
    let user_id = config
        .user_id
        .as_deref()
        .ok_or("watch needs --user-id (or TASKFLOW_USER_ID)")?;
    let token = session
        .token()
        .ok_or("watch needs a token; run `taskflow login` first")?;

    let channel = NotificationChannel::new(config.channel_config());
    let mut notifications = channel.notifications();
    let mut state = channel.watch_state();
    channel
        .connect(user_id, &token)
        .await
        .map_err(|e| e.to_string())?;
    eprintln!("watching notifications; Ctrl-C to stop");

    loop {
        tokio::select! {
            received = notifications.recv() => match received {
                Ok(n) => println!("[{}] {}: {} (unread {})", n.kind, n.title, n.message, channel.unread_count()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                eprintln!("connection: {current}");
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.disconnect();
    Ok(())
}

fn summary(task: &Task) -> String {
    let mark = if task.completed { "x" } else { " " };
    let due = task
        .due_date
        .map(|d| format!(" due {d}"))
        .unwrap_or_default();
    format!("[{mark}] {:>4}  {} ({}){due}", task.id, task.title, task.priority)
}

fn print_task(task: &Task) {
    println!("{}", summary(task));
    if let Some(description) = &task.description {
        println!("      {description}");
    }
    if !task.tags.is_empty() {
        let tags: Vec<&str> = task.tags.iter().map(String::as_str).collect();
        println!("      tags: {}", tags.join(", "));
    }
    if let Some(project) = &task.project_id {
        println!("      project: {project}");
    }
    println!("      updated {}", task.updated_at.to_rfc3339());
}
