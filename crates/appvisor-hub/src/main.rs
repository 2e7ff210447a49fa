mod config;
mod control_channel;
mod coordinator;
mod lock_keeper;
mod shell;
mod supervisor;

use anyhow::Context;
use config::SupervisorConfig;
use coordinator::{ensure_single_instance, InstanceRole};
use shell::HeadlessShell;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};
use supervisor::{Supervisor, SupervisorEvent};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = config::load_config();
    let _log_guard = init_logging(&config);
    match run(config).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            error!(event = "startup_failed", error = %format!("{err:#}"));
            ExitCode::from(1)
        }
    }
}

async fn run(config: SupervisorConfig) -> anyhow::Result<i32> {
    std::fs::create_dir_all(&config.profile_dir).with_context(|| {
        format!("creating profile dir {}", config.profile_dir.display())
    })?;
    info!(
        event = "supervisor_start",
        env = %config.env,
        profile = %config.profile_dir.display(),
        alt_instance = ?config.alt_instance_id,
        ipc_log = %config.ipc_log_path().display()
    );

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let startup = ensure_single_instance(&config, control_tx)
        .await
        .context("negotiating profile ownership")?;
    if startup.role == InstanceRole::AlreadyRunning {
        info!(event = "supervisor_exit", reason = "already_running");
        return Ok(0);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shell = HeadlessShell::new(events_tx.clone(), config.relaunch_args());
    let mut supervisor = Supervisor::new(
        config,
        shell,
        startup.server,
        startup.lock,
        events_tx.clone(),
    );
    supervisor.create_primary_window(true);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events_tx.send(SupervisorEvent::QuitRequested);
        }
    });

    let code = supervisor.run(events_rx, control_rx).await;
    info!(event = "supervisor_exit", exit_code = code);
    Ok(code)
}

fn init_logging(config: &SupervisorConfig) -> Option<LogGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let writer = match open_log_file(&config.log_dir, &config.ipc_log_path()) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path, path: &Path) -> io::Result<LogGuard> {
    if std::fs::create_dir_all(log_dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
