use crate::control_channel::{ControlTimings, DEFAULT_IPC_PORT};
use appvisor_core::{
    launch::{self, AppEnv},
    profile_lock::LockTimings,
    secret,
};
use clap::Parser;
use std::path::{Path, PathBuf};

pub const IPC_LOG_FILE_NAME: &str = "appvisor-ipc.log";

#[derive(Parser, Debug)]
#[command(name = "appvisor-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub profile: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long = "running-tests", default_value_t = false)]
    pub running_tests: bool,
    #[arg(long = "alt-instance-id", default_value = "")]
    pub alt_instance_id: String,
    #[arg(long, default_value = "prod")]
    pub env: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value = "")]
    pub log_level: String,
    /// Well-known control port override for test harnesses. Every instance
    /// of one installation must agree on it, so it is not offered in help.
    #[arg(long, hide = true)]
    pub ipc_port: Option<u16>,
    /// Remaining launch arguments, usually a callback URL.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub env: AppEnv,
    pub profile_dir: PathBuf,
    pub secret_path: PathBuf,
    pub debug: bool,
    pub end_to_end_testing: bool,
    pub alt_instance_id: Option<String>,
    pub ipc_port: u16,
    pub log_dir: PathBuf,
    pub log_level: Option<String>,
    pub argv: Vec<String>,
    pub initial_callback_url: Option<String>,
    pub control: ControlTimings,
    pub lock: LockTimings,
}

impl SupervisorConfig {
    pub fn new(profile_dir: impl Into<PathBuf>, ipc_port: u16) -> Self {
        let profile_dir = profile_dir.into();
        Self {
            env: AppEnv::Prod,
            secret_path: secret::secret_path(&profile_dir),
            log_dir: profile_dir.clone(),
            profile_dir,
            debug: false,
            end_to_end_testing: false,
            alt_instance_id: None,
            ipc_port,
            log_level: None,
            argv: Vec::new(),
            initial_callback_url: None,
            control: ControlTimings::default(),
            lock: LockTimings::default(),
        }
    }

    pub fn is_alt_instance(&self) -> bool {
        self.alt_instance_id.is_some()
    }

    pub fn ipc_log_path(&self) -> PathBuf {
        self.log_dir.join(IPC_LOG_FILE_NAME)
    }

    /// Arguments an alternate instance is started with, minus its id.
    pub fn relaunch_args(&self) -> Vec<String> {
        let mut args = vec!["--env".to_string(), self.env.to_string()];
        if self.debug {
            args.push("--debug".to_string());
        }
        if self.ipc_port != DEFAULT_IPC_PORT {
            args.push("--ipc-port".to_string());
            args.push(self.ipc_port.to_string());
        }
        args
    }

    pub fn log_filter(&self) -> String {
        if let Some(level) = &self.log_level {
            return level.clone();
        }
        if self.debug {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    }
}

pub fn load_config() -> SupervisorConfig {
    let argv: Vec<String> = std::env::args().collect();
    resolve(Args::parse(), argv)
}

pub fn resolve(args: Args, argv: Vec<String>) -> SupervisorConfig {
    let env = AppEnv::parse(&args.env);
    let app_name = env.app_name();
    let alt_instance_id = non_empty(&args.alt_instance_id);
    let profile_dir = launch::resolve_root_profile_dir(
        non_empty(&args.profile).as_deref(),
        app_name,
        alt_instance_id.as_deref(),
    );
    // Shared by every instance, alternates included, so they can talk.
    let secret_path = secret::secret_path(&launch::default_root_profile_dir(app_name));
    let log_dir = resolve_log_dir(&args.log_dir, &profile_dir);
    let initial_callback_url = launch::find_callback_url(&argv)
        .or_else(|| launch::find_callback_url(&args.rest))
        .map(str::to_string);

    let mut config = SupervisorConfig::new(profile_dir, resolve_ipc_port(args.ipc_port));
    config.env = env;
    config.secret_path = secret_path;
    config.debug = args.debug || env_true("APPVISOR_DEBUG");
    config.end_to_end_testing = args.running_tests;
    config.alt_instance_id = alt_instance_id;
    config.log_dir = log_dir;
    config.log_level = resolve_log_level(&args.log_level);
    config.argv = argv;
    config.initial_callback_url = initial_callback_url;
    config
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_ipc_port(port_flag: Option<u16>) -> u16 {
    if let Some(port) = port_flag {
        return port;
    }
    std::env::var("APPVISOR_IPC_PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_IPC_PORT)
}

fn resolve_log_level(level_flag: &str) -> Option<String> {
    non_empty(level_flag).or_else(|| {
        std::env::var("APPVISOR_LOG_LEVEL")
            .ok()
            .and_then(|value| non_empty(&value))
    })
}

fn resolve_log_dir(log_dir_flag: &str, profile_dir: &Path) -> PathBuf {
    if let Some(dir) = non_empty(log_dir_flag) {
        return PathBuf::from(dir);
    }
    if let Ok(value) = std::env::var("APPVISOR_LOG_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    profile_dir.to_path_buf()
}
