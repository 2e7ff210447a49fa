use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

const CALLBACK_URL_PREFIX: &str = "appvisor://x-callback-url/";

/// Id given to the alternate instance started from a running owner.
pub const DEFAULT_ALT_INSTANCE_ID: &str = "alt1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    #[default]
    Prod,
    Dev,
}

impl AppEnv {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => AppEnv::Dev,
            _ => AppEnv::Prod,
        }
    }

    pub fn app_name(&self) -> &'static str {
        match self {
            AppEnv::Prod => "appvisor-desktop",
            AppEnv::Dev => "appvisordev-desktop",
        }
    }
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppEnv::Prod => f.write_str("prod"),
            AppEnv::Dev => f.write_str("dev"),
        }
    }
}

pub fn is_callback_url(arg: &str) -> bool {
    arg.starts_with(CALLBACK_URL_PREFIX)
}

pub fn find_callback_url(argv: &[String]) -> Option<&str> {
    argv.iter().map(String::as_str).find(|arg| is_callback_url(arg))
}

fn config_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
        .unwrap_or_else(std::env::temp_dir)
}

/// Root profile directory shared by every non-alternate instance; the
/// control-channel secret lives here.
pub fn default_root_profile_dir(app_name: &str) -> PathBuf {
    config_home().join(app_name)
}

pub fn resolve_root_profile_dir(
    profile_flag: Option<&str>,
    app_name: &str,
    alt_instance_id: Option<&str>,
) -> PathBuf {
    if let Some(profile) = profile_flag.map(str::trim).filter(|p| !p.is_empty()) {
        return PathBuf::from(profile);
    }
    match alt_instance_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(alt) => config_home().join(format!("{app_name}-{alt}")),
        None => default_root_profile_dir(app_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn finds_first_callback_url() {
        let args = argv(&[
            "appvisor",
            "https://example.com",
            "appvisor://x-callback-url/openNote?id=1",
            "appvisor://x-callback-url/openNote?id=2",
        ]);
        assert_eq!(
            find_callback_url(&args),
            Some("appvisor://x-callback-url/openNote?id=1")
        );
        assert!(!is_callback_url("appvisor://openNote"));
        assert_eq!(find_callback_url(&argv(&["appvisor", "--debug"])), None);
    }

    #[test]
    fn alternate_instances_get_their_own_root() {
        let main = resolve_root_profile_dir(None, "appvisor-desktop", None);
        let alt = resolve_root_profile_dir(None, "appvisor-desktop", Some("alt1"));
        assert_eq!(main, default_root_profile_dir("appvisor-desktop"));
        assert_ne!(main, alt);
        assert!(alt.ends_with("appvisor-desktop-alt1"));

        let explicit =
            resolve_root_profile_dir(Some("/srv/profile"), "appvisor-desktop", Some("alt1"));
        assert_eq!(explicit, PathBuf::from("/srv/profile"));
    }

    #[test]
    fn env_selects_app_name() {
        assert_eq!(AppEnv::parse("dev").app_name(), "appvisordev-desktop");
        assert_eq!(AppEnv::parse("prod").app_name(), "appvisor-desktop");
        assert_eq!(AppEnv::parse("whatever"), AppEnv::Prod);
    }
}
