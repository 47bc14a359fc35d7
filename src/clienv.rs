use std::path::PathBuf;

/// Environment variables read by the CLI itself. Service processes inherit
/// the full environment regardless of this list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ConfigDir,
    Manifest,
    DashboardPort,
    DashboardHost,
    Log,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ConfigDir => "DEVRUN_CONFIG_DIR",
            EnvVar::Manifest => "DEVRUN_MANIFEST",
            EnvVar::DashboardPort => "DEVRUN_DASHBOARD_PORT",
            EnvVar::DashboardHost => "DEVRUN_DASHBOARD_HOST",
            EnvVar::Log => "DEVRUN_LOG",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const DEVRUN_SUBDIR: &str = "devrun";

/// Non-empty value of an env var.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($DEVRUN_CONFIG_DIR or ~/.config/devrun)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ConfigDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(DEVRUN_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Manifest path override ($DEVRUN_MANIFEST)
pub fn manifest() -> Option<PathBuf> {
    let val = env_opt(EnvVar::Manifest.as_str()).map(PathBuf::from);
    tracing::trace!(value = ?val, "DEVRUN_MANIFEST env var");
    val
}

/// Dashboard port override ($DEVRUN_DASHBOARD_PORT). Unparseable values are ignored.
pub fn dashboard_port() -> Option<u16> {
    let val = env_opt(EnvVar::DashboardPort.as_str());
    let port = val.as_deref().and_then(|v| v.trim().parse().ok());
    if val.is_some() && port.is_none() {
        tracing::warn!(value = ?val, "Ignoring invalid DEVRUN_DASHBOARD_PORT");
    }
    port
}

/// Dashboard bind host override ($DEVRUN_DASHBOARD_HOST)
pub fn dashboard_host() -> Option<String> {
    let val = env_opt(EnvVar::DashboardHost.as_str());
    tracing::trace!(value = ?val, "DEVRUN_DASHBOARD_HOST env var");
    val
}

/// Log filter directive ($DEVRUN_LOG, falling back to $RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(EnvVar::Log.as_str()).or_else(|| env_opt("RUST_LOG"))
}
