//! Runtime Builder: service declaration + detected language -> [`RuntimeConfig`]
//!
//! Port assignment happens here, sequentially and before any process starts:
//! explicit ports are claimed first, then every remaining service gets the
//! first unclaimed port at or above its runtime's default, in declaration
//! order. The allocator never looks at the OS, so the same declaration list
//! always yields the same assignment.

use super::env;
use super::protocol::{HealthCheckKind, HealthCheckSpec, RuntimeConfig};
use crate::error::ConfigError;
use crate::manifest::{find_file_with_ext, HostKind, Language, LanguageInfo, ServiceDeclaration};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// Port bookkeeping for a single run.
#[derive(Debug, Default, Clone)]
pub struct PortAllocator {
    owners: HashMap<u16, String>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` for `service`. Fails with the current owner if another service holds it.
    pub fn claim(&mut self, port: u16, service: &str) -> Result<(), String> {
        match self.owners.get(&port) {
            Some(owner) if owner != service => Err(owner.clone()),
            Some(_) => Ok(()),
            None => {
                self.owners.insert(port, service.to_string());
                Ok(())
            }
        }
    }

    /// First unclaimed port at or above `preferred`, claimed for `service`.
    pub fn allocate(&mut self, preferred: u16, service: &str) -> Option<u16> {
        if let Some((port, _)) = self.owners.iter().find(|(_, owner)| *owner == service) {
            return Some(*port);
        }
        let port = (preferred.max(1)..=u16::MAX).find(|p| !self.owners.contains_key(p))?;
        self.owners.insert(port, service.to_string());
        Some(port)
    }

    pub fn owner(&self, port: u16) -> Option<&str> {
        self.owners.get(&port).map(String::as_str)
    }
}

/// Health settings applied when a declaration does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthDefaults {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub degraded_latency: Duration,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        let spec = HealthCheckSpec::new(HealthCheckKind::Process);
        Self {
            interval: spec.interval,
            timeout: spec.timeout,
            failure_threshold: spec.failure_threshold,
            degraded_latency: spec.degraded_latency,
        }
    }
}

/// Launch defaults for one language/framework pair.
struct RuntimeProfile {
    default_port: Option<u16>,
    /// HTTP path for web frameworks; `None` means probe with TCP
    http_path: Option<&'static str>,
}

pub struct RuntimeBuilder {
    ports: PortAllocator,
    os_env: HashMap<String, String>,
    env_file: HashMap<String, String>,
    health: HealthDefaults,
}

impl RuntimeBuilder {
    pub fn new(os_env: HashMap<String, String>, env_file: HashMap<String, String>) -> Self {
        Self {
            ports: PortAllocator::new(),
            os_env,
            env_file,
            health: HealthDefaults::default(),
        }
    }

    pub fn with_health_defaults(mut self, health: HealthDefaults) -> Self {
        self.health = health;
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Build every declaration in order. Explicit ports are claimed before any
    /// automatic allocation so a later explicit port is never handed out early.
    /// Once every port is known, each environment gets links to all services
    /// that have one.
    pub fn build_all(
        &mut self,
        services: &[(ServiceDeclaration, LanguageInfo)],
    ) -> Vec<(String, Result<RuntimeConfig, ConfigError>)> {
        for (decl, _) in services {
            if let Some(port) = decl.port.filter(|p| *p > 0) {
                if let Err(owner) = self.ports.claim(port, &decl.name) {
                    debug!(service = %decl.name, port, owner = %owner, "Explicit port already claimed");
                }
            }
        }

        let prepared: Vec<_> = services
            .iter()
            .map(|(decl, info)| (decl.name.clone(), self.prepare(decl, info)))
            .collect();

        let links = env::service_links(
            prepared
                .iter()
                .filter_map(|(_, r)| r.as_ref().ok())
                .map(|(config, _)| (config.name.as_str(), config.port)),
        );

        prepared
            .into_iter()
            .map(|(name, result)| {
                let result = result.map(|(mut config, overlay)| {
                    config.env =
                        env::resolve_with_links(&self.os_env, &self.env_file, &links, &overlay);
                    config
                });
                (name, result)
            })
            .collect()
    }

    /// Resolve one declaration into an executable runtime configuration.
    /// Service links are only added by [`build_all`](Self::build_all).
    pub fn build(
        &mut self,
        decl: &ServiceDeclaration,
        detected: &LanguageInfo,
    ) -> Result<RuntimeConfig, ConfigError> {
        let (mut config, overlay) = self.prepare(decl, detected)?;
        config.env = env::resolve(&self.os_env, &self.env_file, &overlay);
        Ok(config)
    }

    /// Everything but the environment, plus the service-level env overlay.
    fn prepare(
        &mut self,
        decl: &ServiceDeclaration,
        detected: &LanguageInfo,
    ) -> Result<(RuntimeConfig, HashMap<String, String>), ConfigError> {
        if decl.host == HostKind::Container {
            return Err(ConfigError::UnsupportedHost {
                service: decl.name.clone(),
                host: decl.host.as_str().to_string(),
            });
        }

        let project_dir = decl.project_dir.clone();
        if !project_dir.is_dir() {
            return Err(ConfigError::ProjectDirMissing {
                service: decl.name.clone(),
                path: project_dir,
            });
        }

        let framework = detected.framework.as_deref();
        let profile = detected
            .language
            .as_ref()
            .map(|lang| profile_for(lang, framework))
            .unwrap_or(RuntimeProfile {
                default_port: None,
                http_path: None,
            });

        let override_kind = decl.health.as_ref().and_then(|h| h.kind);
        let port = self.assign_port(decl, &profile, override_kind)?;

        let mut overlay = HashMap::new();
        let (command, args) = match &decl.command {
            Some(line) => split_command(line).ok_or_else(|| ConfigError::Invalid {
                service: decl.name.clone(),
                detail: "declared command is empty".into(),
            })?,
            None => default_command(&project_dir, detected, port, &mut overlay).ok_or_else(
                || ConfigError::NoDefaultCommand {
                    service: decl.name.clone(),
                    runtime: detected
                        .language
                        .as_ref()
                        .map(|l| l.as_str().to_string())
                        .unwrap_or_else(|| "unknown".into()),
                },
            )?,
        };

        let health_check = self.health_spec(decl, &profile, port)?;

        overlay.extend(decl.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut config = RuntimeConfig::new(&decl.name, command)
            .args(args)
            .working_dir(project_dir)
            .port(port)
            .health_check(health_check);
        config.language = detected.language.as_ref().map(|l| l.as_str().to_string());
        config.framework = detected.framework.clone();

        debug!(
            service = %config.name,
            command = %config.command_line(),
            port = config.port,
            health = config.health_check.kind.as_str(),
            "Runtime resolved"
        );
        Ok((config, overlay))
    }

    fn assign_port(
        &mut self,
        decl: &ServiceDeclaration,
        profile: &RuntimeProfile,
        override_kind: Option<HealthCheckKind>,
    ) -> Result<u16, ConfigError> {
        match decl.port {
            Some(0) => return Ok(0),
            Some(port) => {
                return self.ports.claim(port, &decl.name).map(|_| port).map_err(|owner| {
                    ConfigError::Invalid {
                        service: decl.name.clone(),
                        detail: format!("port {} is already declared by '{}'", port, owner),
                    }
                })
            }
            None => {}
        }

        if matches!(
            override_kind,
            Some(HealthCheckKind::Process | HealthCheckKind::None)
        ) {
            return Ok(0);
        }

        let Some(preferred) = profile.default_port else {
            return Ok(0);
        };

        let port = self
            .ports
            .allocate(preferred, &decl.name)
            .ok_or_else(|| ConfigError::Invalid {
                service: decl.name.clone(),
                detail: format!("no free port at or above {}", preferred),
            })?;
        trace!(service = %decl.name, preferred, port, "Port allocated");
        Ok(port)
    }

    fn health_spec(
        &self,
        decl: &ServiceDeclaration,
        profile: &RuntimeProfile,
        port: u16,
    ) -> Result<HealthCheckSpec, ConfigError> {
        let overrides = decl.health.clone().unwrap_or_default();

        let kind = overrides.kind.unwrap_or(if port == 0 {
            HealthCheckKind::Process
        } else if profile.http_path.is_some() || overrides.path.is_some() {
            HealthCheckKind::Http
        } else {
            HealthCheckKind::Tcp
        });

        if port == 0 && matches!(kind, HealthCheckKind::Http | HealthCheckKind::Tcp) {
            return Err(ConfigError::Invalid {
                service: decl.name.clone(),
                detail: format!("{} health check requires a port", kind.as_str()),
            });
        }

        let mut spec = HealthCheckSpec::new(kind)
            .interval(ms_or(overrides.interval_ms, self.health.interval))
            .timeout(ms_or(overrides.timeout_ms, self.health.timeout))
            .failure_threshold(
                overrides
                    .failure_threshold
                    .unwrap_or(self.health.failure_threshold),
            )
            .degraded_latency(ms_or(
                overrides.degraded_latency_ms,
                self.health.degraded_latency,
            ));

        if kind == HealthCheckKind::Http {
            spec = spec.path(
                overrides
                    .path
                    .unwrap_or_else(|| profile.http_path.unwrap_or("/").to_string()),
            );
        }
        Ok(spec)
    }
}

fn ms_or(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}

fn split_command(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace().map(str::to_string);
    let command = parts.next()?;
    Some((command, parts.collect()))
}

fn profile_for(language: &Language, framework: Option<&str>) -> RuntimeProfile {
    let (default_port, http_path) = match (language, framework) {
        (Language::Node, Some("vite" | "react")) => (Some(5173), Some("/")),
        (Language::Node, Some(_)) => (Some(3000), Some("/")),
        (Language::Node, None) => (Some(3000), None),
        (Language::Python, Some("flask")) => (Some(5000), Some("/")),
        (Language::Python, Some("fastapi")) => (Some(8000), Some("/docs")),
        (Language::Python, Some(_)) => (Some(8000), Some("/")),
        (Language::Python, None) => (Some(8000), None),
        (Language::Go | Language::Rust, _) => (Some(8080), None),
        (Language::DotNet, _) => (Some(5000), Some("/")),
        (Language::Java, Some("spring")) => (Some(8080), Some("/actuator/health")),
        (Language::Java, _) => (Some(8080), None),
        (Language::Functions, _) => (Some(7071), Some("/")),
        (Language::Other(_), _) => (None, None),
    };
    RuntimeProfile {
        default_port,
        http_path,
    }
}

/// Default command line for a runtime. `overlay` receives env vars the
/// command depends on; declared service env still wins over them.
fn default_command(
    dir: &Path,
    detected: &LanguageInfo,
    port: u16,
    overlay: &mut HashMap<String, String>,
) -> Option<(String, Vec<String>)> {
    let framework = detected.framework.as_deref();
    let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let resolved = match detected.language.as_ref()? {
        Language::Python => {
            let python = python_interpreter(dir);
            let entry = python_entry(dir);
            let port = port.to_string();
            let args = match framework {
                Some("django") => vec![
                    "manage.py".into(),
                    "runserver".into(),
                    format!("0.0.0.0:{}", port),
                ],
                Some("fastapi") => vec![
                    "-m".into(),
                    "uvicorn".into(),
                    format!("{}:app", entry),
                    "--reload".into(),
                    "--host".into(),
                    "0.0.0.0".into(),
                    "--port".into(),
                    port,
                ],
                Some("flask") => {
                    overlay.insert("FLASK_APP".into(), format!("{}.py", entry));
                    args(&["-m", "flask", "run", "--host", "0.0.0.0", "--port", &port])
                }
                _ => vec![format!("{}.py", entry)],
            };
            (python, args)
        }
        Language::Node => {
            let pm = node_package_manager(dir);
            let script = if has_script(dir, "dev") { "dev" } else { "start" };
            (pm.to_string(), args(&["run", script]))
        }
        Language::Go => ("go".into(), args(&["run", "."])),
        Language::Rust => ("cargo".into(), args(&["run"])),
        Language::DotNet => match find_file_with_ext(dir, "csproj") {
            Some(project) => (
                "dotnet".into(),
                vec![
                    "run".into(),
                    "--project".into(),
                    project.display().to_string(),
                ],
            ),
            None => ("dotnet".into(), args(&["run"])),
        },
        Language::Java => {
            let spring = framework == Some("spring");
            if dir.join("pom.xml").is_file() {
                let goal = if spring { "spring-boot:run" } else { "exec:java" };
                ("mvn".into(), args(&[goal]))
            } else {
                let task = if spring { "bootRun" } else { "run" };
                ("gradle".into(), args(&[task]))
            }
        }
        Language::Functions => (
            "func".into(),
            vec!["start".into(), "--port".into(), port.to_string()],
        ),
        Language::Other(_) => return None,
    };
    Some(resolved)
}

/// Virtualenv interpreter when one exists next to the project, else `python`.
fn python_interpreter(dir: &Path) -> String {
    let candidates: [PathBuf; 4] = [
        dir.join(".venv").join("bin").join("python"),
        dir.join(".venv").join("Scripts").join("python.exe"),
        dir.join("venv").join("bin").join("python"),
        dir.join("venv").join("Scripts").join("python.exe"),
    ];
    candidates
        .iter()
        .find(|p| p.is_file())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "python".to_string())
}

fn python_entry(dir: &Path) -> &'static str {
    ["main", "app"]
        .into_iter()
        .find(|name| dir.join(format!("{}.py", name)).is_file())
        .unwrap_or("main")
}

fn node_package_manager(dir: &Path) -> &'static str {
    if dir.join("pnpm-lock.yaml").is_file() {
        "pnpm"
    } else if dir.join("yarn.lock").is_file() {
        "yarn"
    } else {
        "npm"
    }
}

fn has_script(dir: &Path, script: &str) -> bool {
    std::fs::read_to_string(dir.join("package.json"))
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|json| json.get("scripts")?.get(script).cloned())
        .is_some()
}
