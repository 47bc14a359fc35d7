//! Project manifest and the project resolver seam
//!
//! The orchestrator only needs an ordered list of [`ServiceDeclaration`]s and
//! a [`LanguageInfo`] per declaration. [`ManifestResolver`] provides both from
//! a `devrun.toml` file, falling back to marker-file detection for services
//! that do not declare a language.

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::protocol::HealthCheckKind;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const DEFAULT_MANIFEST_FILE: &str = "devrun.toml";

/// How a service is hosted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    #[default]
    Process,
    Function,
    Container,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Process => "process",
            HostKind::Function => "function",
            HostKind::Container => "container",
        }
    }
}

/// Shell snippets run around a service. Parsed for completeness; the
/// orchestrator does not execute them.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Hooks {
    pub prerun: Option<String>,
    pub postrun: Option<String>,
}

/// Per-service health-check overrides. Unset fields fall back to defaults.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HealthOverride {
    pub kind: Option<HealthCheckKind>,
    pub path: Option<String>,
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub degraded_latency_ms: Option<u64>,
}

/// One service as declared in the manifest. Immutable once resolved.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceDeclaration {
    pub name: String,
    #[serde(rename = "project")]
    pub project_dir: PathBuf,
    #[serde(default)]
    pub host: HostKind,
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub hooks: Option<Hooks>,
    pub language: Option<String>,
    pub framework: Option<String>,
    /// Whitespace-separated command line replacing the runtime default
    pub command: Option<String>,
    pub health: Option<HealthOverride>,
}

impl ServiceDeclaration {
    pub fn new(name: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            project_dir: project_dir.into(),
            host: HostKind::Process,
            port: None,
            env: HashMap::new(),
            hooks: None,
            language: None,
            framework: None,
            command: None,
            health: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn host(mut self, host: HostKind) -> Self {
        self.host = host;
        self
    }

    pub fn health(mut self, health: HealthOverride) -> Self {
        self.health = Some(health);
        self
    }
}

/// Parsed `devrun.toml`.
#[derive(Deserialize, Debug, Clone)]
pub struct Manifest {
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceDeclaration>,
}

impl Manifest {
    /// Read and validate a manifest; project paths become relative to its directory.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading manifest");
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base)
    }

    pub fn parse(content: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: Manifest =
            toml::from_str(content).map_err(|e| OrchestratorError::Manifest(e.to_string()))?;

        for service in &mut manifest.services {
            if service.project_dir.is_relative() {
                service.project_dir = base_dir.join(&service.project_dir);
            }
        }

        manifest.validate()?;
        trace!(services = manifest.services.len(), "Manifest parsed");
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(OrchestratorError::Manifest("no services declared".into()));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(OrchestratorError::Manifest(
                    "service with an empty name".into(),
                ));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(OrchestratorError::Manifest(format!(
                    "duplicate service name '{}'",
                    service.name
                )));
            }
        }
        Ok(())
    }

    /// Keep only the named services, preserving declaration order.
    pub fn select(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        for name in names {
            if !self.services.iter().any(|s| &s.name == name) {
                let available: Vec<_> = self.services.iter().map(|s| s.name.as_str()).collect();
                return Err(OrchestratorError::Manifest(format!(
                    "unknown service '{}' (available: {})",
                    name,
                    available.join(", ")
                )));
            }
        }
        self.services.retain(|s| names.contains(&s.name));
        Ok(self)
    }
}

/// Runtime family of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Language {
    Node,
    Python,
    Go,
    Rust,
    DotNet,
    Java,
    /// Serverless functions host
    Functions,
    Other(String),
}

impl Language {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "js" | "javascript" | "node" | "nodejs" | "node.js" | "ts" | "typescript" => {
                Language::Node
            }
            "py" | "python" => Language::Python,
            "go" | "golang" => Language::Go,
            "rs" | "rust" => Language::Rust,
            "cs" | "csharp" | "c#" | "dotnet" | ".net" => Language::DotNet,
            "java" => Language::Java,
            "functions" | "func" => Language::Functions,
            other => Language::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Language::Node => "node",
            Language::Python => "python",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::DotNet => "dotnet",
            Language::Java => "java",
            Language::Functions => "functions",
            Language::Other(name) => name.as_str(),
        }
    }
}

/// What the resolver learned about a service's runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageInfo {
    /// `None` when nothing was declared or detected
    pub language: Option<Language>,
    /// Lowercase framework key, e.g. `fastapi`, `next`
    pub framework: Option<String>,
}

impl LanguageInfo {
    pub fn new(language: Language) -> Self {
        Self {
            language: Some(language),
            framework: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            language: None,
            framework: None,
        }
    }

    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into().to_ascii_lowercase());
        self
    }
}

/// Source of service declarations for a run.
pub trait ProjectResolver {
    /// Ordered, name-unique declarations.
    fn declarations(&self) -> Result<Vec<ServiceDeclaration>>;

    /// Language/framework for one declaration.
    fn detect(&self, decl: &ServiceDeclaration) -> LanguageInfo;
}

/// Resolver backed by a parsed manifest plus marker-file detection.
pub struct ManifestResolver {
    manifest: Manifest,
}

impl ManifestResolver {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(Manifest::load(path)?))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

impl ProjectResolver for ManifestResolver {
    fn declarations(&self) -> Result<Vec<ServiceDeclaration>> {
        Ok(self.manifest.services.clone())
    }

    fn detect(&self, decl: &ServiceDeclaration) -> LanguageInfo {
        let language = match (&decl.language, decl.host) {
            (Some(lang), _) => Some(Language::parse(lang)),
            (None, HostKind::Function) => Some(Language::Functions),
            (None, _) => detect_language(&decl.project_dir),
        };

        let framework = decl
            .framework
            .as_ref()
            .map(|f| f.to_ascii_lowercase())
            .or_else(|| {
                language
                    .as_ref()
                    .and_then(|lang| detect_framework(&decl.project_dir, lang))
            });

        trace!(service = %decl.name, language = ?language, framework = ?framework, "Detected runtime");
        LanguageInfo {
            language,
            framework,
        }
    }
}

/// Guess the language from marker files in a project directory.
pub fn detect_language(dir: &Path) -> Option<Language> {
    let has = |name: &str| dir.join(name).is_file();

    if has("host.json") {
        return Some(Language::Functions);
    }
    if has("package.json") {
        return Some(Language::Node);
    }
    if has("pyproject.toml") || has("requirements.txt") || has("manage.py") {
        return Some(Language::Python);
    }
    if has("go.mod") {
        return Some(Language::Go);
    }
    if has("Cargo.toml") {
        return Some(Language::Rust);
    }
    if has("pom.xml") || has("build.gradle") || has("build.gradle.kts") {
        return Some(Language::Java);
    }
    if has_file_with_ext(dir, "csproj") {
        return Some(Language::DotNet);
    }
    None
}

/// Guess the framework for a known language.
pub fn detect_framework(dir: &Path, language: &Language) -> Option<String> {
    match language {
        Language::Node => {
            let deps = package_dependencies(dir);
            ["next", "@nestjs/core", "vite", "react", "express"]
                .iter()
                .find(|dep| deps.contains(**dep))
                .map(|dep| match *dep {
                    "@nestjs/core" => "nest".to_string(),
                    other => other.to_string(),
                })
        }
        Language::Python => {
            if dir.join("manage.py").is_file() {
                return Some("django".into());
            }
            let manifests = ["requirements.txt", "pyproject.toml"]
                .iter()
                .filter_map(|f| std::fs::read_to_string(dir.join(f)).ok())
                .collect::<Vec<_>>()
                .join("\n")
                .to_ascii_lowercase();
            ["fastapi", "flask", "django"]
                .iter()
                .find(|fw| manifests.contains(**fw))
                .map(|fw| fw.to_string())
        }
        Language::Java => {
            let build = ["pom.xml", "build.gradle", "build.gradle.kts"]
                .iter()
                .filter_map(|f| std::fs::read_to_string(dir.join(f)).ok())
                .any(|content| content.contains("spring-boot"));
            build.then(|| "spring".to_string())
        }
        _ => None,
    }
}

fn package_dependencies(dir: &Path) -> HashSet<String> {
    let Ok(content) = std::fs::read_to_string(dir.join("package.json")) else {
        return HashSet::new();
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) else {
        return HashSet::new();
    };
    ["dependencies", "devDependencies"]
        .iter()
        .filter_map(|section| json.get(section).and_then(|v| v.as_object()))
        .flat_map(|deps| deps.keys().cloned())
        .collect()
}

pub(crate) fn has_file_with_ext(dir: &Path, ext: &str) -> bool {
    find_file_with_ext(dir, ext).is_some()
}

pub(crate) fn find_file_with_ext(dir: &Path, ext: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == ext))
        .collect();
    matches.sort();
    matches.into_iter().next()
}
