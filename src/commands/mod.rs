pub(crate) mod completions;
pub(crate) mod run;
pub(crate) mod services;

use std::path::PathBuf;

use anyhow::Context;
use devrun::error::ConfigError;
use devrun::manifest::{Manifest, ManifestResolver, ProjectResolver, DEFAULT_MANIFEST_FILE};
use devrun::orchestrator::{env, RuntimeBuilder, RuntimeConfig};
use devrun::user_config::UserConfig;

use crate::args::ManifestArgs;

/// Resolved launch plan: runnable configs plus per-service configuration errors.
pub(crate) struct Plan {
    pub manifest_path: PathBuf,
    pub project: Option<String>,
    pub configs: Vec<RuntimeConfig>,
    pub errors: Vec<ConfigError>,
}

/// Manifest path: flag > $DEVRUN_MANIFEST > ./devrun.toml
fn manifest_path(args: &ManifestArgs) -> PathBuf {
    args.manifest
        .clone()
        .or_else(devrun::clienv::manifest)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_FILE))
}

pub(crate) fn resolve_plan(args: &ManifestArgs, user: &UserConfig) -> anyhow::Result<Plan> {
    let manifest_path = manifest_path(args);
    let manifest = Manifest::load(&manifest_path)?.select(&args.services)?;
    let project = manifest.name.clone();
    let resolver = ManifestResolver::new(manifest);

    let env_file = match &args.env_file {
        Some(path) => env::load_env_file(path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?,
        None => Default::default(),
    };

    let services: Vec<_> = resolver
        .declarations()?
        .into_iter()
        .map(|decl| {
            let info = resolver.detect(&decl);
            (decl, info)
        })
        .collect();

    let mut builder = RuntimeBuilder::new(env::os_environment(), env_file)
        .with_health_defaults(user.health.defaults());

    let mut configs = Vec::new();
    let mut errors = Vec::new();
    for (_, result) in builder.build_all(&services) {
        match result {
            Ok(config) => configs.push(config),
            Err(e) => errors.push(e),
        }
    }

    Ok(Plan {
        manifest_path,
        project,
        configs,
        errors,
    })
}
