//! Environment composition for service processes
//!
//! Layers, lowest to highest precedence:
//! 1. the orchestrator's own OS environment (ambient session/credential
//!    variables pass through to every child),
//! 2. the env-file given on the command line,
//! 3. generated links to every service with a port ([`service_links`]),
//! 4. variables declared for the service in the manifest.
//!
//! A higher layer replaces a same-named key from a lower one as a whole.

use crate::error::{OrchestratorError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, trace};

/// Snapshot of the current process environment. Non-UTF-8 entries are skipped.
pub fn os_environment() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Parse a dotenv-style file without touching the process environment.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    debug!(path = %path.display(), "Loading env file");
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        OrchestratorError::Manifest(format!("cannot read env file {}: {}", path.display(), e))
    })?;

    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            OrchestratorError::Manifest(format!("invalid env file {}: {}", path.display(), e))
        })?;
        vars.insert(key, value);
    }
    trace!(count = vars.len(), "Env file loaded");
    Ok(vars)
}

/// Compose the final environment for one service without service links.
///
/// Pure: the same three inputs always yield the same map. `${NAME}` inside a
/// per-service value expands against the merged lower layers; unknown names
/// expand to an empty string.
pub fn resolve(
    os_env: &HashMap<String, String>,
    env_file: &HashMap<String, String>,
    service: &HashMap<String, String>,
) -> HashMap<String, String> {
    resolve_with_links(os_env, env_file, &HashMap::new(), service)
}

/// [`resolve`] with a service-link layer between the env-file and the service values.
pub fn resolve_with_links(
    os_env: &HashMap<String, String>,
    env_file: &HashMap<String, String>,
    links: &HashMap<String, String>,
    service: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = os_env.clone();
    env.extend(env_file.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(links.iter().map(|(k, v)| (k.clone(), v.clone())));

    let base = env.clone();
    for (key, value) in service {
        env.insert(key.clone(), expand(value, &base));
    }
    env
}

/// `SERVICE_URL_<NAME>`, `SERVICE_PORT_<NAME>` and `SERVICE_HOST_<NAME>` for
/// each `(name, port)` with a non-zero port. `NAME` is upper-cased with `-` as `_`.
pub fn service_links<'a, I>(services: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, u16)>,
{
    let mut links = HashMap::new();
    for (name, port) in services {
        if port == 0 {
            continue;
        }
        let key = name.to_ascii_uppercase().replace('-', "_");
        links.insert(
            format!("SERVICE_URL_{}", key),
            format!("http://localhost:{}", port),
        );
        links.insert(format!("SERVICE_PORT_{}", key), port.to_string());
        links.insert(format!("SERVICE_HOST_{}", key), "localhost".to_string());
    }
    links
}

fn expand(value: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(v) = vars.get(name) {
                    out.push_str(v);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
