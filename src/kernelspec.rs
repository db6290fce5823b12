//! Discovery of installable kernel types (C1).
//!
//! A kernel spec is a `kernel.json` resource directory under one of the
//! standard Jupyter data directories, naming the executable to launch and
//! how to launch it. The registry enumerates these once at startup and
//! treats the result as immutable afterward.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::GatewayError;

/// A single installable kernel type and its launch arguments.
///
/// See <https://jupyter-client.readthedocs.io/en/latest/kernels.html#kernel-specs>.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelSpec {
    /// Directory name this spec was loaded from (the canonical kernel name).
    #[serde(skip_deserializing)]
    pub name: String,
    /// Command-line argument template; `{connection_file}` is substituted at launch.
    pub argv: Vec<String>,
    /// Human-readable name shown to users.
    pub display_name: String,
    /// Language the kernel executes, e.g. `python`.
    pub language: String,
    /// How the kernel wants to be interrupted.
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
    /// Environment variables merged into the child process on launch.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Free-form metadata, including `metadata.kernelspec` conventions used
    /// by notebook seed documents.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// How a kernel expects to be interrupted.
#[derive(Default, Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Send SIGINT to the process group (the default).
    #[default]
    Signal,
    /// Send an `interrupt_request` on the control channel.
    Message,
}

/// Resource files (logo, etc.) discovered alongside `kernel.json`, surfaced
/// verbatim in `/api/kernelspecs` but otherwise opaque to the gateway.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Resources {
    files: BTreeMap<String, PathBuf>,
}

/// The immutable set of kernel specs discovered at startup.
#[derive(Clone, Debug, Default)]
pub struct KernelSpecRegistry {
    specs: BTreeMap<String, (KernelSpec, Resources)>,
    default_name: Option<String>,
}

impl KernelSpecRegistry {
    /// Discover all kernel specs on the standard search path.
    pub async fn discover() -> Self {
        let dirs = data_search_paths();
        let mut specs = BTreeMap::new();
        for (name, spec, resources) in join_all(dirs.iter().map(|d| list_kernels_from_path(d)))
            .await
            .into_iter()
            .flatten()
        {
            specs.entry(name).or_insert((spec, resources));
        }
        let default_name = specs.keys().next().cloned();
        Self { specs, default_name }
    }

    /// Look up a kernel spec by name, applying `force_kernel_name` and
    /// `default_kernel_name` overrides.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        force_kernel_name: &str,
        default_kernel_name: &str,
    ) -> Result<&KernelSpec, GatewayError> {
        let name = if !force_kernel_name.is_empty() {
            force_kernel_name
        } else {
            match requested {
                Some(name) if !name.is_empty() => name,
                _ if !default_kernel_name.is_empty() => default_kernel_name,
                _ => self
                    .default_name
                    .as_deref()
                    .ok_or_else(|| GatewayError::UnknownSpec(String::new()))?,
            }
        };
        self.specs
            .get(name)
            .map(|(spec, _)| spec)
            .ok_or_else(|| GatewayError::UnknownSpec(name.to_string()))
    }

    /// The kernel name that would be used for an empty/absent request,
    /// honoring the same override order as [`resolve`](Self::resolve).
    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Whether at least one kernel spec was discovered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All discovered specs, keyed by name, for `/api/kernelspecs`.
    pub fn all(&self) -> impl Iterator<Item = (&str, &KernelSpec, &Resources)> {
        self.specs
            .iter()
            .map(|(name, (spec, resources))| (name.as_str(), spec, resources))
    }
}

/// Ordered search path to find installable kernel spec directories, per
/// <https://docs.jupyter.org/en/latest/use/jupyter-directories.html#data-files>.
fn data_search_paths() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(jupyter_path) = env::var("JUPYTER_PATH") {
        let pathsep = if cfg!(windows) { ";" } else { ":" };
        dirs.extend(jupyter_path.split(pathsep).map(PathBuf::from));
    }
    dirs.push(data_dir());
    #[cfg(unix)]
    dirs.extend([
        PathBuf::from("/usr/share/jupyter"),
        PathBuf::from("/usr/local/share/jupyter"),
    ]);
    dirs
}

/// The user-level data directory Jupyter tooling conventionally uses.
pub fn data_dir() -> PathBuf {
    if let Ok(jupyter_data_dir) = env::var("JUPYTER_DATA_DIR") {
        return PathBuf::from(jupyter_data_dir);
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from(env::var("HOME").unwrap_or_default()).join("Library/Jupyter")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        match env::var("XDG_DATA_HOME") {
            Ok(xdg) => PathBuf::from(xdg).join("jupyter"),
            Err(_) => PathBuf::from(env::var("HOME").unwrap_or_default()).join(".local/share/jupyter"),
        }
    }
    #[cfg(windows)]
    {
        PathBuf::from(env::var("AppData").unwrap_or_default()).join("jupyter")
    }
}

async fn list_kernels_from_path(path: &Path) -> Vec<(String, KernelSpec, Resources)> {
    let mut found = Vec::new();
    let Ok(mut entries) = fs::read_dir(path.join("kernels")).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(raw) = fs::read(dir.join("kernel.json")).await else {
            continue;
        };
        let Ok(mut spec) = serde_json::from_slice::<KernelSpec>(&raw) else {
            continue;
        };
        spec.name = name.to_string();

        let mut resources = Resources::default();
        if let Ok(mut files) = fs::read_dir(&dir).await {
            while let Ok(Some(file)) = files.next_entry().await {
                let file_path = file.path();
                if file_path.file_name().and_then(|n| n.to_str()) == Some("kernel.json") {
                    continue;
                }
                if let Some(file_name) = file_path.file_name().and_then(|n| n.to_str()) {
                    resources.files.insert(file_name.to_string(), file_path);
                }
            }
        }

        found.push((name.to_string(), spec, resources));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> KernelSpec {
        KernelSpec {
            name: name.to_string(),
            argv: vec!["kernel".into(), "{connection_file}".into()],
            display_name: name.to_string(),
            language: "python".into(),
            interrupt_mode: InterruptMode::Signal,
            env: BTreeMap::new(),
            metadata: serde_json::json!({}),
        }
    }

    fn registry_with(names: &[&str]) -> KernelSpecRegistry {
        let mut specs = BTreeMap::new();
        for name in names {
            specs.insert(name.to_string(), (spec(name), Resources::default()));
        }
        let default_name = names.first().map(|n| n.to_string());
        KernelSpecRegistry { specs, default_name }
    }

    #[test]
    fn resolve_falls_back_to_default_when_nothing_requested() {
        let registry = registry_with(&["python3", "ir"]);
        let resolved = registry.resolve(None, "", "").unwrap();
        assert_eq!(resolved.name, "python3");
    }

    #[test]
    fn resolve_honors_explicit_request() {
        let registry = registry_with(&["python3", "ir"]);
        let resolved = registry.resolve(Some("ir"), "", "").unwrap();
        assert_eq!(resolved.name, "ir");
    }

    #[test]
    fn force_kernel_name_overrides_everything() {
        let registry = registry_with(&["python3", "ir"]);
        let resolved = registry.resolve(Some("python3"), "ir", "").unwrap();
        assert_eq!(resolved.name, "ir");
    }

    #[test]
    fn default_kernel_name_used_when_request_empty() {
        let registry = registry_with(&["python3", "ir"]);
        let resolved = registry.resolve(Some(""), "", "ir").unwrap();
        assert_eq!(resolved.name, "ir");
    }

    #[test]
    fn unknown_spec_name_is_an_error() {
        let registry = registry_with(&["python3"]);
        assert!(matches!(
            registry.resolve(Some("nope"), "", ""),
            Err(GatewayError::UnknownSpec(name)) if name == "nope"
        ));
    }
}
