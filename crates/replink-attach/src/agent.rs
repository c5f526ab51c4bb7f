//! Locating the dev-runtime agent JAR.
//!
//! Search order:
//! 1. an explicitly configured path, used only if it exists;
//! 2. the newest `*dev-runtime-agent*.jar` in `dev-runtime/build/libs` under
//!    the working directory (a local build of the agent);
//! 3. the published artifact in the local Maven repository.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::{AttachError, Result};

/// Published agent version looked up when none is configured.
pub const DEFAULT_AGENT_VERSION: &str = "0.7.1";

const BUILD_LIBS_DIR: &str = "dev-runtime/build/libs";
const BUILD_JAR_MARKER: &str = "dev-runtime-agent";

/// Where to look for the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLookup {
    pub explicit: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    /// Root of the local Maven repository (`~/.m2/repository`).
    pub maven_repository: Option<PathBuf>,
    pub version: String,
}

impl Default for AgentLookup {
    fn default() -> Self {
        Self {
            explicit: None,
            working_dir: env::current_dir().ok(),
            maven_repository: dirs::home_dir().map(|home| home.join(".m2").join("repository")),
            version: DEFAULT_AGENT_VERSION.to_string(),
        }
    }
}

impl AgentLookup {
    #[must_use]
    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn effective_version(&self) -> &str {
        match self.version.trim() {
            "" => DEFAULT_AGENT_VERSION,
            version => version,
        }
    }

    /// Path of the published artifact inside `repository`.
    pub fn maven_artifact(&self, repository: &Path) -> PathBuf {
        let version = self.effective_version();
        repository
            .join("hu")
            .join("baader")
            .join("sb-repl-agent")
            .join(version)
            .join(format!("sb-repl-agent-{version}.jar"))
    }
}

/// Resolves the agent JAR, or reports every location searched.
pub fn resolve_agent_jar(lookup: &AgentLookup) -> Result<PathBuf> {
    let mut searched = Vec::new();

    if let Some(explicit) = lookup
        .explicit
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        if explicit.is_file() {
            debug!(path = %explicit.display(), "Using configured agent JAR");
            return Ok(explicit.clone());
        }
        searched.push(explicit.clone());
    }

    if let Some(working_dir) = &lookup.working_dir {
        let libs = working_dir.join(BUILD_LIBS_DIR);
        if let Some(jar) = newest_build_jar(&libs) {
            debug!(path = %jar.display(), "Using locally built agent JAR");
            return Ok(jar);
        }
        searched.push(libs);
    }

    if let Some(repository) = &lookup.maven_repository {
        let artifact = lookup.maven_artifact(repository);
        if artifact.is_file() {
            debug!(path = %artifact.display(), "Using agent JAR from local Maven repository");
            return Ok(artifact);
        }
        searched.push(artifact);
    }

    Err(AttachError::AgentNotFound { searched })
}

fn newest_build_jar(libs: &Path) -> Option<PathBuf> {
    fs::read_dir(libs)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.contains(BUILD_JAR_MARKER) || !name.ends_with(".jar") {
                return None;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((entry.path(), modified))
        })
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path)
}
