//! Attach orchestration.
//!
//! Resolves the agent, picks a port, chooses a target and injects. Every
//! failure along the way is folded into an [`AttachOutcome`]; nothing here
//! returns an error to the caller.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{resolve_agent_jar, AgentLookup};
use crate::discovery::{rank_candidates, VmCandidate};
use crate::error::AttachError;
use crate::inject::inject_agent;
use crate::port::{pick_port, PortChoice};
use crate::provider::{AttachProvider, HotSpotProvider};

/// Default port the agent is asked to serve on.
pub const DEFAULT_AGENT_PORT: u16 = 5557;

/// Result of an attach attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachOutcome {
    pub attached: bool,
    pub pid: Option<u32>,
    /// Port the agent was told to listen on.
    pub port: Option<u16>,
    pub port_fallback: bool,
    pub message: Option<String>,
}

impl AttachOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            attached: false,
            pid: None,
            port: None,
            port_fallback: false,
            message: Some(message.into()),
        }
    }

    fn succeeded(pid: u32, choice: PortChoice) -> Self {
        Self {
            attached: true,
            pid: Some(pid),
            port: Some(choice.port),
            port_fallback: choice.fallback,
            message: None,
        }
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        match (self.attached, self.pid, self.port) {
            (true, Some(pid), Some(port)) => {
                let suffix = if self.port_fallback {
                    " (fallback port)"
                } else {
                    ""
                };
                format!("Agent attached to PID {pid} (port {port}){suffix}")
            }
            _ => format!(
                "Attach failed: {}",
                self.message.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Inputs for an attach attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub preferred_port: u16,
    pub agent: AgentLookup,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            preferred_port: DEFAULT_AGENT_PORT,
            agent: AgentLookup::default(),
        }
    }
}

// ============================================================================
// Blocking Orchestration
// ============================================================================

/// Attaches to the best-ranked JVM only; a failed injection is reported, not
/// retried on the next candidate.
///
/// This function performs blocking I/O and should be called via `spawn_blocking`.
pub fn auto_attach_with(provider: &dyn AttachProvider, options: &AttachOptions) -> AttachOutcome {
    let jar = match resolve_agent_jar(&options.agent) {
        Ok(jar) => jar,
        Err(e) => return AttachOutcome::failed(e.to_string()),
    };
    let choice = pick_port(options.preferred_port);

    let candidates = rank_candidates(provider);
    let Some(target) = candidates.first() else {
        return AttachOutcome::failed(AttachError::NoCandidates.to_string());
    };

    info!(
        pid = target.descriptor.pid,
        score = target.score,
        name = %target.descriptor.display_name,
        "Auto-attach target selected"
    );
    inject(provider, target.descriptor.pid, &jar, choice)
}

/// Attaches to an explicit pid, bypassing discovery.
///
/// This function performs blocking I/O and should be called via `spawn_blocking`.
pub fn attach_pid_with(
    provider: &dyn AttachProvider,
    pid: u32,
    options: &AttachOptions,
) -> AttachOutcome {
    let jar = match resolve_agent_jar(&options.agent) {
        Ok(jar) => jar,
        Err(e) => return AttachOutcome::failed(e.to_string()),
    };
    inject(provider, pid, &jar, pick_port(options.preferred_port))
}

fn inject(provider: &dyn AttachProvider, pid: u32, jar: &Path, choice: PortChoice) -> AttachOutcome {
    match inject_agent(provider, pid, jar, choice.port) {
        Ok(()) => AttachOutcome::succeeded(pid, choice),
        Err(e) => {
            warn!(pid, error = %e, "Attach failed");
            AttachOutcome::failed(e.to_string())
        }
    }
}

// ============================================================================
// Async Entry Points
// ============================================================================

/// [`auto_attach_with`] against local HotSpot JVMs, off the async runtime.
pub async fn auto_attach(options: AttachOptions) -> AttachOutcome {
    tokio::task::spawn_blocking(move || auto_attach_with(&HotSpotProvider::new(), &options))
        .await
        .unwrap_or_else(|e| AttachOutcome::failed(format!("attach task failed: {e}")))
}

/// [`attach_pid_with`] against a local HotSpot JVM, off the async runtime.
pub async fn attach_pid(pid: u32, options: AttachOptions) -> AttachOutcome {
    tokio::task::spawn_blocking(move || attach_pid_with(&HotSpotProvider::new(), pid, &options))
        .await
        .unwrap_or_else(|e| AttachOutcome::failed(format!("attach task failed: {e}")))
}

/// Ranked local candidates, off the async runtime.
pub async fn list_candidates() -> Vec<VmCandidate> {
    match tokio::task::spawn_blocking(|| rank_candidates(&HotSpotProvider::new())).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "Discovery task panicked");
            Vec::new()
        }
    }
}
