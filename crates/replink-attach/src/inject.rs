//! Agent injection into a running JVM.

use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;
use crate::provider::AttachProvider;

/// Agent argument telling the dev-runtime which port to serve the REPL on.
pub fn agent_options(port: u16) -> String {
    format!("port={port}")
}

/// Attaches to `pid`, loads `jar` with `port=<port>`, then detaches.
///
/// Detach is attempted whatever the load outcome; a detach failure is logged
/// and never replaces the load result. Attach and load failures propagate.
pub fn inject_agent(provider: &dyn AttachProvider, pid: u32, jar: &Path, port: u16) -> Result<()> {
    let vm = provider.attach(pid)?;
    let loaded = vm.load_agent(jar, &agent_options(port));
    if let Err(e) = vm.detach() {
        warn!(pid, error = %e, "Detach after agent load failed");
    }
    loaded?;

    info!(pid, port, jar = %jar.display(), "Agent injected");
    Ok(())
}
