//! replink attach - find a Spring Boot JVM and inject the dev-runtime agent
//!
//! 1. **Discovery**: list local `java` processes, read each one's system
//!    properties over the HotSpot attach socket, score and rank them
//! 2. **Port selection**: keep the preferred agent port if it is free, else
//!    take an ephemeral one
//! 3. **Injection**: attach to the chosen JVM, load the agent with
//!    `port=<port>`, always detach
//!
//! Linux only. All attach work blocks; the async entry points in [`auto`]
//! run it on the blocking pool.

pub mod agent;
pub mod auto;
pub mod discovery;
pub mod error;
pub mod inject;
pub mod port;
pub mod provider;
pub mod scoring;
pub mod vm;

pub use agent::{resolve_agent_jar, AgentLookup, DEFAULT_AGENT_VERSION};
pub use auto::{
    attach_pid, attach_pid_with, auto_attach, auto_attach_with, list_candidates, AttachOptions,
    AttachOutcome, DEFAULT_AGENT_PORT,
};
pub use discovery::{rank_candidates, read_properties, VmCandidate};
pub use error::{AttachError, Result};
pub use inject::{agent_options, inject_agent};
pub use port::{pick_port, pick_port_on, PortChoice};
pub use provider::{list_java_processes, AttachProvider, AttachedVm, HotSpotProvider, VmDescriptor};
pub use scoring::{score, Properties};
pub use vm::{parse_properties, VirtualMachine};
