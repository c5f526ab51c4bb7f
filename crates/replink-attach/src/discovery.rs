//! Candidate discovery - ranks local JVMs by how likely they run Spring Boot.
//!
//! Every listed JVM is attached to once to read its system properties, then
//! detached, before any agent is loaded anywhere.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A JVM whose properties cannot be read scores 0 and is dropped; the rest
//!   are still ranked

use std::cmp::Reverse;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::provider::{AttachProvider, VmDescriptor};
use crate::scoring::{self, Properties};

/// A JVM worth attaching to, with its heuristic score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmCandidate {
    pub descriptor: VmDescriptor,
    pub score: i32,
}

/// Attaches, reads system properties, and always detaches.
pub fn read_properties(provider: &dyn AttachProvider, pid: u32) -> Result<Properties> {
    let vm = provider.attach(pid)?;
    let properties = vm.properties();
    if let Err(e) = vm.detach() {
        warn!(pid, error = %e, "Detach after property read failed");
    }
    properties
}

/// Lists JVMs and returns those scoring above zero, best first.
///
/// Ties are broken by display name.
///
/// This function performs blocking I/O and should be called via `spawn_blocking`.
pub fn rank_candidates(provider: &dyn AttachProvider) -> Vec<VmCandidate> {
    let mut candidates: Vec<VmCandidate> = provider
        .list()
        .into_iter()
        .filter_map(|descriptor| {
            let score = match read_properties(provider, descriptor.pid) {
                Ok(properties) => scoring::score(&descriptor.display_name, &properties),
                Err(e) => {
                    debug!(pid = descriptor.pid, error = %e, "Cannot read JVM properties");
                    0
                }
            };
            debug!(pid = descriptor.pid, score, name = %descriptor.display_name, "Scored JVM");
            (score > 0).then_some(VmCandidate { descriptor, score })
        })
        .collect();

    candidates.sort_by(|a, b| {
        Reverse(a.score)
            .cmp(&Reverse(b.score))
            .then_with(|| a.descriptor.display_name.cmp(&b.descriptor.display_name))
    });
    candidates
}


#[cfg(test)]
mod tests {
    use super::fake::FakeProvider;
    use super::*;

    #[test]
    fn test_candidates_ranked_by_score_then_name() {
        let provider = FakeProvider::default()
            .with_vm(10, "com.acme.Worker", &[])
            .with_vm(11, "b.jar", &[("server.port", "8080")])
            .with_vm(12, "a.jar", &[("server.port", "8081")])
            .with_vm(
                13,
                "org.springframework.boot.loader.JarLauncher",
                &[("spring.application.name", "orders")],
            );

        let ranked = rank_candidates(&provider);
        let order: Vec<u32> = ranked.iter().map(|c| c.descriptor.pid).collect();

        assert_eq!(order, vec![13, 12, 11]);
        assert!(ranked.iter().all(|c| c.score > 0));
        assert_eq!(ranked[1].score, ranked[2].score);
    }

    #[test]
    fn test_unreadable_jvm_scores_zero_and_rest_continue() {
        let mut provider = FakeProvider::default()
            .with_vm(20, "org.springframework.boot.loader.JarLauncher", &[])
            .with_vm(21, "orders.jar", &[("server.port", "8080")]);
        provider.unattachable.push(20);

        let ranked = rank_candidates(&provider);

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].descriptor.pid, 21);
    }

    #[test]
    fn test_every_attach_is_detached() {
        let provider = FakeProvider::default()
            .with_vm(30, "a.jar", &[])
            .with_vm(31, "b.jar", &[]);

        rank_candidates(&provider);

        assert_eq!(
            provider.log(),
            vec!["attach:30", "detach:30", "attach:31", "detach:31"]
        );
    }

    #[test]
    fn test_detach_failure_does_not_mask_properties() {
        let mut provider = FakeProvider::default().with_vm(40, "x", &[("server.port", "1")]);
        provider.failing_detach = true;

        let properties = read_properties(&provider, 40).unwrap();
        assert_eq!(properties.get("server.port").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_no_jvms_yields_no_candidates() {
        assert!(rank_candidates(&FakeProvider::default()).is_empty());
    }
}
