use super::Bridge;
use crate::domain::{ListFilter, Service};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

static SERVICE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?):([a-zA-Z0-9][a-zA-Z0-9_.-]+):[0-9]+(?::udp)?$")
        .expect("service id pattern is valid")
});

/// Splits a default service id `<hostname>:<container>:<port>[:udp]` into
/// its hostname and container name.
pub fn parse_service_id(id: &str) -> Option<(&str, &str)> {
    let captures = SERVICE_ID_PATTERN.captures(id)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

/// What one sync pass did.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Services re-registered for containers that were already tracked.
    pub reregistered: usize,
    /// Services registered for containers seen for the first time.
    pub added: usize,
    /// Ids of dangling registry entries that were deregistered.
    pub dangling: Vec<String>,
    stale: Vec<JoinHandle<()>>,
}

impl SyncReport {
    /// Number of stale containers handed off for removal.
    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    /// Blocks until every stale-container removal has finished.
    pub fn wait_for_stale(self) {
        for handle in self.stale {
            if handle.join().is_err() {
                warn!("stale container removal panicked");
            }
        }
    }
}

impl Bridge {
    /// Reconverges tracked state with the running containers and, with
    /// cleanup enabled, with the registry's own listing.
    ///
    /// Stale containers are removed on background threads once this pass
    /// releases the state lock.
    pub fn sync(self: &Arc<Self>, quiet: bool) -> SyncReport {
        let mut report = SyncReport::default();
        let mut state = self.lock_state();

        let containers = match self.runtime.list_containers(ListFilter::Running) {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "error listing containers, skipping sync");
                return report;
            }
        };

        info!(container_count = containers.len(), "syncing services");

        for listing in &containers {
            if let Some(services) = state.services.get(&listing.id) {
                for service in services {
                    match self.registry.register(service) {
                        Ok(()) => report.reregistered += 1,
                        Err(e) => error!(service_id = %service.id, error = %e, "sync register failed"),
                    }
                }
                continue;
            }
            report.added += self.add_locked(&mut state, &listing.id, quiet);
        }

        if !self.config.cleanup {
            return report;
        }

        info!("listing non-exited containers");
        let live = match self.runtime.list_containers(ListFilter::NonExited) {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "error listing non-exited containers, skipping cleanup");
                return report;
            }
        };
        let live: HashSet<&str> = live.iter().map(|listing| listing.id.as_str()).collect();

        let mut stale: Vec<String> = state
            .services
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort_unstable();
        for container_id in stale {
            info!(container_id = %container_id, "stale: removing services of missing container");
            let bridge = Arc::clone(self);
            report
                .stale
                .push(thread::spawn(move || bridge.remove_on_exit(&container_id)));
        }

        info!("cleaning up dangling services");
        let remote = match self.registry.services() {
            Ok(remote) => remote,
            Err(e) => {
                error!(error = %e, "cleanup failed");
                return report;
            }
        };

        for external in remote {
            if !self.is_dangling(&external, state.services.values().flatten()) {
                continue;
            }
            info!(service_id = %external.id, "dangling service");
            match self.registry.deregister(&external) {
                Ok(()) => {
                    info!(service_id = %external.id, "service removed");
                    report.dangling.push(external.id);
                }
                Err(e) => error!(service_id = %external.id, error = %e, "deregister failed"),
            }
        }

        report
    }

    /// A remote entry is dangling when its id encodes this host and no tracked
    /// service has the same name and container.
    fn is_dangling<'a>(
        &self,
        external: &Service,
        mut tracked: impl Iterator<Item = &'a Service>,
    ) -> bool {
        let Some((hostname, container_name)) = parse_service_id(&external.id) else {
            return false;
        };
        if hostname != self.config.hostname {
            return false;
        }
        !tracked.any(|service| {
            service.name == external.name && service.origin.container_name == container_name
        })
    }
}
