use crate::backend::remote::{self, DiscoveredBridge};
use crate::backend::{LocalProbeBackend, ProgrammerBackend, RemoteBridgeBackend};
use crate::config::{ForgeConfig, RemoteBridgeConfig};
use crate::core::{BackendKind, BackendStatus, RouterHealthReport, SelectionPolicy};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Picks a working programmer backend. Availability is probed on every call;
/// nothing is cached between calls.
pub struct BackendRouter {
    local: Option<Arc<dyn ProgrammerBackend>>,
    remotes: RwLock<Vec<Arc<dyn ProgrammerBackend>>>,
    policy: SelectionPolicy,
}

impl BackendRouter {
    pub fn new(
        local: Option<Arc<dyn ProgrammerBackend>>,
        remotes: Vec<Arc<dyn ProgrammerBackend>>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            local,
            remotes: RwLock::new(remotes),
            policy,
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        let local: Option<Arc<dyn ProgrammerBackend>> = config
            .local_probe
            .enabled
            .then(|| Arc::new(LocalProbeBackend::new(config.local_probe.clone())) as Arc<dyn ProgrammerBackend>);
        let remotes = config
            .remote_bridges
            .iter()
            .cloned()
            .map(|bridge| Arc::new(RemoteBridgeBackend::new(bridge)) as Arc<dyn ProgrammerBackend>)
            .collect();
        Self::new(local, remotes, config.selection)
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.read().len()
    }

    fn remotes_snapshot(&self) -> Vec<Arc<dyn ProgrammerBackend>> {
        self.remotes.read().clone()
    }

    /// Every configured backend in selection order for `policy`.
    fn candidates(&self, policy: SelectionPolicy) -> Vec<Arc<dyn ProgrammerBackend>> {
        let local = self.local.iter().cloned();
        let remotes = self.remotes_snapshot();
        match policy {
            SelectionPolicy::PreferLocal => local.chain(remotes).collect(),
            SelectionPolicy::PreferRemote => remotes.into_iter().chain(local).collect(),
            SelectionPolicy::LocalOnly => local.collect(),
            SelectionPolicy::RemoteOnly => remotes,
        }
    }

    /// First backend whose availability check passes right now, or `None`.
    pub async fn select_best(&self, policy: Option<SelectionPolicy>) -> Option<Arc<dyn ProgrammerBackend>> {
        let policy = policy.unwrap_or(self.policy);
        for backend in self.candidates(policy) {
            if backend.is_available().await {
                tracing::info!("Selected programmer {} ({})", backend.name(), backend.endpoint());
                return Some(backend);
            }
            tracing::warn!("Programmer {} unavailable, trying next", backend.name());
        }
        tracing::warn!("No programmer backend available under {:?}", policy);
        None
    }

    pub async fn select_by_kind(&self, kind: BackendKind) -> Option<Arc<dyn ProgrammerBackend>> {
        let policy = match kind {
            BackendKind::Local => SelectionPolicy::LocalOnly,
            BackendKind::Remote => SelectionPolicy::RemoteOnly,
        };
        self.select_best(Some(policy)).await
    }

    /// Status of every configured backend, independent of selection.
    pub async fn list_all(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for backend in self.candidates(SelectionPolicy::PreferLocal) {
            let available = backend.is_available().await;
            let target = if available {
                match backend.detect_target().await {
                    Ok(target) => Some(target),
                    Err(e) => {
                        tracing::warn!("Target detection on {} failed: {}", backend.name(), e);
                        None
                    }
                }
            } else {
                None
            };
            statuses.push(BackendStatus {
                name: backend.name().to_string(),
                kind: backend.kind(),
                endpoint: backend.endpoint(),
                available,
                version: backend.version(),
                target,
            });
        }
        statuses
    }

    pub async fn health_check(&self) -> RouterHealthReport {
        let statuses = self.list_all().await;
        let local_available = statuses
            .iter()
            .any(|s| s.kind == BackendKind::Local && s.available);
        let remote_available = statuses
            .iter()
            .filter(|s| s.kind == BackendKind::Remote && s.available)
            .count();
        let targets_detected = statuses
            .iter()
            .filter(|s| s.target.as_ref().is_some_and(|t| t.connected))
            .count();

        let recommendation = if local_available {
            "Use the local debug probe".to_string()
        } else if remote_available > 0 {
            format!("Use a remote bridge ({} available)", remote_available)
        } else if self.remote_count() == 0 {
            "No programmer available: attach a debug probe or configure a remote bridge".to_string()
        } else {
            "No programmer available: check the debug probe connection and that the remote bridges are reachable"
                .to_string()
        };

        RouterHealthReport {
            local_available,
            remote_configured: self.remote_count(),
            remote_available,
            targets_detected,
            recommendation,
        }
    }

    /// Register a bridge at runtime. Returns false if one with the same
    /// endpoint is already registered.
    pub fn add_remote(&self, backend: Arc<dyn ProgrammerBackend>) -> bool {
        let mut remotes = self.remotes.write();
        if remotes.iter().any(|r| r.endpoint() == backend.endpoint()) {
            return false;
        }
        tracing::info!("Registered remote programmer {}", backend.endpoint());
        remotes.push(backend);
        true
    }

    /// Look for bridges among `hosts` on `template.port` and register the
    /// ones not already known, each a copy of `template` with its host set.
    /// Returns every bridge found and the endpoints that were new.
    pub async fn discover_remotes(
        &self,
        hosts: &[String],
        template: &RemoteBridgeConfig,
        timeout: Duration,
    ) -> (Vec<DiscoveredBridge>, Vec<String>) {
        let found = remote::discover(hosts, template.port, &template.banner_prefix, timeout).await;
        let mut added = Vec::new();
        for bridge in &found {
            let config = RemoteBridgeConfig {
                host: bridge.host.clone(),
                ..template.clone()
            };
            let endpoint = config.endpoint();
            if self.add_remote(Arc::new(RemoteBridgeBackend::new(config))) {
                added.push(endpoint);
            }
        }
        (found, added)
    }

    /// Drop every bridge whose endpoint or host matches. Returns how many went.
    pub fn remove_remote(&self, endpoint: &str) -> usize {
        let mut remotes = self.remotes.write();
        let before = remotes.len();
        remotes.retain(|r| {
            let ep = r.endpoint();
            ep != endpoint && ep.rsplit_once(':').map(|(host, _)| host) != Some(endpoint)
        });
        before - remotes.len()
    }
}
