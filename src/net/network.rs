//! Per-session bridge network lifecycle (C3).

use crate::net::subnet::{SubnetAllocator, SubnetLease};
use crate::runtime::ContainerBackend;
use crate::utils::error::{CoreError, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

pub const PROJECT_LABEL_KEY: &str = "type";
pub const PROJECT_LABEL_VALUE: &str = "coderunner-session";

struct NetworkEntry {
    name: String,
    lease: SubnetLease,
}

/// Current count and list of networks, for the `/stats/network` endpoint.
pub struct NetworkStats {
    pub count: usize,
    pub names: Vec<String>,
}

pub struct NetworkManager {
    backend: Arc<dyn ContainerBackend>,
    allocator: Arc<SubnetAllocator>,
    prefix: String,
    networks: DashMap<String, NetworkEntry>,
}

impl NetworkManager {
    pub fn new(backend: Arc<dyn ContainerBackend>, allocator: Arc<SubnetAllocator>, prefix: String) -> Self {
        Self {
            backend,
            allocator,
            prefix,
            networks: DashMap::new(),
        }
    }

    pub fn network_name(&self, session_id: &str) -> String {
        format!("{}-{}", self.prefix, session_id)
    }

    /// Reconcile against networks already carrying the project label,
    /// marking their subnets used in the allocator before the process
    /// starts accepting connections.
    pub async fn reconcile(&self) -> Result<()> {
        let existing = self
            .backend
            .list_labelled_networks(PROJECT_LABEL_KEY, PROJECT_LABEL_VALUE)
            .await?;
        let subnets: Vec<_> = existing.iter().filter_map(|n| n.subnet).collect();
        self.allocator.reconcile_external(&subnets);
        Ok(())
    }

    /// Idempotent per session: if a network already exists, returns its
    /// name without taking a new lease.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn ensure_network(&self, session_id: &str) -> Result<String> {
        let name = self.network_name(session_id);
        if self.networks.contains_key(session_id) {
            return Ok(name);
        }

        let lease = self.allocator.allocate()?;

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL_KEY.to_string(), PROJECT_LABEL_VALUE.to_string());
        labels.insert("session_id".to_string(), session_id.to_string());

        let spec = crate::runtime::NetworkSpec {
            name: name.clone(),
            subnet: lease.subnet,
            labels,
        };

        match self.backend.create_network(spec).await {
            Ok(_id) => {
                self.networks
                    .insert(session_id.to_string(), NetworkEntry { name: name.clone(), lease });
                Ok(name)
            }
            Err(e) => {
                // Release the lease before the error propagates: a failed
                // create must never leak an allocated subnet.
                self.allocator.release(&lease);
                Err(CoreError::NetworkCreateFailed(e.to_string()))
            }
        }
    }

    /// Disconnect remaining containers best-effort (the caller is
    /// responsible for having already released them through the Container
    /// Pool), delete the network, release the lease. Deletion failures are
    /// logged and retried on the next call, never propagated.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn destroy_network(&self, session_id: &str) {
        let Some((_, entry)) = self.networks.remove(session_id) else {
            return;
        };
        if let Err(e) = self.backend.remove_network(&entry.name).await {
            warn!(session_id, network = %entry.name, error = %e, "network removal failed, will retry on next sweep");
            // Re-insert so a later sweep can retry; the lease stays held
            // until the network is actually gone.
            self.networks.insert(session_id.to_string(), entry);
            return;
        }
        self.allocator.release(&entry.lease);
    }

    pub fn stats(&self) -> NetworkStats {
        let names = self
            .networks
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        NetworkStats {
            count: self.networks.len(),
            names,
        }
    }
}
