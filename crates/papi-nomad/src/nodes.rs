//! Node projection for cluster stats and GPU-model discovery

use std::collections::BTreeMap;

use serde::Serialize;

use papi_common::Result;

use crate::client::NomadClient;
use crate::types::Node;

/// User-facing node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Ready and eligible for placements; counts toward capacity
    Ready,
    /// Drained or marked ineligible by operators
    Ineligible,
    /// Lost connection to the cluster (transient network cut or dead node)
    Down,
    /// Initializing or otherwise unhealthy
    Failing,
}

impl NodeStatus {
    /// Stable lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Ineligible => "ineligible",
            NodeStatus::Down => "down",
            NodeStatus::Failing => "failing",
        }
    }
}

/// Capacity projection of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    /// Node identifier
    pub id: String,
    /// Node name
    pub name: String,
    /// Projected status
    pub status: NodeStatus,
    /// Datacenter
    pub datacenter: String,
    /// Scheduler namespaces this node serves (metadata affinity)
    pub namespaces: String,
    /// Pool tags (e.g. "tryme", "cpu", "gpu")
    pub tags: Vec<String>,
    /// CPU cores
    pub cpu_total: u64,
    /// RAM in MB
    pub ram_total: u64,
    /// Disk in MB
    pub disk_total: u64,
    /// Disk already used in MB
    pub disk_used: u64,
    /// GPU count per model
    pub gpu_per_model: BTreeMap<String, u64>,
}

impl NodeSummary {
    /// Total GPUs across models
    pub fn gpu_total(&self) -> u64 {
        self.gpu_per_model.values().sum()
    }

    /// Whether this node's capacity counts for a namespace
    pub fn serves_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }
}

/// Project a node into its stats summary
pub fn project_node(node: &Node) -> NodeSummary {
    let status = match (node.status.as_str(), node.scheduling_eligibility.as_str()) {
        ("down", _) | ("disconnected", _) => NodeStatus::Down,
        (_, eligibility) if eligibility != "eligible" => NodeStatus::Ineligible,
        ("ready", _) => NodeStatus::Ready,
        _ => NodeStatus::Failing,
    };

    let mut gpu_per_model = BTreeMap::new();
    if let Some(resources) = &node.node_resources {
        if let Some(devices) = &resources.devices {
            for device in devices {
                if device.device_type == "gpu" {
                    *gpu_per_model.entry(device.name.clone()).or_insert(0) +=
                        device.instances.len() as u64;
                }
            }
        }
    }

    let disk_total = node.int_attribute("unique.storage.bytestotal") / (1 << 20);
    let disk_free = node.int_attribute("unique.storage.bytesfree") / (1 << 20);

    NodeSummary {
        id: node.id.clone(),
        name: node.name.clone(),
        status,
        datacenter: node.datacenter.clone(),
        namespaces: node.meta_value("namespace").to_string(),
        tags: node
            .meta_value("tags")
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        cpu_total: node.int_attribute("cpu.numcores"),
        ram_total: node.int_attribute("memory.totalbytes") / (1 << 20),
        disk_total,
        disk_used: disk_total.saturating_sub(disk_free),
        gpu_per_model,
    }
}

/// GPU models available to a namespace, read from eligible nodes.
///
/// Feeds the `gpu_type` options of the config templates so users only pick
/// models the cluster can actually serve.
pub async fn gpu_models(client: &NomadClient, namespace: &str) -> Result<Vec<String>> {
    let nodes = client.list_nodes().await?;
    let mut models = std::collections::BTreeSet::new();
    for stub in &nodes {
        // The list endpoint lacks metadata; fetch each node for its
        // namespace affinity
        let node = client.get_node(&stub.id).await?;
        if !node.meta_value("namespace").contains(namespace) {
            continue;
        }
        if node.scheduling_eligibility != "eligible" {
            continue;
        }
        let summary = project_node(&node);
        models.extend(summary.gpu_per_model.into_keys());
    }
    Ok(models.into_iter().collect())
}
