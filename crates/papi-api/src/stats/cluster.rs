//! Live cluster stats
//!
//! A background task polls the scheduler every 30 seconds, projects the
//! node list into capacity/usage per VO namespace, and atomically swaps the
//! latest snapshot. Readers always get a consistent snapshot; a failed poll
//! keeps the last good one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use papi_common::config::MainConfig;
use papi_common::Result;
use papi_nomad::deployments::{reallocation_count, select_allocation};
use papi_nomad::nodes::{project_node, NodeStatus, NodeSummary};
use papi_nomad::NomadClient;

/// How often the poller refreshes the snapshot
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate totals for one resource dimension set
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceTotals {
    /// CPU cores available
    pub cpu_total: u64,
    /// CPU cores in use
    pub cpu_used: u64,
    /// GPUs available
    pub gpu_total: u64,
    /// GPUs in use
    pub gpu_used: u64,
    /// RAM available in MB
    pub ram_total: u64,
    /// RAM in use in MB
    pub ram_used: u64,
    /// Disk available in MB
    pub disk_total: u64,
    /// Disk in use in MB
    pub disk_used: u64,
}

/// Per-GPU-model capacity/usage
#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuModelStats {
    /// GPUs of this model in the cluster
    pub gpu_total: u64,
    /// GPUs of this model in use
    pub gpu_used: u64,
}

/// Stats of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    /// Node name
    pub name: String,
    /// Projected status (ready, ineligible, down, failing)
    pub status: &'static str,
    /// Pool tags
    pub tags: Vec<String>,
    /// Datacenter
    pub datacenter: String,
    /// Namespaces the node serves
    pub namespaces: String,
    /// CPU cores available
    pub cpu_total: u64,
    /// CPU cores in use
    pub cpu_used: u64,
    /// RAM available in MB
    pub ram_total: u64,
    /// RAM in use in MB
    pub ram_used: u64,
    /// Disk available in MB
    pub disk_total: u64,
    /// Disk in use in MB
    pub disk_used: u64,
    /// GPUs available
    pub gpu_total: u64,
    /// GPUs in use
    pub gpu_used: u64,
    /// Reallocations observed across the node's jobs in this window
    pub reallocs: u64,
}

/// The full cluster snapshot served under `/v1/stats/cluster`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    /// Capacity and usage summed over ready, eligible nodes
    pub cluster: ResourceTotals,
    /// Capacity parked on nodes that cannot take placements
    pub ineligible: ResourceTotals,
    /// Per-GPU-model breakdown (ready nodes only)
    pub gpu_per_model: BTreeMap<String, GpuModelStats>,
    /// Per-node detail
    pub nodes: BTreeMap<String, NodeStats>,
}

/// Usage observed for one running job
#[derive(Debug, Clone, Default)]
pub struct AllocUsage {
    /// Node hosting the proper allocation
    pub node_id: String,
    /// Reserved CPU cores of the main task
    pub cpu_cores: u64,
    /// Memory of the main task in MB
    pub ram_mb: u64,
    /// GPUs of the main task
    pub gpu_num: u64,
    /// GPU model, when GPUs are allocated
    pub gpu_model: Option<String>,
    /// Reallocations of this job inside the observation window
    pub reallocs: u64,
}

/// Combine node projections and per-job usage into the snapshot.
///
/// Only ready, eligible nodes count toward cluster capacity; everything
/// else accumulates under `ineligible` so operators can tell parked
/// capacity from missing capacity.
pub fn aggregate(nodes: &[NodeSummary], usage: &[AllocUsage]) -> ClusterStats {
    let mut stats = ClusterStats::default();

    for node in nodes {
        let mut entry = NodeStats {
            name: node.name.clone(),
            status: node.status.as_str(),
            tags: node.tags.clone(),
            datacenter: node.datacenter.clone(),
            namespaces: node.namespaces.clone(),
            cpu_total: node.cpu_total,
            cpu_used: 0,
            ram_total: node.ram_total,
            ram_used: 0,
            disk_total: node.disk_total,
            disk_used: node.disk_used,
            gpu_total: node.gpu_total(),
            gpu_used: 0,
            reallocs: 0,
        };

        for use_ in usage.iter().filter(|u| u.node_id == node.id) {
            entry.cpu_used += use_.cpu_cores;
            entry.ram_used += use_.ram_mb;
            entry.gpu_used += use_.gpu_num;
            entry.reallocs += use_.reallocs;
        }

        let totals = if node.status == NodeStatus::Ready {
            for (model, count) in &node.gpu_per_model {
                let slot = stats.gpu_per_model.entry(model.clone()).or_default();
                slot.gpu_total += count;
            }
            for use_ in usage.iter().filter(|u| u.node_id == node.id) {
                if let Some(model) = &use_.gpu_model {
                    let slot = stats.gpu_per_model.entry(model.clone()).or_default();
                    slot.gpu_used += use_.gpu_num;
                }
            }
            &mut stats.cluster
        } else {
            &mut stats.ineligible
        };

        totals.cpu_total += entry.cpu_total;
        totals.cpu_used += entry.cpu_used;
        totals.ram_total += entry.ram_total;
        totals.ram_used += entry.ram_used;
        totals.disk_total += entry.disk_total;
        totals.disk_used += entry.disk_used;
        totals.gpu_total += entry.gpu_total;
        totals.gpu_used += entry.gpu_used;

        stats.nodes.insert(node.id.clone(), entry);
    }

    stats
}

/// Collect one snapshot from the scheduler
pub async fn poll_once(nomad: &NomadClient, config: &MainConfig) -> Result<ClusterStats> {
    let stubs = nomad.list_nodes().await?;
    let mut nodes = Vec::with_capacity(stubs.len());
    for stub in &stubs {
        // The list endpoint lacks attributes; fetch each node in full
        let node = nomad.get_node(&stub.id).await?;
        nodes.push(project_node(&node));
    }

    let mut usage = Vec::new();
    for namespace in config.nomad.namespaces.values() {
        let jobs = nomad.list_jobs(namespace, "Status == \"running\"").await?;
        for job in jobs {
            let allocs = nomad.job_allocations(&job.id, namespace).await?;
            let Some(selected) = select_allocation(&allocs) else {
                continue;
            };
            let alloc = nomad.get_allocation(&selected.id).await?;
            let Some(allocated) = &alloc.allocated_resources else {
                continue;
            };
            let Some(main) = allocated.tasks.get("main") else {
                continue;
            };
            let gpu = main
                .devices
                .as_ref()
                .and_then(|devices| devices.iter().find(|d| d.device_type == "gpu"));
            usage.push(AllocUsage {
                node_id: alloc.node_id.clone(),
                cpu_cores: main
                    .cpu
                    .reserved_cores
                    .as_ref()
                    .map(|cores| cores.len() as u64)
                    .unwrap_or(0),
                ram_mb: main.memory.memory_mb,
                gpu_num: gpu.map(|g| g.device_ids.len() as u64).unwrap_or(0),
                gpu_model: gpu.map(|g| g.name.clone()),
                reallocs: reallocation_count(&allocs),
            });
        }
    }

    Ok(aggregate(&nodes, &usage))
}

/// Holder of the latest snapshot, swapped atomically on each poll
#[derive(Default)]
pub struct StatsHolder {
    snapshot: RwLock<Arc<ClusterStats>>,
}

impl StatsHolder {
    /// Empty holder (before the first poll completes)
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The latest snapshot
    pub async fn get(&self) -> Arc<ClusterStats> {
        self.snapshot.read().await.clone()
    }

    /// Swap in a new snapshot
    pub async fn set(&self, stats: ClusterStats) {
        *self.snapshot.write().await = Arc::new(stats);
    }
}

/// Background poll loop. A failed poll logs and keeps the last snapshot.
pub async fn run_poller(
    holder: Arc<StatsHolder>,
    nomad: Arc<NomadClient>,
    config: Arc<MainConfig>,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match poll_once(&nomad, &config).await {
            Ok(stats) => {
                debug!(nodes = stats.nodes.len(), "cluster stats refreshed");
                holder.set(stats).await;
            }
            Err(err) => warn!(error = %err, "cluster stats poll failed, keeping last snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, status: NodeStatus, cpu: u64, gpus: &[(&str, u64)]) -> NodeSummary {
        NodeSummary {
            id: id.to_string(),
            name: format!("name-{id}"),
            status,
            datacenter: "dc1".to_string(),
            namespaces: "ai4eosc".to_string(),
            tags: vec!["gpu".to_string()],
            cpu_total: cpu,
            ram_total: 64_000,
            disk_total: 500_000,
            disk_used: 100_000,
            gpu_per_model: gpus.iter().map(|(m, c)| (m.to_string(), *c)).collect(),
        }
    }

    #[test]
    fn test_capacity_counts_only_ready_nodes() {
        let nodes = vec![
            node("n1", NodeStatus::Ready, 32, &[("T4", 2)]),
            node("n2", NodeStatus::Ineligible, 64, &[("A100", 4)]),
            node("n3", NodeStatus::Down, 16, &[]),
        ];
        let stats = aggregate(&nodes, &[]);

        assert_eq!(stats.cluster.cpu_total, 32);
        assert_eq!(stats.cluster.gpu_total, 2);
        // Parked capacity is visible, separately
        assert_eq!(stats.ineligible.cpu_total, 80);
        assert_eq!(stats.ineligible.gpu_total, 4);
        // Ineligible GPUs do not show in the per-model breakdown
        assert!(!stats.gpu_per_model.contains_key("A100"));
        assert_eq!(stats.gpu_per_model["T4"].gpu_total, 2);
    }

    /// Capacity never exceeds the total of all node capacities
    #[test]
    fn test_capacity_bounded_by_total() {
        let nodes = vec![
            node("n1", NodeStatus::Ready, 32, &[("T4", 2)]),
            node("n2", NodeStatus::Ready, 64, &[]),
            node("n3", NodeStatus::Failing, 16, &[]),
        ];
        let stats = aggregate(&nodes, &[]);
        let all_cpu: u64 = nodes.iter().map(|n| n.cpu_total).sum();
        assert!(stats.cluster.cpu_total + stats.ineligible.cpu_total <= all_cpu);
        assert_eq!(stats.cluster.cpu_total, 96);
    }

    #[test]
    fn test_usage_lands_on_the_right_node() {
        let nodes = vec![
            node("n1", NodeStatus::Ready, 32, &[("T4", 2)]),
            node("n2", NodeStatus::Ready, 32, &[]),
        ];
        let usage = vec![
            AllocUsage {
                node_id: "n1".to_string(),
                cpu_cores: 4,
                ram_mb: 8_000,
                gpu_num: 1,
                gpu_model: Some("T4".to_string()),
                reallocs: 2,
            },
            AllocUsage {
                node_id: "n1".to_string(),
                cpu_cores: 2,
                ram_mb: 4_000,
                gpu_num: 0,
                gpu_model: None,
                reallocs: 0,
            },
        ];
        let stats = aggregate(&nodes, &usage);

        let n1 = &stats.nodes["n1"];
        assert_eq!(n1.cpu_used, 6);
        assert_eq!(n1.ram_used, 12_000);
        assert_eq!(n1.gpu_used, 1);
        assert_eq!(n1.reallocs, 2);

        let n2 = &stats.nodes["n2"];
        assert_eq!(n2.cpu_used, 0);

        assert_eq!(stats.cluster.cpu_used, 6);
        assert_eq!(stats.gpu_per_model["T4"].gpu_used, 1);
    }

    #[tokio::test]
    async fn test_holder_swap() {
        let holder = StatsHolder::new();
        assert_eq!(holder.get().await.nodes.len(), 0);

        let stats = aggregate(&[node("n1", NodeStatus::Ready, 8, &[])], &[]);
        holder.set(stats).await;
        assert_eq!(holder.get().await.nodes.len(), 1);
        assert_eq!(holder.get().await.cluster.cpu_total, 8);
    }
}
