//! Wire types for the scheduler HTTP API
//!
//! Only the fields PAPI reads or mutates are typed; everything else is kept
//! in a flattened `extra` map so a parse → mutate → register round trip
//! preserves the rest of the job document (restart policies, sidecar
//! templates, constraints) byte-for-byte in meaning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A job as returned by the list endpoint (trimmed stub)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobStub {
    /// Job identifier (the deployment UUID)
    #[serde(rename = "ID")]
    pub id: String,
    /// Job name (kind-prefixed)
    #[serde(rename = "Name")]
    pub name: String,
    /// Scheduler-side job status (pending, running, dead)
    #[serde(rename = "Status")]
    pub status: String,
    /// Submit time in nanoseconds since the epoch
    #[serde(rename = "SubmitTime")]
    pub submit_time: i64,
    /// Job metadata (owner, title, ...)
    #[serde(rename = "Meta")]
    pub meta: Option<HashMap<String, String>>,
}

/// A full job document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Job {
    /// Job identifier
    #[serde(rename = "ID")]
    pub id: String,
    /// Job name
    #[serde(rename = "Name")]
    pub name: String,
    /// Job type (service, batch)
    #[serde(rename = "Type")]
    pub job_type: String,
    /// Scheduler-side job status
    #[serde(rename = "Status", skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Scheduler namespace
    #[serde(rename = "Namespace")]
    pub namespace: String,
    /// Priority band
    #[serde(rename = "Priority")]
    pub priority: u32,
    /// Job metadata (owner, title, description, ...)
    #[serde(rename = "Meta")]
    pub meta: Option<HashMap<String, String>>,
    /// Submit time in nanoseconds since the epoch
    #[serde(rename = "SubmitTime")]
    pub submit_time: i64,
    /// Task groups
    #[serde(rename = "TaskGroups")]
    pub task_groups: Vec<TaskGroup>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Owner subject from the job metadata
    pub fn owner(&self) -> Option<&str> {
        self.meta.as_ref()?.get("owner").map(String::as_str)
    }

    /// A metadata value
    pub fn meta_value(&self, key: &str) -> &str {
        self.meta
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The main task of the first task group, if present
    pub fn main_task(&self) -> Option<&Task> {
        self.task_groups
            .first()?
            .tasks
            .iter()
            .find(|t| t.name == "main")
    }

    /// Mutable access to the main task
    pub fn main_task_mut(&mut self) -> Option<&mut Task> {
        self.task_groups
            .first_mut()?
            .tasks
            .iter_mut()
            .find(|t| t.name == "main")
    }
}

/// A task group
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskGroup {
    /// Group name
    #[serde(rename = "Name")]
    pub name: String,
    /// Tasks in the group
    #[serde(rename = "Tasks")]
    pub tasks: Vec<Task>,
    /// Services exposed by the group
    #[serde(rename = "Services")]
    pub services: Vec<Service>,
    /// Ephemeral disk request
    #[serde(rename = "EphemeralDisk", skip_serializing_if = "Option::is_none")]
    pub ephemeral_disk: Option<EphemeralDisk>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One task
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Task {
    /// Task name (`main` is the user container)
    #[serde(rename = "Name")]
    pub name: String,
    /// Driver configuration (image, command, args for docker tasks)
    #[serde(rename = "Config", skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// Environment variables
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Resource request
    #[serde(rename = "Resources", skip_serializing_if = "Option::is_none")]
    pub resources: Option<TaskResources>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Set one environment variable
    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
    }
}

/// Docker driver configuration (lowercase keys on the wire)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Container image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resource request of a task
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskResources {
    /// Reserved CPU cores
    #[serde(rename = "Cores")]
    pub cores: u64,
    /// CPU shares in MHz (when not using reserved cores)
    #[serde(rename = "CPU")]
    pub cpu: u64,
    /// Memory in MB
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u64,
    /// Device requests (GPUs)
    #[serde(rename = "Devices")]
    pub devices: Option<Vec<DeviceRequest>>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One requested device
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceRequest {
    /// Device name (e.g. "gpu" or "nvidia/gpu")
    #[serde(rename = "Name")]
    pub name: String,
    /// Requested count
    #[serde(rename = "Count")]
    pub count: u64,
    /// Placement constraints (e.g. GPU model)
    #[serde(rename = "Constraints")]
    pub constraints: Option<Value>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A service exposed by a task group
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Service {
    /// Service name
    #[serde(rename = "Name")]
    pub name: String,
    /// Port label the service binds (the endpoint role)
    #[serde(rename = "PortLabel")]
    pub port_label: String,
    /// Routing tags (the load-balancer `Host(...)` rules live here)
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ephemeral disk request of a task group
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EphemeralDisk {
    /// Size in MB
    #[serde(rename = "SizeMB")]
    pub size_mb: u64,
    /// Everything else, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An allocation (trimmed to what status derivation needs)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Allocation {
    /// Allocation identifier
    #[serde(rename = "ID")]
    pub id: String,
    /// Job this allocation belongs to
    #[serde(rename = "JobID")]
    pub job_id: String,
    /// Node hosting the allocation
    #[serde(rename = "NodeID")]
    pub node_id: String,
    /// Client-side status (pending, running, complete, failed, unknown, lost)
    #[serde(rename = "ClientStatus")]
    pub client_status: String,
    /// Creation time in nanoseconds since the epoch
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    /// Per-task states
    #[serde(rename = "TaskStates")]
    pub task_states: Option<HashMap<String, TaskState>>,
    /// Allocated resources (present on the single-allocation endpoint)
    #[serde(rename = "AllocatedResources")]
    pub allocated_resources: Option<AllocatedResources>,
}

/// State of one task inside an allocation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskState {
    /// Task state (pending, running, dead)
    #[serde(rename = "State")]
    pub state: String,
    /// Whether the task failed
    #[serde(rename = "Failed")]
    pub failed: bool,
    /// Task events, most recent first
    #[serde(rename = "Events")]
    pub events: Vec<TaskEvent>,
}

/// One task event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskEvent {
    /// Event message
    #[serde(rename = "Message")]
    pub message: String,
    /// Human-readable display message
    #[serde(rename = "DisplayMessage")]
    pub display_message: String,
}

impl TaskEvent {
    /// The most useful message of this event
    pub fn best_message(&self) -> &str {
        if !self.message.is_empty() {
            &self.message
        } else {
            &self.display_message
        }
    }
}

/// Resources actually allocated
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedResources {
    /// Per-task allocations
    #[serde(rename = "Tasks")]
    pub tasks: HashMap<String, AllocatedTaskResources>,
    /// Group-shared allocations
    #[serde(rename = "Shared")]
    pub shared: AllocatedShared,
}

/// Allocated resources of one task
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedTaskResources {
    /// CPU allocation
    #[serde(rename = "Cpu")]
    pub cpu: AllocatedCpu,
    /// Memory allocation
    #[serde(rename = "Memory")]
    pub memory: AllocatedMemory,
    /// Device allocations
    #[serde(rename = "Devices")]
    pub devices: Option<Vec<AllocatedDevice>>,
}

/// Allocated CPU
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedCpu {
    /// CPU shares in MHz
    #[serde(rename = "CpuShares")]
    pub cpu_shares: u64,
    /// Reserved core ids
    #[serde(rename = "ReservedCores")]
    pub reserved_cores: Option<Vec<u64>>,
}

/// Allocated memory
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedMemory {
    /// Memory in MB
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u64,
}

/// One allocated device
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedDevice {
    /// Device type (gpu, fpga, ...)
    #[serde(rename = "Type")]
    pub device_type: String,
    /// Device model name
    #[serde(rename = "Name")]
    pub name: String,
    /// Allocated instance ids
    #[serde(rename = "DeviceIDs")]
    pub device_ids: Vec<String>,
}

/// Group-shared allocated resources
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatedShared {
    /// Disk in MB
    #[serde(rename = "DiskMB")]
    pub disk_mb: u64,
}

/// An evaluation of a job
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Evaluation {
    /// Evaluation identifier
    #[serde(rename = "ID")]
    pub id: String,
    /// Evaluation status
    #[serde(rename = "Status")]
    pub status: String,
    /// Placement failures per task group, if any
    #[serde(rename = "FailedTGAllocs")]
    pub failed_tg_allocs: Option<Value>,
}

/// A cluster node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    /// Node identifier
    #[serde(rename = "ID")]
    pub id: String,
    /// Node name
    #[serde(rename = "Name")]
    pub name: String,
    /// Node status (ready, down, initializing)
    #[serde(rename = "Status")]
    pub status: String,
    /// Scheduling eligibility (eligible, ineligible)
    #[serde(rename = "SchedulingEligibility")]
    pub scheduling_eligibility: String,
    /// Datacenter the node belongs to
    #[serde(rename = "Datacenter")]
    pub datacenter: String,
    /// Node attributes (cpu/memory/storage totals live here)
    #[serde(rename = "Attributes")]
    pub attributes: HashMap<String, String>,
    /// Node metadata (namespace affinity, pool tags, domain)
    #[serde(rename = "Meta")]
    pub meta: Option<HashMap<String, String>>,
    /// Node device inventory
    #[serde(rename = "NodeResources")]
    pub node_resources: Option<NodeResources>,
}

impl Node {
    /// An attribute parsed as integer, 0 when missing or malformed
    pub fn int_attribute(&self, key: &str) -> u64 {
        self.attributes
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// A metadata value
    pub fn meta_value(&self, key: &str) -> &str {
        self.meta
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Device inventory of a node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeResources {
    /// Devices present on the node
    #[serde(rename = "Devices")]
    pub devices: Option<Vec<NodeDevice>>,
}

/// One device group on a node
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeDevice {
    /// Device type (gpu, ...)
    #[serde(rename = "Type")]
    pub device_type: String,
    /// Device model name
    #[serde(rename = "Name")]
    pub name: String,
    /// Physical instances
    #[serde(rename = "Instances")]
    pub instances: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_roundtrip_preserves_unknown_fields() {
        let raw = json!({
            "ID": "abc",
            "Name": "module-abc",
            "Type": "service",
            "Namespace": "ai4eosc",
            "Priority": 50,
            "SubmitTime": 1700000000000000000i64,
            "Meta": {"owner": "alice@x"},
            "TaskGroups": [{
                "Name": "usergroup",
                "Tasks": [{
                    "Name": "main",
                    "Config": {"image": "allowed/demo:latest", "ports": ["api"]},
                    "RestartPolicy": {"Attempts": 0}
                }],
                "Services": [],
                "ReschedulePolicy": {"Attempts": 0}
            }],
            "Datacenters": ["dc1"]
        });
        let job: Job = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(job.owner(), Some("alice@x"));
        assert_eq!(job.main_task().unwrap().config.as_ref().unwrap().image.as_deref(),
            Some("allowed/demo:latest"));

        let back = serde_json::to_value(&job).unwrap();
        // Untyped fields survive the round trip
        assert_eq!(back["Datacenters"], json!(["dc1"]));
        assert_eq!(back["TaskGroups"][0]["ReschedulePolicy"]["Attempts"], json!(0));
        assert_eq!(back["TaskGroups"][0]["Tasks"][0]["RestartPolicy"]["Attempts"], json!(0));
        assert_eq!(back["TaskGroups"][0]["Tasks"][0]["Config"]["ports"], json!(["api"]));
    }

    #[test]
    fn test_main_task_lookup() {
        let job: Job = serde_json::from_value(json!({
            "TaskGroups": [{
                "Tasks": [{"Name": "storage_mount"}, {"Name": "main"}]
            }]
        }))
        .unwrap();
        assert_eq!(job.main_task().unwrap().name, "main");
    }

    #[test]
    fn test_task_set_env_creates_map() {
        let mut task = Task::default();
        assert!(task.env.is_none());
        task.set_env("DOI", "10.1234/abc");
        assert_eq!(task.env.unwrap().get("DOI").unwrap(), "10.1234/abc");
    }

    #[test]
    fn test_task_event_best_message() {
        let event = TaskEvent {
            message: String::new(),
            display_message: "Task started by client".to_string(),
        };
        assert_eq!(event.best_message(), "Task started by client");

        let event = TaskEvent {
            message: "exit code 1".to_string(),
            display_message: "whatever".to_string(),
        };
        assert_eq!(event.best_message(), "exit code 1");
    }

    #[test]
    fn test_node_attribute_parsing() {
        let node: Node = serde_json::from_value(json!({
            "ID": "n1",
            "Attributes": {"cpu.numcores": "32", "memory.totalbytes": "junk"}
        }))
        .unwrap();
        assert_eq!(node.int_attribute("cpu.numcores"), 32);
        assert_eq!(node.int_attribute("memory.totalbytes"), 0);
        assert_eq!(node.int_attribute("missing"), 0);
    }
}
