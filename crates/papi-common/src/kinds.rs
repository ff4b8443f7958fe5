//! Workload kinds
//!
//! A kind binds a user-config schema, a job template, default resource caps
//! and a namespace mapping. The scheduler job name is prefixed with the kind
//! so deployments of different kinds can share a namespace and still be
//! listed independently.

use serde::{Deserialize, Serialize};

/// Category of deployable job shape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    /// Long-lived model development/serving environment
    Module,
    /// Platform tool (federated-learning server, annotation tool, ...)
    Tool,
    /// Short-lived anonymous demo
    TryMe,
    /// Batch inference run
    BatchInference,
    /// Container commit of a running deployment
    Snapshot,
    /// Serverless service on the function platform
    FunctionService,
}

impl WorkloadKind {
    /// Kinds that are deployed as scheduler jobs through the deployment
    /// controller (`/v1/deployments/{kind}` routes)
    pub const DEPLOYABLE: [WorkloadKind; 3] = [
        WorkloadKind::Module,
        WorkloadKind::Tool,
        WorkloadKind::BatchInference,
    ];

    /// Stable identifier used in routes and config keys
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Module => "module",
            WorkloadKind::Tool => "tool",
            WorkloadKind::TryMe => "try-me",
            WorkloadKind::BatchInference => "batch-inference",
            WorkloadKind::Snapshot => "snapshot",
            WorkloadKind::FunctionService => "function-service",
        }
    }

    /// Parse a route segment into a kind
    pub fn from_route(s: &str) -> Option<Self> {
        match s {
            "module" | "modules" => Some(WorkloadKind::Module),
            "tool" | "tools" => Some(WorkloadKind::Tool),
            "try-me" | "try_me" => Some(WorkloadKind::TryMe),
            "batch-inference" | "batch" => Some(WorkloadKind::BatchInference),
            "snapshot" | "snapshots" => Some(WorkloadKind::Snapshot),
            "function-service" => Some(WorkloadKind::FunctionService),
            _ => None,
        }
    }

    /// Scheduler job-name prefix for this kind
    pub fn job_prefix(&self) -> &'static str {
        match self {
            WorkloadKind::Module => "module",
            WorkloadKind::Tool => "tool",
            WorkloadKind::TryMe => "try",
            WorkloadKind::BatchInference => "batch",
            WorkloadKind::Snapshot => "snapshot",
            WorkloadKind::FunctionService => "service",
        }
    }

    /// Scheduler priority band for this kind
    ///
    /// Try-me demos sit below everything else so they are the first jobs
    /// displaced under pressure.
    pub fn priority(&self) -> u32 {
        match self {
            WorkloadKind::TryMe => 20,
            _ => 50,
        }
    }

    /// Whether jobs of this kind run to completion instead of being
    /// restarted (scheduler batch type)
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            WorkloadKind::TryMe | WorkloadKind::BatchInference | WorkloadKind::Snapshot
        )
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parsing_accepts_both_forms() {
        assert_eq!(WorkloadKind::from_route("module"), Some(WorkloadKind::Module));
        assert_eq!(WorkloadKind::from_route("modules"), Some(WorkloadKind::Module));
        assert_eq!(WorkloadKind::from_route("try_me"), Some(WorkloadKind::TryMe));
        assert_eq!(
            WorkloadKind::from_route("batch"),
            Some(WorkloadKind::BatchInference)
        );
        assert_eq!(WorkloadKind::from_route("nope"), None);
    }

    #[test]
    fn test_job_prefixes_are_distinct() {
        let mut prefixes: Vec<&str> = [
            WorkloadKind::Module,
            WorkloadKind::Tool,
            WorkloadKind::TryMe,
            WorkloadKind::BatchInference,
            WorkloadKind::Snapshot,
        ]
        .iter()
        .map(|k| k.job_prefix())
        .collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        assert_eq!(prefixes.len(), 5);
    }

    #[test]
    fn test_priority_bands() {
        assert_eq!(WorkloadKind::TryMe.priority(), 20);
        assert_eq!(WorkloadKind::Module.priority(), 50);
    }

    #[test]
    fn test_batch_kinds_never_restart() {
        assert!(WorkloadKind::TryMe.is_batch());
        assert!(WorkloadKind::Snapshot.is_batch());
        assert!(WorkloadKind::BatchInference.is_batch());
        assert!(!WorkloadKind::Module.is_batch());
        assert!(!WorkloadKind::Tool.is_batch());
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&WorkloadKind::BatchInference).unwrap();
        assert_eq!(json, "\"batch-inference\"");
        let kind: WorkloadKind = serde_json::from_str("\"try-me\"").unwrap();
        assert_eq!(kind, WorkloadKind::TryMe);
    }
}
