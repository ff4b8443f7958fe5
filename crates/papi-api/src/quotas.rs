//! Quota ledger
//!
//! Stateless accounting: every admission check re-reads the user's live
//! deployments from the scheduler and compares the aggregate against the
//! VO's per-user cap table. There is no persistent accumulator, so the
//! ledger survives restarts unchanged; two concurrent submissions may both
//! pass the check, and the scheduler stays the final arbiter (documented
//! race window).

use serde::Serialize;

use papi_common::config::{QuotasSection, ResourceCaps};
use papi_common::schema::{ConfSchema, UserConf};
use papi_common::{Error, Result, WorkloadKind};
use papi_nomad::Deployment;

/// Resources requested by a new deployment
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaRequest {
    /// CPU cores
    pub cpu_num: u64,
    /// GPU count
    pub gpu_num: u64,
    /// RAM in MB
    pub ram: u64,
    /// Disk in MB
    pub disk: u64,
}

impl QuotaRequest {
    /// Read the request out of a validated user configuration
    pub fn from_conf(conf: &UserConf) -> Self {
        Self {
            cpu_num: conf.u64("hardware", "cpu_num"),
            gpu_num: conf.u64("hardware", "gpu_num"),
            ram: conf.u64("hardware", "ram"),
            disk: conf.u64("hardware", "disk"),
        }
    }
}

/// Aggregate usage of a user in a VO, computed from live deployments
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QuotaUsage {
    /// CPU cores in use
    pub cpu_num: u64,
    /// GPUs in use
    pub gpu_num: u64,
    /// RAM in MB in use
    pub ram: u64,
    /// Disk in MB in use
    pub disk: u64,
    /// Number of live deployments
    pub deployments: u64,
}

/// Sum the resources of a user's live deployments
pub fn aggregate_usage(deployments: &[Deployment]) -> QuotaUsage {
    let mut usage = QuotaUsage::default();
    for deployment in deployments {
        usage.cpu_num += deployment.resources.cpu_num;
        usage.gpu_num += deployment.resources.gpu_num;
        usage.ram += deployment.resources.memory_mb;
        usage.disk += deployment.resources.disk_mb;
        usage.deployments += 1;
    }
    usage
}

/// Check a request against the per-user caps.
///
/// Overflows are reported in a fixed order: GPU count, CPU cores, RAM,
/// disk, deployment count. The GPU cap is soft for CPU-only requests: a
/// user already at the cap may still deploy with `gpu_num == 0`.
pub fn check_userwise(
    request: &QuotaRequest,
    usage: &QuotaUsage,
    caps: &ResourceCaps,
    quotas: &QuotasSection,
) -> Result<()> {
    // The global per-user GPU cap applies regardless of job kind
    let gpu_cap = caps.gpu_num.min(quotas.gpu_per_user);
    if request.gpu_num > 0 && usage.gpu_num + request.gpu_num > gpu_cap {
        return Err(Error::quota("GPU", gpu_cap, usage.gpu_num));
    }
    if usage.cpu_num + request.cpu_num > caps.cpu_num {
        return Err(Error::quota("CPU", caps.cpu_num, usage.cpu_num));
    }
    if usage.ram + request.ram > caps.ram {
        return Err(Error::quota("RAM", caps.ram, usage.ram));
    }
    if usage.disk + request.disk > caps.disk {
        return Err(Error::quota("disk", caps.disk, usage.disk));
    }
    if usage.deployments + 1 > caps.deployment_num {
        return Err(Error::quota(
            "deployments",
            caps.deployment_num,
            usage.deployments,
        ));
    }
    Ok(())
}

/// Clamp the hardware section of a schema for restricted (tutorial) VOs.
///
/// Tutorial users get small fixed envelopes and no GPUs, so their
/// deployments can be displaced without losing real work.
pub fn limit_resources(schema: &mut ConfSchema, vo: &str, quotas: &QuotasSection) {
    if !quotas.restricted.iter().any(|v| v == vo) {
        return;
    }
    if let Some(spec) = schema.param_mut("hardware", "cpu_num") {
        spec.value = serde_json::json!(2);
        spec.range = Some([2.0, 4.0]);
    }
    if let Some(spec) = schema.param_mut("hardware", "gpu_num") {
        spec.value = serde_json::json!(0);
        spec.range = Some([0.0, 0.0]);
        spec.description = Some("Tutorial users are not allowed to deploy on GPUs.".to_string());
    }
    if let Some(spec) = schema.param_mut("hardware", "ram") {
        spec.value = serde_json::json!(2000);
        spec.range = Some([2000.0, 4000.0]);
    }
    if let Some(spec) = schema.param_mut("hardware", "disk") {
        spec.value = serde_json::json!(500);
        spec.range = Some([300.0, 1000.0]);
    }
}

/// Priority band for a new job: restricted VOs sit below everyone so their
/// jobs are displaced first
pub fn priority_for(kind: WorkloadKind, vo: &str, quotas: &QuotasSection) -> u32 {
    if quotas.restricted.iter().any(|v| v == vo) {
        25.min(kind.priority())
    } else {
        kind.priority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> ResourceCaps {
        ResourceCaps {
            cpu_num: 16,
            gpu_num: 2,
            ram: 32_000,
            disk: 50_000,
            deployment_num: 4,
        }
    }

    fn quotas() -> QuotasSection {
        QuotasSection {
            gpu_per_user: 1,
            restricted: vec!["training.example.org".to_string()],
            ..Default::default()
        }
    }

    fn usage(gpu: u64, cpu: u64, deployments: u64) -> QuotaUsage {
        QuotaUsage {
            cpu_num: cpu,
            gpu_num: gpu,
            ram: 8_000 * deployments,
            disk: 10_000 * deployments,
            deployments,
        }
    }

    fn request(gpu: u64, cpu: u64) -> QuotaRequest {
        QuotaRequest {
            cpu_num: cpu,
            gpu_num: gpu,
            ram: 8_000,
            disk: 10_000,
        }
    }

    /// One GPU running, per-user cap of one: the second GPU request is
    /// denied naming the resource, the cap and the observed usage
    #[test]
    fn test_second_gpu_denied() {
        let err = check_userwise(&request(1, 4), &usage(1, 4, 1), &caps(), &quotas()).unwrap_err();
        match err {
            Error::QuotaExceeded {
                resource,
                limit,
                current,
            } => {
                assert_eq!(resource, "GPU");
                assert_eq!(limit, 1);
                assert_eq!(current, 1);
            }
            other => panic!("expected QuotaExceeded, got {other}"),
        }
    }

    /// Soft GPU cap: a user over the GPU cap can still make CPU-only
    /// deployments
    #[test]
    fn test_cpu_only_request_passes_over_gpu_cap() {
        check_userwise(&request(0, 4), &usage(2, 4, 1), &caps(), &quotas()).unwrap();
    }

    #[test]
    fn test_overflow_report_order() {
        // Everything overflows; GPU must be reported first
        let big = QuotaRequest {
            cpu_num: 100,
            gpu_num: 5,
            ram: 100_000,
            disk: 100_000,
        };
        let err = check_userwise(&big, &usage(0, 0, 0), &caps(), &quotas()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { ref resource, .. } if resource == "GPU"));

        // Without GPUs in the request, CPU is reported next
        let big = QuotaRequest {
            cpu_num: 100,
            gpu_num: 0,
            ram: 100_000,
            disk: 100_000,
        };
        let err = check_userwise(&big, &usage(0, 0, 0), &caps(), &quotas()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { ref resource, .. } if resource == "CPU"));
    }

    #[test]
    fn test_deployment_count_cap() {
        let err = check_userwise(&request(0, 1), &usage(0, 4, 4), &caps(), &quotas()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { ref resource, .. } if resource == "deployments"));
    }

    /// Monotonicity: if a request passes, any componentwise-smaller request
    /// also passes
    #[test]
    fn test_check_is_monotonic() {
        let base = usage(0, 4, 1);
        let big = request(1, 8);
        check_userwise(&big, &base, &caps(), &quotas()).unwrap();
        for smaller in [request(1, 4), request(0, 8), request(0, 1)] {
            check_userwise(&smaller, &base, &caps(), &quotas()).unwrap();
        }
    }

    #[test]
    fn test_aggregate_usage() {
        use papi_nomad::deployments::DeploymentResources;
        let mk = |cpu, gpu| {
            papi_nomad::Deployment {
                job_id: String::new(),
                name: String::new(),
                status: papi_nomad::DeploymentStatus::Running,
                owner: String::new(),
                title: String::new(),
                description: String::new(),
                docker_image: None,
                docker_command: None,
                submit_time: String::new(),
                resources: DeploymentResources {
                    cpu_num: cpu,
                    cpu_mhz: 0,
                    gpu_num: gpu,
                    gpu_model: None,
                    memory_mb: 8000,
                    disk_mb: 10000,
                },
                endpoints: Default::default(),
                active_endpoints: None,
                main_endpoint: None,
                alloc_id: None,
                datacenter: None,
                error_msg: None,
            }
        };
        let usage = aggregate_usage(&[mk(4, 1), mk(2, 0)]);
        assert_eq!(usage.cpu_num, 6);
        assert_eq!(usage.gpu_num, 1);
        assert_eq!(usage.ram, 16_000);
        assert_eq!(usage.deployments, 2);
    }

    #[test]
    fn test_restricted_vo_clamp() {
        let mut schema = ConfSchema::from_yaml(
            r#"
hardware:
  cpu_num: {name: CPUs, value: 8, range: [1, 16]}
  gpu_num: {name: GPUs, value: 1, range: [0, 2]}
  ram: {name: RAM, value: 16000, range: [2000, 64000]}
  disk: {name: Disk, value: 10000, range: [1000, 50000]}
"#,
        )
        .unwrap();
        limit_resources(&mut schema, "training.example.org", &quotas());
        assert_eq!(schema.param("hardware", "gpu_num").unwrap().range, Some([0.0, 0.0]));
        assert_eq!(schema.param("hardware", "cpu_num").unwrap().range, Some([2.0, 4.0]));

        // Other VOs keep their ranges
        let mut untouched = ConfSchema::from_yaml(
            "hardware:\n  gpu_num: {name: GPUs, value: 1, range: [0, 2]}\n",
        )
        .unwrap();
        limit_resources(&mut untouched, "vo.a", &quotas());
        assert_eq!(untouched.param("hardware", "gpu_num").unwrap().range, Some([0.0, 2.0]));
    }

    #[test]
    fn test_priority_bands() {
        let quotas = quotas();
        assert_eq!(priority_for(WorkloadKind::Module, "vo.a", &quotas), 50);
        assert_eq!(
            priority_for(WorkloadKind::Module, "training.example.org", &quotas),
            25
        );
        // Try-me stays in its own lower band even for restricted VOs
        assert_eq!(
            priority_for(WorkloadKind::TryMe, "training.example.org", &quotas),
            20
        );
    }
}
