//! Kubernetes worker driver.
//!
//! Workers run as batch/v1 Jobs: `activeDeadlineSeconds` bounds the job to
//! the session lifetime and `ttlSecondsAfterFinished` collects finished
//! workers without controller involvement. The pod carries the labels the
//! cluster NetworkPolicy selects on to restrict terminal-port ingress to
//! the gateway.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Pod, PodSpec,
    PodTemplateSpec, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use uuid::Uuid;

use tether_core::config::OrchestratorConfig;

use crate::admission::JobRequest;

pub const WORKER_APP_LABEL: &str = "tether-worker";
const SESSION_LABEL: &str = "tether.dev/session-id";
const DEFAULT_INSTALL_CMD: &str = "npm install";

/// Everything the driver needs to materialise one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub worker_name: String,
    pub session_id: Uuid,
    pub job: JobRequest,
    /// Hard lifetime bound, equal to the session TTL.
    pub active_deadline_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("orchestrator api: {0}")]
    Api(String),

    #[error("orchestrator operation timed out")]
    Timeout,
}

/// Abstracts the container orchestrator behind the three operations the
/// controller needs.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Submit the worker lifecycle object. Not retried; the caller may
    /// re-POST and receive a fresh session.
    async fn submit(&self, spec: &WorkerSpec) -> Result<(), LaunchError>;

    /// Single endpoint probe. `Ok(None)` means the worker has no address
    /// yet; callers own the polling cadence.
    async fn resolve_endpoint(&self, worker_name: &str) -> Result<Option<String>, LaunchError>;

    /// Delete the worker object, swallowing failures. The orchestrator's
    /// TTLs are the safety net when this loses.
    async fn best_effort_delete(&self, worker_name: &str);
}

/// Poll for the worker endpoint up to `deadline`, probing every `interval`.
/// Probe errors are tolerated: the orchestrator API may flap while the pod
/// is being scheduled.
pub async fn resolve_with_deadline(
    launcher: &dyn WorkerLauncher,
    worker_name: &str,
    deadline: Duration,
    interval: Duration,
) -> Option<String> {
    let attempts = (deadline.as_millis() / interval.as_millis().max(1)) as u64 + 1;
    for i in 0..attempts {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        match launcher.resolve_endpoint(worker_name).await {
            Ok(Some(endpoint)) => {
                tracing::info!(%worker_name, %endpoint, attempt = i, "worker endpoint assigned");
                return Some(endpoint);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(%worker_name, error = %e, "endpoint probe failed");
            }
        }
    }
    None
}

/// Launcher backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeLauncher {
    client: Client,
    config: OrchestratorConfig,
}

impl KubeLauncher {
    pub async fn new(config: OrchestratorConfig) -> Result<Self, LaunchError> {
        let client = Client::try_default()
            .await
            .map_err(|e| LaunchError::Api(format!("failed to create kube client: {e}")))?;
        Ok(Self { client, config })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.config.op_timeout_secs)
    }
}

#[async_trait]
impl WorkerLauncher for KubeLauncher {
    async fn submit(&self, spec: &WorkerSpec) -> Result<(), LaunchError> {
        let job = build_job(&self.config, spec);
        tracing::info!(
            worker_name = %spec.worker_name,
            session_id = %spec.session_id,
            namespace = %self.config.namespace,
            "creating worker job"
        );
        let jobs = self.jobs();
        let params = PostParams::default();
        let create = jobs.create(&params, &job);
        match tokio::time::timeout(self.op_timeout(), create).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(LaunchError::Api(format!("job creation failed: {e}"))),
            Err(_) => Err(LaunchError::Timeout),
        }
    }

    async fn resolve_endpoint(&self, worker_name: &str) -> Result<Option<String>, LaunchError> {
        // Job pods carry the job-name label set by the job controller.
        let lp = ListParams::default().labels(&format!("job-name={worker_name}"));
        let list = match tokio::time::timeout(self.op_timeout(), self.pods().list(&lp)).await {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => return Err(LaunchError::Api(format!("pod list failed: {e}"))),
            Err(_) => return Err(LaunchError::Timeout),
        };

        for pod in list {
            if let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_ref())
                && !ip.is_empty()
            {
                return Ok(Some(format!("{ip}:{}", self.config.ttyd_port)));
            }
        }
        Ok(None)
    }

    async fn best_effort_delete(&self, worker_name: &str) {
        let jobs = self.jobs();
        let params = DeleteParams::background();
        let delete = jobs.delete(worker_name, &params);
        match tokio::time::timeout(self.op_timeout(), delete).await {
            Ok(Ok(_)) => {
                tracing::info!(%worker_name, "worker job deleted");
            }
            Ok(Err(e)) => {
                tracing::warn!(%worker_name, error = %e, "failed to delete worker job");
            }
            Err(_) => {
                tracing::warn!(%worker_name, "worker job delete timed out");
            }
        }
    }
}

/// Build the Job object for one worker.
pub fn build_job(config: &OrchestratorConfig, spec: &WorkerSpec) -> Job {
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), WORKER_APP_LABEL.to_string()),
        (SESSION_LABEL.to_string(), spec.session_id.to_string()),
    ]
    .into_iter()
    .collect();

    let mut env = vec![
        env_var("CODE_URL", &spec.job.code_url),
        env_var("COMMAND", &spec.job.command),
        env_var(
            "INSTALL_CMD",
            spec.job.install_cmd.as_deref().unwrap_or(DEFAULT_INSTALL_CMD),
        ),
        env_var("TTYD_PORT", &config.ttyd_port.to_string()),
        env_var("EXIT_ON_JOB", "true"),
    ];
    if let Some(ref prompt) = spec.job.prompt {
        env.push(env_var("CLAUDE_PROMPT", prompt));
    }

    // Read-only root filesystem needs writable scratch mounts
    let volumes = vec![
        Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let volume_mounts = vec![
        VolumeMount {
            name: "workspace".to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "tmp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
    ];

    let container = Container {
        name: "worker".to_string(),
        image: Some(config.image.clone()),
        working_dir: Some("/workspace".to_string()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: config.ttyd_port as i32,
            name: Some("terminal".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.worker_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            active_deadline_seconds: Some(spec.active_deadline_secs as i64),
            ttl_seconds_after_finished: Some(config.collection_ttl_secs as i32),
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scriptable launcher for router tests: records submissions and
    /// resolves the endpoint after a configurable number of probes.
    pub struct FakeLauncher {
        pub submissions: Mutex<Vec<WorkerSpec>>,
        pub deleted: Mutex<Vec<String>>,
        endpoint: Option<String>,
        probes_until_ready: AtomicUsize,
        fail_submit: bool,
    }

    impl FakeLauncher {
        /// Endpoint known from the first probe.
        pub fn ready(endpoint: &str) -> Self {
            Self::after(0, endpoint)
        }

        /// Endpoint never resolves.
        pub fn pending() -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                endpoint: None,
                probes_until_ready: AtomicUsize::new(usize::MAX),
                fail_submit: false,
            }
        }

        /// Endpoint appears after `n` unsuccessful probes.
        pub fn after(n: usize, endpoint: &str) -> Self {
            Self {
                submissions: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                endpoint: Some(endpoint.to_string()),
                probes_until_ready: AtomicUsize::new(n),
                fail_submit: false,
            }
        }

        /// Every submission fails.
        pub fn failing() -> Self {
            Self {
                fail_submit: true,
                ..Self::pending()
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn submit(&self, spec: &WorkerSpec) -> Result<(), LaunchError> {
            if self.fail_submit {
                return Err(LaunchError::Api("submission refused".to_string()));
            }
            self.submissions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(spec.clone());
            Ok(())
        }

        async fn resolve_endpoint(&self, _worker_name: &str) -> Result<Option<String>, LaunchError> {
            let remaining = self.probes_until_ready.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(self.endpoint.clone());
            }
            if remaining != usize::MAX {
                self.probes_until_ready.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None)
        }

        async fn best_effort_delete(&self, worker_name: &str) {
            self.deleted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(worker_name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_support::FakeLauncher;
    use super::*;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            worker_name: "tether-worker-test".to_string(),
            session_id: Uuid::new_v4(),
            job: JobRequest {
                code_url: "https://github.com/x/y/tree/main/p".to_string(),
                command: "node index.js".to_string(),
                install_cmd: None,
                prompt: Some("fix the failing test".to_string()),
            },
            active_deadline_secs: 600,
        }
    }

    fn env_of(job: &Job) -> Vec<(String, String)> {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn job_carries_worker_environment_contract() {
        let config = OrchestratorConfig::default();
        let job = build_job(&config, &spec());
        let env = env_of(&job);

        let get = |name: &str| {
            env.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(
            get("CODE_URL").as_deref(),
            Some("https://github.com/x/y/tree/main/p")
        );
        assert_eq!(get("COMMAND").as_deref(), Some("node index.js"));
        assert_eq!(get("INSTALL_CMD").as_deref(), Some("npm install"));
        assert_eq!(get("TTYD_PORT").as_deref(), Some("7681"));
        assert_eq!(get("EXIT_ON_JOB").as_deref(), Some("true"));
        assert_eq!(get("CLAUDE_PROMPT").as_deref(), Some("fix the failing test"));
    }

    #[test]
    fn explicit_install_cmd_overrides_default() {
        let config = OrchestratorConfig::default();
        let mut s = spec();
        s.job.install_cmd = Some("yarn install".to_string());
        s.job.prompt = None;
        let job = build_job(&config, &s);
        let env = env_of(&job);
        assert!(env.contains(&("INSTALL_CMD".to_string(), "yarn install".to_string())));
        assert!(!env.iter().any(|(n, _)| n == "CLAUDE_PROMPT"));
    }

    #[test]
    fn job_lifecycle_and_hardening() {
        let config = OrchestratorConfig::default();
        let job = build_job(&config, &spec());
        let job_spec = job.spec.as_ref().unwrap();

        assert_eq!(job_spec.active_deadline_seconds, Some(600));
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(300));
        assert_eq!(job_spec.backoff_limit, Some(0));

        let pod_spec = job_spec.template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));

        let sc = pod_spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(
            sc.capabilities.as_ref().unwrap().drop.as_deref(),
            Some(["ALL".to_string()].as_slice())
        );
        assert_eq!(
            sc.seccomp_profile.as_ref().unwrap().type_,
            "RuntimeDefault"
        );
    }

    #[test]
    fn job_labels_select_for_network_policy() {
        let config = OrchestratorConfig::default();
        let s = spec();
        let job = build_job(&config, &s);
        let pod_labels = job
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(pod_labels.get("app").map(String::as_str), Some(WORKER_APP_LABEL));
        assert_eq!(
            pod_labels.get(SESSION_LABEL),
            Some(&s.session_id.to_string())
        );
    }

    #[tokio::test]
    async fn resolve_with_deadline_returns_late_endpoint() {
        let launcher = FakeLauncher::after(2, "10.0.0.5:7681");
        let endpoint = resolve_with_deadline(
            &launcher,
            "w",
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(endpoint.as_deref(), Some("10.0.0.5:7681"));
    }

    #[tokio::test]
    async fn resolve_with_deadline_gives_up() {
        let launcher = FakeLauncher::pending();
        let endpoint = resolve_with_deadline(
            &launcher,
            "w",
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(endpoint.is_none());
    }
}
