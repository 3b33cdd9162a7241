//! The container orchestrator (COR) adapter (C8).
//!
//! The COR client itself is out of scope; this module defines the trait the
//! rest of the control plane talks to, plus a concrete implementation that
//! shells out to `kubectl`, wrapping the usual `kubectl`/JSON-parse/
//! `deploy`/`undeploy` helpers as methods on a client struct with a
//! pluggable namespace.

use serde::de::DeserializeOwned;
use std::{
    io::Write,
    process::{Command, Stdio},
    time::Duration,
};

use crate::prelude::*;

/// A worker pod, as seen by the control plane.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pod {
    /// The pod's name.
    pub name: String,
    /// The node the pod is scheduled on, if known.
    pub node_name: Option<String>,
    /// Is the pod still starting up?
    pub initializing: bool,
}

/// The external container orchestrator.
pub trait CorClient: Send + Sync {
    /// Apply a manifest (`kubectl apply -f -`).
    fn deploy(&self, manifest: &str) -> Result<()>;

    /// Delete everything named in a manifest (`kubectl delete -f -`).
    fn undeploy(&self, manifest: &str) -> Result<()>;

    /// Does the named resource exist?
    fn resource_exists(&self, resource_id: &str) -> Result<bool>;

    /// Delete a single named resource.
    fn delete_resource(&self, resource_id: &str) -> Result<()>;

    /// List the worker pods for a replication controller, matching
    /// `{app=rcName, suite=<this service>, component=worker}`. Stable pod
    /// ordering (sorted by name) is the caller's responsibility — see
    /// `logs.rs`.
    fn rc_pods(&self, rc_name: &str) -> Result<Vec<Pod>>;

    /// Fetch the currently available log lines for a pod's container. A
    /// 10s timeout applies. Returns one string per line.
    fn pod_logs(&self, pod_name: &str, container: &str) -> Result<Vec<String>>;

    /// Read-only smoke tests (list nodes, watch pods, read control-plane
    /// logs) plus a create-and-delete round trip of a trivial replication
    /// controller. Non-essential: failures here are logged and ignored by
    /// the caller.
    fn validate_kube(&self) -> Result<()>;

    /// The external IP or hostname of the git-webhook ingress service, if
    /// one has been provisioned.
    fn get_githook_service(&self, namespace: &str) -> Result<Option<String>>;

    /// Delete the worker deployment for a pipeline version (invoked at
    /// pipeline-delete time).
    fn delete_workers_for_pipeline(&self, rc_name: &str) -> Result<()>;
}

/// Is this error COR's way of saying "the pod exists, but isn't ready to
/// serve logs yet"? Not a real failure — the caller should skip the pod.
pub fn is_pod_initializing(err: &Error) -> bool {
    err.to_string().to_lowercase().contains("podinitializing")
}

/// A [`CorClient`] that shells out to the `kubectl` binary.
pub struct KubectlCor {
    namespace: String,
    timeout: Duration,
}

impl KubectlCor {
    /// Create a client that operates in `namespace`, with the standard
    /// 10s per-call timeout.
    pub fn new(namespace: impl Into<String>) -> Self {
        KubectlCor {
            namespace: namespace.into(),
            timeout: Duration::from_secs(10),
        }
    }

    fn args_with_namespace<'a>(&'a self, args: &[&'a str], timeout_arg: &'a str) -> Vec<&'a str> {
        let mut full = vec!["--namespace", self.namespace.as_str(), timeout_arg];
        full.extend_from_slice(args);
        full
    }

    fn request_timeout_arg(&self) -> String {
        format!("--request-timeout={}s", self.timeout.as_secs())
    }

    fn kubectl(&self, args: &[&str]) -> Result<()> {
        let timeout_arg = self.request_timeout_arg();
        let args = self.args_with_namespace(args, &timeout_arg);
        let status = Command::new("kubectl")
            .args(&args)
            .status()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        if !status.success() {
            return Err(Error::msg(format!("error running kubectl with {:?}", args)));
        }
        Ok(())
    }

    fn kubectl_parse_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let timeout_arg = self.request_timeout_arg();
        let args = self.args_with_namespace(args, &timeout_arg);
        let output = Command::new("kubectl")
            .args(&args)
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("podinitializing") {
                return Err(Error::msg("PodInitializing"));
            }
            return Err(Error::msg(format!("error running kubectl with {:?}", args)));
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("error parsing output of kubectl {:?}", args))
    }

    fn kubectl_with_input(&self, args: &[&str], input: &str) -> Result<()> {
        let timeout_arg = self.request_timeout_arg();
        let args = self.args_with_namespace(args, &timeout_arg);
        let mut child = Command::new("kubectl")
            .args(&args)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        write!(
            child.stdin.as_mut().expect("child stdin is missing"),
            "{}",
            input,
        )
        .with_context(|| format!("error writing input to kubectl {:?}", args))?;
        let status = child
            .wait()
            .with_context(|| format!("error running kubectl with {:?}", args))?;
        if !status.success() {
            return Err(Error::msg(format!("error running kubectl with {:?}", args)));
        }
        Ok(())
    }

    fn kubectl_succeeds(&self, args: &[&str]) -> Result<bool> {
        let timeout_arg = self.request_timeout_arg();
        let args = self.args_with_namespace(args, &timeout_arg);
        let output = Command::new("kubectl").args(&args).output()?;
        Ok(output.status.success())
    }
}

/// A single pod as returned by `kubectl get pods -o json`.
#[derive(Deserialize)]
struct PodList {
    items: Vec<PodListItem>,
}

#[derive(Deserialize)]
struct PodListItem {
    metadata: PodMetadata,
    spec: Option<PodSpec>,
    status: Option<PodStatus>,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Deserialize)]
struct PodSpec {
    #[serde(rename = "nodeName")]
    node_name: Option<String>,
}

#[derive(Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

impl CorClient for KubectlCor {
    fn deploy(&self, manifest: &str) -> Result<()> {
        self.kubectl_with_input(&["apply", "-f", "-"], manifest)
    }

    fn undeploy(&self, manifest: &str) -> Result<()> {
        self.kubectl_with_input(&["delete", "-f", "-"], manifest)
    }

    fn resource_exists(&self, resource_id: &str) -> Result<bool> {
        self.kubectl_succeeds(&["get", resource_id])
    }

    fn delete_resource(&self, resource_id: &str) -> Result<()> {
        self.kubectl(&["delete", resource_id])
    }

    fn rc_pods(&self, rc_name: &str) -> Result<Vec<Pod>> {
        let selector = format!("app={},suite=flow-control-plane,component=worker", rc_name);
        let list: PodList = self.kubectl_parse_json(&[
            "get",
            "pods",
            "-l",
            &selector,
            "-o",
            "json",
        ])?;
        let mut pods: Vec<Pod> = list
            .items
            .into_iter()
            .map(|item| Pod {
                name: item.metadata.name,
                node_name: item.spec.and_then(|s| s.node_name),
                initializing: item
                    .status
                    .and_then(|s| s.phase)
                    .map(|phase| phase != "Running")
                    .unwrap_or(true),
            })
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pods)
    }

    fn pod_logs(&self, pod_name: &str, container: &str) -> Result<Vec<String>> {
        let timeout_arg = self.request_timeout_arg();
        let args = self.args_with_namespace(&["logs", pod_name, "-c", container], &timeout_arg);
        let output = Command::new("kubectl")
            .args(&args)
            .output()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("podinitializing") {
                return Err(Error::msg("PodInitializing"));
            }
            return Err(Error::msg(format!(
                "error fetching logs for pod {:?}: {}",
                pod_name, stderr,
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.to_owned())
            .collect())
    }

    fn validate_kube(&self) -> Result<()> {
        self.kubectl(&["get", "nodes"])
            .context("could not list nodes")?;
        self.kubectl(&["get", "pods", "-w"])
            .context("could not watch pods")?;

        let probe_name = format!("flow-validate-{}", uuid::Uuid::new_v4());
        let manifest = format!(
            "apiVersion: v1\nkind: ReplicationController\nmetadata:\n  name: {name}\nspec:\n  replicas: 0\n  selector:\n    app: {name}\n  template:\n    metadata:\n      labels:\n        app: {name}\n    spec:\n      containers:\n        - name: probe\n          image: busybox\n",
            name = probe_name,
        );
        self.deploy(&manifest)
            .context("could not create a probe replication controller")?;
        self.delete_resource(&format!("rc/{}", probe_name))
            .context("could not delete a probe replication controller")?;
        Ok(())
    }

    fn get_githook_service(&self, namespace: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Service {
            status: ServiceStatus,
        }
        #[derive(Deserialize)]
        struct ServiceStatus {
            #[serde(rename = "loadBalancer")]
            load_balancer: Option<LoadBalancerStatus>,
        }
        #[derive(Deserialize)]
        struct LoadBalancerStatus {
            ingress: Option<Vec<LoadBalancerIngress>>,
        }
        #[derive(Deserialize)]
        struct LoadBalancerIngress {
            ip: Option<String>,
            hostname: Option<String>,
        }

        let result: std::result::Result<Service, Error> = self.kubectl_parse_json(&[
            "get",
            "service",
            "githook",
            "--namespace",
            namespace,
            "-o",
            "json",
        ]);
        let service = match result {
            Ok(service) => service,
            Err(_) => return Ok(None),
        };
        Ok(service
            .status
            .load_balancer
            .and_then(|lb| lb.ingress)
            .and_then(|ingresses| ingresses.into_iter().next())
            .and_then(|ingress| ingress.ip.or(ingress.hostname)))
    }

    fn delete_workers_for_pipeline(&self, rc_name: &str) -> Result<()> {
        self.delete_resource(&format!("rc/{}", rc_name))
    }
}
