//! YAML configuration parsing and validation.
//!
//! Defines the configuration model for the hier-pubsub daemon and validates it
//! at load time.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use hier_pubsub_common::{MAX_LOCAL_SUB, MAX_NODES, MAX_TOPICS};

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub dataplane: DataplaneConfig,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// Dataplane Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DataplaneConfig {
    /// Interface the classifier is attached to (TC ingress).
    pub interface: String,

    /// Interface tier-1 replicas are redirected to. Defaults to `interface`.
    #[serde(default)]
    pub egress_interface: Option<String>,

    /// Interface tier-2 replicas use when a subscriber carries no ifindex
    /// (e.g. `cilium_host`, `cni0`). Defaults to the egress interface.
    #[serde(default)]
    pub local_route_interface: Option<String>,

    /// Name of the node this daemon runs on. Falls back to `$NODE_NAME`.
    #[serde(default)]
    pub node_name: Option<String>,

    /// UDP port every node receives hop-1 traffic on.
    #[serde(default = "default_node_port")]
    pub node_port: u16,
}

impl DataplaneConfig {
    pub fn egress_interface(&self) -> &str {
        self.egress_interface.as_deref().unwrap_or(&self.interface)
    }

    pub fn local_route_interface(&self) -> &str {
        self.local_route_interface
            .as_deref()
            .unwrap_or_else(|| self.egress_interface())
    }
}

fn default_node_port() -> u16 {
    32000
}

// ---------------------------------------------------------------------------
// Topology Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TopologyConfig {
    /// Fixed node and subscriber lists.
    Static(StaticTopologyConfig),
    /// Subscriber pods and cluster nodes discovered from the Kubernetes API.
    Kubernetes(KubernetesTopologyConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticTopologyConfig {
    pub nodes: Vec<StaticNode>,
    #[serde(default)]
    pub subscribers: Vec<StaticSubscriber>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticNode {
    pub name: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticSubscriber {
    pub topic: u32,
    /// Node the subscriber lives on.
    pub node: String,
    pub address: SocketAddr,
    /// Interface to reach this subscriber through, overriding the local route.
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesTopologyConfig {
    /// Namespace subscriber pods live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_label_selector")]
    pub label_selector: String,

    /// Pod label holding the topic id.
    #[serde(default = "default_topic_label")]
    pub topic_label: String,

    #[serde(default = "default_topic")]
    pub default_topic: u32,

    /// Container env var holding the subscriber's UDP port.
    #[serde(default = "default_port_env")]
    pub port_env: String,

    #[serde(default = "default_subscriber_port")]
    pub default_port: u16,
}

fn default_namespace() -> String {
    "psbench".to_string()
}
fn default_label_selector() -> String {
    "app=subscriber".to_string()
}
fn default_topic_label() -> String {
    "ps/topic".to_string()
}
fn default_topic() -> u32 {
    1
}
fn default_port_env() -> String {
    "PS_UDP_PORT".to_string()
}
fn default_subscriber_port() -> u16 {
    31001
}

// ---------------------------------------------------------------------------
// Controller Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| "parsing YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    fn validate(&self) -> Result<()> {
        let dp = &self.dataplane;
        if dp.interface.trim().is_empty() {
            bail!("dataplane.interface must not be empty");
        }
        if dp.node_port == 0 {
            bail!("dataplane.node_port must be 1..65535, got 0");
        }

        if self.controller.interval_secs == 0 {
            bail!("controller.interval_secs must be at least 1");
        }

        if !self.metrics.path.starts_with('/') {
            bail!("metrics.path must start with '/', got '{}'", self.metrics.path);
        }

        match &self.topology {
            TopologyConfig::Static(st) => st.validate(),
            TopologyConfig::Kubernetes(k8s) => {
                if k8s.namespace.trim().is_empty() {
                    bail!("topology.namespace must not be empty");
                }
                if k8s.default_topic >= MAX_TOPICS {
                    bail!(
                        "topology.default_topic must be < {}, got {}",
                        MAX_TOPICS,
                        k8s.default_topic
                    );
                }
                if k8s.default_port == 0 {
                    bail!("topology.default_port must be 1..65535, got 0");
                }
                Ok(())
            }
        }
    }
}

impl StaticTopologyConfig {
    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("topology.nodes: at least one node is required");
        }
        if self.nodes.len() > MAX_NODES as usize {
            bail!(
                "topology.nodes: {} nodes exceeds {}",
                self.nodes.len(),
                MAX_NODES
            );
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|n| n.name == node.name) {
                bail!("topology.nodes[{}]: duplicate node '{}'", i, node.name);
            }
        }

        for (i, sub) in self.subscribers.iter().enumerate() {
            let ctx = format!("topology.subscribers[{}]", i);

            if sub.topic >= MAX_TOPICS {
                bail!("{}: topic {} must be < {}", ctx, sub.topic, MAX_TOPICS);
            }
            if !self.nodes.iter().any(|n| n.name == sub.node) {
                bail!("{}: unknown node '{}'", ctx, sub.node);
            }
            if !sub.address.is_ipv4() {
                bail!("{}: only IPv4 subscribers are supported", ctx);
            }
        }

        for node in &self.nodes {
            let subs = self.subscribers.iter().filter(|s| s.node == node.name).count();
            if subs > MAX_LOCAL_SUB as usize {
                bail!(
                    "topology: node '{}' has {} subscribers, limit is {}",
                    node.name,
                    subs,
                    MAX_LOCAL_SUB
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_static_config() {
        let yaml = r#"
dataplane:
  interface: eth0
  local_route_interface: cilium_host
  node_name: worker-a
topology:
  source: static
  nodes:
    - name: worker-a
      address: 10.0.0.1
    - name: worker-b
      address: 10.0.0.2
  subscribers:
    - topic: 7
      node: worker-b
      address: "10.244.1.5:31001"
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.dataplane.node_port, 32000);
        assert_eq!(config.dataplane.egress_interface(), "eth0");
        assert_eq!(config.dataplane.local_route_interface(), "cilium_host");
        assert_eq!(config.controller.interval(), Duration::from_secs(5));
        assert!(!config.metrics.enabled);
        match config.topology {
            TopologyConfig::Static(st) => {
                assert_eq!(st.nodes.len(), 2);
                assert_eq!(st.subscribers[0].topic, 7);
                assert!(st.subscribers[0].interface.is_none());
            }
            _ => panic!("expected static topology"),
        }
    }

    #[test]
    fn test_kubernetes_defaults() {
        let yaml = r#"
dataplane:
  interface: eth0
topology:
  source: kubernetes
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.dataplane.local_route_interface(), "eth0");
        match config.topology {
            TopologyConfig::Kubernetes(k8s) => {
                assert_eq!(k8s.namespace, "psbench");
                assert_eq!(k8s.label_selector, "app=subscriber");
                assert_eq!(k8s.topic_label, "ps/topic");
                assert_eq!(k8s.default_topic, 1);
                assert_eq!(k8s.port_env, "PS_UDP_PORT");
                assert_eq!(k8s.default_port, 31001);
            }
            _ => panic!("expected kubernetes topology"),
        }
    }

    #[test]
    fn test_unknown_subscriber_node_rejected() {
        let yaml = r#"
dataplane:
  interface: eth0
topology:
  source: static
  nodes:
    - name: worker-a
      address: 10.0.0.1
  subscribers:
    - topic: 1
      node: worker-z
      address: "10.244.1.5:31001"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown node"));
    }

    #[test]
    fn test_topic_out_of_range_rejected() {
        let yaml = r#"
dataplane:
  interface: eth0
topology:
  source: static
  nodes:
    - name: worker-a
      address: 10.0.0.1
  subscribers:
    - topic: 4096
      node: worker-a
      address: "10.244.1.5:31001"
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_ipv6_subscriber_rejected() {
        let yaml = r#"
dataplane:
  interface: eth0
topology:
  source: static
  nodes:
    - name: worker-a
      address: 10.0.0.1
  subscribers:
    - topic: 1
      node: worker-a
      address: "[fd00::5]:31001"
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let yaml = r#"
dataplane:
  interface: eth0
topology:
  source: static
  nodes:
    - name: worker-a
      address: 10.0.0.1
    - name: worker-a
      address: 10.0.0.2
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = r#"
dataplane:
  interface: eth0
controller:
  interval_secs: 0
topology:
  source: kubernetes
"#;
        assert!(parse(yaml).is_err());
    }
}
