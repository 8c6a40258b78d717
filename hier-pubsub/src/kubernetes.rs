//! Kubernetes topology discovery.
//!
//! Lists cluster nodes (InternalIP) and subscriber pods in a namespace. A pod
//! subscribes to the topic in its topic label and listens on the port in its
//! port env var. A pod watcher nudges the controller whenever subscriber pods
//! change so it does not have to wait for the next tick.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod};
use kube::api::ListParams;
use kube::runtime::watcher::{watcher, Config as WatcherConfig};
use kube::{Api, Client, ResourceExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::KubernetesTopologyConfig;
use crate::topology::{Node, Subscriber, Topology};

pub struct KubeDiscovery {
    client: Client,
    cfg: KubernetesTopologyConfig,
}

impl KubeDiscovery {
    pub async fn connect(cfg: KubernetesTopologyConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("creating Kubernetes client (in-cluster or kubeconfig)")?;

        info!(
            namespace = %cfg.namespace,
            selector = %cfg.label_selector,
            "kubernetes topology discovery ready"
        );

        Ok(Self { client, cfg })
    }

    /// List nodes and subscriber pods.
    pub async fn fetch(&self) -> Result<Topology> {
        let nodes_api: Api<KubeNode> = Api::all(self.client.clone());
        let kube_nodes = nodes_api
            .list(&ListParams::default())
            .await
            .context("listing nodes")?
            .items;

        let mut nodes = Vec::with_capacity(kube_nodes.len());
        for n in &kube_nodes {
            match node_internal_ip(n) {
                Some(address) => nodes.push(Node {
                    name: n.name_any(),
                    address,
                }),
                None => warn!(node = %n.name_any(), "node has no IPv4 InternalIP, skipping"),
            }
        }

        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let pods = pods_api
            .list(&ListParams::default().labels(&self.cfg.label_selector))
            .await
            .context("listing subscriber pods")?
            .items;

        let subscribers: Vec<Subscriber> = pods
            .iter()
            .filter_map(|p| subscriber_from_pod(p, &self.cfg))
            .collect();

        debug!(
            nodes = nodes.len(),
            pods = pods.len(),
            subscribers = subscribers.len(),
            "fetched kubernetes topology"
        );

        Ok(Topology { nodes, subscribers })
    }

    /// Spawn a background task that signals `changed` on every subscriber pod
    /// event.
    pub fn spawn_pod_watcher(&self, changed: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let wc = WatcherConfig {
            label_selector: Some(self.cfg.label_selector.clone()),
            ..Default::default()
        };

        tokio::spawn(async move {
            loop {
                let mut w = watcher(api.clone(), wc.clone()).boxed();

                loop {
                    match w.try_next().await {
                        Ok(Some(_)) => changed.notify_one(),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "subscriber pod watch error");
                            break;
                        }
                    }
                }

                warn!("subscriber pod watch stream ended; retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

fn node_internal_ip(node: &KubeNode) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .filter(|a| a.type_ == "InternalIP")
        .find_map(|a| a.address.parse().ok())
}

/// A pod without an IP or node assignment is not a subscriber yet.
fn subscriber_from_pod(pod: &Pod, cfg: &KubernetesTopologyConfig) -> Option<Subscriber> {
    let node = pod.spec.as_ref()?.node_name.clone()?;
    let ip: Ipv4Addr = pod.status.as_ref()?.pod_ip.as_deref()?.parse().ok()?;

    Some(Subscriber {
        topic: pod_topic(pod, cfg),
        node,
        address: SocketAddrV4::new(ip, pod_port(pod, cfg)),
        ifindex: 0,
    })
}

fn pod_topic(pod: &Pod, cfg: &KubernetesTopologyConfig) -> u32 {
    pod.labels()
        .get(&cfg.topic_label)
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.default_topic)
}

fn pod_port(pod: &Pod, cfg: &KubernetesTopologyConfig) -> u16 {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.env.iter().flatten())
        .filter(|e| e.name == cfg.port_env)
        .find_map(|e| e.value.as_deref()?.parse().ok())
        .unwrap_or(cfg.default_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, EnvVar, NodeAddress, NodeStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn cfg() -> KubernetesTopologyConfig {
        serde_yaml::from_str("{}").unwrap()
    }

    fn pod(
        topic: Option<&str>,
        port: Option<&str>,
        node: Option<&str>,
        ip: Option<&str>,
    ) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "subscriber".to_string());
        if let Some(t) = topic {
            labels.insert("ps/topic".to_string(), t.to_string());
        }
        let env = port.map(|p| {
            vec![EnvVar {
                name: "PS_UDP_PORT".to_string(),
                value: Some(p.to_string()),
                ..Default::default()
            }]
        });
        Pod {
            metadata: ObjectMeta {
                name: Some("sub-0".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                containers: vec![Container {
                    name: "sub".to_string(),
                    env,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_with_label_and_port() {
        let p = pod(Some("7"), Some("31500"), Some("worker-a"), Some("10.244.1.5"));
        let s = subscriber_from_pod(&p, &cfg()).unwrap();
        assert_eq!(s.topic, 7);
        assert_eq!(s.node, "worker-a");
        assert_eq!(s.address, "10.244.1.5:31500".parse().unwrap());
        assert_eq!(s.ifindex, 0);
    }

    #[test]
    fn test_pod_defaults() {
        let p = pod(None, None, Some("worker-a"), Some("10.244.1.5"));
        let s = subscriber_from_pod(&p, &cfg()).unwrap();
        assert_eq!(s.topic, 1);
        assert_eq!(s.address.port(), 31001);

        // Unparseable values fall back too.
        let p = pod(Some("news"), Some("high"), Some("worker-a"), Some("10.244.1.5"));
        let s = subscriber_from_pod(&p, &cfg()).unwrap();
        assert_eq!(s.topic, 1);
        assert_eq!(s.address.port(), 31001);
    }

    #[test]
    fn test_unscheduled_pod_skipped() {
        assert!(subscriber_from_pod(&pod(None, None, None, Some("10.244.1.5")), &cfg()).is_none());
        assert!(subscriber_from_pod(&pod(None, None, Some("worker-a"), None), &cfg()).is_none());
        assert!(
            subscriber_from_pod(&pod(None, None, Some("worker-a"), Some("fd00::5")), &cfg())
                .is_none()
        );
    }

    #[test]
    fn test_node_internal_ip() {
        let addr = |t: &str, a: &str| NodeAddress {
            type_: t.to_string(),
            address: a.to_string(),
        };
        let node = KubeNode {
            metadata: ObjectMeta {
                name: Some("worker-a".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    addr("Hostname", "worker-a"),
                    addr("InternalIP", "fd00::1"),
                    addr("InternalIP", "192.168.1.10"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_internal_ip(&node), Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(node_internal_ip(&KubeNode::default()), None);
    }
}
