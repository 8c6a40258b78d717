//! Cluster topology and the routing plan derived from it.
//!
//! A `Topology` is what a source observed: nodes and subscribers. A
//! `RoutingPlan` is what gets written into one table generation: node ids,
//! tier-1 node sets per topic and tier-2 subscriber sets per node.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{bail, Result};
use tracing::warn;

use hier_pubsub_common::*;

use crate::config::StaticTopologyConfig;
use crate::ebpf_manager::interface_index;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub topic: u32,
    /// Name of the node hosting the subscriber.
    pub node: String,
    pub address: SocketAddrV4,
    /// 0 selects the node's local route interface.
    pub ifindex: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub subscribers: Vec<Subscriber>,
}

impl Topology {
    /// Build from the static config, resolving per-subscriber interfaces.
    pub fn from_static(cfg: &StaticTopologyConfig) -> Result<Self> {
        let nodes = cfg
            .nodes
            .iter()
            .map(|n| Node {
                name: n.name.clone(),
                address: n.address,
            })
            .collect();

        let mut subscribers = Vec::with_capacity(cfg.subscribers.len());
        for s in &cfg.subscribers {
            let address = match s.address {
                std::net::SocketAddr::V4(v4) => v4,
                std::net::SocketAddr::V6(_) => bail!("only IPv4 subscribers are supported"),
            };
            let ifindex = match s.interface.as_deref() {
                Some(iface) => interface_index(iface)?,
                None => 0,
            };
            subscribers.push(Subscriber {
                topic: s.topic,
                node: s.node.clone(),
                address,
                ifindex,
            });
        }

        Ok(Self { nodes, subscribers })
    }
}

// ---------------------------------------------------------------------------
// Routing Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPlan {
    /// Sorted by name; the position is the node id.
    pub nodes: Vec<Node>,
    /// Tier 1: topic -> nodes hosting at least one subscriber of it.
    pub topics: BTreeMap<u32, Vec<NodeDest>>,
    /// Tier 2: node id -> every subscriber on that node.
    pub locals: BTreeMap<u32, Vec<SubDest>>,
}

impl RoutingPlan {
    /// Derive a plan. Node ids are assigned by sorted node name; every node in
    /// a topic's set is addressed at `node_port`.
    pub fn build(topology: &Topology, node_port: u16) -> Result<Self> {
        let mut nodes = topology.nodes.clone();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(w) = nodes.windows(2).find(|w| w[0].name == w[1].name) {
            bail!("duplicate node '{}'", w[0].name);
        }
        if nodes.len() > MAX_NODES as usize {
            bail!("{} nodes exceeds MAX_NODES ({})", nodes.len(), MAX_NODES);
        }

        let mut topic_nodes: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        let mut local_subs: BTreeMap<u32, BTreeSet<(Ipv4Addr, u16, u32)>> = BTreeMap::new();

        for sub in &topology.subscribers {
            let Ok(node_id) = nodes.binary_search_by(|n| n.name.as_str().cmp(&sub.node)) else {
                warn!(node = %sub.node, subscriber = %sub.address, "subscriber on unknown node, skipping");
                continue;
            };
            if sub.topic >= MAX_TOPICS {
                warn!(topic = sub.topic, subscriber = %sub.address, "topic out of range, skipping");
                continue;
            }
            let node_id = node_id as u32;

            topic_nodes.entry(sub.topic).or_default().insert(node_id);
            local_subs.entry(node_id).or_default().insert((
                *sub.address.ip(),
                sub.address.port(),
                sub.ifindex,
            ));
        }

        let topics = topic_nodes
            .into_iter()
            .map(|(topic, ids)| {
                let dests: Vec<NodeDest> = ids
                    .into_iter()
                    .map(|id| NodeDest::new(id, nodes[id as usize].address, node_port))
                    .collect();
                (topic, dests)
            })
            .collect::<BTreeMap<_, _>>();

        let mut locals = BTreeMap::new();
        for (node_id, subs) in local_subs {
            // A subscriber listed under several topics is delivered to once.
            let mut seen = BTreeSet::new();
            let dests: Vec<SubDest> = subs
                .into_iter()
                .filter(|(addr, port, _)| seen.insert((*addr, *port)))
                .map(|(addr, port, ifindex)| SubDest::new(ifindex, addr, port))
                .collect();

            if dests.len() > MAX_LOCAL_SUB as usize {
                bail!(
                    "node '{}' has {} subscribers, exceeds MAX_LOCAL_SUB ({})",
                    nodes[node_id as usize].name,
                    dests.len(),
                    MAX_LOCAL_SUB
                );
            }
            locals.insert(node_id, dests);
        }

        Ok(Self {
            nodes,
            topics,
            locals,
        })
    }

    pub fn node_id(&self, name: &str) -> Option<u32> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| i as u32)
    }

    pub fn local_subscribers(&self, node_id: u32) -> usize {
        self.locals.get(&node_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, last: u8) -> Node {
        Node {
            name: name.to_string(),
            address: Ipv4Addr::new(10, 0, 0, last),
        }
    }

    fn sub(topic: u32, node: &str, last: u8, port: u16) -> Subscriber {
        Subscriber {
            topic,
            node: node.to_string(),
            address: SocketAddrV4::new(Ipv4Addr::new(10, 244, 0, last), port),
            ifindex: 0,
        }
    }

    fn three_nodes() -> Topology {
        Topology {
            nodes: vec![node("worker-c", 3), node("worker-a", 1), node("worker-b", 2)],
            subscribers: vec![
                sub(7, "worker-b", 20, 31001),
                sub(7, "worker-c", 30, 31001),
                sub(7, "worker-b", 21, 31001),
                sub(9, "worker-a", 10, 31002),
            ],
        }
    }

    #[test]
    fn test_node_ids_follow_sorted_names() {
        let plan = RoutingPlan::build(&three_nodes(), 32000).unwrap();
        assert_eq!(plan.node_id("worker-a"), Some(0));
        assert_eq!(plan.node_id("worker-b"), Some(1));
        assert_eq!(plan.node_id("worker-c"), Some(2));
        assert_eq!(plan.node_id("worker-z"), None);
    }

    #[test]
    fn test_tier1_sets_hold_hosting_nodes_once() {
        let plan = RoutingPlan::build(&three_nodes(), 32000).unwrap();

        let t7 = &plan.topics[&7];
        assert_eq!(t7.len(), 2);
        assert_eq!(t7[0], NodeDest::new(1, Ipv4Addr::new(10, 0, 0, 2), 32000));
        assert_eq!(t7[1], NodeDest::new(2, Ipv4Addr::new(10, 0, 0, 3), 32000));

        let t9 = &plan.topics[&9];
        assert_eq!(t9.len(), 1);
        assert_eq!(t9[0].node_id, 0);
        assert!(!plan.topics.contains_key(&1));
    }

    #[test]
    fn test_tier2_sets_are_stable() {
        let plan = RoutingPlan::build(&three_nodes(), 32000).unwrap();
        let b = &plan.locals[&1];
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].addr(), Ipv4Addr::new(10, 244, 0, 20));
        assert_eq!(b[1].addr(), Ipv4Addr::new(10, 244, 0, 21));
        assert_eq!(plan.local_subscribers(1), 2);
        assert_eq!(plan.local_subscribers(0), 1);

        // Order of discovery does not change the plan.
        let mut shuffled = three_nodes();
        shuffled.subscribers.reverse();
        shuffled.nodes.reverse();
        assert_eq!(RoutingPlan::build(&shuffled, 32000).unwrap(), plan);
    }

    #[test]
    fn test_subscriber_on_two_topics_delivered_once() {
        let mut topo = three_nodes();
        topo.subscribers.push(sub(9, "worker-b", 20, 31001));
        let plan = RoutingPlan::build(&topo, 32000).unwrap();

        assert_eq!(plan.locals[&1].len(), 2);
        assert_eq!(plan.topics[&9].len(), 2);
    }

    #[test]
    fn test_unknown_node_and_bad_topic_skipped() {
        let mut topo = three_nodes();
        topo.subscribers.push(sub(7, "worker-z", 99, 31001));
        topo.subscribers.push(sub(MAX_TOPICS, "worker-a", 98, 31001));
        let plan = RoutingPlan::build(&topo, 32000).unwrap();
        assert_eq!(plan, RoutingPlan::build(&three_nodes(), 32000).unwrap());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let topo = Topology {
            nodes: vec![node("worker-a", 1), node("worker-a", 2)],
            subscribers: vec![],
        };
        assert!(RoutingPlan::build(&topo, 32000).is_err());
    }

    #[test]
    fn test_local_capacity_enforced() {
        let subscribers = (0..=MAX_LOCAL_SUB)
            .map(|i| Subscriber {
                topic: 1,
                node: "worker-a".to_string(),
                address: SocketAddrV4::new(Ipv4Addr::new(10, 244, (i >> 8) as u8, i as u8), 31001),
                ifindex: 0,
            })
            .collect();
        let topo = Topology {
            nodes: vec![node("worker-a", 1)],
            subscribers,
        };
        assert!(RoutingPlan::build(&topo, 32000).is_err());
    }

    #[test]
    fn test_static_topology_without_interfaces() {
        let cfg: StaticTopologyConfig = serde_yaml::from_str(
            r#"
nodes:
  - name: worker-a
    address: 10.0.0.1
subscribers:
  - topic: 3
    node: worker-a
    address: "10.244.0.8:31001"
"#,
        )
        .unwrap();
        let topo = Topology::from_static(&cfg).unwrap();
        assert_eq!(topo.nodes, vec![node("worker-a", 1)]);
        assert_eq!(topo.subscribers, vec![sub(3, "worker-a", 8, 31001)]);
    }
}
