//! Relationship graph between users and the identifiers they transact with.
//!
//! Users link to the cards, devices and IP addresses seen on their
//! transactions. Users that end up in one connected component share
//! identifiers, and a component holding a flagged user is reported as a
//! candidate fraud ring.

use crate::{transaction::Transaction, types::UserId};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityNode {
    User(UserId),
    Card(String),
    Device(String),
    Ip(String),
}

impl fmt::Display for EntityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Card(last4) => write!(f, "card:{last4}"),
            Self::Device(id) => write!(f, "device:{id}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudRing {
    pub ring_id: String,
    pub users: Vec<UserId>,
    /// Identifiers used by two or more users of the ring.
    pub shared_identifiers: Vec<String>,
    pub flagged_users: Vec<UserId>,
}

#[derive(Default)]
pub struct RelationshipGraph {
    graph: UnGraph<EntityNode, ()>,
    index: HashMap<EntityNode, NodeIndex>,
    flagged: HashSet<UserId>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, entity: EntityNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&entity) {
            return idx;
        }
        let idx = self.graph.add_node(entity.clone());
        self.index.insert(entity, idx);
        idx
    }

    /// Link the transaction's user to its card, device and IP.
    pub fn add_transaction(&mut self, tx: &Transaction, flagged: bool) {
        let user = self.node(EntityNode::User(tx.user_id.clone()));
        for entity in [
            EntityNode::Card(tx.card_last4.clone()),
            EntityNode::Device(tx.device_id.clone()),
            EntityNode::Ip(tx.ip_address.clone()),
        ] {
            let idx = self.node(entity);
            self.graph.update_edge(user, idx, ());
        }
        if flagged {
            self.flagged.insert(tx.user_id.clone());
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }

    /// Users linked to the given identifier, sorted.
    pub fn users_sharing(&self, entity: &EntityNode) -> Vec<UserId> {
        let Some(&idx) = self.index.get(entity) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = self
            .graph
            .neighbors(idx)
            .filter_map(|n| match &self.graph[n] {
                EntityNode::User(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        users.sort();
        users
    }

    /// Components with at least `min_users` users, a shared identifier and
    /// a flagged user, largest first.
    pub fn detect_rings(&self, min_users: usize) -> Vec<FraudRing> {
        let mut components = UnionFind::<usize>::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            components.union(edge.source().index(), edge.target().index());
        }

        let mut users_by_root: BTreeMap<usize, BTreeSet<UserId>> = BTreeMap::new();
        let mut shared_by_root: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for idx in self.graph.node_indices() {
            let root = components.find(idx.index());
            match &self.graph[idx] {
                EntityNode::User(id) => {
                    users_by_root.entry(root).or_default().insert(id.clone());
                }
                entity => {
                    if self.graph.neighbors(idx).count() >= 2 {
                        shared_by_root.entry(root).or_default().insert(entity.to_string());
                    }
                }
            }
        }

        let mut rings: Vec<FraudRing> = users_by_root
            .into_iter()
            .filter(|(_, users)| users.len() >= min_users.max(2))
            .filter_map(|(root, users)| {
                let shared = shared_by_root.remove(&root)?;
                let flagged_users: Vec<UserId> = users
                    .iter()
                    .filter(|u| self.flagged.contains(*u))
                    .cloned()
                    .collect();
                if flagged_users.is_empty() {
                    return None;
                }
                Some(FraudRing {
                    ring_id: String::new(),
                    users: users.into_iter().collect(),
                    shared_identifiers: shared.into_iter().collect(),
                    flagged_users,
                })
            })
            .collect();

        rings.sort_by(|a, b| b.users.len().cmp(&a.users.len()).then_with(|| a.users.cmp(&b.users)));
        for (i, ring) in rings.iter_mut().enumerate() {
            ring.ring_id = format!("ring_{:03}", i + 1);
        }
        if !rings.is_empty() {
            log::info!("Detected {} candidate fraud rings", rings.len());
        }
        rings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::MerchantCategory;
    use chrono::Utc;

    fn tx(user: &str, card: &str, device: &str, ip: &str) -> Transaction {
        Transaction {
            transaction_id: format!("{user}-{card}-{device}"),
            user_id: user.to_string(),
            timestamp: Utc::now(),
            amount: 10.0,
            merchant_id: "merchant_0001".to_string(),
            merchant_category: MerchantCategory::Grocery,
            merchant_name: String::new(),
            card_last4: card.to_string(),
            device_id: device.to_string(),
            ip_address: ip.to_string(),
            location_lat: 0.0,
            location_lon: 0.0,
            is_fraud: false,
            fraud_type: None,
            fraudster_id: None,
        }
    }

    #[test]
    fn nodes_and_edges_are_deduplicated() {
        let mut g = RelationshipGraph::new();
        g.add_transaction(&tx("u1", "1111", "d1", "1.1.1.1"), false);
        g.add_transaction(&tx("u1", "1111", "d1", "1.1.1.1"), false);
        assert_eq!(g.node_count(), 4);
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn shared_card_forms_a_ring_with_flagged_user() {
        let mut g = RelationshipGraph::new();
        g.add_transaction(&tx("u1", "9999", "d1", "1.1.1.1"), false);
        g.add_transaction(&tx("u2", "9999", "d2", "2.2.2.2"), true);
        g.add_transaction(&tx("u3", "9999", "d3", "3.3.3.3"), false);
        // Unflagged pair sharing a device.
        g.add_transaction(&tx("u4", "4444", "shared", "4.4.4.4"), false);
        g.add_transaction(&tx("u5", "5555", "shared", "5.5.5.5"), false);
        // Loner.
        g.add_transaction(&tx("u6", "6666", "d6", "6.6.6.6"), true);

        let rings = g.detect_rings(2);
        assert_eq!(rings.len(), 1);
        let ring = &rings[0];
        assert_eq!(ring.ring_id, "ring_001");
        assert_eq!(ring.users, vec!["u1", "u2", "u3"]);
        assert_eq!(ring.shared_identifiers, vec!["card:9999"]);
        assert_eq!(ring.flagged_users, vec!["u2"]);

        assert!(g.detect_rings(4).is_empty());
        assert_eq!(
            g.users_sharing(&EntityNode::Device("shared".to_string())),
            vec!["u4", "u5"]
        );
        assert!(g.users_sharing(&EntityNode::Ip("0.0.0.0".to_string())).is_empty());
    }

    #[test]
    fn rings_sorted_by_size() {
        let mut g = RelationshipGraph::new();
        for u in ["a1", "a2"] {
            g.add_transaction(&tx(u, "1000", u, u), true);
        }
        for u in ["b1", "b2", "b3"] {
            g.add_transaction(&tx(u, "2000", u, u), true);
        }
        let rings = g.detect_rings(2);
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0].users.len(), 3);
        assert_eq!(rings[1].ring_id, "ring_002");
    }
}
