use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use super::hash::{unsalted_hash64, Xxh3Hash64};

/// A single cache host. Identity is derived once at construction and never
/// changes for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    id: String,
    port: u16,
    identity_string: String,
    identity_hash: u64,
}

impl Node {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        let identity_string = format!("{id}:{port}");
        let identity_hash = unsalted_hash64(identity_string.as_bytes());
        Self {
            id,
            port,
            identity_string,
            identity_hash,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Canonical `id:port` identity string.
    pub fn identity(&self) -> &str {
        &self.identity_string
    }

    pub(crate) fn identity_hash(&self) -> u64 {
        self.identity_hash
    }
}

/// Deterministic key-to-host ranking via rendezvous (highest random weight)
/// hashing. Every client that agrees on the salt and the node set agrees on
/// the ranking, with no coordination.
///
/// The node set lives behind an atomically swapped immutable snapshot:
/// `get_nodes` clones the `Arc` and scores against it, so a concurrent
/// `set_nodes` never blocks readers beyond the pointer exchange.
pub struct RendezvousRouter {
    nodes: RwLock<Arc<[Node]>>,
    hasher: Xxh3Hash64,
}

impl RendezvousRouter {
    pub fn new(nodes: &[Node], hasher: Xxh3Hash64) -> Self {
        Self {
            nodes: RwLock::new(nodes.into()),
            hasher,
        }
    }

    pub fn with_salt(nodes: &[Node], salt: &[u8]) -> Self {
        Self::new(nodes, Xxh3Hash64::with_salt(salt))
    }

    /// Replace the node set. The slice is copied into a fresh snapshot;
    /// in-flight rankings keep using the one they started with.
    pub fn set_nodes(&self, nodes: &[Node]) {
        *self.nodes.write() = nodes.into();
    }

    /// Up to `k` nodes for `key`, best first. Scores are
    /// `hash(key || identity_hash_le)`; ties break on the identity string so
    /// the ordering is a pure function of the key, salt and node set.
    pub fn get_nodes(&self, key: &[u8], k: usize) -> Vec<Node> {
        let snapshot = self.nodes.read().clone();
        if snapshot.is_empty() || k == 0 {
            return Vec::new();
        }

        // One scratch buffer per call: the key bytes plus the 8-byte
        // little-endian identity hash, rewritten for each node.
        let mut combined = Vec::with_capacity(key.len() + 8);
        combined.extend_from_slice(key);
        combined.extend_from_slice(&[0u8; 8]);

        let mut score_of = |node: &Node| -> u64 {
            combined[key.len()..].copy_from_slice(&node.identity_hash().to_le_bytes());
            self.hasher.hash64(&combined)
        };

        // Single pass for the common k=1 case.
        if k == 1 {
            let mut best = (score_of(&snapshot[0]), &snapshot[0]);
            for node in &snapshot[1..] {
                let scored = (score_of(node), node);
                if ranks_before(scored, best) {
                    best = scored;
                }
            }
            return vec![best.1.clone()];
        }

        // Single pass keeping the best two for the default replica count.
        if k == 2 {
            let mut first = (score_of(&snapshot[0]), &snapshot[0]);
            let mut second: Option<(u64, &Node)> = None;

            for node in &snapshot[1..] {
                let scored = (score_of(node), node);
                if ranks_before(scored, first) {
                    second = Some(first);
                    first = scored;
                } else if second.map_or(true, |current| ranks_before(scored, current)) {
                    second = Some(scored);
                }
            }

            return match second {
                Some(second) => vec![first.1.clone(), second.1.clone()],
                None => vec![first.1.clone()],
            };
        }

        let mut scored: Vec<(u64, &Node)> =
            snapshot.iter().map(|node| (score_of(node), node)).collect();
        scored.sort_unstable_by(|a, b| rank_order(*a, *b));
        scored.truncate(k.min(scored.len()));
        scored.into_iter().map(|(_, node)| node.clone()).collect()
    }
}

/// `true` if `a` outranks `b`: higher score, identity string as tiebreak.
fn ranks_before(a: (u64, &Node), b: (u64, &Node)) -> bool {
    rank_order(a, b) == Ordering::Less
}

fn rank_order(a: (u64, &Node), b: (u64, &Node)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| a.1.identity().cmp(b.1.identity()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Vec<Node> {
        vec![Node::new("a", 1), Node::new("b", 2), Node::new("c", 3)]
    }

    fn identities(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|node| node.identity()).collect()
    }

    #[test]
    fn node_identity_is_precomputed() {
        let node = Node::new("host", 4711);
        assert_eq!(node.identity(), "host:4711");
        assert_eq!(
            node.identity_hash(),
            unsalted_hash64(b"host:4711"),
        );
    }

    #[test]
    fn ranking_is_deterministic() {
        let router = RendezvousRouter::with_salt(&three_nodes(), b"s");
        let first = router.get_nodes(b"user:100", 3);
        let second = router.get_nodes(b"user:100", 3);
        assert_eq!(identities(&first), identities(&second));
    }

    #[test]
    fn ranking_ignores_node_insertion_order() {
        let forward = three_nodes();
        let reversed: Vec<Node> = forward.iter().rev().cloned().collect();

        let router_a = RendezvousRouter::with_salt(&forward, b"s");
        let router_b = RendezvousRouter::with_salt(&reversed, b"s");

        let ranked_a = router_a.get_nodes(b"user:100", 3);
        let ranked_b = router_b.get_nodes(b"user:100", 3);
        assert_eq!(identities(&ranked_a), identities(&ranked_b));
    }

    #[test]
    fn smaller_k_is_a_prefix_of_larger_k() {
        let nodes: Vec<Node> = (0..8).map(|n| Node::new(format!("n{n}"), 7000)).collect();
        let router = RendezvousRouter::with_salt(&nodes, b"salt");

        for key in [b"alpha".as_slice(), b"beta", b"user:42", b"x/y/z"] {
            let full = router.get_nodes(key, nodes.len());
            for k in 1..nodes.len() {
                let partial = router.get_nodes(key, k);
                assert_eq!(identities(&partial), identities(&full[..k]), "k={k}");
            }
        }
    }

    #[test]
    fn results_contain_no_duplicates() {
        let nodes: Vec<Node> = (0..6).map(|n| Node::new(format!("n{n}"), 7000)).collect();
        let router = RendezvousRouter::with_salt(&nodes, b"salt");

        let ranked = router.get_nodes(b"key", nodes.len());
        let mut seen: Vec<&str> = identities(&ranked);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), nodes.len());
    }

    #[test]
    fn k_larger_than_node_count_returns_all() {
        let router = RendezvousRouter::with_salt(&three_nodes(), b"s");
        assert_eq!(router.get_nodes(b"key", 10).len(), 3);
    }

    #[test]
    fn zero_k_or_empty_node_set_is_empty() {
        let router = RendezvousRouter::with_salt(&three_nodes(), b"s");
        assert!(router.get_nodes(b"key", 0).is_empty());

        let empty = RendezvousRouter::with_salt(&[], b"s");
        assert!(empty.get_nodes(b"key", 2).is_empty());
    }

    #[test]
    fn different_salts_change_some_ranking() {
        let nodes: Vec<Node> = (0..5).map(|n| Node::new(format!("n{n}"), 7000)).collect();
        let salted = RendezvousRouter::with_salt(&nodes, b"one");
        let resalted = RendezvousRouter::with_salt(&nodes, b"two");

        let diverged = (0..64).any(|n| {
            let key = format!("key-{n}");
            identities(&salted.get_nodes(key.as_bytes(), 5))
                != identities(&resalted.get_nodes(key.as_bytes(), 5))
        });
        assert!(diverged, "re-salting should change at least one ranking");
    }

    #[test]
    fn set_nodes_swaps_the_whole_set() {
        let router = RendezvousRouter::with_salt(&three_nodes(), b"s");
        router.set_nodes(&[Node::new("x", 9)]);

        let ranked = router.get_nodes(b"key", 3);
        assert_eq!(identities(&ranked), vec!["x:9"]);
    }

    #[test]
    fn set_nodes_copies_the_input() {
        let mut nodes = three_nodes();
        let router = RendezvousRouter::with_salt(&nodes, b"s");
        let before = identities(&router.get_nodes(b"key", 3))
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();

        // Mutating the caller's vector must not affect the router.
        nodes.clear();
        let after = identities(&router.get_nodes(b"key", 3))
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn keys_spread_across_nodes() {
        let nodes: Vec<Node> = (0..4).map(|n| Node::new(format!("n{n}"), 7000)).collect();
        let router = RendezvousRouter::with_salt(&nodes, b"spread");

        let mut primaries: Vec<String> = (0..100)
            .map(|n| {
                let key = format!("key-{n}");
                router.get_nodes(key.as_bytes(), 1)[0].identity().to_string()
            })
            .collect();
        primaries.sort_unstable();
        primaries.dedup();
        assert!(
            primaries.len() > 1,
            "100 keys should not all land on one node"
        );
    }
}
