use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    Api, Client, ResourceExt,
    runtime::{WatchStreamExt, watcher},
};
use owo_colors::OwoColorize;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::util::Error;

/// Process-wide `image -> set<node>` advisor fed by the node watch. Purely
/// advisory: its output only ever becomes *preferred* node affinity, so the
/// cluster scheduler keeps final authority.
#[derive(Default)]
pub struct ImageLocality {
    by_image: RwLock<HashMap<String, BTreeSet<String>>>,
    known_nodes: RwLock<BTreeSet<String>>,
}

impl ImageLocality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every image the node currently reports. Insert-only; stale
    /// images age out when the node is deleted.
    pub fn observe_node(&self, node: &str, images: impl IntoIterator<Item = String>) {
        let mut by_image = self.by_image.write().unwrap_or_else(|e| e.into_inner());
        for image in images {
            by_image.entry(image).or_default().insert(node.to_string());
        }
        self.known_nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.to_string());
    }

    pub fn forget_node(&self, node: &str) {
        let mut by_image = self.by_image.write().unwrap_or_else(|e| e.into_inner());
        by_image.retain(|_, nodes| {
            nodes.remove(node);
            !nodes.is_empty()
        });
        self.known_nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node);
    }

    pub fn clear(&self) {
        self.by_image
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.known_nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Rendezvous (HRW) selection: top-`k` nodes by `-ln(h / MAX)` over the
    /// candidates that hold `image`, falling back to every known node. Ties
    /// break by node name so the result is stable under equal scores.
    pub fn top_k(&self, image: &str, k: usize) -> Vec<String> {
        if k == 0 {
            return Vec::new();
        }
        let candidates: Vec<String> = {
            let by_image = self.by_image.read().unwrap_or_else(|e| e.into_inner());
            match by_image.get(image) {
                Some(nodes) if !nodes.is_empty() => nodes.iter().cloned().collect(),
                _ => self
                    .known_nodes
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect(),
            }
        };
        let mut scored: Vec<(f64, String)> = candidates
            .into_iter()
            .map(|node| (rendezvous_score(image, &node), node))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.into_iter().take(k).map(|(_, node)| node).collect()
    }
}

/// `-ln(uniformHash(image || node) / MAX)`, strictly positive.
fn rendezvous_score(image: &str, node: &str) -> f64 {
    let h = uniform_hash(image, node);
    let normalized = (h as f64 + 1.0) / (u64::MAX as f64 + 1.0);
    -normalized.ln()
}

fn uniform_hash(image: &str, node: &str) -> u64 {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    hasher.update([0u8]);
    hasher.update(node.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// `⌈replicas × spreadFactor⌉`, at least 1.
pub fn spread_count(replicas: i32, spread_factor: f64) -> usize {
    let replicas = replicas.max(0) as f64;
    ((replicas * spread_factor).ceil() as usize).max(1)
}

/// Feeds the locality map from node events until shutdown.
pub async fn run_node_watch(
    client: Client,
    locality: std::sync::Arc<ImageLocality>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    println!("{}", "🗺️ Starting node image watch...".green());
    let nodes: Api<Node> = Api::all(client);
    let mut stream = watcher(nodes, watcher::Config::default())
        .default_backoff()
        .boxed();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Init)) => locality.clear(),
            Some(Ok(watcher::Event::InitApply(node) | watcher::Event::Apply(node))) => {
                locality.observe_node(&node.name_any(), reported_images(&node));
            }
            Some(Ok(watcher::Event::InitDone)) => {}
            Some(Ok(watcher::Event::Delete(node))) => locality.forget_node(&node.name_any()),
            Some(Err(e)) => eprintln!("{}", format!("node watch error: {e}").red()),
            None => break Ok(()),
        }
    }
}

fn reported_images(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.images.as_ref())
        .map(|images| {
            images
                .iter()
                .flat_map(|img| img.names.clone().unwrap_or_default())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> ImageLocality {
        let locality = ImageLocality::new();
        locality.observe_node("node-a", vec!["py:3".to_string(), "rust:1".to_string()]);
        locality.observe_node("node-b", vec!["py:3".to_string()]);
        locality.observe_node("node-c", vec!["go:1".to_string()]);
        locality
    }

    #[test]
    fn top_k_only_returns_holders() {
        let locality = populated();
        let mut top = locality.top_k("py:3", 5);
        top.sort();
        assert_eq!(top, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    #[test]
    fn selection_is_deterministic() {
        let locality = populated();
        assert_eq!(locality.top_k("py:3", 1), locality.top_k("py:3", 1));
        assert_eq!(locality.top_k("py:3", 2), locality.top_k("py:3", 2));
    }

    #[test]
    fn unknown_image_falls_back_to_all_nodes() {
        let locality = populated();
        let top = locality.top_k("never-pulled:latest", 10);
        assert_eq!(top.len(), 3);
    }

    #[test]
    fn deleted_node_stops_being_advised() {
        let locality = populated();
        locality.forget_node("node-a");
        assert_eq!(locality.top_k("py:3", 5), vec!["node-b".to_string()]);
        assert_eq!(locality.top_k("rust:1", 5).len(), 2, "fallback after last holder left");
    }

    #[test]
    fn scores_are_positive_and_distinct_per_node() {
        let a = rendezvous_score("py:3", "node-a");
        let b = rendezvous_score("py:3", "node-b");
        assert!(a > 0.0 && b > 0.0);
        assert_ne!(a, b);
    }

    #[test]
    fn spread_count_bounds() {
        assert_eq!(spread_count(0, 0.5), 1);
        assert_eq!(spread_count(1, 0.5), 1);
        assert_eq!(spread_count(3, 0.5), 2);
        assert_eq!(spread_count(10, 1.0), 10);
        assert_eq!(spread_count(-2, 0.7), 1);
    }

    #[test]
    fn zero_k_yields_nothing() {
        assert!(populated().top_k("py:3", 0).is_empty());
    }
}
