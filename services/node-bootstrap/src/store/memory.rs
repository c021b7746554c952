//! In-memory cluster store for testing and development.
//!
//! Behaves like the API server where the orchestrator can observe it:
//! label-selector listing, resourceVersion preconditions on replace, and
//! annotations that some other controller writes "later" (after a number of
//! reads of the node).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::debug;

use super::{ClusterStore, StoreError};

/// An annotation that appears once a node has been read enough times.
#[derive(Debug, Clone)]
struct ScheduledAnnotation {
    node: String,
    key: String,
    value: String,
    /// Number of reads that must not see the annotation.
    hidden_reads: u32,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    scheduled: Vec<ScheduledAnnotation>,
    reads: HashMap<String, u32>,
    internal_url: Option<String>,
}

/// In-memory [`ClusterStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,

    /// Source of resourceVersions.
    version_counter: AtomicU64,

    /// Number of upcoming list calls that fail.
    failing_lists: AtomicU32,

    /// Number of upcoming replace calls that report a conflict.
    conflicting_replaces: AtomicU32,

    /// Calls made to read the infrastructure descriptor.
    infrastructure_reads: AtomicU32,

    /// Replace calls that were accepted.
    replaces: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API server internal URL reported by the infrastructure
    /// descriptor.
    pub fn with_internal_url(self, url: impl Into<String>) -> Self {
        self.lock().internal_url = Some(url.into());
        self
    }

    /// Insert or overwrite a node, assigning it a fresh resourceVersion.
    pub fn insert_node(&self, mut node: Node) {
        node.metadata.resource_version = Some(self.next_version());
        let name = node.name_any();
        self.lock().nodes.insert(name, node);
    }

    /// Mutate a stored node as another cluster actor would, bumping its
    /// resourceVersion.
    pub fn modify_node(&self, name: &str, f: impl FnOnce(&mut Node)) {
        let version = self.next_version();
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(name) {
            f(node);
            node.metadata.resource_version = Some(version);
        }
    }

    /// Make `key=value` appear on node `name` after `hidden_reads` reads of
    /// that node have returned without it.
    pub fn schedule_annotation(
        &self,
        name: &str,
        key: &str,
        value: &str,
        hidden_reads: u32,
    ) {
        self.lock().scheduled.push(ScheduledAnnotation {
            node: name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            hidden_reads,
        });
    }

    /// Fail the next `count` list calls.
    pub fn fail_next_lists(&self, count: u32) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` replace calls with a conflict.
    pub fn conflict_next_replaces(&self, count: u32) {
        self.conflicting_replaces.store(count, Ordering::SeqCst);
    }

    /// Snapshot of a stored node.
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    /// Number of times the infrastructure descriptor was read.
    pub fn infrastructure_reads(&self) -> u32 {
        self.infrastructure_reads.load(Ordering::SeqCst)
    }

    /// Number of reads of node `name` so far.
    pub fn node_reads(&self, name: &str) -> u32 {
        self.lock().reads.get(name).copied().unwrap_or(0)
    }

    /// Number of accepted replace calls.
    pub fn replace_count(&self) -> u32 {
        self.replaces.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_version(&self) -> String {
        (self.version_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Consume one unit of an injected fault counter.
    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Match a node's labels against a comma-separated list of `key=value`,
/// `key!=value` or bare `key` requirements.
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|req| !req.is_empty())
        .all(|req| {
            if let Some((key, value)) = req.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = req.split_once('=') {
                let value = value.trim_start_matches('=');
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else {
                labels.contains_key(req)
            }
        })
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, StoreError> {
        if Self::take_fault(&self.failing_lists) {
            return Err(StoreError::Api("injected list failure".to_string()));
        }

        let state = self.lock();
        let nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| matches_selector(node.labels(), label_selector))
            .cloned()
            .collect();
        debug!(selector = label_selector, count = nodes.len(), "[MEMORY] Listed nodes");
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        let version = self.next_version();
        let mut state = self.lock();
        let State {
            nodes,
            scheduled,
            reads,
            ..
        } = &mut *state;

        let Some(node) = nodes.get_mut(name) else {
            return Err(StoreError::NotFound {
                kind: "Node",
                name: name.to_string(),
            });
        };

        let read = reads.entry(name.to_string()).or_insert(0);
        *read += 1;

        let mut changed = false;
        scheduled.retain(|s| {
            if s.node == name && *read > s.hidden_reads {
                node.annotations_mut().insert(s.key.clone(), s.value.clone());
                changed = true;
                false
            } else {
                true
            }
        });
        if changed {
            node.metadata.resource_version = Some(version);
        }

        Ok(node.clone())
    }

    async fn replace_node(&self, node: &Node) -> Result<Node, StoreError> {
        let name = node.name_any();

        if Self::take_fault(&self.conflicting_replaces) {
            return Err(StoreError::Conflict {
                kind: "Node",
                name,
                message: "injected conflict".to_string(),
            });
        }

        let version = self.next_version();
        let mut state = self.lock();
        let Some(current) = state.nodes.get_mut(&name) else {
            return Err(StoreError::NotFound { kind: "Node", name });
        };

        if current.metadata.resource_version != node.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "Node",
                message: format!(
                    "resourceVersion {:?} is stale (current {:?})",
                    node.metadata.resource_version, current.metadata.resource_version
                ),
                name,
            });
        }

        let mut updated = node.clone();
        updated.metadata.resource_version = Some(version);
        *current = updated.clone();
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn api_server_internal_url(&self) -> Result<Option<String>, StoreError> {
        self.infrastructure_reads.fetch_add(1, Ordering::SeqCst);
        // Let concurrent callers interleave like they would on a real request.
        tokio::task::yield_now().await;
        Ok(self.lock().internal_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_matching() {
        let labels: BTreeMap<String, String> = [
            ("node.openshift.io/os_id".to_string(), "Windows".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]
        .into_iter()
        .collect();

        assert!(matches_selector(&labels, "node.openshift.io/os_id=Windows"));
        assert!(matches_selector(&labels, "node.openshift.io/os_id==Windows"));
        assert!(matches_selector(&labels, "zone"));
        assert!(matches_selector(&labels, "zone=a,node.openshift.io/os_id"));
        assert!(matches_selector(&labels, "zone!=b"));
        assert!(!matches_selector(&labels, "zone=b"));
        assert!(!matches_selector(&labels, "missing"));
        assert!(matches_selector(&labels, ""));
    }

    #[tokio::test]
    async fn test_list_filters_by_label() {
        let store = MemoryStore::new();
        store.insert_node(node("win-1", &[("os", "windows")]));
        store.insert_node(node("linux-1", &[("os", "linux")]));

        let nodes = store.list_nodes("os=windows").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name_any(), "win-1");
    }

    #[tokio::test]
    async fn test_scheduled_annotation_appears_after_hidden_reads() {
        let store = MemoryStore::new();
        store.insert_node(node("n1", &[]));
        store.schedule_annotation("n1", "k", "v", 2);

        for _ in 0..2 {
            let n = store.get_node("n1").await.unwrap();
            assert!(!n.annotations().contains_key("k"));
        }
        let n = store.get_node("n1").await.unwrap();
        assert_eq!(n.annotations().get("k").map(String::as_str), Some("v"));
        assert_eq!(store.node_reads("n1"), 3);
    }

    #[tokio::test]
    async fn test_replace_enforces_resource_version() {
        let store = MemoryStore::new();
        store.insert_node(node("n1", &[]));

        let stale = store.get_node("n1").await.unwrap();
        store.modify_node("n1", |n| {
            n.labels_mut().insert("touched".to_string(), "yes".to_string());
        });

        let err = store.replace_node(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.get_node("n1").await.unwrap();
        let committed = store.replace_node(&fresh).await.unwrap();
        assert_ne!(
            committed.metadata.resource_version,
            fresh.metadata.resource_version
        );
        assert_eq!(store.replace_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_lists(1);
        assert!(store.list_nodes("").await.is_err());
        assert!(store.list_nodes("").await.is_ok());
    }
}
