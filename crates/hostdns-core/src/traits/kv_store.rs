// # Key-Value Store Trait
//
// Defines the interface for reading and watching the hierarchical store that
// holds both the domain configuration and the live host addresses.
//
// ## Implementations
//
// - etcd v2 keys API: `hostdns-etcd` crate
//
// ## Usage
//
// ```rust,ignore
// use hostdns_core::KvStore;
// use tokio_stream::StreamExt;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let store = /* KvStore implementation */;
//
//     // Read a whole subtree
//     let tree = store.get("/hosts/").await?;
//
//     // Watch for changes after that read
//     let mut stream = store.watch("/hosts/", Some(tree.index()));
//     while let Some(change) = stream.next().await {
//         println!("changed: {:?}", change?);
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// Index of a node inside a [`KvTree`] arena
pub type NodeId = usize;

/// A single fetched node: either a directory or a leaf with a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvNode {
    /// Full key path of the node (e.g. `/services/www/1`)
    pub key: String,
    /// Leaf value, `None` for directories
    pub value: Option<String>,
    /// Whether this node is a directory
    pub dir: bool,
    children: Vec<NodeId>,
}

impl KvNode {
    /// Child node ids in store traversal order
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Result of a recursive read: all fetched nodes stored in one arena
///
/// The root node always has id `0`. Children are referenced by id, so the
/// tree can be walked with an explicit worklist instead of recursion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvTree {
    nodes: Vec<KvNode>,
    index: u64,
}

impl KvTree {
    /// Id of the root node
    pub const ROOT: NodeId = 0;

    /// Create a tree holding only a directory root
    pub fn dir(key: impl Into<String>) -> Self {
        Self::with_root(key.into(), None, true)
    }

    /// Create a tree whose root is a single leaf
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_root(key.into(), Some(value.into()), false)
    }

    fn with_root(key: String, value: Option<String>, dir: bool) -> Self {
        Self {
            nodes: vec![KvNode {
                key,
                value,
                dir,
                children: Vec::new(),
            }],
            index: 0,
        }
    }

    /// Set the store index at which this read was served
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    /// Append a directory under `parent`
    pub fn add_dir(&mut self, parent: NodeId, key: impl Into<String>) -> NodeId {
        self.push(parent, key.into(), None, true)
    }

    /// Append a leaf under `parent`
    pub fn add_leaf(
        &mut self,
        parent: NodeId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> NodeId {
        self.push(parent, key.into(), Some(value.into()), false)
    }

    fn push(&mut self, parent: NodeId, key: String, value: Option<String>, dir: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(KvNode {
            key,
            value,
            dir,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// The root node
    pub fn root(&self) -> &KvNode {
        &self.nodes[Self::ROOT]
    }

    /// Look up a node by id
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this tree.
    pub fn node(&self, id: NodeId) -> &KvNode {
        &self.nodes[id]
    }

    /// Iterate over the direct children of `node`
    pub fn children_of<'a>(&'a self, node: &'a KvNode) -> impl Iterator<Item = &'a KvNode> + 'a {
        node.children.iter().map(|&id| &self.nodes[id])
    }

    /// Store index at which the read was served (0 if unknown)
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Number of nodes in the arena
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a tree has at least its root
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    /// A key was written
    Set,
    /// A key or directory was removed
    Delete,
    /// Any other store action (expire, compare-and-swap, ...)
    Other(String),
}

impl ChangeAction {
    /// Map a store action name onto a change action
    pub fn from_name(name: &str) -> Self {
        match name {
            "set" => ChangeAction::Set,
            "delete" => ChangeAction::Delete,
            other => ChangeAction::Other(other.to_string()),
        }
    }
}

/// A single change observed by a store watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened
    pub action: ChangeAction,
    /// Key the change applies to
    pub key: String,
    /// New value (empty for deletions)
    pub value: String,
    /// Value before the change, if the store reported one
    pub previous_value: Option<String>,
}

impl ChangeEvent {
    /// A `set` of `key` to `value`
    pub fn set(key: impl Into<String>, value: impl Into<String>, previous: Option<String>) -> Self {
        Self {
            action: ChangeAction::Set,
            key: key.into(),
            value: value.into(),
            previous_value: previous,
        }
    }

    /// A `delete` of `key`
    pub fn delete(key: impl Into<String>, previous: Option<String>) -> Self {
        Self {
            action: ChangeAction::Delete,
            key: key.into(),
            value: String::new(),
            previous_value: previous,
        }
    }
}

/// Stream of watch results returned by [`KvStore::watch`]
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, crate::Error>> + Send + 'static>>;

/// Trait for watch-capable hierarchical key-value stores
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Responsibilities
///
/// Stores are **observers**: they fetch and report, they never decide
/// which domains a change affects or when DNS gets updated.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Recursively read the subtree rooted at `path`
    ///
    /// # Returns
    ///
    /// - `Ok(KvTree)`: The fetched subtree
    /// - `Err(Error::NotFound)`: `path` does not exist
    /// - `Err(Error)`: Any other read failure
    async fn get(&self, path: &str) -> Result<KvTree, crate::Error>;

    /// Recursively watch everything under `prefix`
    ///
    /// `after_index` resumes after a known store index (typically the index
    /// of a previous [`get`](KvStore::get)); `None` watches from now on.
    ///
    /// # Behavior
    ///
    /// - Each item is one change or one error
    /// - The stream ends after yielding an error
    /// - Dropping the stream cancels any in-flight request
    fn watch(&self, prefix: &str, after_index: Option<u64>) -> WatchStream;

    /// Get the store name (for logging/debugging)
    fn store_name(&self) -> &'static str;
}
