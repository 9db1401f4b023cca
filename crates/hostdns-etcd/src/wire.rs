//! etcd v2 keys API response bodies

use hostdns_core::traits::{ChangeAction, ChangeEvent, KvTree, NodeId};
use serde::Deserialize;

/// `errorCode` for a missing key
pub const KEY_NOT_FOUND: u64 = 100;

/// `errorCode` for a `waitIndex` that fell out of the event history
pub const EVENT_INDEX_CLEARED: u64 = 401;

/// Successful response to a get or a watch
#[derive(Debug, Deserialize)]
pub struct KeysResponse {
    pub action: String,
    pub node: Node,
    #[serde(rename = "prevNode", default)]
    pub prev_node: Option<Node>,
}

/// One node of a response, with its children for recursive reads
#[derive(Debug, Deserialize)]
pub struct Node {
    /// Absent on the root of the keyspace
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(rename = "modifiedIndex", default)]
    pub modified_index: u64,
}

/// Error body returned with any non-2xx status
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "errorCode")]
    pub error_code: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: u64,
}

impl Node {
    /// Flatten a recursive node into an arena tree
    pub fn into_tree(self, index: u64) -> KvTree {
        let Node {
            key,
            value,
            dir,
            nodes,
            ..
        } = self;
        let key = if key.is_empty() { "/".to_string() } else { key };

        let mut tree = if dir {
            KvTree::dir(key)
        } else {
            KvTree::leaf(key, value.unwrap_or_default())
        }
        .with_index(index);

        let mut pending: Vec<(NodeId, Vec<Node>)> = vec![(KvTree::ROOT, nodes)];
        while let Some((parent, children)) = pending.pop() {
            for child in children {
                let id = if child.dir {
                    tree.add_dir(parent, child.key)
                } else {
                    tree.add_leaf(parent, child.key, child.value.unwrap_or_default())
                };
                if !child.nodes.is_empty() {
                    pending.push((id, child.nodes));
                }
            }
        }

        tree
    }
}

impl KeysResponse {
    /// Convert a watch response into a change and the next `waitIndex`
    pub fn into_change(self) -> (ChangeEvent, u64) {
        let next_index = self.node.modified_index + 1;
        let event = ChangeEvent {
            action: ChangeAction::from_name(&self.action),
            key: self.node.key,
            value: self.node.value.unwrap_or_default(),
            previous_value: self.prev_node.and_then(|node| node.value),
        };
        (event, next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_get_flattens_in_order() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/hosts",
                "dir": true,
                "nodes": [
                    {
                        "key": "/hosts/Z1",
                        "dir": true,
                        "nodes": [
                            {"key": "/hosts/Z1/www.example.com", "value": "/services/www/*", "modifiedIndex": 4},
                            {"key": "/hosts/Z1/api.example.com", "value": "/services/api/*", "modifiedIndex": 5}
                        ],
                        "modifiedIndex": 3
                    },
                    {"key": "/hosts/Z2", "dir": true, "modifiedIndex": 6}
                ],
                "modifiedIndex": 2
            }
        }"#;

        let response: KeysResponse = serde_json::from_str(body).unwrap();
        let tree = response.node.into_tree(42);

        assert_eq!(tree.index(), 42);
        assert_eq!(tree.len(), 5);
        assert!(tree.root().dir);

        let zones: Vec<_> = tree.children_of(tree.root()).map(|n| n.key.as_str()).collect();
        assert_eq!(zones, vec!["/hosts/Z1", "/hosts/Z2"]);

        let z1 = tree.children_of(tree.root()).next().unwrap();
        let domains: Vec<_> = tree
            .children_of(z1)
            .map(|n| (n.key.as_str(), n.value.as_deref()))
            .collect();
        assert_eq!(
            domains,
            vec![
                ("/hosts/Z1/www.example.com", Some("/services/www/*")),
                ("/hosts/Z1/api.example.com", Some("/services/api/*")),
            ]
        );
    }

    #[test]
    fn test_keyspace_root_and_single_leaf() {
        let root: KeysResponse =
            serde_json::from_str(r#"{"action":"get","node":{"dir":true}}"#).unwrap();
        assert_eq!(root.node.into_tree(1).root().key, "/");

        let leaf: KeysResponse = serde_json::from_str(
            r#"{"action":"get","node":{"key":"/services/db/primary","value":"10.0.1.1","modifiedIndex":9}}"#,
        )
        .unwrap();
        let tree = leaf.node.into_tree(9);
        assert!(!tree.root().dir);
        assert_eq!(tree.root().value.as_deref(), Some("10.0.1.1"));
    }

    #[test]
    fn test_watch_set_with_previous_value() {
        let body = r#"{
            "action": "set",
            "node": {"key": "/services/www/1", "value": "10.0.0.2", "modifiedIndex": 17},
            "prevNode": {"key": "/services/www/1", "value": "10.0.0.1", "modifiedIndex": 12}
        }"#;

        let response: KeysResponse = serde_json::from_str(body).unwrap();
        let (event, next_index) = response.into_change();

        assert_eq!(next_index, 18);
        assert_eq!(
            event,
            ChangeEvent::set("/services/www/1", "10.0.0.2", Some("10.0.0.1".to_string()))
        );
    }

    #[test]
    fn test_watch_actions() {
        let delete: KeysResponse = serde_json::from_str(
            r#"{"action":"delete","node":{"key":"/services/www","dir":true,"modifiedIndex":20}}"#,
        )
        .unwrap();
        let (event, _) = delete.into_change();
        assert_eq!(event, ChangeEvent::delete("/services/www", None));

        let expire: KeysResponse = serde_json::from_str(
            r#"{"action":"expire","node":{"key":"/services/www/1","modifiedIndex":21}}"#,
        )
        .unwrap();
        let (event, _) = expire.into_change();
        assert_eq!(event.action, ChangeAction::Other("expire".to_string()));

        let cas: KeysResponse = serde_json::from_str(
            r#"{"action":"compareAndSwap","node":{"key":"/k","value":"v","modifiedIndex":22}}"#,
        )
        .unwrap();
        let (event, _) = cas.into_change();
        assert_eq!(event.action, ChangeAction::Other("compareAndSwap".to_string()));
    }

    #[test]
    fn test_error_body() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"errorCode":100,"message":"Key not found","cause":"/hosts","index":31}"#,
        )
        .unwrap();
        assert_eq!(body.error_code, KEY_NOT_FOUND);
        assert_eq!(body.cause, "/hosts");
        assert_eq!(body.index, 31);
    }
}
