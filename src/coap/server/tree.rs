//! Fail-closed resource tree
//!
//! A trie keyed by path segment. Handlers may only be registered directly
//! beneath a node that already exists; intermediate nodes are never created
//! implicitly by registration.

use super::handlers::ResourceHandler;
use crate::coap::Link;
use crate::common::resource::PATH_SEPARATOR;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Resource path is empty")]
    EmptyPath,
    #[error("Cannot register {path}: ancestor {missing} does not exist")]
    MissingAncestor { path: String, missing: String },
    #[error("Cannot register resources while the server is running")]
    ServerRunning,
}

#[derive(Default)]
struct ResourceNode {
    children: BTreeMap<String, ResourceNode>,
    handler: Option<Arc<dyn ResourceHandler>>,
}

/// Hierarchical resource registry
#[derive(Default)]
pub struct ResourceTree {
    root: ResourceNode,
}

fn segments(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect()
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every node along `path` without attaching a handler.
    ///
    /// Used only to seed the well-known resource containers.
    pub fn add_container(&mut self, path: &str) {
        let mut node = &mut self.root;
        for segment in segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    /// Attach `handler` at `path`.
    ///
    /// Every ancestor of `path` must already exist. The leaf node is created
    /// if needed; an existing handler at the leaf is replaced and returned.
    pub fn register(
        &mut self,
        path: &str,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<Option<Arc<dyn ResourceHandler>>, RegistrationError> {
        let parts = segments(path);
        let Some((leaf, ancestors)) = parts.split_last() else {
            return Err(RegistrationError::EmptyPath);
        };

        let mut node = &mut self.root;
        for (depth, segment) in ancestors.iter().enumerate() {
            node = match node.children.get_mut(*segment) {
                Some(child) => child,
                None => {
                    return Err(RegistrationError::MissingAncestor {
                        path: parts.join("/"),
                        missing: parts[..=depth].join("/"),
                    })
                }
            };
        }

        let leaf = node.children.entry((*leaf).to_string()).or_default();
        Ok(leaf.handler.replace(handler))
    }

    /// Handler registered exactly at `path`
    pub fn lookup(&self, path: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.node(path).and_then(|node| node.handler.clone())
    }

    /// True when a node (container or handler) exists at `path`
    pub fn contains(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    fn node(&self, path: &str) -> Option<&ResourceNode> {
        let mut node = &self.root;
        for segment in segments(path) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Every path carrying a handler, depth-first in segment order
    pub fn links(&self) -> Vec<Link> {
        let mut links = Vec::new();
        collect_links(&self.root, &mut Vec::new(), &mut links);
        links
    }

    /// Every path carrying an observable handler, with that handler
    pub fn observable_handlers(&self) -> Vec<(String, Arc<dyn ResourceHandler>)> {
        self.links()
            .into_iter()
            .filter(|link| link.observable)
            .filter_map(|link| self.lookup(&link.path).map(|handler| (link.path, handler)))
            .collect()
    }
}

fn collect_links<'a>(node: &'a ResourceNode, prefix: &mut Vec<&'a str>, out: &mut Vec<Link>) {
    if let Some(handler) = &node.handler {
        out.push(Link {
            path: prefix.join("/"),
            observable: handler.is_observable(),
        });
    }
    for (segment, child) in &node.children {
        prefix.push(segment);
        collect_links(child, prefix, out);
        prefix.pop();
    }
}
