//! Rooted tree model shared by the distance and CCD layers.
//!
//! Nodes live in an arena (`Vec<Node>`) and refer to each other by index,
//! so parent back-references never create ownership cycles. The reader
//! produces these trees from parsed input; the CCD also materialises one
//! when reconstructing the maximum-probability topology.

/// Index of a node within its tree's arena.
pub type NodeId = usize;

/// Branch length assumed when the input carries none.
pub const DEFAULT_BRANCH_LENGTH: f64 = 1.0;

/// A single vertex of a rooted tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Taxon label; required on leaves (the reader falls back to the
    /// string-coerced id when the input has none).
    pub label: Option<String>,
    /// Length of the branch leading to this node from its parent.
    pub branch_length: Option<f64>,
    /// Distance to the furthest descendant leaf, in branch-length units.
    pub height: f64,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

/// A rooted tree over an arena of nodes.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// Creates a tree containing only a root node.
    pub fn with_root(label: Option<String>, branch_length: Option<f64>) -> Self {
        Tree {
            nodes: vec![Node {
                id: 0,
                label,
                branch_length,
                height: 0.0,
                children: Vec::new(),
                parent: None,
            }],
            root: 0,
        }
    }

    /// Appends a child under `parent` and returns its id.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        label: Option<String>,
        branch_length: Option<f64>,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            label,
            branch_length,
            height: 0.0,
            children: Vec::new(),
            parent: Some(parent),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].children.is_empty()
    }

    /// Branch length leading to `id`, defaulting to 1 when absent.
    pub fn branch_length_or_default(&self, id: NodeId) -> f64 {
        self.nodes[id].branch_length.unwrap_or(DEFAULT_BRANCH_LENGTH)
    }

    /// Leaf ids in left-to-right traversal order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                out.push(id);
            } else {
                // Push right-to-left so the left child pops first
                for &child in node.children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Node ids in postorder: every child precedes its parent.
    pub fn postorder(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded || self.nodes[id].children.is_empty() {
                out.push(id);
            } else {
                stack.push((id, true));
                for &child in self.nodes[id].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        out
    }

    /// Label of a leaf, falling back to the string-coerced node id.
    pub fn leaf_label(&self, id: NodeId) -> String {
        match &self.nodes[id].label {
            Some(label) => label.clone(),
            None => id.to_string(),
        }
    }

    /// Labels of all leaves in left-to-right order.
    pub fn tip_labels(&self) -> Vec<String> {
        self.leaves().iter().map(|&id| self.leaf_label(id)).collect()
    }

    /// Recomputes every node's height bottom-up.
    ///
    /// Leaf height is 0; an internal node sits at the maximum of
    /// (child height + child branch length) over its children, so heights
    /// on ultrametric input match the node ages of the source sample.
    pub fn compute_heights(&mut self) {
        for id in self.postorder() {
            let height = if self.nodes[id].children.is_empty() {
                0.0
            } else {
                self.nodes[id]
                    .children
                    .clone()
                    .into_iter()
                    .map(|c| self.nodes[c].height + self.branch_length_or_default(c))
                    .fold(f64::NEG_INFINITY, f64::max)
            };
            self.nodes[id].height = height;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ((A:1,B:2):1,C:4);
    fn cherry_plus_outgroup() -> Tree {
        let mut tree = Tree::with_root(None, None);
        let inner = tree.add_child(0, None, Some(1.0));
        tree.add_child(inner, Some("A".into()), Some(1.0));
        tree.add_child(inner, Some("B".into()), Some(2.0));
        tree.add_child(0, Some("C".into()), Some(4.0));
        tree.compute_heights();
        tree
    }

    #[test]
    fn test_leaves_in_traversal_order() {
        let tree = cherry_plus_outgroup();
        assert_eq!(tree.tip_labels(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_postorder_children_first() {
        let tree = cherry_plus_outgroup();
        let order = tree.postorder();
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        for id in 0..tree.len() {
            for &child in &tree.node(id).children {
                assert!(pos(child) < pos(id));
            }
        }
        assert_eq!(*order.last().unwrap(), tree.root());
    }

    #[test]
    fn test_heights() {
        let tree = cherry_plus_outgroup();
        // Inner node: max(0+1, 0+2) = 2; root: max(2+1, 0+4) = 4
        let inner = tree.node(tree.root()).children[0];
        assert_eq!(tree.node(inner).height, 2.0);
        assert_eq!(tree.node(tree.root()).height, 4.0);
    }

    #[test]
    fn test_missing_branch_length_defaults_to_one() {
        let mut tree = Tree::with_root(None, None);
        let a = tree.add_child(0, Some("A".into()), None);
        tree.add_child(0, Some("B".into()), Some(0.5));
        tree.compute_heights();
        assert_eq!(tree.branch_length_or_default(a), 1.0);
        assert_eq!(tree.node(tree.root()).height, 1.0);
    }

    #[test]
    fn test_unlabeled_leaf_coerces_id() {
        let mut tree = Tree::with_root(None, None);
        let a = tree.add_child(0, None, None);
        tree.add_child(0, Some("B".into()), None);
        assert_eq!(tree.leaf_label(a), a.to_string());
    }
}
