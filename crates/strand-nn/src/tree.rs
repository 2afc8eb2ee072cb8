// Tree — nested parameters and state
//
// Layers do not own their weights. `init` returns them as a Tree that mirrors
// the layer structure: a combinator's tree is a Node with one child per
// sublayer, a Dense layer's tree is Node([Leaf(w), Leaf(b)]), a parameter-free
// layer's tree is the empty Node([]).
//
// Gradient code flattens a tree to its leaves (depth-first, left to right),
// differentiates with respect to the flat list, then rebuilds a tree of the
// same structure with `unflatten_like`.

use strand_core::backend::Backend;
use strand_core::{Error, Result, Tensor};

/// Nested container of tensors used for both parameters and state.
#[derive(Debug, Clone)]
pub enum Tree<B: Backend> {
    Leaf(Tensor<B>),
    Node(Vec<Tree<B>>),
}

impl<B: Backend> Default for Tree<B> {
    fn default() -> Self {
        Tree::empty()
    }
}

impl<B: Backend> From<Tensor<B>> for Tree<B> {
    fn from(t: Tensor<B>) -> Self {
        Tree::Leaf(t)
    }
}

impl<B: Backend> From<Vec<Tree<B>>> for Tree<B> {
    fn from(children: Vec<Tree<B>>) -> Self {
        Tree::Node(children)
    }
}

impl<B: Backend> Tree<B> {
    /// The empty tree, `Node([])`.
    pub fn empty() -> Self {
        Tree::Node(Vec::new())
    }

    /// A node holding one leaf per tensor.
    pub fn from_leaves(tensors: Vec<Tensor<B>>) -> Self {
        Tree::Node(tensors.into_iter().map(Tree::Leaf).collect())
    }

    /// All leaves, depth-first.
    pub fn leaves(&self) -> Vec<Tensor<B>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<Tensor<B>>) {
        match self {
            Tree::Leaf(t) => out.push(t.clone()),
            Tree::Node(children) => children.iter().for_each(|c| c.collect_leaves(out)),
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Node(children) => children.iter().map(Tree::leaf_count).sum(),
        }
    }

    /// True when the tree holds no tensors at all (nested empty nodes count
    /// as empty).
    pub fn is_empty(&self) -> bool {
        self.leaf_count() == 0
    }

    /// Total number of scalar entries across all leaves.
    pub fn elem_count(&self) -> usize {
        self.leaves().iter().map(Tensor::elem_count).sum()
    }

    pub fn child(&self, i: usize) -> Option<&Tree<B>> {
        match self {
            Tree::Node(children) => children.get(i),
            Tree::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Tensor<B>> {
        match self {
            Tree::Leaf(t) => Some(t),
            Tree::Node(_) => None,
        }
    }

    /// The `n` children of a node, or `Uninitialized` for `layer` when the
    /// tree does not have that structure.
    pub fn children(&self, layer: &str, n: usize) -> Result<&[Tree<B>]> {
        match self {
            Tree::Node(children) if children.len() == n => Ok(children),
            _ => Err(Error::Uninitialized {
                layer: layer.to_string(),
            }),
        }
    }

    /// The `n` leaves directly under a node.
    pub fn leaf_children(&self, layer: &str, n: usize) -> Result<Vec<&Tensor<B>>> {
        self.children(layer, n)?
            .iter()
            .map(|c| {
                c.as_leaf().ok_or_else(|| Error::Uninitialized {
                    layer: layer.to_string(),
                })
            })
            .collect()
    }

    /// Rebuild a tree with this structure from a flat leaf list.
    pub fn unflatten_like(&self, leaves: &[Tensor<B>]) -> Result<Tree<B>> {
        if leaves.len() != self.leaf_count() {
            return Err(Error::msg(format!(
                "unflatten: tree has {} leaves, got {} tensors",
                self.leaf_count(),
                leaves.len()
            )));
        }
        let mut it = leaves.iter();
        Ok(self.rebuild(&mut it))
    }

    fn rebuild<'a>(&self, it: &mut impl Iterator<Item = &'a Tensor<B>>) -> Tree<B> {
        match self {
            // The leaf count was checked up front.
            Tree::Leaf(t) => Tree::Leaf(it.next().cloned().unwrap_or_else(|| t.clone())),
            Tree::Node(children) => Tree::Node(children.iter().map(|c| c.rebuild(it)).collect()),
        }
    }

    /// Same structure, each leaf mapped through `f`.
    pub fn try_map(&self, f: &impl Fn(&Tensor<B>) -> Result<Tensor<B>>) -> Result<Tree<B>> {
        match self {
            Tree::Leaf(t) => Ok(Tree::Leaf(f(t)?)),
            Tree::Node(children) => Ok(Tree::Node(
                children
                    .iter()
                    .map(|c| c.try_map(f))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    pub fn zeros_like(&self) -> Result<Tree<B>> {
        self.try_map(&|t| Tensor::zeros_like(t))
    }

    /// Same tensors with their history cut.
    pub fn detached(&self) -> Tree<B> {
        match self {
            Tree::Leaf(t) => Tree::Leaf(t.detach()),
            Tree::Node(children) => Tree::Node(children.iter().map(Tree::detached).collect()),
        }
    }
}
