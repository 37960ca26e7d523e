use std::fmt::{self, Debug};
use std::iter::ExactSizeIterator;

use crate::{Id, Node, TypeSystem};

/// An equivalence class of [`Node`]s.
#[non_exhaustive]
pub struct EClass<T: TypeSystem> {
    /// This eclass's id.
    pub id: Id,
    /// The equivalent enodes in this equivalence class.
    pub nodes: Vec<Node>,
    /// The most precise type known for any member.
    pub checked_type: T::Type,
    /// The enodes that use this class as a child, with the class
    /// each of them lives in.
    pub(crate) parents: Vec<(Node, Id)>,
}

impl<T: TypeSystem> Clone for EClass<T> {
    fn clone(&self) -> Self {
        EClass {
            id: self.id,
            nodes: self.nodes.clone(),
            checked_type: self.checked_type.clone(),
            parents: self.parents.clone(),
        }
    }
}

impl<T: TypeSystem> Debug for EClass<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EClass")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .field("checked_type", &self.checked_type)
            .field("parents", &self.parents)
            .finish()
    }
}

impl<T: TypeSystem> EClass<T> {
    pub(crate) fn new(id: Id, node: Node, checked_type: T::Type) -> Self {
        EClass {
            id,
            nodes: vec![node],
            checked_type,
            parents: vec![],
        }
    }

    /// Returns `true` if the `eclass` is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of enodes in this eclass.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Iterates over the enodes in this eclass.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Iterates over the childless enodes in this eclass.
    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        use crate::Language;
        self.nodes.iter().filter(|&n| n.is_leaf())
    }

    /// Iterates over the parent enodes of this eclass and the classes
    /// they belong to. The ids are not necessarily canonical.
    pub fn parents(&self) -> impl ExactSizeIterator<Item = (&Node, Id)> {
        self.parents.iter().map(|(node, id)| (node, *id))
    }

    /// Returns `true` if any member is a marker.
    pub fn has_marker(&self) -> bool {
        self.nodes.iter().any(Node::is_marker)
    }
}
