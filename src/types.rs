use std::cmp::Ordering;
use std::fmt::Debug;

use log::*;

use crate::{EGraph, Node};

/// Why a [`TypeSystem`] rejected a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TypeError(pub String);

impl From<&str> for TypeError {
    fn from(s: &str) -> Self {
        TypeError(s.to_owned())
    }
}

impl From<String> for TypeError {
    fn from(s: String) -> Self {
        TypeError(s)
    }
}

/** The type system an [`EGraph`] consults to give every e-class a
checked type.

`nnegg` does not know anything about tensor types. It only needs two
things:

- [`infer`](TypeSystem::infer): the type of a node, given the checked
  types of the classes it points at (available through
  [`EGraph::checked_type`]);
- [`compare`](TypeSystem::compare): a partial order on types, where
  `Less` means "less precise than".

Each class keeps the join (the most precise) of every type recorded for
its members or for classes merged into it, so its checked type only
ever moves up the order.

If you don't care about types, use [`Untyped`].

# Example

```
use nnegg::*;
use std::cmp::Ordering;

/// Every value is either known to be a scalar or unknown.
#[derive(Default)]
struct Scalars;

impl TypeSystem for Scalars {
    type Type = Option<bool>;

    fn infer(&self, egraph: &EGraph<Self>, node: &Node) -> Result<Self::Type, TypeError> {
        Ok(match node {
            Node::Const(_) => Some(true),
            Node::Call(xs) => *egraph.checked_type(xs[1]),
            _ => None,
        })
    }

    fn compare(&self, a: &Self::Type, b: &Self::Type) -> Option<Ordering> {
        match (a, b) {
            (None, None) => Some(Ordering::Equal),
            (None, Some(_)) => Some(Ordering::Less),
            (Some(_), None) => Some(Ordering::Greater),
            (Some(x), Some(y)) if x == y => Some(Ordering::Equal),
            _ => None,
        }
    }
}

let mut egraph = EGraph::new(Scalars);
let x = egraph.add_expr(&"(neg x)".parse().unwrap()).unwrap();
assert_eq!(*egraph.checked_type(x), None);

let one = egraph.add_expr(&"(neg 1)".parse().unwrap()).unwrap();
egraph.union(x, one);
egraph.rebuild();
assert_eq!(*egraph.checked_type(x), Some(true));
```
*/
pub trait TypeSystem: Sized + Send + Sync {
    /// The types recorded on e-classes.
    type Type: Clone + Debug + PartialEq + Send + Sync;

    /// Infers the type of `node`. The node's children are canonical
    /// classes of `egraph`, and the node is "being inserted": it is not
    /// in the e-graph yet.
    fn infer(&self, egraph: &EGraph<Self>, node: &Node) -> Result<Self::Type, TypeError>;

    /// Compares two types by precision. `None` means incomparable.
    fn compare(&self, a: &Self::Type, b: &Self::Type) -> Option<Ordering>;
}

/// Raises `to` to the join of `to` and `from`.
/// Returns `true` if `to` changed.
///
/// Joining incomparable types is a caller bug upstream of the e-graph;
/// it is logged and `to` is kept.
pub fn join_types<T: TypeSystem>(types: &T, to: &mut T::Type, from: T::Type) -> bool {
    match types.compare(to, &from) {
        Some(Ordering::Less) => {
            *to = from;
            true
        }
        Some(_) => false,
        None => {
            warn!("Cannot join incomparable types {:?} and {:?}", to, from);
            false
        }
    }
}

/// The trivial [`TypeSystem`]: every node has type `()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Untyped;

impl TypeSystem for Untyped {
    type Type = ();

    fn infer(&self, _egraph: &EGraph<Self>, _node: &Node) -> Result<(), TypeError> {
        Ok(())
    }

    fn compare(&self, _a: &(), _b: &()) -> Option<Ordering> {
        Some(Ordering::Equal)
    }
}
