use std::borrow::BorrowMut;
use std::fmt::{self, Debug};
use std::ops::Index;

use log::*;

use crate::{
    join_types,
    util::{HashMap, HashSet, Instant},
    Dot, EClass, Error, Id, Language, Node, RecExpr, Result, TypeSystem, UnionFind, Untyped,
};

/// A pending congruence repair: `old` was merged into `new`, and the
/// enodes using `old` still have to be re-canonicalized.
#[derive(Debug, Clone, Copy)]
struct Repair {
    old: Id,
    new: Id,
}

/** A data structure to keep track of equalities between expressions.

An [`EGraph`] owns every [`EClass`] and every [`Node`] of one program.
Classes live in an arena indexed by [`Id`]; the union-find maps any id,
including ids of classes that were merged away, to its canonical class.

# Invariants and rebuilding

[`union`](EGraph::union) is cheap: it only re-parents the smaller
class and records a repair. The expensive part, restoring congruence
closure and the hash-cons, is deferred to [`rebuild`](EGraph::rebuild).
The following only hold after a `rebuild`:

- the memo holds exactly one entry per distinct canonical enode;
- every enode's children are canonical;
- congruent enodes live in the same class;
- every class's node list is sorted and duplicate-free.

Every class carries a checked type from the [`TypeSystem`]; it is the
join of all types seen for that class and never decreases.

# Example

```
use nnegg::*;

let mut egraph = EGraph::<Untyped>::default();
let x = egraph.add(Node::Var("x".into())).unwrap();
let y = egraph.add(Node::Var("y".into())).unwrap();
let neg = egraph.add(Node::Op("neg".into())).unwrap();
let nx = egraph.add(Node::call(neg, [x])).unwrap();
let ny = egraph.add(Node::call(neg, [y])).unwrap();

egraph.union(x, y);
egraph.rebuild();

// congruence closure merged the two calls too
assert_eq!(egraph.find(nx), egraph.find(ny));
```
**/
pub struct EGraph<T: TypeSystem = Untyped> {
    /// The type system consulted on every insertion.
    pub types: T,
    memo: HashMap<Node, Id>,
    unionfind: UnionFind,
    classes: Vec<Option<EClass<T>>>,
    pending: Vec<Repair>,
    n_classes: usize,
    version: usize,
}

impl<T: TypeSystem + Default> Default for EGraph<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// manual debug impl to avoid the T: Debug bound
impl<T: TypeSystem> Debug for EGraph<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EGraph")
            .field("memo", &self.memo)
            .field("classes", &self.classes().collect::<Vec<_>>())
            .field("pending", &self.pending)
            .field("version", &self.version)
            .finish()
    }
}

impl<T: TypeSystem> EGraph<T> {
    /// Creates an empty e-graph over the given type system.
    pub fn new(types: T) -> Self {
        Self {
            types,
            memo: Default::default(),
            unionfind: Default::default(),
            classes: Default::default(),
            pending: Default::default(),
            n_classes: 0,
            version: 0,
        }
    }

    /// Creates an e-graph holding `expr`, returning it with the root class.
    pub fn from_expr(types: T, expr: &RecExpr) -> Result<(Self, Id)> {
        let mut egraph = Self::new(types);
        let root = egraph.add_expr(expr)?;
        Ok((egraph, root))
    }

    /// Returns an iterator over the canonical eclasses in the egraph.
    pub fn classes(&self) -> impl Iterator<Item = &EClass<T>> {
        self.classes
            .iter()
            .filter_map(Option::as_ref)
            .filter(move |class| self.unionfind.find(class.id) == class.id)
    }

    /// Returns a mutating iterator over the canonical eclasses in the egraph.
    pub fn classes_mut(&mut self) -> impl Iterator<Item = &mut EClass<T>> {
        let unionfind = &self.unionfind;
        self.classes
            .iter_mut()
            .filter_map(Option::as_mut)
            .filter(move |class| unionfind.find(class.id) == class.id)
    }

    /// Returns every enode together with the class it belongs to.
    pub fn nodes(&self) -> impl Iterator<Item = (Id, &Node)> {
        self.classes()
            .flat_map(|class| class.iter().map(move |node| (class.id, node)))
    }

    /// Returns `true` if the egraph is empty.
    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// Returns the number of canonical eclasses in the egraph.
    pub fn number_of_classes(&self) -> usize {
        self.n_classes
    }

    /// Returns the number of enodes stored in the classes.
    pub fn total_number_of_nodes(&self) -> usize {
        self.classes().map(|c| c.len()).sum()
    }

    /// Returns the size of the hash-cons index.
    pub fn total_size(&self) -> usize {
        self.memo.len()
    }

    /// A counter bumped by every union that actually merged two classes.
    ///
    /// If it is the same before and after a round of rewriting, that
    /// round taught the e-graph nothing new.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Returns `true` if there are no pending repairs, i.e. the
    /// invariants hold.
    pub fn is_clean(&self) -> bool {
        self.pending.is_empty()
    }

    /// Canonicalizes an eclass id.
    pub fn find(&self, id: Id) -> Id {
        self.unionfind.find(id)
    }

    /// Same as [`find`](EGraph::find), with path compression.
    pub fn find_mut(&mut self, id: Id) -> Id {
        self.unionfind.find_mut(id)
    }

    /// The checked type of the class of `id`.
    pub fn checked_type(&self, id: Id) -> &T::Type {
        &self[id].checked_type
    }

    fn class_mut(&mut self, id: Id) -> &mut EClass<T> {
        let id = self.find_mut(id);
        self.classes[usize::from(id)]
            .as_mut()
            .unwrap_or_else(|| panic!("Invalid id {}", id))
    }

    /// Lookup the eclass of the given enode.
    ///
    /// You can pass in either an owned enode or a `&mut` enode,
    /// in which case the enode's children will be canonicalized.
    pub fn lookup<B>(&self, mut enode: B) -> Option<Id>
    where
        B: BorrowMut<Node>,
    {
        let enode = enode.borrow_mut();
        enode.update_children(|id| self.find(id));
        self.memo.get(enode).map(|&id| self.find(id))
    }

    /// Lookup the eclass of the root of the given [`RecExpr`].
    pub fn lookup_expr(&self, expr: &RecExpr) -> Option<Id> {
        let mut ids: Vec<Id> = Vec::with_capacity(expr.len());
        for node in expr.as_ref() {
            let node = node.clone().map_children(|i| ids[usize::from(i)]);
            ids.push(self.lookup(node)?);
        }
        ids.last().copied()
    }

    /// Adds a [`RecExpr`] to the [`EGraph`], returning the id of the
    /// root's eclass.
    ///
    /// The entries are added in order, which is already leaf to root,
    /// so shared sub-expressions are only processed once.
    pub fn add_expr(&mut self, expr: &RecExpr) -> Result<Id> {
        let mut ids: Vec<Id> = Vec::with_capacity(expr.len());
        for node in expr.as_ref() {
            let node = node.clone().map_children(|i| ids[usize::from(i)]);
            ids.push(self.add(node)?);
        }
        ids.last()
            .copied()
            .ok_or_else(|| Error::Parse("cannot add an empty expression".into()))
    }

    /// Adds an enode to the [`EGraph`].
    ///
    /// If a congruent enode is already present, its class is returned
    /// and that class's type is raised to the join of its current type
    /// and the type inferred for `enode`.
    /// Otherwise a fresh class is created.
    pub fn add(&mut self, mut enode: Node) -> Result<Id> {
        enode.update_children(|id| self.find_mut(id));
        let ty = self
            .types
            .infer(self, &enode)
            .map_err(|source| Error::TypeInference {
                node: enode.to_string(),
                source,
            })?;

        if let Some(&existing) = self.memo.get(&enode) {
            let id = self.find_mut(existing);
            trace!("Added *{:4}: {:?}", id, enode);
            let class = self.classes[usize::from(id)]
                .as_mut()
                .unwrap_or_else(|| panic!("Invalid id {}", id));
            join_types(&self.types, &mut class.checked_type, ty);
            return Ok(id);
        }

        let id = self.unionfind.make_set();
        trace!("Added  {:4}: {:?}", id, enode);
        for &child in enode.children() {
            self.class_mut(child).parents.push((enode.clone(), id));
        }
        debug_assert_eq!(usize::from(id), self.classes.len());
        self.classes
            .push(Some(EClass::new(id, enode.clone(), ty)));
        self.memo.insert(enode, id);
        self.n_classes += 1;
        Ok(id)
    }

    /// Unions two eclasses given their ids.
    ///
    /// The given ids need not be canonical.
    /// Returns `true` if the classes were different, in which case the
    /// one with fewer nodes is merged into the other and a repair is
    /// queued for the next [`rebuild`](EGraph::rebuild).
    pub fn union(&mut self, id1: Id, id2: Id) -> bool {
        let mut to = self.find_mut(id1);
        let mut from = self.find_mut(id2);
        if to == from {
            return false;
        }
        if self[to].len() < self[from].len() {
            std::mem::swap(&mut to, &mut from);
        }

        trace!("Unioning {} <- {}", to, from);
        let from_type = self[from].checked_type.clone();
        self.version += 1;
        self.n_classes -= 1;
        self.unionfind.union(to, from);

        let class = self.classes[usize::from(to)]
            .as_mut()
            .unwrap_or_else(|| panic!("Invalid id {}", to));
        join_types(&self.types, &mut class.checked_type, from_type);

        self.pending.push(Repair { old: from, new: to });
        true
    }

    /// Restores the invariants after a batch of unions.
    ///
    /// Drains the repair worklist until it is empty. Repairing a class
    /// re-canonicalizes the enodes that use it, which may discover new
    /// congruences and therefore queue more repairs. Once the worklist is
    /// empty, the touched classes are cleaned up and their members are
    /// checked against the memo; a member hash-consed elsewhere starts
    /// another round.
    ///
    /// Returns the number of repairs processed.
    pub fn rebuild(&mut self) -> usize {
        if self.pending.is_empty() {
            trace!("Skipping rebuild!");
            return 0;
        }

        let old_hc_size = self.memo.len();
        let old_n_eclasses = self.number_of_classes();
        let start = Instant::now();

        let mut n_repairs = 0;
        let mut n_congruences = 0;
        let mut trimmed_nodes = 0;

        while !self.pending.is_empty() {
            let mut touched: HashSet<Id> = Default::default();
            while let Some(Repair { old, new }) = self.pending.pop() {
                n_repairs += 1;
                let mut old_class = self.classes[usize::from(old)]
                    .take()
                    .unwrap_or_else(|| panic!("Class {} was repaired twice", old));

                let mut repaired = Vec::with_capacity(old_class.parents.len());
                for (mut node, owner) in old_class.parents.drain(..) {
                    self.memo.remove(&node);
                    node.update_children(|id| self.find_mut(id));
                    let owner = self.find_mut(owner);
                    match self.memo.get(&node) {
                        Some(&existing) => {
                            if self.union(existing, owner) {
                                n_congruences += 1;
                            }
                        }
                        None => {
                            self.memo.insert(node.clone(), owner);
                        }
                    }
                    touched.insert(owner);
                    repaired.push((node, owner));
                }

                // the target may have been merged away while repairing
                let new = self.find_mut(new);
                self.class_mut(new).nodes.extend(old_class.nodes);
                touched.insert(new);

                // every canonical child has to know about the repaired
                // parent, so a later merge of that child reaches it
                for (node, owner) in repaired {
                    let mut children: Vec<Id> =
                        node.children().iter().map(|&c| self.find_mut(c)).collect();
                    children.sort_unstable();
                    children.dedup();
                    for child in children {
                        self.class_mut(child).parents.push((node.clone(), owner));
                    }
                }
            }

            let (trimmed, congruences) = self.rebuild_classes(touched);
            trimmed_nodes += trimmed;
            n_congruences += congruences;
        }

        let unionfind = &self.unionfind;
        self.memo.retain(|node, id| {
            let canonical = node.children().iter().all(|&c| unionfind.find(c) == c);
            *id = unionfind.find(*id);
            canonical
        });

        let elapsed = start.elapsed();

        info!(
            concat!(
                "REBUILT! {} repairs in {}.{:03}s\n",
                "  Old: hc size {}, eclasses: {}\n",
                "  New: hc size {}, eclasses: {}\n",
                "  congruences: {}, trimmed nodes: {}"
            ),
            n_repairs,
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            old_hc_size,
            old_n_eclasses,
            self.memo.len(),
            self.number_of_classes(),
            n_congruences,
            trimmed_nodes,
        );

        n_repairs
    }

    /// Canonicalizes, sorts and dedups the node and parent lists of every
    /// touched class, and checks each member against the memo.
    ///
    /// A member that is hash-consed to another class is congruent to it,
    /// so the two are unioned, which queues more repairs.
    /// Returns the number of trimmed nodes and of such unions.
    fn rebuild_classes(&mut self, touched: HashSet<Id>) -> (usize, usize) {
        let mut trimmed = 0;
        let mut congruent = vec![];
        let canonical: HashSet<Id> = touched.into_iter().map(|id| self.find_mut(id)).collect();

        for id in canonical {
            let mut class = self.classes[usize::from(id)]
                .take()
                .unwrap_or_else(|| panic!("Invalid id {}", id));

            for node in &mut class.nodes {
                node.update_children(|c| self.find_mut(c));
            }
            let before = class.nodes.len();
            class.nodes.sort_unstable();
            class.nodes.dedup();
            trimmed += before - class.nodes.len();

            for node in &class.nodes {
                match self.memo.get(node) {
                    Some(&other) => {
                        if self.unionfind.find(other) != id {
                            congruent.push((id, other));
                        }
                    }
                    None => {
                        self.memo.insert(node.clone(), id);
                    }
                }
            }

            for (node, owner) in &mut class.parents {
                node.update_children(|c| self.find_mut(c));
                *owner = self.find_mut(*owner);
            }
            class.parents.sort_unstable();
            class.parents.dedup();

            self.classes[usize::from(id)] = Some(class);
        }

        let mut n_unions = 0;
        for (a, b) in congruent {
            if self.union(a, b) {
                n_unions += 1;
            }
        }
        (trimmed, n_unions)
    }

    /// Panics if any invariant that [`rebuild`](EGraph::rebuild) promises
    /// is broken.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        assert!(self.is_clean(), "pending repairs: {:?}", self.pending);

        let mut n_nodes = 0;
        for class in self.classes() {
            assert!(!class.is_empty(), "class {} is empty", class.id);
            for pair in class.nodes.windows(2) {
                assert!(pair[0] < pair[1], "class {} is not sorted and deduped", class.id);
            }
            for node in class.iter() {
                n_nodes += 1;
                for &child in node.children() {
                    assert_eq!(self.find(child), child, "{:?} has a stale child", node);
                }
                assert_eq!(
                    self.memo.get(node).map(|&id| self.find(id)),
                    Some(class.id),
                    "{:?} is not hash-consed to class {}",
                    node,
                    class.id
                );
            }
        }

        assert_eq!(n_nodes, self.memo.len(), "memo and classes disagree");
        assert_eq!(self.classes().count(), self.n_classes);
        assert_eq!(self.unionfind.size(), self.classes.len());
    }

    /// Returns a more debug-able representation of the egraph.
    ///
    /// [`EGraph`]s implement [`Debug`], but it's not pretty. This dumps
    /// one line per eclass instead.
    pub fn dump(&self) -> impl Debug + '_ {
        EGraphDump(self)
    }

    /// Creates a [`Dot`] to visualize this egraph. See [`Dot`].
    pub fn dot(&self) -> Dot<'_, T> {
        Dot { egraph: self }
    }
}

impl<T: TypeSystem> Index<Id> for EGraph<T> {
    type Output = EClass<T>;

    /// Returns the canonical class of `id`.
    fn index(&self, id: Id) -> &EClass<T> {
        let id = self.find(id);
        self.classes[usize::from(id)]
            .as_ref()
            .unwrap_or_else(|| panic!("Invalid id {}", id))
    }
}

struct EGraphDump<'a, T: TypeSystem>(&'a EGraph<T>);

impl<'a, T: TypeSystem> Debug for EGraphDump<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in self.0.classes() {
            writeln!(
                f,
                "{} ({:?}): {:?}",
                class.id, class.checked_type, class.nodes
            )?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{TensorType, TensorTypes};
    use crate::Literal;

    fn var(egraph: &mut EGraph, name: &str) -> Id {
        egraph.add(Node::Var(name.into())).unwrap()
    }

    #[test]
    fn simple_add() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();

        let x = var(&mut egraph, "x");
        let x2 = var(&mut egraph, "x");
        assert_eq!(x, x2);

        let plus = egraph.add(Node::Op("+".into())).unwrap();
        let a = egraph.add(Node::call(plus, [x, x2])).unwrap();
        let b = egraph.add(Node::call(plus, [x, x])).unwrap();
        assert_eq!(a, b);

        assert_eq!(egraph.number_of_classes(), 3);
        assert_eq!(egraph.total_size(), 3);
        assert_eq!(egraph.version(), 0);
        egraph.check_invariants();
    }

    #[test]
    fn union_is_deferred_until_rebuild() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let x = var(&mut egraph, "x");
        let y = var(&mut egraph, "y");

        assert!(egraph.union(x, y));
        assert!(!egraph.union(y, x));
        assert_eq!(egraph.version(), 1);
        assert!(!egraph.is_clean());
        assert_eq!(egraph.find(x), egraph.find(y));

        assert_eq!(egraph.rebuild(), 1);
        assert!(egraph.is_clean());
        assert_eq!(egraph[x].len(), 2);
        assert_eq!(egraph.number_of_classes(), 1);
        egraph.check_invariants();

        // nothing to do the second time
        assert_eq!(egraph.rebuild(), 0);
    }

    #[test]
    fn congruence_propagates_transitively() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let x = var(&mut egraph, "x");
        let y = var(&mut egraph, "y");
        let f = egraph.add(Node::Op("f".into())).unwrap();
        let fx = egraph.add(Node::call(f, [x])).unwrap();
        let fy = egraph.add(Node::call(f, [y])).unwrap();
        let ffx = egraph.add(Node::call(f, [fx])).unwrap();
        let ffy = egraph.add(Node::call(f, [fy])).unwrap();
        let t1 = egraph.add(Node::Tuple([fx, ffx].into_iter().collect())).unwrap();
        let t2 = egraph.add(Node::Tuple([fy, ffy].into_iter().collect())).unwrap();
        assert_ne!(egraph.find(t1), egraph.find(t2));

        let version = egraph.version();
        egraph.union(x, y);
        egraph.rebuild();

        assert_eq!(egraph.find(fx), egraph.find(fy));
        assert_eq!(egraph.find(ffx), egraph.find(ffy));
        assert_eq!(egraph.find(t1), egraph.find(t2));
        // one explicit union and three congruences
        assert_eq!(egraph.version(), version + 4);
        egraph.check_invariants();
    }

    #[test]
    fn type_is_joined_on_union_and_add() {
        crate::init_logger();
        let types = TensorTypes::default().with_input("y", TensorType::unranked("f32"));
        let mut egraph = EGraph::new(types);
        let x = egraph.add(Node::Var("x".into())).unwrap();
        let y = egraph.add(Node::Var("y".into())).unwrap();
        assert_eq!(*egraph.checked_type(x), TensorType::Any);

        egraph.union(x, y);
        assert_eq!(*egraph.checked_type(x), TensorType::unranked("f32"));
        egraph.rebuild();
        assert_eq!(*egraph.checked_type(y), TensorType::unranked("f32"));

        let neg = egraph.add(Node::Op("neg".into())).unwrap();
        let one = egraph.add(Node::Const(1.0.into())).unwrap();
        let n1 = egraph.add(Node::call(neg, [one])).unwrap();
        assert_eq!(*egraph.checked_type(n1), TensorType::scalar("f32"));
    }

    #[test]
    fn ill_typed_add_is_an_error() {
        let mut egraph = EGraph::new(TensorTypes::default());
        let add = egraph.add(Node::Op("+".into())).unwrap();
        let one = egraph.add(Node::Const(Literal::Int(1))).unwrap();
        let half = egraph.add(Node::Const(0.5.into())).unwrap();
        let err = egraph.add(Node::call(add, [one, half])).unwrap_err();
        assert!(matches!(err, Error::TypeInference { .. }), "{}", err);
        // nothing was inserted
        assert_eq!(egraph.number_of_classes(), 3);
    }

    #[test]
    fn lookup_expr_finds_added_expressions() {
        let mut egraph = EGraph::<Untyped>::default();
        let e: RecExpr = "(* (+ a b) (+ a b))".parse().unwrap();
        let id = egraph.add_expr(&e).unwrap();
        assert_eq!(egraph.lookup_expr(&e), Some(id));
        // `a`, `b`, `+`, `*`, the sum and the product
        assert_eq!(egraph.number_of_classes(), 6);
        assert_eq!(egraph.lookup_expr(&"(+ b a)".parse().unwrap()), None);
    }

    #[test]
    fn merge_during_repair_keeps_congruence() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let v0 = var(&mut egraph, "v0");
        let v1 = var(&mut egraph, "v1");
        let v2 = var(&mut egraph, "v2");
        let f = egraph.add(Node::Op("f".into())).unwrap();
        let f10 = egraph.add(Node::call(f, [v1, v0])).unwrap();
        let f21 = egraph.add(Node::call(f, [v2, v1])).unwrap();
        let f1 = egraph.add(Node::call(f, [v1])).unwrap();
        let f05 = egraph.add(Node::call(f, [v0, f21])).unwrap();

        egraph.union(v1, f21);
        egraph.union(v2, f05);
        egraph.union(v2, v0);
        egraph.rebuild();
        egraph.check_invariants();

        // all three variables collapsed, so the binary calls are congruent
        assert_eq!(egraph.find(v0), egraph.find(v1));
        assert_eq!(egraph.find(f10), egraph.find(f21));
        assert_eq!(egraph.find(f10), egraph.find(f05));
        assert_ne!(egraph.find(f1), egraph.find(f10));
        for (id, node) in egraph.nodes() {
            assert_eq!(egraph.lookup(node.clone()), Some(id), "{:?}", node);
        }
    }

    #[test]
    fn adds_between_unions_are_repaired() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let x = var(&mut egraph, "x");
        let y = var(&mut egraph, "y");
        let f = egraph.add(Node::Op("f".into())).unwrap();
        let fx = egraph.add(Node::call(f, [x])).unwrap();
        egraph.union(y, x);
        // added while the union is pending, so it misses `fx` in the memo
        let fy = egraph.add(Node::call(f, [y])).unwrap();
        let ffy = egraph.add(Node::call(f, [fy])).unwrap();
        egraph.union(fx, ffy);
        egraph.rebuild();
        egraph.check_invariants();

        assert_eq!(egraph.find(fx), egraph.find(fy));
        assert_eq!(egraph.find(fx), egraph.find(ffy));
    }

    #[test]
    fn class_accessors() {
        let mut egraph = EGraph::<Untyped>::default();
        let five = egraph.add(Node::Const(Literal::Int(5))).unwrap();
        let sum = egraph.add_expr(&"(+ 5 r)".parse().unwrap()).unwrap();
        let marked = egraph.add_expr(&"(marker range 5 r)".parse().unwrap()).unwrap();
        egraph.union(five, marked);
        egraph.rebuild();

        let class = &egraph[five];
        assert!(class.has_marker());
        assert_eq!(class.leaves().count(), 1);
        assert!(class.parents().any(|(_, id)| egraph.find(id) == sum));
        assert!(!egraph[sum].has_marker());
        assert!(format!("{:?}", egraph.dump()).contains("Marker"));
    }
}
