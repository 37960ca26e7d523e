use std::fmt::{self, Debug};

use log::*;
use ordered_float::OrderedFloat;
use smallvec::SmallVec;

use crate::{
    util::{HashMap, HashSet},
    EGraph, Id, Language, Node, RecExpr, TypeSystem,
};

/// A totally ordered cost.
pub type Score = OrderedFloat<f64>;

/** A cost function that can be used by an [`Extractor`] or a
[`SatExtractor`](crate::SatExtractor).

The cost of an enode is its own cost plus the costs of the classes of
its children. [`op_cost`](CostFunction::op_cost) only supplies the
first part: the cost of evaluating `node` given the checked types of
its operands. Markers are free; their own cost is never asked for.

Any `FnMut(&Node, &[&T::Type]) -> Score` closure is a cost function:

```
use nnegg::*;

let egraph: EGraph = Default::default();
// calls are expensive, everything else is cheap
let cost = |node: &Node, _args: &[&()]| match node {
    Node::Call(_) => Score::from(10.0),
    _ => Score::from(1.0),
};
let extractor = Extractor::new(&egraph, cost);
```
*/
pub trait CostFunction<T: TypeSystem> {
    /// Returns the cost of `node` itself, not counting its children.
    /// `arg_types` are the checked types of the children, in order.
    fn op_cost(&mut self, node: &Node, arg_types: &[&T::Type]) -> Score;
}

impl<T, F> CostFunction<T> for F
where
    T: TypeSystem,
    F: FnMut(&Node, &[&T::Type]) -> Score,
{
    fn op_cost(&mut self, node: &Node, arg_types: &[&T::Type]) -> Score {
        self(node, arg_types)
    }
}

/** A simple [`CostFunction`] that counts total ast size.

```
# use nnegg::*;
let e: RecExpr = "(* 2 (+ x y))".parse().unwrap();
let egraph = EGraph::<Untyped>::from_expr(Untyped, &e).unwrap().0;
// three calls, their two operators, and the three leaves
assert_eq!(dag_cost(&egraph, &mut AstSize, &e), Some(Score::from(7.0)));
```
**/
#[derive(Debug, Default, Clone, Copy)]
pub struct AstSize;

impl<T: TypeSystem> CostFunction<T> for AstSize {
    fn op_cost(&mut self, _node: &Node, _arg_types: &[&T::Type]) -> Score {
        Score::from(1.0)
    }
}

/// Computes the own cost of every node, with markers free.
pub(crate) fn node_costs<T, CF>(egraph: &EGraph<T>, cost_function: &mut CF) -> HashMap<Node, Score>
where
    T: TypeSystem,
    CF: CostFunction<T>,
{
    egraph
        .nodes()
        .map(|(_, node)| {
            let cost = if node.is_marker() {
                Score::from(0.0)
            } else {
                let types: SmallVec<[&T::Type; 4]> =
                    node.children().iter().map(|&c| egraph.checked_type(c)).collect();
                cost_function.op_cost(node, &types)
            };
            (node.clone(), cost)
        })
        .collect()
}

/// Computes the cost of `expr`, counting every entry once, as it is
/// represented in `egraph`. Markers are free.
///
/// Returns `None` if `expr` is not represented in `egraph`.
pub fn dag_cost<T, CF>(egraph: &EGraph<T>, cost_function: &mut CF, expr: &RecExpr) -> Option<Score>
where
    T: TypeSystem,
    CF: CostFunction<T>,
{
    let mut ids: Vec<Id> = Vec::with_capacity(expr.len());
    let mut cost = Score::from(0.0);
    for node in expr.as_ref() {
        let node = node.clone().map_children(|i| ids[usize::from(i)]);
        if !node.is_marker() {
            let types: SmallVec<[&T::Type; 4]> =
                node.children().iter().map(|&c| egraph.checked_type(c)).collect();
            cost += cost_function.op_cost(&node, &types);
        }
        ids.push(egraph.lookup(node)?);
    }
    Some(cost)
}

/// How a class is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Mode {
    /// Markers win whenever they are extractable.
    WithMarker,
    /// Markers are not candidates.
    WithoutMarker,
    /// Plain cost minimization for this class and everything below it.
    /// Every child of a cheapest member is strictly cheaper than its
    /// class, so this mode never revisits a class.
    Cheapest,
}

type Requests = SmallVec<[(Id, Mode); 4]>;

type Constraint<'a, T> = Box<dyn Fn(&EGraph<T>, Id, &Node) -> bool + 'a>;

/** Extracting a single [`RecExpr`] from an [`EGraph`].

```
use nnegg::*;

let mut egraph = EGraph::<Untyped>::default();
let a = egraph.add_expr(&"(+ (* x 1) 0)".parse().unwrap()).unwrap();
let b = egraph.add_expr(&"x".parse().unwrap()).unwrap();
egraph.union(a, b);
egraph.rebuild();

let extractor = Extractor::new(&egraph, AstSize);
let (best_cost, best) = extractor.find_best(a);
assert_eq!(best_cost, Score::from(1.0));
assert_eq!(best.to_string(), "x");
```

The extractor first runs a bottom-up fixpoint that gives every class
the cost of its cheapest member (own cost plus the costs of its
children's classes). Extraction then walks from the root with an
explicit stack, so deep programs cannot overflow the call stack.

# Markers

A marker annotates a value without changing it, so while resolving a
class the extractor prefers a marker over any other member (a marker
scores zero). Ties between members are broken by marker, then constant,
then anything else.

The target of a marker is usually its own class: the marker annotates
the exact value it wraps. That class is then resolved a second time
with markers excluded, so the output holds both the marker and the
plain value it annotates. The same happens whenever a child refers back
to any class that is still being resolved with markers allowed. Should
that second resolution also lead back to itself, the class is resolved
once more by cost alone, which always terminates:

```
use nnegg::*;

let mut egraph = EGraph::<Untyped>::default();
let five = egraph.add(Node::Const(Literal::Int(5))).unwrap();
let range = egraph.add(Node::Var("range".into())).unwrap();
let marked = egraph.add(Node::Marker("range".into(), [five, range])).unwrap();
egraph.union(five, marked);
egraph.rebuild();

let best = Extractor::new(&egraph, AstSize).extract(five);
assert_eq!(best.to_string(), "(marker range 5 range)");
```

# Constraints

[`with_constraint`](Extractor::with_constraint) restricts the candidates
of every class to the members a predicate accepts. A reachable class
left without candidates is a bug in the caller and panics.
**/
pub struct Extractor<'a, T: TypeSystem> {
    egraph: &'a EGraph<T>,
    node_costs: HashMap<Node, Score>,
    costs: HashMap<Id, Score>,
    constraints: Vec<Constraint<'a, T>>,
}

impl<'a, T: TypeSystem> Debug for Extractor<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("costs", &self.costs)
            .field("constraints", &self.constraints.len())
            .finish()
    }
}

impl<'a, T: TypeSystem> Extractor<'a, T> {
    /// Create a new `Extractor` given an `EGraph` and a
    /// `CostFunction`.
    ///
    /// The extraction does all the work on creation, so this function
    /// performs the greedy search for cheapest representative of each
    /// eclass.
    pub fn new<CF: CostFunction<T>>(egraph: &'a EGraph<T>, mut cost_function: CF) -> Self {
        let node_costs = node_costs(egraph, &mut cost_function);
        Self::with_node_costs(egraph, node_costs)
    }

    pub(crate) fn with_node_costs(egraph: &'a EGraph<T>, node_costs: HashMap<Node, Score>) -> Self {
        debug_assert!(egraph.is_clean(), "extracting from an egraph that needs a rebuild");
        let mut extractor = Extractor {
            egraph,
            node_costs,
            costs: HashMap::default(),
            constraints: vec![],
        };
        extractor.find_costs();
        extractor
    }

    /// Only consider the members `constraint` accepts. The predicate gets
    /// the e-graph, the canonical class and the candidate.
    pub fn with_constraint(
        mut self,
        constraint: impl Fn(&EGraph<T>, Id, &Node) -> bool + 'a,
    ) -> Self {
        self.constraints.push(Box::new(constraint));
        self.costs.clear();
        self.find_costs();
        self
    }

    /// Find the cheapest (lowest cost) represented `RecExpr` in the
    /// given eclass, and its cost.
    ///
    /// The cost is that of the extracted tree: own costs summed over
    /// every resolved class, with markers free.
    pub fn find_best(&self, eclass: Id) -> (Score, RecExpr) {
        let mut expr = RecExpr::default();
        let mut done: HashMap<(Id, Mode), (Id, Score)> = HashMap::default();
        let mut in_progress: HashSet<(Id, Mode)> = HashSet::default();

        let root = (self.egraph.find(eclass), Mode::WithMarker);
        let mut stack = vec![root];
        while let Some(&key) = stack.last() {
            if done.contains_key(&key) {
                stack.pop();
                continue;
            }

            in_progress.insert(key);
            let (class, mode) = key;
            let (node, requests) = self.choose(class, mode, &in_progress);
            let pending: Requests = requests
                .iter()
                .copied()
                .filter(|r| !done.contains_key(r))
                .collect();

            if pending.is_empty() {
                stack.pop();
                in_progress.remove(&key);
                let mut cost = self.node_costs[node];
                let mut resolved = node.clone();
                for (child, request) in resolved.children_mut().iter_mut().zip(&requests) {
                    let (id, child_cost) = done[request];
                    *child = id;
                    cost += child_cost;
                }
                trace!("Resolved {} ({:?}) to {}", class, mode, resolved);
                let id = expr.add(resolved);
                done.insert(key, (id, cost));
            } else {
                stack.extend(pending);
            }
        }

        let (_, cost) = done[&root];
        (cost, expr)
    }

    /// Extracts the best expression of `eclass`, see
    /// [`find_best`](Extractor::find_best).
    pub fn extract(&self, eclass: Id) -> RecExpr {
        self.find_best(eclass).1
    }

    /// Returns the cost of the cheapest member of `eclass`, as found by
    /// the cost analysis, or `None` if it has no extractable member.
    pub fn find_best_cost(&self, eclass: Id) -> Option<Score> {
        self.costs.get(&self.egraph.find(eclass)).copied()
    }

    /// The classes the children of `node` must be resolved from, and how.
    ///
    /// A child is resolved with markers unless that is already in
    /// progress further up the stack, then without them, then by cost.
    fn child_requests(&self, node: &Node, mode: Mode, in_progress: &HashSet<(Id, Mode)>) -> Requests {
        node.children()
            .iter()
            .map(|&child| {
                let child = self.egraph.find(child);
                if mode == Mode::Cheapest {
                    return (child, Mode::Cheapest);
                }
                [Mode::WithMarker, Mode::WithoutMarker]
                    .into_iter()
                    .map(|m| (child, m))
                    .find(|r| !in_progress.contains(r))
                    .unwrap_or((child, Mode::Cheapest))
            })
            .collect()
    }

    fn allowed(&self, class: Id, node: &Node) -> bool {
        self.constraints.iter().all(|c| c(self.egraph, class, node))
    }

    fn node_total_cost(&self, node: &Node) -> Option<Score> {
        let mut cost = self.node_costs[node];
        for child in node.children() {
            cost += *self.costs.get(&self.egraph.find(*child))?;
        }
        Some(cost)
    }

    /// The winner among the members of `class`, with the requests for its
    /// children. Members whose children would lead back into a class that
    /// is being resolved are passed over.
    fn choose(&self, class: Id, mode: Mode, in_progress: &HashSet<(Id, Mode)>) -> (&'a Node, Requests) {
        let egraph = self.egraph;
        let mut candidates: Vec<(Score, u8, &'a Node)> = egraph[class]
            .iter()
            .filter(|n| mode != Mode::WithoutMarker || !n.is_marker())
            .filter(|n| self.allowed(class, n))
            .filter_map(|n| {
                let total = self.node_total_cost(n)?;
                let score = if mode == Mode::WithMarker && n.is_marker() {
                    Score::from(0.0)
                } else {
                    total
                };
                Some((score, n.priority(), n))
            })
            .collect();
        if candidates.is_empty() {
            // a class of nothing but markers still needs a value
            if mode == Mode::WithoutMarker {
                return self.choose(class, Mode::Cheapest, in_progress);
            }
            panic!(
                "No extractable candidate in class {} ({:?}): {:?}",
                class, mode, egraph[class].nodes
            );
        }
        candidates.sort_unstable();

        for (_, _, node) in candidates {
            let requests = self.child_requests(node, mode, in_progress);
            if requests.iter().all(|r| !in_progress.contains(r)) {
                return (node, requests);
            }
            trace!("Passing over {} in class {} ({:?})", node, class, mode);
        }
        // only reachable with cost functions that are not positive
        panic!(
            "Extraction of class {} ({:?}) found a cycle: {:?}",
            class, mode, egraph[class].nodes
        )
    }

    fn find_costs(&mut self) {
        let mut did_something = true;
        let mut loops = 0;
        while did_something {
            did_something = false;

            let egraph = self.egraph;
            for class in egraph.classes() {
                let new = match self.make_pass(class.id) {
                    Some(new) => new,
                    None => continue,
                };
                let improved = match self.costs.get(&class.id) {
                    Some(&old) => new < old,
                    None => true,
                };
                if improved {
                    self.costs.insert(class.id, new);
                    did_something = true;
                }
            }

            loops += 1;
        }

        info!("Took {} loops to find costs", loops);

        for class in self.egraph.classes() {
            if !self.costs.contains_key(&class.id) {
                debug!("Failed to compute cost for eclass {}: {:?}", class.id, class.nodes)
            }
        }
    }

    fn make_pass(&self, class: Id) -> Option<Score> {
        self.egraph[class]
            .iter()
            .filter(|n| self.allowed(class, n))
            .filter_map(|n| self.node_total_cost(n))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Literal, Untyped};

    fn marked_five() -> (EGraph, Id) {
        let mut egraph = EGraph::<Untyped>::default();
        let five = egraph.add(Node::Const(Literal::Int(5))).unwrap();
        let attr = egraph.add(Node::Const(Literal::from(0.5))).unwrap();
        let marked = egraph.add(Node::Marker("range".into(), [five, attr])).unwrap();
        egraph.union(five, marked);
        egraph.rebuild();
        (egraph, five)
    }

    #[test]
    fn ast_size_picks_smallest() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let big = egraph.add_expr(&"(relu (relu x))".parse().unwrap()).unwrap();
        let small = egraph.add_expr(&"(relu x)".parse().unwrap()).unwrap();
        egraph.union(big, small);
        egraph.rebuild();

        let ext = Extractor::new(&egraph, AstSize);
        let (cost, best) = ext.find_best(big);
        assert_eq!(best.to_string(), "(relu x)");
        assert_eq!(cost, Score::from(3.0));
        assert_eq!(ext.find_best_cost(big), Some(cost));
    }

    #[test]
    fn self_referencing_marker_keeps_both() {
        crate::init_logger();
        let (egraph, five) = marked_five();
        let best = Extractor::new(&egraph, AstSize).extract(five);
        assert_eq!(best.to_string(), "(marker range 5 0.5)");
        // the marker, the raw constant and the attribute
        assert_eq!(best.len(), 3);
    }

    #[test]
    fn marker_beats_cheaper_members() {
        let mut egraph = EGraph::<Untyped>::default();
        let x = egraph.add_expr(&"x".parse().unwrap()).unwrap();
        let expensive = egraph
            .add_expr(&"(marker range (exp (log x)) 1.0)".parse().unwrap())
            .unwrap();
        egraph.union(x, expensive);
        egraph.rebuild();

        let best = Extractor::new(&egraph, AstSize).extract(x);
        assert_eq!(best.to_string(), "(marker range (exp (log x)) 1.0)");
    }

    #[test]
    fn marker_reaching_back_into_its_user_terminates() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let a = egraph.add_expr(&"(f b)".parse().unwrap()).unwrap();
        let long = egraph.add_expr(&"(g (g (g (g (g z)))))".parse().unwrap()).unwrap();
        egraph.union(a, long);
        let b = egraph.lookup(Node::Var("b".into())).unwrap();
        let attr = egraph.add(Node::Var("attr".into())).unwrap();
        let marked = egraph.add(Node::Marker("range".into(), [a, attr])).unwrap();
        egraph.union(b, marked);
        egraph.rebuild();

        let best = Extractor::new(&egraph, AstSize).extract(a);
        // the marker is still preferred, and the class it leads back into
        // is resolved a second time without markers
        assert_eq!(best.to_string(), "(f (marker range (f b) attr))");
        assert_eq!(egraph.lookup_expr(&best), Some(egraph.find(a)));
    }

    #[test]
    fn nested_markers_fall_back_to_cost() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let x = egraph.add_expr(&"(h p)".parse().unwrap()).unwrap();
        let p = egraph.lookup(Node::Var("p".into())).unwrap();
        let a = egraph.add(Node::Var("a".into())).unwrap();
        let outer = egraph.add(Node::Marker("range".into(), [x, a])).unwrap();
        egraph.union(x, outer);
        let k = egraph.add(Node::Op("k".into())).unwrap();
        let kx = egraph.add(Node::call(k, [x])).unwrap();
        let inner = egraph.add(Node::Marker("range".into(), [kx, a])).unwrap();
        egraph.union(p, inner);
        egraph.rebuild();

        // `x` is entered with markers, then without, and the inner marker
        // leads back to it a third time, where plain cost decides
        let best = Extractor::new(&egraph, AstSize).extract(x);
        assert_eq!(best.to_string(), "(marker range (h (marker range (k (h p)) a)) a)");
        assert_eq!(egraph.lookup_expr(&best), Some(egraph.find(x)));
    }

    #[test]
    fn marker_only_class_is_resolved_by_cost() {
        let mut egraph = EGraph::<Untyped>::default();
        let t = egraph.add(Node::Var("t".into())).unwrap();
        let a = egraph.add(Node::Var("a".into())).unwrap();
        let b = egraph.add(Node::Var("b".into())).unwrap();
        let x = egraph.add(Node::Marker("m".into(), [t, a])).unwrap();
        let n = egraph.add(Node::Marker("n".into(), [x, b])).unwrap();
        egraph.union(t, n);
        egraph.rebuild();

        let best = Extractor::new(&egraph, AstSize).extract(x);
        assert_eq!(best.to_string(), "(marker m (marker n (marker m t a) b) a)");
        assert_eq!(egraph.lookup_expr(&best), Some(egraph.find(x)));
    }

    #[test]
    fn constraints_veto_candidates() {
        let mut egraph = EGraph::<Untyped>::default();
        let a = egraph.add_expr(&"(relu x)".parse().unwrap()).unwrap();
        let b = egraph.add_expr(&"(max x 0)".parse().unwrap()).unwrap();
        egraph.union(a, b);
        egraph.rebuild();

        let relu = egraph.lookup(Node::Op("relu".into())).unwrap();
        let best = Extractor::new(&egraph, AstSize)
            .with_constraint(move |_, _, n| !n.children().contains(&relu))
            .extract(a);
        assert_eq!(best.to_string(), "(max x 0)");
    }

    #[test]
    #[should_panic(expected = "No extractable candidate")]
    fn empty_candidate_set_is_fatal() {
        let mut egraph = EGraph::<Untyped>::default();
        let x = egraph.add_expr(&"x".parse().unwrap()).unwrap();
        Extractor::new(&egraph, AstSize)
            .with_constraint(|_, _, _| false)
            .extract(x);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let mut egraph = EGraph::<Untyped>::default();
        let neg = egraph.add(Node::Op("neg".into())).unwrap();
        let mut id = egraph.add(Node::Var("x".into())).unwrap();
        for _ in 0..50_000 {
            id = egraph.add(Node::call(neg, [id])).unwrap();
        }
        let best = Extractor::new(&egraph, AstSize).extract(id);
        assert_eq!(best.len(), 50_002);
    }

    #[test]
    fn shared_subterms_are_extracted_once() {
        let mut egraph = EGraph::<Untyped>::default();
        let e: RecExpr = "(+ (relu x) (relu x))".parse().unwrap();
        let root = egraph.add_expr(&e).unwrap();
        let ext = Extractor::new(&egraph, AstSize);
        let (tree_cost, best) = ext.find_best(root);
        // `+`, `relu`, `x`, `(relu x)` and the sum
        assert_eq!(best.len(), 5);
        // `(relu x)` is counted twice in the tree
        assert_eq!(tree_cost, Score::from(8.0));
        assert_eq!(dag_cost(&egraph, &mut AstSize, &best), Some(Score::from(5.0)));
    }
}
