use log::*;
use smallvec::SmallVec;

use crate::{
    extract::node_costs,
    util::{HashMap, HashSet, IndexMap, IndexSet},
    CostFunction, EGraph, Error, Extractor, Id, Language, Node, RecExpr, Result, Score,
    TypeSystem,
};

/// A boolean variable of a [`SatModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoolVar(usize);

impl BoolVar {
    /// The position of this variable in [`Solution::bools`].
    pub fn index(self) -> usize {
        self.0
    }
}

/// A bounded integer variable of a [`SatModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntVar(usize);

impl IntVar {
    /// The position of this variable in [`Solution::ints`].
    pub fn index(self) -> usize {
        self.0
    }
}

/// A constraint of a [`SatModel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatConstraint {
    /// Exactly one of the variables is true.
    ExactlyOne(Vec<BoolVar>),
    /// At most one of the variables is true.
    AtMostOne(Vec<BoolVar>),
    /// If `enforce` is true, at least one of `literals` is.
    BoolOr {
        /// The condition.
        enforce: BoolVar,
        /// The alternatives.
        literals: Vec<BoolVar>,
    },
    /// If `enforce` is true, `before < after`.
    Precedes {
        /// The condition.
        enforce: BoolVar,
        /// The smaller side.
        before: IntVar,
        /// The larger side.
        after: IntVar,
    },
}

/** A 0/1 integer program: boolean and bounded integer variables, a few
kinds of constraints, soft assumptions, and a weighted sum of booleans
to minimize.

Assumptions are preferences: a [`SatSolver`] must honor them if the
model stays feasible with them, and drop them otherwise.

```
use nnegg::*;

let mut model = SatModel::default();
let a = model.new_bool();
let b = model.new_bool();
model.add_exactly_one([a, b]);
model.minimize([(a, 3), (b, 5)]);
assert!(model.validate().is_ok());

model.add_bool_or(a, []);
assert!(model.validate().is_err());
```
**/
#[derive(Debug, Default, Clone)]
pub struct SatModel {
    n_bools: usize,
    int_bounds: Vec<(i64, i64)>,
    constraints: Vec<SatConstraint>,
    assumptions: Vec<(BoolVar, bool)>,
    objective: Vec<(BoolVar, i64)>,
}

impl SatModel {
    /// Adds a boolean variable.
    pub fn new_bool(&mut self) -> BoolVar {
        self.n_bools += 1;
        BoolVar(self.n_bools - 1)
    }

    /// Adds an integer variable ranging over `lo..=hi`.
    pub fn new_int(&mut self, lo: i64, hi: i64) -> IntVar {
        self.int_bounds.push((lo, hi));
        IntVar(self.int_bounds.len() - 1)
    }

    /// Exactly one of `vars` must be true.
    pub fn add_exactly_one(&mut self, vars: impl IntoIterator<Item = BoolVar>) {
        let vars = vars.into_iter().collect();
        self.constraints.push(SatConstraint::ExactlyOne(vars));
    }

    /// At most one of `vars` may be true.
    pub fn add_at_most_one(&mut self, vars: impl IntoIterator<Item = BoolVar>) {
        let vars = vars.into_iter().collect();
        self.constraints.push(SatConstraint::AtMostOne(vars));
    }

    /// `enforce` implies at least one of `literals`.
    pub fn add_bool_or(&mut self, enforce: BoolVar, literals: impl IntoIterator<Item = BoolVar>) {
        let literals = literals.into_iter().collect();
        self.constraints.push(SatConstraint::BoolOr { enforce, literals });
    }

    /// `enforce` implies `before < after`.
    pub fn add_precedes(&mut self, enforce: BoolVar, before: IntVar, after: IntVar) {
        self.constraints.push(SatConstraint::Precedes {
            enforce,
            before,
            after,
        });
    }

    /// Prefer solutions where `var` is `value`.
    pub fn add_assumption(&mut self, var: BoolVar, value: bool) {
        self.assumptions.push((var, value));
    }

    /// Adds weighted terms to the objective, which is minimized.
    pub fn minimize(&mut self, terms: impl IntoIterator<Item = (BoolVar, i64)>) {
        self.objective.extend(terms);
    }

    /// The number of boolean variables.
    pub fn n_bools(&self) -> usize {
        self.n_bools
    }

    /// The bounds of every integer variable.
    pub fn int_bounds(&self) -> &[(i64, i64)] {
        &self.int_bounds
    }

    /// The hard constraints.
    pub fn constraints(&self) -> &[SatConstraint] {
        &self.constraints
    }

    /// The soft assumptions.
    pub fn assumptions(&self) -> &[(BoolVar, bool)] {
        &self.assumptions
    }

    /// The objective terms.
    pub fn objective(&self) -> &[(BoolVar, i64)] {
        &self.objective
    }

    /// The value of the objective under `bools`.
    pub fn objective_value(&self, bools: &[bool]) -> i64 {
        self.objective
            .iter()
            .filter(|(v, _)| bools[v.0])
            .map(|(_, w)| w)
            .sum()
    }

    /// Checks that every variable exists, that no clause is empty, and
    /// that integer bounds are not inverted.
    pub fn validate(&self) -> Result<()> {
        let check_bool = |v: &BoolVar| {
            if v.0 < self.n_bools {
                Ok(())
            } else {
                Err(Error::InvalidModel(format!("unknown boolean {:?}", v)))
            }
        };
        let check_int = |v: &IntVar| {
            if v.0 < self.int_bounds.len() {
                Ok(())
            } else {
                Err(Error::InvalidModel(format!("unknown integer {:?}", v)))
            }
        };

        for (i, &(lo, hi)) in self.int_bounds.iter().enumerate() {
            if lo > hi {
                return Err(Error::InvalidModel(format!(
                    "integer {} has empty range {}..={}",
                    i, lo, hi
                )));
            }
        }

        for c in &self.constraints {
            match c {
                SatConstraint::ExactlyOne(vars) if vars.is_empty() => {
                    return Err(Error::InvalidModel("empty exactly-one constraint".into()))
                }
                SatConstraint::ExactlyOne(vars) | SatConstraint::AtMostOne(vars) => {
                    vars.iter().try_for_each(check_bool)?
                }
                SatConstraint::BoolOr { literals, .. } if literals.is_empty() => {
                    return Err(Error::InvalidModel("empty clause".into()))
                }
                SatConstraint::BoolOr { enforce, literals } => {
                    check_bool(enforce)?;
                    literals.iter().try_for_each(check_bool)?
                }
                SatConstraint::Precedes {
                    enforce,
                    before,
                    after,
                } => {
                    check_bool(enforce)?;
                    check_int(before)?;
                    check_int(after)?;
                }
            }
        }

        self.assumptions.iter().try_for_each(|(v, _)| check_bool(v))?;
        self.objective.iter().try_for_each(|(v, _)| check_bool(v))
    }
}

/// The outcome of [`SatSolver::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The solution is proven optimal.
    Optimal,
    /// The solution satisfies the constraints but may not be optimal.
    Feasible,
    /// The constraints cannot be satisfied.
    Infeasible,
    /// The model is malformed.
    ModelInvalid,
    /// The solver gave up.
    Unknown,
}

/// An assignment found by a [`SatSolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// How good the assignment is.
    pub status: SolveStatus,
    /// The value of every boolean variable, empty unless the status is
    /// `Optimal` or `Feasible`.
    pub bools: Vec<bool>,
    /// The value of every integer variable, empty unless the status is
    /// `Optimal` or `Feasible`.
    pub ints: Vec<i64>,
}

impl Solution {
    /// A solution without an assignment.
    pub fn without_assignment(status: SolveStatus) -> Self {
        Self {
            status,
            bools: vec![],
            ints: vec![],
        }
    }

    /// The value of a boolean variable.
    pub fn value(&self, var: BoolVar) -> bool {
        self.bools[var.0]
    }

    /// The value of an integer variable.
    pub fn int_value(&self, var: IntVar) -> i64 {
        self.ints[var.0]
    }
}

/// A constraint solver for [`SatModel`]s.
pub trait SatSolver {
    /// Minimizes the model's objective subject to its constraints.
    fn solve(&mut self, model: &SatModel) -> Solution;
}

impl<S: SatSolver + ?Sized> SatSolver for &mut S {
    fn solve(&mut self, model: &SatModel) -> Solution {
        (**self).solve(model)
    }
}

/// The variables allocated for one class.
struct ClassVars<'a> {
    nodes: Vec<(BoolVar, &'a Node)>,
    order: IntVar,
}

/** Extraction as a global 0/1 integer program.

Greedy extraction picks the best member of every class in isolation, so
it can pay twice for a subterm that two classes both need, and it cannot
trade the cost of one subtree against a sibling's. [`SatExtractor`]
builds a single [`SatModel`] over every class reachable from the root
and lets a [`SatSolver`] pick the cheapest consistent selection:

- one boolean per node: the node is part of the program;
- exactly one node of the root class, at most one node of every class;
- a selected node needs a selected node in each of its children's classes;
- every class gets an order integer, and a selected node's class comes
  strictly before its children's, so selections are acyclic;
- markers of classes with other members are assumed unselected;
- the objective is the sum of the selected nodes' costs, rounded to
  integers, with markers free.

If the solver cannot prove optimality, extraction falls back to the
greedy [`Extractor`]. An infeasible model, or an assignment that does
not select exactly one node per visited class, is a bug and panics.

```
# #[cfg(feature = "lp")] {
use nnegg::*;

let mut egraph = EGraph::<Untyped>::default();
let a = egraph.add_expr(&"(+ (* x 2) (* x 2))".parse().unwrap()).unwrap();
let b = egraph.add_expr(&"(* 4 x)".parse().unwrap()).unwrap();
egraph.union(a, b);
egraph.rebuild();

let best = SatExtractor::new(&egraph, AstSize, LpSolver::default()).extract(a);
assert_eq!(best.to_string(), "(* 4 x)");
# }
```
**/
pub struct SatExtractor<'a, T: TypeSystem, S> {
    egraph: &'a EGraph<T>,
    node_costs: HashMap<Node, Score>,
    solver: S,
}

impl<'a, T: TypeSystem, S: SatSolver> SatExtractor<'a, T, S> {
    /// Create a new `SatExtractor`. The cost function is evaluated once
    /// per node, here.
    pub fn new<CF: CostFunction<T>>(egraph: &'a EGraph<T>, mut cost_function: CF, solver: S) -> Self {
        debug_assert!(egraph.is_clean(), "extracting from an egraph that needs a rebuild");
        Self {
            egraph,
            node_costs: node_costs(egraph, &mut cost_function),
            solver,
        }
    }

    /// Extracts the cheapest program of `root`.
    pub fn extract(&mut self, root: Id) -> RecExpr {
        let root = self.egraph.find(root);
        let (model, vars) = self.build_model(root);
        if let Err(e) = model.validate() {
            panic!("Built a malformed model for class {}: {}", root, e);
        }
        info!(
            "Solving extraction of class {}: {} booleans, {} constraints",
            root,
            model.n_bools(),
            model.constraints().len()
        );

        let solution = self.solver.solve(&model);
        match solution.status {
            SolveStatus::Optimal => {
                info!("Optimal cost {}", model.objective_value(&solution.bools));
                self.rebuild(root, &vars, &solution)
            }
            SolveStatus::Feasible | SolveStatus::Unknown => {
                warn!(
                    "Solver returned {:?} for class {}, falling back to greedy extraction",
                    solution.status, root
                );
                Extractor::with_node_costs(self.egraph, self.node_costs.clone()).extract(root)
            }
            SolveStatus::Infeasible => {
                panic!("No acyclic selection of nodes reaches class {}", root)
            }
            SolveStatus::ModelInvalid => {
                panic!("Solver rejected the model for class {}", root)
            }
        }
    }

    fn build_model(&self, root: Id) -> (SatModel, IndexMap<Id, ClassVars<'a>>) {
        let egraph = self.egraph;
        let mut model = SatModel::default();

        // collect the reachable classes
        let mut reachable: IndexSet<Id> = IndexSet::default();
        let mut stack = vec![root];
        while let Some(class) = stack.pop() {
            if !reachable.insert(class) {
                continue;
            }
            for node in egraph[class].iter() {
                stack.extend(node.children().iter().map(|&c| egraph.find(c)));
            }
        }

        let max_order = reachable.len() as i64 - 1;
        let mut vars: IndexMap<Id, ClassVars<'a>> = IndexMap::default();
        for &class in &reachable {
            let nodes = egraph[class]
                .iter()
                .map(|n| (model.new_bool(), n))
                .collect();
            let order = model.new_int(0, max_order);
            vars.insert(class, ClassVars { nodes, order });
        }

        let class_bools = |class: Id| -> Vec<BoolVar> {
            vars[&class].nodes.iter().map(|&(v, _)| v).collect()
        };

        model.add_exactly_one(class_bools(root));
        for (&class, cvars) in &vars {
            model.add_at_most_one(class_bools(class));
            let ambiguous = cvars.nodes.len() > 1;
            for &(var, node) in &cvars.nodes {
                let mut children: SmallVec<[Id; 4]> =
                    node.children().iter().map(|&c| egraph.find(c)).collect();
                children.sort_unstable();
                children.dedup();
                for child in children {
                    model.add_bool_or(var, class_bools(child));
                    model.add_precedes(var, cvars.order, vars[&child].order);
                }

                if node.is_marker() && ambiguous {
                    model.add_assumption(var, false);
                }

                let cost = self.node_costs[node].into_inner().round() as i64;
                if cost != 0 {
                    model.minimize([(var, cost)]);
                }
            }
        }

        (model, vars)
    }

    fn selected(&self, class: Id, vars: &IndexMap<Id, ClassVars<'a>>, solution: &Solution) -> &'a Node {
        let chosen: SmallVec<[&'a Node; 2]> = vars[&class]
            .nodes
            .iter()
            .filter(|&&(v, _)| solution.value(v))
            .map(|&(_, n)| n)
            .collect();
        match chosen.as_slice() {
            [node] => *node,
            _ => panic!(
                "Solver selected {} nodes in class {}, expected exactly one",
                chosen.len(),
                class
            ),
        }
    }

    fn rebuild(&self, root: Id, vars: &IndexMap<Id, ClassVars<'a>>, solution: &Solution) -> RecExpr {
        let egraph = self.egraph;
        let mut expr = RecExpr::default();
        let mut done: HashMap<Id, Id> = HashMap::default();
        let mut in_progress: HashSet<Id> = HashSet::default();

        let mut stack = vec![root];
        while let Some(&class) = stack.last() {
            if done.contains_key(&class) {
                stack.pop();
                continue;
            }

            let node = self.selected(class, vars, solution);
            let pending: SmallVec<[Id; 4]> = node
                .children()
                .iter()
                .map(|&c| egraph.find(c))
                .filter(|c| !done.contains_key(c))
                .collect();

            if pending.is_empty() {
                stack.pop();
                in_progress.remove(&class);
                let resolved = node.clone().map_children(|c| done[&egraph.find(c)]);
                done.insert(class, expr.add(resolved));
            } else {
                in_progress.insert(class);
                for child in pending {
                    if in_progress.contains(&child) {
                        panic!("Solver selected a cycle through class {}", child);
                    }
                    stack.push(child);
                }
            }
        }

        expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dag_cost, test::BruteForceSolver, AstSize, Literal, Untyped};

    fn shared_vs_local() -> (EGraph, Id) {
        // greedy picks the cheapest member of each class on its own
        let mut egraph = EGraph::<Untyped>::default();
        let a = egraph.add_expr(&"(f (g x) (g x))".parse().unwrap()).unwrap();
        let b = egraph.add_expr(&"(h y)".parse().unwrap()).unwrap();
        egraph.union(a, b);
        egraph.rebuild();
        (egraph, a)
    }

    #[test]
    fn model_shape() {
        let (egraph, root) = shared_vs_local();
        let ext = SatExtractor::new(&egraph, AstSize, BruteForceSolver);
        let (model, vars) = ext.build_model(egraph.find(root));
        model.validate().unwrap();
        assert_eq!(model.n_bools(), egraph.total_number_of_nodes());
        assert_eq!(model.int_bounds().len(), vars.len());
        let exactly_one = model
            .constraints()
            .iter()
            .filter(|c| matches!(c, SatConstraint::ExactlyOne(_)))
            .count();
        assert_eq!(exactly_one, 1);
    }

    #[test]
    fn sat_is_no_worse_than_greedy() {
        crate::init_logger();
        let (egraph, root) = shared_vs_local();
        let greedy = Extractor::new(&egraph, AstSize).extract(root);
        let sat = SatExtractor::new(&egraph, AstSize, BruteForceSolver).extract(root);
        let greedy_cost = dag_cost(&egraph, &mut AstSize, &greedy).unwrap();
        let sat_cost = dag_cost(&egraph, &mut AstSize, &sat).unwrap();
        assert!(sat_cost <= greedy_cost, "{} > {}", sat, greedy);
        assert_eq!(egraph.lookup_expr(&sat), Some(egraph.find(root)));
    }

    #[test]
    fn markers_are_avoided_when_there_is_a_choice() {
        let mut egraph = EGraph::<Untyped>::default();
        let five = egraph.add(Node::Const(Literal::Int(5))).unwrap();
        let attr = egraph.add(Node::Var("r".into())).unwrap();
        let marked = egraph.add(Node::Marker("range".into(), [five, attr])).unwrap();
        egraph.union(five, marked);
        egraph.rebuild();

        let best = SatExtractor::new(&egraph, AstSize, BruteForceSolver).extract(five);
        assert_eq!(best.to_string(), "5");
    }

    struct GiveUp;

    impl SatSolver for GiveUp {
        fn solve(&mut self, _model: &SatModel) -> Solution {
            Solution::without_assignment(SolveStatus::Unknown)
        }
    }

    #[test]
    fn non_optimal_falls_back_to_greedy() {
        let (egraph, root) = shared_vs_local();
        let greedy = Extractor::new(&egraph, AstSize).extract(root);
        let sat = SatExtractor::new(&egraph, AstSize, GiveUp).extract(root);
        assert_eq!(sat, greedy);
    }

    struct Inconsistent;

    impl SatSolver for Inconsistent {
        fn solve(&mut self, model: &SatModel) -> Solution {
            Solution {
                status: SolveStatus::Optimal,
                bools: vec![true; model.n_bools()],
                ints: vec![0; model.int_bounds().len()],
            }
        }
    }

    #[test]
    #[should_panic(expected = "expected exactly one")]
    fn inconsistent_assignment_is_fatal() {
        let (egraph, root) = shared_vs_local();
        SatExtractor::new(&egraph, AstSize, Inconsistent).extract(root);
    }

    #[test]
    fn validate_rejects_unknown_variables() {
        let mut model = SatModel::default();
        let a = model.new_bool();
        let i = model.new_int(0, 3);
        model.add_precedes(a, i, IntVar(7));
        assert!(matches!(model.validate(), Err(Error::InvalidModel(_))));

        let mut model = SatModel::default();
        model.new_int(2, 1);
        assert!(model.validate().is_err());
    }
}
