use log::*;
use rayon::prelude::*;

use crate::{
    util::{Duration, IndexMap, Instant},
    EGraph, Id, Match, Matcher, PatternMatcher, RecExpr, Result, Rule, Symbol, TypeSystem,
};

/** Faciliates running rewrites over an [`EGraph`].

Since an egraph never "forgets" state when applying a rule, you can
apply many rules many times quite efficiently. After the egraph is
"full" (the rules can no longer find new equalities) or some other
condition, it compactly represents many, many equivalent programs, and
it is ready for extraction (see [`Extractor`](crate::Extractor) and
[`SatExtractor`](crate::SatExtractor)).

Each round ([`step`](Runner::step)) has three phases:

1. **Match**: every rule's pattern is matched against the e-graph.
   The e-graph is not mutated while matching, so the rules are matched
   in parallel with [`rayon`](https://docs.rs/rayon).
2. **Apply**: on the calling thread, every match is offered to its rule,
   and the replacements the rules return are added and unioned with the
   matched classes.
3. **Rebuild**: the e-graph is rebuilt once for the whole round.

Because union is associative and commutative, and a union missed in one
round is still matchable in the next one, the order of the rules only
changes how many rounds saturation takes, not the saturated e-graph.

[`run`](Runner::run) repeats rounds until:

- a round did not change the e-graph's [`version`](EGraph::version):
  [`StopReason::Saturated`];
- the number of rounds hit the iteration limit (default 30):
  [`StopReason::IterationLimit`];
- the hash-cons grew past the node limit (default 10 000):
  [`StopReason::NodeLimit`];
- the time limit (default 5 s) ran out: [`StopReason::TimeLimit`].

[`Runner`] records an [`Iteration`] for every round.

# Example

```
use nnegg::{*, rewrite as rw};

let rules: &[Rewrite<Untyped>] = &[
    rw!("commute-add"; "(+ ?a ?b)" => "(+ ?b ?a)"),
    rw!("commute-mul"; "(* ?a ?b)" => "(* ?b ?a)"),
    rw!("add-0"; "(+ ?a 0)" => "?a"),
    rw!("mul-0"; "(* ?a 0)" => "0"),
    rw!("mul-1"; "(* ?a 1)" => "?a"),
];

let start = "(+ 0 (* 1 foo))".parse().unwrap();
// Runner is customizable in the builder pattern style.
let runner = Runner::default()
    .with_iter_limit(10)
    .with_node_limit(10_000)
    .with_expr(&start)
    .run(rules);

assert!(matches!(runner.stop_reason, Some(StopReason::Saturated)));
let foo = runner.egraph.lookup(Node::Var("foo".into())).unwrap();
assert_eq!(runner.egraph.find(runner.roots[0]), foo);
```
*/
pub struct Runner<T: TypeSystem> {
    /// The [`EGraph`] used.
    pub egraph: EGraph<T>,
    /// Data accumulated over each [`Iteration`].
    pub iterations: Vec<Iteration>,
    /// The roots of expressions added by the
    /// [`with_expr`](Runner::with_expr()) method, in insertion order.
    pub roots: Vec<Id>,
    /// Why the `Runner` stopped. This will be `None` if it hasn't
    /// stopped yet.
    pub stop_reason: Option<StopReason>,

    // limits
    iter_limit: usize,
    node_limit: usize,
    time_limit: Duration,

    start_time: Option<Instant>,
    matcher: Box<dyn Matcher<T>>,
}

impl<T: TypeSystem + Default> Default for Runner<T> {
    fn default() -> Self {
        Runner::new(T::default())
    }
}

/// Error returned by [`Runner`] when it stops.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The egraph saturated: a round changed nothing.
    Saturated,
    /// The iteration limit was hit. The data is the iteration limit.
    IterationLimit(usize),
    /// The enode limit was hit. The data is the enode limit.
    NodeLimit(usize),
    /// The time limit was hit. The data is the time limit in seconds.
    TimeLimit(f64),
}

/// Data generated by running a [`Runner`] one iteration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Iteration {
    /// The number of enodes in the egraph at the start of this
    /// iteration.
    pub egraph_nodes: usize,
    /// The number of eclasses in the egraph at the start of this
    /// iteration.
    pub egraph_classes: usize,
    /// A map from rule name to number of times it changed the e-graph.
    pub applied: IndexMap<Symbol, usize>,
    /// The number of matches the rules declined.
    pub declined: usize,
    /// Seconds spent matching in this iteration.
    pub search_time: f64,
    /// Seconds spent applying rules in this iteration.
    pub apply_time: f64,
    /// Seconds spent [`rebuild`](EGraph::rebuild())ing
    /// the egraph in this iteration.
    pub rebuild_time: f64,
    /// Total time spent in this iteration, including data generation time.
    pub total_time: f64,
    /// The number of repairs the rebuild processed.
    pub n_repairs: usize,
    /// If the runner stopped on this iterations, this is the reason
    pub stop_reason: Option<StopReason>,
}

/// What a [`Rule`] learns about the run it is part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RunContext {
    /// The index of the current round.
    pub iteration: usize,
}

type RunnerResult<T> = std::result::Result<T, StopReason>;

impl<T: TypeSystem> Runner<T> {
    /// Create a new `Runner` with the given type system and default
    /// limits.
    pub fn new(types: T) -> Self {
        Self {
            iter_limit: 30,
            node_limit: 10_000,
            time_limit: Duration::from_secs(5),

            egraph: EGraph::new(types),
            roots: vec![],
            iterations: vec![],
            stop_reason: None,

            start_time: None,
            matcher: Box::new(PatternMatcher),
        }
    }

    /// Sets the iteration limit. Default: 30
    pub fn with_iter_limit(self, iter_limit: usize) -> Self {
        Self { iter_limit, ..self }
    }

    /// Sets the egraph size limit (in enodes). Default: 10,000
    pub fn with_node_limit(self, node_limit: usize) -> Self {
        Self { node_limit, ..self }
    }

    /// Sets the runner time limit. Default: 5 seconds
    pub fn with_time_limit(self, time_limit: Duration) -> Self {
        Self { time_limit, ..self }
    }

    /// Change out the [`Matcher`] used to find rule matches.
    pub fn with_matcher(self, matcher: impl Matcher<T> + 'static) -> Self {
        let matcher = Box::new(matcher);
        Self { matcher, ..self }
    }

    /// Add an expression to the egraph to be run.
    ///
    /// The eclass id of this addition will be recorded in the
    /// [`roots`](Runner::roots) field, ordered by
    /// insertion order.
    ///
    /// Panics if the type system rejects `expr`; see
    /// [`try_with_expr`](Runner::try_with_expr).
    pub fn with_expr(self, expr: &RecExpr) -> Self {
        match self.try_with_expr(expr) {
            Ok(runner) => runner,
            Err(e) => panic!("Failed to add {}: {}", expr, e),
        }
    }

    /// Like [`with_expr`](Runner::with_expr), but returns the type
    /// inference error instead of panicking.
    pub fn try_with_expr(mut self, expr: &RecExpr) -> Result<Self> {
        let id = self.egraph.add_expr(expr)?;
        self.roots.push(id);
        Ok(self)
    }

    /// Replace the [`EGraph`] of this `Runner`.
    pub fn with_egraph(self, egraph: EGraph<T>) -> Self {
        Self { egraph, ..self }
    }

    /// Run this `Runner` until it stops.
    /// After this, the field
    /// [`stop_reason`](Runner::stop_reason) is guaranteed to be
    /// set.
    pub fn run<'a, R>(mut self, rules: impl IntoIterator<Item = &'a R>) -> Self
    where
        R: Rule<T> + 'a,
    {
        let rules: Vec<&R> = rules.into_iter().collect();
        check_rules(&rules);
        loop {
            if let Err(stop_reason) = self.step(&rules) {
                info!("Stopping: {:?}", stop_reason);
                self.stop_reason = Some(stop_reason.clone());
                // push on a final iteration to mark the end state
                self.iterations.push(Iteration {
                    stop_reason: Some(stop_reason),
                    egraph_nodes: self.egraph.total_size(),
                    egraph_classes: self.egraph.number_of_classes(),
                    applied: Default::default(),
                    declined: 0,
                    search_time: 0.0,
                    apply_time: 0.0,
                    rebuild_time: 0.0,
                    total_time: 0.0,
                    n_repairs: 0,
                });
                break;
            }
        }
        self
    }

    /// Runs exactly one round: match, apply, rebuild.
    ///
    /// Returns `Err` if the limits were already exceeded (nothing is done
    /// then) or if the round saturated the e-graph. Callers driving the
    /// rewrite loop themselves can use this to impose their own stopping
    /// policy.
    pub fn step<R: Rule<T>>(&mut self, rules: &[R]) -> RunnerResult<()> {
        self.try_start();
        self.check_limits()?;

        let i = self.iterations.len();
        info!("\nIteration {}", i);

        // the matcher relies on the invariants
        self.egraph.rebuild();

        let egraph_nodes = self.egraph.total_size();
        let egraph_classes = self.egraph.number_of_classes();
        let version = self.egraph.version();
        trace!("EGraph {:?}", self.egraph.dump());

        let start_time = Instant::now();

        let egraph = &self.egraph;
        let matcher = &*self.matcher;
        let matches: Vec<Vec<Match>> = rules
            .par_iter()
            .map(|rule| matcher.search(egraph, rule.pattern()))
            .collect();

        let search_time = start_time.elapsed().as_secs_f64();
        info!("Search time: {}", search_time);

        let apply_time = Instant::now();
        let ctx = RunContext { iteration: i };

        let mut applied = IndexMap::<Symbol, usize>::default();
        let mut declined = 0;
        for (rule, ms) in rules.iter().zip(matches) {
            if ms.is_empty() {
                continue;
            }
            debug!("Applying {} {} times", rule.name(), ms.len());

            let mut n = 0;
            for m in &ms {
                let replacement = match rule.get_replacement(&self.egraph, m, &ctx) {
                    Some(replacement) => replacement,
                    None => {
                        declined += 1;
                        continue;
                    }
                };
                let id = match self.egraph.add_instantiation(&replacement, &m.subst) {
                    Ok(id) => id,
                    Err(e) => panic!(
                        "Rule '{}' produced an ill-typed replacement for {} in class {}: {}",
                        rule.name(),
                        m.node,
                        m.root,
                        e
                    ),
                };
                if self.egraph.union(id, m.root) {
                    n += 1;
                }
            }

            if n > 0 {
                *applied.entry(rule.name()).or_default() += n;
                debug!("Applied {} {} times", rule.name(), n);
            }

            if self.check_limits().is_err() {
                break;
            }
        }
        trace!("Declined {} matches", declined);

        let apply_time = apply_time.elapsed().as_secs_f64();
        info!("Apply time: {}", apply_time);

        let rebuild_time = Instant::now();
        let n_repairs = self.egraph.rebuild();

        let rebuild_time = rebuild_time.elapsed().as_secs_f64();
        info!("Rebuild time: {}", rebuild_time);
        info!(
            "Size: n={}, e={}",
            self.egraph.total_size(),
            self.egraph.number_of_classes()
        );

        let saturated = self.egraph.version() == version;

        self.iterations.push(Iteration {
            applied,
            declined,
            egraph_nodes,
            egraph_classes,
            search_time,
            apply_time,
            rebuild_time,
            n_repairs,
            total_time: start_time.elapsed().as_secs_f64(),
            stop_reason: None,
        });

        if saturated {
            Err(StopReason::Saturated)
        } else {
            Ok(())
        }
    }

    /// Prints some information about a runs.
    #[rustfmt::skip]
    pub fn print_report(&self) {
        let search_time: f64 = self.iterations.iter().map(|i| i.search_time).sum();
        let apply_time: f64 = self.iterations.iter().map(|i| i.apply_time).sum();
        let rebuild_time: f64 = self.iterations.iter().map(|i| i.rebuild_time).sum();
        let total_time: f64 = self.iterations.iter().map(|i| i.total_time).sum();

        let iters = self.iterations.len();
        let repairs: usize = self.iterations.iter().map(|i| i.n_repairs).sum();

        let mut applied = IndexMap::<Symbol, usize>::default();
        for iteration in &self.iterations {
            for (&name, &n) in &iteration.applied {
                *applied.entry(name).or_default() += n;
            }
        }

        let eg = &self.egraph;
        println!("Runner report");
        println!("=============");
        println!("  Stop reason: {:?}", self.stop_reason);
        println!("  Iterations: {}", iters);
        println!("  Egraph size: {} nodes, {} classes, {} memo", eg.total_number_of_nodes(), eg.number_of_classes(), eg.total_size());
        println!("  Repairs: {}, {:.2} per iter", repairs, (repairs as f64) / (iters as f64));
        println!("  Total time: {}", total_time);
        println!("    Search:  ({:.2}) {}", search_time / total_time, search_time);
        println!("    Apply:   ({:.2}) {}", apply_time / total_time, apply_time);
        println!("    Rebuild: ({:.2}) {}", rebuild_time / total_time, rebuild_time);
        println!("  Applied:");
        for (name, n) in &applied {
            println!("    {}: {}", name, n);
        }
    }

    fn try_start(&mut self) {
        self.start_time.get_or_insert_with(Instant::now);
    }

    fn check_limits(&self) -> RunnerResult<()> {
        if let Some(start_time) = self.start_time {
            let elapsed = start_time.elapsed();
            if elapsed > self.time_limit {
                return Err(StopReason::TimeLimit(elapsed.as_secs_f64()));
            }
        }

        let size = self.egraph.total_size();
        if size > self.node_limit {
            return Err(StopReason::NodeLimit(size));
        }

        if self.iterations.len() >= self.iter_limit {
            return Err(StopReason::IterationLimit(self.iterations.len()));
        }

        Ok(())
    }
}

fn check_rules<T: TypeSystem, R: Rule<T>>(rules: &[R]) {
    let mut name_counts = IndexMap::<Symbol, usize>::default();
    for rule in rules {
        *name_counts.entry(rule.name()).or_default() += 1
    }

    name_counts.retain(|_, count| *count > 1);
    if !name_counts.is_empty() {
        warn!("Duplicated rule names may affect rule reporting.");
        for (name, &count) in name_counts.iter() {
            warn!("Rule '{}' appears {} times", name, count);
        }
    }
}
