#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
/*!

`nnegg` is the equality saturation core of a tensor program optimizer.

A program (an expression over tensor operators) is loaded into an
[`EGraph`], a [`Runner`] applies a set of [`Rule`]s until the e-graph
saturates, and then an extractor picks the cheapest equivalent program:
either the greedy [`Extractor`] or the solver-backed [`SatExtractor`].

The type system, the cost model, and the constraint solver are all
pluggable through the [`TypeSystem`], [`CostFunction`] and [`SatSolver`]
traits.

## Logging

Many parts of `nnegg` dump useful logging info using the [`log`](https://docs.rs/log/) crate.
The easiest way to see this info is to use the [`env_logger`](https://docs.rs/env_logger/)
crate in your binary or test, and set `RUST_LOG=nnegg=info`.

## Simple Example

```
use nnegg::{rewrite as rw, *};

let rules: Vec<Rewrite<Untyped>> = vec![
    rw!("add-0"; "(+ ?a 0)" => "?a"),
    rw!("commute-add"; "(+ ?a ?b)" => "(+ ?b ?a)"),
];

let start: RecExpr = "(+ 0 (+ x 0))".parse().unwrap();
let runner = Runner::default().with_expr(&start).run(&rules);

let extractor = Extractor::new(&runner.egraph, AstSize);
let (cost, best) = extractor.find_best(runner.roots[0]);
assert_eq!(best.to_string(), "x");
assert_eq!(cost, Score::from(1.0));
```
*/

mod macros;


mod dot;
mod eclass;
mod egraph;
mod extract;
mod language;
#[cfg(feature = "lp")]
mod lp_solver;
mod pattern;
mod rewrite;
mod run;
mod sat_extract;
mod subst;
mod types;
mod unionfind;
mod util;

/// A key to identify [`EClass`]es within an
/// [`EGraph`].
#[derive(Clone, Copy, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Id(u32);

impl From<usize> for Id {
    fn from(n: usize) -> Id {
        Id(n as u32)
    }
}

impl From<Id> for usize {
    fn from(id: Id) -> usize {
        id.0 as usize
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by fallible `nnegg` operations.
///
/// Broken invariants inside the core (a reachable class with no
/// candidates, an inconsistent solver assignment, ...) are bugs and
/// panic instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The [`TypeSystem`] rejected a node while it was being added.
    #[error("type inference failed for `{node}`: {source}")]
    TypeInference {
        /// The offending node, printed.
        node: String,
        /// What the type system reported.
        source: TypeError,
    },
    /// An expression or pattern could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// A [`SatModel`] failed validation.
    #[error("malformed solver model: {0}")]
    InvalidModel(String),
}

/// Shorthand for results carrying an `nnegg` [`Error`].
pub(crate) type Result<T> = std::result::Result<T, Error>;

pub(crate) use unionfind::UnionFind;

pub use {
    dot::Dot,
    eclass::EClass,
    egraph::EGraph,
    extract::*,
    language::*,
    pattern::{ENodeOrVar, Match, Matcher, Pattern, PatternAst, PatternMatcher},
    rewrite::{Rewrite, Rule},
    run::*,
    sat_extract::*,
    subst::{Subst, Var},
    types::{join_types, TypeError, TypeSystem, Untyped},
    util::Symbol,
};

#[cfg(feature = "lp")]
pub use lp_solver::LpSolver;

#[cfg(test)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
