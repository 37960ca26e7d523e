use std::fmt;
use std::sync::Arc;

use crate::{EGraph, Error, Match, Pattern, PatternAst, Result, RunContext, Symbol, TypeSystem};

/// A rewrite rule: a [`Pattern`] to search for, and a way to compute the
/// expression each match is equal to.
///
/// The [`Runner`](crate::Runner) matches [`pattern`](Rule::pattern) in
/// parallel, then asks [`get_replacement`](Rule::get_replacement) for
/// each match. The replacement's `?vars` are instantiated from the
/// match's substitution, the result is added to the e-graph and unioned
/// with the matched class.
///
/// The [`Rewrite`] struct and the [`rewrite!`](crate::rewrite!) macro
/// cover most uses; implement this trait for rules that need their own
/// state.
pub trait Rule<T: TypeSystem>: Send + Sync {
    /// The name used for reporting.
    fn name(&self) -> Symbol;

    /// The left-hand side.
    fn pattern(&self) -> &Pattern;

    /// Returns the replacement for `m`, or `None` to decline the match.
    ///
    /// The replacement must be well typed: a replacement the
    /// [`TypeSystem`] rejects aborts the run.
    fn get_replacement(&self, egraph: &EGraph<T>, m: &Match, ctx: &RunContext)
        -> Option<PatternAst>;
}

impl<T: TypeSystem, R: Rule<T> + ?Sized> Rule<T> for Box<R> {
    fn name(&self) -> Symbol {
        (**self).name()
    }

    fn pattern(&self) -> &Pattern {
        (**self).pattern()
    }

    fn get_replacement(
        &self,
        egraph: &EGraph<T>,
        m: &Match,
        ctx: &RunContext,
    ) -> Option<PatternAst> {
        (**self).get_replacement(egraph, m, ctx)
    }
}

impl<T: TypeSystem, R: Rule<T> + ?Sized> Rule<T> for &R {
    fn name(&self) -> Symbol {
        (**self).name()
    }

    fn pattern(&self) -> &Pattern {
        (**self).pattern()
    }

    fn get_replacement(
        &self,
        egraph: &EGraph<T>,
        m: &Match,
        ctx: &RunContext,
    ) -> Option<PatternAst> {
        (**self).get_replacement(egraph, m, ctx)
    }
}

type ReplacementFn<T> =
    dyn Fn(&EGraph<T>, &Match, &RunContext) -> Option<PatternAst> + Send + Sync;

/// A rewrite that searches for the lefthand side and applies the righthand side.
///
/// The [`rewrite!`](crate::rewrite!) macro is the easiest way to create
/// rewrites from two patterns. [`Rewrite::new`] takes a closure instead,
/// for replacements that depend on the match.
///
/// # Example
/// ```
/// use nnegg::{rewrite as rw, *};
///
/// let rules: Vec<Rewrite<Untyped>> = vec![
///     rw!("mul-2"; "(* ?a 2)" => "(+ ?a ?a)"),
///     // only fire on literal operands
///     rw!("fold-neg"; "(neg ?a)" => "(* ?a -1)"
///         if |egraph: &EGraph<Untyped>, m: &Match| {
///             let a = m.subst["?a".parse::<Var>().unwrap()];
///             egraph[a].iter().any(|n| n.is_const())
///         }),
/// ];
///
/// let start = "(+ (neg 3) (neg x))".parse().unwrap();
/// let runner = Runner::default().with_expr(&start).run(&rules);
/// let egraph = &runner.egraph;
///
/// let folded = egraph.lookup_expr(&"(* 3 -1)".parse().unwrap()).unwrap();
/// let neg3 = egraph.lookup_expr(&"(neg 3)".parse().unwrap()).unwrap();
/// assert_eq!(egraph.find(folded), egraph.find(neg3));
/// assert!(egraph.lookup_expr(&"(* x -1)".parse().unwrap()).is_none());
/// ```
#[non_exhaustive]
pub struct Rewrite<T: TypeSystem> {
    /// The name of the rewrite.
    pub name: Symbol,
    /// The searcher (left-hand side) of the rewrite.
    pub searcher: Pattern,
    replacement: Arc<ReplacementFn<T>>,
}

impl<T: TypeSystem> Clone for Rewrite<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            searcher: self.searcher.clone(),
            replacement: self.replacement.clone(),
        }
    }
}

impl<T: TypeSystem> fmt::Debug for Rewrite<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rewrite")
            .field("name", &self.name)
            .field("searcher", &self.searcher.to_string())
            .finish()
    }
}

impl<T: TypeSystem + 'static> Rewrite<T> {
    /// Create a new [`Rewrite`] whose replacement is computed by
    /// `replacement`.
    pub fn new(
        name: impl Into<Symbol>,
        searcher: Pattern,
        replacement: impl Fn(&EGraph<T>, &Match, &RunContext) -> Option<PatternAst>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            searcher,
            replacement: Arc::new(replacement),
        }
    }

    /// Create a new [`Rewrite`] from two patterns. You typically want to
    /// use the [`rewrite!`](crate::rewrite!) macro instead.
    ///
    /// Fails if the right-hand side uses a variable the left-hand side
    /// does not bind.
    pub fn from_patterns(name: impl Into<Symbol>, searcher: Pattern, applier: Pattern) -> Result<Self> {
        let name = name.into();
        let bound = searcher.vars();
        for v in applier.vars() {
            if !bound.contains(&v) {
                return Err(Error::Parse(format!(
                    "Rewrite {} refers to unbound var {}",
                    name, v
                )));
            }
        }
        let ast = applier.ast;
        Ok(Self::new(name, searcher, move |_, _, _| Some(ast.clone())))
    }

    /// Only replace the matches for which `condition` holds.
    pub fn with_condition(
        self,
        condition: impl Fn(&EGraph<T>, &Match) -> bool + Send + Sync + 'static,
    ) -> Self {
        let inner = self.replacement;
        Self {
            replacement: Arc::new(move |egraph: &EGraph<T>, m: &Match, ctx: &RunContext| {
                if condition(egraph, m) {
                    inner(egraph, m, ctx)
                } else {
                    None
                }
            }),
            ..self
        }
    }

    /// Searches, instantiates and unions in one go, without rebuilding.
    /// Returns the number of unions that changed the e-graph.
    #[cfg(test)]
    pub(crate) fn run(&self, egraph: &mut EGraph<T>) -> usize {
        let ctx = RunContext { iteration: 0 };
        let matches = self.searcher.search(egraph);
        let mut applied = 0;
        for m in matches {
            if let Some(ast) = self.get_replacement(egraph, &m, &ctx) {
                let id = egraph.add_instantiation(&ast, &m.subst).unwrap();
                applied += egraph.union(id, m.root) as usize;
            }
        }
        applied
    }
}

impl<T: TypeSystem> Rule<T> for Rewrite<T> {
    fn name(&self) -> Symbol {
        self.name
    }

    fn pattern(&self) -> &Pattern {
        &self.searcher
    }

    fn get_replacement(
        &self,
        egraph: &EGraph<T>,
        m: &Match,
        ctx: &RunContext,
    ) -> Option<PatternAst> {
        (self.replacement)(egraph, m, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Id, Node, RecExpr, Untyped, Var};

    #[test]
    fn conditional_rewrite() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let mul = egraph.add_expr(&"(* x 2)".parse().unwrap()).unwrap();

        let pow2: Pattern = "(is-power2 ?b)".parse().unwrap();
        let mul_to_shift = crate::rewrite!(
            "mul_to_shift";
            "(* ?a ?b)" => "(>> ?a (log2 ?b))"
            if move |egraph: &EGraph<Untyped>, m: &Match| {
                let truth = egraph.lookup(Node::Const(true.into()));
                pow2.search(egraph)
                    .iter()
                    .any(|p| p.subst.iter().all(|(_, b)| b == m.subst["?b".parse::<Var>().unwrap()])
                        && Some(p.root) == truth)
            }
        );

        egraph.rebuild();
        assert_eq!(mul_to_shift.run(&mut egraph), 0);

        let is_pow2 = egraph.add_expr(&"(is-power2 2)".parse().unwrap()).unwrap();
        let truth = egraph.add(Node::Const(true.into())).unwrap();
        egraph.union(is_pow2, truth);
        egraph.rebuild();

        assert_eq!(mul_to_shift.run(&mut egraph), 1);
        egraph.rebuild();
        let shifted = egraph.lookup_expr(&"(>> x (log2 2))".parse().unwrap());
        assert_eq!(shifted, Some(egraph.find(mul)));
    }

    #[test]
    fn fn_rewrite() {
        crate::init_logger();
        let mut egraph = EGraph::<Untyped>::default();
        let root = egraph.add_expr(&"(+ x y)".parse().unwrap()).unwrap();

        fn var_name(egraph: &EGraph<Untyped>, id: Id) -> Option<Symbol> {
            egraph[id].iter().find_map(|n| match n {
                Node::Var(v) => Some(*v),
                _ => None,
            })
        }

        let a: Var = "?a".parse().unwrap();
        let b: Var = "?b".parse().unwrap();
        let append = Rewrite::new(
            "append",
            "(+ ?a ?b)".parse().unwrap(),
            move |egraph: &EGraph<Untyped>, m: &Match, _: &RunContext| {
                let a = var_name(egraph, m.subst[a])?;
                let b = var_name(egraph, m.subst[b])?;
                let expr: RecExpr = format!("{}{}", a, b).parse().ok()?;
                Some(Pattern::from(&expr).ast)
            },
        );

        assert_eq!(append.run(&mut egraph), 1);
        egraph.rebuild();
        let xy = egraph.lookup(Node::Var("xy".into())).unwrap();
        assert_eq!(egraph.find(root), xy);
    }

    #[test]
    fn unbound_rhs_vars_are_rejected() {
        let lhs: Pattern = "(+ ?a 0)".parse().unwrap();
        let rhs: Pattern = "(+ ?b 0)".parse().unwrap();
        assert!(Rewrite::<Untyped>::from_patterns("bad", lhs, rhs).is_err());
    }
}
