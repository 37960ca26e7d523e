use std::fmt::{self, Display};
use std::str::FromStr;

use log::*;
use symbolic_expressions::Sexp;

use crate::{
    language::{parse_leaf, parse_sexp_into},
    EGraph, Error, Id, Language, Node, RecExpr, Result, Subst, TypeSystem, Var,
};

/// A pattern that can function as either a searcher or the template of a
/// replacement.
///
/// A [`Pattern`] is essentially a for-all quantified expression with
/// [`Var`]s as the variables (in the logical sense).
///
/// When searching, a pattern finds every class (and every node in it)
/// that has the pattern's shape, binding each variable to the class in
/// its position. Repeated variables must bind to the same class.
///
/// Patterns use the same s-expression syntax as [`RecExpr`], plus
/// `?name` leaves:
///
/// ```
/// use nnegg::*;
///
/// let p: Pattern = "(+ ?a (* ?b 2))".parse().unwrap();
/// assert_eq!(p.vars().len(), 2);
/// assert_eq!(p.to_string(), "(+ ?a (* ?b 2))");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    /// The actual pattern as a [`RecExpr`]
    pub ast: PatternAst,
}

/// A [`RecExpr`] that represents a [`Pattern`].
pub type PatternAst = RecExpr<ENodeOrVar>;

/// The language of [`Pattern`]s.
#[derive(Debug, Hash, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub enum ENodeOrVar {
    /// An enode from the underlying [`Node`] language.
    ENode(Node),
    /// A pattern variable.
    Var(Var),
}

impl Language for ENodeOrVar {
    fn children(&self) -> &[Id] {
        match self {
            ENodeOrVar::ENode(n) => n.children(),
            ENodeOrVar::Var(_) => &[],
        }
    }

    fn children_mut(&mut self) -> &mut [Id] {
        match self {
            ENodeOrVar::ENode(n) => n.children_mut(),
            ENodeOrVar::Var(_) => &mut [],
        }
    }
}

impl From<Node> for ENodeOrVar {
    fn from(n: Node) -> Self {
        ENodeOrVar::ENode(n)
    }
}

/// A single match of a [`Pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The canonical class the pattern's root matched.
    pub root: Id,
    /// The member of `root` the pattern's root matched.
    pub node: Node,
    /// The bindings of the pattern's variables.
    pub subst: Subst,
}

/// Finds the matches of a [`Pattern`] in an [`EGraph`].
///
/// Matching runs concurrently for all rules of a round, on a shared
/// `&EGraph`, so implementations must be `Send + Sync`.
pub trait Matcher<T: TypeSystem>: Send + Sync {
    /// Returns every match of `pattern` in `egraph`.
    fn search(&self, egraph: &EGraph<T>, pattern: &Pattern) -> Vec<Match>;
}

/// The default [`Matcher`]: a backtracking search over every class.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternMatcher;

impl<T: TypeSystem> Matcher<T> for PatternMatcher {
    fn search(&self, egraph: &EGraph<T>, pattern: &Pattern) -> Vec<Match> {
        pattern.search(egraph)
    }
}

impl Pattern {
    /// Creates a new pattern from the given pattern ast.
    pub fn new(ast: PatternAst) -> Self {
        Self { ast }
    }

    /// Returns a list of the [`Var`]s in this pattern, in order of first
    /// occurrence.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![];
        for n in self.ast.as_ref() {
            if let ENodeOrVar::Var(v) = n {
                if !vars.contains(v) {
                    vars.push(*v)
                }
            }
        }
        vars
    }

    /// Searches every class of the e-graph.
    ///
    /// A pattern whose root is a variable matches every class once, with
    /// the class's first node as the matched node.
    pub fn search<T: TypeSystem>(&self, egraph: &EGraph<T>) -> Vec<Match> {
        egraph
            .classes()
            .flat_map(|class| self.search_eclass(egraph, class.id))
            .collect()
    }

    /// Searches a single class.
    pub fn search_eclass<T: TypeSystem>(&self, egraph: &EGraph<T>, eclass: Id) -> Vec<Match> {
        let root = egraph.find(eclass);
        let class = &egraph[root];
        let matches: Vec<Match> = match &self.ast[self.ast.root()] {
            ENodeOrVar::Var(v) => {
                let mut subst = Subst::with_capacity(1);
                subst.insert(*v, root);
                class
                    .iter()
                    .next()
                    .map(|node| Match {
                        root,
                        node: node.clone(),
                        subst,
                    })
                    .into_iter()
                    .collect()
            }
            ENodeOrVar::ENode(pnode) => class
                .iter()
                .filter(|node| pnode.matches(node))
                .flat_map(|node| {
                    self.match_node(egraph, pnode, node, Subst::default())
                        .into_iter()
                        .map(move |subst| Match {
                            root,
                            node: node.clone(),
                            subst,
                        })
                })
                .collect(),
        };
        if !matches.is_empty() {
            trace!("Found {} matches of {} in {}", matches.len(), self, root);
        }
        matches
    }

    fn match_class<T: TypeSystem>(
        &self,
        egraph: &EGraph<T>,
        pat: Id,
        eclass: Id,
        mut subst: Subst,
    ) -> Vec<Subst> {
        match &self.ast[pat] {
            ENodeOrVar::Var(v) => match subst.get(*v) {
                None => {
                    subst.insert(*v, egraph.find(eclass));
                    vec![subst]
                }
                Some(&bound) if egraph.find(bound) == egraph.find(eclass) => vec![subst],
                Some(_) => vec![],
            },
            ENodeOrVar::ENode(pnode) => egraph[eclass]
                .iter()
                .filter(|node| pnode.matches(node))
                .flat_map(|node| self.match_node(egraph, pnode, node, subst.clone()))
                .collect(),
        }
    }

    fn match_node<T: TypeSystem>(
        &self,
        egraph: &EGraph<T>,
        pnode: &Node,
        node: &Node,
        subst: Subst,
    ) -> Vec<Subst> {
        let mut substs = vec![subst];
        for (&pat, &child) in pnode.children().iter().zip(node.children()) {
            substs = substs
                .into_iter()
                .flat_map(|s| self.match_class(egraph, pat, child, s))
                .collect();
            if substs.is_empty() {
                break;
            }
        }
        substs
    }

    fn to_sexp(&self, i: Id) -> Sexp {
        let sub = |id: Id| self.to_sexp(id);
        let node = match &self.ast[i] {
            ENodeOrVar::Var(v) => return Sexp::String(v.to_string()),
            ENodeOrVar::ENode(node) => node,
        };
        let mut list = vec![];
        match node {
            Node::Call(xs) => match &self.ast[xs[0]] {
                ENodeOrVar::ENode(Node::Op(op)) => list.push(Sexp::String(op.to_string())),
                _ => {
                    list.push(Sexp::String("call".into()));
                    list.push(sub(xs[0]));
                }
            },
            Node::Function(name, _) | Node::Marker(name, _) => {
                let head = if node.is_marker() { "marker" } else { "fn" };
                list.push(Sexp::String(head.into()));
                list.push(Sexp::String(name.to_string()));
            }
            Node::Tuple(_) => list.push(Sexp::String("tuple".into())),
            Node::If(_) => list.push(Sexp::String("if".into())),
            leaf => return Sexp::String(leaf.to_string()),
        }
        let skip = matches!(node, Node::Call(_)) as usize;
        list.extend(node.children()[skip..].iter().map(|&c| sub(c)));
        Sexp::List(list)
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let sexp = symbolic_expressions::parser::parse_str(s.trim())
            .map_err(|e| Error::Parse(e.to_string()))?;
        let atom = |s: &str| match s.parse::<Var>() {
            Ok(v) => Some(ENodeOrVar::Var(v)),
            Err(_) => parse_leaf(s).map(ENodeOrVar::ENode),
        };
        let mut ast = PatternAst::default();
        parse_sexp_into(&sexp, &mut ast, &atom, &ENodeOrVar::ENode).map_err(Error::Parse)?;
        Ok(Pattern::new(ast))
    }
}

impl From<PatternAst> for Pattern {
    fn from(ast: PatternAst) -> Self {
        Self::new(ast)
    }
}

impl From<&RecExpr> for Pattern {
    fn from(expr: &RecExpr) -> Self {
        let nodes: Vec<ENodeOrVar> = expr.as_ref().iter().cloned().map(ENodeOrVar::ENode).collect();
        Self::new(nodes.into())
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ast.is_empty() {
            return write!(f, "()");
        }
        write!(f, "{}", self.to_sexp(self.ast.root()))
    }
}

impl<T: TypeSystem> EGraph<T> {
    /// Adds `pat` to the e-graph, with its variables replaced by the
    /// classes `subst` binds them to. Returns the class of the root.
    ///
    /// Panics if `pat` mentions a variable that `subst` does not bind.
    pub fn add_instantiation(&mut self, pat: &PatternAst, subst: &Subst) -> Result<Id> {
        let mut ids: Vec<Id> = Vec::with_capacity(pat.len());
        for entry in pat.as_ref() {
            let id = match entry {
                ENodeOrVar::Var(v) => subst[*v],
                ENodeOrVar::ENode(node) => {
                    let node = node.clone().map_children(|i| ids[usize::from(i)]);
                    self.add(node)?
                }
            };
            ids.push(id);
        }
        ids.last()
            .copied()
            .ok_or_else(|| Error::Parse("cannot instantiate an empty pattern".into()))
    }
}
