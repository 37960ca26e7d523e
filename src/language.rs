use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use ordered_float::OrderedFloat;
use smallvec::SmallVec;
use symbolic_expressions::Sexp;

use crate::{util::pretty_sexp, Error, Id, Symbol};

/// The child list of a variadic [`Node`].
pub type Children = SmallVec<[Id; 4]>;

/// Something with an ordered list of child [`Id`]s.
///
/// Implemented by [`Node`] (the payload of an e-node) and by
/// [`ENodeOrVar`](crate::ENodeOrVar) (an entry of a pattern), so both can
/// live in a [`RecExpr`].
pub trait Language: Debug + Clone + Eq + Ord + Hash {
    /// Return a slice of the children `Id`s.
    fn children(&self) -> &[Id];

    /// Return a mutable slice of the children `Id`s.
    fn children_mut(&mut self) -> &mut [Id];

    /// Runs a given function on each child `Id`.
    fn for_each<F: FnMut(Id)>(&self, f: F) {
        self.children().iter().copied().for_each(f)
    }

    /// Returns true if this node has no children.
    fn is_leaf(&self) -> bool {
        self.children().is_empty()
    }

    /// Runs a given function to replace the children.
    fn update_children<F: FnMut(Id) -> Id>(&mut self, mut f: F) {
        self.children_mut().iter_mut().for_each(|id| *id = f(*id))
    }

    /// Creates a new node with children determined by the given function.
    fn map_children<F: FnMut(Id) -> Id>(mut self, f: F) -> Self {
        self.update_children(f);
        self
    }
}

/// A constant value carried by [`Node::Const`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Literal {
    /// A boolean scalar.
    Bool(bool),
    /// An integer scalar.
    Int(i64),
    /// A floating point scalar.
    Float(OrderedFloat<f64>),
}

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            // keep the `.0` so the literal reparses as a float
            Literal::Float(x) => write!(f, "{:?}", x.into_inner()),
        }
    }
}

impl FromStr for Literal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "true" => return Ok(Literal::Bool(true)),
            "false" => return Ok(Literal::Bool(false)),
            _ => {}
        }
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Literal::Int(i));
        }
        match s.parse::<f64>() {
            Ok(x) if s.contains(|c: char| c.is_ascii_digit()) => Ok(Literal::Float(x.into())),
            _ => Err(format!("'{}' is not a literal", s)),
        }
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Int(i)
    }
}

impl From<f64> for Literal {
    fn from(x: f64) -> Self {
        Literal::Float(x.into())
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

/// The payload of an e-node: one concrete way to compute a value.
///
/// Leaves carry their data inline. Composite nodes refer to the
/// e-classes of their operands by [`Id`]. Two nodes are the same node
/// iff their payloads and their child ids (in order) are equal, which is
/// exactly the derived `Eq`/`Hash`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Node {
    /// A free variable, usually a graph input.
    Var(Symbol),
    /// A constant.
    Const(Literal),
    /// A primitive operator, the target of a [`Node::Call`].
    Op(Symbol),
    /// A reference to an already fused kernel.
    Fusion(Symbol),
    /// The empty value.
    None,
    /// A named function: `[body, params..]`.
    Function(Symbol, Children),
    /// An application: `[target, args..]`.
    Call(Children),
    /// A tuple of fields.
    Tuple(Children),
    /// A transparent annotation of `target` with `attribute`:
    /// `[target, attribute]`. The value is `target`'s.
    Marker(Symbol, [Id; 2]),
    /// A conditional: `[cond, then, else]`.
    If([Id; 3]),
}

impl Node {
    /// Makes a call to the primitive whose operator lives in class `op`.
    pub fn call(op: Id, args: impl IntoIterator<Item = Id>) -> Self {
        let mut children = Children::new();
        children.push(op);
        children.extend(args);
        Node::Call(children)
    }

    /// Returns true if this node matches another node.
    /// This only considers the payload and arity, not the children `Id`s.
    pub fn matches(&self, other: &Self) -> bool {
        use Node::*;
        match (self, other) {
            (Var(a), Var(b)) | (Op(a), Op(b)) | (Fusion(a), Fusion(b)) => a == b,
            (Const(a), Const(b)) => a == b,
            (Node::None, Node::None) | (If(_), If(_)) => true,
            (Function(a, xs), Function(b, ys)) => a == b && xs.len() == ys.len(),
            (Call(xs), Call(ys)) | (Tuple(xs), Tuple(ys)) => xs.len() == ys.len(),
            (Marker(a, _), Marker(b, _)) => a == b,
            _ => false,
        }
    }

    /// Returns true for [`Node::Marker`].
    pub fn is_marker(&self) -> bool {
        matches!(self, Node::Marker(..))
    }

    /// Returns true for [`Node::Const`].
    pub fn is_const(&self) -> bool {
        matches!(self, Node::Const(_))
    }

    /// Tie-break rank used by extraction: markers, then constants, then
    /// everything else.
    pub fn priority(&self) -> u8 {
        match self {
            Node::Marker(..) => 0,
            Node::Const(_) => 1,
            _ => 2,
        }
    }

    fn head(&self) -> String {
        match self {
            Node::Var(v) => v.to_string(),
            Node::Const(c) => c.to_string(),
            Node::Op(op) => format!("op:{}", op),
            Node::Fusion(name) => format!("fusion:{}", name),
            Node::None => "none".into(),
            Node::Function(..) => "fn".into(),
            Node::Call(_) => "call".into(),
            Node::Tuple(_) => "tuple".into(),
            Node::Marker(..) => "marker".into(),
            Node::If(_) => "if".into(),
        }
    }
}

impl Language for Node {
    fn children(&self) -> &[Id] {
        match self {
            Node::Var(_) | Node::Const(_) | Node::Op(_) | Node::Fusion(_) | Node::None => &[],
            Node::Function(_, xs) | Node::Call(xs) | Node::Tuple(xs) => xs,
            Node::Marker(_, xs) => xs,
            Node::If(xs) => xs,
        }
    }

    fn children_mut(&mut self) -> &mut [Id] {
        match self {
            Node::Var(_) | Node::Const(_) | Node::Op(_) | Node::Fusion(_) | Node::None => &mut [],
            Node::Function(_, xs) | Node::Call(xs) | Node::Tuple(xs) => xs,
            Node::Marker(_, xs) => xs,
            Node::If(xs) => xs,
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Function(name, _) => write!(f, "fn {}", name),
            Node::Marker(kind, _) => write!(f, "marker {}", kind),
            _ => f.write_str(&self.head()),
        }
    }
}

/// A recursive expression, stored flat.
///
/// Every node's children must refer to entries that come before it in
/// the list, and the last entry is the root. Sub-expressions shared in
/// the program appear only once.
///
/// A `RecExpr<Node>` is a concrete program; a
/// [`PatternAst`](crate::PatternAst) is a `RecExpr<ENodeOrVar>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecExpr<L = Node> {
    nodes: Vec<L>,
}

impl<L> Default for RecExpr<L> {
    fn default() -> Self {
        Self { nodes: vec![] }
    }
}

impl<L> AsRef<[L]> for RecExpr<L> {
    fn as_ref(&self) -> &[L] {
        &self.nodes
    }
}

impl<L: Language> From<Vec<L>> for RecExpr<L> {
    fn from(nodes: Vec<L>) -> Self {
        Self { nodes }
    }
}

impl<L: Language> Index<Id> for RecExpr<L> {
    type Output = L;
    fn index(&self, id: Id) -> &L {
        &self.nodes[usize::from(id)]
    }
}

impl<L: Language> IndexMut<Id> for RecExpr<L> {
    fn index_mut(&mut self, id: Id) -> &mut L {
        &mut self.nodes[usize::from(id)]
    }
}

impl<L: Language> RecExpr<L> {
    /// Adds a given node to this expression.
    /// The node's children must refer to entries already in this list.
    pub fn add(&mut self, node: L) -> Id {
        debug_assert!(
            node.children()
                .iter()
                .all(|&id| usize::from(id) < self.nodes.len()),
            "node {:?} has children not in this expr: {:?}",
            node,
            self
        );
        self.nodes.push(node);
        Id::from(self.nodes.len() - 1)
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id of the root, the last entry.
    ///
    /// Panics on an empty expression.
    pub fn root(&self) -> Id {
        assert!(!self.is_empty(), "empty expression has no root");
        Id::from(self.nodes.len() - 1)
    }
}

impl RecExpr<Node> {
    fn to_sexp(&self, i: Id) -> Sexp {
        let node = &self[i];
        let sub = |id: Id| self.to_sexp(id);
        let mut list = vec![];
        match node {
            Node::Call(xs) => match &self[xs[0]] {
                Node::Op(op) => list.push(Sexp::String(op.to_string())),
                _ => {
                    list.push(Sexp::String("call".into()));
                    list.push(sub(xs[0]));
                }
            },
            Node::Function(name, _) | Node::Marker(name, _) => {
                list.push(Sexp::String(node.head()));
                list.push(Sexp::String(name.to_string()));
            }
            Node::Tuple(_) | Node::If(_) => list.push(Sexp::String(node.head())),
            leaf => return Sexp::String(leaf.head()),
        }
        let skip = matches!(node, Node::Call(_)) as usize;
        list.extend(node.children()[skip..].iter().map(|&c| sub(c)));
        Sexp::List(list)
    }

    /// Pretty print with a maximum line length.
    ///
    /// # Example
    /// ```
    /// # use nnegg::*;
    /// let e: RecExpr = "(* (+ 2 2) (+ x y))".parse().unwrap();
    /// assert_eq!(e.pretty(10), "
    /// (*
    ///   (+ 2 2)
    ///   (+ x y))
    /// ".trim());
    /// ```
    pub fn pretty(&self, width: usize) -> String {
        pretty_sexp(&self.to_sexp(self.root()), width)
    }
}

impl Display for RecExpr<Node> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "()")
        } else {
            let s = self.to_sexp(self.root()).to_string();
            f.write_str(&s)
        }
    }
}

macro_rules! bail {
    ($s:literal $(,)?) => {
        return Err($s.into())
    };
    ($s:literal, $($args:expr),+) => {
        return Err(format!($s, $($args),+).into())
    };
}

/// Parses an atom into a leaf node, if it names one.
pub(crate) fn parse_leaf(s: &str) -> Option<Node> {
    if s == "none" {
        Some(Node::None)
    } else if let Some(op) = s.strip_prefix("op:") {
        Some(Node::Op(op.into()))
    } else if let Some(name) = s.strip_prefix("fusion:") {
        Some(Node::Fusion(name.into()))
    } else if let Ok(lit) = s.parse::<Literal>() {
        Some(Node::Const(lit))
    } else if s.starts_with('?') || s.is_empty() {
        None
    } else {
        Some(Node::Var(s.into()))
    }
}

/// Parses an s-expression into `expr`, using `atom` for leaves and
/// `wrap` to turn a [`Node`] into an entry.
pub(crate) fn parse_sexp_into<L: Language>(
    sexp: &Sexp,
    expr: &mut RecExpr<L>,
    atom: &impl Fn(&str) -> Option<L>,
    wrap: &impl Fn(Node) -> L,
) -> Result<Id, String> {
    let list = match sexp {
        Sexp::Empty => bail!("Found empty s-expression"),
        Sexp::String(s) => match atom(s) {
            Some(leaf) => return Ok(expr.add(leaf)),
            None => bail!("Couldn't parse '{}'", s),
        },
        Sexp::List(list) if list.is_empty() => bail!("Found empty s-expression"),
        Sexp::List(list) => list,
    };
    let head = match &list[0] {
        Sexp::String(head) => head.as_str(),
        other => bail!("Found a non-atom in the head position: {}", other),
    };
    let name = |i: usize| match list.get(i) {
        Some(Sexp::String(s)) => Ok(Symbol::from(s)),
        _ => Err(format!("'{}' needs a name in position {}", head, i)),
    };
    let (named, rest) = match head {
        "fn" | "marker" => (Some(name(1)?), &list[2..]),
        _ => (None, &list[1..]),
    };
    let mut args = Children::new();
    for s in rest {
        args.push(parse_sexp_into(s, expr, atom, wrap)?);
    }
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("'{}' takes {} operands, got {}", head, n, args.len()))
        }
    };
    let node = match (head, named) {
        ("tuple", _) => Node::Tuple(args),
        ("call", _) if !args.is_empty() => Node::Call(args),
        ("call", _) => bail!("'call' needs a target"),
        ("fn", Some(name)) if !args.is_empty() => Node::Function(name, args),
        ("fn", _) => bail!("'fn' needs a body"),
        ("marker", Some(kind)) => {
            arity(2)?;
            Node::Marker(kind, [args[0], args[1]])
        }
        ("if", _) => {
            arity(3)?;
            Node::If([args[0], args[1], args[2]])
        }
        (op, _) => {
            let target = expr.add(wrap(Node::Op(op.into())));
            Node::call(target, args)
        }
    };
    Ok(expr.add(wrap(node)))
}

impl FromStr for RecExpr<Node> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sexp = symbolic_expressions::parser::parse_str(s.trim())
            .map_err(|e| Error::Parse(e.to_string()))?;
        let mut expr = RecExpr::default();
        parse_sexp_into(&sexp, &mut expr, &parse_leaf, &|n| n).map_err(Error::Parse)?;
        Ok(expr)
    }
}
