use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use symbolic_expressions::Sexp;

pub(crate) type BuildHasher = fxhash::FxBuildHasher;

pub(crate) use hashmap::*;

#[cfg(feature = "deterministic")]
mod hashmap {
    use super::BuildHasher;
    pub(crate) type HashMap<K, V> = indexmap::IndexMap<K, V, BuildHasher>;
    pub(crate) type HashSet<K> = indexmap::IndexSet<K, BuildHasher>;
}
#[cfg(not(feature = "deterministic"))]
mod hashmap {
    use super::BuildHasher;
    pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, BuildHasher>;
    pub(crate) type HashSet<K> = hashbrown::HashSet<K, BuildHasher>;
}

pub(crate) type IndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasher>;
pub(crate) type IndexSet<K> = indexmap::IndexSet<K, BuildHasher>;

pub(crate) type Instant = instant::Instant;
pub(crate) type Duration = instant::Duration;

/// Renders `sexp` so that any list longer than `width` is broken up.
///
/// A broken list keeps its head on the first line, together with the
/// name of a `marker` or `fn`, and puts every operand on its own line,
/// indented by nesting depth.
pub(crate) fn pretty_sexp(sexp: &Sexp, width: usize) -> String {
    let mut out = String::new();
    write_pretty(&mut out, sexp, width, 1);
    out
}

fn write_pretty(out: &mut String, sexp: &Sexp, width: usize, depth: usize) {
    let list = match sexp {
        Sexp::List(list) => list,
        atom => {
            out.push_str(atom.to_string().trim_matches('"'));
            return;
        }
    };
    let broken = sexp.to_string().len() > width;
    let named = matches!(list.first(), Some(Sexp::String(h)) if h == "marker" || h == "fn");
    let first_line = if named { 2 } else { 1 };

    out.push('(');
    for (i, item) in list.iter().enumerate() {
        if broken && i >= first_line {
            out.push('\n');
            out.push_str(&"  ".repeat(depth));
        } else if i > 0 {
            out.push(' ');
        }
        write_pretty(out, item, width, depth + 1);
    }
    out.push(')');
}

/// Every name ever turned into a [`Symbol`]. Names are leaked on
/// insertion and the table only grows, so indices stay valid forever.
#[derive(Default)]
struct SymbolTable {
    names: IndexSet<&'static str>,
}

impl SymbolTable {
    fn intern(&mut self, name: &str) -> u32 {
        let i = match self.names.get_index_of(name) {
            Some(i) => i,
            None => {
                let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
                self.names.insert_full(leaked).0
            }
        };
        u32::try_from(i).unwrap_or_else(|_| panic!("More than {} distinct symbols", u32::MAX))
    }

    fn resolve(&self, i: u32) -> &'static str {
        self.names
            .get_index(i as usize)
            .copied()
            .unwrap_or_else(|| panic!("Symbol {} was never interned", i))
    }
}

static SYMBOLS: Lazy<Mutex<SymbolTable>> = Lazy::new(Default::default);

fn symbols() -> MutexGuard<'static, SymbolTable> {
    // every update is a single insert, so a poisoned table is still whole
    SYMBOLS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An interned name: a variable, an operator, a fusion or a marker kind.
///
/// Names are compared and hashed on every hash-cons lookup, so a node
/// stores a 4-byte index into a global table instead of a `String`.
///
/// # Example
/// ```rust
/// use nnegg::Symbol;
///
/// assert_eq!(Symbol::from("conv2d"), Symbol::from("conv2d"));
/// assert_ne!(Symbol::from("conv2d"), Symbol::from("matmul"));
/// assert_eq!(Symbol::from("relu").as_str(), "relu");
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    /// The name this symbol stands for.
    pub fn as_str(self) -> &'static str {
        symbols().resolve(self.0)
    }
}

impl<S: AsRef<str>> From<S> for Symbol {
    fn from(s: S) -> Self {
        Symbol(symbols().intern(s.as_ref()))
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
