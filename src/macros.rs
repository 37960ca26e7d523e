/** A macro to easily make [`Rewrite`](crate::Rewrite)s.

The `rewrite!` macro greatly simplifies creating simple, purely
syntactic rewrites while also allowing more complex ones.

This macro uses the form `rewrite!(name; lhs => rhs)` to return a
[`Rewrite`](crate::Rewrite).
It uses the form `rewrite!(name; lhs <=> rhs)` to return a
`Vec<Rewrite>` holding the rewrite in both directions, the second one
named `name-rev`.

String literals are parsed as [`Pattern`](crate::Pattern)s; any other
expression is used as a `Pattern` directly.

Each `if condition` clause adds a
[condition](crate::Rewrite::with_condition): a closure taking the
[`EGraph`](crate::EGraph) and the [`Match`](crate::Match).

# Example
```
use nnegg::{rewrite as rw, *};

let mut rules: Vec<Rewrite<Untyped>> = vec![
    rw!("commute-add"; "(+ ?a ?b)" => "(+ ?b ?a)"),
    rw!("mul-0"; "(* ?a 0)" => "0"),
    rw!("relu-relu"; "(relu (relu ?a))" => "(relu ?a)"),
];
rules.extend(rw!("assoc-add"; "(+ ?a (+ ?b ?c))" <=> "(+ (+ ?a ?b) ?c)"));

assert_eq!(rules.len(), 5);
assert_eq!(rules[4].name.as_str(), "assoc-add-rev");
```
**/
#[macro_export]
macro_rules! rewrite {
    (
        $name:expr;
        $lhs:tt => $rhs:tt
        $(if $cond:expr)*
    )  => {{
        let searcher = $crate::__rewrite!(@parse $lhs);
        let applier = $crate::__rewrite!(@parse $rhs);
        let rewrite = $crate::Rewrite::from_patterns($name, searcher, applier).unwrap();
        $( let rewrite = rewrite.with_condition($cond); )*
        rewrite
    }};
    (
        $name:expr;
        $lhs:tt <=> $rhs:tt
        $(if $cond:expr)*
    )  => {{
        let name = $name;
        let name2 = String::from(name.clone()) + "-rev";
        vec![
            $crate::rewrite!(name;  $lhs => $rhs $(if $cond)*),
            $crate::rewrite!(name2; $rhs => $lhs $(if $cond)*)
        ]
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rewrite {
    (@parse $rhs:literal) => {
        $rhs.parse::<$crate::Pattern>().unwrap()
    };
    (@parse $rhs:expr) => { $rhs };
}
