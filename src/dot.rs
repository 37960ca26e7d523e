use std::fmt::{self, Display, Formatter};

use crate::{EGraph, Language, TypeSystem};

/**
A wrapper for an [`EGraph`] that renders it in
[Graphviz dot](https://graphviz.org/doc/info/lang.html) format.

Every class is a dotted cluster labelled with its id and type; edges go
from a node to the cluster of each child, numbered by argument position.

Create one with [`EGraph::dot`].

```
use nnegg::*;
let mut egraph = EGraph::<Untyped>::default();
egraph.add_expr(&"(relu (+ x 1))".parse().unwrap()).unwrap();
egraph.rebuild();
let dot = egraph.dot().to_string();
assert!(dot.starts_with("digraph egraph {"));
```
**/
pub struct Dot<'a, T: TypeSystem> {
    pub(crate) egraph: &'a EGraph<T>,
}

impl<'a, T: TypeSystem> Display for Dot<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph egraph {{")?;

        // set compound=true to enable edges to clusters
        writeln!(f, "  compound=true")?;
        writeln!(f, "  clusterrank=local")?;

        // define all the nodes, clustered by eclass
        for class in self.egraph.classes() {
            writeln!(f, "  subgraph cluster_{} {{", class.id)?;
            writeln!(f, "    style=dotted")?;
            let label = format!("{}: {:?}", class.id, class.checked_type);
            writeln!(f, "    label = \"{}\"", escape(&label))?;
            for (i, node) in class.iter().enumerate() {
                writeln!(f, "    {}.{}[label = \"{}\"]", class.id, i, escape(&node.to_string()))?;
            }
            writeln!(f, "  }}")?;
        }

        for class in self.egraph.classes() {
            for (i_in_class, node) in class.iter().enumerate() {
                for (arg_i, child) in node.children().iter().enumerate() {
                    // write the edge to the child, but clip it to the eclass with lhead
                    let child = self.egraph.find(*child);
                    if child == class.id {
                        writeln!(
                            f,
                            "  {}.{}:n -> {}.{}:n [lhead = cluster_{}, label = {}]",
                            class.id, i_in_class, class.id, i_in_class, class.id, arg_i
                        )?;
                    } else {
                        writeln!(
                            f,
                            // {}.0 to pick an arbitrary node in the cluster
                            "  {}.{} -> {}.0 [lhead = cluster_{}, label = {}]",
                            class.id, i_in_class, child, child, arg_i
                        )?;
                    }
                }
            }
        }

        write!(f, "}}")
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use crate::{EGraph, Node, Untyped};

    #[test]
    fn self_loops_and_clusters() {
        let mut egraph = EGraph::<Untyped>::default();
        let x = egraph.add(Node::Var("x".into())).unwrap();
        let relu = egraph.add_expr(&"(relu x)".parse().unwrap()).unwrap();
        egraph.union(x, relu);
        egraph.rebuild();

        let dot = egraph.dot().to_string();
        let class = egraph.find(x);
        // the merged class and the `relu` operator
        assert_eq!(dot.matches("subgraph cluster_").count(), 2);
        let op = egraph.lookup(Node::Op("relu".into())).unwrap();
        // the operand loops back into its own class, the operator does not
        assert!(dot.contains(&format!("lhead = cluster_{}, label = 1", class)));
        assert!(dot.contains(&format!("lhead = cluster_{}, label = 0", op)));
        assert!(dot.contains(":n ->"));
        assert!(dot.ends_with('}'));
    }
}
