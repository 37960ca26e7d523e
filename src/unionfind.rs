use crate::Id;

/// Disjoint sets of class [`Id`]s, stored as a flat arena of parent
/// indices. A root is its own parent.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parents: Vec<Id>,
}

impl UnionFind {
    /// Creates a singleton set and returns its representative
    pub fn make_set(&mut self) -> Id {
        let id = Id::from(self.parents.len());
        self.parents.push(id);
        id
    }

    /// Returns the number of ids in all the sets
    pub fn size(&self) -> usize {
        self.parents.len()
    }

    fn parent(&self, query: Id) -> Id {
        self.parents[usize::from(query)]
    }

    fn parent_mut(&mut self, query: Id) -> &mut Id {
        &mut self.parents[usize::from(query)]
    }

    /// Returns the representative of the set `current` belongs to
    pub fn find(&self, mut current: Id) -> Id {
        while current != self.parent(current) {
            current = self.parent(current)
        }
        current
    }

    /// Same as [`find`](UnionFind::find), but points every id on the
    /// path directly at the root afterwards.
    pub fn find_mut(&mut self, current: Id) -> Id {
        let root = self.find(current);
        let mut current = current;
        while current != root {
            let next = self.parent(current);
            *self.parent_mut(current) = root;
            current = next;
        }
        root
    }

    /// Given two representative ids, makes `root1` the representative
    /// of their union.
    pub fn union(&mut self, root1: Id, root2: Id) -> Id {
        debug_assert_eq!(self.parent(root1), root1);
        debug_assert_eq!(self.parent(root2), root2);
        *self.parent_mut(root2) = root1;
        root1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(us: impl IntoIterator<Item = usize>) -> Vec<Id> {
        us.into_iter().map(|u| u.into()).collect()
    }

    #[test]
    fn union_find() {
        let n = 10;
        let id = Id::from;

        let mut uf = UnionFind::default();
        for _ in 0..n {
            uf.make_set();
        }

        // everyone starts in their own set
        assert_eq!(uf.parents, ids(0..n));

        uf.union(id(0), id(1));
        uf.union(id(0), id(2));
        uf.union(id(0), id(3));

        uf.union(id(6), id(7));
        uf.union(id(6), id(8));
        uf.union(id(6), id(9));

        for i in 0..n {
            uf.find_mut(id(i));
        }

        // indexes:         0, 1, 2, 3, 4, 5, 6, 7, 8, 9
        let expected = vec![0, 0, 0, 0, 4, 5, 6, 6, 6, 6];
        assert_eq!(uf.parents, ids(expected));
    }

    #[test]
    fn find_mut_compresses_long_chains() {
        let mut uf = UnionFind::default();
        let nodes: Vec<Id> = (0..5).map(|_| uf.make_set()).collect();

        // build the chain 0 -> 1 -> 2 -> 3 -> 4
        for pair in nodes.windows(2) {
            uf.union(pair[1], pair[0]);
        }
        assert_eq!(uf.parent(nodes[0]), nodes[1]);

        assert_eq!(uf.find_mut(nodes[0]), nodes[4]);
        for &n in &nodes {
            assert_eq!(uf.parent(n), nodes[4]);
        }
    }
}
