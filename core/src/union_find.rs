//! Disjoint-set forest over dense `usize` ids.
//!
//! Path halving + union by size. Callers map their own keys (roster
//! members, carriers) to `0..n` before use.

#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets containing `a` and `b`. Returns false if they were
    /// already together.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        // Ties go to the lower root so the forest shape is input-order stable.
        if self.size[ra] < self.size[rb] || (self.size[ra] == self.size[rb] && rb < ra) {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    pub fn set_size(&mut self, x: usize) -> usize {
        let root = self.find(x);
        self.size[root]
    }

    /// All sets as sorted member lists, ordered by their smallest member.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: Vec<Option<usize>> = vec![None; self.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for x in 0..self.len() {
            let root = self.find(x);
            match by_root[root] {
                Some(slot) => groups[slot].push(x),
                None => {
                    by_root[root] = Some(groups.len());
                    groups.push(vec![x]);
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unions_merge_and_report() {
        let mut ds = DisjointSet::new(5);
        assert!(ds.union(0, 1));
        assert!(ds.union(3, 4));
        assert!(!ds.union(1, 0));
        assert!(ds.union(1, 4));
        assert_eq!(ds.set_size(3), 4);
        assert_eq!(ds.groups(), vec![vec![0, 1, 3, 4], vec![2]]);
    }

    #[test]
    fn groups_independent_of_union_order() {
        let mut a = DisjointSet::new(6);
        a.union(0, 5);
        a.union(2, 3);
        a.union(5, 3);
        let mut b = DisjointSet::new(6);
        b.union(3, 5);
        b.union(2, 0);
        b.union(3, 2);
        assert_eq!(a.groups(), b.groups());
    }
}
