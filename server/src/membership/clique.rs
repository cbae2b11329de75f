//! Maximum-clique search over the symmetrised connectivity matrix.
//!
//! Vertices are node bit-indices `0..n`. Edge `(i, j)` exists iff bit `j` of
//! `matrix[i]` is clear, i.e. neither side reports a disconnect. Ties are
//! broken by preferring the lexicographically first clique (comparing
//! members in ascending node order), so [`max_clique`] is deterministic on
//! a given matrix — callers on different nodes that happen to build the
//! same matrix shape converge on the same answer without coordination.

use mm_wire::node_mask::NodeMask;

/// Bron–Kerbosch with pivoting, restricted to `n` vertices (`n <=
/// mm_wire::MAX_NODES`). Returns the chosen clique and its size.
#[must_use]
pub fn max_clique(matrix: &[NodeMask], n: usize) -> (NodeMask, u32) {
    if n == 0 {
        return (NodeMask::EMPTY, 0);
    }

    let adj: Vec<u64> = (0..n)
        .map(|i| {
            let disconnects = matrix[i].raw() & NodeMask::all(n).raw();
            (!disconnects) & NodeMask::all(n).raw() & !(1u64 << i)
        })
        .collect();

    let mut best_mask: u64 = 0;
    let mut best_size: u32 = 0;
    let all = NodeMask::all(n).raw();

    search(0, all, 0, &adj, n, &mut best_mask, &mut best_size);

    (NodeMask::from_raw(best_mask), best_size)
}

/// `r`/`p`/`x` are the Bron–Kerbosch working sets (bitmasks restricted to
/// `0..n`): `r` the clique built so far, `p` candidates still extendable,
/// `x` candidates already excluded on this branch.
#[allow(clippy::too_many_arguments)]
fn search(r: u64, p: u64, x: u64, adj: &[u64], n: usize, best_mask: &mut u64, best_size: &mut u32) {
    if p == 0 && x == 0 {
        let size = r.count_ones();
        if size > *best_size || (size == *best_size && is_lexicographically_smaller(r, *best_mask, n)) {
            *best_size = size;
            *best_mask = r;
        }
        return;
    }

    // Prune branches that cannot beat the current best even if every
    // remaining candidate were added.
    if r.count_ones() + p.count_ones() < *best_size {
        return;
    }

    let pivot = choose_pivot(p, x, adj);
    let mut candidates = p & !adj[pivot];
    let mut p = p;
    let mut x = x;

    while candidates != 0 {
        let v = candidates.trailing_zeros() as usize;
        let vb = 1u64 << v;
        search(r | vb, p & adj[v], x & adj[v], adj, n, best_mask, best_size);
        p &= !vb;
        x |= vb;
        candidates &= !vb;
    }
}

/// Picks `u` in `P ∪ X` maximizing `|P ∩ N(u)|`, the standard
/// Bron–Kerbosch-with-pivoting heuristic for cutting down recursive calls.
fn choose_pivot(p: u64, x: u64, adj: &[u64]) -> usize {
    let mut px = p | x;
    let mut best_vertex = px.trailing_zeros() as usize;
    let mut best_count = -1i64;
    while px != 0 {
        let u = px.trailing_zeros() as usize;
        let count = (p & adj[u]).count_ones() as i64;
        if count > best_count {
            best_count = count;
            best_vertex = u;
        }
        px &= px - 1;
    }
    best_vertex
}

/// True iff, among equal-cardinality bit sets, `a`'s members come before
/// `b`'s in ascending lexicographic order: the first bit position where the
/// two sets differ decides it, and whichever set has that bit *set* is the
/// smaller one (it claimed a lower element at the point they first diverge).
fn is_lexicographically_smaller(a: u64, b: u64, n: usize) -> bool {
    for i in 0..n {
        let abit = (a >> i) & 1;
        let bbit = (b >> i) & 1;
        if abit != bbit {
            return abit == 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_of(bits: &[usize]) -> NodeMask {
        let mut m = NodeMask::EMPTY;
        for &b in bits {
            m.set(b);
        }
        m
    }

    #[test]
    fn fully_connected_graph_yields_whole_clique() {
        let matrix = vec![NodeMask::EMPTY; 4];
        let (clique, size) = max_clique(&matrix, 4);
        assert_eq!(size, 4);
        assert_eq!(clique, NodeMask::all(4));
    }

    #[test]
    fn isolated_node_is_returned_as_singleton() {
        // Node 0 disconnected from everyone; 1,2,3 mutually connected.
        let mut matrix = vec![NodeMask::EMPTY; 4];
        matrix[0] = mask_of(&[1, 2, 3]);
        matrix[1].set(0);
        matrix[2].set(0);
        matrix[3].set(0);
        let (clique, size) = max_clique(&matrix, 4);
        assert_eq!(size, 3);
        assert_eq!(clique, mask_of(&[1, 2, 3]));
    }

    #[test]
    fn fully_isolated_self_returns_singleton_of_self() {
        let mut matrix = vec![NodeMask::EMPTY; 1];
        matrix[0] = NodeMask::EMPTY;
        let (clique, size) = max_clique(&matrix, 1);
        assert_eq!(size, 1);
        assert_eq!(clique, mask_of(&[0]));
    }

    #[test]
    fn tie_picks_lexicographically_first_clique() {
        // Two disjoint edges: {0,1} and {2,3}; both cliques of size 2.
        let mut matrix = vec![NodeMask::EMPTY; 4];
        matrix[0].set(2);
        matrix[0].set(3);
        matrix[1].set(2);
        matrix[1].set(3);
        matrix[2].set(0);
        matrix[2].set(1);
        matrix[3].set(0);
        matrix[3].set(1);
        let (clique, size) = max_clique(&matrix, 4);
        assert_eq!(size, 2);
        assert_eq!(clique, mask_of(&[0, 1]));
    }

    #[test]
    fn is_deterministic_across_repeated_calls() {
        let mut matrix = vec![NodeMask::EMPTY; 5];
        matrix[1].set(3);
        matrix[3].set(1);
        let first = max_clique(&matrix, 5);
        for _ in 0..20 {
            assert_eq!(max_clique(&matrix, 5), first);
        }
    }

    #[test]
    fn five_node_partition_excludes_one_of_the_disconnected_pair() {
        // Everyone connected except 1<->2 (bit indices).
        let mut matrix = vec![NodeMask::EMPTY; 5];
        matrix[1].set(2);
        matrix[2].set(1);
        let (clique, size) = max_clique(&matrix, 5);
        assert_eq!(size, 4);
        // Lexicographically-first 4-clique excludes the higher-indexed of
        // the disconnected pair.
        assert_eq!(clique, mask_of(&[0, 1, 3, 4]));
    }

    proptest::proptest! {
        /// Property 1 (spec §8): the chosen clique is always a real clique —
        /// no two of its members disagree about being connected — for any
        /// symmetric disconnect matrix.
        #[test]
        fn chosen_set_is_always_a_real_clique(edges in proptest::collection::vec(0u8..2, 10)) {
            let n = 5;
            let mut matrix = vec![NodeMask::EMPTY; n];
            let mut idx = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    if edges[idx] == 1 {
                        matrix[i].set(j);
                        matrix[j].set(i);
                    }
                    idx += 1;
                }
            }
            let (clique, _size) = max_clique(&matrix, n);
            for i in clique.iter_set(n) {
                for j in clique.iter_set(n) {
                    if i != j {
                        assert!(!matrix[i].bit(j), "chosen clique contains a disconnected pair");
                    }
                }
            }
        }

        /// Property 3 (spec §8): `max_clique` is deterministic — repeated
        /// calls on the same matrix always agree.
        #[test]
        fn max_clique_is_deterministic(edges in proptest::collection::vec(0u8..2, 10)) {
            let n = 5;
            let mut matrix = vec![NodeMask::EMPTY; n];
            let mut idx = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    if edges[idx] == 1 {
                        matrix[i].set(j);
                        matrix[j].set(i);
                    }
                    idx += 1;
                }
            }
            let first = max_clique(&matrix, n);
            for _ in 0..5 {
                assert_eq!(max_clique(&matrix, n), first);
            }
        }
    }
}
