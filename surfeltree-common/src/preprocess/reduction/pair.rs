//! Iterative closest pair contraction: the two closest surfels are merged into one,
//! until only `target` surfels are left.

use crate::geometry::surfel::{merge_surfels, Surfel};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Number of candidate partners per surfel.
const CANDIDATES: usize = 4;

type Entry = GeomWithData<[f64; 3], usize>;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f64,
    a: usize,
    b: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.a.cmp(&other.a))
            .then(self.b.cmp(&other.b))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Candidate {}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

fn entry(surfel: &Surfel, id: usize) -> Entry {
    let p = surfel.position();
    GeomWithData::new([p.x, p.y, p.z], id)
}

fn push_candidates(
    tree: &RTree<Entry>,
    surfel: &Surfel,
    id: usize,
    heap: &mut BinaryHeap<Reverse<Candidate>>,
) {
    let p = surfel.position();
    for (other, distance_2) in tree
        .nearest_neighbor_iter_with_distance_2(&[p.x, p.y, p.z])
        .filter(|(e, _)| e.data != id)
        .take(CANDIDATES)
    {
        heap.push(Reverse(Candidate {
            distance: distance_2.sqrt(),
            a: id.min(other.data),
            b: id.max(other.data),
        }));
    }
}

pub fn reduce(input: &[Surfel], target: usize) -> Vec<Surfel> {
    let mut surfels = input.to_vec();
    let mut active = vec![true; surfels.len()];
    let mut active_count = surfels.len();
    let mut tree = RTree::bulk_load(
        surfels
            .iter()
            .enumerate()
            .map(|(i, s)| entry(s, i))
            .collect(),
    );
    let mut heap = BinaryHeap::new();
    for (i, s) in surfels.iter().enumerate() {
        push_candidates(&tree, s, i, &mut heap);
    }

    while active_count > target {
        let Some(Reverse(candidate)) = heap.pop() else {
            // all remaining candidates were stale
            for (i, s) in surfels.iter().enumerate().filter(|(i, _)| active[*i]) {
                push_candidates(&tree, s, i, &mut heap);
            }
            if heap.is_empty() {
                break;
            }
            continue;
        };
        if !active[candidate.a] || !active[candidate.b] {
            continue;
        }
        let (a, b) = (surfels[candidate.a], surfels[candidate.b]);
        let Some(merged) = merge_surfels(&[a, b]) else {
            continue;
        };
        tree.remove(&entry(&a, candidate.a));
        tree.remove(&entry(&b, candidate.b));
        active[candidate.a] = false;
        active[candidate.b] = false;

        let id = surfels.len();
        surfels.push(merged);
        active.push(true);
        tree.insert(entry(&merged, id));
        push_candidates(&tree, &merged, id, &mut heap);
        active_count -= 1;
    }

    surfels
        .into_iter()
        .zip(active)
        .filter(|(_, active)| *active)
        .map(|(s, _)| s)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::point;

    #[test]
    fn merges_closest_pairs_first() {
        let input: Vec<Surfel> = [0.0, 0.1, 5.0, 5.2, 10.0, 10.4]
            .iter()
            .map(|&x| Surfel::from_position(point![x, 0.0, 0.0], [0; 3]))
            .collect();
        let reduced = reduce(&input, 3);
        let xs: Vec<f64> = reduced.iter().map(|s| s.position().x).collect();
        assert_eq!(xs.len(), 3);
        assert!((xs[0] - 0.05).abs() < 1e-12);
        assert!((xs[1] - 5.1).abs() < 1e-12);
        assert!((xs[2] - 10.2).abs() < 1e-12);
    }
}
