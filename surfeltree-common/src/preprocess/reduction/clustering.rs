use crate::geometry::bounding_box::Aabb;
use crate::geometry::surfel::{merge_surfels, Surfel};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Splits the largest cluster at the median of its longest axis, until there are
/// `target` clusters. Each cluster is merged into one surfel.
pub fn hierarchical(input: &[Surfel], target: usize) -> Vec<Surfel> {
    // (size, Reverse(sequence number)): largest first, older first on ties
    let mut heap: BinaryHeap<(usize, Reverse<usize>, Vec<usize>)> = BinaryHeap::new();
    let mut sequence = 0;
    heap.push((input.len(), Reverse(sequence), (0..input.len()).collect()));
    while heap.len() < target {
        let Some((size, seq, mut members)) = heap.pop() else {
            break;
        };
        if size < 2 {
            // every cluster is a single surfel
            heap.push((size, seq, members));
            break;
        }
        let bbox = Aabb::from_positions(members.iter().map(|&i| input[i].position()));
        let axis = bbox.longest_axis();
        members.sort_by(|&a, &b| {
            input[a].position()[axis]
                .total_cmp(&input[b].position()[axis])
                .then(a.cmp(&b))
        });
        let upper = members.split_off(size / 2);
        sequence += 1;
        heap.push((members.len(), Reverse(sequence), members));
        sequence += 1;
        heap.push((upper.len(), Reverse(sequence), upper));
    }

    // output in creation order of the clusters
    let mut clusters: Vec<(Reverse<usize>, Vec<usize>)> =
        heap.into_iter().map(|(_, seq, m)| (seq, m)).collect();
    clusters.sort_by_key(|(Reverse(seq), _)| *seq);
    clusters
        .into_iter()
        .filter_map(|(_, members)| {
            let surfels: Vec<Surfel> = members.iter().map(|&i| input[i]).collect();
            merge_surfels(&surfels)
        })
        .collect()
}

/// Hashes the surfels into a regular grid. The grid is made coarser until at most
/// `target` cells are occupied. Each occupied cell becomes one merged surfel.
pub fn k_clustering(input: &[Surfel], target: usize) -> Vec<Surfel> {
    let bbox = Aabb::from_positions(input.iter().map(|s| s.position()));
    let extent = bbox.extent();
    let mut resolution = (target as f64).sqrt().ceil().max(1.0) as i64 + 1;
    let cells = loop {
        let mut cells: BTreeMap<[i64; 3], Vec<usize>> = BTreeMap::new();
        for (i, surfel) in input.iter().enumerate() {
            let mut key = [0_i64; 3];
            for (axis, k) in key.iter_mut().enumerate() {
                if extent[axis] > 0.0 {
                    let relative = (surfel.position()[axis] - bbox.min[axis]) / extent[axis];
                    *k = ((relative * resolution as f64) as i64).min(resolution - 1);
                }
            }
            cells.entry(key).or_default().push(i);
        }
        if cells.len() <= target || resolution == 1 {
            break cells;
        }
        resolution -= 1;
    };
    cells
        .into_values()
        .filter_map(|members| {
            let surfels: Vec<Surfel> = members.iter().map(|&i| input[i]).collect();
            merge_surfels(&surfels)
        })
        .collect()
}
