// Even-Divisor Chunking
// Exhaustive search over chunk lengths that evenly divide each dimension

use super::{ChunkRequest, ChunkingError};
use std::cmp::Ordering;

/// Weight of the sequential dimension in the preferred split profile
const SEQUENTIAL_ASPECT_WEIGHT: f64 = 10.0;

/// All divisors of `n`, largest first
pub fn even_divisors(n: usize) -> Vec<usize> {
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut i = 1;
    while i * i <= n {
        if n % i == 0 {
            small.push(i);
            if i != n / i {
                large.push(n / i);
            }
        }
        i += 1;
    }
    large.extend(small.into_iter().rev());
    large
}

struct Candidate {
    shape: Vec<usize>,
    distance: u128,
    sequential_divisions: usize,
    aspect: f64,
}

/// Pick the divisor combination whose byte size is closest to the budget.
///
/// Only shapes within `budget * (1 ± tolerance)` (inclusive) are considered.
/// Ties are broken by more divisions of the sequential dimension when it is
/// preferred, then by how closely the split profile matches the preferred
/// aspect, then by the lexicographically larger shape.
pub fn even_divisor_chunks(request: &ChunkRequest) -> Result<Vec<usize>, ChunkingError> {
    let divisors: Vec<Vec<usize>> = request.dims.iter().map(|d| even_divisors(d.len)).collect();
    let mut found = Vec::new();
    let mut shape = Vec::with_capacity(divisors.len());
    search(request, &divisors, &mut shape, 1, &mut found);

    let seq = request.preferred_sequential_dim();
    let weights = aspect_weights(request.dims.len(), seq);
    let budget = request.budget as u128;

    found
        .into_iter()
        .map(|shape| {
            let bytes = request.chunk_bytes(&shape);
            Candidate {
                distance: bytes.abs_diff(budget),
                sequential_divisions: seq.map_or(0, |s| request.dims[s].len / shape[s]),
                aspect: aspect_distance(request, &shape, &weights),
                shape,
            }
        })
        .min_by(|a, b| rank(a, b))
        .map(|c| c.shape)
        .ok_or_else(|| request.no_match())
}

fn search(
    request: &ChunkRequest,
    divisors: &[Vec<usize>],
    shape: &mut Vec<usize>,
    elements: u128,
    found: &mut Vec<Vec<usize>>,
) {
    let depth = shape.len();
    let element_size = request.element_size as u128;

    if depth == divisors.len() {
        let bytes = (elements * element_size) as f64;
        if bytes >= request.lower_bound() && bytes <= request.upper_bound() {
            found.push(shape.clone());
        }
        return;
    }

    let remaining_max: u128 = request.dims[depth + 1..]
        .iter()
        .map(|d| d.len as u128)
        .product();

    for &divisor in &divisors[depth] {
        let partial = elements * divisor as u128;
        // the rest of the dimensions contribute at least a factor of one
        if ((partial * element_size) as f64) > request.upper_bound() {
            continue;
        }
        // divisors only shrink from here
        if ((partial * remaining_max * element_size) as f64) < request.lower_bound() {
            break;
        }
        shape.push(divisor);
        search(request, divisors, shape, partial, found);
        shape.pop();
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then_with(|| b.sequential_divisions.cmp(&a.sequential_divisions))
        .then_with(|| a.aspect.total_cmp(&b.aspect))
        .then_with(|| b.shape.cmp(&a.shape))
}

fn aspect_weights(rank: usize, seq: Option<usize>) -> Vec<f64> {
    (0..rank)
        .map(|i| {
            if Some(i) == seq {
                SEQUENTIAL_ASPECT_WEIGHT
            } else {
                1.0
            }
        })
        .collect()
}

/// Squared distance between the normalized split profile of `shape` and the
/// normalized aspect weights
fn aspect_distance(request: &ChunkRequest, shape: &[usize], weights: &[f64]) -> f64 {
    let splits: Vec<f64> = request
        .dims
        .iter()
        .zip(shape)
        .map(|(d, &c)| ((d.len / c) as f64).ln())
        .collect();
    let total_splits: f64 = splits.iter().sum();
    if total_splits == 0.0 {
        return 0.0;
    }
    let total_weight: f64 = weights.iter().sum();

    splits
        .iter()
        .zip(weights)
        .map(|(s, w)| {
            let diff = s / total_splits - w / total_weight;
            diff * diff
        })
        .sum()
}
