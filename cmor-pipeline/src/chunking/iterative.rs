// Iterative Chunking
// Repeated halving of the heaviest dimension until the chunk fits

use super::{ChunkRequest, ChunkingError};

/// Halving weight of the sequential dimension when it is preferred
const SEQUENTIAL_HALVING_WEIGHT: usize = 10;

/// Halve the heaviest chunked dimension until the chunk is at or below
/// `budget * (1 + tolerance)`.
pub fn iterative_chunks(request: &ChunkRequest) -> Result<Vec<usize>, ChunkingError> {
    iterate(request).map(|(shape, _)| shape)
}

/// Run the halving loop, returning the final shape and the number of halvings.
///
/// Each dimension can be halved at most `ceil(log2(len))` times before it
/// reaches one, so the loop is bounded by the sum of those counts.
pub(crate) fn iterate(request: &ChunkRequest) -> Result<(Vec<usize>, usize), ChunkingError> {
    let mut shape = request.lengths();
    let seq = request.preferred_sequential_dim();
    let upper = request.upper_bound();
    let mut iterations = 0;

    while request.chunk_bytes(&shape) as f64 > upper {
        let heaviest = shape
            .iter()
            .enumerate()
            .filter(|(_, &chunk)| chunk > 1)
            .map(|(i, &chunk)| {
                let weight = if Some(i) == seq {
                    SEQUENTIAL_HALVING_WEIGHT
                } else {
                    1
                };
                (i, chunk * weight)
            })
            // first index wins on equal weight
            .fold(None, |best: Option<(usize, usize)>, (i, w)| match best {
                Some((_, bw)) if bw >= w => best,
                _ => Some((i, w)),
            });

        let Some((index, _)) = heaviest else {
            return Err(request.no_match());
        };
        shape[index] = shape[index].div_ceil(2);
        iterations += 1;
    }

    Ok((shape, iterations))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_dimension_halving() {
        let request = ChunkRequest::new([("x", 1024)], 1, 100).with_tolerance(0.0);
        let (shape, iterations) = iterate(&request).unwrap();
        assert_eq!(shape, vec![64]);
        assert_eq!(iterations, 4);
    }

    #[test]
    fn test_sequential_dimension_halved_first() {
        let request =
            ChunkRequest::new([("time", 120), ("lat", 180), ("lon", 360)], 4, 1_000_000);
        let (shape, iterations) = iterate(&request).unwrap();
        assert_eq!(shape, vec![15, 90, 180]);
        assert_eq!(iterations, 5);
    }

    #[test]
    fn test_full_array_within_budget_is_untouched() {
        let request = ChunkRequest::new([("time", 12), ("lat", 10)], 8, 10_000);
        let (shape, iterations) = iterate(&request).unwrap();
        assert_eq!(shape, vec![12, 10]);
        assert_eq!(iterations, 0);
    }

    #[test]
    fn test_budget_below_one_element_fails() {
        let request = ChunkRequest::new([("time", 4)], 8, 4).with_tolerance(0.0);
        assert!(matches!(
            iterative_chunks(&request),
            Err(ChunkingError::NoMatchingChunks { budget: 4, .. })
        ));
    }

    #[test]
    fn test_iterations_bounded_by_halvings_per_dimension() {
        let request = ChunkRequest::new([("time", 1000), ("lat", 97), ("lon", 33)], 8, 1);
        let bound: usize = request
            .lengths()
            .iter()
            .map(|&len| (usize::BITS - (len - 1).leading_zeros()) as usize)
            .sum();
        // one byte is below a single element, so this runs to exhaustion
        assert!(iterate(&request).is_err());

        let request = ChunkRequest::new([("time", 1000), ("lat", 97), ("lon", 33)], 8, 8);
        let (shape, iterations) = iterate(&request).unwrap();
        assert_eq!(shape, vec![1, 1, 1]);
        assert!(iterations <= bound);
    }
}
