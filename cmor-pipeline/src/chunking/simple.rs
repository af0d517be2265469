// Simple Chunking
// Single-pass chunk estimate from the byte budget

use super::ChunkRequest;

/// Estimate a chunk shape in one pass.
///
/// With a preferred sequential dimension, every other dimension is kept whole
/// and the sequential chunk absorbs the budget. Otherwise all dimensions are
/// scaled by the same factor so the element count approaches the budget.
pub fn simple_chunks(request: &ChunkRequest) -> Vec<usize> {
    let lengths = request.lengths();
    let element_size = request.element_size as f64;
    let target_elements = (request.budget as f64 / element_size).max(1.0);

    if let Some(seq) = request.preferred_sequential_dim() {
        let others: f64 = lengths
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != seq)
            .map(|(_, &len)| len as f64)
            .product();
        let chunk = (target_elements / others).floor() as usize;
        return lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| if i == seq { chunk.clamp(1, len) } else { len })
            .collect();
    }

    let total: f64 = lengths.iter().map(|&len| len as f64).product();
    if total <= target_elements {
        return lengths;
    }

    let scale = (target_elements / total).powf(1.0 / lengths.len() as f64);
    lengths
        .iter()
        .map(|&len| ((len as f64 * scale).floor() as usize).clamp(1, len))
        .collect()
}
