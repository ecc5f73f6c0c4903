/// Split candidates into ordered batches of at most `batch_size`
///
/// A zero batch size is treated as 1.
pub fn plan_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Number of batches `plan_batches` would produce
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    total.div_ceil(batch_size.max(1))
}
