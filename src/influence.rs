use std::collections::BTreeMap;

use log::info;
use ndarray::ArrayView1;
use vector_store::{Key, StoreErr, VectorStore};

use crate::Result;

/// Scores every stored sample by the dot product of its vector with `product`.
///
/// Keys are visited in ascending order and chunks are prefetched one ahead, so at
/// most two chunks of half the store's capacity are in flight at a time.
///
/// # Arguments
/// * `store` - A store of per-sample vectors, typically the hyper-gradients.
/// * `product` - The test side of the score, already scaled by the caller, e.g. an
///   inverse Hessian-vector product divided by the training set size.
///
/// # Returns
/// The contribution of every key present in `store`.
pub fn contributions(store: &VectorStore, product: &[f32]) -> Result<BTreeMap<Key, f32>> {
    let dim = store.layout().dim();
    if product.len() != dim {
        return Err(StoreErr::ShapeMismatch {
            what: "influence product",
            got: product.len(),
            expected: dim,
        }
        .into());
    }

    let keys = store.keys();
    let chunk_size = (store.capacity().get() / 2).max(1);
    let chunks: Vec<&[Key]> = keys.chunks(chunk_size).collect();
    let product = ArrayView1::from(product);

    if let Some(first) = chunks.first() {
        store.prefetch(first.iter().copied());
    }

    let mut scores = BTreeMap::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if let Some(next) = chunks.get(i + 1) {
            store.prefetch(next.iter().copied());
        }

        for &key in chunk.iter() {
            let vector = store.get(key)?;
            scores.insert(key, product.dot(&ArrayView1::from(vector.as_slice())));
        }
    }

    store.wait_fetches()?;
    info!(keys = scores.len(); "computed influence contributions");

    Ok(scores)
}
