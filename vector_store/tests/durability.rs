use std::{fs, num::NonZeroUsize};

use rand::{Rng, SeedableRng, rngs::StdRng};
use vector_store::{Layout, StoreConfig, StoreErr, VectorStore};

fn config(capacity: usize, fetch_threads: usize) -> StoreConfig {
    StoreConfig {
        capacity: NonZeroUsize::new(capacity).unwrap(),
        fetch_threads: NonZeroUsize::new(fetch_threads).unwrap(),
        debug_logging: false,
    }
}

fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect()
}

#[test]
fn evicted_values_survive_reopening() {
    const KEYS: usize = 40;
    const DIM: usize = 16;

    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let expected: Vec<Vec<f32>> = (0..KEYS).map(|_| random_vector(&mut rng, DIM)).collect();

    {
        let store = VectorStore::open(dir.path(), Layout::dense(DIM), &config(5, 3)).unwrap();
        for (key, vector) in expected.iter().enumerate() {
            store.set(key, vector).unwrap();
        }
        store.flush_all(true).unwrap();
    }

    let store = VectorStore::open(dir.path(), Layout::dense(DIM), &config(5, 3)).unwrap();
    assert_eq!(store.keys(), (0..KEYS).collect::<Vec<_>>());

    for (key, vector) in expected.iter().enumerate() {
        assert_eq!(&store.get(key).unwrap(), vector, "mismatch at key {key}");
    }
}

#[test]
fn masked_store_only_keeps_selected_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let mask = [true, false, false, true, true];
    let layout = Layout::masked(&mask, mask.len()).unwrap();

    {
        let store = VectorStore::open(dir.path(), layout.clone(), &config(1, 1)).unwrap();
        store.set(0, &[1., 2., 3., 4., 5.]).unwrap();
        store.set(1, &[6., 7., 8., 9., 10.]).unwrap();
        store.flush_all(true).unwrap();
    }

    let bytes = std::fs::metadata(dir.path().join("0.vec")).unwrap().len();
    assert_eq!(bytes as usize, 3 * size_of::<f32>());

    let store = VectorStore::open(dir.path(), layout, &config(1, 1)).unwrap();
    assert_eq!(store.get(0).unwrap(), vec![1., 0., 0., 4., 5.]);
    assert_eq!(store.get(1).unwrap(), vec![6., 0., 0., 9., 10.]);
}

#[test]
fn prefetch_interleaved_with_writes_never_returns_stale_values() {
    const KEYS: usize = 64;
    const ROUNDS: usize = 20;

    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open(dir.path(), Layout::dense(4), &config(8, 4)).unwrap();
    let mut latest = vec![0f32; KEYS];
    let mut rng = StdRng::seed_from_u64(11);

    for key in 0..KEYS {
        store.set(key, &[0.; 4]).unwrap();
    }

    for round in 1..=ROUNDS {
        let batch: Vec<usize> = (0..8).map(|_| rng.random_range(0..KEYS)).collect();
        store.prefetch(batch.iter().copied());

        for &key in &batch {
            assert_eq!(store.get(key).unwrap(), vec![latest[key]; 4]);

            let value = round as f32;
            store.set(key, &[value; 4]).unwrap();
            latest[key] = value;
        }
    }

    store.wait_fetches().unwrap();
    for key in 0..KEYS {
        assert_eq!(store.get(key).unwrap(), vec![latest[key]; 4]);
    }
}

#[test]
fn snapshot_copies_flushed_directory() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("hyper_gradient");
    let store = VectorStore::open(&dir, Layout::dense(2), &config(4, 1)).unwrap();

    store.set(3, &[1., 2.]).unwrap();
    let snapshot = store.snapshot(10).unwrap();
    assert_eq!(snapshot, root.path().join("hyper_gradient_epoch_10"));

    store.set(3, &[5., 6.]).unwrap();
    store.flush_all(false).unwrap();

    let frozen = VectorStore::open(&snapshot, Layout::dense(2), &config(4, 1)).unwrap();
    assert_eq!(frozen.get(3).unwrap(), vec![1., 2.]);
    assert_eq!(store.get(3).unwrap(), vec![5., 6.]);

    assert!(matches!(store.snapshot(10), Err(StoreErr::Io { .. })));
}

#[test]
fn failed_reads_surface_from_get_and_wait_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let store = VectorStore::open(dir.path(), Layout::dense(2), &config(4, 2)).unwrap();

    for key in 0..3 {
        store.set(key, &[key as f32; 2]).unwrap();
    }
    store.flush_all(false).unwrap();
    store.release();
    fs::remove_file(dir.path().join("1.vec")).unwrap();

    store.prefetch([0, 1, 2]);
    assert!(matches!(store.get(1), Err(StoreErr::Io { .. })));
    assert!(matches!(store.wait_fetches(), Err(StoreErr::Io { .. })));
    store.wait_fetches().unwrap();

    assert_eq!(store.get(0).unwrap(), vec![0.; 2]);
    assert_eq!(store.get(2).unwrap(), vec![2.; 2]);
}

#[test]
fn failed_write_back_keeps_previous_values() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let store = VectorStore::open(&store_dir, Layout::dense(1), &config(2, 1)).unwrap();

    store.set(0, &[1.]).unwrap();
    store.set(1, &[2.]).unwrap();
    fs::remove_dir_all(&store_dir).unwrap();

    assert!(matches!(store.set(2, &[3.]), Err(StoreErr::Io { .. })));
    assert!(!store.contains(2));
    assert_eq!(store.get(0).unwrap(), vec![1.]);
    assert_eq!(store.get(1).unwrap(), vec![2.]);

    fs::create_dir_all(&store_dir).unwrap();
    store.set(2, &[3.]).unwrap();
    for (key, value) in [(0, 1.), (1, 2.), (2, 3.)] {
        assert_eq!(store.get(key).unwrap(), vec![value]);
    }
}
