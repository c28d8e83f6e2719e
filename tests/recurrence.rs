use std::{fs, num::NonZeroUsize, path::Path};

use hyper_gradient::recurrence::{Coefficients, LazyRecurrence};
use rand::{Rng, SeedableRng, rngs::StdRng};
use vector_store::{Layout, StoreConfig, VectorStore};

const KEYS: usize = 6;
const DIM: usize = 4;
const BATCH: usize = 2;

fn engine(dir: &Path, capacity: usize) -> LazyRecurrence {
    let config = StoreConfig {
        capacity: NonZeroUsize::new(capacity).unwrap(),
        fetch_threads: NonZeroUsize::new(3).unwrap(),
        debug_logging: false,
    };

    let momentum = VectorStore::open(dir.join("momentum"), Layout::dense(DIM), &config).unwrap();
    let hyper = VectorStore::open(dir.join("hyper"), Layout::dense(DIM), &config).unwrap();
    LazyRecurrence::new(momentum, hyper, KEYS).unwrap()
}

/// The recurrence applied at every step with zero vectors for absent state.
#[derive(Clone)]
struct Eager {
    momentum: Vec<f32>,
    hyper: Vec<f32>,
}

impl Eager {
    fn step(&mut self, grad: Option<&[f32]>, c: Coefficients) {
        let scale = KEYS as f32 / BATCH as f32;

        for i in 0..DIM {
            let g = grad.map_or(0., |grad| grad[i] * scale);
            self.momentum[i] = g + c.momentum * self.momentum[i] + c.weight_decay * self.hyper[i];
            self.hyper[i] -= c.learning_rate * self.momentum[i];
        }
    }
}

fn close(a: &[f32], b: &[f32]) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-4 * (1. + x.abs().max(y.abs())))
}

fn stored(engine: &LazyRecurrence, key: usize) -> (Vec<f32>, Vec<f32>) {
    let state = engine.state(key).unwrap();
    let zeros = || vec![0.; DIM];

    (
        state.momentum.map_or_else(zeros, |m| m.to_vec()),
        state.hyper.map_or_else(zeros, |h| h.to_vec()),
    )
}

#[test]
fn lazy_recurrence_matches_eager_recurrence() {
    for seed in 0..5 {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut lazy = engine(dir.path(), 3);
        let mut eager = vec![
            Eager {
                momentum: vec![0.; DIM],
                hyper: vec![0.; DIM],
            };
            KEYS
        ];

        for _ in 0..40 {
            let c = Coefficients::new(
                rng.random_range(0.5..0.99),
                rng.random_range(0.0..0.01),
                rng.random_range(0.01..0.2),
            );

            let mut touched = [false; KEYS];
            let mut grads = Vec::new();
            for key in 0..KEYS {
                if rng.random_bool(0.3) {
                    touched[key] = true;
                    let grad: Vec<f32> = (0..DIM).map(|_| rng.random_range(-1.0..1.0)).collect();
                    grads.push((key, grad));
                }
            }

            lazy.enqueue_untouched(&touched, c).unwrap();
            for (key, grad) in &grads {
                lazy.direct_update(*key, grad, NonZeroUsize::new(BATCH).unwrap(), c)
                    .unwrap();
            }

            for (key, state) in eager.iter_mut().enumerate() {
                let grad = grads.iter().find(|(k, _)| *k == key).map(|(_, g)| g.as_slice());
                state.step(grad, c);
            }
        }

        lazy.drain_all().unwrap();

        for (key, expected) in eager.iter().enumerate() {
            let (momentum, hyper) = stored(&lazy, key);
            assert!(close(&momentum, &expected.momentum), "seed {seed} key {key} momentum");
            assert!(close(&hyper, &expected.hyper), "seed {seed} key {key} hyper");
        }
    }
}

#[test]
fn draining_never_touched_key_materializes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut lazy = engine(dir.path(), 4);

    lazy.enqueue(0, Coefficients::new(0.9, 0., 0.1)).unwrap();
    lazy.drain(0).unwrap();

    let state = lazy.state(0).unwrap();
    assert!(state.momentum.is_none());
    assert!(state.hyper.is_none());
    assert!(lazy.pending(0).unwrap().is_empty());
}

#[test]
fn snapshot_drains_and_copies_both_stores() {
    let dir = tempfile::tempdir().unwrap();
    let mut lazy = engine(dir.path(), 2);
    let c = Coefficients::new(0.5, 0., 1.);

    for key in 0..KEYS {
        lazy.direct_update(key, &[1.; DIM], NonZeroUsize::new(KEYS).unwrap(), c)
            .unwrap();
        lazy.enqueue(key, c).unwrap();
    }

    let (momentum, hyper) = lazy.snapshot(12).unwrap();
    assert_eq!(momentum, dir.path().join("momentum_epoch_12"));
    assert_eq!(hyper, dir.path().join("hyper_epoch_12"));

    let config = StoreConfig::default();
    let frozen = VectorStore::open(&hyper, Layout::dense(DIM), &config).unwrap();
    for key in 0..KEYS {
        assert!(lazy.pending(key).unwrap().is_empty());
        assert_eq!(frozen.get(key).unwrap(), vec![-1.5; DIM]);
    }
}

#[test]
fn failed_update_leaves_state_and_queue_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut lazy = engine(dir.path(), 1);
    let c = Coefficients::new(0.5, 0., 1.);
    let batch = NonZeroUsize::new(KEYS).unwrap();

    lazy.direct_update(0, &[1.; DIM], batch, c).unwrap();
    lazy.enqueue(1, c).unwrap();
    lazy.enqueue(1, c).unwrap();

    fs::remove_dir_all(dir.path().join("hyper")).unwrap();
    assert!(lazy.direct_update(1, &[1.; DIM], batch, c).is_err());

    assert_eq!(lazy.pending(1).unwrap().len(), 2);
    let state = lazy.state(1).unwrap();
    assert!(state.momentum.is_none());
    assert!(state.hyper.is_none());
    assert_eq!(stored(&lazy, 0), (vec![1.; DIM], vec![-1.; DIM]));

    fs::create_dir_all(dir.path().join("hyper")).unwrap();
    lazy.direct_update(1, &[1.; DIM], batch, c).unwrap();

    assert!(lazy.pending(1).unwrap().is_empty());
    assert_eq!(stored(&lazy, 1), (vec![1.; DIM], vec![-1.; DIM]));
    assert_eq!(stored(&lazy, 0), (vec![1.; DIM], vec![-1.; DIM]));
}
