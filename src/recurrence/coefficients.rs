/// A snapshot of the optimizer's hyperparameters at one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub momentum: f32,
    pub weight_decay: f32,
    pub learning_rate: f32,
}

impl Coefficients {
    pub fn new(momentum: f32, weight_decay: f32, learning_rate: f32) -> Self {
        Self {
            momentum,
            weight_decay,
            learning_rate,
        }
    }
}

/// The steps a key skipped, in the order they happened.
///
/// Consecutive equal steps are stored as a single run, expansion through `iter`
/// yields exactly the appended sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingQueue {
    runs: Vec<(Coefficients, usize)>,
}

impl PendingQueue {
    pub fn push(&mut self, coefficients: Coefficients) {
        match self.runs.last_mut() {
            Some((last, repeat)) if *last == coefficients => *repeat += 1,
            _ => self.runs.push((coefficients, 1)),
        }
    }

    /// Returns the amount of queued steps.
    pub fn len(&self) -> usize {
        self.runs.iter().map(|(_, repeat)| repeat).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    /// Iterates the queued steps in append order.
    pub fn iter(&self) -> impl Iterator<Item = Coefficients> + '_ {
        self.runs
            .iter()
            .flat_map(|&(coefficients, repeat)| std::iter::repeat_n(coefficients, repeat))
    }
}
