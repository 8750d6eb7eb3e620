use std::time::Duration;

/// Per-cycle statistics for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    /// Cells in visible ∪ shadow after validation.
    pub selected_cells: usize,
    /// Cells whose lists were computed this cycle.
    pub loaded_cells: usize,
    pub parallel_load: bool,
    pub load_jobs: usize,
    pub load_failures: usize,
    pub post_process_failures: usize,
    /// Bytes packed into compute staging buffers.
    pub staged_bytes: usize,
    pub batch_jobs: usize,
    pub batch_failures: usize,
    /// Models not batched because of their render path.
    pub skipped_models: usize,
    pub committed_batches: usize,
    pub committed_instances: usize,
    pub preprocess_time: Duration,
    pub batch_time: Duration,
}

impl CycleStats {
    pub fn total_time(&self) -> Duration {
        self.preprocess_time + self.batch_time
    }

    /// Jobs that panicked in either phase.
    pub fn failures(&self) -> usize {
        self.load_failures + self.batch_failures
    }
}

/// Cycle time history with a budget.
#[derive(Debug)]
pub struct CycleTimer {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
    budget: Duration,
    over_budget: usize,
}

impl CycleTimer {
    pub fn new(capacity: usize, budget: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
            budget,
            over_budget: 0,
        }
    }

    /// Record one cycle. Returns `true` if it exceeded the budget.
    pub fn record(&mut self, dt: Duration) -> bool {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
        let over = !self.budget.is_zero() && dt > self.budget;
        if over {
            self.over_budget += 1;
        }
        over
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = budget;
    }

    /// Cycles over budget since creation, including ones evicted from history.
    pub fn over_budget_count(&self) -> usize {
        self.over_budget
    }

    pub fn average(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.history[..count].iter().sum();
        total / count as u32
    }

    pub fn max(&self) -> Duration {
        self.history[..self.count()]
            .iter()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }
}
