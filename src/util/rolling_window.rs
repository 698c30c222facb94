use std::collections::VecDeque;

/// Fixed-size window over the most recent integer samples with an incrementally maintained sum.
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<i32>,
    cached_sum: i64,
}
impl RollingWindow {
    pub fn new(capacity: usize) -> RollingWindow {
        assert!(capacity > 0, "a rolling window needs room for at least one sample");

        RollingWindow {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            cached_sum: 0,
        }
    }

    /// adds a new sample, returning the sample that was evicted in its place (if any)
    pub fn add_sample(&mut self, value: i32) -> Option<i32> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        }
        else {
            None
        };
        if let Some(evicted) = evicted {
            self.cached_sum -= evicted as i64;
        }

        self.samples.push_back(value);
        self.cached_sum += value as i64;
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.cached_sum as f32 / self.samples.len() as f32)
    }
}
