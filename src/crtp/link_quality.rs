use crate::util::rolling_window::RollingWindow;


const MAX_RETRIES: i32 = 10;

/// Link quality in percent, derived from the radio's retry counts over the last exchanges: no
///  retries mean 100%, ten or more retries 0%.
pub struct LinkQualityTracker {
    retries: RollingWindow,
}
impl LinkQualityTracker {
    pub fn new(window_size: usize) -> LinkQualityTracker {
        LinkQualityTracker {
            retries: RollingWindow::new(window_size),
        }
    }

    /// records one exchange's retry count and returns the updated quality
    pub fn record(&mut self, retry_count: u8) -> f32 {
        self.retries.add_sample(MAX_RETRIES - retry_count as i32);
        self.quality()
    }

    pub fn quality(&self) -> f32 {
        match self.retries.mean() {
            Some(mean) => (mean * 10.0).clamp(0.0, 100.0),
            None => 100.0,
        }
    }
}
