use std::collections::VecDeque;
use std::time::Instant;

/// Fixed-size window of recent samples.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn average(&self) -> f32 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f32>() / self.samples.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Inbound counters of one camera pipeline.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    /// Frames the encoder pool had no room for
    pub frames_dropped: u64,
    pub fps_samples: SlidingWindow,
    pub last_frame_time: Option<Instant>,
    pub width: u32,
    pub height: u32,
    pub last_error: Option<String>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            frames_captured: 0,
            frames_encoded: 0,
            frames_dropped: 0,
            fps_samples: SlidingWindow::new(30),
            last_frame_time: None,
            width: 0,
            height: 0,
            last_error: None,
        }
    }
}

impl PipelineStats {
    /// Account for one captured frame of `width`x`height`.
    pub fn record_frame(&mut self, width: u32, height: u32) {
        let now = Instant::now();
        if let Some(last) = self.last_frame_time {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                self.fps_samples.push(1.0 / elapsed);
            }
        }
        self.last_frame_time = Some(now);
        self.frames_captured += 1;
        self.width = width;
        self.height = height;
        self.last_error = None;
    }

    /// Stream gaps must not count as a slow frame.
    pub fn reset_timing(&mut self) {
        self.last_frame_time = None;
        self.fps_samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sliding_window_evicts_oldest() {
        let mut window = SlidingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 10.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_relative_eq!(window.average(), 5.0);
    }

    #[test]
    fn test_empty_window_averages_zero() {
        assert_eq!(SlidingWindow::new(4).average(), 0.0);
    }

    #[test]
    fn test_record_frame_clears_error() {
        let mut stats = PipelineStats {
            last_error: Some("timeout".into()),
            ..Default::default()
        };
        stats.record_frame(640, 480);
        stats.record_frame(640, 480);
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.fps_samples.len(), 1);
        assert!(stats.last_error.is_none());
        assert_eq!((stats.width, stats.height), (640, 480));
    }
}
