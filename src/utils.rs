use std::time::{Duration, Instant};

/// Byte length of a `width`x`height` RGBA8 image, or `None` if it does not fit in memory.
pub fn rgba_len(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)?.checked_mul(4)
}

/// Paces redraws to a target rate and reports the achieved FPS.
pub struct FrameClock {
    frame_duration: Duration,
    last_frame: Option<Instant>,
    start: Instant,
    frames: u64,
    window_frames: u32,
    window_start: Instant,
    interval: Duration,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        let now = Instant::now();
        Self {
            frame_duration: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            last_frame: None,
            start: now,
            frames: 0,
            window_frames: 0,
            window_start: now,
            interval: Duration::from_secs(1),
        }
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.frame_duration = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Whether enough time has passed since the last ticked frame.
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_frame
            .map_or(true, |last| now.duration_since(last) >= self.frame_duration)
    }

    /// Record a frame at `now`. Returns the FPS once per reporting interval.
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.last_frame = Some(now);
        self.frames += 1;
        self.window_frames += 1;

        let elapsed = now.duration_since(self.window_start);
        if elapsed >= self.interval {
            let fps = self.window_frames as f32 / elapsed.as_secs_f32();
            self.window_frames = 0;
            self.window_start = now;
            Some(fps)
        } else {
            None
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Seconds since the clock was created.
    pub fn elapsed(&self, now: Instant) -> f32 {
        now.duration_since(self.start).as_secs_f32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paces_to_the_target_rate() {
        let mut clock = FrameClock::new(50);
        let t0 = Instant::now();
        assert!(clock.is_due(t0));
        clock.tick(t0);
        assert!(!clock.is_due(t0 + Duration::from_millis(10)));
        assert!(clock.is_due(t0 + Duration::from_millis(20)));
    }

    #[test]
    fn reports_fps_once_per_interval() {
        let mut clock = FrameClock::new(10);
        let t0 = clock.window_start;
        let reports: Vec<f32> = (1..=20)
            .filter_map(|i| clock.tick(t0 + Duration::from_millis(100 * i)))
            .collect();
        assert_eq!(reports.len(), 2);
        assert!((reports[0] - 10.0).abs() < 1e-3);
        assert_eq!(clock.frames(), 20);
    }

    #[test]
    fn rgba_len_refuses_sizes_that_overflow() {
        assert_eq!(rgba_len(2, 3), Some(24));
        assert_eq!(rgba_len(0, 7), Some(0));
        assert_eq!(rgba_len(u32::MAX, u32::MAX), None);
    }
}
