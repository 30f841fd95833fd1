//! Frame timing for the main loop.

use std::time::{Duration, Instant};

/// Measures per-frame delta time and a rolling frames-per-second figure.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    frame_count: u64,
    window_start: Instant,
    window_frames: u32,
    fps: f32,
}

impl FrameTimer {
    /// Length of the window used to average the fps value.
    pub const FPS_WINDOW: Duration = Duration::from_secs(1);

    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frame_count: 0,
            window_start: now,
            window_frames: 0,
            fps: 0.0,
        }
    }

    /// Total time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Marks the end of a frame and returns the time since the previous one.
    ///
    /// Returns `Some(fps)` alongside the delta whenever a new averaging window
    /// completes, so callers can log at a steady cadence.
    pub fn tick(&mut self) -> (Duration, Option<f32>) {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.frame_count += 1;
        self.window_frames += 1;

        let window = now - self.window_start;
        if window >= Self::FPS_WINDOW {
            self.fps = self.window_frames as f32 / window.as_secs_f32();
            self.window_frames = 0;
            self.window_start = now;
            return (delta, Some(self.fps));
        }
        (delta, None)
    }

    /// Number of completed frames.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Most recent averaged fps value (0 until the first window completes).
    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_frames() {
        let mut timer = FrameTimer::new();
        timer.tick();
        timer.tick();
        assert_eq!(timer.frame_count(), 2);
    }

    #[test]
    fn test_fps_reported_after_window() {
        let mut timer = FrameTimer::new();
        timer.window_start = timer
            .window_start
            .checked_sub(FrameTimer::FPS_WINDOW)
            .unwrap();
        let (_, fps) = timer.tick();
        assert!(fps.is_some());
        assert!(timer.fps() > 0.0);
    }
}
