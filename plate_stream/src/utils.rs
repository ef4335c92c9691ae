use std::time::{Duration, Instant};

/// Paces a loop to a fixed interval between iterations.
pub struct FpsLimiter {
    fps_control: Instant,
    fps_wait: Duration,
}

impl FpsLimiter {
    pub fn new(fps_wait: Duration) -> Self {
        Self {
            fps_control: Instant::now(),
            fps_wait,
        }
    }

    /// Sleeps out the rest of the interval, then starts the next one.
    pub fn wait(&mut self) {
        let elapsed = self.fps_control.elapsed();

        if self.fps_wait > elapsed {
            spin_sleep::sleep(self.fps_wait - elapsed);
        }

        self.fps_control = Instant::now();
    }
}
