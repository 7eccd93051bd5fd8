use std::time::{Duration, Instant};

/// Fades on-screen controls out after a period without interaction.
#[derive(Debug, Clone)]
pub struct ControlVisibility {
    fade_delay: Duration,
    fade_duration: Duration,
    last_interaction: Instant,
}

impl Default for ControlVisibility {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(1))
    }
}

impl ControlVisibility {
    pub fn new(fade_delay: Duration, fade_duration: Duration) -> Self {
        Self {
            fade_delay,
            fade_duration,
            last_interaction: Instant::now(),
        }
    }

    pub fn register_interaction(&mut self) {
        self.register_interaction_at(Instant::now());
    }

    pub fn register_interaction_at(&mut self, now: Instant) {
        self.last_interaction = now;
    }

    pub fn alpha(&self) -> u8 {
        self.alpha_at(Instant::now())
    }

    /// 255 until `fade_delay` has passed, then linear down to 0.
    pub fn alpha_at(&self, now: Instant) -> u8 {
        let idle = now.saturating_duration_since(self.last_interaction);
        if idle <= self.fade_delay {
            return u8::MAX;
        }

        let fading = idle - self.fade_delay;
        if self.fade_duration.is_zero() || fading >= self.fade_duration {
            return 0;
        }

        let remaining = 1.0 - fading.as_secs_f32() / self.fade_duration.as_secs_f32();
        (remaining * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_during_delay_then_fades() {
        let start = Instant::now();
        let mut visibility =
            ControlVisibility::new(Duration::from_millis(5_000), Duration::from_millis(1_000));
        visibility.register_interaction_at(start);

        assert_eq!(visibility.alpha_at(start), 255);
        assert_eq!(visibility.alpha_at(start + Duration::from_millis(5_000)), 255);
        assert_eq!(visibility.alpha_at(start + Duration::from_millis(5_500)), 128);
        assert_eq!(visibility.alpha_at(start + Duration::from_millis(6_000)), 0);
        assert_eq!(visibility.alpha_at(start + Duration::from_secs(60)), 0);
    }

    #[test]
    fn interaction_restores_controls() {
        let start = Instant::now();
        let mut visibility = ControlVisibility::new(Duration::ZERO, Duration::ZERO);
        visibility.register_interaction_at(start);
        assert_eq!(visibility.alpha_at(start + Duration::from_millis(1)), 0);

        let later = start + Duration::from_secs(1);
        visibility.register_interaction_at(later);
        assert_eq!(visibility.alpha_at(later), 255);
    }
}
