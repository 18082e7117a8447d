use burn::prelude::*;

use crate::error::Error;

/// Step decay of the learning rate.
///
/// Example: base lr = 1e-3, step_size = 1000, gamma = 0.1:
/// (0..1000 → 1e-3), (1000..2000 → 1e-4), (2000..3000 → 1e-5, ...)
#[derive(Config, Debug, PartialEq)]
pub struct StepDecayConfig {
    /// Number of iterations between two decays.
    #[config(default = 1000)]
    pub step_size: usize,

    /// Multiplicative factor applied at every decay.
    #[config(default = 0.1)]
    pub gamma: f64,
}

impl StepDecayConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.step_size == 0 {
            return Err(Error::InvalidConfig("lr_decay.step_size must be at least 1".into()));
        }
        if !(self.gamma > 0.0 && self.gamma.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "lr_decay.gamma must be positive, got {}",
                self.gamma
            )));
        }
        Ok(())
    }

    /// Learning rate for the (zero-based) `iteration`.
    pub fn lr(&self, base_lr: f64, iteration: usize) -> f64 {
        assert_ne!(self.step_size, 0);
        let decays = (iteration / self.step_size) as i32;
        base_lr * self.gamma.powi(decays)
    }
}

/// Learning rate for `iteration`, constant when no decay is configured.
pub fn lr_at(base_lr: f64, decay: Option<&StepDecayConfig>, iteration: usize) -> f64 {
    match decay {
        Some(decay) => decay.lr(base_lr, iteration),
        None => base_lr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_every_step_size_iterations() {
        let decay = StepDecayConfig::new();
        let close = |a: f64, b: f64| (a - b).abs() < 1e-15;
        assert!(close(1e-3, decay.lr(1e-3, 0)));
        assert!(close(1e-3, decay.lr(1e-3, 999)));
        assert!(close(1e-4, decay.lr(1e-3, 1000)));
        assert!(close(1e-5, decay.lr(1e-3, 2500)));
    }

    #[test]
    fn constant_without_decay() {
        assert_eq!(1e-3, lr_at(1e-3, None, 0));
        assert_eq!(1e-3, lr_at(1e-3, None, 1_000_000));
    }

    #[test]
    fn validate_rejects_degenerate_decay() {
        assert!(StepDecayConfig::new().validate().is_ok());
        assert!(StepDecayConfig::new().with_step_size(0).validate().is_err());
        assert!(StepDecayConfig::new().with_gamma(0.0).validate().is_err());
        assert!(StepDecayConfig::new().with_gamma(f64::NAN).validate().is_err());
    }
}
