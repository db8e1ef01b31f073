//! Epoch-based schedules for the K-FAC hyperparameters
//!
//! Works like a step learning-rate schedule: at each milestone epoch the
//! damping (or both update frequencies) are multiplied by an alpha. Call
//! [`KfacParamScheduler::step`] once per epoch.

use tracing::{debug, warn};

use crate::config::ScheduleConfig;
use crate::optimizer::{HyperParams, Kfac};

/// Milestones `(epoch_threshold, alpha)`, sorted by descending threshold
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    milestones: Vec<(usize, f64)>,
}

impl Schedule {
    /// Schedule from explicit `(threshold, alpha)` pairs
    pub fn new(mut milestones: Vec<(usize, f64)>) -> Self {
        milestones.sort_by(|a, b| b.0.cmp(&a.0));
        Self { milestones }
    }

    /// Multiply by `alpha` at every epoch in `epochs`
    pub fn uniform(alpha: f64, epochs: &[usize]) -> Self {
        Self::new(epochs.iter().map(|&e| (e, alpha)).collect())
    }

    /// Schedule that never changes anything
    pub fn empty() -> Self {
        Self::default()
    }

    /// Product of the alphas of every milestone reached at `epoch`
    pub fn factor(&self, epoch: usize) -> f64 {
        self.milestones
            .iter()
            .filter(|(threshold, _)| epoch >= *threshold)
            .map(|(_, alpha)| alpha)
            .product()
    }

    /// Milestones, highest threshold first
    pub fn milestones(&self) -> &[(usize, f64)] {
        &self.milestones
    }
}

/// Updates the damping and update frequencies of a [`Kfac`] by epoch
#[derive(Debug, Clone)]
pub struct KfacParamScheduler {
    /// Damping when the scheduler was created
    damping_base: f64,
    /// Factor update frequency when the scheduler was created
    fac_update_freq_base: usize,
    /// Eigen update frequency when the scheduler was created
    kfac_update_freq_base: usize,
    damping_schedule: Schedule,
    update_freq_schedule: Schedule,
    epoch: usize,
}

impl KfacParamScheduler {
    /// Scheduler from the engine's own `schedule` configuration, if it has one
    pub fn from_config(kfac: &Kfac) -> Option<Self> {
        kfac.config()
            .schedule
            .as_ref()
            .map(|schedule| Self::new(kfac, schedule))
    }

    /// Capture the current hyperparameters of `kfac` as the base values
    pub fn new(kfac: &Kfac, config: &ScheduleConfig) -> Self {
        Self::with_schedules(
            kfac,
            Schedule::uniform(config.damping_alpha, &config.damping_schedule),
            Schedule::uniform(config.update_freq_alpha, &config.update_freq_schedule),
            config.start_epoch,
        )
    }

    /// Scheduler with explicit milestone lists
    pub fn with_schedules(
        kfac: &Kfac,
        damping_schedule: Schedule,
        update_freq_schedule: Schedule,
        start_epoch: usize,
    ) -> Self {
        let params = kfac.hyperparams();
        Self {
            damping_base: params.damping,
            fac_update_freq_base: params.fac_update_freq,
            kfac_update_freq_base: params.kfac_update_freq,
            damping_schedule,
            update_freq_schedule,
            epoch: start_epoch,
        }
    }

    /// Advance to `epoch` (or the next epoch) and write the scheduled values into `kfac`
    pub fn step(&mut self, kfac: &mut Kfac, epoch: Option<usize>) -> HyperParams {
        match epoch {
            Some(e) => self.epoch = e,
            None => self.epoch += 1,
        }

        let damping = self.damping_base * self.damping_schedule.factor(self.epoch);
        let factor = self.update_freq_schedule.factor(self.epoch);
        let fac_update_freq = scaled_freq("fac_update_freq", self.fac_update_freq_base, factor);
        let kfac_update_freq = scaled_freq("kfac_update_freq", self.kfac_update_freq_base, factor);

        kfac.apply_schedule(damping, fac_update_freq, kfac_update_freq);
        debug!(
            "Epoch {}: damping={:.3e} fac_update_freq={} kfac_update_freq={}",
            self.epoch, damping, fac_update_freq, kfac_update_freq
        );
        kfac.hyperparams()
    }

    /// Current epoch
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

fn scaled_freq(name: &str, base: usize, factor: f64) -> usize {
    let freq = (base as f64 * factor) as usize;
    if freq == 0 {
        warn!(
            "Scheduled {} truncated to 0 (base {} x {}); using 1",
            name, base, factor
        );
        return 1;
    }
    freq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KfacConfig;
    use crate::layers::{KfacModel, Linear, TrainableLayer};
    use approx::assert_relative_eq;
    use candle_core::Device;
    use proptest::prelude::*;

    struct Tiny(Linear);

    impl KfacModel for Tiny {
        fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
            vec![&mut self.0]
        }
    }

    fn kfac() -> Kfac {
        let mut model = Tiny(Linear::init("fc", 2, 2, false, &Device::Cpu).unwrap());
        let config = KfacConfig {
            damping: 0.01,
            fac_update_freq: 10,
            kfac_update_freq: 100,
            ..Default::default()
        };
        Kfac::new(&mut model, config).unwrap()
    }

    #[test]
    fn test_schedule_factor() {
        let schedule = Schedule::uniform(0.5, &[10, 20]);
        assert_eq!(schedule.milestones(), &[(20, 0.5), (10, 0.5)]);
        assert_eq!(schedule.factor(0), 1.0);
        assert_eq!(schedule.factor(10), 0.5);
        assert_eq!(schedule.factor(25), 0.25);
        assert_eq!(Schedule::empty().factor(100), 1.0);
    }

    #[test]
    fn test_step_updates_engine() {
        let mut kfac = kfac();
        let mut scheduler = KfacParamScheduler::with_schedules(
            &kfac,
            Schedule::uniform(0.1, &[2]),
            Schedule::uniform(2.0, &[1]),
            0,
        );

        let params = scheduler.step(&mut kfac, None);
        assert_eq!(scheduler.epoch(), 1);
        assert_relative_eq!(params.damping, 0.01, epsilon = 1e-12);
        assert_eq!(params.fac_update_freq, 20);
        assert_eq!(params.kfac_update_freq, 200);

        let params = scheduler.step(&mut kfac, Some(5));
        assert_relative_eq!(params.damping, 0.001, epsilon = 1e-12);
        assert_eq!(kfac.hyperparams(), params);
    }

    #[test]
    fn test_zero_frequency_is_raised_to_one() {
        let mut kfac = kfac();
        let mut scheduler = KfacParamScheduler::with_schedules(
            &kfac,
            Schedule::empty(),
            Schedule::uniform(0.01, &[0]),
            0,
        );
        let params = scheduler.step(&mut kfac, Some(0));
        // 10 * 0.01 truncates to 0
        assert_eq!(params.fac_update_freq, 1);
        assert_eq!(params.kfac_update_freq, 1);
    }

    #[test]
    fn test_start_epoch_resumes() {
        let kfac = kfac();
        let config = ScheduleConfig {
            start_epoch: 7,
            ..Default::default()
        };
        let scheduler = KfacParamScheduler::new(&kfac, &config);
        assert_eq!(scheduler.epoch(), 7);
        assert!(KfacParamScheduler::from_config(&kfac).is_none());
    }

    proptest! {
        #[test]
        fn prop_decaying_schedule_is_monotone(
            epochs in proptest::collection::vec(0usize..50, 0..5),
            alpha in 0.01f64..1.0,
            e in 0usize..60,
        ) {
            let schedule = Schedule::uniform(alpha, &epochs);
            prop_assert!(schedule.factor(e + 1) <= schedule.factor(e));
            prop_assert!(schedule.factor(e) <= 1.0);
        }
    }
}
