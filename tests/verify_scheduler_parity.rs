#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_sd_fixtures::fixtures::Fixture;
    use candle_sd_fixtures::scheduler::{alphas_cumprod, betas, leading_timesteps};
    use candle_sd_fixtures::{Error, PndmScheduler, SchedulerConfig, SchedulerPhase};
    use proptest::prelude::*;
    use std::path::Path;

    const PARITY_FILE: &str = "scheduler_ref.json";

    fn configured(n: usize) -> anyhow::Result<PndmScheduler> {
        let mut scheduler = PndmScheduler::new(SchedulerConfig::default());
        scheduler.configure(n, 1000)?;
        Ok(scheduler)
    }

    #[test]
    fn test_scheduler_parity() -> anyhow::Result<()> {
        let path = Path::new(PARITY_FILE);
        if !path.exists() {
            println!("Skipping test_scheduler_parity: {PARITY_FILE} not found");
            return Ok(());
        }

        let fixture = Fixture::from_json_slice("scheduler", &std::fs::read(path)?)?;
        let ref_timesteps = fixture
            .tensor("timesteps")
            .ok_or_else(|| anyhow::anyhow!("{PARITY_FILE} has no timesteps"))?;
        let n = ref_timesteps.elem_count();
        println!("Reference schedule: {} steps", n);

        let scheduler = configured(n)?;
        let rust_timesteps: Vec<f32> = scheduler.timesteps().iter().map(|&t| t as f32).collect();
        println!("Rust timesteps (first 5): {:?}", &rust_timesteps[..n.min(5)]);
        assert_eq!(rust_timesteps, ref_timesteps.values);

        if let Some(ref_alphas) = fixture.tensor("alphas_cumprod") {
            let config = SchedulerConfig::default();
            let alphas = alphas_cumprod(&betas(&config, config.num_train_timesteps));
            let mut max_diff = 0f32;
            for (rust, py) in alphas.iter().zip(&ref_alphas.values) {
                max_diff = max_diff.max((*rust as f32 - py).abs());
            }
            println!("alphas_cumprod max difference: {}", max_diff);
            assert!(max_diff < 1e-6, "alphas_cumprod difference too large: {}", max_diff);
        }

        println!("\n✓ Scheduler parity test passed!");
        Ok(())
    }

    #[test]
    fn test_castle_schedule() -> anyhow::Result<()> {
        let scheduler = configured(25)?;
        let timesteps = scheduler.timesteps();
        assert_eq!(timesteps.len(), 25);
        assert_eq!(timesteps[0], 961);
        assert_eq!(timesteps[24], 1);
        assert!(timesteps.windows(2).all(|w| w[0] - w[1] == 40));
        assert_eq!(scheduler.init_noise_sigma()?, 1.0);
        Ok(())
    }

    #[test]
    fn test_single_step_schedule_exhausts() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut scheduler = configured(1)?;
        let t = scheduler.timesteps()[0];
        assert!(t < 1000);

        let sample = Tensor::randn(0f32, 1., (1, 4, 8, 8), &device)?;
        let eps = Tensor::randn(0f32, 1., (1, 4, 8, 8), &device)?;
        let out = scheduler.step(&eps, t, &sample)?;
        assert_eq!(out.dims(), sample.dims());
        assert_eq!(scheduler.phase(), SchedulerPhase::Exhausted);

        let err = scheduler.step(&eps, t, &out).unwrap_err();
        assert!(matches!(err, Error::OutOfSchedule { step: 1, num_steps: 1 }));
        let err = scheduler.scale_model_input(out, t).unwrap_err();
        assert!(err.is_schedule_error());
        Ok(())
    }

    #[test]
    fn test_reconfigure_resets_state() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut scheduler = configured(4)?;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device)?;
        let eps = Tensor::zeros((1, 4, 2, 2), DType::F32, &device)?;
        let first = {
            let t = scheduler.timesteps()[0];
            scheduler.step(&eps, t, &sample)?
        };
        let rest = scheduler.timesteps()[1..].to_vec();
        for t in rest {
            scheduler.step(&eps, t, &sample)?;
        }
        assert_eq!(scheduler.phase(), SchedulerPhase::Exhausted);

        scheduler.configure(4, 1000)?;
        assert_eq!(scheduler.phase(), SchedulerPhase::Ready);
        assert_eq!(scheduler.step_index(), 0);
        let t = scheduler.timesteps()[0];
        let again = scheduler.step(&eps, t, &sample)?;
        let diff = (first - again)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    /// With a zero prediction every update is a pure rescale by
    /// `sqrt(a_prev / a_t)`; across warm-up and multistep phases the factors
    /// telescope to `sqrt(a_final / a_first)`.
    #[test]
    fn test_zero_prediction_telescopes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = SchedulerConfig::default();
        let alphas = alphas_cumprod(&betas(&config, 1000));
        let mut scheduler = configured(10)?;
        let first = scheduler.timesteps()[0];

        let x0 = Tensor::randn(0f32, 1., (1, 4, 4, 4), &device)?;
        let eps = x0.zeros_like()?;
        let mut x = x0.clone();
        for t in scheduler.timesteps().to_vec() {
            x = scheduler.step(&eps, t, &x)?;
        }

        // The last step lands below zero, where the final alpha is alphas[0].
        let factor = (alphas[0] / alphas[first]).sqrt();
        let expected = x0.affine(factor, 0.0)?;
        let diff = (x - expected)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        println!("Telescoped rescale max difference: {}", diff);
        assert!(diff < 1e-4, "difference too large: {}", diff);
        Ok(())
    }

    #[test]
    fn test_configure_rejects_degenerate_schedules() {
        let mut scheduler = PndmScheduler::new(SchedulerConfig::default());
        assert!(matches!(scheduler.configure(0, 1000), Err(Error::InvalidConfig(_))));
        assert!(matches!(scheduler.configure(1001, 1000), Err(Error::InvalidConfig(_))));
        assert_eq!(scheduler.phase(), SchedulerPhase::Unconfigured);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_timesteps_strictly_decreasing_in_range(
            n in 1usize..=1000,
            offset in 0usize..3,
        ) {
            let (timesteps, step_ratio) = leading_timesteps(n, 1000, offset).unwrap();
            prop_assert_eq!(timesteps.len(), n);
            prop_assert!(timesteps[0] < 1000);
            prop_assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
            prop_assert!(timesteps.windows(2).all(|w| w[0] - w[1] == step_ratio));
        }
    }
}
