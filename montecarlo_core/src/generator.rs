//! Scenario generation with best-effort uniqueness.

use crate::model::{round4, DistributionKind, Model, Scenario, VariableSpec};
use crate::wire::scenario_fingerprint;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};
use std::collections::HashSet;

/// Default retry budget of [`next_unique`].
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;

/// Draws one value for `spec`: non-negative, rounded to 4 decimals.
///
/// Parameters a distribution cannot be built from (`max < min`, negative
/// `std`, negative or non-finite `scale`, NaN anywhere) fall back to
/// `uniform(0, 1)`.
pub fn generate_value<R: Rng + ?Sized>(spec: &VariableSpec, rng: &mut R) -> f64 {
    let raw = match spec.distribution {
        DistributionKind::Uniform => {
            let (min, max) = (spec.param("min", 0.0), spec.param("max", 1.0));
            if max >= min {
                uniform(rng, min, max)
            } else {
                unit(rng)
            }
        }
        DistributionKind::Normal => {
            let std = spec.param("std", 1.0);
            if !(std >= 0.0) {
                unit(rng)
            } else {
                match Normal::new(spec.param("mean", 0.0), std) {
                    Ok(normal) => normal.sample(rng),
                    Err(_) => unit(rng),
                }
            }
        }
        DistributionKind::Exponential => {
            let scale = spec.param("scale", 1.0);
            if scale == 0.0 {
                0.0
            } else {
                match Exp::new(1.0 / scale) {
                    Ok(exp) => exp.sample(rng),
                    Err(_) => unit(rng),
                }
            }
        }
        DistributionKind::Unknown => unit(rng),
    };

    let value = if raw.is_finite() { raw } else { unit(rng) };
    round4(value.abs())
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> f64 {
    a + (b - a) * rng.gen::<f64>()
}

fn unit<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    uniform(rng, 0.0, 1.0)
}

/// Draws one candidate scenario for `model`.
pub fn draw_scenario<R: Rng + ?Sized>(model: &Model, rng: &mut R) -> Scenario {
    model
        .variables
        .iter()
        .map(|(name, spec)| (name.clone(), generate_value(spec, rng)))
        .collect()
}

/// Draws scenarios until one is absent from `seen`, at most `max_attempts` times.
///
/// The accepted fingerprint is recorded in `seen`. Returns the scenario and
/// whether it was unique; once the budget is spent the last draw is
/// accepted anyway.
pub fn next_unique<R: Rng + ?Sized>(
    model: &Model,
    seen: &mut HashSet<String>,
    rng: &mut R,
    max_attempts: usize,
) -> (Scenario, bool) {
    let mut candidate = draw_scenario(model, rng);
    for _ in 1..max_attempts.max(1) {
        match scenario_fingerprint(&candidate) {
            Ok(fingerprint) if seen.contains(&fingerprint) => {
                candidate = draw_scenario(model, rng);
            }
            _ => break,
        }
    }

    // A scenario that cannot be fingerprinted is never remembered.
    let unique = match scenario_fingerprint(&candidate) {
        Ok(fingerprint) => seen.insert(fingerprint),
        Err(_) => true,
    };
    (candidate, unique)
}

/// Stateful generator: owns its RNG and the seen-set of one model epoch.
#[derive(Debug)]
pub struct ScenarioGenerator<R = ChaCha8Rng> {
    rng: R,
    seen: HashSet<String>,
    max_attempts: usize,
    generated: u64,
    fallbacks: u64,
}

impl ScenarioGenerator<ChaCha8Rng> {
    /// Deterministic generator.
    pub fn seeded(seed: u64, max_attempts: usize) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed), max_attempts)
    }
}

impl<R: Rng> ScenarioGenerator<R> {
    pub fn with_rng(rng: R, max_attempts: usize) -> Self {
        Self {
            rng,
            seen: HashSet::new(),
            max_attempts,
            generated: 0,
            fallbacks: 0,
        }
    }

    /// Next scenario for `model`; see [`next_unique`].
    pub fn next_unique(&mut self, model: &Model) -> (Scenario, bool) {
        let (scenario, unique) =
            next_unique(model, &mut self.seen, &mut self.rng, self.max_attempts);
        self.generated += 1;
        if !unique {
            self.fallbacks += 1;
        }
        (scenario, unique)
    }

    /// Forget every seen scenario (model change).
    pub fn reset(&mut self) {
        self.seen.clear();
        self.generated = 0;
        self.fallbacks = 0;
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Scenarios accepted as duplicates after exhausting the retry budget.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn distinct(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn beneficio() -> Model {
        Model::new(
            "beneficio",
            "Beneficio = ingresos - costos",
            "ingresos - costos",
            [
                ("ingresos".to_string(), VariableSpec::uniform(100.0, 200.0)),
                ("costos".to_string(), VariableSpec::uniform(50.0, 80.0)),
            ],
        )
    }

    fn is_4_decimals(v: f64) -> bool {
        ((v * 10_000.0).round() - v * 10_000.0).abs() < 1e-6
    }

    #[test]
    fn test_uniform_stays_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let spec = VariableSpec::uniform(100.0, 200.0);
        for _ in 0..1000 {
            let v = generate_value(&spec, &mut rng);
            assert!((100.0..=200.0).contains(&v), "{v}");
        }
    }

    #[test]
    fn test_normal_values_are_sign_flipped() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let spec = VariableSpec::normal(0.0, 10.0);
        assert!((0..1000).all(|_| generate_value(&spec, &mut rng) >= 0.0));
    }

    #[test]
    fn test_invalid_parameters_fall_back_to_unit_interval() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for spec in [
            VariableSpec::normal(5.0, -1.0),
            VariableSpec::normal(5.0, f64::NAN),
            VariableSpec::uniform(10.0, 5.0),
            VariableSpec::exponential(-2.0),
            VariableSpec::new(DistributionKind::Unknown, &[("min", 50.0)]),
        ] {
            for _ in 0..100 {
                let v = generate_value(&spec, &mut rng);
                assert!((0.0..=1.0).contains(&v), "{spec:?} -> {v}");
            }
        }
    }

    #[test]
    fn test_exponential_zero_scale_is_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(generate_value(&VariableSpec::exponential(0.0), &mut rng), 0.0);
    }

    #[test]
    fn test_seeded_generators_are_deterministic() {
        let model = beneficio();
        let mut a = ScenarioGenerator::seeded(42, DEFAULT_MAX_ATTEMPTS);
        let mut b = ScenarioGenerator::seeded(42, DEFAULT_MAX_ATTEMPTS);
        for _ in 0..50 {
            assert_eq!(a.next_unique(&model), b.next_unique(&model));
        }
    }

    #[test]
    fn test_thousand_unique_scenarios() {
        let model = beneficio();
        let mut generator = ScenarioGenerator::seeded(1, DEFAULT_MAX_ATTEMPTS);
        for _ in 0..1000 {
            generator.next_unique(&model);
        }
        assert_eq!(generator.generated(), 1000);
        assert_eq!(generator.distinct() as u64, 1000 - generator.fallbacks());
    }

    #[test]
    fn test_exhausted_budget_accepts_duplicate() {
        // Zero-width ranges make every draw identical.
        let model = Model::new(
            "constante",
            "",
            "a",
            [("a".to_string(), VariableSpec::uniform(3.0, 3.0))],
        );
        let mut generator = ScenarioGenerator::seeded(1, 5);
        let (first, unique) = generator.next_unique(&model);
        assert!(unique);
        let (second, unique) = generator.next_unique(&model);
        assert!(!unique);
        assert_eq!(first, second);
        assert_eq!(generator.fallbacks(), 1);
        assert_eq!(generator.distinct(), 1);

        generator.reset();
        assert!(generator.next_unique(&model).1);
    }

    proptest! {
        #[test]
        fn prop_scenarios_match_model(seed in any::<u64>(), mean in -100.0f64..100.0, std in 0.0f64..50.0) {
            let model = Model::new(
                "mixto",
                "",
                "a + b + c",
                [
                    ("a".to_string(), VariableSpec::uniform(-10.0, 10.0)),
                    ("b".to_string(), VariableSpec::normal(mean, std)),
                    ("c".to_string(), VariableSpec::exponential(2.0)),
                ],
            );
            let mut generator = ScenarioGenerator::seeded(seed, DEFAULT_MAX_ATTEMPTS);
            for _ in 0..20 {
                let (scenario, _) = generator.next_unique(&model);
                prop_assert!(model.matches(&scenario));
                for v in scenario.values() {
                    prop_assert!(*v >= 0.0);
                    prop_assert!(is_4_decimals(*v));
                }
            }
        }

        #[test]
        fn prop_distinct_bounded_by_fallbacks(seed in any::<u64>(), attempts in 1usize..20) {
            // Narrow range forces collisions.
            let model = Model::new(
                "estrecho",
                "",
                "a",
                [("a".to_string(), VariableSpec::uniform(0.0, 0.01))],
            );
            let mut generator = ScenarioGenerator::seeded(seed, attempts);
            for _ in 0..200 {
                generator.next_unique(&model);
            }
            prop_assert_eq!(generator.distinct() as u64, 200 - generator.fallbacks());
        }
    }
}
