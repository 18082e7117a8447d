use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::error::Error;

/// How the pointwise KL divergence is reduced to a scalar.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KlReduction {
    /// Mean over every `batch * classes` element.
    #[default]
    Mean,
    /// Sum divided by the batch size.
    BatchMean,
    Sum,
}

/// Configuration to create a [distillation loss](DistillationLoss) using the [init function](DistillationLossConfig::init).
#[derive(Config, Debug)]
pub struct DistillationLossConfig {
    /// Divisor applied to both logits before the softmax of the distillation term.
    #[config(default = 20.0)]
    pub temperature: f64,

    /// Weight of the distillation term. The hard-label term is weighted by `1 - alpha`.
    #[config(default = 0.5)]
    pub alpha: f64,

    #[config(default = "KlReduction::Mean")]
    pub kl_reduction: KlReduction,

    /// Compute the hard-label cross entropy on the temperature-scaled student logits
    /// instead of the raw ones.
    #[config(default = false)]
    pub scale_hard_logits: bool,
}

impl DistillationLossConfig {
    /// Initialize the [distillation loss](DistillationLoss).
    ///
    /// # Panics
    ///
    /// If `temperature <= 0` or `alpha` is outside of `[0, 1]`.
    pub fn init(&self) -> DistillationLoss {
        match self.try_init() {
            Ok(loss) => loss,
            Err(err) => panic!("{err}"),
        }
    }

    /// See also [`Self::init`].
    pub fn try_init(&self) -> crate::error::Result<DistillationLoss> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::InvalidConfig(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        Ok(DistillationLoss {
            temperature: self.temperature,
            alpha: self.alpha,
            kl_reduction: self.kl_reduction,
            scale_hard_logits: self.scale_hard_logits,
        })
    }
}

/// Hinton distillation objective:
///
/// ```text
/// L = (1 - α) * CE(student, labels) + α * T² * KL(log_softmax(student/T), softmax(teacher/T))
/// ```
///
/// The T² factor compensates the gradient shrinkage caused by the temperature.
///
/// Should be created using [DistillationLossConfig].
#[derive(Clone, Debug)]
pub struct DistillationLoss {
    pub temperature: f64,
    pub alpha: f64,
    pub kl_reduction: KlReduction,
    pub scale_hard_logits: bool,
}

/// Loss terms of a single batch.
#[derive(Clone, Debug)]
pub struct DistillationLossTerms<B: Backend> {
    /// `(1 - alpha) * hard + alpha * T² * soft`.
    pub total: Tensor<B, 1>,
    pub hard: Tensor<B, 1>,
    pub soft: Tensor<B, 1>,
}

impl DistillationLoss {
    /// Divides the logits by the temperature.
    pub fn scale<B: Backend>(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        logits / self.temperature
    }

    /// Supervised cross entropy of the student against the labels.
    ///
    /// # Shapes
    ///   - student_logits [batch, num_classes]
    ///   - targets [batch]
    ///   - Output [1]
    pub fn hard_loss<B: Backend>(
        &self,
        student_logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let logits = if self.scale_hard_logits {
            self.scale(student_logits)
        } else {
            student_logits
        };
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }

    /// Log-probabilities of the temperature-scaled logits, for either network.
    ///
    /// # Shapes
    ///   - logits [batch, num_classes]
    ///   - Output [batch, num_classes]
    pub fn soft_log_probs<B: Backend>(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        log_softmax(self.scale(logits), 1)
    }

    /// KL divergence from the softened student distribution to the softened teacher one.
    ///
    /// # Shapes
    ///   - student_logits [batch, num_classes]
    ///   - teacher_logits [batch, num_classes]
    ///   - Output [1]
    pub fn soft_loss<B: Backend>(
        &self,
        student_logits: Tensor<B, 2>,
        teacher_logits: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let log_q = self.soft_log_probs(student_logits);
        let log_p = self.soft_log_probs(teacher_logits);
        kl_divergence(log_q, log_p, self.kl_reduction)
    }

    /// Compute the criterion from the unscaled logits of both networks.
    ///
    /// # Shapes
    ///   - student_logits [batch, num_classes]
    ///   - teacher_logits [batch, num_classes]
    ///   - targets [batch]
    pub fn forward<B: Backend>(
        &self,
        student_logits: Tensor<B, 2>,
        teacher_logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> DistillationLossTerms<B> {
        let [batch, num_classes] = student_logits.dims();
        assert_eq!([batch, num_classes], teacher_logits.dims());
        assert_eq!([batch], targets.dims());

        let hard = self.hard_loss(student_logits.clone(), targets);
        let soft = self.soft_loss(student_logits, teacher_logits);

        let t2 = self.temperature * self.temperature;
        let total = hard.clone() * (1.0 - self.alpha) + soft.clone() * (self.alpha * t2);

        DistillationLossTerms { total, hard, soft }
    }
}

/// Pointwise `p * (log p - log q)`, reduced.
///
/// Both inputs are log-probabilities; `log_p` is the target distribution.
///
/// # Shapes
///   - log_q [batch, num_classes]
///   - log_p [batch, num_classes]
///   - Output [1]
pub fn kl_divergence<B: Backend>(
    log_q: Tensor<B, 2>,
    log_p: Tensor<B, 2>,
    reduction: KlReduction,
) -> Tensor<B, 1> {
    let [batch, _num_classes] = log_q.dims();
    let pointwise = log_p.clone().exp() * (log_p - log_q);
    match reduction {
        KlReduction::Mean => pointwise.mean(),
        KlReduction::BatchMean => pointwise.sum() / batch as f64,
        KlReduction::Sum => pointwise.sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    fn logits_batch(
        shift: f64,
    ) -> (
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 1, Int>,
    ) {
        let device = Default::default();
        let student = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([
                [2.0f32, 1.0, 0.5, -1.0, 0.0, 0.3, 0.1, -0.2, 1.5, 0.7],
                [-0.5, 0.2, 3.0, 0.0, 1.0, -2.0, 0.4, 0.9, 0.1, 0.0],
            ]),
            &device,
        ) + shift;
        let teacher = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([
                [1.5f32, 1.2, 0.8, 0.0, -0.3, 0.2, 0.6, -1.0, 2.0, 0.1],
                [0.0, -1.0, 2.5, 0.3, 0.5, -0.5, 1.1, 0.2, -0.2, 0.9],
            ]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0i64, 2]), &device);
        (student, teacher, targets)
    }

    #[test]
    fn total_combines_terms() {
        let (student, teacher, targets) = logits_batch(0.0);
        let loss = DistillationLossConfig::new().init();
        let terms = loss.forward(student, teacher, targets);

        let total = scalar(terms.total);
        let hard = scalar(terms.hard);
        let soft = scalar(terms.soft);
        for term in [total, hard, soft] {
            assert!(term.is_finite());
            assert!(term >= -1e-7, "negative term {term}");
        }
        let expected = 0.5 * hard + 0.5 * 400.0 * soft;
        assert!((total - expected).abs() <= 1e-4 * expected.abs().max(1.0));
    }

    #[test]
    fn alpha_zero_is_hard_loss() {
        let (student, teacher, targets) = logits_batch(0.0);
        let loss = DistillationLossConfig::new().with_alpha(0.0).init();
        let terms = loss.forward(student, teacher, targets);
        assert_eq!(scalar(terms.total), scalar(terms.hard));
    }

    #[test]
    fn alpha_one_is_scaled_soft_loss() {
        let (student, teacher, targets) = logits_batch(0.0);
        let loss = DistillationLossConfig::new()
            .with_alpha(1.0)
            .with_temperature(4.0)
            .init();
        let terms = loss.forward(student, teacher, targets);
        let total = scalar(terms.total);
        let soft = scalar(terms.soft);
        assert!((total - 16.0 * soft).abs() <= 1e-6 * total.abs().max(1.0));
    }

    #[test]
    fn kl_of_identical_distributions_is_zero() {
        let (student, _teacher, _targets) = logits_batch(0.0);
        let loss = DistillationLossConfig::new().init();
        let soft = scalar(loss.soft_loss(student.clone(), student));
        assert!(soft.abs() < 1e-7);
    }

    #[test]
    fn kl_is_invariant_to_logit_shift() {
        // softmax(x + c) == softmax(x)
        let (student, teacher, _targets) = logits_batch(0.0);
        let (shifted, _, _) = logits_batch(3.0);
        let loss = DistillationLossConfig::new().with_temperature(2.0).init();
        let a = scalar(loss.soft_loss(student, teacher.clone()));
        let b = scalar(loss.soft_loss(shifted, teacher));
        assert!((a - b).abs() < 1e-5);
    }

    #[test]
    fn kl_reductions_relate_by_element_count() {
        let (student, teacher, _targets) = logits_batch(0.0);
        let log_q = log_softmax(student, 1);
        let log_p = log_softmax(teacher, 1);
        let mean = scalar(kl_divergence(log_q.clone(), log_p.clone(), KlReduction::Mean));
        let batch_mean = scalar(kl_divergence(
            log_q.clone(),
            log_p.clone(),
            KlReduction::BatchMean,
        ));
        let sum = scalar(kl_divergence(log_q, log_p, KlReduction::Sum));
        assert!((sum - 20.0 * mean).abs() < 1e-5);
        assert!((sum - 2.0 * batch_mean).abs() < 1e-5);
    }

    #[test]
    fn hard_loss_uses_raw_logits_by_default() {
        let (student, _teacher, targets) = logits_batch(0.0);
        let raw = DistillationLossConfig::new().init();
        let scaled = DistillationLossConfig::new().with_scale_hard_logits(true).init();

        let device = student.device();
        let expected = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(student.clone(), targets.clone());
        assert_eq!(
            scalar(raw.hard_loss(student.clone(), targets.clone())),
            scalar(expected)
        );
        // at T=20 the scaled logits are nearly uniform: CE ~ ln(10)
        let scaled_hard = scalar(scaled.hard_loss(student, targets));
        assert!((scaled_hard - 10f64.ln()).abs() < 0.1);
    }

    /// `Σ p * (ln p - ln q) / (batch * classes)` with `p = softmax(teacher / T)`.
    fn reference_kl_mean(student: &[[f64; 3]], teacher: &[[f64; 3]], temperature: f64) -> f64 {
        let softmax = |row: &[f64; 3]| {
            let exps = row.map(|x| (x / temperature).exp());
            let total: f64 = exps.iter().sum();
            exps.map(|x| x / total)
        };
        let mut sum = 0.0;
        for (s, t) in student.iter().zip(teacher) {
            let (q, p) = (softmax(s), softmax(t));
            for k in 0..3 {
                sum += p[k] * (p[k].ln() - q[k].ln());
            }
        }
        sum / (student.len() * 3) as f64
    }

    #[test]
    fn soft_loss_matches_teacher_to_student_kl() {
        let student = [[1.0, 2.0, 3.0], [0.5, -1.0, 2.0]];
        let teacher = [[6.0, 0.0, -2.0], [0.0, 0.5, 1.0]];
        let device = Default::default();
        let tensor = |rows: [[f64; 3]; 2]| {
            Tensor::<TestBackend, 2>::from_data(
                TensorData::from(rows.map(|row| row.map(|x| x as f32))),
                &device,
            )
        };
        let loss = DistillationLossConfig::new().with_temperature(2.0).init();

        let forward = scalar(loss.soft_loss(tensor(student), tensor(teacher)));
        let expected = reference_kl_mean(&student, &teacher, 2.0);
        assert!((forward - expected).abs() < 1e-5, "{forward} != {expected}");

        // KL is asymmetric: swapping the networks gives a clearly different value
        let swapped = scalar(loss.soft_loss(tensor(teacher), tensor(student)));
        let expected_swapped = reference_kl_mean(&teacher, &student, 2.0);
        assert!((swapped - expected_swapped).abs() < 1e-5);
        assert!((forward - swapped).abs() > 0.05);
    }

    #[test]
    fn soft_probabilities_sum_to_one() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::random(
            [5, 10],
            Distribution::Normal(0.0, 10.0),
            &device,
        );
        for temperature in [1.0, 20.0] {
            let loss = DistillationLossConfig::new()
                .with_temperature(temperature)
                .init();
            let probs = loss.soft_log_probs(logits.clone()).exp();
            let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
            for sum in sums {
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn temperature_scales_logits_proportionally() {
        let (student, _teacher, _targets) = logits_batch(0.0);
        let loss = DistillationLossConfig::new().with_temperature(20.0).init();
        let max_raw = scalar(student.clone().abs().max());
        let max_scaled = scalar(loss.scale(student).abs().max());
        assert!((max_scaled - max_raw / 20.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        assert!(DistillationLossConfig::new().with_temperature(0.0).try_init().is_err());
        assert!(DistillationLossConfig::new().with_temperature(-1.0).try_init().is_err());
        assert!(DistillationLossConfig::new().with_alpha(1.5).try_init().is_err());
        assert!(DistillationLossConfig::new().with_alpha(-0.1).try_init().is_err());
        assert!(DistillationLossConfig::new().try_init().is_ok());
    }

    #[test]
    #[should_panic]
    fn init_panics_on_invalid_alpha() {
        DistillationLossConfig::new().with_alpha(2.0).init();
    }
}
