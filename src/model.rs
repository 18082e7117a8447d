//! Two-layer fully-connected digit classifiers used as teacher and student.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use std::path::Path;

use crate::dataset::{HEIGHT, WIDTH};

/// Recorder used for teacher weights.
pub type RecorderTy = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Flattened image size.
    #[config(default = 784)]
    pub input_size: usize,

    #[config(default = 256)]
    pub hidden_size: usize,

    #[config(default = 10)]
    pub num_classes: usize,
}

/// `flatten -> fc1 -> relu -> fc2`.
///
/// No normalization, dropout or regularization.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    /// Input channel: input_size.
    /// Output channel: hidden_size.
    pub fc1: Linear<B>,
    pub activation: Relu,
    /// Input channel: hidden_size.
    /// Output channel: num_classes.
    pub fc2: Linear<B>,
}

/// The network whose softened outputs are imitated.
pub type TeacherNet<B> = Classifier<B>;
/// The network being trained.
pub type StudentNet<B> = Classifier<B>;

impl ClassifierConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        Classifier {
            fc1: LinearConfig::new(self.input_size, self.hidden_size)
                .with_bias(true)
                .init(device),
            activation: Relu::new(),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes)
                .with_bias(true)
                .init(device),
        }
    }
}

impl<B: Backend> Classifier<B> {
    /// # Shapes
    ///   - Input [batch, 1, HEIGHT, WIDTH]
    ///   - Output [batch, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, height, width] = images.dims();
        debug_assert_eq!([channels, height, width], [1, HEIGHT, WIDTH]);

        let x = images.flatten::<2>(1, 3);
        debug_assert_eq!([batch, channels * height * width], x.dims());

        self.forward_flat(x)
    }

    /// See also [`Self::forward`].
    ///
    /// # Shapes
    ///   - Input [batch, input_size]
    ///   - Output [batch, num_classes]
    pub fn forward_flat(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _input_size] = x.dims();
        let [_hidden_size, num_classes] = self.fc2.weight.dims();

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.fc2.forward(x);
        debug_assert_eq!([batch, num_classes], x.dims());

        x
    }
}

/// Loads teacher weights previously recorded with [`RecorderTy`].
///
/// The file extension is added automatically.
pub fn load_teacher<B: Backend>(
    path: &Path,
    model_config: &ClassifierConfig,
    device: &B::Device,
) -> crate::error::Result<TeacherNet<B>> {
    println!("Loading teacher from {path:?}");
    let teacher = model_config
        .init::<B>(device)
        .load_file(path.to_path_buf(), &RecorderTy::new(), device)?;
    Ok(teacher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn output_shape_is_batch_by_classes() {
        let device = Default::default();
        let model = ClassifierConfig::new().init::<TestBackend>(&device);

        for batch in [1, 2, 7] {
            let images = Tensor::<TestBackend, 4>::random(
                [batch, 1, HEIGHT, WIDTH],
                Distribution::Uniform(0.0, 1.0),
                &device,
            );
            assert_eq!([batch, 10], model.forward(images).dims());
        }
    }

    #[test]
    fn default_architecture() {
        let device = Default::default();
        let model = ClassifierConfig::new().init::<TestBackend>(&device);
        assert_eq!([784, 256], model.fc1.weight.dims());
        assert_eq!([256, 10], model.fc2.weight.dims());
        // 784 * 256 + 256 + 256 * 10 + 10
        assert_eq!(203_530, model.num_params());
    }

    #[test]
    fn teacher_and_student_are_initialized_independently() {
        let device = Default::default();
        let config = ClassifierConfig::new();
        let teacher: TeacherNet<TestBackend> = config.init(&device);
        let student: StudentNet<TestBackend> = config.init(&device);

        let diff = (teacher.fc1.weight.val() - student.fc1.weight.val())
            .abs()
            .sum()
            .into_scalar()
            .elem::<f64>();
        assert!(diff > 0.0);
    }

    #[test]
    fn load_teacher_round_trips_weights() {
        let device = Default::default();
        let config = ClassifierConfig::new().with_hidden_size(8);
        let teacher: TeacherNet<TestBackend> = config.init(&device);

        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("teacher");
        teacher
            .clone()
            .save_file(path.clone(), &RecorderTy::new())
            .unwrap();

        let loaded = load_teacher::<TestBackend>(&path, &config, &device).unwrap();
        loaded
            .fc2
            .weight
            .val()
            .into_data()
            .assert_eq(&teacher.fc2.weight.val().into_data(), true);
    }
}
