//! Compile-time backend selection. The default `dev-ndarray` feature runs on the CPU.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

pub type Element = f32;

#[cfg(feature = "dev-ndarray")]
pub type MainBackend = burn::backend::NdArray<Element, i32>;
#[cfg(all(feature = "dev-tch-cpu", not(feature = "dev-ndarray")))]
pub type MainBackend = burn::backend::libtorch::LibTorch<Element, i32>;
#[cfg(all(
    feature = "dev-wgpu",
    not(any(feature = "dev-ndarray", feature = "dev-tch-cpu"))
))]
pub type MainBackend = burn::backend::wgpu::Wgpu<Element, i32>;

pub trait MainDevice: Backend {
    fn main_device() -> <Self as Backend>::Device {
        Default::default()
    }
}

#[cfg(feature = "_dev-has-backend")]
impl MainDevice for MainBackend {}

pub type MainAutoBackend = burn::backend::Autodiff<MainBackend>;
impl MainDevice for MainAutoBackend {
    fn main_device() -> <Self as Backend>::Device {
        <<Self as AutodiffBackend>::InnerBackend as MainDevice>::main_device()
    }
}

#[cfg(not(feature = "_dev-has-backend"))]
std::compile_error!("No dev backend selected. Enable one of the `dev-*` features of burn-distill.");
