use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use burn_dataset::network::downloader::download_file_as_bytes;
use burn_dataset::{
    Dataset, InMemDataset,
    transform::{Mapper, MapperDataset},
};
use flate2::read::GzDecoder;
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// CVDF mirror of http://yann.lecun.com/exdb/mnist/
const URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;
pub const NUM_CLASSES: usize = 10;

/// Default cache directory for the downloaded files, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// 60,000 images.
    Train,
    /// 10,000 images.
    Test,
}

impl Split {
    fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }

    fn images_file(&self) -> &'static str {
        match self {
            Split::Train => TRAIN_IMAGES,
            Split::Test => TEST_IMAGES,
        }
    }

    fn labels_file(&self) -> &'static str {
        match self {
            Split::Train => TRAIN_LABELS,
            Split::Test => TEST_LABELS,
        }
    }
}

/// MNIST item.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MnistItem {
    /// Image as a flat array of floats.
    /// Each value is a brightness, in between 0.0 and 1.0.
    ///
    /// # Shape
    /// [HEIGHT * WIDTH]
    pub image: Vec<f32>,

    /// Label of the image.
    /// Each value is in between 0 and 9.
    pub label: u8,
}

#[derive(Debug, Clone)]
struct MnistItemRaw {
    pub image_bytes: Vec<u8>,
    pub label: u8,
}

struct BytesToImage;

impl Mapper<MnistItemRaw, MnistItem> for BytesToImage {
    /// Convert the image bytes into brightness values in `[0, 1]`.
    fn map(&self, item: &MnistItemRaw) -> MnistItem {
        debug_assert_eq!(item.image_bytes.len(), WIDTH * HEIGHT);

        let image: Vec<f32> = item
            .image_bytes
            .iter()
            .map(|brightness| {
                let value: f32 = (*brightness).as_();
                value / 255.
            })
            .collect();

        MnistItem {
            image,
            label: item.label,
        }
    }
}

type MappedDataset = MapperDataset<InMemDataset<MnistItemRaw>, BytesToImage, MnistItemRaw>;

/// The MNIST dataset consists of 70,000 28x28 black-and-white images in 10 classes (one for each digits), with 7,000
/// images per class. There are 60,000 training images and 10,000 test images.
///
/// The data is downloaded from the [CVDF mirror](https://github.com/cvdfoundation/mnist)
/// into `<cache_dir>/mnist/{train,test}` and reused on later runs.
pub struct MnistDataset {
    dataset: MappedDataset,
}

impl Dataset<MnistItem> for MnistDataset {
    fn get(&self, index: usize) -> Option<MnistItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl MnistDataset {
    /// Creates a new train dataset, downloading it if missing.
    pub fn train(cache_dir: &Path) -> Result<Self> {
        Self::new(cache_dir, Split::Train)
    }

    /// Creates a new test dataset, downloading it if missing.
    pub fn test(cache_dir: &Path) -> Result<Self> {
        Self::new(cache_dir, Split::Test)
    }

    pub fn new(cache_dir: &Path, split: Split) -> Result<Self> {
        let split_dir = Self::download(cache_dir, split)?;
        Self::from_dir(&split_dir, split)
    }

    /// Reads the already decompressed IDX files of a split.
    pub fn from_dir(split_dir: &Path, split: Split) -> Result<Self> {
        // MNIST is tiny so we can load it in-memory
        // Train images (u8): 28 * 28 * 60000 = 47.04Mb
        // Test images (u8): 28 * 28 * 10000 = 7.84Mb
        let images = read_images(&split_dir.join(split.images_file()))?;
        let labels = read_labels(&split_dir.join(split.labels_file()))?;
        if images.len() != labels.len() {
            return Err(Error::InvalidIdx {
                path: split_dir.to_path_buf(),
                reason: format!("{} images but {} labels", images.len(), labels.len()),
            });
        }
        Ok(Self::from_raw(images, labels))
    }

    /// Builds a dataset from in-memory images (`HEIGHT * WIDTH` bytes each) and labels.
    pub fn from_raw(images: Vec<Vec<u8>>, labels: Vec<u8>) -> Self {
        assert_eq!(images.len(), labels.len());
        let items: Vec<_> = images
            .into_iter()
            .zip(labels)
            .map(|(image_bytes, label)| MnistItemRaw { image_bytes, label })
            .collect();

        let dataset = InMemDataset::new(items);
        let dataset = MapperDataset::new(dataset, BytesToImage);

        Self { dataset }
    }

    /// Download the split files, unless they are already cached.
    fn download(cache_dir: &Path, split: Split) -> Result<PathBuf> {
        let split_dir = cache_dir.join("mnist").join(split.dir_name());
        create_dir_all(&split_dir)?;

        Self::download_file(split.images_file(), &split_dir)?;
        Self::download_file(split.labels_file(), &split_dir)?;

        Ok(split_dir)
    }

    /// Download a file from the MNIST dataset URL to the destination directory.
    /// File download progress is reported by burn-dataset's downloader, which panics if the download fails.
    fn download_file(name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let file_name = dest_dir.join(name);

        if !file_name.exists() {
            let bytes = download_file_as_bytes(&format!("{URL}{name}.gz"), name);

            // decompress next to the destination, then move into place
            let partial = file_name.with_extension("part");
            let mut output_file = File::create(&partial)?;
            let mut gz_buffer = GzDecoder::new(&bytes[..]);
            std::io::copy(&mut gz_buffer, &mut output_file)?;
            std::fs::rename(&partial, &file_name)?;
        }

        Ok(file_name)
    }
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

fn invalid(path: &Path, reason: impl Into<String>) -> Error {
    Error::InvalidIdx {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Reads an IDX3 image file. Each image is a vector of `HEIGHT * WIDTH` bytes.
///
/// Header: magic, count, rows, cols (big-endian u32), followed by the pixels.
pub fn read_images(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 16 {
        return Err(invalid(path, "truncated header"));
    }
    let magic = be_u32(&bytes, 0);
    if magic != IMAGES_MAGIC {
        return Err(invalid(path, format!("bad magic number {magic}")));
    }
    let size = be_u32(&bytes, 4) as usize;
    let rows = be_u32(&bytes, 8) as usize;
    let cols = be_u32(&bytes, 12) as usize;
    if [rows, cols] != [HEIGHT, WIDTH] {
        return Err(invalid(path, format!("unexpected image size {rows}x{cols}")));
    }
    let pixels = &bytes[16..];
    if pixels.len() != size * HEIGHT * WIDTH {
        return Err(invalid(
            path,
            format!("expected {size} images, found {} bytes", pixels.len()),
        ));
    }

    Ok(pixels
        .chunks(WIDTH * HEIGHT)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Reads an IDX1 label file.
///
/// Header: magic, count (big-endian u32), followed by the labels.
pub fn read_labels(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 8 {
        return Err(invalid(path, "truncated header"));
    }
    let magic = be_u32(&bytes, 0);
    if magic != LABELS_MAGIC {
        return Err(invalid(path, format!("bad magic number {magic}")));
    }
    let size = be_u32(&bytes, 4) as usize;
    let labels = &bytes[8..];
    if labels.len() != size {
        return Err(invalid(
            path,
            format!("expected {size} labels, found {}", labels.len()),
        ));
    }
    if let Some(label) = labels.iter().find(|label| **label as usize >= NUM_CLASSES) {
        return Err(invalid(path, format!("label {label} out of range")));
    }

    Ok(labels.to_vec())
}

#[derive(Clone, Default)]
pub struct MnistBatcher {}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    /// The input feature is the brightness, in between 0.0 and 1.0.
    ///
    /// # Shape
    /// [batch_size, 1, HEIGHT, WIDTH]
    pub images: Tensor<B, 4>,
    /// # Shape
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let batch_size = items.len();
        let mut pixels = Vec::with_capacity(batch_size * HEIGHT * WIDTH);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            debug_assert_eq!(item.image.len(), HEIGHT * WIDTH);
            pixels.extend(item.image);
            labels.push(item.label as i64);
        }

        let images = TensorData::new(pixels, [batch_size, 1, HEIGHT, WIDTH])
            .convert::<B::FloatElem>();
        let images = Tensor::<B, 4>::from_data(images, device);

        let targets = TensorData::new(labels, [batch_size]).convert::<B::IntElem>();
        let targets = Tensor::<B, 1, Int>::from_data(targets, device);

        MnistBatch { images, targets }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use std::io::Write;

    type TestBackend = NdArray<f32>;

    /// Images whose pixels all equal `label * 25`.
    pub(crate) fn synthetic(n: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
        let labels: Vec<u8> = (0..n).map(|i| (i % NUM_CLASSES) as u8).collect();
        let images = labels
            .iter()
            .map(|label| vec![label * 25; HEIGHT * WIDTH])
            .collect();
        (images, labels)
    }

    fn write_idx(dir: &Path, split: Split, images: &[Vec<u8>], labels: &[u8], magic: u32) {
        let mut f = File::create(dir.join(split.images_file())).unwrap();
        for word in [magic, images.len() as u32, HEIGHT as u32, WIDTH as u32] {
            f.write_all(&word.to_be_bytes()).unwrap();
        }
        for image in images {
            f.write_all(image).unwrap();
        }

        let mut f = File::create(dir.join(split.labels_file())).unwrap();
        for word in [LABELS_MAGIC, labels.len() as u32] {
            f.write_all(&word.to_be_bytes()).unwrap();
        }
        f.write_all(labels).unwrap();
    }

    #[test]
    fn reads_idx_files() {
        let dir = temp_dir::TempDir::new().unwrap();
        let (images, labels) = synthetic(12);
        write_idx(dir.path(), Split::Test, &images, &labels, IMAGES_MAGIC);

        let dataset = MnistDataset::from_dir(dir.path(), Split::Test).unwrap();
        assert_eq!(12, dataset.len());

        let item = dataset.get(3).unwrap();
        assert_eq!(3, item.label);
        assert_eq!(HEIGHT * WIDTH, item.image.len());
        assert!((item.image[0] - 75. / 255.).abs() < 1e-6);
        assert!(dataset.get(12).is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = temp_dir::TempDir::new().unwrap();
        let (images, labels) = synthetic(2);
        write_idx(dir.path(), Split::Train, &images, &labels, LABELS_MAGIC);

        let err = MnistDataset::from_dir(dir.path(), Split::Train)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidIdx { .. }));
    }

    #[test]
    fn rejects_truncated_images() {
        let dir = temp_dir::TempDir::new().unwrap();
        let (mut images, labels) = synthetic(2);
        images[1].truncate(10);
        write_idx(dir.path(), Split::Train, &images, &labels, IMAGES_MAGIC);

        assert!(read_images(&dir.path().join(TRAIN_IMAGES)).is_err());
    }

    #[test]
    fn missing_files_are_io_errors() {
        let dir = temp_dir::TempDir::new().unwrap();
        let err = MnistDataset::from_dir(dir.path(), Split::Test).err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn batcher_shapes_and_range() {
        let (images, labels) = synthetic(5);
        let dataset = MnistDataset::from_raw(images, labels);
        let items: Vec<_> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();

        let device = Default::default();
        let batch: MnistBatch<TestBackend> = MnistBatcher::default().batch(items, &device);
        assert_eq!([5, 1, HEIGHT, WIDTH], batch.images.dims());
        assert_eq!([5], batch.targets.dims());

        let max = batch.images.clone().max().into_scalar().elem::<f32>();
        let min = batch.images.min().into_scalar().elem::<f32>();
        assert!(min >= 0.0 && max <= 1.0);
        assert_eq!(
            vec![0i64, 1, 2, 3, 4],
            batch.targets.into_data().to_vec::<i64>().unwrap()
        );
    }
}
