// MNIST dataset: IDX file format parser.
//
// The database is four files:
//   train-images-idx3-ubyte  (60,000 28x28 images)
//   train-labels-idx1-ubyte  (60,000 labels 0-9)
//   t10k-images-idx3-ubyte   (10,000 28x28 images)
//   t10k-labels-idx1-ubyte   (10,000 labels 0-9)
//
// IDX layout (big-endian):
//   images: magic(2051) | count(u32) | rows(u32) | cols(u32) | pixels(u8..)
//   labels: magic(2049) | count(u32) | labels(u8..)
//
// Files may be gzip-compressed (.gz); those are inflated on load.

use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::dataset::{Dataset, Sample};

/// Error type for MNIST loading.
#[derive(Debug)]
pub enum MnistError {
    Io(io::Error),
    InvalidMagic { expected: u32, got: u32 },
    CountMismatch { images: usize, labels: usize },
    MissingFile(PathBuf),
}

impl std::fmt::Display for MnistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MnistError::Io(e) => write!(f, "MNIST I/O error: {e}"),
            MnistError::InvalidMagic { expected, got } => write!(
                f,
                "MNIST invalid magic: expected {expected:#06x}, got {got:#06x}"
            ),
            MnistError::CountMismatch { images, labels } => write!(
                f,
                "MNIST count mismatch: {images} images vs {labels} labels"
            ),
            MnistError::MissingFile(p) => write!(f, "MNIST file not found: {}", p.display()),
        }
    }
}

impl std::error::Error for MnistError {}

impl From<io::Error> for MnistError {
    fn from(e: io::Error) -> Self {
        MnistError::Io(e)
    }
}

/// Which split of MNIST to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnistSplit {
    Train,
    Test,
}

/// A loaded MNIST dataset held entirely in memory.
///
/// Images are raw `Vec<u8>` pixel buffers; labels are `u8` digits 0-9.
#[derive(Debug)]
pub struct MnistDataset {
    images: Vec<Vec<u8>>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
    split: MnistSplit,
}

impl MnistDataset {
    /// Load MNIST from a directory holding the standard filenames, plain
    /// or `.gz` compressed.
    pub fn load(dir: impl AsRef<Path>, split: MnistSplit) -> Result<Self, MnistError> {
        let dir = dir.as_ref();

        let (img_name, lbl_name) = match split {
            MnistSplit::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            MnistSplit::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        };

        let img_bytes = read_maybe_gz(dir, img_name)?;
        let lbl_bytes = read_maybe_gz(dir, lbl_name)?;

        Self::from_raw(&img_bytes, &lbl_bytes, split)
    }

    /// Build from raw IDX bytes (embedded data, tests).
    pub fn from_raw(
        image_bytes: &[u8],
        label_bytes: &[u8],
        split: MnistSplit,
    ) -> Result<Self, MnistError> {
        let (images, rows, cols) = parse_idx3_images(image_bytes)?;
        let labels = parse_idx1_labels(label_bytes)?;

        if images.len() != labels.len() {
            return Err(MnistError::CountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }

        Ok(Self {
            images,
            labels,
            rows,
            cols,
            split,
        })
    }

    /// A small random MNIST-shaped dataset for tests and demos without
    /// the real files.
    pub fn synthetic(n: usize, split: MnistSplit) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let rows = 28;
        let cols = 28;
        let mut images = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);

        for _ in 0..n {
            let mut img = vec![0u8; rows * cols];
            for px in &mut img {
                *px = rng.gen();
            }
            images.push(img);
            labels.push(rng.gen_range(0..10u8));
        }

        Self {
            images,
            labels,
            rows,
            cols,
            split,
        }
    }

    /// Total number of samples.
    pub fn num_samples(&self) -> usize {
        self.images.len()
    }

    /// Image dimensions: (rows, cols).
    pub fn image_dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Raw pixel bytes for sample `i`.
    pub fn image_u8(&self, i: usize) -> &[u8] {
        &self.images[i]
    }

    /// Label for sample `i`.
    pub fn label(&self, i: usize) -> u8 {
        self.labels[i]
    }

    /// Which split this dataset holds.
    pub fn split(&self) -> MnistSplit {
        self.split
    }

    /// Keep only the first `n` samples.
    pub fn take(mut self, n: usize) -> Self {
        let n = n.min(self.images.len());
        self.images.truncate(n);
        self.labels.truncate(n);
        self
    }
}

impl Dataset for MnistDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Sample {
        let pixels = &self.images[index];
        let label = self.labels[index];

        Sample {
            features: pixels.iter().map(|&p| p as f64).collect(),
            feature_shape: vec![self.rows * self.cols],
            target: vec![label as f64],
            target_shape: vec![1],
        }
    }

    fn name(&self) -> &str {
        match self.split {
            MnistSplit::Train => "MNIST-train",
            MnistSplit::Test => "MNIST-test",
        }
    }
}

// IDX parsing

/// Read a file, trying the plain name first, then `.gz`.
fn read_maybe_gz(dir: &Path, base_name: &str) -> Result<Vec<u8>, MnistError> {
    let plain = dir.join(base_name);
    let gz = dir.join(format!("{base_name}.gz"));

    if plain.exists() {
        Ok(fs::read(&plain)?)
    } else if gz.exists() {
        let compressed = fs::read(&gz)?;
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Err(MnistError::MissingFile(plain))
    }
}

fn io_err(msg: &str) -> MnistError {
    MnistError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Parse an IDX3 image file: magic=2051, count, rows, cols, pixel data.
fn parse_idx3_images(data: &[u8]) -> Result<(Vec<Vec<u8>>, usize, usize), MnistError> {
    if data.len() < 16 {
        return Err(io_err("IDX3 file too short"));
    }

    let magic = read_u32_be(data, 0);
    if magic != 2051 {
        return Err(MnistError::InvalidMagic {
            expected: 2051,
            got: magic,
        });
    }

    let count = read_u32_be(data, 4) as usize;
    let rows = read_u32_be(data, 8) as usize;
    let cols = read_u32_be(data, 12) as usize;
    let pixels_per_image = rows * cols;

    let expected_len = 16 + count * pixels_per_image;
    if data.len() < expected_len {
        return Err(io_err(&format!(
            "IDX3 truncated: expected {expected_len} bytes, got {}",
            data.len()
        )));
    }

    let mut images = Vec::with_capacity(count);
    for i in 0..count {
        let start = 16 + i * pixels_per_image;
        let end = start + pixels_per_image;
        images.push(data[start..end].to_vec());
    }

    Ok((images, rows, cols))
}

/// Parse an IDX1 label file: magic=2049, count, label data.
fn parse_idx1_labels(data: &[u8]) -> Result<Vec<u8>, MnistError> {
    if data.len() < 8 {
        return Err(io_err("IDX1 file too short"));
    }

    let magic = read_u32_be(data, 0);
    if magic != 2049 {
        return Err(MnistError::InvalidMagic {
            expected: 2049,
            got: magic,
        });
    }

    let count = read_u32_be(data, 4) as usize;
    let expected_len = 8 + count;
    if data.len() < expected_len {
        return Err(io_err(&format!(
            "IDX1 truncated: expected {expected_len} bytes, got {}",
            data.len()
        )));
    }

    Ok(data[8..8 + count].to_vec())
}

fn read_u32_be(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

// Builders (tests and embedded fixtures)

/// Assemble IDX3 image bytes from raw images.
pub fn build_idx3_bytes(images: &[&[u8]], rows: u32, cols: u32) -> Vec<u8> {
    let count = images.len() as u32;
    let mut buf = Vec::new();
    buf.extend_from_slice(&2051u32.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    buf.extend_from_slice(&rows.to_be_bytes());
    buf.extend_from_slice(&cols.to_be_bytes());
    for img in images {
        buf.extend_from_slice(img);
    }
    buf
}

/// Assemble IDX1 label bytes.
pub fn build_idx1_bytes(labels: &[u8]) -> Vec<u8> {
    let count = labels.len() as u32;
    let mut buf = Vec::new();
    buf.extend_from_slice(&2049u32.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    buf.extend_from_slice(labels);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idx3_roundtrip() {
        let img1 = vec![0u8; 4]; // 2x2 image
        let img2 = vec![255u8; 4];
        let bytes = build_idx3_bytes(&[&img1, &img2], 2, 2);
        let (images, rows, cols) = parse_idx3_images(&bytes).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(rows, 2);
        assert_eq!(cols, 2);
        assert_eq!(images[0], vec![0, 0, 0, 0]);
        assert_eq!(images[1], vec![255, 255, 255, 255]);
    }

    #[test]
    fn test_parse_idx1_roundtrip() {
        let labels_in = vec![0, 1, 2, 9, 5];
        let bytes = build_idx1_bytes(&labels_in);
        let labels = parse_idx1_labels(&bytes).unwrap();
        assert_eq!(labels, labels_in);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = build_idx3_bytes(&[&[0u8; 4]], 2, 2);
        bytes[3] = 99;
        assert!(matches!(
            parse_idx3_images(&bytes).unwrap_err(),
            MnistError::InvalidMagic { .. }
        ));

        let mut bytes = build_idx1_bytes(&[0, 1]);
        bytes[3] = 99;
        assert!(matches!(
            parse_idx1_labels(&bytes).unwrap_err(),
            MnistError::InvalidMagic { .. }
        ));
    }

    #[test]
    fn test_count_mismatch() {
        let img_bytes = build_idx3_bytes(&[&[0u8; 4]], 2, 2); // 1 image
        let lbl_bytes = build_idx1_bytes(&[0, 1]); // 2 labels
        let err = MnistDataset::from_raw(&img_bytes, &lbl_bytes, MnistSplit::Train).unwrap_err();
        assert!(matches!(err, MnistError::CountMismatch { .. }));
    }

    #[test]
    fn test_dataset_trait() {
        let img_bytes = build_idx3_bytes(&[&[100u8; 4], &[200u8; 4]], 2, 2);
        let lbl_bytes = build_idx1_bytes(&[5, 8]);
        let ds = MnistDataset::from_raw(&img_bytes, &lbl_bytes, MnistSplit::Test).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.name(), "MNIST-test");

        let s0 = ds.get(0);
        assert_eq!(s0.features, vec![100.0, 100.0, 100.0, 100.0]);
        assert_eq!(s0.feature_shape, vec![4]);
        assert_eq!(s0.target, vec![5.0]);
        assert_eq!(s0.target_shape, vec![1]);
    }

    #[test]
    fn test_gz_roundtrip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let img_bytes = build_idx3_bytes(&[&[42u8; 4]], 2, 2);
        let lbl_bytes = build_idx1_bytes(&[7]);

        let dir = std::env::temp_dir().join("marmot-mnist-gz-test");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, bytes) in [
            ("train-images-idx3-ubyte", &img_bytes),
            ("train-labels-idx1-ubyte", &lbl_bytes),
        ] {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(bytes).unwrap();
            std::fs::write(dir.join(format!("{name}.gz")), enc.finish().unwrap()).unwrap();
        }

        let ds = MnistDataset::load(&dir, MnistSplit::Train).unwrap();
        assert_eq!(ds.num_samples(), 1);
        assert_eq!(ds.label(0), 7);
        assert_eq!(ds.image_u8(0), &[42; 4]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_synthetic_and_take() {
        let ds = MnistDataset::synthetic(100, MnistSplit::Train);
        assert_eq!(ds.num_samples(), 100);
        assert_eq!(ds.image_dims(), (28, 28));
        for i in 0..100 {
            assert!(ds.label(i) < 10);
        }
        let ds = ds.take(10);
        assert_eq!(ds.num_samples(), 10);
    }
}
