use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{Array2, Array3};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::error::{Result, WorkerErr};

/// The labeled set size that small datasets are repeated up to.
pub const UPSAMPLED_LEN: usize = 3000;

/// A pair of co-registered images and the change mask between them.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: String,
    /// `(C, H, W)`.
    pub image_a: Array3<f32>,
    /// `(C, H, W)`.
    pub image_b: Array3<f32>,
    /// `(H, W)`, one class per pixel or the ignore label.
    pub mask: Array2<u8>,
}

fn data_err(path: &Path, detail: impl std::fmt::Display) -> WorkerErr {
    WorkerErr::Data {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn tensor<'a>(tensors: &'a SafeTensors<'a>, name: &str, dtype: Dtype, rank: usize) -> std::result::Result<TensorView<'a>, String> {
    let view = tensors
        .tensor(name)
        .map_err(|e| format!("missing tensor {name}: {e}"))?;

    if view.dtype() != dtype || view.shape().len() != rank {
        return Err(format!(
            "tensor {name} is {:?}{:?}, expected a {rank}-D {dtype:?}",
            view.dtype(),
            view.shape()
        ));
    }

    Ok(view)
}

fn image(tensors: &SafeTensors<'_>, name: &str) -> std::result::Result<Array3<f32>, String> {
    let view = tensor(tensors, name, Dtype::F32, 3)?;
    let shape = view.shape();
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());

    Array3::from_shape_vec((shape[0], shape[1], shape[2]), values).map_err(|e| e.to_string())
}

impl Sample {
    /// Creates a new `Sample`.
    ///
    /// # Errors
    /// Returns an error if the images differ in shape or the mask doesn't cover them.
    pub fn new(id: impl Into<String>, image_a: Array3<f32>, image_b: Array3<f32>, mask: Array2<u8>) -> Result<Self> {
        let id = id.into();
        let (_, h, w) = image_a.dim();

        if image_a.dim() != image_b.dim() || mask.dim() != (h, w) {
            return Err(data_err(
                Path::new(&id),
                format!(
                    "images {:?} and {:?} with mask {:?} don't line up",
                    image_a.shape(),
                    image_b.shape(),
                    mask.shape()
                ),
            ));
        }

        Ok(Self {
            id,
            image_a,
            image_b,
            mask,
        })
    }

    /// Returns `(C, H, W)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.image_a.dim()
    }

    /// Reads the sample stored at `path`.
    pub fn load(id: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| data_err(path, e))?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| data_err(path, e))?;

        let image_a = image(&tensors, "image_a").map_err(|e| data_err(path, e))?;
        let image_b = image(&tensors, "image_b").map_err(|e| data_err(path, e))?;

        let view = tensor(&tensors, "mask", Dtype::U8, 2).map_err(|e| data_err(path, e))?;
        let shape = view.shape();
        let mask = Array2::from_shape_vec((shape[0], shape[1]), view.data().to_vec())
            .map_err(|e| data_err(path, e))?;

        Self::new(id, image_a, image_b, mask)
    }

    /// Writes the sample to `path` in the format `load` reads.
    pub fn save(&self, path: &Path) -> Result<()> {
        let image_a: Vec<f32> = self.image_a.iter().copied().collect();
        let image_b: Vec<f32> = self.image_b.iter().copied().collect();
        let mask: Vec<u8> = self.mask.iter().copied().collect();

        let views = [
            ("image_a", Dtype::F32, self.image_a.shape(), bytemuck::cast_slice::<f32, u8>(&image_a)),
            ("image_b", Dtype::F32, self.image_b.shape(), bytemuck::cast_slice::<f32, u8>(&image_b)),
            ("mask", Dtype::U8, self.mask.shape(), mask.as_slice()),
        ]
        .into_iter()
        .map(|(name, dtype, shape, data)| TensorView::new(dtype, shape.to_vec(), data).map(|view| (name, view)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| data_err(path, e))?;

        let bytes = safetensors::serialize(views, &None).map_err(|e| data_err(path, e))?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// A random access collection of samples.
pub trait ChangeDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, idx: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dataset held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl ChangeDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        self.samples.get(idx).cloned().ok_or_else(|| {
            data_err(
                Path::new("memory"),
                format!("index {idx} out of {} samples", self.samples.len()),
            )
        })
    }
}

/// A dataset read lazily from `<root>/<id>.safetensors` files.
#[derive(Debug, Clone)]
pub struct FileDataset {
    root: PathBuf,
    ids: Vec<String>,
}

impl FileDataset {
    pub fn new(root: impl Into<PathBuf>, ids: Vec<String>) -> Self {
        Self {
            root: root.into(),
            ids,
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn sample_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.safetensors"))
    }
}

impl ChangeDataset for FileDataset {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        let id = self.ids.get(idx).ok_or_else(|| {
            data_err(&self.root, format!("index {idx} out of {} ids", self.ids.len()))
        })?;

        Sample::load(id.as_str(), &self.sample_path(id))
    }
}

/// Reads a list of sample ids, one per line.
pub fn read_ids(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| data_err(path, e))?;

    let ids: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if ids.is_empty() {
        return Err(data_err(path, "no sample ids"));
    }

    Ok(ids)
}

/// Repeats the labeled ids of the small datasets until there are `UPSAMPLED_LEN` of them.
pub fn upsample_ids(mut ids: Vec<String>, dataset: &str) -> Vec<String> {
    if !matches!(dataset, "whu" | "levir") || ids.is_empty() {
        return ids;
    }

    ids = ids.iter().cycle().take(UPSAMPLED_LEN).cloned().collect();
    ids
}
