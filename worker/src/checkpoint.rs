//! Crash safe persistence of the training state.
//!
//! A checkpoint is a single safetensors file: every parameter group and optimizer moment
//! is a tensor, every scalar a metadata entry. Files are written next to their target
//! and renamed over it once synced, so a reader only ever sees complete checkpoints.

use std::{
    collections::HashMap,
    fmt::Display,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::info;
use machine_learning::optimization::{GroupState, OptimizerState};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{
    error::{Result, WorkerErr},
    state::TrainingState,
};

/// File name of the checkpoint written after every epoch.
pub const LATEST: &str = "latest.safetensors";

/// File name of the checkpoint of the best epoch so far.
pub const BEST: &str = "best.safetensors";

const FORMAT_VERSION: &str = "1";

type Decoded<T> = std::result::Result<T, String>;

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn checkpoint_err(path: &Path, detail: impl Display) -> WorkerErr {
    WorkerErr::Checkpoint {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn encode(state: &TrainingState) -> Decoded<Vec<u8>> {
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT_VERSION.to_string());
    metadata.insert("epoch".to_string(), state.epoch.to_string());
    metadata.insert("best_iou".to_string(), state.best_iou.to_string());
    metadata.insert("best_acc".to_string(), state.best_acc.to_string());

    let mut tensors: Vec<(String, &[f32])> = Vec::new();

    let model_groups: Vec<&str> = state.model.iter().map(|(name, _)| name.as_str()).collect();
    metadata.insert("model.groups".to_string(), model_groups.join(","));
    for (name, params) in &state.model {
        tensors.push((format!("model.{name}"), params.as_slice()));
    }

    let optim_groups: Vec<&str> = state.optimizer.keys().map(String::as_str).collect();
    metadata.insert("optim.groups".to_string(), optim_groups.join(","));
    for (name, group) in &state.optimizer {
        metadata.insert(format!("optim.{name}.lr"), group.lr.to_string());
        metadata.insert(format!("optim.{name}.step"), group.step.to_string());
        tensors.push((format!("optim.{name}.exp_avg"), group.exp_avg.as_slice()));
        tensors.push((format!("optim.{name}.exp_avg_sq"), group.exp_avg_sq.as_slice()));
    }

    let views = tensors
        .iter()
        .map(|(name, values)| {
            let bytes = bytemuck::cast_slice::<f32, u8>(values);
            TensorView::new(Dtype::F32, vec![values.len()], bytes).map(|view| (name.as_str(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    safetensors::serialize(views, &Some(metadata)).map_err(|e| e.to_string())
}

fn parse<T>(metadata: &HashMap<String, String>, key: &str) -> Decoded<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = metadata
        .get(key)
        .ok_or_else(|| format!("missing metadata entry {key}"))?;

    value
        .parse()
        .map_err(|e| format!("metadata entry {key}={value} is invalid: {e}"))
}

fn groups<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Decoded<Vec<&'a str>> {
    let value = metadata
        .get(key)
        .ok_or_else(|| format!("missing metadata entry {key}"))?;

    Ok(value.split(',').filter(|name| !name.is_empty()).collect())
}

/// Reads a 1-D `f32` tensor.
pub(crate) fn read_f32(tensors: &SafeTensors<'_>, name: &str) -> Decoded<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .map_err(|e| format!("missing tensor {name}: {e}"))?;

    if view.dtype() != Dtype::F32 {
        return Err(format!("tensor {name} is {:?}, expected F32", view.dtype()));
    }

    let data = view.data();
    if data.len() % size_of::<f32>() != 0 {
        return Err(format!("tensor {name} has a truncated payload"));
    }

    Ok(bytemuck::pod_collect_to_vec(data))
}

fn decode(bytes: &[u8]) -> Decoded<TrainingState> {
    let (_, header) = SafeTensors::read_metadata(bytes).map_err(|e| e.to_string())?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| "missing metadata".to_string())?;

    let format: String = parse(metadata, "format")?;
    if format != FORMAT_VERSION {
        return Err(format!("unsupported format {format}"));
    }

    let tensors = SafeTensors::deserialize(bytes).map_err(|e| e.to_string())?;

    let model = groups(metadata, "model.groups")?
        .into_iter()
        .map(|name| read_f32(&tensors, &format!("model.{name}")).map(|values| (name.to_string(), values)))
        .collect::<Decoded<_>>()?;

    let mut optimizer = OptimizerState::new();
    for name in groups(metadata, "optim.groups")? {
        let group = GroupState {
            lr: parse(metadata, &format!("optim.{name}.lr"))?,
            step: parse(metadata, &format!("optim.{name}.step"))?,
            exp_avg: read_f32(&tensors, &format!("optim.{name}.exp_avg"))?,
            exp_avg_sq: read_f32(&tensors, &format!("optim.{name}.exp_avg_sq"))?,
        };

        optimizer.insert(name.to_string(), group);
    }

    Ok(TrainingState {
        model,
        optimizer,
        epoch: parse(metadata, "epoch")?,
        best_iou: parse(metadata, "best_iou")?,
        best_acc: parse(metadata, "best_acc")?,
    })
}

/// Atomically writes `state` to `path`.
///
/// # Errors
/// Returns an error if the state can't be encoded or the file can't be written, in which
/// case a previous checkpoint at `path` is left untouched.
pub fn save(state: &TrainingState, path: &Path) -> Result<()> {
    let bytes = encode(state).map_err(|e| checkpoint_err(path, e))?;
    let tmp = tmp_path(path);

    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    sync_dir(path)
}

/// Flushes the directory entry of `path` so a finished rename survives a crash.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Reads the state saved at `path`.
///
/// # Errors
/// Returns `WorkerErr::Checkpoint` if the file is not a complete checkpoint.
pub fn load(path: &Path) -> Result<TrainingState> {
    let bytes = fs::read(path)?;
    decode(&bytes).map_err(|e| checkpoint_err(path, e))
}

pub fn exists(path: &Path) -> bool {
    path.is_file()
}

/// Like [`load`], but a missing file is `None` instead of an error.
pub fn load_if_exists(path: &Path) -> Result<Option<TrainingState>> {
    match fs::read(path) {
        Ok(bytes) => decode(&bytes)
            .map(Some)
            .map_err(|e| checkpoint_err(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Owns the checkpoint files of a run's save directory.
///
/// Only the main rank writes, every rank reads.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    writer: bool,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, writer: bool) -> Self {
        Self {
            dir: dir.into(),
            writer,
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST)
    }

    /// Loads the latest checkpoint, `None` on a fresh run.
    pub fn resume(&self) -> Result<Option<TrainingState>> {
        load_if_exists(&self.latest_path())
    }

    /// Saves the state of a finished epoch, also as the best one if `is_best`.
    pub fn save_epoch(&self, state: &TrainingState, is_best: bool) -> Result<()> {
        if !self.writer {
            return Ok(());
        }

        save(state, &self.latest_path())?;
        if is_best {
            save(state, &self.best_path())?;
            info!(epoch = state.epoch, best_iou = state.best_iou; "saved new best checkpoint");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TrainingState {
        let mut optimizer = OptimizerState::new();
        optimizer.insert(
            "backbone".to_string(),
            GroupState {
                lr: 0.000_123_4,
                step: 17,
                exp_avg: vec![0.1, -0.2, 1e-30],
                exp_avg_sq: vec![0.01, 0.04, 0.0],
            },
        );
        optimizer.insert(
            "head".to_string(),
            GroupState {
                lr: 0.001_234,
                step: 17,
                exp_avg: vec![],
                exp_avg_sq: vec![],
            },
        );

        TrainingState {
            model: vec![
                ("backbone".to_string(), vec![1.0, f32::MIN_POSITIVE, -3.5]),
                ("head".to_string(), vec![]),
            ],
            optimizer,
            epoch: 4,
            best_iou: 1.0 / 3.0 * 100.0,
            best_acc: 87.654_321_012_345,
        }
    }

    #[test]
    fn load_gives_back_what_was_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST);
        let state = state();

        save(&state, &path).unwrap();

        assert_eq!(load(&path).unwrap(), state);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn missing_file_is_a_fresh_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), true);

        assert!(!exists(&manager.latest_path()));
        assert_eq!(manager.resume().unwrap(), None);
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST);
        fs::write(&path, b"not a checkpoint").unwrap();

        assert!(matches!(
            load_if_exists(&path),
            Err(WorkerErr::Checkpoint { .. })
        ));
    }

    #[test]
    fn overwriting_replaces_the_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), true);
        let mut state = state();

        manager.save_epoch(&state, true).unwrap();
        state.epoch = 5;
        manager.save_epoch(&state, false).unwrap();

        assert_eq!(load(&manager.latest_path()).unwrap().epoch, 5);
        assert_eq!(load(&manager.best_path()).unwrap().epoch, 4);
    }

    #[test]
    fn failed_save_keeps_the_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LATEST);
        let mut state = state();

        save(&state, &path).unwrap();
        fs::create_dir(tmp_path(&path)).unwrap();
        state.epoch = 5;

        assert!(save(&state, &path).is_err());
        assert_eq!(load(&path).unwrap().epoch, 4);
    }

    #[cfg(unix)]
    #[test]
    fn bare_file_names_sync_the_working_directory() {
        sync_dir(Path::new(LATEST)).unwrap();
        sync_dir(&Path::new("dir").join(LATEST)).unwrap_err();
    }

    #[test]
    fn only_the_writer_saves() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), false);

        manager.save_epoch(&state(), true).unwrap();

        assert!(!exists(&manager.latest_path()));
        assert!(!exists(&manager.best_path()));
    }
}
