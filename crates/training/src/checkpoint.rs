//! Versioned on-disk snapshots of the full parameter set plus the global
//! step. Every per-mode instance shares weights through this directory, never
//! through memory; the orchestrator sequences each save before the dependent
//! load.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::SeqEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{RunConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub global_step: u64,
    pub config_sha256: String,
    pub model: FileRecord,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes a snapshot tagged with `global_step` under `base_dir`, replacing
/// any existing snapshot for the same step.
pub fn save_checkpoint(
    base_dir: &Path,
    model: &SeqEncoder,
    global_step: u64,
    config: &RunConfig,
) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            base_dir.display()
        ))
    })?;

    let checkpoint_dir = base_dir.join(format!("step_{global_step:012}"));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(model, &model_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        global_step,
        config_sha256: fingerprint_config(config)?,
        model: file_record(&model_path)?,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Resolves the newest snapshot in `base_dir`. Step directories are
/// zero-padded so lexicographic order is step order.
pub fn latest_checkpoint(
    base_dir: &Path,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

/// Overwrites the model's parameters with the snapshot's saved values and
/// returns the snapshot's global step.
///
/// A missing or extra parameter, a shape mismatch, a failed checksum or an
/// unsupported manifest version is fatal: the run cannot produce a consistent
/// model, and silently reinitializing would corrupt an intended resume.
pub fn restore_model(
    model: &SeqEncoder,
    descriptor: &CheckpointDescriptor,
) -> Result<u64, TrainingError> {
    let manifest = &descriptor.manifest;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let model_path = descriptor.directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let tensors =
        load_safetensors(&model_path, model.device()).map_err(to_runtime_error)?;
    let mut saved: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.named_parameters() {
        let tensor = saved.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint shape mismatch for {name}: saved {:?}, expected {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !saved.is_empty() {
        let extra = saved.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(manifest.global_step)
}

/// Create-or-load semantics of a mode's first use: the model arrives freshly
/// initialized; if a snapshot exists its values win and its global step is
/// reported, otherwise the fresh initialization stands at step 0. Read-only
/// on the filesystem.
pub fn create_or_load(
    model: &SeqEncoder,
    base_dir: &Path,
    name: &str,
) -> Result<u64, TrainingError> {
    let start = Instant::now();
    match latest_checkpoint(base_dir)? {
        Some(descriptor) => {
            let global_step = restore_model(model, &descriptor)?;
            println!(
                "load {} model from {}, time {:.2}",
                name,
                descriptor.directory.display(),
                start.elapsed().as_secs_f64()
            );
            Ok(global_step)
        }
        None => {
            println!(
                "create {} model, time {:.2}",
                name,
                start.elapsed().as_secs_f64()
            );
            Ok(0)
        }
    }
}

fn save_model_weights(model: &SeqEncoder, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &RunConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with("step_") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
