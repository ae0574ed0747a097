//! Safetensors checkpoints on disk.
//!
//! A checkpoint id names either a `.safetensors` file or a directory of
//! shards, relative to the store root. Opened checkpoints are memory-mapped
//! and tensors are decoded on demand, so a merge never holds a full model in
//! memory unless its recipes need it.

use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{CheckpointId, CheckpointSet, Dtype, MergeError, Result, Tensor, TensorStore};

/// Checkpoints stored as safetensors under a root directory.
#[derive(Debug, Clone)]
pub struct SafetensorsStore {
    root: PathBuf,
}

impl SafetensorsStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files backing `id`, sorted.
    fn shards(&self, id: &CheckpointId) -> Result<Vec<PathBuf>> {
        let base = self.root.join(id.as_str());
        let mut file = base.clone().into_os_string();
        file.push(".safetensors");
        let candidates = [base, PathBuf::from(file)];
        for path in candidates.iter() {
            if path.is_file() {
                return Ok(vec![path.clone()]);
            }
            if path.is_dir() {
                let mut files = Vec::new();
                for entry in std::fs::read_dir(path)? {
                    let file_path = entry?.path();
                    if file_path.extension().is_some_and(|e| e == "safetensors") {
                        files.push(file_path);
                    }
                }
                if !files.is_empty() {
                    files.sort();
                    return Ok(files);
                }
            }
        }
        Err(MergeError::CheckpointNotFound(format!(
            "{} (looked in {:?})",
            id, self.root
        )))
    }
}

impl TensorStore for SafetensorsStore {
    fn open(&self, ids: &[CheckpointId]) -> Result<Box<dyn CheckpointSet + '_>> {
        let mut opened = HashMap::with_capacity(ids.len());
        for id in ids {
            let checkpoint = MappedCheckpoint::open(&self.shards(id)?)?;
            info!("Mapped '{}': {} tensors", id, checkpoint.order.len());
            opened.insert(id.clone(), checkpoint);
        }
        Ok(Box::new(MappedSet { opened }))
    }
}

/// Location of a tensor within a mapped shard.
#[derive(Debug, Clone)]
struct TensorLocation {
    shard: usize,
    offset: usize,
    len: usize,
    dtype: Dtype,
    shape: Vec<usize>,
}

struct MappedCheckpoint {
    mmaps: Vec<Mmap>,
    index: HashMap<String, TensorLocation>,
    order: Vec<String>,
}

impl MappedCheckpoint {
    fn open(files: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(files.len());
        let mut index = HashMap::new();
        let mut order = Vec::new();

        for (shard, path) in files.iter().enumerate() {
            debug!("Memory-mapping {:?}", path);
            let file = File::open(path)?;
            // SAFETY: the file is opened read-only and the map lives as long
            // as this checkpoint.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };

            let tensors = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            let mut located = Vec::with_capacity(tensors.len());
            for (name, view) in tensors.tensors() {
                let data = view.data();
                let location = TensorLocation {
                    shard,
                    offset: data.as_ptr() as usize - base,
                    len: data.len(),
                    dtype: convert_dtype(&name, view.dtype())?,
                    shape: view.shape().to_vec(),
                };
                located.push((name, location));
            }
            // file order
            located.sort_by_key(|(_, loc)| loc.offset);
            for (name, location) in located {
                order.push(name.clone());
                index.insert(name, location);
            }
            mmaps.push(mmap);
        }

        Ok(Self {
            mmaps,
            index,
            order,
        })
    }

    fn tensor(&self, id: &CheckpointId, key: &str) -> Result<Tensor> {
        let loc = self.index.get(key).ok_or_else(|| MergeError::MissingKey {
            checkpoint: id.to_string(),
            key: key.to_string(),
        })?;
        let mmap = &self.mmaps[loc.shard];
        Tensor::from_le_bytes(&loc.shape, &mmap[loc.offset..loc.offset + loc.len], loc.dtype)
    }
}

struct MappedSet {
    opened: HashMap<CheckpointId, MappedCheckpoint>,
}

impl MappedSet {
    fn checkpoint(&self, id: &CheckpointId) -> Result<&MappedCheckpoint> {
        self.opened
            .get(id)
            .ok_or_else(|| MergeError::CheckpointNotFound(id.to_string()))
    }
}

impl CheckpointSet for MappedSet {
    fn keys(&self, checkpoint: &CheckpointId) -> Result<Vec<String>> {
        Ok(self.checkpoint(checkpoint)?.order.clone())
    }

    fn get_tensor(&self, checkpoint: &CheckpointId, key: &str) -> Result<Tensor> {
        self.checkpoint(checkpoint)?.tensor(checkpoint, key)
    }
}

fn convert_dtype(name: &str, dtype: safetensors::Dtype) -> Result<Dtype> {
    match dtype {
        safetensors::Dtype::F32 => Ok(Dtype::F32),
        safetensors::Dtype::F16 => Ok(Dtype::F16),
        safetensors::Dtype::BF16 => Ok(Dtype::BF16),
        other => Err(MergeError::UnsupportedDtype(format!("{other:?} for tensor '{name}'"))),
    }
}

fn safetensors_dtype(dtype: Dtype) -> safetensors::Dtype {
    match dtype {
        Dtype::F32 => safetensors::Dtype::F32,
        Dtype::F16 => safetensors::Dtype::F16,
        Dtype::BF16 => safetensors::Dtype::BF16,
    }
}

/// Write the tensors named by `order` to a single safetensors file.
///
/// Keys of `order` missing from `tensors` are skipped. The file layout is
/// chosen by the safetensors serializer.
pub fn save_safetensors(
    path: impl AsRef<Path>,
    order: &[String],
    tensors: &HashMap<String, Tensor>,
) -> Result<()> {
    let path = path.as_ref();
    let encoded: Vec<(&str, &Tensor, Vec<u8>)> = order
        .iter()
        .filter_map(|key| tensors.get_key_value(key.as_str()))
        .map(|(key, tensor)| (key.as_str(), tensor, tensor.to_le_bytes()))
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (key, tensor, bytes) in &encoded {
        let view = TensorView::new(safetensors_dtype(tensor.dtype()), tensor.shape().to_vec(), bytes)?;
        views.push((*key, view));
    }

    safetensors::serialize_to_file(views, &None, path)?;
    info!("Saved {} tensors to {:?}", encoded.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, tensors: &[(&str, Tensor)]) {
        let order: Vec<String> = tensors.iter().map(|(k, _)| k.to_string()).collect();
        let map: HashMap<String, Tensor> = tensors
            .iter()
            .map(|(k, t)| (k.to_string(), t.clone()))
            .collect();
        save_safetensors(path, &order, &map).unwrap();
    }

    #[test]
    fn test_open_file_and_read() {
        let dir = tempdir().unwrap();
        write(
            &dir.path().join("a.safetensors"),
            &[
                ("w", Tensor::from_vec(&[2], vec![1.0, 2.0], Dtype::F32).unwrap()),
                ("h", Tensor::from_vec(&[1], vec![0.5], Dtype::F16).unwrap()),
            ],
        );

        let store = SafetensorsStore::new(dir.path());
        let id = CheckpointId::new("a");
        let set = store.open(&[id.clone()]).unwrap();
        let mut keys = set.keys(&id).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["h".to_string(), "w".to_string()]);

        let w = set.get_tensor(&id, "w").unwrap();
        assert_eq!(w.to_vec_f32(), vec![1.0, 2.0]);
        let h = set.get_tensor(&id, "h").unwrap();
        assert_eq!(h.dtype(), Dtype::F16);
        assert_eq!(h.to_vec_f32(), vec![0.5]);
    }

    #[test]
    fn test_sharded_directory() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("model");
        std::fs::create_dir(&model).unwrap();
        write(
            &model.join("part-1.safetensors"),
            &[("x", Tensor::zeros(&[2], Dtype::F32))],
        );
        write(
            &model.join("part-2.safetensors"),
            &[("y", Tensor::zeros(&[3], Dtype::BF16))],
        );

        let store = SafetensorsStore::new(dir.path());
        let id = CheckpointId::new("model");
        let set = store.open(&[id.clone()]).unwrap();
        assert_eq!(set.keys(&id).unwrap(), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(set.get_tensor(&id, "y").unwrap().shape(), &[3]);
    }

    #[test]
    fn test_missing_key_and_checkpoint() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("a.safetensors"), &[("w", Tensor::zeros(&[1], Dtype::F32))]);
        let store = SafetensorsStore::new(dir.path());

        let err = store.open(&[CheckpointId::new("nope")]).err().unwrap();
        assert!(matches!(err, MergeError::CheckpointNotFound(_)));

        let id = CheckpointId::new("a");
        let set = store.open(&[id.clone()]).unwrap();
        let err = set.get_tensor(&id, "missing").unwrap_err();
        assert!(matches!(err, MergeError::MissingKey { ref key, .. } if key == "missing"));
    }

    #[test]
    fn test_unsupported_dtype() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ints.safetensors");
        let bytes = [0u8; 8];
        let view = TensorView::new(safetensors::Dtype::I32, vec![2], &bytes).unwrap();
        safetensors::serialize_to_file(vec![("i", view)], &None, &path).unwrap();

        let store = SafetensorsStore::new(dir.path());
        let err = store.open(&[CheckpointId::new("ints")]).err().unwrap();
        assert!(matches!(err, MergeError::UnsupportedDtype(_)));
    }
}
