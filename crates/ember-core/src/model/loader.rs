//! SafeTensors weight loading.
//!
//! Every tensor is converted to the loader's target element type as it is
//! read. For f16 targets, 2D projection matrices are also transposed during
//! that copy, so a weight stored `[out, in]` lands as `[in, out]`; the
//! loader remembers which names it transposed.
//!
//! # Example
//!
//! ```no_run
//! use ember_core::model::WeightLoader;
//! use ember_core::tensor::DType;
//! use std::path::Path;
//!
//! let mut loader = WeightLoader::from_dir(Path::new("/path/to/model"), DType::F16)?;
//! let embed = loader.take("model.embed_tokens.weight")?;
//! # Ok::<(), ember_core::EmberError>(())
//! ```

use crate::error::{EmberError, Result};
use crate::tensor::{DType, Tensor, TensorMeta};
use safetensors::SafeTensors;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Whether a 2D tensor named `name` is transposed on f16 loads. Lookup
/// tables keep their row layout.
fn transposes_on_load(name: &str) -> bool {
    !name.contains("embed")
}

/// Weights read from one or more safetensors files.
#[derive(Debug)]
pub struct WeightLoader {
    tensors: HashMap<String, Tensor>,
    transposed: HashSet<String>,
    dtype: DType,
}

impl WeightLoader {
    /// Load every `.safetensors` file in `dir`.
    pub fn from_dir(dir: &Path, dtype: DType) -> Result<Self> {
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                files.push(path);
            }
        }
        // deterministic order for sharded checkpoints
        files.sort();

        if files.is_empty() {
            return Err(EmberError::ModelError(format!(
                "no .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut loader = Self::empty(dtype)?;
        for path in &files {
            loader.read_file(path)?;
        }
        info!(
            dir = %dir.display(),
            files = files.len(),
            tensors = loader.len(),
            dtype = %dtype,
            "weights loaded"
        );
        Ok(loader)
    }

    /// Load a single file.
    pub fn from_file(path: &Path, dtype: DType) -> Result<Self> {
        let mut loader = Self::empty(dtype)?;
        loader.read_file(path)?;
        Ok(loader)
    }

    /// Parse an in-memory safetensors buffer.
    pub fn from_bytes(bytes: &[u8], dtype: DType) -> Result<Self> {
        let mut loader = Self::empty(dtype)?;
        loader.read_bytes(bytes, "<memory>")?;
        Ok(loader)
    }

    fn empty(dtype: DType) -> Result<Self> {
        if !dtype.is_executable() {
            return Err(EmberError::UnsupportedDType(dtype));
        }
        Ok(Self {
            tensors: HashMap::new(),
            transposed: HashSet::new(),
            dtype,
        })
    }

    fn read_file(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        self.read_bytes(&bytes, &path.display().to_string())
    }

    fn read_bytes(&mut self, bytes: &[u8], source: &str) -> Result<()> {
        let file = SafeTensors::deserialize(bytes)
            .map_err(|e| EmberError::ModelError(format!("failed to parse {}: {}", source, e)))?;
        for (name, view) in file.tensors() {
            let Some(tensor) = Self::decode(&name, &view)? else {
                debug!(name = %name, dtype = ?view.dtype(), "skipping non-float tensor");
                continue;
            };
            let transpose = self.dtype == DType::F16 && tensor.ndim() == 2 && transposes_on_load(&name);
            let tensor = convert(tensor, self.dtype, transpose)?;
            if transpose {
                self.transposed.insert(name.clone());
            }
            self.tensors.insert(name, tensor);
        }
        Ok(())
    }

    /// Source tensor in its stored float type; `None` for non-float data.
    fn decode(name: &str, view: &safetensors::tensor::TensorView<'_>) -> Result<Option<Tensor>> {
        let shape = view.shape();
        let data = view.data();
        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                let values: Vec<f32> = match bytemuck::try_cast_slice::<u8, f32>(data) {
                    Ok(values) => values.to_vec(),
                    Err(_) => data
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect(),
                };
                Tensor::from_f32(shape, values)
            }
            safetensors::Dtype::F16 | safetensors::Dtype::BF16 => {
                let dtype = if view.dtype() == safetensors::Dtype::F16 {
                    DType::F16
                } else {
                    DType::BF16
                };
                let bits: Vec<u16> = match bytemuck::try_cast_slice::<u8, u16>(data) {
                    Ok(bits) => bits.to_vec(),
                    Err(_) => data
                        .chunks_exact(2)
                        .map(|b| u16::from_le_bytes([b[0], b[1]]))
                        .collect(),
                };
                Tensor::from_bits16(dtype, shape, bits)
            }
            _ => return Ok(None),
        };
        tensor
            .map(Some)
            .map_err(|e| EmberError::ModelError(format!("tensor {}: {}", name, e)))
    }

    /// Target element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Borrow a tensor, or fail if it is missing.
    pub fn get_tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| EmberError::ModelError(format!("tensor not found: {}", name)))
    }

    /// Move a tensor out of the loader, or fail if it is missing.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| EmberError::ModelError(format!("tensor not found: {}", name)))
    }

    /// Move a tensor out if present.
    pub fn take_optional(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    /// Whether `name` was stored transposed.
    pub fn is_transposed(&self, name: &str) -> bool {
        self.transposed.contains(name)
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// All tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of tensors not yet taken.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether every tensor has been taken.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get tensors matching a prefix.
    pub fn get_with_prefix(&self, prefix: &str) -> HashMap<&str, &Tensor> {
        self.tensors
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect()
    }
}

fn convert(tensor: Tensor, dtype: DType, transpose: bool) -> Result<Tensor> {
    if transpose {
        let src = tensor.transpose(0, 1)?;
        let mut out = Tensor::zeros(dtype, src.dims())?;
        out.copy_from(&src)?;
        return Ok(out);
    }
    if tensor.dtype() == dtype {
        return Ok(tensor);
    }
    let mut out = Tensor::zeros(dtype, tensor.dims())?;
    out.copy_from(&tensor.view())?;
    Ok(out)
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::{json, Map, Value};

    /// A safetensors buffer holding f32 tensors.
    pub(crate) fn safetensors_bytes(tensors: &[(&str, Vec<usize>, Vec<f32>)]) -> Vec<u8> {
        let mut header = Map::new();
        let mut data = Vec::new();
        for (name, shape, values) in tensors {
            let start = data.len();
            for v in values {
                data.extend_from_slice(&v.to_le_bytes());
            }
            header.insert(
                name.to_string(),
                json!({ "dtype": "F32", "shape": shape, "data_offsets": [start, data.len()] }),
            );
        }
        let mut header = serde_json::to_vec(&Value::Object(header)).unwrap();
        while header.len() % 8 != 0 {
            header.push(b' ');
        }
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::safetensors_bytes;
    use super::*;

    fn sample() -> Vec<u8> {
        safetensors_bytes(&[
            ("model.embed_tokens.weight", vec![3, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            ("model.layers.0.self_attn.q_proj.weight", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ("model.norm.weight", vec![2], vec![1.0, 1.0]),
        ])
    }

    #[test]
    fn f32_load_keeps_layout() {
        let mut loader = WeightLoader::from_bytes(&sample(), DType::F32).unwrap();
        assert_eq!(loader.len(), 3);
        assert_eq!(
            loader.tensor_names(),
            vec![
                "model.embed_tokens.weight",
                "model.layers.0.self_attn.q_proj.weight",
                "model.norm.weight"
            ]
        );
        let q = loader.take("model.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.dims(), &[2, 3]);
        assert_eq!(q.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(!loader.is_transposed("model.layers.0.self_attn.q_proj.weight"));
        assert!(!loader.contains("model.layers.0.self_attn.q_proj.weight"));
        assert!(loader.take("model.layers.0.self_attn.q_proj.weight").is_err());
    }

    #[test]
    fn f16_load_transposes_projections_only() {
        let loader = WeightLoader::from_bytes(&sample(), DType::F16).unwrap();
        let q = loader.get_tensor("model.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.dtype(), DType::F16);
        assert_eq!(q.dims(), &[3, 2]);
        assert_eq!(q.to_f32_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(loader.is_transposed("model.layers.0.self_attn.q_proj.weight"));

        let embed = loader.get_tensor("model.embed_tokens.weight").unwrap();
        assert_eq!(embed.dims(), &[3, 2]);
        assert!(!loader.is_transposed("model.embed_tokens.weight"));

        let norm = loader.get_tensor("model.norm.weight").unwrap();
        assert_eq!(norm.dtype(), DType::F16);
    }

    #[test]
    fn bf16_load_converts() {
        let loader = WeightLoader::from_bytes(&sample(), DType::BF16).unwrap();
        let q = loader.get_tensor("model.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.dtype(), DType::BF16);
        assert_eq!(q.dims(), &[2, 3]);
        assert_eq!(q.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn prefix_lookup() {
        let loader = WeightLoader::from_bytes(&sample(), DType::F32).unwrap();
        let layer = loader.get_with_prefix("model.layers.0.");
        assert_eq!(layer.len(), 1);
        assert!(layer.contains_key("model.layers.0.self_attn.q_proj.weight"));
    }

    #[test]
    fn rejects_integer_target() {
        assert!(matches!(
            WeightLoader::from_bytes(&sample(), DType::I8),
            Err(EmberError::UnsupportedDType(DType::I8))
        ));
    }

    #[test]
    fn loader_from_nonexistent_dir() {
        assert!(WeightLoader::from_dir(Path::new("/nonexistent/path"), DType::F32).is_err());
    }

    #[test]
    fn loader_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = WeightLoader::from_dir(dir.path(), DType::F32);
        assert!(matches!(result, Err(EmberError::ModelError(_))));
    }

    #[test]
    fn sharded_dir_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model-00001-of-00002.safetensors"),
            safetensors_bytes(&[("a", vec![2], vec![1.0, 2.0])]),
        )
        .unwrap();
        fs::write(
            dir.path().join("model-00002-of-00002.safetensors"),
            safetensors_bytes(&[("b", vec![1], vec![3.0])]),
        )
        .unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        let loader = WeightLoader::from_dir(dir.path(), DType::F32).unwrap();
        assert_eq!(loader.tensor_names(), vec!["a", "b"]);
    }

    #[test]
    fn corrupt_file_is_model_error() {
        let result = WeightLoader::from_bytes(b"not a safetensors file", DType::F32);
        assert!(matches!(result, Err(EmberError::ModelError(_))));
    }
}
