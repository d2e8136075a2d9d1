//! Parameter sources for embedders.
//!
//! Trained parameters come from a `safetensors` file. Without one,
//! parameters are synthesised deterministically from a seed so a pipeline
//! can run end to end before training has produced weights.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use super::embedder::{EmbeddingError, Result};
use super::models::WeightsStatus;

/// Where an embedder's parameters come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSource {
    /// A `safetensors` file with parameter names matching the module layout.
    File(PathBuf),
    /// Deterministic synthesis from a seed.
    Seeded(u64),
}

impl WeightSource {
    /// Status reported once parameters were obtained from this source.
    pub fn status(&self) -> WeightsStatus {
        match self {
            Self::File(_) => WeightsStatus::Loaded,
            Self::Seeded(_) => WeightsStatus::Synthetic,
        }
    }

    /// Short description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Seeded(seed) => format!("seed {seed}"),
        }
    }

    /// Identifies the parameters well enough to tell stale cached embeddings apart.
    ///
    /// Files are identified by path, size and modification time.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::File(path) => {
                let (len, modified) = std::fs::metadata(path)
                    .map(|meta| {
                        let modified = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or_default();
                        (meta.len(), modified)
                    })
                    .unwrap_or_default();
                format!("file:{}:{len}:{modified}", path.display())
            }
            Self::Seeded(seed) => format!("seed:{seed}"),
        }
    }

    /// Builds a model whose parameters come from this source.
    ///
    /// `build` receives a [`VarBuilder`] and must request every parameter
    /// the model needs; a weights file lacking one of them is an error.
    pub fn build<T, F>(&self, device: &Device, build: F) -> Result<T>
    where
        F: FnOnce(VarBuilder) -> candle_core::Result<T>,
    {
        match self {
            Self::File(path) => {
                let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
                    EmbeddingError::Weights {
                        location: self.describe(),
                        reason: e.to_string(),
                    }
                })?;
                let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
                build(vb).map_err(|e| EmbeddingError::Weights {
                    location: self.describe(),
                    reason: e.to_string(),
                })
            }
            Self::Seeded(seed) => {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
                let model = build(vb)?;
                reseed(&varmap, *seed)?;
                Ok(model)
            }
        }
    }
}

/// Overwrites every variable in `varmap` with seeded values.
///
/// Variables are visited in name order so the result does not depend on
/// construction order. Matrices and kernels get uniform values in
/// `±1/sqrt(fan_in)`; biases become zero; other vectors (batch-norm scale
/// and running statistics) keep their constant initialisation.
fn reseed(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| EmbeddingError::Weights {
            location: format!("seed {seed}"),
            reason: "parameter map lock poisoned".to_string(),
        })?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let Some(var) = data.get(name) else { continue };
        let dims = var.dims().to_vec();

        if dims.len() >= 2 {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            let count: usize = dims.iter().product();
            let values: Vec<f32> = (0..count).map(|_| rng.random_range(-bound..bound)).collect();
            var.set(&Tensor::from_vec(values, dims.as_slice(), var.device())?)?;
        } else if name.ends_with("bias") {
            var.set(&var.zeros_like()?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{linear, Linear, Module};

    fn build_linear(source: &WeightSource) -> Linear {
        source
            .build(&Device::Cpu, |vb| linear(4, 3, vb.pp("head")))
            .unwrap()
    }

    fn output(layer: &Linear) -> Vec<f32> {
        let xs = Tensor::new(&[[1f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        layer.forward(&xs).unwrap().flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn seeded_parameters_are_deterministic() {
        let a = build_linear(&WeightSource::Seeded(7));
        let b = build_linear(&WeightSource::Seeded(7));
        let c = build_linear(&WeightSource::Seeded(8));

        assert_eq!(output(&a), output(&b));
        assert_ne!(output(&a), output(&c));
    }

    #[test]
    fn seeded_values_respect_fan_in_bound() {
        let layer = build_linear(&WeightSource::Seeded(3));
        let weights = layer.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(weights.iter().all(|w| w.abs() <= 0.5));

        let bias = layer.bias().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(bias, vec![0.0; 3]);
    }

    #[test]
    fn loads_safetensors_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.safetensors");

        let weight = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let tensors = std::collections::HashMap::from([
            ("head.weight".to_string(), weight),
            ("head.bias".to_string(), bias),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let layer = build_linear(&WeightSource::File(path));
        assert_eq!(output(&layer), vec![11.0, 12.0, 13.0]);
    }

    #[test]
    fn missing_parameter_is_a_weights_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        let tensors = std::collections::HashMap::from([(
            "head.weight".to_string(),
            Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let result = WeightSource::File(path).build(&Device::Cpu, |vb| linear(4, 3, vb.pp("head")));
        assert!(matches!(result, Err(EmbeddingError::Weights { .. })));
    }

    #[test]
    fn missing_file_is_a_weights_error() {
        let source = WeightSource::File(PathBuf::from("/nonexistent/se.safetensors"));
        let result = source.build(&Device::Cpu, |vb| linear(4, 3, vb));
        assert!(matches!(result, Err(EmbeddingError::Weights { .. })));
    }

    #[test]
    fn fingerprints() {
        assert_eq!(WeightSource::Seeded(42).fingerprint(), "seed:42");
        let missing = WeightSource::File(PathBuf::from("/nonexistent/w.safetensors"));
        assert_eq!(missing.fingerprint(), "file:/nonexistent/w.safetensors:0:0");
    }
}
