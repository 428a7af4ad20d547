use safetensors::{Dtype, SafeTensorError, SafeTensors};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
};
use tch::{nn::VarStore, Device, Kind, Tensor};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoadSafetensorsError {
    #[error("failed to open safetensors file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse safetensors file: {0}")]
    Deserialize(#[from] SafeTensorError),

    #[error("unsupported safetensors dtype {0:?} for {1}")]
    UnsupportedDtype(Dtype, String),

    #[error("failed to copy tensor into variable store: {0}")]
    Copy(#[from] tch::TchError),

    #[error("checkpoint missing the following variables: {0:?}")]
    MissingVariables(HashSet<String>),
}

fn kind_from_dtype(dtype: Dtype) -> Option<Kind> {
    match dtype {
        Dtype::BOOL => Some(Kind::Bool),
        Dtype::U8 => Some(Kind::Uint8),
        Dtype::I8 => Some(Kind::Int8),
        Dtype::I16 => Some(Kind::Int16),
        Dtype::I32 => Some(Kind::Int),
        Dtype::I64 => Some(Kind::Int64),
        Dtype::F16 => Some(Kind::Half),
        Dtype::BF16 => Some(Kind::BFloat16),
        Dtype::F32 => Some(Kind::Float),
        Dtype::F64 => Some(Kind::Double),
        _ => None,
    }
}

/// Copies every variable of `vs` from the `.safetensors` files among `repo_files`.
///
/// Tensors in the files that `vs` does not know about are ignored (T5 checkpoints carry
/// `encoder.embed_tokens.weight` aliases of `shared.weight`, for instance), but every variable
/// must be found somewhere.
pub fn load_safetensors_into_variables(
    vs: &mut VarStore,
    repo_files: &[PathBuf],
) -> Result<(), LoadSafetensorsError> {
    let _no_grad = tch::no_grad_guard();
    let variables = vs.variables();
    let mut unmatched = variables.keys().cloned().collect::<HashSet<_>>();
    for path in repo_files.iter().filter(|x| {
        x.extension()
            .is_some_and(|y| y.eq_ignore_ascii_case("safetensors"))
    }) {
        debug!(path = %path.display(), "Loading safetensors");
        let file = std::fs::File::open(path)?;
        let content = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let safetensors = SafeTensors::deserialize(&content)?;
        for (name, var) in variables.iter() {
            let Ok(view) = safetensors.tensor(name) else {
                continue;
            };
            let size: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
            let kind = kind_from_dtype(view.dtype())
                .ok_or_else(|| LoadSafetensorsError::UnsupportedDtype(view.dtype(), name.clone()))?;
            let src_tensor =
                unsafe { Tensor::from_blob(view.data().as_ptr(), &size, &[], kind, Device::Cpu) };
            var.shallow_clone().f_copy_(&src_tensor)?;
            unmatched.remove(name);
        }
    }
    if !unmatched.is_empty() {
        return Err(LoadSafetensorsError::MissingVariables(unmatched));
    }
    Ok(())
}

/// Copies every variable of `vs` from an in-memory name-to-tensor map.
pub fn load_tensors_into_variables(
    vs: &mut VarStore,
    tensors: &HashMap<String, Tensor>,
) -> Result<(), LoadSafetensorsError> {
    let _no_grad = tch::no_grad_guard();
    let mut unmatched = HashSet::new();
    for (name, var) in vs.variables() {
        match tensors.get(&name) {
            Some(tensor) => {
                var.shallow_clone().f_copy_(tensor)?;
            }
            None => {
                unmatched.insert(name);
            }
        }
    }
    if !unmatched.is_empty() {
        return Err(LoadSafetensorsError::MissingVariables(unmatched));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::{self, Module};

    #[test]
    fn round_trips_through_a_safetensors_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let source = VarStore::new(Device::Cpu);
        let layer = nn::linear(source.root() / "proj", 3, 2, Default::default());
        source.save(&path).unwrap();

        let mut target = VarStore::new(Device::Cpu);
        let copy = nn::linear(target.root() / "proj", 3, 2, Default::default());
        load_safetensors_into_variables(&mut target, &[path]).unwrap();

        let xs = Tensor::randn([4, 3], (Kind::Float, Device::Cpu));
        assert!(layer.forward(&xs).allclose(&copy.forward(&xs), 1e-6, 1e-6, false));
    }

    #[test]
    fn missing_variables_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let source = VarStore::new(Device::Cpu);
        let _ = nn::linear(source.root() / "proj", 3, 2, Default::default());
        source.save(&path).unwrap();

        let mut target = VarStore::new(Device::Cpu);
        let _ = nn::linear(target.root() / "other", 3, 2, Default::default());
        match load_safetensors_into_variables(&mut target, &[path]) {
            Err(LoadSafetensorsError::MissingVariables(missing)) => {
                assert_eq!(missing.len(), 2);
                assert!(missing.contains("other.weight"));
            }
            other => panic!("expected missing variables, got {other:?}"),
        }
    }
}
