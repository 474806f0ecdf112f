//! Checkpointing of savable variables.
//!
//! A checkpoint is a `safetensors` file with one F32 tensor per savable variable, keyed by the
//! name the variable manager reports (for example `ps_var/` already stripped in distributed
//! replicated mode), so checkpoints move between replication modes.

use crate::error::{Error, Result};
use crate::graph::VarId;
use crate::runtime::Session;
use crate::tensor::Tensor;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Writes the current value of every variable in `vars` to `path`.
pub fn save_checkpoint<P: AsRef<Path>>(
    path: P,
    session: &Session<'_>,
    vars: &BTreeMap<String, VarId>,
) -> Result<()> {
    let mut values = Vec::with_capacity(vars.len());
    for (name, &var) in vars {
        let value = session.variable_value(var)?;
        let bytes: Vec<u8> = value.data().iter().flat_map(|x| x.to_le_bytes()).collect();
        values.push((name.clone(), value.shape().to_vec(), bytes));
    }

    let mut views = HashMap::new();
    for (name, shape, bytes) in &values {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| Error::CheckpointFormat(format!("{name}: {e:?}")))?;
        views.insert(name.clone(), view);
    }

    let metadata: Option<HashMap<String, String>> = None;
    safetensors::serialize_to_file(&views, metadata, path.as_ref())
        .map_err(|e| Error::CheckpointFormat(format!("failed to save checkpoint: {e:?}")))?;
    info!(variables = vars.len(), path = %path.as_ref().display(), "saved checkpoint");
    Ok(())
}

/// Reads every tensor of a checkpoint.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Tensor<f32>>> {
    let file_content = std::fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&file_content)
        .map_err(|e| Error::CheckpointFormat(format!("failed to deserialize: {e:?}")))?;

    let mut tensors = HashMap::new();
    for (name, view) in safetensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(Error::CheckpointFormat(format!(
                "{name} has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let tensor = Tensor::new(data, view.shape().to_vec())?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Assigns every variable in `vars` from the checkpoint at `path`.
///
/// A variable missing from the file, or stored with a different shape, is an error; tensors in
/// the file that no variable asks for are ignored.
pub fn restore_checkpoint<P: AsRef<Path>>(
    path: P,
    session: &mut Session<'_>,
    vars: &BTreeMap<String, VarId>,
) -> Result<()> {
    let mut tensors = load_checkpoint(path)?;
    for (name, &var) in vars {
        let value = tensors
            .remove(name)
            .ok_or_else(|| Error::CheckpointMismatch(format!("{name} is not in the checkpoint")))?;
        let expected = session.graph().variable(var)?.shape.clone();
        if value.shape() != expected.as_slice() {
            return Err(Error::CheckpointMismatch(format!(
                "{name} has shape {:?} in the checkpoint, variable has {expected:?}",
                value.shape()
            )));
        }
        session.assign_variable(var, value)?;
    }
    Ok(())
}
