//! Conversion between scope variables and wire batches.
//!
//! Serialization stages device resident buffers to the host, deserialization
//! lands wire bytes on the context's place. Both synchronize the context before
//! returning, so results are safe to use right away.

use std::collections::HashSet;

use comms::{
    msg::VarBatch,
    specs::{BatchHeader, Layout, RemoteErrKind, VarMeta},
};
use log::debug;
use rayon::prelude::*;

use crate::{
    device::{DeviceBuffer, DeviceContext, Place},
    error::{HeterErr, Result},
    scope::Scope,
    tensor::{SparseRows, Tensor, VarKind, Variable},
};

/// The memory spaces a copy crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPath {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl CopyPath {
    pub fn between(src: Place, dst: Place) -> Self {
        match (src, dst) {
            (Place::Host, Place::Host) => Self::HostToHost,
            (Place::Host, Place::Device(_)) => Self::HostToDevice,
            (Place::Device(_), Place::Host) => Self::DeviceToHost,
            (Place::Device(_), Place::Device(_)) => Self::DeviceToDevice,
        }
    }
}

/// Moves `src` to `dst` through `ctx`, the result is valid after `ctx.synchronize()`.
///
/// Host to host transfers hand back `src` itself.
fn transfer(ctx: &dyn DeviceContext, src: &DeviceBuffer, dst: Place) -> Result<DeviceBuffer> {
    let out = match CopyPath::between(src.place(), dst) {
        CopyPath::HostToHost => return Ok(src.clone()),
        CopyPath::DeviceToHost => DeviceBuffer::zeroed(Place::Host, src.len()),
        CopyPath::HostToDevice | CopyPath::DeviceToDevice => ctx.alloc(src.len()),
    };

    ctx.copy(&out, src)?;
    Ok(out)
}

/// Serializes the variables `names` of `scope` into a batch addressed by `header`.
///
/// Names are looked up with `Scope::find`, so variables of ancestor scopes are visible.
///
/// # Arguments
/// * `ctx` - The context used to stage device buffers to the host.
/// * `scope` - The scope to read from.
/// * `header` - The addressing of the batch, its `vars` are overwritten.
/// * `names` - The variables to serialize, in wire order.
///
/// # Returns
/// An owned batch, or a `Config` error if a variable is missing or uninitialized.
pub fn serialize<S: AsRef<str>>(
    ctx: &dyn DeviceContext,
    scope: &Scope,
    mut header: BatchHeader,
    names: &[S],
) -> Result<VarBatch<'static>> {
    let mut metas = Vec::with_capacity(names.len());
    let mut staged = Vec::with_capacity(names.len());

    for name in names {
        let name = name.as_ref();
        let handle = scope
            .find(name)
            .ok_or_else(|| HeterErr::Config(format!("variable `{name}` is not in scope")))?;

        let var = handle.read();
        let (meta, value) = match &*var {
            Variable::Uninit => {
                return Err(HeterErr::Config(format!(
                    "variable `{name}` is not initialized"
                )));
            }
            Variable::Dense(t) => (
                VarMeta::dense(name, t.dtype(), t.shape().to_vec()),
                t,
            ),
            Variable::SparseRows(s) => (
                VarMeta::sparse_row(
                    name,
                    s.value().dtype(),
                    s.value().shape().to_vec(),
                    s.rows().to_vec(),
                    s.height(),
                ),
                s.value(),
            ),
        };

        staged.push(transfer(ctx, value.buffer(), Place::Host)?);
        metas.push(meta);
    }

    ctx.synchronize()?;

    let mut data = Vec::with_capacity(staged.iter().map(DeviceBuffer::len).sum());
    for buffer in &staged {
        data.extend_from_slice(&buffer.to_host_vec()?);
    }

    debug!(vars = metas.len(), bytes = data.len(); "serialized batch for channel {}", header.channel);

    header.vars = metas;
    Ok(VarBatch::new(header, data))
}

/// Deserializes every variable of `batch` into `scope`.
///
/// The whole batch is validated before any variable is written.
///
/// # Arguments
/// * `ctx` - The context whose place receives the buffers.
/// * `batch` - The received batch.
/// * `scope` - The scope to write into, never one of its ancestors.
///
/// # Returns
/// The names of the landed variables in wire order, or a `Protocol` error if the
/// batch is malformed or one of its variables already holds a value of another kind
/// in `scope`.
pub fn deserialize(
    ctx: &dyn DeviceContext,
    batch: &VarBatch<'_>,
    scope: &Scope,
) -> Result<Vec<String>> {
    let pairs = batch
        .split_vars()
        .map_err(|e| HeterErr::malformed(e.to_string()))?;

    let mut names = HashSet::with_capacity(pairs.len());
    for (meta, _) in &pairs {
        if !names.insert(meta.name.as_str()) {
            return Err(HeterErr::malformed(format!(
                "variable `{}` appears twice in the batch",
                meta.name
            )));
        }

        validate(meta)?;
        check_kind(scope, meta)?;
    }

    let place = ctx.place();
    let landed = pairs
        .par_iter()
        .map(|(meta, bytes)| {
            let buffer = transfer(ctx, &DeviceBuffer::from_host(bytes), place)?;
            land(scope, meta, buffer);
            Ok(meta.name.clone())
        })
        .collect::<Result<Vec<_>>>()?;

    ctx.synchronize()?;

    debug!(vars = landed.len(); "deserialized batch for channel {}", batch.header.channel);
    Ok(landed)
}

fn layout_kind(layout: Layout) -> VarKind {
    match layout {
        Layout::Dense => VarKind::Dense,
        Layout::SparseRow => VarKind::SparseRows,
    }
}

fn check_kind(scope: &Scope, meta: &VarMeta) -> Result<()> {
    let incoming = layout_kind(meta.layout);
    let held = scope.find_local(&meta.name).and_then(|handle| handle.kind());

    match held {
        Some(held) if held != incoming => Err(HeterErr::protocol(
            RemoteErrKind::TypeConflict,
            format!(
                "variable `{}` holds a {held}, can't land a {incoming} in it",
                meta.name
            ),
        )),
        _ => Ok(()),
    }
}

fn land(scope: &Scope, meta: &VarMeta, buffer: DeviceBuffer) {
    let value = Tensor::new(meta.dtype, meta.shape.clone(), buffer);

    let var = match meta.layout {
        Layout::Dense => Variable::Dense(value),
        Layout::SparseRow => {
            let rows = meta.rows.clone().unwrap_or_default();
            let height = meta.height.unwrap_or(rows.len() as i64);
            Variable::SparseRows(SparseRows::new(height, rows, value))
        }
    };

    scope.var_of(&meta.name, layout_kind(meta.layout)).set(var);
}

fn validate(meta: &VarMeta) -> Result<()> {
    let name = &meta.name;

    let expected = meta
        .numel()
        .and_then(|numel| numel.checked_mul(meta.dtype.size()))
        .ok_or_else(|| HeterErr::malformed(format!("variable `{name}` has an invalid shape {:?}", meta.shape)))?;

    if expected != meta.len {
        return Err(HeterErr::malformed(format!(
            "variable `{name}` carries {} bytes, its shape and type need {expected}",
            meta.len
        )));
    }

    match (meta.layout, &meta.rows) {
        (Layout::Dense, None) => Ok(()),
        (Layout::Dense, Some(_)) => Err(HeterErr::malformed(format!(
            "dense variable `{name}` carries row indices"
        ))),
        (Layout::SparseRow, None) => Err(HeterErr::malformed(format!(
            "sparse variable `{name}` carries no row indices"
        ))),
        (Layout::SparseRow, Some(rows)) => validate_rows(meta, rows),
    }
}

fn validate_rows(meta: &VarMeta, rows: &[i64]) -> Result<()> {
    let name = &meta.name;

    if meta.shape.first().copied() != Some(rows.len() as i64) {
        return Err(HeterErr::malformed(format!(
            "sparse variable `{name}` has {} rows but a value of shape {:?}",
            rows.len(),
            meta.shape
        )));
    }

    let height = meta.height.unwrap_or(i64::MAX);

    if let Some(&row) = rows.iter().find(|row| !(0..height).contains(*row)) {
        return Err(HeterErr::malformed(format!(
            "sparse variable `{name}` has row {row} outside of [0, {height})"
        )));
    }

    for pair in rows.windows(2) {
        let (prev, row) = (pair[0], pair[1]);

        if row == prev {
            return Err(HeterErr::malformed(format!(
                "sparse variable `{name}` has duplicate row index {row}"
            )));
        }

        if row < prev {
            return Err(HeterErr::malformed(format!(
                "sparse variable `{name}` has row {row} after row {prev}, rows must ascend"
            )));
        }
    }

    Ok(())
}
