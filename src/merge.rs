//! Lossy reconciliation of shape-mismatched tensors.
//!
//! Checkpoints trained with a different token count or resampler width stay
//! loadable: the overlapping hyper-rectangle is copied, the rest of the live
//! tensor keeps its previous values. The copy is rank-agnostic; rank
//! mismatches are the one unreconcilable case and stay fatal.
use candle::{Result, Tensor};

/// Copies the elementwise-minimum overlapping region of `incoming` into a
/// copy of `current`, both aligned at the origin.
pub fn merge_overlap(current: &Tensor, incoming: &Tensor) -> Result<Tensor> {
    if current.rank() != incoming.rank() {
        candle::bail!(
            "cannot merge {:?} into {:?}: rank mismatch",
            incoming.shape(),
            current.shape()
        )
    }
    let incoming = incoming
        .to_dtype(current.dtype())?
        .to_device(current.device())?;
    if current.dims() == incoming.dims() {
        return Ok(incoming);
    }
    let overlap: Vec<usize> = current
        .dims()
        .iter()
        .zip(incoming.dims())
        .map(|(c, n)| *c.min(n))
        .collect();
    let mut patch = incoming;
    for (axis, &len) in overlap.iter().enumerate() {
        if len < patch.dim(axis)? {
            patch = patch.narrow(axis, 0, len)?;
        }
    }
    // zero-pad the patch up to the live shape and splice it in with a mask
    let mut mask = Tensor::ones(overlap, current.dtype(), current.device())?;
    for (axis, &len) in current.dims().iter().enumerate() {
        let pad = len - mask.dim(axis)?;
        if pad > 0 {
            patch = patch.pad_with_zeros(axis, 0, pad)?;
            mask = mask.pad_with_zeros(axis, 0, pad)?;
        }
    }
    (current * mask.affine(-1., 1.)?)? + patch
}
