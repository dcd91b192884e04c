//! Input checks shared by every public operation. All failures are
//! [`RiceError::Validation`] and are raised before anything is logged.

use crate::config::{
    MAX_BATCH_SIZE, MAX_DIMENSION, MAX_K, MAX_METADATA_KEYS, MAX_METADATA_STRING_BYTES,
    MAX_RELATION_BYTES, MAX_TRAVERSAL_DEPTH,
};
use crate::{Metadata, Result, RiceError, Value};

pub(crate) fn vector(v: &[f32], expected: Option<usize>) -> Result<()> {
    if v.is_empty() {
        return Err(RiceError::Validation("vector cannot be empty".into()));
    }
    if v.len() > MAX_DIMENSION {
        return Err(RiceError::Validation(format!(
            "vector dimension {} exceeds the maximum of {MAX_DIMENSION}",
            v.len()
        )));
    }
    if let Some(dim) = expected {
        if v.len() != dim {
            return Err(RiceError::Validation(format!(
                "vector must have exactly {dim} dimensions, got {}",
                v.len()
            )));
        }
    }
    if let Some(pos) = v.iter().position(|x| !x.is_finite()) {
        return Err(RiceError::Validation(format!(
            "vector contains a non-finite value at index {pos}"
        )));
    }
    Ok(())
}

pub(crate) fn metadata(m: &Metadata) -> Result<()> {
    if m.len() > MAX_METADATA_KEYS {
        return Err(RiceError::Validation(format!(
            "metadata has {} keys, at most {MAX_METADATA_KEYS} allowed",
            m.len()
        )));
    }
    for (key, value) in m {
        if key.is_empty() {
            return Err(RiceError::Validation("metadata keys cannot be empty".into()));
        }
        if key.len() > MAX_METADATA_STRING_BYTES {
            return Err(RiceError::Validation(format!("metadata key too long: {} bytes", key.len())));
        }
        match value {
            Value::Text(s) if s.len() > MAX_METADATA_STRING_BYTES => {
                return Err(RiceError::Validation(format!(
                    "metadata value for '{key}' too long: {} bytes",
                    s.len()
                )));
            }
            Value::Number(f) if !f.is_finite() => {
                return Err(RiceError::Validation(format!(
                    "metadata value for '{key}' is not finite"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

pub(crate) fn k(k: usize) -> Result<()> {
    if k == 0 || k > MAX_K {
        return Err(RiceError::Validation(format!("k must be in 1..={MAX_K}, got {k}")));
    }
    Ok(())
}

pub(crate) fn relation(r: &str) -> Result<()> {
    if r.is_empty() {
        return Err(RiceError::Validation("relation cannot be empty".into()));
    }
    if r.len() > MAX_RELATION_BYTES {
        return Err(RiceError::Validation(format!(
            "relation longer than {MAX_RELATION_BYTES} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn weight(w: f64) -> Result<()> {
    if !w.is_finite() {
        return Err(RiceError::Validation("edge weight must be finite".into()));
    }
    Ok(())
}

pub(crate) fn depth(d: usize) -> Result<()> {
    if d > MAX_TRAVERSAL_DEPTH {
        return Err(RiceError::Validation(format!(
            "max_depth must be <= {MAX_TRAVERSAL_DEPTH}, got {d}"
        )));
    }
    Ok(())
}

pub(crate) fn batch(len: usize) -> Result<()> {
    if len > MAX_BATCH_SIZE {
        return Err(RiceError::Validation(format!(
            "batch of {len} items exceeds the maximum of {MAX_BATCH_SIZE}"
        )));
    }
    Ok(())
}
