//! Variable-length Blake2b (`H'` in RFC 9106).

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

use crate::error::{SecurityError, SecurityResult};

/// Native Blake2b output size.
pub const BLAKE2B_OUTBYTES: usize = 64;

/// Blake2b with a digest length of `out.len()` (1..=64) over `parts`.
pub(crate) fn blake2b(out: &mut [u8], parts: &[&[u8]]) -> SecurityResult<()> {
    let mut hasher = Blake2bVar::new(out.len()).map_err(|_| {
        SecurityError::CryptographicFailure(format!("invalid Blake2b length {}", out.len()))
    })?;
    for part in parts {
        hasher.update(part);
    }
    hasher
        .finalize_variable(out)
        .map_err(|_| SecurityError::CryptographicFailure("Blake2b finalize failed".into()))
}

/// Fill `out` with `H'(LE32(out.len()) || parts...)`.
///
/// Outputs up to 64 bytes are a single Blake2b call. Longer outputs chain
/// 64-byte digests, emitting the first 32 bytes of each, and finish with a
/// digest sized to the remainder.
pub fn blake2b_long(out: &mut [u8], parts: &[&[u8]]) -> SecurityResult<()> {
    if out.is_empty() {
        return Err(SecurityError::InvalidInput("blake2b_long output is empty".into()));
    }
    let len_prefix = u32::try_from(out.len())
        .map_err(|_| SecurityError::InvalidInput("blake2b_long output too long".into()))?
        .to_le_bytes();

    let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
    all.push(&len_prefix[..]);
    all.extend_from_slice(parts);

    if out.len() <= BLAKE2B_OUTBYTES {
        return blake2b(out, &all);
    }

    let mut v = [0u8; BLAKE2B_OUTBYTES];
    blake2b(&mut v, &all)?;

    let half = BLAKE2B_OUTBYTES / 2;
    out[..half].copy_from_slice(&v[..half]);
    let mut pos = half;

    while out.len() - pos > BLAKE2B_OUTBYTES {
        let prev = v;
        blake2b(&mut v, &[&prev[..]])?;
        out[pos..pos + half].copy_from_slice(&v[..half]);
        pos += half;
    }

    let prev = v;
    blake2b(&mut out[pos..], &[&prev[..]])?;
    Ok(())
}
