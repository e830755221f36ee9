//! Embedding ↔ BLOB encoding (little-endian `f32`).

pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`encode_embedding`].
///
/// Fails on a length that is not a multiple of four or on non-finite values.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        ));
    }

    blob.chunks_exact(4)
        .map(|chunk| {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if value.is_finite() {
                Ok(value)
            } else {
                Err("embedding contains non-finite values".to_string())
            }
        })
        .collect()
}
