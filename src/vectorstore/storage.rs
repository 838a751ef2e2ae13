use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

const VECTOR_MAGIC: &[u8; 4] = b"CIVF";
const VECTOR_FORMAT_VERSION: u16 = 1;

/// Four hex levels, two characters each, derived from the first 8 hex
/// characters of `chunk_id` — 256^4 buckets of roughly even fan-out.
pub fn shard_components(chunk_id: &str) -> (String, String, String, String) {
    let hex: String = if chunk_id.len() >= 8 {
        chunk_id[..8].to_string()
    } else {
        format!("{:0<8}", chunk_id)
    };
    let bytes: Vec<&str> = vec![&hex[0..2], &hex[2..4], &hex[4..6], &hex[6..8]];
    (bytes[0].to_string(), bytes[1].to_string(), bytes[2].to_string(), bytes[3].to_string())
}

pub fn shard_relative_path(chunk_id: &str, extension: &str) -> PathBuf {
    let (a, b, c, d) = shard_components(chunk_id);
    PathBuf::from(a).join(b).join(c).join(d).join(format!("{chunk_id}.{extension}"))
}

/// Writes bytes to `path` atomically: write to a sibling temp file, fsync,
/// then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or(""),
        std::process::id()
    ));
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Encodes a vector record: magic + version + dimension + f32 LE values +
/// trailing CRC32 over everything preceding it.
pub fn encode_vector_file(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 2 + 4 + vector.len() * 4 + 4);
    buf.extend_from_slice(VECTOR_MAGIC);
    buf.extend_from_slice(&VECTOR_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

pub fn decode_vector_file(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() < 4 + 2 + 4 + 4 {
        return Err(AppError::CorruptStore("vector file too short".to_string()));
    }
    let (header_and_body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let actual_crc = crc32fast::hash(header_and_body);
    if stored_crc != actual_crc {
        return Err(AppError::CorruptStore("vector file CRC mismatch".to_string()));
    }

    if &header_and_body[0..4] != VECTOR_MAGIC {
        return Err(AppError::CorruptStore("vector file bad magic".to_string()));
    }
    let version = u16::from_le_bytes([header_and_body[4], header_and_body[5]]);
    if version != VECTOR_FORMAT_VERSION {
        return Err(AppError::CorruptStore(format!("unsupported vector file version {version}")));
    }
    let dimension = u32::from_le_bytes(header_and_body[6..10].try_into().unwrap()) as usize;
    let expected_len = 10 + dimension * 4;
    if header_and_body.len() != expected_len {
        return Err(AppError::CorruptStore("vector file length/dimension disagree".to_string()));
    }

    let mut vector = Vec::with_capacity(dimension);
    for chunk in header_and_body[10..].chunks_exact(4) {
        vector.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_components_even_split() {
        let (a, b, c, d) = shard_components("deadbeef0123");
        assert_eq!((a.as_str(), b.as_str(), c.as_str(), d.as_str()), ("de", "ad", "be", "ef"));
    }

    #[test]
    fn test_vector_roundtrip() {
        let vector: Vec<f32> = vec![0.1, -0.2, 3.5, 0.0];
        let bytes = encode_vector_file(&vector);
        let decoded = decode_vector_file(&bytes).unwrap();
        assert_eq!(vector, decoded);
    }

    #[test]
    fn test_vector_corruption_detected() {
        let vector: Vec<f32> = vec![1.0, 2.0];
        let mut bytes = encode_vector_file(&vector);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode_vector_file(&bytes).is_err());
    }
}
