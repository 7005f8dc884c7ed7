//! Embedding blobs in NumPy `.npy` format.
//!
//! Written as version 1.0, little-endian `float32`, one dimension. The reader
//! also accepts `float64`, big-endian data, a `(1, n)` shape and header
//! versions 2 and 3, which covers what `numpy.save` emits for a single vector.

use crate::types::Embedding;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NpyError {
    #[error("not an .npy blob")]
    BadMagic,
    #[error("unsupported .npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("truncated .npy blob")]
    Truncated,
    #[error("malformed .npy header: {0}")]
    BadHeader(String),
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("array shape {0:?} is not a single vector")]
    UnsupportedShape(Vec<usize>),
}

/// Serialize the embedding values as a 1-D `<f4` array.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        embedding.values.len()
    );
    // magic(6) + version(2) + len(2) + header, padded to the alignment, '\n'-terminated.
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + embedding.values.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Parse a single-vector `.npy` blob.
pub fn decode(bytes: &[u8]) -> Result<Embedding, NpyError> {
    let rest = bytes.strip_prefix(MAGIC).ok_or(NpyError::BadMagic)?;
    let (&major, rest) = rest.split_first().ok_or(NpyError::Truncated)?;
    let (&minor, rest) = rest.split_first().ok_or(NpyError::Truncated)?;

    let (header_len, rest) = match major {
        1 => {
            let len = rest.get(..2).ok_or(NpyError::Truncated)?;
            (u16::from_le_bytes([len[0], len[1]]) as usize, &rest[2..])
        }
        2 | 3 => {
            let len = rest.get(..4).ok_or(NpyError::Truncated)?;
            (
                u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize,
                &rest[4..],
            )
        }
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };

    let header = rest.get(..header_len).ok_or(NpyError::Truncated)?;
    let header = std::str::from_utf8(header)
        .map_err(|_| NpyError::BadHeader("header is not text".into()))?;
    let data = &rest[header_len..];

    let descr = header_value(header, "descr")?
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    let shape = parse_shape(header_value(header, "shape")?)?;

    let len = match shape.as_slice() {
        [n] | [1, n] | [n, 1] => *n,
        _ => return Err(NpyError::UnsupportedShape(shape)),
    };

    let values = match descr.as_str() {
        "<f4" => read_values::<4>(data, len, f32::from_le_bytes)?,
        ">f4" => read_values::<4>(data, len, f32::from_be_bytes)?,
        "<f8" => read_values::<8>(data, len, |b| f64::from_le_bytes(b) as f32)?,
        ">f8" => read_values::<8>(data, len, |b| f64::from_be_bytes(b) as f32)?,
        other => return Err(NpyError::UnsupportedDtype(other.to_string())),
    };

    Ok(Embedding::new(values))
}

fn read_values<const N: usize>(
    data: &[u8],
    len: usize,
    convert: impl Fn([u8; N]) -> f32,
) -> Result<Vec<f32>, NpyError> {
    let needed = len.checked_mul(N).ok_or(NpyError::Truncated)?;
    let data = data.get(..needed).ok_or(NpyError::Truncated)?;
    Ok(data
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            convert(buf)
        })
        .collect())
}

/// Raw text of `'key': <value>` in the header dict, up to the next top-level comma.
fn header_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let needle = format!("'{key}':");
    let start = header
        .find(&needle)
        .ok_or_else(|| NpyError::BadHeader(format!("missing {key}")))?
        + needle.len();
    let tail = header[start..].trim_start();

    let mut depth = 0usize;
    let end = tail
        .char_indices()
        .find(|&(_, c)| match c {
            '(' => {
                depth += 1;
                false
            }
            ')' => {
                depth = depth.saturating_sub(1);
                false
            }
            ',' | '}' => depth == 0,
            _ => false,
        })
        .map(|(i, _)| i)
        .unwrap_or(tail.len());

    Ok(tail[..end].trim())
}

fn parse_shape(raw: &str) -> Result<Vec<usize>, NpyError> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| NpyError::BadHeader(format!("shape {raw:?}")))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| NpyError::BadHeader(format!("shape {raw:?}")))
        })
        .collect()
}
