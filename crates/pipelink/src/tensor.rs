//! Tensor payload inspection.
//!
//! Payloads are NumPy `.npy` buffers. The router reads only the header to
//! check the shape; the data section is forwarded untouched.
//!
//! Header layout:
//! - magic `\x93NUMPY`, then major/minor version bytes
//! - v1: u16 little-endian header length; v2/v3: u32 little-endian
//! - a Python dict literal, e.g. `{'descr': '<f4', 'fortran_order': False, 'shape': (3, 10), }`

use std::fmt;
use std::str::FromStr;

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("payload is not an .npy buffer (bad magic)")]
    BadMagic,

    #[error("unsupported .npy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("payload truncated: {0}")]
    Truncated(&'static str),

    #[error("malformed .npy header: {0}")]
    Header(String),

    #[error("data section is {actual} bytes, shape needs {expected}")]
    DataLength { expected: usize, actual: usize },

    #[error("invalid dimension list {0:?}")]
    Dims(String),
}

/// Parsed `.npy` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Offset of the data section within the payload.
    pub data_offset: usize,
}

impl TensorHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, TensorError> {
        if payload.len() < MAGIC.len() + 2 || &payload[..MAGIC.len()] != MAGIC {
            return Err(TensorError::BadMagic);
        }
        let major = payload[6];
        let minor = payload[7];

        let (header_len, header_start) = match major {
            1 => {
                let bytes = payload
                    .get(8..10)
                    .ok_or(TensorError::Truncated("header length"))?;
                (u16::from_le_bytes([bytes[0], bytes[1]]) as usize, 10)
            }
            2 | 3 => {
                let bytes = payload
                    .get(8..12)
                    .ok_or(TensorError::Truncated("header length"))?;
                let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                (len as usize, 12)
            }
            _ => return Err(TensorError::UnsupportedVersion(major, minor)),
        };

        let data_offset = header_start + header_len;
        let raw = payload
            .get(header_start..data_offset)
            .ok_or(TensorError::Truncated("header"))?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| TensorError::Header("header is not valid text".to_string()))?;

        let descr = quoted_value(text, "descr")?;
        let fortran_order = match raw_value(text, "fortran_order")? {
            v if v.starts_with("True") => true,
            v if v.starts_with("False") => false,
            v => return Err(TensorError::Header(format!("bad fortran_order {v:?}"))),
        };
        let shape = shape_value(text)?;

        Ok(Self {
            descr,
            fortran_order,
            shape,
            data_offset,
        })
    }

    /// Bytes per element, when the dtype has a fixed width (`<f4` -> 4).
    pub fn item_size(&self) -> Option<usize> {
        let digits: String = self
            .descr
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    /// `None` when the shape's product does not fit in `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
    }

    /// Trailing (feature) dimensions, everything after the batch dimension.
    pub fn feature_dims(&self) -> &[usize] {
        self.shape.get(1..).unwrap_or(&[])
    }
}

/// Find `'key':` in the dict literal and return the text right after it.
fn raw_value<'a>(text: &'a str, key: &str) -> Result<&'a str, TensorError> {
    let needle = format!("'{key}':");
    let start = text
        .find(&needle)
        .ok_or_else(|| TensorError::Header(format!("missing '{key}'")))?;
    Ok(text[start + needle.len()..].trim_start())
}

fn quoted_value(text: &str, key: &str) -> Result<String, TensorError> {
    let rest = raw_value(text, key)?;
    let quote = rest
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| TensorError::Header(format!("'{key}' is not a string")))?;
    let body = &rest[1..];
    let end = body
        .find(quote)
        .ok_or_else(|| TensorError::Header(format!("unterminated '{key}'")))?;
    Ok(body[..end].to_string())
}

fn shape_value(text: &str) -> Result<Vec<usize>, TensorError> {
    let rest = raw_value(text, "shape")?;
    if !rest.starts_with('(') {
        return Err(TensorError::Header("'shape' is not a tuple".to_string()));
    }
    let end = rest
        .find(')')
        .ok_or_else(|| TensorError::Header("unterminated 'shape'".to_string()))?;
    rest[1..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        // numpy may write longs as `3L` in old headers
        .map(|s| s.trim_end_matches('L').parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TensorError::Header(format!("bad shape entry: {e}")))
}

/// Parse and check that the data section covers the declared shape.
pub fn inspect(payload: &[u8]) -> Result<TensorHeader, TensorError> {
    let header = TensorHeader::parse(payload)?;
    let count = header
        .element_count()
        .ok_or_else(|| TensorError::Header("shape overflows".to_string()))?;
    if let Some(item) = header.item_size() {
        let expected = count
            .checked_mul(item)
            .ok_or_else(|| TensorError::Header("shape overflows".to_string()))?;
        let actual = payload.len() - header.data_offset;
        if actual < expected {
            return Err(TensorError::DataLength { expected, actual });
        }
    }
    Ok(header)
}

/// Expected trailing dimensions of every ingress payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputShape(Vec<usize>);

impl InputShape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Leading dimension is free; everything after it must match exactly.
    pub fn accepts(&self, header: &TensorHeader) -> bool {
        !header.shape.is_empty() && header.feature_dims() == self.0.as_slice()
    }
}

impl FromStr for InputShape {
    type Err = TensorError;

    /// Accepts `10`, `3,224,224`, `(3, 224, 224)` or `[3, 224]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .trim_start_matches(['(', '['])
            .trim_end_matches([')', ']']);
        let dims = inner
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| d.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| TensorError::Dims(s.to_string()))?;
        Ok(Self(dims))
    }
}

impl fmt::Display for InputShape {
    /// Python tuple notation, matching the `.npy` header.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "({single},)"),
            dims => {
                let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

/// Build an `.npy` v1 buffer. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn npy_bytes(descr: &str, shape: &[usize], data: &[u8]) -> Vec<u8> {
    let shape_text = match shape {
        [single] => format!("({single},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header =
        format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape_text}, }}");
    // pad so magic + version + len + header is a multiple of 64, ending in '\n'
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + data.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}
