//! Array Codec
//!
//! Numeric arrays are persisted in the NumPy `.npy` format so splits written
//! by this crate can be opened with `np.load` and vice versa.
//!
//! Layout (format version 1.0):
//!
//! ```text
//! \x93NUMPY | major | minor | u16 LE header len | header dict | data
//! ```
//!
//! The header is a Python dict literal, e.g.
//! `{'descr': '<f8', 'fortran_order': False, 'shape': (455, 30), }`, padded
//! with spaces and terminated by `\n` so the data starts on a 64-byte
//! boundary. Data is little-endian, C order when written by [`encode`].

mod header;


use header::NpyHeader;
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2, IxDyn, ShapeBuilder};
use std::fmt;
use thiserror::Error;

/// File magic
pub const MAGIC: &[u8; 6] = b"\x93NUMPY";

const ALIGNMENT: usize = 64;

/// Codec failures. All of them are fatal to the read or write at hand.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("not an npy payload: bad magic header")]
    BadMagic,

    #[error("unsupported npy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("payload truncated: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("malformed npy header: {0}")]
    MalformedHeader(String),

    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("data length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("degenerate array shape {0:?}")]
    Degenerate(Vec<usize>),

    #[error("expected a {expected}-d array, got shape {actual:?}")]
    RankMismatch { expected: usize, actual: Vec<usize> },

    #[error("label value {0} is not integral")]
    NonIntegralLabel(f64),
}

// ============================================================================
// Dtypes
// ============================================================================

/// Element types the codec reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Float64,
    Float32,
    Int64,
    Int32,
}

impl Dtype {
    /// Little-endian descriptor as written in the header
    pub fn descr(&self) -> &'static str {
        match self {
            Self::Float64 => "<f8",
            Self::Float32 => "<f4",
            Self::Int64 => "<i8",
            Self::Int32 => "<i4",
        }
    }

    /// Bytes per element
    pub fn size(&self) -> usize {
        match self {
            Self::Float64 | Self::Int64 => 8,
            Self::Float32 | Self::Int32 => 4,
        }
    }

    /// Parse a header descriptor. Big-endian descriptors are rejected.
    pub fn from_descr(descr: &str) -> Result<Self, CodecError> {
        let code = match descr.as_bytes().first() {
            Some(b'<') | Some(b'|') | Some(b'=') => &descr[1..],
            Some(b'>') => return Err(CodecError::UnsupportedDtype(descr.to_string())),
            _ => descr,
        };
        match code {
            "f8" => Ok(Self::Float64),
            "f4" => Ok(Self::Float32),
            "i8" => Ok(Self::Int64),
            "i4" => Ok(Self::Int32),
            _ => Err(CodecError::UnsupportedDtype(descr.to_string())),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float64 => write!(f, "float64"),
            Self::Float32 => write!(f, "float32"),
            Self::Int64 => write!(f, "int64"),
            Self::Int32 => write!(f, "int32"),
        }
    }
}

trait Element: Copy {
    const SIZE: usize;
    fn push_le(self, out: &mut Vec<u8>);
    fn from_le(chunk: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $size:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const SIZE: usize = $size;

                fn push_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn from_le(chunk: &[u8]) -> Self {
                    let mut buf = [0u8; $size];
                    buf.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element!(f64 => 8, f32 => 4, i64 => 8, i32 => 4);

// ============================================================================
// Arrays
// ============================================================================

/// A decoded array, tagged with its dtype
#[derive(Debug, Clone, PartialEq)]
pub enum NpyArray {
    Float64(ArrayD<f64>),
    Float32(ArrayD<f32>),
    Int64(ArrayD<i64>),
    Int32(ArrayD<i32>),
}

impl NpyArray {
    pub fn dtype(&self) -> Dtype {
        match self {
            Self::Float64(_) => Dtype::Float64,
            Self::Float32(_) => Dtype::Float32,
            Self::Int64(_) => Dtype::Int64,
            Self::Int32(_) => Dtype::Int32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float64(a) => a.shape(),
            Self::Float32(a) => a.shape(),
            Self::Int64(a) => a.shape(),
            Self::Int32(a) => a.shape(),
        }
    }

    /// Length of the first axis
    pub fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    fn is_degenerate(&self) -> bool {
        let shape = self.shape();
        shape.is_empty() || shape.iter().product::<usize>() == 0
    }

    /// Feature matrix view: 2-D, widened to `f64`
    pub fn into_features(self) -> Result<Array2<f64>, CodecError> {
        let widened: ArrayD<f64> = match self {
            Self::Float64(a) => a,
            Self::Float32(a) => a.mapv(f64::from),
            Self::Int64(a) => a.mapv(|v| v as f64),
            Self::Int32(a) => a.mapv(f64::from),
        };
        let shape = widened.shape().to_vec();
        widened
            .into_dimensionality::<Ix2>()
            .map_err(|_| CodecError::RankMismatch {
                expected: 2,
                actual: shape,
            })
    }

    /// Label vector view: 1-D `i64`. `(n, 1)` columns are flattened and
    /// integral floats are accepted.
    pub fn into_labels(self) -> Result<Array1<i64>, CodecError> {
        let labels: ArrayD<i64> = match self {
            Self::Int64(a) => a,
            Self::Int32(a) => a.mapv(i64::from),
            Self::Float64(a) => float_labels(a.iter().copied(), a.raw_dim())?,
            Self::Float32(a) => float_labels(a.iter().map(|v| f64::from(*v)), a.raw_dim())?,
        };
        let shape = labels.shape().to_vec();
        let labels = match shape.as_slice() {
            [_, 1] => labels.index_axis_move(Axis(1), 0),
            _ => labels,
        };
        labels
            .into_dimensionality::<Ix1>()
            .map_err(|_| CodecError::RankMismatch {
                expected: 1,
                actual: shape,
            })
    }
}

fn float_labels(
    values: impl Iterator<Item = f64>,
    dim: IxDyn,
) -> Result<ArrayD<i64>, CodecError> {
    let mut out = Vec::new();
    for v in values {
        if v.fract() != 0.0 || !v.is_finite() {
            return Err(CodecError::NonIntegralLabel(v));
        }
        out.push(v as i64);
    }
    ArrayD::from_shape_vec(dim, out).map_err(|e| CodecError::MalformedHeader(e.to_string()))
}

impl From<Array2<f64>> for NpyArray {
    fn from(a: Array2<f64>) -> Self {
        Self::Float64(a.into_dyn())
    }
}

impl From<Array1<f64>> for NpyArray {
    fn from(a: Array1<f64>) -> Self {
        Self::Float64(a.into_dyn())
    }
}

impl From<Array1<i64>> for NpyArray {
    fn from(a: Array1<i64>) -> Self {
        Self::Int64(a.into_dyn())
    }
}

impl From<ArrayD<f64>> for NpyArray {
    fn from(a: ArrayD<f64>) -> Self {
        Self::Float64(a)
    }
}

impl From<ArrayD<i64>> for NpyArray {
    fn from(a: ArrayD<i64>) -> Self {
        Self::Int64(a)
    }
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Serialize an array and its dtype/shape to `.npy` bytes
pub fn encode(array: &NpyArray) -> Result<Vec<u8>, CodecError> {
    if array.is_degenerate() {
        return Err(CodecError::Degenerate(array.shape().to_vec()));
    }

    let header = NpyHeader {
        dtype: array.dtype(),
        fortran_order: false,
        shape: array.shape().to_vec(),
    }
    .render();

    // Preamble is 10 bytes for v1.0 (u16 length), 12 for v2.0 (u32 length).
    let (major, preamble) = if header.len() + 1 + 10 <= u16::MAX as usize {
        (1u8, 10)
    } else {
        (2u8, 12)
    };
    let unpadded = preamble + header.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    let header_len = header.len() + padding + 1;

    let element_count: usize = array.shape().iter().product();
    let mut out =
        Vec::with_capacity(preamble + header_len + element_count * array.dtype().size());
    out.extend_from_slice(MAGIC);
    out.push(major);
    out.push(0);
    if major == 1 {
        out.extend_from_slice(&(header_len as u16).to_le_bytes());
    } else {
        out.extend_from_slice(&(header_len as u32).to_le_bytes());
    }
    out.extend_from_slice(header.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');

    match array {
        NpyArray::Float64(a) => write_elements(a, &mut out),
        NpyArray::Float32(a) => write_elements(a, &mut out),
        NpyArray::Int64(a) => write_elements(a, &mut out),
        NpyArray::Int32(a) => write_elements(a, &mut out),
    }
    Ok(out)
}

fn write_elements<T: Element>(array: &ArrayD<T>, out: &mut Vec<u8>) {
    // `iter` walks in logical (C) order regardless of memory layout.
    for v in array.iter() {
        v.push_le(out);
    }
}

/// Parse `.npy` bytes back into an array
pub fn decode(bytes: &[u8]) -> Result<NpyArray, CodecError> {
    if bytes.len() < MAGIC.len() {
        return Err(CodecError::Truncated {
            needed: 10,
            actual: bytes.len(),
        });
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    if bytes.len() < 10 {
        return Err(CodecError::Truncated {
            needed: 10,
            actual: bytes.len(),
        });
    }

    let (major, minor) = (bytes[6], bytes[7]);
    let (header_start, header_len) = match major {
        1 => (10, u16::from_le_bytes([bytes[8], bytes[9]]) as usize),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(CodecError::Truncated {
                    needed: 12,
                    actual: bytes.len(),
                });
            }
            (
                12,
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            )
        }
        _ => return Err(CodecError::UnsupportedVersion(major, minor)),
    };

    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(CodecError::Truncated {
            needed: data_start,
            actual: bytes.len(),
        });
    }
    let header_text = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|e| CodecError::MalformedHeader(e.to_string()))?;
    let header = NpyHeader::parse(header_text)?;

    let element_count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| CodecError::MalformedHeader(format!("shape {:?} overflows", header.shape)))?;
    if header.shape.is_empty() || element_count == 0 {
        return Err(CodecError::Degenerate(header.shape));
    }

    let data = &bytes[data_start..];
    let expected = element_count
        .checked_mul(header.dtype.size())
        .ok_or_else(|| CodecError::MalformedHeader(format!("shape {:?} overflows", header.shape)))?;
    if data.len() < expected {
        return Err(CodecError::Truncated {
            needed: data_start + expected,
            actual: bytes.len(),
        });
    }
    if data.len() > expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }

    Ok(match header.dtype {
        Dtype::Float64 => NpyArray::Float64(read_elements(data, &header)?),
        Dtype::Float32 => NpyArray::Float32(read_elements(data, &header)?),
        Dtype::Int64 => NpyArray::Int64(read_elements(data, &header)?),
        Dtype::Int32 => NpyArray::Int32(read_elements(data, &header)?),
    })
}

fn read_elements<T: Element>(data: &[u8], header: &NpyHeader) -> Result<ArrayD<T>, CodecError> {
    let values: Vec<T> = data.chunks_exact(T::SIZE).map(T::from_le).collect();
    let shape = IxDyn(&header.shape).set_f(header.fortran_order);
    ArrayD::from_shape_vec(shape, values).map_err(|_| CodecError::LengthMismatch {
        expected: header.shape.iter().product::<usize>() * T::SIZE,
        actual: data.len(),
    })
}
