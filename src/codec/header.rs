//! `.npy` header dictionary rendering and parsing.

use super::{CodecError, Dtype};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NpyHeader {
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl NpyHeader {
    /// Dict literal without padding or trailing newline
    pub fn render(&self) -> String {
        format!(
            "{{'descr': '{}', 'fortran_order': {}, 'shape': {}, }}",
            self.dtype.descr(),
            if self.fortran_order { "True" } else { "False" },
            shape_tuple(&self.shape)
        )
    }

    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let text = text.trim_end_matches(['\n', ' ', '\0']).trim();
        if !text.starts_with('{') || !text.ends_with('}') {
            return Err(malformed("header is not a dict literal"));
        }

        let descr = quoted(value_after(text, "descr")?)?;
        let dtype = Dtype::from_descr(descr)?;

        let fortran = value_after(text, "fortran_order")?;
        let fortran_order = if fortran.starts_with("True") {
            true
        } else if fortran.starts_with("False") {
            false
        } else {
            return Err(malformed("fortran_order is not a bool"));
        };

        let shape = parse_shape(value_after(text, "shape")?)?;

        Ok(Self {
            dtype,
            fortran_order,
            shape,
        })
    }
}

fn malformed(msg: &str) -> CodecError {
    CodecError::MalformedHeader(msg.to_string())
}

/// Python tuple literal: `(3,)` for one axis, `(3, 4)` otherwise
fn shape_tuple(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Text following `'key':`, leading whitespace removed
fn value_after<'a>(text: &'a str, key: &str) -> Result<&'a str, CodecError> {
    let single = format!("'{key}'");
    let double = format!("\"{key}\"");
    let (pos, len) = text
        .find(&single)
        .map(|p| (p, single.len()))
        .or_else(|| text.find(&double).map(|p| (p, double.len())))
        .ok_or_else(|| CodecError::MalformedHeader(format!("missing key '{key}'")))?;

    let rest = text[pos + len..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| CodecError::MalformedHeader(format!("missing ':' after '{key}'")))?;
    Ok(rest.trim_start())
}

/// Contents of a leading quoted string
fn quoted(text: &str) -> Result<&str, CodecError> {
    let quote = text
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| malformed("descr is not a string"))?;
    let body = &text[1..];
    let end = body
        .find(quote)
        .ok_or_else(|| malformed("unterminated descr string"))?;
    Ok(&body[..end])
}

fn parse_shape(text: &str) -> Result<Vec<usize>, CodecError> {
    let body = text
        .strip_prefix('(')
        .ok_or_else(|| malformed("shape is not a tuple"))?;
    let end = body
        .find(')')
        .ok_or_else(|| malformed("unterminated shape tuple"))?;

    body[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            // Older writers emit Python 2 longs such as `455L`.
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| CodecError::MalformedHeader(format!("bad shape entry '{s}'")))
        })
        .collect()
}
