//! Narrow string encodings

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config;
use crate::error::{config_error, Error, Result};

/// Converts between Rust strings and narrow native bytes (no terminator)
pub trait StringEncoding: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn encode(&self, value: &str) -> Result<Vec<u8>>;

    /// Decoding never fails; unmappable input is replaced
    fn decode(&self, bytes: &[u8]) -> String;

    /// Upper bound of encoded bytes per `char`, used to size scratch buffers
    fn max_bytes_per_char(&self) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8;

impl StringEncoding for Utf8 {
    fn name(&self) -> &'static str {
        "utf-8"
    }

    fn encode(&self, value: &str) -> Result<Vec<u8>> {
        reject_nul(value)?;
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn max_bytes_per_char(&self) -> usize {
        4
    }
}

/// ISO-8859-1: one byte per code point up to U+00FF
#[derive(Debug, Default, Clone, Copy)]
pub struct Latin1;

impl StringEncoding for Latin1 {
    fn name(&self) -> &'static str {
        "latin-1"
    }

    fn encode(&self, value: &str) -> Result<Vec<u8>> {
        reject_nul(value)?;
        value
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c))
                    .map_err(|_| Error::Encoding(format!("'{c}' is not representable in latin-1")))
            })
            .collect()
    }

    fn decode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| char::from(b)).collect()
    }

    fn max_bytes_per_char(&self) -> usize {
        1
    }
}

fn reject_nul(value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::Encoding("string contains an interior NUL".to_string()));
    }
    Ok(())
}

/// Look up an encoding by name
pub fn encoding_by_name(name: &str) -> Result<Arc<dyn StringEncoding>> {
    match name.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Ok(Arc::new(Utf8)),
        "latin-1" | "latin1" | "iso-8859-1" => Ok(Arc::new(Latin1)),
        other => Err(config_error!("unknown string encoding '{other}'")),
    }
}

static DEFAULT_ENCODING: Lazy<Arc<dyn StringEncoding>> = Lazy::new(|| {
    let name = &config::current().strings.encoding;
    encoding_by_name(name).unwrap_or_else(|err| {
        tracing::warn!(encoding = %name, error = %err, "falling back to utf-8");
        Arc::new(Utf8)
    })
});

/// The configured narrow string encoding
pub fn default_encoding() -> Arc<dyn StringEncoding> {
    DEFAULT_ENCODING.clone()
}
