//! Decoding of inline file content.

use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use thiserror::Error;

use crate::model::InlineContent;

/// Errors from decoding inline content.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid gzip data: {0}")]
    Gzip(#[source] std::io::Error),
}

impl InlineContent {
    /// Inline content with the given encoding.
    pub fn new(encoding: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            encoding: encoding.into(),
            data: data.into(),
        }
    }

    /// Decode the data into the bytes that end up on disk.
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        match self.encoding.as_str() {
            "" => Ok(self.data.clone().into_bytes()),
            "b64" | "base64" => Ok(STANDARD.decode(strip_whitespace(&self.data))?),
            "gzip+b64" | "gzip+base64" => {
                let compressed = STANDARD.decode(strip_whitespace(&self.data))?;
                let mut decoded = Vec::new();
                GzDecoder::new(compressed.as_slice())
                    .read_to_end(&mut decoded)
                    .map_err(DecodeError::Gzip)?;
                Ok(decoded)
            }
            other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Base64 payloads are frequently line-wrapped.
fn strip_whitespace(data: &str) -> String {
    data.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}
