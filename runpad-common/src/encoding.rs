//! Transport encoding for binary artifacts.
//!
//! Artifacts travel through JSON as standard base64 text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encode raw artifact bytes for transport.
pub fn encode_artifact(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode an artifact previously produced by [`encode_artifact`].
pub fn decode_artifact(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text.trim())
}
