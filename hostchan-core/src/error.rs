//! Error types for the hostchan core crate.

use std::fmt;

/// Top-level error type for hostchan-core operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// Cryptographic operation failed.
    Crypto(CryptoError),
    /// Wire encoding or decoding failed.
    Codec(CodecError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Crypto(e) => write!(f, "crypto error: {}", e),
            CoreError::Codec(e) => write!(f, "codec error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        CoreError::Crypto(e)
    }
}

impl From<CodecError> for CoreError {
    fn from(e: CodecError) -> Self {
        CoreError::Codec(e)
    }
}

/// Errors related to cryptographic operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// The signature is malformed.
    InvalidSignature,
    /// The public key is malformed.
    InvalidPublicKey,
    /// The secret key is malformed.
    InvalidSecretKey,
    /// Signature verification failed.
    SignatureVerificationFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidSignature => write!(f, "invalid signature format"),
            CryptoError::InvalidPublicKey => write!(f, "invalid public key format"),
            CryptoError::InvalidSecretKey => write!(f, "invalid secret key format"),
            CryptoError::SignatureVerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Errors related to wire message encoding and decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Message payload ended before all fields could be read.
    UnexpectedEnd,
    /// The message tag is not part of the hosted-channel message set.
    UnknownTag(u16),
    /// A field carried a value the codec cannot represent.
    InvalidField(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEnd => write!(f, "message truncated"),
            CodecError::UnknownTag(tag) => write!(f, "unknown message tag: {}", tag),
            CodecError::InvalidField(name) => write!(f, "invalid field: {}", name),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> Self {
        CodecError::UnexpectedEnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CoreError::Crypto(CryptoError::InvalidSignature);
        assert!(e.to_string().contains("invalid signature"));

        let e = CoreError::Codec(CodecError::UnknownTag(12345));
        assert!(e.to_string().contains("12345"));
    }

    #[test]
    fn test_error_conversion() {
        let codec_err = CodecError::UnexpectedEnd;
        let core_err: CoreError = codec_err.into();
        assert!(matches!(core_err, CoreError::Codec(CodecError::UnexpectedEnd)));
    }
}
