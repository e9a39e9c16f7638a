use crate::result::extended_code;

/// Malformed input: JSON parse failure, a missing required field or a value
/// of the wrong type.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("The envelope root is not a JSON object")]
    NotAnObject,

    #[error("Invalid deployment document: {reason}")]
    BadFormat { reason: String },
}

impl ParseError {
    pub fn bad_format(reason: impl Into<String>) -> Self {
        ParseError::BadFormat {
            reason: reason.into(),
        }
    }

    pub fn extended_code(&self) -> u32 {
        extended_code::BAD_FORMAT
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::BadFormat {
            reason: err.to_string(),
        }
    }
}

/// Outcome of validating the detached signature over an update manifest.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    #[error("The manifest digest does not match the hash declared by its signature")]
    ManifestHashMismatch,

    #[error(transparent)]
    BadFormat(#[from] ParseError),
}

impl VerifyError {
    pub fn signature_invalid(reason: impl Into<String>) -> Self {
        VerifyError::SignatureInvalid {
            reason: reason.into(),
        }
    }

    pub fn extended_code(&self) -> u32 {
        match self {
            VerifyError::SignatureInvalid { .. } => extended_code::SIGNATURE_INVALID,
            VerifyError::ManifestHashMismatch => extended_code::MANIFEST_HASH_MISMATCH,
            VerifyError::BadFormat(err) => err.extended_code(),
        }
    }
}
