use crate::error::ParseError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Identity of an update: provider, name and version, all non-empty.
///
/// Two update ids are equal iff all three fields are equal.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateId {
    pub provider: String,
    pub name: String,
    pub version: String,
}

impl UpdateId {
    pub fn new(
        provider: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        UpdateId {
            provider: provider.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.provider.is_empty() || self.name.is_empty() || self.version.is_empty() {
            return Err(ParseError::BadFormat {
                reason: format!("update id with an empty field: {self}"),
            });
        }
        Ok(())
    }

    /// The canonical string form reported to the cloud as `installedUpdateId`.
    pub fn serialized(&self) -> String {
        serde_json::json!({
            "provider": self.provider,
            "name": self.name,
            "version": self.version,
        })
        .to_string()
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.provider, self.name, self.version)
    }
}
