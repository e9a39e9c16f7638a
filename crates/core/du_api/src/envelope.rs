use crate::error::ParseError;
use crate::manifest::FileId;
use crate::manifest::UpdateManifest;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Action requested by the control plane, numeric on the wire.
///
/// `ProcessDeployment` and `Cancel` are authoritative; the explicit-phase
/// actions are accepted as backward-compatible single-phase drivers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DesiredAction {
    Download,
    Install,
    Apply,
    ProcessDeployment,
    Cancel,
}

impl DesiredAction {
    pub fn value(self) -> u64 {
        match self {
            DesiredAction::Download => 0,
            DesiredAction::Install => 1,
            DesiredAction::Apply => 2,
            DesiredAction::ProcessDeployment => 3,
            DesiredAction::Cancel => 255,
        }
    }

    pub fn is_legacy_phase(self) -> bool {
        matches!(
            self,
            DesiredAction::Download | DesiredAction::Install | DesiredAction::Apply
        )
    }
}

impl TryFrom<u64> for DesiredAction {
    type Error = ParseError;

    fn try_from(value: u64) -> Result<Self, ParseError> {
        match value {
            0 => Ok(DesiredAction::Download),
            1 => Ok(DesiredAction::Install),
            2 => Ok(DesiredAction::Apply),
            3 => Ok(DesiredAction::ProcessDeployment),
            255 => Ok(DesiredAction::Cancel),
            other => Err(ParseError::bad_format(format!(
                "unknown workflow action {other}"
            ))),
        }
    }
}

impl fmt::Display for DesiredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DesiredAction::Download => "download",
            DesiredAction::Install => "install",
            DesiredAction::Apply => "apply",
            DesiredAction::ProcessDeployment => "processDeployment",
            DesiredAction::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

impl Serialize for DesiredAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.value())
    }
}

impl<'de> Deserialize<'de> for DesiredAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)
            .map_err(|_| de::Error::custom("workflow action is not a number"))?;
        DesiredAction::try_from(value).map_err(de::Error::custom)
    }
}

/// The `workflow` object of an envelope: what to do and under which id.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProperties {
    pub action: DesiredAction,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timestamp: Option<String>,
}

/// The outer property payload delivered by the control plane: a serialized
/// manifest, its detached signature, and the download urls of the files the
/// manifest declares.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActionEnvelope {
    pub workflow: WorkflowProperties,
    #[serde(default)]
    pub update_manifest: String,
    #[serde(default)]
    pub update_manifest_signature: String,
    #[serde(default)]
    pub file_urls: HashMap<FileId, String>,
}

impl UpdateActionEnvelope {
    /// Parse the envelope from the raw desired-property value.
    ///
    /// Only a JSON object is accepted at the root; a missing or non-numeric
    /// `workflow.action` is `BadFormat`.
    pub fn from_json_value(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject);
        }
        let envelope: UpdateActionEnvelope = serde_json::from_value(value.clone())?;
        if envelope.workflow.id.is_empty() {
            return Err(ParseError::bad_format("workflow id is empty"));
        }
        Ok(envelope)
    }

    pub fn from_json_str(payload: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(payload)?;
        UpdateActionEnvelope::from_json_value(&value)
    }

    /// Re-parse the serialized inner manifest.
    pub fn manifest(&self) -> Result<UpdateManifest, ParseError> {
        if self.update_manifest.is_empty() {
            return Err(ParseError::bad_format("envelope without an update manifest"));
        }
        UpdateManifest::from_json_str(&self.update_manifest)
    }

    pub fn action(&self) -> DesiredAction {
        self.workflow.action
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }
}

/// The envelope as echoed back in a property acknowledgement: the signature
/// and the file urls are stripped to keep the reported document bounded.
pub fn ack_echo(envelope: &Value) -> Value {
    let mut echo = envelope.clone();
    if let Some(fields) = echo.as_object_mut() {
        fields.remove("updateManifestSignature");
        fields.remove("fileUrls");
    }
    echo
}
