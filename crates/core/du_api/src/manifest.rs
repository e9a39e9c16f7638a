use crate::error::ParseError;
use crate::update_id::UpdateId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub type FileId = String;
pub type UpdateType = String;

/// A payload file declared by a manifest, keyed by its file id.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntity {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<u64>,
    /// Digests keyed by hash type, base64 encoded.
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

/// One unit of work within a manifest.
///
/// An inline step carries its payload files directly and names the content
/// handler to dispatch them to. A reference step points at a detached child
/// manifest and the compatibility set selecting the components it targets.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Inline {
        handler: UpdateType,
        handler_properties: Value,
        files: Vec<FileId>,
        installed_criteria: Option<String>,
    },
    Reference {
        detached_manifest_file_id: FileId,
        compatibility: Vec<Value>,
    },
}

impl Step {
    pub fn is_reference(&self) -> bool {
        matches!(self, Step::Reference { .. })
    }
}

/// Wire form of a step. A missing `type` means an inline step.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    step_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handler: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    handler_properties: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    files: Vec<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installed_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detached_manifest_file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    compatibility: Vec<Value>,
}

impl TryFrom<RawStep> for Step {
    type Error = ParseError;

    fn try_from(raw: RawStep) -> Result<Self, ParseError> {
        match raw.step_type.as_deref() {
            None | Some("inline") => {
                let handler = raw
                    .handler
                    .ok_or_else(|| ParseError::bad_format("inline step without a handler"))?;
                Ok(Step::Inline {
                    handler,
                    handler_properties: raw.handler_properties,
                    files: raw.files,
                    installed_criteria: raw.installed_criteria,
                })
            }
            Some("reference") => {
                let detached_manifest_file_id = raw.detached_manifest_file_id.ok_or_else(|| {
                    ParseError::bad_format("reference step without a detached manifest file id")
                })?;
                Ok(Step::Reference {
                    detached_manifest_file_id,
                    compatibility: raw.compatibility,
                })
            }
            Some(other) => Err(ParseError::bad_format(format!(
                "unknown step type {other:?}"
            ))),
        }
    }
}

impl From<&Step> for RawStep {
    fn from(step: &Step) -> Self {
        match step {
            Step::Inline {
                handler,
                handler_properties,
                files,
                installed_criteria,
            } => RawStep {
                step_type: Some("inline".to_string()),
                handler: Some(handler.clone()),
                handler_properties: handler_properties.clone(),
                files: files.clone(),
                installed_criteria: installed_criteria.clone(),
                detached_manifest_file_id: None,
                compatibility: Vec::new(),
            },
            Step::Reference {
                detached_manifest_file_id,
                compatibility,
            } => RawStep {
                step_type: Some("reference".to_string()),
                handler: None,
                handler_properties: Value::Null,
                files: Vec::new(),
                installed_criteria: None,
                detached_manifest_file_id: Some(detached_manifest_file_id.clone()),
                compatibility: compatibility.clone(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawInstructions {
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// Wire form of the signed inner manifest.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    update_type: Option<String>,
    update_id: UpdateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installed_criteria: Option<String>,
    #[serde(default)]
    compatibility: Vec<Value>,
    #[serde(default)]
    files: HashMap<FileId, FileEntity>,
    #[serde(default)]
    instructions: RawInstructions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_date_time: Option<String>,
}

/// The signed inner document of a deployment: identity, compatibility,
/// payload files and the ordered steps to drive through the handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateManifest {
    pub update_type: UpdateType,
    pub update_id: UpdateId,
    pub installed_criteria: Option<String>,
    pub compatibility: Vec<Value>,
    pub files: HashMap<FileId, FileEntity>,
    pub steps: Vec<Step>,
    pub created_timestamp: Option<String>,
}

impl UpdateManifest {
    pub fn from_json_str(manifest: &str) -> Result<Self, ParseError> {
        let raw: RawManifest = serde_json::from_str(manifest)?;
        UpdateManifest::try_from(raw)
    }

    pub fn from_json_value(manifest: Value) -> Result<Self, ParseError> {
        let raw: RawManifest = serde_json::from_value(manifest)?;
        UpdateManifest::try_from(raw)
    }

    pub fn file(&self, file_id: &str) -> Result<&FileEntity, ParseError> {
        self.files.get(file_id).ok_or_else(|| {
            ParseError::bad_format(format!("manifest references an unknown file id {file_id:?}"))
        })
    }

    /// A deployment is composite when its leaves are individually reported:
    /// more than one step, or any step targeting enumerated components.
    pub fn is_composite(&self) -> bool {
        self.steps.len() > 1 || self.steps.iter().any(Step::is_reference)
    }

    pub fn to_json_string(&self) -> String {
        let raw = RawManifest {
            update_type: Some(self.update_type.clone()),
            update_id: self.update_id.clone(),
            installed_criteria: self.installed_criteria.clone(),
            compatibility: self.compatibility.clone(),
            files: self.files.clone(),
            instructions: RawInstructions {
                steps: self.steps.iter().map(RawStep::from).collect(),
            },
            created_date_time: self.created_timestamp.clone(),
        };
        serde_json::to_value(raw)
            .map(|value| value.to_string())
            .unwrap_or_default()
    }
}

impl TryFrom<RawManifest> for UpdateManifest {
    type Error = ParseError;

    fn try_from(raw: RawManifest) -> Result<Self, ParseError> {
        raw.update_id.validate()?;
        let steps = raw
            .instructions
            .steps
            .into_iter()
            .map(Step::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        for step in &steps {
            if let Step::Reference {
                detached_manifest_file_id,
                ..
            } = step
            {
                if !raw.files.contains_key(detached_manifest_file_id) {
                    return Err(ParseError::bad_format(format!(
                        "reference step points at an undeclared file id {detached_manifest_file_id:?}"
                    )));
                }
            }
        }
        Ok(UpdateManifest {
            update_type: raw.update_type.unwrap_or_default(),
            update_id: raw.update_id,
            installed_criteria: raw.installed_criteria,
            compatibility: raw.compatibility,
            files: raw.files,
            steps,
            created_timestamp: raw.created_date_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn manifest_json() -> Value {
        json!({
            "updateType": "du/steps:1",
            "updateId": {"provider": "contoso", "name": "toaster", "version": "2.0"},
            "compatibility": [{"manufacturer": "contoso", "model": "toaster"}],
            "files": {
                "f1": {"fileName": "firmware.swu", "sizeInBytes": 1024, "hashes": {"sha256": "aGFzaA=="}},
                "f2": {"fileName": "leaf.json", "hashes": {"sha256": "bGVhZg=="}}
            },
            "instructions": {
                "steps": [
                    {"handler": "du/swupdate:1", "files": ["f1"], "handlerProperties": {"swuFile": "firmware.swu"}},
                    {"type": "reference", "detachedManifestFileId": "f2", "compatibility": [{"group": "motors"}]}
                ]
            },
            "createdDateTime": "2025-11-02T09:00:00Z"
        })
    }

    #[test]
    fn parses_steps_defaulting_to_inline() {
        let manifest = UpdateManifest::from_json_value(manifest_json()).unwrap();
        assert_eq!(manifest.steps.len(), 2);
        assert_matches!(
            &manifest.steps[0],
            Step::Inline { handler, files, .. } if handler == "du/swupdate:1" && files == &vec!["f1".to_string()]
        );
        assert_matches!(
            &manifest.steps[1],
            Step::Reference { detached_manifest_file_id, .. } if detached_manifest_file_id == "f2"
        );
    }

    #[test]
    fn inline_step_without_handler_is_rejected() {
        let mut value = manifest_json();
        value["instructions"]["steps"][0]
            .as_object_mut()
            .unwrap()
            .remove("handler");
        assert_matches!(
            UpdateManifest::from_json_value(value),
            Err(ParseError::BadFormat { .. })
        );
    }

    #[test]
    fn reference_step_must_point_at_a_declared_file() {
        let mut value = manifest_json();
        value["instructions"]["steps"][1]["detachedManifestFileId"] = json!("missing");
        assert_matches!(
            UpdateManifest::from_json_value(value),
            Err(ParseError::BadFormat { .. })
        );
    }

    #[test]
    fn single_inline_step_is_not_composite() {
        let value = json!({
            "updateType": "du/swupdate:1",
            "updateId": {"provider": "contoso", "name": "toaster", "version": "2.0"},
            "files": {"f1": {"fileName": "firmware.swu"}},
            "instructions": {"steps": [{"handler": "du/swupdate:1", "files": ["f1"]}]}
        });
        let manifest = UpdateManifest::from_json_value(value).unwrap();
        assert!(!manifest.is_composite());

        let composite = UpdateManifest::from_json_value(manifest_json()).unwrap();
        assert!(composite.is_composite());
    }

    #[test]
    fn round_trips_through_its_json_string() {
        let manifest = UpdateManifest::from_json_value(manifest_json()).unwrap();
        let reparsed = UpdateManifest::from_json_str(&manifest.to_json_string()).unwrap();
        assert_eq!(manifest, reparsed);
    }
}
