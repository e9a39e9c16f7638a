use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::collections::HashMap;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/adu";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/adu";
pub const CONFIG_FILE_NAME: &str = "du-config.json";

const SUPPORTED_SCHEMA_VERSION: &str = "1.1";
const DEFAULT_COMPAT_PROPERTY_NAMES: &str = "manufacturer,model";

/// Identifier of the property contract spoken with the control plane.
pub const CONTRACT_MODEL_ID: &str = "dtmi:azure:iot:deviceUpdateContractModel;2";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    FromIo {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    FromJson {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Unsupported configuration schema version {version:?}, expected {SUPPORTED_SCHEMA_VERSION:?}")]
    UnsupportedSchemaVersion { version: String },

    #[error("The configuration declares no agent")]
    NoAgent,

    #[error("The configuration declares no {property} for the device")]
    MissingDeviceProperty { property: &'static str },
}

/// `du-config.json`, schema 1.1.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuConfig {
    pub schema_version: String,
    #[serde(default)]
    pub adu_shell_trusted_users: Vec<String>,
    #[serde(default)]
    pub iot_hub_protocol: Option<String>,
    #[serde(default)]
    pub compat_property_names: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub name: String,
    #[serde(default)]
    pub runas: Option<String>,
    pub connection_source: ConnectionSource,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub additional_device_properties: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSource {
    pub connection_type: String,
    pub connection_data: String,
}

/// The device identity reported in the one-shot startup message.
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    pub manufacturer: String,
    pub model: String,
    pub additional: HashMap<String, String>,
    pub compat_property_names: String,
    pub contract_model_id: &'static str,
    pub agent_version: &'static str,
}

impl DuConfig {
    pub async fn load(config_dir: &Utf8Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        let content = tokio::fs::read(&path)
            .await
            .map_err(|source| ConfigError::FromIo {
                path: path.clone(),
                source,
            })?;
        let config: DuConfig = serde_json::from_slice(&content)
            .map_err(|source| ConfigError::FromJson { path, source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchemaVersion {
                version: self.schema_version.clone(),
            });
        }
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgent);
        }
        self.device_properties().map(|_| ())
    }

    /// The effective device identity: the first agent entry wins over the
    /// top-level values.
    pub fn device_properties(&self) -> Result<DeviceProperties, ConfigError> {
        let agent = self.agents.first().ok_or(ConfigError::NoAgent)?;
        let manufacturer = agent
            .manufacturer
            .clone()
            .or_else(|| self.manufacturer.clone())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingDeviceProperty {
                property: "manufacturer",
            })?;
        let model = agent
            .model
            .clone()
            .or_else(|| self.model.clone())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingDeviceProperty { property: "model" })?;

        Ok(DeviceProperties {
            manufacturer,
            model,
            additional: agent.additional_device_properties.clone().unwrap_or_default(),
            compat_property_names: self
                .compat_property_names
                .clone()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_COMPAT_PROPERTY_NAMES.to_string()),
            contract_model_id: CONTRACT_MODEL_ID,
            agent_version: env!("CARGO_PKG_VERSION"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "schemaVersion": "1.1",
            "aduShellTrustedUsers": ["adu"],
            "iotHubProtocol": "mqtt",
            "manufacturer": "contoso",
            "model": "toaster",
            "agents": [{
                "name": "main",
                "runas": "adu",
                "connectionSource": {"connectionType": "string", "connectionData": "HostName=..."},
                "additionalDeviceProperties": {"location": "basement"}
            }]
        })
    }

    async fn load_config(value: serde_json::Value) -> Result<DuConfig, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        tokio::fs::write(config_dir.join(CONFIG_FILE_NAME), value.to_string())
            .await
            .unwrap();
        DuConfig::load(&config_dir).await
    }

    #[tokio::test]
    async fn loads_a_valid_configuration() {
        let config = load_config(config_json()).await.unwrap();
        let device = config.device_properties().unwrap();
        assert_eq!(device.manufacturer, "contoso");
        assert_eq!(device.model, "toaster");
        assert_eq!(device.compat_property_names, "manufacturer,model");
        assert_eq!(device.additional["location"], "basement");
    }

    #[tokio::test]
    async fn agent_entry_overrides_the_top_level_identity() {
        let mut value = config_json();
        value["agents"][0]["manufacturer"] = serde_json::json!("fabrikam");
        let config = load_config(value).await.unwrap();
        assert_eq!(config.device_properties().unwrap().manufacturer, "fabrikam");
    }

    #[tokio::test]
    async fn rejects_an_unknown_schema_version() {
        let mut value = config_json();
        value["schemaVersion"] = serde_json::json!("0.9");
        assert_matches!(
            load_config(value).await,
            Err(ConfigError::UnsupportedSchemaVersion { .. })
        );
    }

    #[tokio::test]
    async fn rejects_a_configuration_without_agents() {
        let mut value = config_json();
        value["agents"] = serde_json::json!([]);
        assert_matches!(load_config(value).await, Err(ConfigError::NoAgent));
    }

    #[tokio::test]
    async fn rejects_a_device_without_manufacturer() {
        let mut value = config_json();
        value.as_object_mut().unwrap().remove("manufacturer");
        assert_matches!(
            load_config(value).await,
            Err(ConfigError::MissingDeviceProperty { property: "manufacturer" })
        );
    }

    #[tokio::test]
    async fn compat_property_names_can_be_overridden() {
        let mut value = config_json();
        value["compatPropertyNames"] = serde_json::json!("manufacturer,model,location");
        let config = load_config(value).await.unwrap();
        assert_eq!(
            config.device_properties().unwrap().compat_property_names,
            "manufacturer,model,location"
        );
    }
}
