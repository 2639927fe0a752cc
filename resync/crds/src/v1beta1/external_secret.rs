use std::fmt::Display;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::READY_CONDITION;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "external-secrets.io",
    version = "v1beta1",
    kind = "ExternalSecret",
    namespaced
)]
#[kube(status = "ExternalSecretStatus")]
#[kube(printcolumn = r#"{"name":"store", "jsonPath": ".spec.secretStoreRef.name", "type": "string"}"#)]
#[kube(printcolumn = r#"{"name":"refresh interval", "jsonPath": ".spec.refreshInterval", "type": "string"}"#)]
#[kube(printcolumn = r#"{"name":"refresh time", "jsonPath": ".status.refreshTime", "type": "string"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretSpec {
    /// How often the controller refreshes the secret on its own schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_store_ref: Option<SecretStoreRef>,
}

impl ExternalSecret {
    /// Timestamp of the last reconciliation attempt the controller
    /// completed for this resource, regardless of whether it succeeded.
    pub fn refresh_time(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.refresh_time.as_deref())
    }

    pub fn ready_condition(&self) -> Option<&ExternalSecretCondition> {
        self.status
            .as_ref()
            .and_then(|status| status.ready_condition())
    }
}

impl Display for ExternalSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Unwrap safety: ExternalSecrets are namespaced and therefore always have a namespace.
        write!(
            f,
            "{}/{}",
            self.metadata.namespace.as_ref().unwrap(),
            self.name_any()
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretStatus {
    /// Bumped every time the controller finishes a reconciliation attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ExternalSecretCondition>,
}

impl ExternalSecretStatus {
    pub fn ready_condition(&self) -> Option<&ExternalSecretCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == READY_CONDITION)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSecretCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}
