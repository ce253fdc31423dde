use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceRegistry points the controller at an external service registry
/// whose services should be mirrored into the mesh as ServiceEntries
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "registry.datum.net",
    version = "v1alpha1",
    kind = "ServiceRegistry",
    plural = "serviceregistries",
    namespaced,
    derive = "Default",
    status = "ServiceRegistryStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
)]
pub struct ServiceRegistrySpec {
    /// Registry type: "consul" or "nacos"
    #[serde(rename = "type")]
    pub registry_type: String,

    /// Registry specific configuration, validated by the controller
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: serde_json::Value,
}

/// Status of a ServiceRegistry
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistryStatus {
    /// Whether the registry was started or reloaded successfully
    #[serde(default)]
    pub ready: bool,

    /// Error reported by the last reconciliation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec the status describes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Time the registry was last started or reloaded successfully
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
