//! Wire types of the Docker plugin protocol.
//!
//! Field names follow the protocol's PascalCase convention; unknown request
//! fields are ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.1+json";

pub const IMPLEMENTS_VOLUME_DRIVER: &str = "VolumeDriver";
pub const IMPLEMENTS_SECRET_PROVIDER: &str = "secretprovider";

#[derive(Debug, Clone, Serialize)]
pub struct PluginManifest {
    #[serde(rename = "Implements")]
    pub implements: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Opts", default)]
    pub opts: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct VolumeInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    #[serde(rename = "Volumes")]
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    #[serde(rename = "Volume")]
    pub volume: VolumeInfo,
}

#[derive(Debug, Serialize)]
pub struct PathResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

#[derive(Debug, Serialize)]
pub struct MountResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Capabilities")]
    pub capabilities: Capability,
}

#[derive(Debug, Serialize)]
pub struct Capability {
    #[serde(rename = "Scope")]
    pub scope: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

#[derive(Debug, Deserialize)]
pub struct GetSecretRequest {
    #[serde(rename = "SecretName")]
    pub secret_name: String,
    #[serde(rename = "SecretLabels", default)]
    pub secret_labels: HashMap<String, String>,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "ServiceLabels", default)]
    pub service_labels: HashMap<String, String>,
}

/// Secret value on the wire; `Value` is base64 like any JSON byte payload.
#[derive(Debug, Serialize)]
pub struct GetSecretResponse {
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "DoNotReuse")]
    pub do_not_reuse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_decodes_opts() {
        let req: CreateRequest = serde_json::from_str(
            r#"{"Name":"db@2","Opts":{"engine-type":"kv","kv-engine-version":"2"}}"#,
        )
        .unwrap();
        assert_eq!(req.name, "db@2");
        assert_eq!(req.opts["engine-type"], "kv");
    }

    #[test]
    fn create_request_opts_default_to_empty() {
        let req: CreateRequest = serde_json::from_str(r#"{"Name":"db"}"#).unwrap();
        assert!(req.opts.is_empty());
    }

    #[test]
    fn unknown_request_fields_are_ignored() {
        let req: MountRequest =
            serde_json::from_str(r#"{"Name":"db","ID":"abc","Future":true}"#).unwrap();
        assert_eq!(req.id, "abc");
    }

    #[test]
    fn list_response_uses_protocol_casing() {
        let resp = ListResponse {
            volumes: vec![VolumeInfo {
                name: "db".to_string(),
                mountpoint: "/var/lib/docker-volumes/secretfs/db".to_string(),
            }],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"Volumes":[{"Name":"db","Mountpoint":"/var/lib/docker-volumes/secretfs/db"}]}"#
        );
    }

    #[test]
    fn error_response_shape() {
        let json = serde_json::to_string(&ErrorResponse {
            err: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"Err":"boom"}"#);
    }

    #[test]
    fn manifest_shape() {
        let json = serde_json::to_string(&PluginManifest {
            implements: vec![IMPLEMENTS_VOLUME_DRIVER, IMPLEMENTS_SECRET_PROVIDER],
        })
        .unwrap();
        assert_eq!(json, r#"{"Implements":["VolumeDriver","secretprovider"]}"#);
    }

    #[test]
    fn get_secret_request_decodes_labels() {
        let req: GetSecretRequest = serde_json::from_str(
            r#"{"SecretName":"db-password","SecretLabels":{"engine-type":"kv"},"ServiceName":"api"}"#,
        )
        .unwrap();
        assert_eq!(req.secret_name, "db-password");
        assert_eq!(req.secret_labels["engine-type"], "kv");
        assert_eq!(req.service_name, "api");
    }
}
