//! Typed views of control-plane responses.
//!
//! Only the fields paddock reads are modelled; everything else in the
//! payloads is ignored.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Accepts `1`, `"1"`, `true` and their negatives.
fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Accepts numbers and numeric strings (`nextid` answers with a string).
fn loose_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = Value::deserialize(d)?;
    match &v {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("not a vm id: {v}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not a vm id: {s}"))),
        _ => Err(serde::de::Error::custom(format!("not a vm id: {v}"))),
    }
}

/// An SDN zone.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ZoneInfo {
    pub zone: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub ipam: Option<String>,
    #[serde(default)]
    pub dhcp: Option<String>,
}

/// An SDN virtual network.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VnetInfo {
    pub vnet: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// A subnet attached to a vnet.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SubnetInfo {
    /// Control-plane identifier, used for deletion.
    pub id: String,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

/// One row of the IPAM status table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IpamEntry {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub vnet: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub vmid: Option<Value>,
    #[serde(default)]
    pub gateway: Option<Value>,
}

/// A cluster task as listed by `/cluster/tasks`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClusterTask {
    pub upid: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ClusterTask {
    /// A task with no status yet, or one that ended in anything but `OK`.
    pub fn is_incomplete(&self) -> bool {
        self.status.as_deref() != Some("OK")
    }
}

/// A VM as listed by `/nodes/{node}/qemu`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VmSummary {
    #[serde(deserialize_with = "loose_u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub template: bool,
    #[serde(default)]
    pub status: Option<String>,
}

impl VmSummary {
    /// Tags split on the control plane's `;` separator.
    pub fn tag_list(&self) -> Vec<&str> {
        split_tags(self.tags.as_deref().unwrap_or(""))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_list().contains(&tag)
    }
}

/// Split a tag string. Accepts `;` and `,` since both appear in the wild.
pub fn split_tags(raw: &str) -> Vec<&str> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Current power state of a VM.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VmStatus {
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
}

/// An entry of a storage content listing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Node software version.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
}

impl VersionInfo {
    /// Leading `major.minor` of the version string.
    pub fn major_minor(&self) -> Option<(u32, u32)> {
        let mut parts = self.version.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    }
}

/// Handle returned when a guest-agent command is started.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentExecStarted {
    pub pid: u64,
}

/// Progress of a guest-agent command.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentExecStatus {
    #[serde(default, deserialize_with = "flag")]
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i64>,
    #[serde(rename = "out-data", default)]
    pub out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    pub err_data: Option<String>,
}

/// Parse a `/cluster/nextid` payload, which arrives as a string or number.
pub fn parse_vm_id(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_summary_flags_and_tags() {
        let vm: VmSummary = serde_json::from_value(json!({
            "vmid": "104",
            "name": "inspect-ubuntu24.04",
            "tags": "paddock;builtin-ubuntu24.04",
            "template": 1
        }))
        .unwrap();
        assert_eq!(vm.vmid, 104);
        assert!(vm.template);
        assert!(vm.has_tag("paddock"));
        assert!(vm.has_tag("builtin-ubuntu24.04"));
        assert!(!vm.has_tag("builtin"));
    }

    #[test]
    fn test_vm_summary_defaults() {
        let vm: VmSummary = serde_json::from_value(json!({"vmid": 100})).unwrap();
        assert!(!vm.template);
        assert!(vm.tag_list().is_empty());
    }

    #[test]
    fn test_task_incomplete() {
        let running = ClusterTask { upid: "a".into(), kind: None, status: None };
        let ok = ClusterTask { upid: "b".into(), kind: None, status: Some("OK".into()) };
        let failed = ClusterTask {
            upid: "c".into(),
            kind: None,
            status: Some("command failed".into()),
        };
        assert!(running.is_incomplete());
        assert!(!ok.is_incomplete());
        assert!(failed.is_incomplete());
    }

    #[test]
    fn test_version_major_minor() {
        let v = VersionInfo { version: "9.0.3".into(), release: None };
        assert_eq!(v.major_minor(), Some((9, 0)));
        let v = VersionInfo { version: "garbage".into(), release: None };
        assert_eq!(v.major_minor(), None);
    }

    #[test]
    fn test_parse_vm_id() {
        assert_eq!(parse_vm_id(&json!("105")), Some(105));
        assert_eq!(parse_vm_id(&json!(106)), Some(106));
        assert_eq!(parse_vm_id(&json!(null)), None);
    }
}
