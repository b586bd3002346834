use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EventId;

/// Platform status code meaning the report or request was accepted
pub const REPORT_SUCCESS: u16 = 200;

/// `result_code` of a successful upgrade
pub const UPGRADE_SUCCESS: i32 = 0;

/// `result_code` of a failed upgrade
pub const UPGRADE_FAILURE: i32 = -1;

/// Envelope metadata shared by every event
///
/// Carried next to the payload on the wire rather than inside `paras`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMeta {
    pub event_id: EventId,
    pub event_time: Option<DateTime<Utc>>,
    /// Target device when reporting on behalf of a sub-device
    pub object_device_id: Option<String>,
}

impl EventMeta {
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            event_time: None,
            object_device_id: None,
        }
    }

    /// Stamp the current time
    pub fn now(mut self) -> Self {
        self.event_time = Some(Utc::now());
        self
    }

    pub fn for_device(mut self, object_device_id: Option<String>) -> Self {
        self.object_device_id = object_device_id;
        self
    }
}

/// A module's identity and version, as reported to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersionInfo {
    #[serde(skip)]
    pub meta: EventMeta,
    pub module: String,
    pub version: String,
}

impl ModuleVersionInfo {
    pub fn new(module: impl Into<String>, version: impl Into<String>, meta: EventMeta) -> Self {
        Self {
            meta,
            module: module.into(),
            version: version.into(),
        }
    }
}

/// Active request asking whether an upgrade package is available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    #[serde(skip)]
    pub meta: EventMeta,
    pub module: String,
}

impl PackageRequest {
    pub fn new(module: impl Into<String>, meta: EventMeta) -> Self {
        Self {
            meta,
            module: module.into(),
        }
    }
}

/// Server-provided package descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeParameters {
    pub url: String,

    #[serde(default)]
    pub sign: String,

    /// Digest scheme for `sign`, e.g. "SHA256". Absent means no verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_method: Option<String>,

    pub module: String,

    pub version: String,

    /// Name to store the package under; defaults to the URL's last segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Expected package size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Outcome of one upgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    #[serde(skip)]
    pub meta: EventMeta,
    pub result_code: i32,
    pub progress: u8,
    pub module: String,
    pub description: String,
}

impl UpgradeStatus {
    pub fn success(module: impl Into<String>, meta: EventMeta) -> Self {
        Self {
            meta,
            result_code: UPGRADE_SUCCESS,
            progress: 100,
            module: module.into(),
            description: "success".to_string(),
        }
    }

    pub fn failure(module: impl Into<String>, meta: EventMeta, reason: &str) -> Self {
        Self {
            meta,
            result_code: UPGRADE_FAILURE,
            progress: 100,
            module: module.into(),
            description: format!("failed: {}", reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code == UPGRADE_SUCCESS
    }
}

/// Platform answer attached to acknowledgements and package offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResult {
    pub code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ReportResult {
    pub fn ok() -> Self {
        Self {
            code: REPORT_SUCCESS,
            error_detail: None,
        }
    }

    pub fn error(code: u16, detail: impl Into<String>) -> Self {
        Self {
            code,
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == REPORT_SUCCESS
    }

    /// Convert into a `ReportRejected` error when the code is not 200
    pub fn into_result(self) -> crate::Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(crate::Error::rejected(self.code, self.error_detail.as_deref()))
        }
    }
}

/// Answer to a `PackageRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOffer {
    pub report_result: ReportResult,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_paras: Option<UpgradeParameters>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_constructors() {
        let meta = EventMeta::new(EventId::new("E1"));
        let ok = UpgradeStatus::success("mcu", meta.clone());
        assert_eq!(ok.result_code, 0);
        assert_eq!(ok.progress, 100);
        assert!(ok.is_success());

        let failed = UpgradeStatus::failure("mcu", meta, "digest mismatch");
        assert_ne!(failed.result_code, 0);
        assert!(failed.description.contains("digest mismatch"));
    }

    #[test]
    fn test_report_result_into_result() {
        assert!(ReportResult::ok().into_result().is_ok());

        let err = ReportResult::error(404, "no package")
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("no package"));
    }

    #[test]
    fn test_upgrade_parameters_optional_fields() {
        let json = r#"{"url":"http://x/pkg.bin","module":"mcu","version":"v2"}"#;
        let params: UpgradeParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.sign, "");
        assert!(params.sign_method.is_none());
        assert!(params.file_name.is_none());
        assert!(params.file_size.is_none());
    }

    #[test]
    fn test_upgrade_parameters_file_hints() {
        let json = r#"{"url":"http://x/dl?id=7","module":"mcu","version":"v2",
            "file_name":"mcu-v2.bin","file_size":4096}"#;
        let params: UpgradeParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.file_name.as_deref(), Some("mcu-v2.bin"));
        assert_eq!(params.file_size, Some(4096));

        let encoded = serde_json::to_value(&params).unwrap();
        assert_eq!(encoded["file_size"], 4096);
    }
}
