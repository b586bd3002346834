//! JSON wire format for module OTA events
//!
//! Every message is an envelope carrying one or more service events:
//!
//! ```json
//! {"object_device_id": "dev-1",
//!  "services": [{"service_id": "$ota", "event_type": "module_version_report",
//!                "event_id": "E1", "event_time": "20261019T101500Z",
//!                "paras": {"module": "mcu", "version": "v1.2.3"}}]}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{
    EventMeta, ModuleVersionInfo, PackageOffer, PackageRequest, ReportResult, UpgradeParameters,
    UpgradeStatus,
};
use crate::{Error, EventId, Result};

/// Service id under which all module OTA events travel
pub const OTA_SERVICE_ID: &str = "$ota";

const EVENT_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const VERSION_REPORT: &str = "module_version_report";
const PROGRESS_REPORT: &str = "module_upgrade_progress_report";
const PACKAGE_GET: &str = "module_package_get";
const VERSION_REPORT_RESPONSE: &str = "module_version_report_response";
const PROGRESS_REPORT_RESPONSE: &str = "module_upgrade_progress_report_response";
const PACKAGE_GET_RESPONSE: &str = "module_package_get_response";
const UPGRADE_NOTIFY: &str = "module_upgrade_notify";

/// Device-to-platform topic
pub fn uplink_topic(device_id: &str) -> String {
    format!("$oc/devices/{}/sys/events/up", device_id)
}

/// Platform-to-device topic
pub fn downlink_topic(device_id: &str) -> String {
    format!("$oc/devices/{}/sys/events/down", device_id)
}

pub fn format_event_time(time: &DateTime<Utc>) -> String {
    time.format(EVENT_TIME_FORMAT).to_string()
}

pub fn parse_event_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, EVENT_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_device_id: Option<String>,
    services: Vec<ServiceEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceEvent {
    service_id: String,
    event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_time: Option<String>,
    #[serde(default)]
    paras: serde_json::Value,
}

impl Envelope {
    fn wrap(meta: &EventMeta, event_type: &str, paras: serde_json::Value) -> Self {
        Self {
            object_device_id: meta.object_device_id.clone(),
            services: vec![ServiceEvent {
                service_id: OTA_SERVICE_ID.to_string(),
                event_type: event_type.to_string(),
                event_id: (!meta.event_id.is_empty()).then(|| meta.event_id.to_string()),
                event_time: meta.event_time.as_ref().map(format_event_time),
                paras,
            }],
        }
    }

    /// Split into metadata and the single OTA service event
    fn unwrap_ota(self) -> Result<(EventMeta, ServiceEvent)> {
        let object_device_id = self.object_device_id;
        let event = self
            .services
            .into_iter()
            .find(|s| s.service_id == OTA_SERVICE_ID)
            .ok_or_else(|| Error::Codec("no $ota service event in envelope".to_string()))?;

        let meta = EventMeta {
            event_id: event.event_id.clone().map(EventId::from).unwrap_or_default(),
            event_time: event.event_time.as_deref().and_then(parse_event_time),
            object_device_id,
        };

        Ok((meta, event))
    }
}

/// Messages the device publishes
#[derive(Debug, Clone, PartialEq)]
pub enum Uplink {
    VersionReport(ModuleVersionInfo),
    StatusReport(UpgradeStatus),
    PackageGet(PackageRequest),
}

impl Uplink {
    pub fn event_type(&self) -> &'static str {
        match self {
            Uplink::VersionReport(_) => VERSION_REPORT,
            Uplink::StatusReport(_) => PROGRESS_REPORT,
            Uplink::PackageGet(_) => PACKAGE_GET,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Uplink::VersionReport(v) => &v.meta,
            Uplink::StatusReport(s) => &s.meta,
            Uplink::PackageGet(p) => &p.meta,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            Uplink::VersionReport(v) => &v.module,
            Uplink::StatusReport(s) => &s.module,
            Uplink::PackageGet(p) => &p.module,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let paras = match self {
            Uplink::VersionReport(v) => serde_json::to_value(v)?,
            Uplink::StatusReport(s) => serde_json::to_value(s)?,
            Uplink::PackageGet(p) => serde_json::to_value(p)?,
        };
        let envelope = Envelope::wrap(self.meta(), self.event_type(), paras);
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let (meta, event) = envelope.unwrap_ota()?;

        let uplink = match event.event_type.as_str() {
            VERSION_REPORT => {
                let mut v: ModuleVersionInfo = serde_json::from_value(event.paras)?;
                v.meta = meta;
                Uplink::VersionReport(v)
            }
            PROGRESS_REPORT => {
                let mut s: UpgradeStatus = serde_json::from_value(event.paras)?;
                s.meta = meta;
                Uplink::StatusReport(s)
            }
            PACKAGE_GET => {
                let mut p: PackageRequest = serde_json::from_value(event.paras)?;
                p.meta = meta;
                Uplink::PackageGet(p)
            }
            other => {
                return Err(Error::Codec(format!("unknown uplink event type: {}", other)));
            }
        };

        Ok(uplink)
    }
}

/// Events the platform delivers to the device
#[derive(Debug, Clone, PartialEq)]
pub enum DownlinkEvent {
    VersionAck(ReportResult),
    StatusAck(ReportResult),
    PackageOffer(PackageOffer),
    /// Upgrade pushed by the platform without a prior package request
    UpgradeNotify(UpgradeParameters),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Downlink {
    pub meta: EventMeta,
    pub event: DownlinkEvent,
}

/// `paras` of the two acknowledgement events
#[derive(Debug, Serialize, Deserialize)]
struct AckParas {
    report_result: ReportResult,
}

impl Downlink {
    pub fn new(meta: EventMeta, event: DownlinkEvent) -> Self {
        Self { meta, event }
    }

    pub fn event_type(&self) -> &'static str {
        match self.event {
            DownlinkEvent::VersionAck(_) => VERSION_REPORT_RESPONSE,
            DownlinkEvent::StatusAck(_) => PROGRESS_REPORT_RESPONSE,
            DownlinkEvent::PackageOffer(_) => PACKAGE_GET_RESPONSE,
            DownlinkEvent::UpgradeNotify(_) => UPGRADE_NOTIFY,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let paras = match &self.event {
            DownlinkEvent::VersionAck(r) | DownlinkEvent::StatusAck(r) => {
                serde_json::to_value(AckParas {
                    report_result: r.clone(),
                })?
            }
            DownlinkEvent::PackageOffer(offer) => serde_json::to_value(offer)?,
            DownlinkEvent::UpgradeNotify(params) => serde_json::to_value(params)?,
        };
        let envelope = Envelope::wrap(&self.meta, self.event_type(), paras);
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let (meta, event) = envelope.unwrap_ota()?;

        let event = match event.event_type.as_str() {
            VERSION_REPORT_RESPONSE => {
                let paras: AckParas = serde_json::from_value(event.paras)?;
                DownlinkEvent::VersionAck(paras.report_result)
            }
            PROGRESS_REPORT_RESPONSE => {
                let paras: AckParas = serde_json::from_value(event.paras)?;
                DownlinkEvent::StatusAck(paras.report_result)
            }
            PACKAGE_GET_RESPONSE => {
                DownlinkEvent::PackageOffer(serde_json::from_value(event.paras)?)
            }
            UPGRADE_NOTIFY => DownlinkEvent::UpgradeNotify(serde_json::from_value(event.paras)?),
            other => {
                return Err(Error::Codec(format!("unknown downlink event type: {}", other)));
            }
        };

        Ok(Self { meta, event })
    }
}
