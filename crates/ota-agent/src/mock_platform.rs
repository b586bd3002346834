//! Mock IoT platform for development and testing
//!
//! Implements `Transport` in-process: every publish is decoded, recorded and
//! answered the way the cloud platform would answer it.

use async_trait::async_trait;
use ota_common::codec::{downlink_topic, Downlink, DownlinkEvent, Uplink};
use ota_common::{Error, EventMeta, PackageOffer, ReportResult, Result, UpgradeParameters};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::AgentConfig;
use crate::transport::{MessageId, TopicKind, Transport, TransportEvent};

/// How the mock platform answers a package request
#[derive(Debug, Clone, PartialEq)]
pub enum MockOffer {
    /// 404, nothing to upgrade to
    Unavailable,
    /// 200 with these upgrade parameters
    Package(UpgradeParameters),
    /// Arbitrary non-success code
    Reject { code: u16, detail: String },
    /// Never answer
    Silent,
}

/// Mock platform transport
pub struct MockPlatform {
    device_id: String,
    device_secret: String,
    connected: AtomicBool,
    next_message_id: AtomicU32,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    offer: Mutex<MockOffer>,
    ack_result: Mutex<ReportResult>,
    published: Mutex<Vec<Uplink>>,
}

impl MockPlatform {
    /// Create a new mock platform
    pub fn new(
        device_id: impl Into<String>,
        device_secret: impl Into<String>,
        offer: MockOffer,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_secret: device_secret.into(),
            connected: AtomicBool::new(false),
            next_message_id: AtomicU32::new(1),
            events: Mutex::new(None),
            offer: Mutex::new(offer),
            ack_result: Mutex::new(ReportResult::ok()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Mock platform offering the package described by the `MOCK_PACKAGE_*` settings
    pub fn from_config(config: &AgentConfig) -> Self {
        let offer = match &config.mock_package_url {
            Some(url) => MockOffer::Package(UpgradeParameters {
                url: url.clone(),
                sign: config.mock_package_sign.clone().unwrap_or_default(),
                sign_method: config.mock_package_sign.as_ref().map(|_| "SHA256".to_string()),
                module: config.module.clone(),
                version: config
                    .mock_package_version
                    .clone()
                    .unwrap_or_else(|| "v1.2.4".to_string()),
                file_name: None,
                file_size: None,
            }),
            None => MockOffer::Unavailable,
        };

        Self::new(config.device_id.clone(), config.device_secret.clone(), offer)
    }

    pub async fn set_offer(&self, offer: MockOffer) {
        *self.offer.lock().await = offer;
    }

    /// Result code used for version and status acknowledgements
    pub async fn set_ack_result(&self, result: ReportResult) {
        *self.ack_result.lock().await = result;
    }

    /// Everything published so far, decoded
    pub async fn published(&self) -> Vec<Uplink> {
        self.published.lock().await.clone()
    }

    pub async fn status_reports(&self) -> Vec<ota_common::UpgradeStatus> {
        self.published()
            .await
            .into_iter()
            .filter_map(|u| match u {
                Uplink::StatusReport(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub async fn version_reports(&self) -> Vec<ota_common::ModuleVersionInfo> {
        self.published()
            .await
            .into_iter()
            .filter_map(|u| match u {
                Uplink::VersionReport(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub async fn package_requests(&self) -> Vec<ota_common::PackageRequest> {
        self.published()
            .await
            .into_iter()
            .filter_map(|u| match u {
                Uplink::PackageGet(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Push an upgrade to the device without a prior request
    pub async fn push_upgrade(&self, meta: EventMeta, params: UpgradeParameters) {
        self.deliver(Downlink::new(meta, DownlinkEvent::UpgradeNotify(params)))
            .await;
    }

    /// Deliver an arbitrary downlink, e.g. one the platform sends without an event id
    pub async fn send_downlink(&self, downlink: Downlink) {
        self.deliver(downlink).await;
    }

    /// Simulate a dropped link
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().await.clone() {
            let _ = tx.send(TransportEvent::ConnectionLost).await;
        }
    }

    /// Send a downlink to the device asynchronously, as the network would
    async fn deliver(&self, downlink: Downlink) {
        let payload = match downlink.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Mock platform failed to encode downlink: {}", e);
                return;
            }
        };

        let Some(tx) = self.events.lock().await.clone() else {
            debug!("Mock platform: no subscriber, dropping {}", downlink.event_type());
            return;
        };

        let event = TransportEvent::Message {
            topic: downlink_topic(&self.device_id),
            payload,
        };
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }

    /// Build the platform's answer to an uplink
    async fn respond_to(&self, uplink: &Uplink) -> Option<Downlink> {
        let meta = EventMeta {
            event_id: uplink.meta().event_id.clone(),
            event_time: None,
            object_device_id: uplink.meta().object_device_id.clone(),
        }
        .now();

        let event = match uplink {
            Uplink::VersionReport(_) => {
                DownlinkEvent::VersionAck(self.ack_result.lock().await.clone())
            }
            Uplink::StatusReport(_) => {
                DownlinkEvent::StatusAck(self.ack_result.lock().await.clone())
            }
            Uplink::PackageGet(_) => {
                let offer = match self.offer.lock().await.clone() {
                    MockOffer::Unavailable => PackageOffer {
                        report_result: ReportResult::error(404, "no upgrade package available"),
                        upgrade_paras: None,
                    },
                    MockOffer::Package(params) => PackageOffer {
                        report_result: ReportResult::ok(),
                        upgrade_paras: Some(params),
                    },
                    MockOffer::Reject { code, detail } => PackageOffer {
                        report_result: ReportResult::error(code, detail),
                        upgrade_paras: None,
                    },
                    MockOffer::Silent => return None,
                };
                DownlinkEvent::PackageOffer(offer)
            }
        };

        Some(Downlink::new(meta, event))
    }
}

#[async_trait]
impl Transport for MockPlatform {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        if self.device_secret.is_empty() {
            return Err(Error::Auth(format!(
                "device {} presented an empty secret",
                self.device_id
            )));
        }

        *self.events.lock().await = Some(events.clone());
        self.connected.store(true, Ordering::SeqCst);
        debug!("Mock platform: device {} connected", self.device_id);

        let _ = events.send(TransportEvent::SubscribeSuccess).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, _topic: TopicKind, payload: Vec<u8>) -> Result<MessageId> {
        if !self.is_connected() {
            return Err(Error::TransportUnavailable);
        }

        let uplink = Uplink::decode(&payload)?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Mock platform: received {} #{} for module {}",
            uplink.event_type(),
            message_id,
            uplink.module()
        );

        let response = self.respond_to(&uplink).await;
        self.published.lock().await.push(uplink);

        if let Some(downlink) = response {
            self.deliver(downlink).await;
        }

        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_common::{EventId, ModuleVersionInfo, PackageRequest};

    fn package_get(event_id: &str) -> Vec<u8> {
        Uplink::PackageGet(PackageRequest::new("mcu", EventMeta::new(EventId::new(event_id))))
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let platform = MockPlatform::new("dev", "secret", MockOffer::Unavailable);
        let result = platform.publish(TopicKind::EventsUp, package_get("E1")).await;
        assert!(matches!(result, Err(Error::TransportUnavailable)));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_secret() {
        let platform = MockPlatform::new("dev", "", MockOffer::Unavailable);
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(platform.connect(tx).await, Err(Error::Auth(_))));
        assert!(!platform.is_connected());
    }

    #[tokio::test]
    async fn test_connect_announces_subscription() {
        let platform = MockPlatform::new("dev", "secret", MockOffer::Unavailable);
        let (tx, mut rx) = mpsc::channel(8);
        platform.connect(tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(TransportEvent::SubscribeSuccess));
    }

    #[tokio::test]
    async fn test_package_request_answered_with_404() {
        let platform = MockPlatform::new("dev", "secret", MockOffer::Unavailable);
        let (tx, mut rx) = mpsc::channel(8);
        platform.connect(tx).await.unwrap();
        rx.recv().await.unwrap();

        let id = platform.publish(TopicKind::EventsUp, package_get("E1")).await.unwrap();
        assert_eq!(id, 1);

        let TransportEvent::Message { topic, payload } = rx.recv().await.unwrap() else {
            panic!("expected downlink message");
        };
        assert_eq!(topic, "$oc/devices/dev/sys/events/down");

        let downlink = Downlink::decode(&payload).unwrap();
        assert_eq!(downlink.meta.event_id.as_str(), "E1");
        match downlink.event {
            DownlinkEvent::PackageOffer(offer) => {
                assert_eq!(offer.report_result.code, 404);
                assert!(offer.upgrade_paras.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_records_version_reports() {
        let platform = MockPlatform::new("dev", "secret", MockOffer::Silent);
        let (tx, _rx) = mpsc::channel(8);
        platform.connect(tx).await.unwrap();

        let report = Uplink::VersionReport(ModuleVersionInfo::new(
            "mcu",
            "v1.2.3",
            EventMeta::new(EventId::new("E2")),
        ));
        platform
            .publish(TopicKind::EventsUp, report.encode().unwrap())
            .await
            .unwrap();

        let versions = platform.version_reports().await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "v1.2.3");
        assert!(platform.status_reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_blocks_publishing() {
        let platform = MockPlatform::new("dev", "secret", MockOffer::Silent);
        let (tx, mut rx) = mpsc::channel(8);
        platform.connect(tx).await.unwrap();
        rx.recv().await.unwrap();

        platform.disconnect().await;
        assert_eq!(rx.recv().await, Some(TransportEvent::ConnectionLost));
        assert!(!platform.is_connected());
    }
}
