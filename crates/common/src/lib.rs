//! Types shared by the OTA agent: wire messages, codec and errors

pub mod codec;
pub mod error;
pub mod event_id;
pub mod messages;

pub use codec::{Downlink, DownlinkEvent, Uplink};
pub use error::{Error, Result};
pub use event_id::EventId;
pub use messages::{
    EventMeta, ModuleVersionInfo, PackageOffer, PackageRequest, ReportResult, UpgradeParameters,
    UpgradeStatus,
};
