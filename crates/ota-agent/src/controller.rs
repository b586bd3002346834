//! OTA session controller
//!
//! A single task owns every upgrade cycle. It is driven by messages only:
//! transport events, commands from `OtaHandle`, progress from spawned fetch
//! tasks and a watchdog tick. Cancellation is checked on every iteration.

use ota_common::codec::{Downlink, DownlinkEvent, Uplink};
use ota_common::{
    Error, EventId, EventMeta, ModuleVersionInfo, PackageOffer, PackageRequest, ReportResult,
    Result, UpgradeParameters,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::cycle::{CyclePhase, UpgradeCycle};
use crate::fetcher::{PackageFetcher, SignMethod};
use crate::history::CycleHistory;
use crate::transport::{MessageId, TopicKind, Transport, TransportEvent};

const EVENT_QUEUE_DEPTH: usize = 64;
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Requests accepted by the controller task
enum Command {
    ReportVersion {
        info: ModuleVersionInfo,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    RequestPackage {
        request: PackageRequest,
        reply: oneshot::Sender<Result<MessageId>>,
    },
}

/// Progress of a spawned fetch task
struct FetchProgress {
    cycle_id: Uuid,
    module: String,
    step: FetchStep,
}

enum FetchStep {
    /// The task holds the download lock
    Started,
    Downloaded { path: PathBuf, verify: bool },
    Verified,
    Failed(Error),
}

/// Cloneable handle for issuing reports and package requests
#[derive(Clone)]
pub struct OtaHandle {
    commands: mpsc::Sender<Command>,
}

impl OtaHandle {
    /// Report a module version; returns the transport message id
    pub async fn report_version(
        &self,
        module: &str,
        version: &str,
        event_id: EventId,
    ) -> Result<MessageId> {
        let info = ModuleVersionInfo::new(module, version, EventMeta::new(event_id).now());
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReportVersion { info, reply }, rx).await
    }

    /// Ask the platform for an upgrade package
    ///
    /// The answer arrives later as a package offer and drives the cycle.
    pub async fn request_package(&self, module: &str, event_id: EventId) -> Result<MessageId> {
        let request = PackageRequest::new(module, EventMeta::new(event_id).now());
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestPackage { request, reply }, rx).await
    }

    async fn send(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<MessageId>>,
    ) -> Result<MessageId> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("OTA controller is not running")))?;
        rx.await
            .map_err(|_| Error::Other(anyhow::anyhow!("OTA controller dropped the request")))?
    }
}

/// Log a platform acknowledgement
///
/// Returns `ReportRejected` for a non-200 code. Acknowledgements never change
/// a cycle outcome.
pub fn handle_ack(kind: &str, meta: &EventMeta, result: ReportResult) -> Result<()> {
    match result.into_result() {
        Ok(()) => {
            debug!("Module OTA {} reported successfully (event {})", kind, meta.event_id);
            Ok(())
        }
        Err(e) => {
            error!("Module OTA {} report failed (event {}): {}", kind, meta.event_id, e);
            Err(e)
        }
    }
}

/// OTA session controller
pub struct OtaController<T: Transport, F: PackageFetcher> {
    config: Arc<AgentConfig>,
    transport: Arc<T>,
    fetcher: Arc<F>,
    history: CycleHistory,
    cycles: HashMap<String, UpgradeCycle>,
    commands: mpsc::Receiver<Command>,
    fetch_tx: mpsc::Sender<FetchProgress>,
    fetch_rx: mpsc::Receiver<FetchProgress>,
    /// Held by a fetch task for its whole download + verify
    download_lock: Arc<Mutex<()>>,
    fetch_tasks: HashMap<Uuid, AbortHandle>,
}

impl<T: Transport, F: PackageFetcher> OtaController<T, F> {
    /// Create a controller and the handle used to talk to it
    pub fn new(
        config: AgentConfig,
        transport: Arc<T>,
        fetcher: Arc<F>,
        history: CycleHistory,
    ) -> (Self, OtaHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (fetch_tx, fetch_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let controller = Self {
            config: Arc::new(config),
            transport,
            fetcher,
            history,
            cycles: HashMap::new(),
            commands,
            fetch_tx,
            fetch_rx,
            download_lock: Arc::new(Mutex::new(())),
            fetch_tasks: HashMap::new(),
        };

        (controller, OtaHandle { commands: command_tx })
    }

    /// Connect the transport and process events until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        self.transport.connect(events_tx).await?;
        info!(
            "OTA controller connected as device {}",
            self.config.device_id
        );

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("OTA controller stopped");
                    break;
                }
                Some(event) = events_rx.recv() => {
                    self.on_transport_event(event).await;
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command).await;
                }
                Some(progress) = self.fetch_rx.recv() => {
                    self.on_fetch_progress(progress).await;
                }
                _ = watchdog.tick() => {
                    self.check_deadlines().await;
                }
            }
        }

        Ok(())
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ReportVersion { info, reply } => {
                let result = self.report_version(info).await;
                let _ = reply.send(result);
            }
            Command::RequestPackage { request, reply } => {
                let result = self.request_package(request).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SubscribeSuccess => self.on_subscribe_success().await,
            TransportEvent::ConnectionLost => {
                warn!("Transport connection lost, reports fail until resubscribed");
            }
            TransportEvent::Message { topic, payload } => match Downlink::decode(&payload) {
                Ok(downlink) => self.on_downlink(downlink).await,
                Err(e) => warn!("Ignoring undecodable message on {}: {}", topic, e),
            },
        }
    }

    async fn on_subscribe_success(&mut self) {
        info!("Subscribed, reporting {} {}", self.config.module, self.config.module_version);

        let info = ModuleVersionInfo::new(
            self.config.module.clone(),
            self.config.module_version.clone(),
            EventMeta::new(EventId::generate()).now(),
        );
        if let Err(e) = self.report_version(info).await {
            error!("Failed to report current version: {}", e);
        }

        if self.config.check_on_subscribe {
            let request = PackageRequest::new(
                self.config.module.clone(),
                EventMeta::new(EventId::generate()).now(),
            );
            if let Err(e) = self.request_package(request).await {
                error!("Failed to request upgrade package: {}", e);
            }
        }
    }

    async fn on_downlink(&mut self, downlink: Downlink) {
        let Downlink { meta, event } = downlink;
        match event {
            DownlinkEvent::VersionAck(result) => {
                let _ = handle_ack("version", &meta, result);
            }
            DownlinkEvent::StatusAck(result) => {
                let _ = handle_ack("progress", &meta, result);
            }
            DownlinkEvent::PackageOffer(offer) => self.on_package_available(meta, offer).await,
            DownlinkEvent::UpgradeNotify(params) => self.on_upgrade_notify(meta, params).await,
        }
    }

    /// Publish a version report
    async fn report_version(&self, info: ModuleVersionInfo) -> Result<MessageId> {
        if !self.transport.is_connected() {
            return Err(Error::TransportUnavailable);
        }

        let module = info.module.clone();
        let version = info.version.clone();
        let message_id = self.publish(&Uplink::VersionReport(info)).await?;
        info!("Reported module {} version {} (message {})", module, version, message_id);
        Ok(message_id)
    }

    /// Publish a package request and open a cycle awaiting the offer
    async fn request_package(&mut self, request: PackageRequest) -> Result<MessageId> {
        if !self.transport.is_connected() {
            return Err(Error::TransportUnavailable);
        }

        if self.cycles.contains_key(&request.module) {
            return Err(Error::CycleInProgress(request.module.clone()));
        }

        let mut cycle = UpgradeCycle::new(request.module.clone(), &request.meta);
        let message_id = self.publish(&Uplink::PackageGet(request)).await?;

        cycle.await_offer(Instant::now() + self.config.offer_timeout())?;
        info!(
            "Requested upgrade package for module {} (event {}, message {})",
            cycle.module, cycle.event_id, message_id
        );

        self.history.update_active(&cycle).await;
        self.cycles.insert(cycle.module.clone(), cycle);
        Ok(message_id)
    }

    async fn publish(&self, uplink: &Uplink) -> Result<MessageId> {
        let payload = uplink.encode()?;
        self.transport.publish(TopicKind::EventsUp, payload).await
    }

    /// Find the cycle an offer answers
    ///
    /// Matched by event id. An offer without one goes to the module named in
    /// its parameters, or to the only cycle awaiting an offer.
    fn awaiting_module(&self, meta: &EventMeta, offer: &PackageOffer) -> Option<String> {
        let mut awaiting = self
            .cycles
            .values()
            .filter(|c| c.phase == CyclePhase::AwaitingPackageOffer);

        if !meta.event_id.is_empty() {
            return awaiting
                .find(|c| c.event_id == meta.event_id)
                .map(|c| c.module.clone());
        }

        if let Some(params) = &offer.upgrade_paras {
            return awaiting
                .find(|c| c.module == params.module)
                .map(|c| c.module.clone());
        }

        match (awaiting.next(), awaiting.next()) {
            (Some(only), None) => Some(only.module.clone()),
            _ => None,
        }
    }

    async fn on_package_available(&mut self, meta: EventMeta, offer: PackageOffer) {
        let Some(module) = self.awaiting_module(&meta, &offer) else {
            warn!("Ignoring package offer for unknown request (event {})", meta.event_id);
            return;
        };

        if let Some(cycle) = self.cycles.get_mut(&module) {
            if meta.object_device_id.is_some() {
                cycle.object_device_id = meta.object_device_id.clone();
            }
        }

        if let Err(e) = offer.report_result.clone().into_result() {
            error!("Module OTA get package for {} failed: {}", module, e);
            self.finish_without_status(&module, e).await;
            return;
        }

        let Some(params) = offer.upgrade_paras else {
            let e = Error::Codec("package offer carried no upgrade parameters".to_string());
            error!("Module OTA get package for {} failed: {}", module, e);
            self.finish_without_status(&module, e).await;
            return;
        };

        debug!("Module OTA get package for {} succeeded", module);
        self.fetch_and_apply(&module, params).await;
    }

    async fn on_upgrade_notify(&mut self, meta: EventMeta, params: UpgradeParameters) {
        if self.cycles.contains_key(&params.module) {
            warn!(
                "Ignoring pushed upgrade for {}: a cycle is already in progress",
                params.module
            );
            return;
        }

        info!("Platform pushed upgrade of {} to {}", params.module, params.version);
        let module = params.module.clone();
        self.cycles
            .insert(module.clone(), UpgradeCycle::new(module.clone(), &meta));
        self.fetch_and_apply(&module, params).await;
    }

    /// Move the cycle to `Downloading` and hand the transfer to a fetch task
    async fn fetch_and_apply(&mut self, module: &str, params: UpgradeParameters) {
        let Some(cycle) = self.cycles.get_mut(module) else {
            return;
        };

        if let Err(e) = cycle.accept_offer(params.clone()) {
            warn!("Cannot start download for {}: {}", module, e);
            return;
        }
        let cycle_id = cycle.cycle_id;
        self.history.update_active(cycle).await;

        let method = match SignMethod::parse(params.sign_method.as_deref()) {
            Ok(method) => method,
            Err(e) => {
                self.finish_with_status(module, Err(e)).await;
                return;
            }
        };

        info!("Downloading {} {} from {}", module, params.version, params.url);

        let fetcher = Arc::clone(&self.fetcher);
        let progress = self.fetch_tx.clone();
        let lock = Arc::clone(&self.download_lock);
        let dir = self.config.download_dir.clone();
        let timeout = self.config.download_timeout();
        let settle = self.config.verify_delay();
        let module = module.to_string();

        let task = tokio::spawn(async move {
            let report = |step| FetchProgress {
                cycle_id,
                module: module.clone(),
                step,
            };
            let _guard = lock.lock().await;
            let _ = progress.send(report(FetchStep::Started)).await;

            let path = match fetcher.download(&params, &dir, timeout).await {
                Ok(path) => path,
                Err(e) => {
                    let _ = progress.send(report(FetchStep::Failed(e))).await;
                    return;
                }
            };

            let downloaded = FetchStep::Downloaded {
                path: path.clone(),
                verify: method.is_some(),
            };
            let _ = progress.send(report(downloaded)).await;

            let Some(method) = method else {
                return;
            };

            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }

            let step = match fetcher.verify_signature(&params.sign, method, &path).await {
                Ok(()) => FetchStep::Verified,
                Err(e) => FetchStep::Failed(e),
            };
            let _ = progress.send(report(step)).await;
        });
        self.fetch_tasks.insert(cycle_id, task.abort_handle());
    }

    async fn on_fetch_progress(&mut self, progress: FetchProgress) {
        let FetchProgress {
            cycle_id,
            module,
            step,
        } = progress;

        let Some(cycle) = self
            .cycles
            .get_mut(&module)
            .filter(|c| c.cycle_id == cycle_id)
        else {
            debug!("Discarding fetch result of finished cycle {}", cycle_id);
            return;
        };

        match step {
            FetchStep::Started => {
                let deadline = Instant::now() + self.config.transfer_deadline();
                if let Err(e) = cycle.start_transfer(deadline) {
                    warn!("Unexpected transfer start for {}: {}", module, e);
                    return;
                }
                debug!("Download of {} started", module);
                self.history.update_active(cycle).await;
            }
            FetchStep::Downloaded { path, verify } => {
                info!("Module OTA package downloaded successfully: {}", path.display());
                if let Err(e) = cycle.downloaded(path, verify) {
                    warn!("Unexpected download result for {}: {}", module, e);
                    return;
                }
                if verify {
                    self.history.update_active(cycle).await;
                } else {
                    self.finish_with_status(&module, Ok(())).await;
                }
            }
            FetchStep::Verified => {
                if let Err(e) = cycle.verified() {
                    warn!("Unexpected verification result for {}: {}", module, e);
                    return;
                }
                self.finish_with_status(&module, Ok(())).await;
            }
            FetchStep::Failed(e) => {
                self.finish_with_status(&module, Err(e)).await;
            }
        }
    }

    /// Send the cycle's single `UpgradeStatus` and end it
    ///
    /// On success the new version is reported afterwards.
    async fn finish_with_status(&mut self, module: &str, outcome: Result<()>) {
        let Some(mut cycle) = self.cycles.remove(module) else {
            return;
        };
        self.stop_fetch(cycle.cycle_id);

        let reason = outcome.as_ref().err().map(|e| e.to_string());
        let status = match cycle.take_status(reason.as_deref().map_or(Ok(()), Err)) {
            Ok(status) => status,
            Err(e) => {
                error!("Cycle {} for {} cannot report status: {}", cycle.cycle_id, module, e);
                let _ = cycle.fail(e.to_string());
                self.history.finish(cycle).await;
                return;
            }
        };

        if let Err(e) = self.publish(&Uplink::StatusReport(status)).await {
            error!("Failed to report upgrade status for {}: {}", module, e);
        }

        match reason {
            Some(reason) => {
                error!("Module OTA upgrade of {} failed: {}", module, reason);
                let _ = cycle.fail(reason);
            }
            None => {
                // Only reached from Reporting
                let version = cycle.target_version().unwrap_or_default().to_string();
                let info = ModuleVersionInfo::new(
                    module,
                    version,
                    EventMeta::new(EventId::generate())
                        .for_device(cycle.object_device_id.clone())
                        .now(),
                );
                if let Err(e) = self.report_version(info).await {
                    error!("Failed to report new version of {}: {}", module, e);
                }
                let _ = cycle.succeed();
                info!("Module OTA upgrade of {} succeeded", module);
            }
        }

        self.history.finish(cycle).await;
    }

    /// End a cycle that never received upgrade parameters; nothing is reported
    async fn finish_without_status(&mut self, module: &str, error: Error) {
        if let Some(mut cycle) = self.cycles.remove(module) {
            self.stop_fetch(cycle.cycle_id);
            let _ = cycle.fail(error.to_string());
            self.history.finish(cycle).await;
        }
    }

    /// Abort a cycle's fetch task, releasing the download lock it may hold
    fn stop_fetch(&mut self, cycle_id: Uuid) {
        if let Some(task) = self.fetch_tasks.remove(&cycle_id) {
            task.abort();
        }
    }

    async fn check_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, CyclePhase)> = self
            .cycles
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| (c.module.clone(), c.phase))
            .collect();

        for (module, phase) in expired {
            warn!("Upgrade cycle for {} timed out in phase {}", module, phase);
            match phase {
                CyclePhase::Idle | CyclePhase::AwaitingPackageOffer => {
                    let e = Error::Other(anyhow::anyhow!("timed out waiting for package offer"));
                    self.finish_without_status(&module, e).await;
                }
                CyclePhase::Verifying => {
                    let e = Error::VerificationFailed("timed out".to_string());
                    self.finish_with_status(&module, Err(e)).await;
                }
                _ => {
                    let e = Error::DownloadFailed("timed out".to_string());
                    self.finish_with_status(&module, Err(e)).await;
                }
            }
        }
    }
}
