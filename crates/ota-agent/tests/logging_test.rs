//! Error logging of rejected platform answers

use ota_agent::{
    AgentConfig, CycleHistory, HttpFetcher, MockOffer, MockPlatform, OtaController, OtaHandle,
};
use ota_common::{EventId, ReportResult};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared buffer the fmt layer writes into
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.contains("ERROR"))
            .collect()
    }

    async fn wait_for(&self, needle: &str) -> String {
        for _ in 0..200 {
            if let Some(line) = self.lines().into_iter().find(|l| l.contains(needle)) {
                return line;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no log line containing {:?}", needle);
    }
}

/// Route this thread's logs into a buffer
///
/// The test runtime is single-threaded, so the controller task logs here too.
fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    (buffer, tracing::subscriber::set_default(subscriber))
}

async fn start(
    platform: Arc<MockPlatform>,
    dir: &tempfile::TempDir,
) -> (OtaHandle, CycleHistory) {
    let config = AgentConfig::for_tests(dir.path().to_path_buf());
    let history = CycleHistory::new(config.history_capacity);
    let (controller, handle) = OtaController::new(
        config,
        Arc::clone(&platform),
        Arc::new(HttpFetcher::new()),
        history.clone(),
    );
    tokio::spawn(controller.run(CancellationToken::new()));

    for _ in 0..200 {
        if !platform.version_reports().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (handle, history)
}

#[tokio::test]
async fn test_missing_package_logs_one_error() {
    let (logs, _guard) = capture_logs();
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new("dev", "secret", MockOffer::Unavailable));
    let (handle, history) = start(Arc::clone(&platform), &dir).await;

    handle
        .request_package("mcu", EventId::new("E1"))
        .await
        .unwrap();

    for _ in 0..200 {
        if history.last_finished("mcu").await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(history.last_finished("mcu").await.is_some());

    let errors = logs.errors();
    assert_eq!(errors.len(), 1, "{:#?}", errors);
    assert!(errors[0].contains("no upgrade package available"));
    assert!(errors[0].contains("404"));
}

#[tokio::test]
async fn test_rejected_ack_logs_error_detail() {
    let (logs, _guard) = capture_logs();
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new("dev", "secret", MockOffer::Unavailable));
    platform
        .set_ack_result(ReportResult::error(500, "quota exceeded"))
        .await;

    // The version reported on subscribe is acknowledged with 500
    let _agent = start(Arc::clone(&platform), &dir).await;

    let line = logs.wait_for("quota exceeded").await;
    assert!(line.contains("ERROR"));
    assert!(line.contains("500"));
}

#[tokio::test]
async fn test_accepted_ack_logs_no_error() {
    let (logs, _guard) = capture_logs();
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new("dev", "secret", MockOffer::Unavailable));
    let (handle, _history) = start(Arc::clone(&platform), &dir).await;

    handle
        .report_version("mcu", "v1.2.3", EventId::new("E7"))
        .await
        .unwrap();

    logs.wait_for("(event E7)").await;
    assert!(logs.errors().is_empty(), "{:#?}", logs.errors());
}
