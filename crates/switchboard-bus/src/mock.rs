use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchboard_core::{ConnectionState, ServiceDescriptor};

use crate::local::LocalBus;
use crate::rpc::{
    CommandHandler, RpcCallRequest, ACCEPT_ANSWER, OFFER_REQUEST, STATE_CHANGE, SUCCEEDED,
};

const REPORT_ATTEMPTS: u32 = 5;
const REPORT_RETRY: Duration = Duration::from_millis(20);

/// Pre-programmed behaviour for a mock media bridge.
#[derive(Clone, Debug, Default)]
pub struct MockBehavior {
    /// Wait before answering an offer request.
    pub offer_delay: Option<Duration>,
    /// Answer offer requests with this remote error.
    pub offer_error: Option<String>,
    /// Answer accept requests with this remote error.
    pub accept_error: Option<String>,
    /// After a successful accept, report these transitions in order.
    pub report_states: Vec<ConnectionState>,
}

impl MockBehavior {
    /// Accept, then walk the usual ICE path to `connected`.
    pub fn connecting() -> Self {
        Self {
            report_states: vec![
                ConnectionState::Checking,
                ConnectionState::Connected,
            ],
            ..Self::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            offer_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing_offer(message: impl Into<String>) -> Self {
        Self {
            offer_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// In-process stand-in for a media bridge worker.
///
/// Serves the two commands the coordinator issues and, when given a bus
/// handle, reports ICE state changes back through the coordinator's
/// inbound command.
pub struct MockMediaBridge {
    descriptor: ServiceDescriptor,
    behavior: MockBehavior,
    bus: Mutex<Option<Weak<LocalBus>>>,
    offers: AtomicUsize,
    accepts: AtomicUsize,
}

impl MockMediaBridge {
    pub fn new(descriptor: ServiceDescriptor, behavior: MockBehavior) -> Self {
        Self {
            descriptor,
            behavior,
            bus: Mutex::new(None),
            offers: AtomicUsize::new(0),
            accepts: AtomicUsize::new(0),
        }
    }

    /// Where to report state changes. Weak so the bus can own the mock.
    pub fn attach(&self, bus: Weak<LocalBus>) {
        *self.bus.lock() = Some(bus);
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::Relaxed)
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::Relaxed)
    }

    fn offer_for(&self, participant: &str) -> String {
        serde_json::json!({
            "type": "offer",
            "sdp": format!(
                "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={participant}@{}\r\nt=0 0\r\n",
                self.descriptor.service_id
            ),
        })
        .to_string()
    }

    /// The coordinator starts tracking an endpoint only after the accept
    /// reply reaches it, so an early report can be refused as unknown.
    /// Each report is retried a few times before the sequence is abandoned.
    fn spawn_state_reports(&self, participant: String) {
        if self.behavior.report_states.is_empty() {
            return;
        }
        let Some(bus) = self.bus.lock().clone() else {
            return;
        };
        let from = self.descriptor.clone();
        let states = self.behavior.report_states.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let mut old = ConnectionState::New;
            for new in states {
                let args = vec![
                    participant.clone(),
                    new.as_str().to_string(),
                    old.as_str().to_string(),
                ];
                let mut attempt = 1;
                loop {
                    let Some(bus) = bus.upgrade() else {
                        return;
                    };
                    match bus
                        .call_inbound(&from, STATE_CHANGE, args.clone(), Duration::from_secs(3))
                        .await
                    {
                        Ok(_) => break,
                        Err(e) if attempt < REPORT_ATTEMPTS => {
                            tracing::debug!(service = %from, participant_id = %participant, attempt, error = %e, "state report refused, retrying");
                            attempt += 1;
                            tokio::time::sleep(REPORT_RETRY).await;
                        }
                        Err(e) => {
                            tracing::warn!(service = %from, participant_id = %participant, error = %e, "state report rejected");
                            return;
                        }
                    }
                }
                old = new;
            }
        });
    }
}

#[async_trait]
impl CommandHandler for MockMediaBridge {
    async fn handle(&self, req: RpcCallRequest) -> Result<Vec<String>, String> {
        match req.command.as_str() {
            OFFER_REQUEST => {
                self.offers.fetch_add(1, Ordering::Relaxed);
                let participant = req.arg(0)?;
                if let Some(delay) = self.behavior.offer_delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(message) = &self.behavior.offer_error {
                    return Err(message.clone());
                }
                Ok(vec![self.offer_for(participant)])
            }
            ACCEPT_ANSWER => {
                self.accepts.fetch_add(1, Ordering::Relaxed);
                let participant = req.arg(0)?.to_string();
                req.arg(1)?;
                if let Some(message) = &self.behavior.accept_error {
                    return Err(message.clone());
                }
                self.spawn_state_reports(participant);
                Ok(vec![SUCCEEDED.to_string()])
            }
            other => Err(format!("unsupported command: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchboard_core::ServiceType;

    fn bridge(behavior: MockBehavior) -> MockMediaBridge {
        MockMediaBridge::new(ServiceDescriptor::media_bridge("b1"), behavior)
    }

    fn req(command: &str, args: &[&str]) -> RpcCallRequest {
        RpcCallRequest::new(
            ServiceDescriptor::new(ServiceType::Signaling, ""),
            command,
            args.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn offer_is_json_with_sdp() {
        let mb = bridge(MockBehavior::default());
        let out = mb.handle(req(OFFER_REQUEST, &["part_1"])).await.unwrap();
        let offer: serde_json::Value = serde_json::from_str(&out[0]).unwrap();
        assert_eq!(offer["type"], "offer");
        assert!(offer["sdp"].as_str().unwrap().contains("part_1@b1"));
        assert_eq!(mb.offer_count(), 1);
    }

    #[tokio::test]
    async fn configured_errors_are_returned() {
        let mb = bridge(MockBehavior {
            offer_error: Some("no capacity".into()),
            accept_error: Some("bad sdp".into()),
            ..MockBehavior::default()
        });
        assert_eq!(mb.handle(req(OFFER_REQUEST, &["p"])).await.unwrap_err(), "no capacity");
        assert_eq!(mb.handle(req(ACCEPT_ANSWER, &["p", "sdp"])).await.unwrap_err(), "bad sdp");
    }

    #[tokio::test]
    async fn missing_args_and_unknown_commands_fail() {
        let mb = bridge(MockBehavior::default());
        assert!(mb.handle(req(ACCEPT_ANSWER, &["p"])).await.is_err());
        assert!(mb.handle(req("reboot", &[])).await.is_err());
    }

    struct Recorder(Mutex<Vec<Vec<String>>>);

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, req: RpcCallRequest) -> Result<Vec<String>, String> {
            self.0.lock().push(req.args);
            Ok(vec![SUCCEEDED.to_string()])
        }
    }

    #[tokio::test]
    async fn accept_reports_state_changes_through_bus() {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.register_command(STATE_CHANGE, recorder.clone());

        let mb = bridge(MockBehavior::connecting());
        mb.attach(Arc::downgrade(&bus));
        let out = mb.handle(req(ACCEPT_ANSWER, &["part_1", "v=0"])).await.unwrap();
        assert_eq!(out, vec![SUCCEEDED]);

        for _ in 0..50 {
            if recorder.0.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = recorder.0.lock().clone();
        assert_eq!(calls[0], vec!["part_1", "checking", "new"]);
        assert_eq!(calls[1], vec!["part_1", "connected", "checking"]);
    }

    /// Refuses the first report, then records like `Recorder`.
    struct RefuseFirst {
        refused: AtomicUsize,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandHandler for RefuseFirst {
        async fn handle(&self, req: RpcCallRequest) -> Result<Vec<String>, String> {
            if self.refused.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(format!("participant not found: {}", req.args[0]));
            }
            self.calls.lock().push(req.args);
            Ok(vec![SUCCEEDED.to_string()])
        }
    }

    #[tokio::test]
    async fn refused_report_is_retried() {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let handler = Arc::new(RefuseFirst {
            refused: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        });
        bus.register_command(STATE_CHANGE, handler.clone());

        let mb = bridge(MockBehavior::connecting());
        mb.attach(Arc::downgrade(&bus));
        mb.handle(req(ACCEPT_ANSWER, &["part_1", "v=0"])).await.unwrap();

        for _ in 0..100 {
            if handler.calls.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = handler.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec!["part_1", "checking", "new"]);
        assert_eq!(calls[1], vec!["part_1", "connected", "checking"]);
        assert_eq!(handler.refused.load(Ordering::SeqCst), 3);
    }
}
