/// Progressor measurement session: discovery, query, measure, teardown
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Duration, Instant};

use crate::aggregator::{summarize, SampleAggregator};
use crate::bluetooth::transport::Transport;
use crate::config::SessionConfig;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::models::{
    Command, DeviceInfo, InterpretedResponse, Peripheral, ResponseType, SessionReport,
};
use crate::protocol::codec::{CTRL_POINT_CHAR_UUID, DATA_CHAR_UUID};
use crate::protocol::correlator::{route, ResponseCorrelator, Routed};

// Device information queried before every measurement
const QUERY_SEQUENCE: [Command; 3] = [
    Command::GetAppVersion,
    Command::GetBatteryVoltage,
    Command::GetErrorInformation,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Connecting,
    Subscribed,
    Querying,
    Measuring,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Subscribed,
    Querying,
    Measuring,
    Done,
    Error(SessionError),
}

impl From<Phase> for SessionState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle => SessionState::Idle,
            Phase::Scanning => SessionState::Scanning,
            Phase::Connecting => SessionState::Connecting,
            Phase::Subscribed => SessionState::Subscribed,
            Phase::Querying => SessionState::Querying,
            Phase::Measuring => SessionState::Measuring,
            Phase::Done => SessionState::Done,
        }
    }
}

/// Per-session protocol state fed by the notification path
#[derive(Debug, Default)]
pub struct SessionContext {
    pub correlator: ResponseCorrelator,
    pub aggregator: SampleAggregator,
    pub device: DeviceInfo,
    pub low_power_warnings: u32,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one notification and apply it.
    ///
    /// Protocol errors are logged and the notification dropped; they never
    /// end the session.
    pub fn handle_notification(&mut self, data: &[u8]) {
        match route(self.correlator.pending(), data) {
            Ok(Routed::Samples(samples)) => {
                if let Some(last) = samples.last() {
                    debug!("{} samples up to {:.6}s", samples.len(), last.timestamp);
                }
                self.aggregator.extend(samples);
            }
            Ok(Routed::Response(response)) => self.record_response(response),
            Ok(Routed::LowPowerWarning) => {
                warn!("Received low battery warning.");
                self.low_power_warnings += 1;
            }
            Ok(Routed::Ignored(kind)) => debug!("Ignoring {} record", kind),
            Err(ProtocolError::EncodingError(e)) => {
                warn!("Unreadable response to {:?}: {}", self.correlator.pending(), e);
            }
            Err(e) => warn!("Dropping notification {:02x?}: {}", data, e),
        }
    }

    fn record_response(&mut self, response: InterpretedResponse) {
        match response {
            InterpretedResponse::AppVersion(version) => {
                info!("FW version : {}", version);
                self.device.firmware_version = Some(version);
            }
            InterpretedResponse::BatteryVoltage(millivolts) => {
                info!("Battery voltage : {} [mV]", millivolts);
                self.device.battery_millivolts = Some(millivolts);
            }
            InterpretedResponse::ErrorInformation(Some(log)) => {
                info!("Crashlog : {}", log);
                self.device.crash_log = Some(log);
            }
            InterpretedResponse::ErrorInformation(None) => info!("Empty crashlog"),
        }
    }

    pub fn report(&self, started_at: OffsetDateTime) -> SessionReport {
        let samples = self.aggregator.finalize();
        SessionReport {
            device: self.device.clone(),
            started_at,
            summary: summarize(&samples),
            samples,
            low_power_warnings: self.low_power_warnings,
        }
    }
}

/// First peripheral whose advertised name starts with `prefix`
pub fn find_target<'a>(peripherals: &'a [Peripheral], prefix: &str) -> Option<&'a Peripheral> {
    peripherals
        .iter()
        .find(|p| p.name.as_deref().is_some_and(|name| name.starts_with(prefix)))
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn is_command_response(data: &[u8]) -> bool {
    data.first().copied().and_then(ResponseType::from_byte)
        == Some(ResponseType::CommandResponse)
}

/// Drives one measurement session over a transport
pub struct SessionController<T: Transport> {
    transport: T,
    config: SessionConfig,
    context: SessionContext,
    phase: Phase,
    error: Option<SessionError>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        SessionController {
            transport,
            config,
            context: SessionContext::new(),
            phase: Phase::Idle,
            error: None,
            shutdown: watch::channel(false).1,
        }
    }

    /// End the session early, with a normal teardown, once `shutdown` reads true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn state(&self) -> SessionState {
        match &self.error {
            Some(e) => SessionState::Error(e.clone()),
            None => self.phase.into(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the whole session and hand back what was measured.
    ///
    /// Any transport failure ends the session in the error state; nothing is
    /// retried.
    pub async fn run(&mut self) -> Result<SessionReport, SessionError> {
        let started_at = OffsetDateTime::now_utc();

        match self.drive().await {
            Ok(()) => {
                self.enter(Phase::Done);
                Ok(self.context.report(started_at))
            }
            Err(e) => {
                error!("Session aborted: {}", e);
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        self.enter(Phase::Scanning);
        let peripherals = self
            .transport
            .scan(self.config.scan_timeout)
            .await
            .map_err(|e| self.fail(e))?;

        let target = find_target(&peripherals, &self.config.name_prefix)
            .cloned()
            .ok_or_else(|| SessionError::DeviceNotFound {
                prefix: self.config.name_prefix.clone(),
                timeout_secs: self.config.scan_timeout.as_secs_f64(),
            })?;

        let name = target.name.unwrap_or_default();
        info!("Found \"{}\" with address {}", name, target.address);
        self.context.device.name = name;
        self.context.device.address = target.address.clone();

        if self.stopping() {
            info!("Shutdown requested, not connecting");
            return Ok(());
        }

        self.enter(Phase::Connecting);
        let mut connection = self
            .transport
            .connect(&target.address)
            .await
            .map_err(|e| self.fail(e))?;
        info!("Device is connected.");

        let result = self.exchange(&mut connection).await;

        // Release the link whether or not the exchange succeeded
        if let Err(e) = self.transport.disconnect(connection).await {
            warn!("Failed to disconnect from {}: {}", target.address, e);
        }

        result
    }

    async fn exchange(&mut self, connection: &mut T::Connection) -> Result<(), SessionError> {
        let mut notifications = self
            .transport
            .subscribe(connection, DATA_CHAR_UUID)
            .await
            .map_err(|e| self.fail(e))?;
        self.enter(Phase::Subscribed);

        self.enter(Phase::Querying);
        for cmd in QUERY_SEQUENCE {
            self.send(connection, cmd).await.map_err(|e| self.fail(e))?;
            self.await_response(cmd, &mut notifications).await?;
            if self.stopping() {
                info!("Shutdown requested, skipping measurement");
                return Ok(());
            }
        }

        self.enter(Phase::Measuring);
        self.send(connection, Command::StartWeightMeasurement)
            .await
            .map_err(|e| self.fail(e))?;
        self.observe(&mut notifications, self.config.measurement_window)
            .await?;

        // Anything already queued when the window closed or shutdown was
        // requested still counts
        while let Ok(data) = notifications.try_recv() {
            self.context.handle_notification(&data);
        }

        if self.context.aggregator.is_empty() {
            warn!("No weight samples received during the measurement window");
        }

        if self.config.stop_on_exit {
            if let Err(e) = self
                .send(connection, Command::StopWeightMeasurement)
                .await
            {
                warn!("Failed to stop weight measurement: {}", e);
            }
        }

        Ok(())
    }

    async fn send(
        &mut self,
        connection: &mut T::Connection,
        cmd: Command,
    ) -> Result<(), TransportError> {
        debug!("Sending {:?}", cmd);
        let frame = self.context.correlator.issue(cmd);
        self.transport
            .write(connection, CTRL_POINT_CHAR_UUID, &frame, true)
            .await
    }

    /// Process notifications until the response to `cmd` arrives or the
    /// inter-command delay runs out.
    async fn await_response(
        &mut self,
        cmd: Command,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.config.command_delay;

        loop {
            match timeout_at(deadline, notifications.recv()).await {
                Ok(Some(data)) => {
                    let answered = is_command_response(&data);
                    self.context.handle_notification(&data);
                    if answered {
                        return Ok(());
                    }
                }
                Ok(None) => return Err(self.fail(TransportError::Disconnected)),
                Err(_) => {
                    debug!(
                        "No response to {:?} within {:?}",
                        cmd, self.config.command_delay
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn observe(
        &mut self,
        notifications: &mut mpsc::Receiver<Vec<u8>>,
        window: Duration,
    ) -> Result<(), SessionError> {
        info!("Measuring for {:?}", window);
        let deadline = Instant::now() + window;
        let mut shutdown = self.shutdown.clone();

        // The window closes unconditionally, even with notifications waiting
        while Instant::now() < deadline {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => break,
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested, ending measurement early");
                    break;
                }
                received = notifications.recv() => match received {
                    Some(data) => self.context.handle_notification(&data),
                    None => return Err(self.fail(TransportError::Disconnected)),
                },
            }
        }

        info!(
            "Measurement window closed with {} samples (last at {:.3} s)",
            self.context.aggregator.len(),
            self.context.aggregator.last_timestamp().unwrap_or_default()
        );
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Session {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn fail(&self, source: TransportError) -> SessionError {
        SessionError::Transport {
            phase: self.phase,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{Call, MockTransport};
    use crate::models::Summary;
    use crate::protocol::codec::encode_weight_notification;

    const ADDRESS: &str = "F0:4A:12:3B:9C:01";

    fn scripted_device() -> MockTransport {
        MockTransport::with_device("Progressor_1234", ADDRESS)
            .reply(107, vec![b"\x00\x051.4.2".to_vec()])
            .reply(111, vec![vec![0, 4, 0x88, 0x13, 0x00, 0x00]])
            .reply(108, vec![vec![0, 0]])
            .reply(
                101,
                vec![
                    encode_weight_notification(&[(1.0, 100_000), (2.0, 200_000)]),
                    vec![9, 0, 0xde, 0xad],
                    vec![1, 3, 0, 0, 0],
                    vec![4, 0],
                    encode_weight_notification(&[(3.0, 300_000), (4.0, 400_000)]),
                ],
            )
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_matching_device() {
        let mut transport = MockTransport::new();
        transport.peripherals = vec![
            Peripheral {
                name: Some("progressor_lower".to_string()),
                address: "00:00:00:00:00:01".to_string(),
            },
            Peripheral {
                name: None,
                address: "00:00:00:00:00:02".to_string(),
            },
        ];
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceNotFound { .. }));
        assert_eq!(controller.state(), SessionState::Error(err));
        assert_eq!(
            controller.transport().calls,
            vec![Call::Scan(Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_first_prefix_match_wins() {
        let peripherals = vec![
            Peripheral {
                name: Some("Polar H10".to_string()),
                address: "00:00:00:00:00:01".to_string(),
            },
            Peripheral {
                name: Some("Progressor_A".to_string()),
                address: "00:00:00:00:00:02".to_string(),
            },
            Peripheral {
                name: Some("Progressor".to_string()),
                address: "00:00:00:00:00:03".to_string(),
            },
        ];

        let target = find_target(&peripherals, "Progressor").unwrap();
        assert_eq!(target.address, "00:00:00:00:00:02");
        assert!(find_target(&peripherals, "Tindeq").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session() {
        let mut controller = SessionController::new(scripted_device(), SessionConfig::default());
        assert_eq!(controller.state(), SessionState::Idle);

        let report = controller.run().await.unwrap();
        assert_eq!(controller.state(), SessionState::Done);

        assert_eq!(report.device.name, "Progressor_1234");
        assert_eq!(report.device.address, ADDRESS);
        assert_eq!(report.device.firmware_version.as_deref(), Some("1.4.2"));
        assert_eq!(report.device.battery_millivolts, Some(5000));
        assert_eq!(report.device.crash_log, None);
        assert_eq!(report.low_power_warnings, 1);

        let weights: Vec<f32> = report.samples.iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(report.samples[3].timestamp, 0.4);
        assert_eq!(
            report.summary,
            Some(Summary {
                median: 3.5,
                mad: 0.5
            })
        );

        let calls = &controller.transport().calls;
        assert_eq!(calls[0], Call::Scan(Duration::from_secs(2)));
        assert_eq!(calls[1], Call::Connect(ADDRESS.to_string()));
        assert_eq!(calls[2], Call::Subscribe(DATA_CHAR_UUID));
        assert_eq!(
            calls[3],
            Call::Write(CTRL_POINT_CHAR_UUID, vec![107], true)
        );
        assert_eq!(calls.last(), Some(&Call::Disconnect(ADDRESS.to_string())));
        assert_eq!(controller.transport().written_opcodes(), vec![107, 111, 108, 101]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_response_falls_back_to_delay() {
        let transport = scripted_device().reply(107, Vec::new());
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let started = Instant::now();
        let report = controller.run().await.unwrap();

        assert_eq!(report.device.firmware_version, None);
        assert_eq!(report.device.battery_millivolts, Some(5000));
        // One unanswered query plus the observation window
        assert!(started.elapsed() >= Duration::from_millis(10_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_aborts_in_querying() {
        let mut transport = scripted_device();
        transport.fail_write = Some(111);
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Transport {
                phase: Phase::Querying,
                source: TransportError::Write("ATT error 0x0e".to_string()),
            }
        );
        assert_eq!(controller.state(), SessionState::Error(err));
        assert_eq!(controller.transport().written_opcodes(), vec![107, 111]);
        assert_eq!(
            controller.transport().calls.last(),
            Some(&Call::Disconnect(ADDRESS.to_string()))
        );
        assert_eq!(
            controller.context().device.firmware_version.as_deref(),
            Some("1.4.2")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure() {
        let mut transport = scripted_device();
        transport.fail_connect = true;
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Connecting,
                source: TransportError::Connection(_),
            }
        ));
        assert!(controller.transport().written_opcodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_while_measuring() {
        let mut transport = scripted_device();
        transport.drop_link_after = Some(101);
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Transport {
                phase: Phase::Measuring,
                source: TransportError::Disconnected,
            }
        );
        // Samples that arrived before the drop were still recorded
        assert_eq!(controller.context().aggregator.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_exit_is_best_effort() {
        let mut transport = scripted_device();
        transport.fail_write = Some(102);
        let config = SessionConfig {
            stop_on_exit: true,
            ..SessionConfig::default()
        };
        let mut controller = SessionController::new(transport, config);

        let report = controller.run().await.unwrap();
        assert_eq!(report.samples.len(), 4);
        assert_eq!(
            controller.transport().written_opcodes(),
            vec![107, 111, 108, 101, 102]
        );
        assert_eq!(controller.state(), SessionState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure() {
        let mut transport = scripted_device();
        transport.fail_scan = true;
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Scanning,
                source: TransportError::Scan(_),
            }
        ));
        assert_eq!(
            controller.transport().calls,
            vec![Call::Scan(Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure() {
        let mut transport = scripted_device();
        transport.fail_subscribe = true;
        let mut controller = SessionController::new(transport, SessionConfig::default());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport {
                phase: Phase::Connecting,
                source: TransportError::Subscribe(_),
            }
        ));
        assert_eq!(controller.state(), SessionState::Error(err));
        assert!(controller.transport().written_opcodes().is_empty());
        assert_eq!(
            controller.transport().calls.last(),
            Some(&Call::Disconnect(ADDRESS.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_queued_at_window_close_are_kept() {
        // A zero window closes before the queued samples are read in the loop
        let config = SessionConfig {
            measurement_window: Duration::ZERO,
            ..SessionConfig::default()
        };
        let mut controller = SessionController::new(scripted_device(), config);

        let report = controller.run().await.unwrap();
        let weights: Vec<f32> = report.samples.iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(report.low_power_warnings, 1);
        assert_eq!(controller.state(), SessionState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_measurement_with_teardown() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut controller = SessionController::new(scripted_device(), SessionConfig::default())
            .with_shutdown(stop_rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = stop_tx.send(true);
        });

        let started = Instant::now();
        let report = controller.run().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.samples.len(), 4);
        assert_eq!(controller.state(), SessionState::Done);
        assert_eq!(
            controller.transport().calls.last(),
            Some(&Call::Disconnect(ADDRESS.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_connecting() {
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        let mut controller = SessionController::new(scripted_device(), SessionConfig::default())
            .with_shutdown(stop_rx);

        let report = controller.run().await.unwrap();

        assert_eq!(
            controller.transport().calls,
            vec![Call::Scan(Duration::from_secs(2))]
        );
        assert_eq!(report.device.address, ADDRESS);
        assert!(report.samples.is_empty());
        assert_eq!(controller.state(), SessionState::Done);
    }

    #[test]
    fn test_bad_notifications_leave_context_untouched() {
        let mut context = SessionContext::new();
        context.correlator.issue(Command::GetBatteryVoltage);

        context.handle_notification(&[9, 0, 1, 2, 3]);
        context.handle_notification(&[1, 4, 0, 0, 0, 0]);
        context.handle_notification(&[]);

        assert!(context.aggregator.is_empty());
        assert_eq!(context.correlator.pending(), Some(Command::GetBatteryVoltage));
        assert_eq!(context.device.battery_millivolts, None);
    }
}
