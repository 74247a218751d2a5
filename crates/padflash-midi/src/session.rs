//! Flash session orchestration
//!
//! A flash session moves a SysEx-encoded image onto a device in its
//! bootloader. Only one session may be active at a time:
//! 1. [`FlashOrchestrator::queue_flash`] admits the session and prompts the user
//! 2. [`PendingFlash::start`] waits until the device reports a compatible bootloader
//! 3. [`Transfer::run`] streams the image one SysEx message per chunk, paced,
//!    with bounded retries
//! 4. The session settles and reports completion
//!
//! Progress is published on a broadcast channel. A [`CancelHandle`] stops the
//! session while waiting, or between chunks while transferring.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use padflash_core::{is_ready, sysex, DeviceState, Encoding, FirmwareImage, Model};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::transport::{SysExTransport, TransportError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("A flash session is already in progress")]
    SessionBusy,
    #[error("{0} firmware cannot be flashed over MIDI")]
    NotFlashable(Model),
    #[error("Device never entered a compatible bootloader")]
    DeviceNotReady,
    #[error("Chunk {chunk} failed after {attempts} attempts: {source}")]
    TransferError {
        chunk: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("Flash cancelled by user")]
    UserCancelled,
}

/// Pacing and retry parameters for a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Bytes the device absorbs per `chunk_delay`
    pub chunk_size: usize,
    /// Pause after each `chunk_size` bytes sent
    pub chunk_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub settle_delay: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            chunk_delay: Duration::from_millis(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            settle_delay: Duration::from_millis(1000),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    WaitingForBootloader,
    Transferring { sent: usize, total: usize },
    /// All chunks delivered, letting the device commit the image
    Completing,
    Done,
    Cancelled,
    Failed { error: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed { .. }
        )
    }

    /// Whether the session still blocks admission of a new one
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle) && !self.is_terminal()
    }
}

/// Summary of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub session: Uuid,
    pub model: Model,
    pub bytes_sent: usize,
    pub chunks: usize,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlashEventKind {
    /// Ask the user to put the device in its bootloader
    BootloaderPrompt {
        model: Model,
        instructions: &'static str,
        device_ready: bool,
    },
    StateChanged(SessionState),
    Progress { sent: usize, total: usize },
    Complete(FlashReport),
    Failed(FlashError),
    Cancelled,
}

/// Session event sent to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct FlashEvent {
    pub session: Uuid,
    pub kind: FlashEventKind,
}

struct SessionRecord {
    id: Uuid,
    model: Model,
    state: SessionState,
    cancel_tx: watch::Sender<bool>,
}

struct Shared {
    session: Mutex<Option<SessionRecord>>,
    transport: Arc<tokio::sync::Mutex<Box<dyn SysExTransport>>>,
    event_tx: broadcast::Sender<FlashEvent>,
    config: FlashConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<SessionRecord>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_event(&self, session: Uuid, kind: FlashEventKind) {
        let _ = self.event_tx.send(FlashEvent { session, kind });
    }

    fn state_of(&self, id: Uuid) -> Option<SessionState> {
        self.lock()
            .as_ref()
            .filter(|record| record.id == id)
            .map(|record| record.state.clone())
    }

    /// Move session `id` to `state` unless it already ended
    fn set_state(&self, id: Uuid, state: SessionState) -> bool {
        {
            let mut session = self.lock();
            match session.as_mut() {
                Some(record) if record.id == id && !record.state.is_terminal() => {
                    record.state = state.clone();
                }
                _ => return false,
            }
        }

        debug!(session = %id, state = ?state, "Session state changed");
        let cancelled = state == SessionState::Cancelled;
        self.send_event(id, FlashEventKind::StateChanged(state));
        if cancelled {
            self.send_event(id, FlashEventKind::Cancelled);
        }
        true
    }

    fn fail(&self, id: Uuid, error: FlashError) {
        if self.set_state(id, SessionState::Failed { error: error.to_string() }) {
            error!(session = %id, "Flash failed: {}", error);
            self.send_event(id, FlashEventKind::Failed(error));
        }
    }

    /// Quietly record transfer progress
    fn set_progress(&self, id: Uuid, sent: usize, total: usize) {
        if let Some(record) = self.lock().as_mut().filter(|record| record.id == id) {
            if !record.state.is_terminal() {
                record.state = SessionState::Transferring { sent, total };
            }
        }
        self.send_event(id, FlashEventKind::Progress { sent, total });
    }
}

/// Serializes flash sessions onto a single MIDI output
pub struct FlashOrchestrator {
    shared: Arc<Shared>,
    devices: watch::Receiver<Option<DeviceState>>,
}

impl FlashOrchestrator {
    /// Create an orchestrator writing to `transport` and following `devices`
    pub fn new(
        transport: Arc<tokio::sync::Mutex<Box<dyn SysExTransport>>>,
        devices: watch::Receiver<Option<DeviceState>>,
        config: FlashConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let config = FlashConfig {
            chunk_size: config.chunk_size.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                transport,
                event_tx,
                config,
            }),
            devices,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &FlashConfig {
        &self.shared.config
    }

    /// State of the current (or last) session
    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .as_ref()
            .map(|record| record.state.clone())
            .unwrap_or(SessionState::Idle)
    }

    /// Id and target of the current (or last) session
    pub fn current_session(&self) -> Option<(Uuid, Model)> {
        self.shared
            .lock()
            .as_ref()
            .map(|record| (record.id, record.model))
    }

    /// Admit a flash of `image` onto a `target` device
    ///
    /// Fails with [`FlashError::SessionBusy`] while another session is active,
    /// leaving that session untouched.
    pub fn queue_flash(
        &self,
        image: FirmwareImage,
        target: Model,
    ) -> Result<(CancelHandle, PendingFlash), FlashError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = Uuid::new_v4();

        {
            let mut session = self.shared.lock();
            if session.as_ref().is_some_and(|record| record.state.is_active()) {
                warn!(model = %target, "Rejecting flash, a session is already active");
                return Err(FlashError::SessionBusy);
            }
            let framed = sysex::split_messages(image.bytes()).is_some();
            if !target.is_flashable() || image.encoding() != Encoding::SysEx || !framed {
                warn!(model = %target, encoding = ?image.encoding(), "Rejecting flash, not flashable");
                return Err(FlashError::NotFlashable(target));
            }
            *session = Some(SessionRecord {
                id,
                model: target,
                state: SessionState::WaitingForBootloader,
                cancel_tx,
            });
        }

        let device_ready = self
            .devices
            .borrow()
            .as_ref()
            .is_some_and(|state| is_ready(state, target));
        info!(
            session = %id,
            model = %target,
            size = image.len(),
            device_ready,
            "Flash queued"
        );

        self.shared.send_event(
            id,
            FlashEventKind::StateChanged(SessionState::WaitingForBootloader),
        );
        self.shared.send_event(
            id,
            FlashEventKind::BootloaderPrompt {
                model: target,
                instructions: target.bootloader_instructions(),
                device_ready,
            },
        );

        let handle = CancelHandle {
            shared: self.shared.clone(),
            id,
        };
        let pending = PendingFlash {
            shared: self.shared.clone(),
            id,
            model: target,
            image: Some(image),
            devices: self.devices.clone(),
            cancel_rx,
            armed: true,
        };
        Ok((handle, pending))
    }
}

/// Cancels one session; cloning shares the same session
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
    id: Uuid,
}

impl CancelHandle {
    pub fn session(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; repeated calls have no further effect
    ///
    /// A waiting session ends immediately. A transferring session stops
    /// before its next chunk.
    pub fn cancel(&self) {
        let waiting = {
            let session = self.shared.lock();
            let Some(record) = session.as_ref().filter(|record| record.id == self.id) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            record.cancel_tx.send_replace(true);
            record.state == SessionState::WaitingForBootloader
        };

        if waiting && self.shared.set_state(self.id, SessionState::Cancelled) {
            info!(session = %self.id, "Flash cancelled while waiting for bootloader");
        } else {
            debug!(session = %self.id, "Cancellation requested");
        }
    }
}

/// An admitted session waiting for the device to become ready
///
/// Dropping it before it resolves fails the session with
/// [`FlashError::DeviceNotReady`].
pub struct PendingFlash {
    shared: Arc<Shared>,
    id: Uuid,
    model: Model,
    image: Option<FirmwareImage>,
    devices: watch::Receiver<Option<DeviceState>>,
    cancel_rx: watch::Receiver<bool>,
    armed: bool,
}

impl PendingFlash {
    pub fn session(&self) -> Uuid {
        self.id
    }

    /// Wait for a compatible bootloader
    ///
    /// Resolves to `Some(Transfer)` once the device is ready, or `None` if
    /// the session was cancelled first.
    pub async fn start(mut self) -> Result<Option<Transfer>, FlashError> {
        let mut cancel_open = true;

        loop {
            if *self.cancel_rx.borrow_and_update() || !self.is_waiting() {
                self.armed = false;
                return Ok(None);
            }

            let ready = self
                .devices
                .borrow_and_update()
                .as_ref()
                .is_some_and(|state| is_ready(state, self.model));
            if ready {
                return Ok(self.begin_transfer());
            }

            tokio::select! {
                changed = self.devices.changed() => {
                    if changed.is_err() {
                        self.armed = false;
                        self.shared.fail(self.id, FlashError::DeviceNotReady);
                        return Err(FlashError::DeviceNotReady);
                    }
                }
                changed = self.cancel_rx.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
            }
        }
    }

    fn is_waiting(&self) -> bool {
        self.shared.state_of(self.id) == Some(SessionState::WaitingForBootloader)
    }

    fn begin_transfer(&mut self) -> Option<Transfer> {
        self.armed = false;
        let image = self.image.take()?;
        let total = image.len();
        if !self
            .shared
            .set_state(self.id, SessionState::Transferring { sent: 0, total })
        {
            return None;
        }
        info!(session = %self.id, model = %self.model, "Bootloader ready");

        Some(Transfer {
            shared: self.shared.clone(),
            id: self.id,
            model: self.model,
            image,
            cancel_rx: self.cancel_rx.clone(),
            armed: true,
        })
    }
}

impl Drop for PendingFlash {
    fn drop(&mut self) {
        if self.armed && self.is_waiting() {
            warn!(session = %self.id, "Stopped waiting for bootloader");
            self.shared.fail(self.id, FlashError::DeviceNotReady);
        }
    }
}

/// A session whose device is ready to receive the image
///
/// Dropping it without running it cancels the session.
pub struct Transfer {
    shared: Arc<Shared>,
    id: Uuid,
    model: Model,
    image: FirmwareImage,
    cancel_rx: watch::Receiver<bool>,
    armed: bool,
}

impl Transfer {
    pub fn session(&self) -> Uuid {
        self.id
    }

    /// Stream the image to the device
    pub async fn run(mut self) -> Result<FlashReport, FlashError> {
        let result = self.transfer().await;
        self.armed = false;
        result
    }

    async fn transfer(&self) -> Result<FlashReport, FlashError> {
        let config = &self.shared.config;
        let bytes = self.image.bytes();
        let total = bytes.len();
        let Some(messages) = sysex::split_messages(bytes) else {
            let error = FlashError::NotFlashable(self.model);
            self.shared.fail(self.id, error.clone());
            return Err(error);
        };
        let chunks = messages.len();
        let started_at = Utc::now();
        let mut sent = 0;
        let mut retries = 0;

        info!(
            session = %self.id,
            model = %self.model,
            total,
            chunks,
            "Starting transfer"
        );

        for (index, chunk) in messages.into_iter().enumerate() {
            if *self.cancel_rx.borrow() {
                warn!(session = %self.id, sent, total, "Transfer cancelled");
                self.shared.set_state(self.id, SessionState::Cancelled);
                return Err(FlashError::UserCancelled);
            }

            let mut attempts = 0;
            loop {
                attempts += 1;
                let result = self.shared.transport.lock().await.send_chunk(chunk);
                match result {
                    Ok(()) => break,
                    Err(e) if attempts <= config.max_retries => {
                        retries += 1;
                        warn!(
                            session = %self.id,
                            chunk = index,
                            attempt = attempts,
                            "Chunk send failed, retrying: {}",
                            e
                        );
                        tokio::time::sleep(config.retry_delay).await;
                    }
                    Err(source) => {
                        let error = FlashError::TransferError {
                            chunk: index,
                            attempts,
                            source,
                        };
                        self.shared.fail(self.id, error.clone());
                        return Err(error);
                    }
                }
            }

            sent += chunk.len();
            self.shared.set_progress(self.id, sent, total);
            tokio::time::sleep(pacing_delay(config, chunk.len())).await;
        }

        self.shared.set_state(self.id, SessionState::Completing);
        tokio::time::sleep(config.settle_delay).await;

        let report = FlashReport {
            session: self.id,
            model: self.model,
            bytes_sent: sent,
            chunks,
            retries,
            started_at,
            finished_at: Utc::now(),
        };
        self.shared.set_state(self.id, SessionState::Done);
        info!(session = %self.id, bytes = sent, retries, "Flash complete");
        self.shared
            .send_event(self.id, FlashEventKind::Complete(report.clone()));
        Ok(report)
    }
}

/// Pause after a chunk of `len` bytes
///
/// A message longer than `chunk_size` is still sent in one write, so it
/// waits one `chunk_delay` for every `chunk_size` bytes it carries.
fn pacing_delay(config: &FlashConfig, len: usize) -> Duration {
    let intervals = u32::try_from(len.div_ceil(config.chunk_size)).unwrap_or(u32::MAX);
    config
        .chunk_delay
        .checked_mul(intervals.max(1))
        .unwrap_or(Duration::MAX)
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if self.armed && self.shared.set_state(self.id, SessionState::Cancelled) {
            warn!(session = %self.id, "Transfer abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::DeviceMonitor;
    use crate::transport::mock::MockTransport;
    use padflash_core::DeviceIdentity;

    fn fast_config() -> FlashConfig {
        FlashConfig {
            chunk_size: 4,
            chunk_delay: Duration::ZERO,
            max_retries: 2,
            retry_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
        }
    }

    /// A SysEx image made of messages of the given total lengths
    fn image(model: Model, lengths: &[usize]) -> FirmwareImage {
        let mut bytes = Vec::new();
        for &len in lengths {
            bytes.push(0xF0);
            bytes.extend((0..len.saturating_sub(2)).map(|i| (i % 0x80) as u8));
            bytes.push(0xF7);
        }
        FirmwareImage::new(model, Encoding::SysEx, bytes)
    }

    fn assert_whole_messages(sent: &[Vec<u8>]) {
        for chunk in sent {
            assert_eq!(chunk.first(), Some(&0xF0), "{chunk:02X?}");
            assert_eq!(chunk.last(), Some(&0xF7), "{chunk:02X?}");
            assert!(sysex::is_sysex(chunk), "{chunk:02X?}");
        }
    }

    fn orchestrator(mock: MockTransport, monitor: &DeviceMonitor) -> FlashOrchestrator {
        let transport: Arc<tokio::sync::Mutex<Box<dyn SysExTransport>>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(mock)));
        FlashOrchestrator::new(transport, monitor.subscribe(), fast_config())
    }

    fn ready_monitor(identity: DeviceIdentity) -> DeviceMonitor {
        let monitor = DeviceMonitor::new();
        monitor.publish(DeviceState::bootloader(identity));
        monitor
    }

    fn drain(rx: &mut broadcast::Receiver<FlashEvent>) -> Vec<FlashEventKind> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.kind);
        }
        events
    }

    #[tokio::test]
    async fn test_flash_ready_device() {
        let mock = MockTransport::new();
        let sent = mock.sent.clone();
        let monitor = ready_monitor(DeviceIdentity::LaunchpadMk2);
        let orchestrator = orchestrator(mock, &monitor);
        let mut events = orchestrator.subscribe();

        let image = image(Model::LaunchpadMk2, &[4, 4, 2]);
        let (_cancel, pending) = orchestrator
            .queue_flash(image.clone(), Model::LaunchpadMk2)
            .unwrap();
        let transfer = pending.start().await.unwrap().unwrap();
        let report = transfer.run().await.unwrap();

        assert_eq!(report.bytes_sent, 10);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.retries, 0);
        assert_eq!(sent.lock().unwrap().concat(), image.bytes());
        assert_whole_messages(&sent.lock().unwrap());
        assert_eq!(orchestrator.state(), SessionState::Done);

        let events = drain(&mut events);
        assert_eq!(
            events[0],
            FlashEventKind::StateChanged(SessionState::WaitingForBootloader)
        );
        assert!(matches!(
            events[1],
            FlashEventKind::BootloaderPrompt {
                model: Model::LaunchpadMk2,
                device_ready: true,
                ..
            }
        ));
        let progress: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                FlashEventKind::Progress { sent, .. } => Some(*sent),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![4, 8, 10]);
        assert!(events.contains(&FlashEventKind::StateChanged(SessionState::Completing)));
        assert!(matches!(events.last(), Some(FlashEventKind::Complete(_))));
    }

    #[tokio::test]
    async fn test_large_message_sent_in_one_write() {
        let mock = MockTransport::new();
        let sent = mock.sent.clone();
        let monitor = ready_monitor(DeviceIdentity::LaunchpadMk2);
        let orchestrator = orchestrator(mock, &monitor);
        let mut events = orchestrator.subscribe();

        // Far longer than the configured chunk size
        let payload: Vec<u8> = (0..=255).collect();
        let bytes = sysex::encode(&[0x00, 0x20, 0x29, 0x00, 0x69], &payload);
        let image = FirmwareImage::new(Model::LaunchpadMk2, Encoding::SysEx, bytes);

        let (_cancel, pending) = orchestrator
            .queue_flash(image.clone(), Model::LaunchpadMk2)
            .unwrap();
        let report = pending.start().await.unwrap().unwrap().run().await.unwrap();

        assert_eq!(report.chunks, 1);
        assert_eq!(report.bytes_sent, image.len());
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], image.bytes());
        assert_whole_messages(&sent);
        assert!(drain(&mut events).contains(&FlashEventKind::Progress {
            sent: image.len(),
            total: image.len()
        }));
    }

    #[tokio::test]
    async fn test_unframed_sysex_not_flashable() {
        let monitor = ready_monitor(DeviceIdentity::LaunchpadX);
        let orchestrator = orchestrator(MockTransport::new(), &monitor);

        let truncated = FirmwareImage::new(Model::LaunchpadX, Encoding::SysEx, vec![0xF0, 0x01, 0x02]);
        assert_eq!(
            orchestrator.queue_flash(truncated, Model::LaunchpadX).err(),
            Some(FlashError::NotFlashable(Model::LaunchpadX))
        );
        assert_eq!(orchestrator.state(), SessionState::Idle);
    }

    #[test]
    fn test_pacing_scales_with_message_length() {
        let config = FlashConfig {
            chunk_size: 4,
            chunk_delay: Duration::from_millis(10),
            ..FlashConfig::default()
        };
        assert_eq!(pacing_delay(&config, 0), Duration::from_millis(10));
        assert_eq!(pacing_delay(&config, 4), Duration::from_millis(10));
        assert_eq!(pacing_delay(&config, 5), Duration::from_millis(20));
        assert_eq!(pacing_delay(&config, 400), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_waits_for_compatible_bootloader() {
        let mock = MockTransport::new();
        let sent = mock.sent.clone();
        let monitor = DeviceMonitor::new();
        monitor.publish(DeviceState::normal(DeviceIdentity::LaunchpadPro));
        let orchestrator = orchestrator(mock, &monitor);

        let (_cancel, pending) = orchestrator
            .queue_flash(image(Model::CustomFirmware, &[4, 4]), Model::CustomFirmware)
            .unwrap();
        let waiter = tokio::spawn(pending.start());

        tokio::task::yield_now().await;
        monitor.publish(DeviceState::bootloader(DeviceIdentity::LaunchpadMk2));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(orchestrator.state(), SessionState::WaitingForBootloader);
        assert!(sent.lock().unwrap().is_empty());

        monitor.publish(DeviceState::bootloader(DeviceIdentity::LaunchpadPro));
        let transfer = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(
            orchestrator.state(),
            SessionState::Transferring { sent: 0, total: 8 }
        );
        transfer.run().await.unwrap();
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_session_rejected() {
        let monitor = DeviceMonitor::new();
        let orchestrator = orchestrator(MockTransport::new(), &monitor);

        let (_cancel, _pending) = orchestrator
            .queue_flash(image(Model::LaunchpadX, &[8]), Model::LaunchpadX)
            .unwrap();
        let (first, _) = orchestrator.current_session().unwrap();

        let second = orchestrator.queue_flash(image(Model::LaunchpadPro, &[8]), Model::LaunchpadPro);
        assert_eq!(second.err(), Some(FlashError::SessionBusy));
        assert_eq!(orchestrator.current_session(), Some((first, Model::LaunchpadX)));
        assert_eq!(orchestrator.state(), SessionState::WaitingForBootloader);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_sends_nothing() {
        let mock = MockTransport::new();
        let sent = mock.sent.clone();
        let monitor = DeviceMonitor::new();
        let orchestrator = orchestrator(mock, &monitor);
        let mut events = orchestrator.subscribe();

        let (cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadMiniMk3, &[8]), Model::LaunchpadMiniMk3)
            .unwrap();
        let waiter = tokio::spawn(pending.start());
        tokio::task::yield_now().await;

        cancel.cancel();
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap().is_none());

        // A device showing up afterwards changes nothing
        monitor.publish(DeviceState::bootloader(DeviceIdentity::LaunchpadMiniMk3));
        assert_eq!(orchestrator.state(), SessionState::Cancelled);
        assert!(sent.lock().unwrap().is_empty());

        let events = drain(&mut events);
        assert_eq!(
            events.iter().filter(|e| **e == FlashEventKind::Cancelled).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let monitor = ready_monitor(DeviceIdentity::LaunchpadX);
        let orchestrator = orchestrator(MockTransport::new(), &monitor);

        let (cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadX, &[8]), Model::LaunchpadX)
            .unwrap();
        cancel.cancel();

        assert!(pending.start().await.unwrap().is_none());
        assert_eq!(orchestrator.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let monitor = ready_monitor(DeviceIdentity::LaunchpadProMk3);
        let cancel_slot: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let hook_slot = cancel_slot.clone();

        let mut mock = MockTransport::new();
        let sent = mock.sent.clone();
        mock.on_send = Some(Box::new(move |count| {
            if count == 1 {
                if let Some(handle) = hook_slot.lock().unwrap().as_ref() {
                    handle.cancel();
                }
            }
        }));
        let orchestrator = orchestrator(mock, &monitor);

        let (cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadProMk3, &[4, 4, 4, 4]), Model::LaunchpadProMk3)
            .unwrap();
        *cancel_slot.lock().unwrap() = Some(cancel);

        let transfer = pending.start().await.unwrap().unwrap();
        assert_eq!(transfer.run().await, Err(FlashError::UserCancelled));

        // The chunk in flight completes, nothing after it is sent
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(orchestrator.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = MockTransport::new();
        *mock.failures.lock().unwrap() = 2;
        let sent = mock.sent.clone();
        let monitor = ready_monitor(DeviceIdentity::LaunchpadX);
        let orchestrator = orchestrator(mock, &monitor);

        let image = image(Model::LaunchpadX, &[4, 4]);
        let (_cancel, pending) = orchestrator
            .queue_flash(image.clone(), Model::LaunchpadX)
            .unwrap();
        let report = pending.start().await.unwrap().unwrap().run().await.unwrap();

        assert_eq!(report.retries, 2);
        assert_eq!(sent.lock().unwrap().concat(), image.bytes());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mock = MockTransport {
            broken: true,
            ..MockTransport::default()
        };
        let monitor = ready_monitor(DeviceIdentity::LaunchpadX);
        let orchestrator = orchestrator(mock, &monitor);
        let mut events = orchestrator.subscribe();

        let (_cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadX, &[8]), Model::LaunchpadX)
            .unwrap();
        let result = pending.start().await.unwrap().unwrap().run().await;

        assert!(matches!(
            result,
            Err(FlashError::TransferError { chunk: 0, attempts: 3, .. })
        ));
        assert!(matches!(orchestrator.state(), SessionState::Failed { .. }));
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, FlashEventKind::Failed(FlashError::TransferError { .. }))));

        // A failed session no longer blocks admission
        assert!(orchestrator
            .queue_flash(image(Model::LaunchpadX, &[8]), Model::LaunchpadX)
            .is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_wait_is_device_not_ready() {
        let monitor = DeviceMonitor::new();
        let orchestrator = orchestrator(MockTransport::new(), &monitor);
        let mut events = orchestrator.subscribe();

        let (_cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadPro, &[8]), Model::LaunchpadPro)
            .unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), pending.start()).await;
        assert!(timed_out.is_err());

        assert!(matches!(orchestrator.state(), SessionState::Failed { .. }));
        assert!(drain(&mut events).contains(&FlashEventKind::Failed(FlashError::DeviceNotReady)));
    }

    #[tokio::test]
    async fn test_monitor_gone_is_device_not_ready() {
        let monitor = DeviceMonitor::new();
        let orchestrator = orchestrator(MockTransport::new(), &monitor);
        let (_cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadPro, &[8]), Model::LaunchpadPro)
            .unwrap();
        drop(monitor);

        assert_eq!(pending.start().await.err(), Some(FlashError::DeviceNotReady));
    }

    #[tokio::test]
    async fn test_not_flashable() {
        let monitor = DeviceMonitor::new();
        let orchestrator = orchestrator(MockTransport::new(), &monitor);

        let hex = FirmwareImage::new(Model::MidiFighter64, Encoding::IntelHex, b":00000001FF\n".to_vec());
        assert_eq!(
            orchestrator.queue_flash(hex, Model::MidiFighter64).err(),
            Some(FlashError::NotFlashable(Model::MidiFighter64))
        );

        let raw = FirmwareImage::new(Model::LaunchpadX, Encoding::Raw, vec![0; 8]);
        assert_eq!(
            orchestrator.queue_flash(raw, Model::LaunchpadX).err(),
            Some(FlashError::NotFlashable(Model::LaunchpadX))
        );
        assert_eq!(orchestrator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_transfer_is_cancelled() {
        let monitor = ready_monitor(DeviceIdentity::LaunchpadX);
        let orchestrator = orchestrator(MockTransport::new(), &monitor);

        let (_cancel, pending) = orchestrator
            .queue_flash(image(Model::LaunchpadX, &[8]), Model::LaunchpadX)
            .unwrap();
        let transfer = pending.start().await.unwrap().unwrap();
        drop(transfer);

        assert_eq!(orchestrator.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_session_state_is_terminal() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::WaitingForBootloader.is_active());
        assert!(SessionState::Transferring { sent: 1, total: 2 }.is_active());
        assert!(SessionState::Completing.is_active());
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Failed { error: "x".to_string() }.is_terminal());
    }
}
