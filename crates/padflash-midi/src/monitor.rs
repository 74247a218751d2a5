//! Device presence monitoring
//!
//! [`DeviceMonitor`] holds the latest observed [`DeviceState`] and hands out
//! watch receivers to anyone that needs to follow it. The MIDI side feeds it
//! from identity replies; tests feed it directly.
//!
//! Entering a bootloader usually means re-plugging the device, which closes
//! any open port. The inquiry poller therefore owns the connections: it
//! re-resolves the port on every tick and reconnects when it comes back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use midir::{Ignore, MidiInput, MidiInputConnection};
use padflash_core::DeviceState;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::identity::{IdentityReply, INQUIRY_REQUEST};
use crate::transport::{
    output_port_present, MidiOutputTransport, SysExTransport, TransportError, Unconnected,
    CLIENT_NAME,
};

/// Missed inquiry replies before a device is considered gone
pub const MISSED_REPLIES_LIMIT: u32 = 3;

/// Latest observed device state
#[derive(Clone)]
pub struct DeviceMonitor {
    tx: Arc<watch::Sender<Option<DeviceState>>>,
    replies: Arc<AtomicU64>,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            replies: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a device observation, notifying watchers only on change
    pub fn publish(&self, state: DeviceState) {
        self.replies.fetch_add(1, Ordering::Relaxed);
        self.tx.send_if_modified(|current| {
            if *current == Some(state) {
                return false;
            }
            info!(device = %state, "Device state changed");
            *current = Some(state);
            true
        });
    }

    /// Record that no device is present
    pub fn disconnect(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                return false;
            }
            info!("Device disconnected");
            *current = None;
            true
        });
    }

    pub fn current(&self) -> Option<DeviceState> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceState>> {
        self.tx.subscribe()
    }

    /// Number of observations published so far
    pub fn reply_count(&self) -> u64 {
        self.replies.load(Ordering::Relaxed)
    }

    /// Handle an inbound MIDI message, publishing it if it is an identity reply
    pub fn handle_message(&self, message: &[u8]) {
        let Some(reply) = IdentityReply::parse(message) else {
            return;
        };
        match reply.device_state() {
            Some(state) => {
                trace!(device = %state, version = %reply.version_string(), "Identity reply");
                self.publish(state);
            }
            None => debug!(
                manufacturer = ?reply.manufacturer,
                family = ?reply.family,
                "Ignoring identity reply from unknown device"
            ),
        }
    }
}

impl Default for DeviceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds a [`DeviceMonitor`] from a MIDI input port
pub struct MidiIdentityListener {
    port_name: String,
    _connection: MidiInputConnection<()>,
}

impl MidiIdentityListener {
    /// Listen on the first input port whose name contains `port_filter`
    pub fn start(port_filter: &str, monitor: DeviceMonitor) -> Result<Self, TransportError> {
        let mut midi_in =
            MidiInput::new(CLIENT_NAME).map_err(|e| TransportError::Midi(e.to_string()))?;
        // SysEx is filtered by default
        midi_in.ignore(Ignore::None);

        let filter = port_filter.to_ascii_lowercase();
        let ports = midi_in.ports();
        let (port, port_name) = ports
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok().map(|name| (p, name)))
            .find(|(_, name)| name.to_ascii_lowercase().contains(&filter))
            .ok_or_else(|| TransportError::PortNotFound(port_filter.to_string()))?;
        let port = port.clone();

        let connection = midi_in
            .connect(
                &port,
                "padflash-in",
                move |_stamp, message, _| monitor.handle_message(message),
                (),
            )
            .map_err(|e| TransportError::Midi(e.to_string()))?;

        info!(port = %port_name, "Listening for identity replies");
        Ok(Self {
            port_name,
            _connection: connection,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Open connections to one device
pub struct PortLink {
    pub transport: Box<dyn SysExTransport>,
    /// Keeps the identity listener alive
    pub listener: Box<dyn Send>,
}

/// Resolves and opens the device's MIDI ports
pub trait PortConnector: Send + 'static {
    /// Whether the device's output port is currently present
    fn is_present(&mut self) -> bool;

    /// Open the output and start feeding `monitor` from the input
    fn connect(&mut self, monitor: &DeviceMonitor) -> Result<PortLink, TransportError>;
}

/// [`PortConnector`] over midir ports selected by name filters
pub struct MidiPorts {
    output_filter: String,
    input_filter: String,
}

impl MidiPorts {
    pub fn new(output_filter: &str, input_filter: &str) -> Self {
        Self {
            output_filter: output_filter.to_string(),
            input_filter: input_filter.to_string(),
        }
    }
}

impl PortConnector for MidiPorts {
    fn is_present(&mut self) -> bool {
        match output_port_present(&self.output_filter) {
            Ok(present) => present,
            Err(e) => {
                warn!("Failed to list MIDI ports: {}", e);
                false
            }
        }
    }

    fn connect(&mut self, monitor: &DeviceMonitor) -> Result<PortLink, TransportError> {
        let transport = MidiOutputTransport::connect(&self.output_filter)?;
        let listener = MidiIdentityListener::start(&self.input_filter, monitor.clone())?;
        Ok(PortLink {
            transport: Box::new(transport),
            listener: Box::new(listener),
        })
    }
}

/// Periodically send identity requests, keeping the device connected
///
/// Each tick re-resolves the device port. When it is missing the shared
/// transport is swapped for [`Unconnected`] and the device is reported gone;
/// when it is present but not connected, fresh connections are opened and
/// swapped in. A device silent for [`MISSED_REPLIES_LIMIT`] intervals, or a
/// failed request, is reported gone and reconnected on the next tick.
///
/// The poller shares the output transport, so it must be aborted before a
/// transfer starts.
pub fn spawn_inquiry_poller<C: PortConnector>(
    transport: Arc<Mutex<Box<dyn SysExTransport>>>,
    mut connector: C,
    monitor: DeviceMonitor,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut listener: Option<Box<dyn Send>> = None;
        let mut stale = false;
        let mut missed = 0u32;
        let mut last_count = monitor.reply_count();

        loop {
            ticker.tick().await;

            let present = connector.is_present();
            if listener.is_some() && (stale || !present) {
                *transport.lock().await = Box::new(Unconnected);
                listener = None;
                monitor.disconnect();
                info!(present, "Closed device ports");
            }
            stale = false;

            if listener.is_none() {
                if !present {
                    trace!("Device port not present");
                    continue;
                }
                match connector.connect(&monitor) {
                    Ok(link) => {
                        *transport.lock().await = link.transport;
                        listener = Some(link.listener);
                        missed = 0;
                        last_count = monitor.reply_count();
                        info!("Connected device ports");
                    }
                    Err(e) => {
                        debug!("Device port not ready: {}", e);
                        continue;
                    }
                }
            }

            let count = monitor.reply_count();
            if count == last_count {
                missed = missed.saturating_add(1);
                if missed == MISSED_REPLIES_LIMIT {
                    monitor.disconnect();
                    stale = true;
                }
            } else {
                missed = 0;
                last_count = count;
            }

            let result = transport.lock().await.send_chunk(&INQUIRY_REQUEST);
            if let Err(e) = result {
                warn!("Identity request failed: {}", e);
                stale = true;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NOVATION;
    use crate::transport::mock::MockTransport;
    use padflash_core::DeviceIdentity;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn test_publish_notifies_on_change_only() {
        let monitor = DeviceMonitor::new();
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow_and_update(), None);

        let state = DeviceState::normal(DeviceIdentity::LaunchpadX);
        monitor.publish(state);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(state));

        monitor.publish(state);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(monitor.reply_count(), 2);

        monitor.disconnect();
        assert!(rx.has_changed().unwrap());
        assert_eq!(monitor.current(), None);
    }

    #[test]
    fn test_handle_message() {
        let monitor = DeviceMonitor::new();
        let mut message = vec![0xF0, 0x7E, 0x00, 0x06, 0x02];
        message.extend_from_slice(&NOVATION);
        message.extend_from_slice(&[0x79, 0x00, 0x00, 0x00, 0x00, 0x01, 0x07, 0x02, 0xF7]);

        monitor.handle_message(&[0x90, 0x40, 0x7F]);
        assert_eq!(monitor.current(), None);

        monitor.handle_message(&message);
        assert_eq!(
            monitor.current(),
            Some(DeviceState::bootloader(DeviceIdentity::LaunchpadMk2))
        );
    }

    /// Ports that appear and disappear on demand
    struct MockPorts {
        present: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
        sent: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    impl MockPorts {
        fn new(present: bool) -> Self {
            Self {
                present: Arc::new(AtomicBool::new(present)),
                connects: Arc::new(AtomicUsize::new(0)),
                sent: Arc::default(),
            }
        }
    }

    impl PortConnector for MockPorts {
        fn is_present(&mut self) -> bool {
            self.present.load(Ordering::SeqCst)
        }

        fn connect(&mut self, _monitor: &DeviceMonitor) -> Result<PortLink, TransportError> {
            if !self.present.load(Ordering::SeqCst) {
                return Err(TransportError::PortNotFound("mock".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            let transport = MockTransport {
                sent: self.sent.clone(),
                ..MockTransport::default()
            };
            Ok(PortLink {
                transport: Box::new(transport),
                listener: Box::new(()),
            })
        }
    }

    fn unconnected() -> Arc<Mutex<Box<dyn SysExTransport>>> {
        Arc::new(Mutex::new(Box::new(Unconnected)))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_poller_sends_inquiries_and_times_out() {
        let ports = MockPorts::new(true);
        let sent = ports.sent.clone();

        let monitor = DeviceMonitor::new();
        monitor.publish(DeviceState::normal(DeviceIdentity::LaunchpadPro));
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        let poller = spawn_inquiry_poller(unconnected(), ports, monitor.clone(), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        poller.abort();

        assert_eq!(monitor.current(), None);
        let sent = sent.lock().unwrap();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|chunk| chunk[..] == INQUIRY_REQUEST));
    }

    #[tokio::test]
    async fn test_poller_waits_for_absent_device() {
        let ports = MockPorts::new(false);
        let present = ports.present.clone();
        let connects = ports.connects.clone();
        let sent = ports.sent.clone();
        let transport = unconnected();

        let monitor = DeviceMonitor::new();
        let poller = spawn_inquiry_poller(transport.clone(), ports, monitor, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(sent.lock().unwrap().is_empty());

        present.store(true, Ordering::SeqCst);
        wait_until(|| !sent.lock().unwrap().is_empty()).await;
        poller.abort();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        // The connected transport was swapped into the shared slot
        transport.lock().await.send_chunk(&[0xF0, 0xF7]).unwrap();
    }

    #[tokio::test]
    async fn test_poller_reconnects_after_replug() {
        let ports = MockPorts::new(true);
        let present = ports.present.clone();
        let connects = ports.connects.clone();
        let transport = unconnected();

        let monitor = DeviceMonitor::new();
        let poller = spawn_inquiry_poller(transport.clone(), ports, monitor.clone(), Duration::from_millis(5));

        wait_until(|| connects.load(Ordering::SeqCst) >= 1).await;
        monitor.publish(DeviceState::normal(DeviceIdentity::LaunchpadX));

        // Unplugged: ports closed and the device reported gone
        present.store(false, Ordering::SeqCst);
        wait_until(|| {
            transport.try_lock().is_ok_and(|mut transport| {
                transport.send_chunk(&INQUIRY_REQUEST) == Err(TransportError::Disconnected)
            })
        })
        .await;
        assert_eq!(monitor.current(), None);
        let before = connects.load(Ordering::SeqCst);

        // Plugged back in, now in its bootloader
        present.store(true, Ordering::SeqCst);
        wait_until(|| connects.load(Ordering::SeqCst) > before).await;
        monitor.publish(DeviceState::bootloader(DeviceIdentity::LaunchpadX));
        poller.abort();

        assert_eq!(
            monitor.current(),
            Some(DeviceState::bootloader(DeviceIdentity::LaunchpadX))
        );
    }
}
