//! padflash MIDI - device monitoring and SysEx flash sessions
//!
//! This crate connects the pure patch engine to real hardware:
//! - midir-backed SysEx output transport
//! - Universal Device Inquiry parsing and device monitoring across re-plugs
//! - Single-session flash orchestration with pacing, retries and cancellation

pub mod identity;
pub mod monitor;
pub mod session;
pub mod transport;

pub use identity::{IdentityReply, INQUIRY_REQUEST};
pub use monitor::{
    spawn_inquiry_poller, DeviceMonitor, MidiIdentityListener, MidiPorts, PortConnector, PortLink,
};
pub use session::{
    CancelHandle, FlashConfig, FlashError, FlashEvent, FlashEventKind, FlashOrchestrator,
    FlashReport, PendingFlash, SessionState, Transfer,
};
pub use transport::{
    list_input_ports, list_output_ports, output_port_present, MidiOutputTransport, SysExTransport,
    TransportError, Unconnected,
};
