//! SysEx output transport over a MIDI port

use midir::{Ignore, MidiInput, MidiOutput, MidiOutputConnection};
use padflash_core::sysex;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Client name announced to the MIDI backend
pub const CLIENT_NAME: &str = "padflash";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("MIDI output is not connected")]
    Disconnected,
    #[error("No MIDI port matching '{0}'")]
    PortNotFound(String),
    #[error("MIDI send failed: {0}")]
    Send(String),
    #[error("MIDI backend error: {0}")]
    Midi(String),
}

/// Sink for outbound SysEx chunks
///
/// Every chunk is one complete message, `F0 ... F7` for SysEx. A call either
/// delivers the whole chunk to the device or returns an error; no partial
/// chunk is ever left on the wire.
pub trait SysExTransport: Send {
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError>;
}

/// Stand-in transport while no device port is open
pub struct Unconnected;

impl SysExTransport for Unconnected {
    fn send_chunk(&mut self, _chunk: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Disconnected)
    }
}

/// Whether a port name contains `filter` (case-insensitive)
pub(crate) fn matches_filter(name: &str, filter: &str) -> bool {
    name.to_ascii_lowercase()
        .contains(&filter.to_ascii_lowercase())
}

/// Reject a SysEx chunk that is not exactly one framed message
///
/// Some backends (WinMM) only accept whole SysEx messages in a single write.
fn check_whole_message(chunk: &[u8]) -> Result<(), TransportError> {
    if chunk.first() == Some(&sysex::SYSEX_START) && !sysex::is_sysex(chunk) {
        return Err(TransportError::Send(format!(
            "chunk of {} bytes is not a single SysEx message",
            chunk.len()
        )));
    }
    Ok(())
}

/// Output transport backed by a midir connection
pub struct MidiOutputTransport {
    port_name: String,
    connection: Option<MidiOutputConnection>,
}

impl MidiOutputTransport {
    /// Connect to the first output port whose name contains `port_filter`
    pub fn connect(port_filter: &str) -> Result<Self, TransportError> {
        let midi_out =
            MidiOutput::new(CLIENT_NAME).map_err(|e| TransportError::Midi(e.to_string()))?;

        let ports = midi_out.ports();
        let (port, port_name) = ports
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok().map(|name| (p, name)))
            .find(|(_, name)| matches_filter(name, port_filter))
            .ok_or_else(|| TransportError::PortNotFound(port_filter.to_string()))?;
        let port = port.clone();

        let connection = midi_out
            .connect(&port, "padflash-out")
            .map_err(|e| TransportError::Midi(e.to_string()))?;

        info!(port = %port_name, "Connected MIDI output");
        Ok(Self {
            port_name,
            connection: Some(connection),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Close the underlying connection; later sends fail with `Disconnected`
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            debug!(port = %self.port_name, "Closed MIDI output");
        }
    }
}

impl SysExTransport for MidiOutputTransport {
    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(TransportError::Disconnected)?;
        check_whole_message(chunk)?;
        trace!(port = %self.port_name, len = chunk.len(), "Sending SysEx chunk");
        connection
            .send(chunk)
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

impl Drop for MidiOutputTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of available MIDI input ports
pub fn list_input_ports() -> Result<Vec<String>, TransportError> {
    let mut midi_in =
        MidiInput::new(CLIENT_NAME).map_err(|e| TransportError::Midi(e.to_string()))?;
    midi_in.ignore(Ignore::None);
    midi_in
        .ports()
        .iter()
        .map(|p| midi_in.port_name(p).map_err(|e| TransportError::Midi(e.to_string())))
        .collect()
}

/// Names of available MIDI output ports
pub fn list_output_ports() -> Result<Vec<String>, TransportError> {
    let midi_out =
        MidiOutput::new(CLIENT_NAME).map_err(|e| TransportError::Midi(e.to_string()))?;
    midi_out
        .ports()
        .iter()
        .map(|p| midi_out.port_name(p).map_err(|e| TransportError::Midi(e.to_string())))
        .collect()
}

/// Whether an output port matching `port_filter` is currently present
pub fn output_port_present(port_filter: &str) -> Result<bool, TransportError> {
    Ok(list_output_ports()?
        .iter()
        .any(|name| matches_filter(name, port_filter)))
}
