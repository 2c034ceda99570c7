//! Radio device implementations
//!
//! This module contains the radio device backends the mesh node can drive,
//! plus the frame and error types shared by all of them:
//!
//! - `echo`: loopback device that hands every transmission back as a
//!   received packet, for single-node testing
//! - `simulator`: channel-driven device for multi-node and unit testing,
//!   with frame injection and transmit capture
//!
//! Every backend exposes the same inherent methods, so the node works
//! against whichever one the active feature re-exports as [`RadioDevice`]:
//!
//! - `begin` applies the link configuration and powers the device up
//! - `start_receive` arms a single receive, typically re-armed after every
//!   handled packet
//! - `packet_pending` polls and consumes the received-packet flag that the
//!   device's interrupt (or its stand-in) sets
//! - `read_data` takes the pending frame together with its RSSI and SNR
//! - `transmit` sends one frame, blocking the half-duplex channel while it
//!   runs

use crate::MAX_WIRE_LEN;

#[cfg(feature = "radio-device-echo")]
pub mod echo;

#[cfg(feature = "radio-device-simulator")]
pub mod simulator;

// Re-export the active radio device implementation
#[cfg(feature = "radio-device-echo")]
pub use echo::RadioDevice;

#[cfg(feature = "radio-device-simulator")]
pub use simulator::RadioDevice;

/// One packet as it came off the air: raw bytes plus the link readings
/// sampled at reception.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub data: heapless::Vec<u8, MAX_WIRE_LEN>,
    pub rssi: f32,
    pub snr: f32,
}

impl ReceivedFrame {
    /// Builds a frame from text, or `None` when it does not fit a packet.
    pub fn from_text(text: &str, rssi: f32, snr: f32) -> Option<Self> {
        let data = heapless::Vec::from_slice(text.as_bytes()).ok()?;
        Some(ReceivedFrame { data, rssi, snr })
    }
}

/// Errors surfaced by a powered-up device.
#[derive(Debug)]
pub enum RadioDeviceError {
    /// `read_data` was called with no pending frame.
    NothingToRead,
    /// The frame could not be sent, or does not fit a packet.
    TransmitFailed,
}

/// Errors surfaced by `begin`.
#[derive(Debug)]
pub enum RadioDeviceInitError {
    /// The device could not be brought up with the given configuration.
    InitFailed,
}
