//! # Echo Radio Device - Loopback Testing Implementation
//!
//! This module provides a loopback device: every transmitted frame comes
//! straight back as a received packet with synthetic link readings. A single
//! node driving this device hears its own traffic, which exercises the whole
//! receive path (reassembly, logging, forwarding rules, acknowledgements)
//! without any radio hardware.
//!
//! The received-packet flag is an [`AtomicBool`] written on transmit and
//! consumed by `packet_pending`, the same single-producer single-consumer
//! handshake a real driver performs between its interrupt handler and the
//! poll loop.

use crate::radio_devices::{RadioDeviceError, RadioDeviceInitError, ReceivedFrame};
use crate::RadioConfiguration;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{log, Level};

/// Link readings attached to every echoed frame.
const ECHO_RSSI: f32 = -42.0;
const ECHO_SNR: f32 = 9.0;

/// Loopback radio device.
pub struct RadioDevice {
    inited: bool,
    receiving: bool,
    packet_flag: AtomicBool,
    pending: Option<ReceivedFrame>,
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            inited: false,
            receiving: false,
            packet_flag: AtomicBool::new(false),
            pending: None,
        }
    }

    pub fn begin(&mut self, _config: &RadioConfiguration) -> Result<(), RadioDeviceInitError> {
        log!(Level::Debug, "Echo radio up, transmissions will loop back");
        self.inited = true;
        Ok(())
    }

    /// Arms a single receive.
    pub fn start_receive(&mut self) {
        self.receiving = true;
    }

    /// Polls and consumes the received-packet flag.
    pub fn packet_pending(&mut self) -> bool {
        if !self.inited || !self.receiving {
            return false;
        }
        self.packet_flag.swap(false, Ordering::AcqRel) || self.pending.is_some()
    }

    /// Takes the looped-back frame and disarms the receive.
    pub fn read_data(&mut self) -> Result<ReceivedFrame, RadioDeviceError> {
        self.receiving = false;
        self.pending.take().ok_or(RadioDeviceError::NothingToRead)
    }

    /// Queues the frame for loopback. An un-read previous frame is lost, the
    /// way two back-to-back transmissions collide on a half-duplex channel.
    pub fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if !self.inited {
            return Err(RadioDeviceError::TransmitFailed);
        }
        let data = heapless::Vec::from_slice(data).map_err(|_| RadioDeviceError::TransmitFailed)?;
        if self.pending.is_some() {
            log!(Level::Trace, "Echoed frame overwritten before it was read");
        }
        self.pending = Some(ReceivedFrame {
            data,
            rssi: ECHO_RSSI,
            snr: ECHO_SNR,
        });
        self.packet_flag.store(true, Ordering::Release);
        Ok(())
    }
}

impl Default for RadioDevice {
    fn default() -> Self {
        RadioDevice::new()
    }
}
