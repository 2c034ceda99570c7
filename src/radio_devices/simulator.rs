//! # Radio Device Simulator - Testing and Development Mock
//!
//! This module provides a simulated radio device for testing and development
//! without physical hardware. It behaves like a half-duplex transceiver whose
//! air interface is a pair of Embassy channels:
//!
//! - **Injection Queue**: frames pushed by a test or network harness appear
//!   to the node as received packets, complete with RSSI and SNR readings
//! - **Capture Queue**: every frame the node transmits is delivered to the
//!   harness for inspection
//!
//! The receive side follows the real driver's flow: a frame only becomes
//! visible through `packet_pending` while a receive is armed, `read_data`
//! consumes it and disarms, and `start_receive` arms again. Frames injected
//! while the device is busy stay buffered in the channel and surface on the
//! next armed poll, which is exactly how a packet that arrives during a
//! transmission behaves on the air.

use crate::radio_devices::{RadioDeviceError, RadioDeviceInitError, ReceivedFrame};
use crate::{RadioConfiguration, MAX_WIRE_LEN};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{log, Level};

/// Size of the injection and capture queues
///
/// Deep enough for a full fragmented message to sit in either direction
/// before the harness or the node catches up.
pub const SIMULATOR_QUEUE_SIZE: usize = 16;

/// Frame injection queue type
///
/// Channel the test harness pushes frames into to have the node receive them.
pub type FrameInjectionQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;

/// Frame injection queue sender type
///
/// Held by the harness; the giving end of the simulated air interface.
pub type FrameInjectionQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;

/// Frame injection queue receiver type
///
/// Held by the device; polled whenever a receive is armed.
pub type FrameInjectionQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, SIMULATOR_QUEUE_SIZE>;

/// Transmit capture queue type
///
/// Channel that collects every frame the node hands to `transmit`.
pub type TransmitCaptureQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, TransmittedFrame, SIMULATOR_QUEUE_SIZE>;

/// Transmit capture queue sender type
///
/// Held by the device; filled on every successful `transmit`.
pub type TransmitCaptureQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, TransmittedFrame, SIMULATOR_QUEUE_SIZE>;

/// Transmit capture queue receiver type
///
/// Held by the harness to observe the node's transmissions.
pub type TransmitCaptureQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, TransmittedFrame, SIMULATOR_QUEUE_SIZE>;

/// One frame captured from the node's transmit path.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmittedFrame {
    pub data: heapless::Vec<u8, MAX_WIRE_LEN>,
}

impl TransmittedFrame {
    /// The frame as text, or `None` when it is not valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        core::str::from_utf8(&self.data).ok()
    }
}

/// Simulated radio transceiver backed by injection and capture channels.
pub struct RadioDevice {
    inited: bool,
    receiving: bool,
    pending: Option<ReceivedFrame>,
    injection: FrameInjectionQueueReceiver,
    capture: TransmitCaptureQueueSender,
}

impl RadioDevice {
    /// Creates a device wired to an existing channel pair. The harness keeps
    /// the matching [`FrameInjectionQueueSender`] and
    /// [`TransmitCaptureQueueReceiver`].
    pub fn with(injection: FrameInjectionQueueReceiver, capture: TransmitCaptureQueueSender) -> Self {
        RadioDevice {
            inited: false,
            receiving: false,
            pending: None,
            injection,
            capture,
        }
    }

    /// Creates a device over freshly leaked channels and returns the harness
    /// ends alongside it.
    #[cfg(feature = "std")]
    pub fn with_leaked_queues() -> (Self, FrameInjectionQueueSender, TransmitCaptureQueueReceiver) {
        let injection: &'static FrameInjectionQueue = Box::leak(Box::new(embassy_sync::channel::Channel::new()));
        let capture: &'static TransmitCaptureQueue = Box::leak(Box::new(embassy_sync::channel::Channel::new()));
        (
            RadioDevice::with(injection.receiver(), capture.sender()),
            injection.sender(),
            capture.receiver(),
        )
    }

    pub fn begin(&mut self, config: &RadioConfiguration) -> Result<(), RadioDeviceInitError> {
        log!(
            Level::Debug,
            "Simulated radio up at {} MHz, SF{}, sync word {:#04x}",
            config.frequency_mhz,
            config.spreading_factor,
            config.sync_word
        );
        self.inited = true;
        Ok(())
    }

    /// Arms a single receive. Without this, injected frames stay buffered.
    pub fn start_receive(&mut self) {
        self.receiving = true;
    }

    /// Polls for a received frame. True means `read_data` will yield one.
    pub fn packet_pending(&mut self) -> bool {
        if !self.inited || !self.receiving {
            return false;
        }
        if self.pending.is_none() {
            if let Ok(frame) = self.injection.try_receive() {
                self.pending = Some(frame);
            }
        }
        self.pending.is_some()
    }

    /// Takes the pending frame and disarms the receive.
    pub fn read_data(&mut self) -> Result<ReceivedFrame, RadioDeviceError> {
        self.receiving = false;
        self.pending.take().ok_or(RadioDeviceError::NothingToRead)
    }

    /// Sends one frame into the capture queue. Fails when the device is not
    /// up, the frame exceeds a packet, or the harness stopped draining.
    pub fn transmit(&mut self, data: &[u8]) -> Result<(), RadioDeviceError> {
        if !self.inited {
            return Err(RadioDeviceError::TransmitFailed);
        }
        let data = heapless::Vec::from_slice(data).map_err(|_| RadioDeviceError::TransmitFailed)?;
        self.capture
            .try_send(TransmittedFrame { data })
            .map_err(|_| RadioDeviceError::TransmitFailed)
    }
}
