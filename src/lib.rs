#![cfg_attr(not(feature = "std"), no_std)]

//! Single-channel mesh networking over small-MTU broadcast radios: delimiter
//! framing, fragmentation and reassembly, neighbour tracking, flood
//! forwarding and acknowledgement correlation, driven by one half-duplex
//! poll loop.

#[cfg(all(feature = "radio-device-echo", feature = "radio-device-simulator"))]
compile_error!("Only one radio device feature can be enabled at a time");

#[cfg(all(not(test), not(any(feature = "radio-device-echo", feature = "radio-device-simulator"))))]
compile_error!("At least one radio device feature must be enabled");

mod ack_tracker;
mod engine;
mod fragmentation;
mod message_log;
mod neighbours;
pub mod radio_devices;
mod wire;

use crate::engine::MeshEngine;
use crate::radio_devices::RadioDevice;
use core::fmt::Write as _;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(feature = "std")]
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use log::log;

pub use message_log::{MessageLog, ReceivedMessage};
pub use neighbours::{NeighbourEntry, NeighbourInfo, NeighbourTable};
pub use radio_devices::{RadioDeviceError, RadioDeviceInitError, ReceivedFrame};

//Wire format constants, shared by every node on a channel
pub const MAX_WIRE_LEN: usize = 384;
pub const MAX_FRAGMENT_PAYLOAD: usize = 80;
pub const MAX_NODE_ID_LEN: usize = 32;
pub const MAX_MSG_ID_LEN: usize = 24;

//Local bookkeeping constants, tunable per node without breaking compatibility
pub const MESSAGE_LOG_CAPACITY: usize = 100;
pub const MESSAGE_MAX_AGE: Duration = Duration::from_secs(300);
pub const BEACON_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_NEIGHBOURS: usize = 32;
pub(crate) const MAX_TRACKED_ACKS: usize = 32;
pub(crate) const FRAGMENT_POOL_SIZE: usize = 12;
pub(crate) const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const INTER_FRAGMENT_DELAY: Duration = Duration::from_millis(10);

/// Pause between poll cycles in [`RadioMeshNode::run`].
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Receiver recorded on envelopes; every transmission is a broadcast.
pub const BROADCAST_RECEIVER: &str = "ALL";

/// A node identifier, at most [`MAX_NODE_ID_LEN`] bytes.
pub type NodeId = heapless::String<MAX_NODE_ID_LEN>;
/// A message identifier, at most [`MAX_MSG_ID_LEN`] bytes.
pub type MsgId = heapless::String<MAX_MSG_ID_LEN>;
/// Message or packet text, at most one wire string.
pub type MessageText = heapless::String<MAX_WIRE_LEN>;

/// Derives the default node id from a hardware unique id, as
/// `NODE_` followed by twelve hex digits.
pub fn node_id_from_unique(unique: u64) -> NodeId {
    let mut id = NodeId::new();
    // 17 bytes, always fits the id capacity
    let _ = write!(id, "NODE_{:04X}{:08X}", (unique >> 32) as u16, unique as u32);
    id
}

/// Link and identity parameters applied by `begin`.
///
/// The link fields must match on every node sharing a channel; only
/// `node_id` is per-node.
pub struct RadioConfiguration {
    /// Identity announced in beacons and stamped on outgoing traffic
    pub node_id: NodeId,
    /// Carrier frequency in MHz
    pub frequency_mhz: f32,
    /// Channel bandwidth in kHz
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    /// Private sync word separating this mesh from other traffic
    pub sync_word: u8,
}

impl RadioConfiguration {
    /// Default link parameters with the given node id.
    pub fn with(node_id: &str) -> Self {
        RadioConfiguration {
            node_id: wire::bounded_lossy(node_id),
            ..RadioConfiguration::default()
        }
    }
}

impl Default for RadioConfiguration {
    fn default() -> Self {
        RadioConfiguration {
            node_id: NodeId::new(),
            frequency_mhz: 868.0,
            bandwidth_khz: 125.0,
            spreading_factor: 12,
            coding_rate: 8,
            sync_word: 0x56,
        }
    }
}

/// Local dispatch tag carried on queued envelopes. Never serialized to the
/// wire, which carries plain text for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Generic text traffic
    Message,
    /// User record announcements
    User,
    /// File transfer payloads
    File,
    /// Neighbour table reports
    TableNeighbours,
}

/// One message as it crosses the queue boundary between the application and
/// the poll loop, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioMessage {
    pub sender: NodeId,
    pub receiver: NodeId,
    /// Empty until the send path allocates an id; extracted id on delivery
    pub msg_id: MsgId,
    pub kind: MessageKind,
    pub content: MessageText,
}

impl RadioMessage {
    /// Builds an outgoing broadcast envelope. Content longer than a wire
    /// string is truncated at a character boundary.
    pub fn new_text(kind: MessageKind, sender: &str, content: &str) -> Self {
        RadioMessage {
            sender: wire::bounded_lossy(sender),
            receiver: wire::bounded_lossy(BROADCAST_RECEIVER),
            msg_id: MsgId::new(),
            kind,
            content: wire::bounded_lossy(content),
        }
    }
}

pub enum SendMessageError {
    ChannelFull,
    NotInited,
}

pub enum ReceiveMessageError {
    NotInited,
    QueueEmpty,
}

pub enum TransmitMessageError {
    NotInited,
    MessageTooLong,
}

pub const OUTGOING_MESSAGE_QUEUE_SIZE: usize = 10;
pub type OutgoingMessageQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, RadioMessage, OUTGOING_MESSAGE_QUEUE_SIZE>;
pub type OutgoingMessageQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, RadioMessage, OUTGOING_MESSAGE_QUEUE_SIZE>;
pub type OutgoingMessageQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, RadioMessage, OUTGOING_MESSAGE_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static OUTGOING_MESSAGE_QUEUE: OutgoingMessageQueue = embassy_sync::channel::Channel::new();

pub const INCOMING_MESSAGE_QUEUE_SIZE: usize = 10;
pub type IncomingMessageQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, RadioMessage, INCOMING_MESSAGE_QUEUE_SIZE>;
pub type IncomingMessageQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, RadioMessage, INCOMING_MESSAGE_QUEUE_SIZE>;
pub type IncomingMessageQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, RadioMessage, INCOMING_MESSAGE_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static INCOMING_MESSAGE_QUEUE: IncomingMessageQueue = embassy_sync::channel::Channel::new();

enum RadioMeshNodeState {
    Uninitialized,
    Initialized {
        device: RadioDevice,
        outgoing_message_queue_sender: OutgoingMessageQueueSender,
        outgoing_message_queue_receiver: OutgoingMessageQueueReceiver,
        incoming_message_queue_sender: IncomingMessageQueueSender,
        incoming_message_queue_receiver: IncomingMessageQueueReceiver,
    },
}

/// One mesh node: owns the radio device, the protocol state and both queue
/// endpoints. Everything runs inside the caller's poll, there are no
/// background tasks.
///
/// Lifecycle: [`new`](RadioMeshNode::new), [`begin`](RadioMeshNode::begin),
/// then either [`run`](RadioMeshNode::run) or repeated calls to
/// [`poll`](RadioMeshNode::poll) from the application's own loop.
pub struct RadioMeshNode {
    state: RadioMeshNodeState,
    engine: MeshEngine,
}

impl RadioMeshNode {
    pub const fn new() -> Self {
        RadioMeshNode {
            state: RadioMeshNodeState::Uninitialized,
            engine: MeshEngine::new(),
        }
    }

    #[cfg(feature = "embedded")]
    pub fn begin(&mut self, config: RadioConfiguration, radio_device: RadioDevice) -> Result<(), RadioDeviceInitError> {
        return self.begin_common(config, radio_device, &OUTGOING_MESSAGE_QUEUE, &INCOMING_MESSAGE_QUEUE);
    }

    #[cfg(feature = "std")]
    pub fn begin(&mut self, config: RadioConfiguration, radio_device: RadioDevice) -> Result<(), RadioDeviceInitError> {
        let outgoing_message_queue_temp: OutgoingMessageQueue = Channel::new();
        let outgoing_message_queue_static: &'static OutgoingMessageQueue = Box::leak(Box::new(outgoing_message_queue_temp));

        let incoming_message_queue_temp: IncomingMessageQueue = Channel::new();
        let incoming_message_queue_static: &'static IncomingMessageQueue = Box::leak(Box::new(incoming_message_queue_temp));

        return self.begin_common(config, radio_device, outgoing_message_queue_static, incoming_message_queue_static);
    }

    fn begin_common(
        &mut self,
        config: RadioConfiguration,
        mut radio_device: RadioDevice,
        outgoing_message_queue: &'static OutgoingMessageQueue,
        incoming_message_queue: &'static IncomingMessageQueue,
    ) -> Result<(), RadioDeviceInitError> {
        radio_device.begin(&config)?;
        radio_device.start_receive();

        let RadioConfiguration { node_id, .. } = config;
        self.engine = MeshEngine::with(node_id, Instant::now());

        self.state = RadioMeshNodeState::Initialized {
            device: radio_device,
            outgoing_message_queue_sender: outgoing_message_queue.sender(),
            outgoing_message_queue_receiver: outgoing_message_queue.receiver(),
            incoming_message_queue_sender: incoming_message_queue.sender(),
            incoming_message_queue_receiver: incoming_message_queue.receiver(),
        };
        log!(log::Level::Info, "Radio mesh node {} initialized", self.engine.node_id());
        Ok(())
    }

    /// One poll cycle: handle a pending received packet, emit the beacon when
    /// due, then transmit everything queued by the application.
    pub async fn poll(&mut self) {
        let RadioMeshNodeState::Initialized {
            device,
            outgoing_message_queue_receiver,
            incoming_message_queue_sender,
            ..
        } = &mut self.state
        else {
            log!(log::Level::Warn, "poll called before begin, ignoring");
            return;
        };
        self.engine
            .poll_cycle(device, *outgoing_message_queue_receiver, *incoming_message_queue_sender, Instant::now())
            .await;
    }

    /// Polls forever. Spawn this on an executor when the application does not
    /// need its own loop around [`poll`](RadioMeshNode::poll).
    pub async fn run(&mut self) {
        loop {
            self.poll().await;
            Timer::after(POLL_INTERVAL).await;
        }
    }

    /// Queues an envelope for transmission in an upcoming poll cycle.
    pub fn send_message(&self, message: RadioMessage) -> Result<(), SendMessageError> {
        let outgoing_message_queue_sender = match &self.state {
            RadioMeshNodeState::Uninitialized => {
                return Err(SendMessageError::NotInited);
            }
            RadioMeshNodeState::Initialized {
                outgoing_message_queue_sender, ..
            } => outgoing_message_queue_sender,
        };
        outgoing_message_queue_sender.try_send(message).map_err(|_| {
            log!(log::Level::Warn, "Failed to enqueue message. The queue is full. Dropping message");
            SendMessageError::ChannelFull
        })?;
        Ok(())
    }

    /// Queues plain text under this node's identity.
    pub fn send_text(&self, kind: MessageKind, content: &str) -> Result<(), SendMessageError> {
        self.send_message(RadioMessage::new_text(kind, self.engine.node_id(), content))
    }

    /// Transmits `text` immediately, fragmenting when the wire string exceeds
    /// one packet, and returns the allocated message id for
    /// [`is_acked`](RadioMeshNode::is_acked) correlation. Bypasses the
    /// outgoing queue; prefer [`send_message`](RadioMeshNode::send_message)
    /// unless the id is needed.
    pub async fn send_message_with_ack(&mut self, text: &str) -> Result<MsgId, TransmitMessageError> {
        let RadioMeshNodeState::Initialized { device, .. } = &mut self.state else {
            return Err(TransmitMessageError::NotInited);
        };
        self.engine.send_message_with_ack(device, text, Instant::now()).await
    }

    /// Waits for the next received message addressed to the application.
    pub async fn receive_message(&self) -> Result<RadioMessage, ReceiveMessageError> {
        let incoming_message_queue_receiver = match &self.state {
            RadioMeshNodeState::Uninitialized => {
                return Err(ReceiveMessageError::NotInited);
            }
            RadioMeshNodeState::Initialized {
                incoming_message_queue_receiver,
                ..
            } => incoming_message_queue_receiver,
        };
        return Ok(incoming_message_queue_receiver.receive().await);
    }

    /// Non-blocking variant of [`receive_message`](RadioMeshNode::receive_message).
    pub fn try_receive_message(&self) -> Result<RadioMessage, ReceiveMessageError> {
        let incoming_message_queue_receiver = match &self.state {
            RadioMeshNodeState::Uninitialized => {
                return Err(ReceiveMessageError::NotInited);
            }
            RadioMeshNodeState::Initialized {
                incoming_message_queue_receiver,
                ..
            } => incoming_message_queue_receiver,
        };
        incoming_message_queue_receiver.try_receive().map_err(|_| ReceiveMessageError::QueueEmpty)
    }

    /// Sender endpoint for producers that outlive a borrow of the node.
    pub fn outgoing_queue_sender(&self) -> Result<OutgoingMessageQueueSender, SendMessageError> {
        match &self.state {
            RadioMeshNodeState::Uninitialized => Err(SendMessageError::NotInited),
            RadioMeshNodeState::Initialized {
                outgoing_message_queue_sender, ..
            } => Ok(*outgoing_message_queue_sender),
        }
    }

    /// Receiver endpoint for consumers that outlive a borrow of the node.
    pub fn incoming_queue_receiver(&self) -> Result<IncomingMessageQueueReceiver, ReceiveMessageError> {
        match &self.state {
            RadioMeshNodeState::Uninitialized => Err(ReceiveMessageError::NotInited),
            RadioMeshNodeState::Initialized {
                incoming_message_queue_receiver,
                ..
            } => Ok(*incoming_message_queue_receiver),
        }
    }

    /// Whether an acknowledgement for one of our message ids has been heard.
    pub fn is_acked(&self, msg_id: &str) -> bool {
        self.engine.is_acked(msg_id)
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    /// Stations heard so far with their freshest link readings.
    pub fn neighbours(&self) -> &NeighbourTable {
        &self.engine.neighbours
    }

    /// Assembled non-acknowledgement traffic, newest last.
    pub fn message_log(&self) -> &MessageLog {
        &self.engine.message_log
    }

    /// Every readable frame as it arrived, before any parsing.
    pub fn raw_log(&self) -> &MessageLog {
        &self.engine.raw_log
    }
}

#[cfg(all(test, feature = "std", feature = "radio-device-simulator"))]
mod tests {
    use super::*;
    use crate::radio_devices::simulator::{FrameInjectionQueueSender, TransmitCaptureQueueReceiver};
    use futures::executor::block_on;

    fn initialized_node(node_id: &str) -> (RadioMeshNode, FrameInjectionQueueSender, TransmitCaptureQueueReceiver) {
        let mut node = RadioMeshNode::new();
        let (device, injection, capture) = RadioDevice::with_leaked_queues();
        node.begin(RadioConfiguration::with(node_id), device).unwrap();
        (node, injection, capture)
    }

    fn captured_text(capture: &TransmitCaptureQueueReceiver) -> Option<String> {
        capture.try_receive().ok().map(|f| f.as_text().unwrap().to_string())
    }

    fn received(node: &RadioMeshNode) -> RadioMessage {
        let Ok(message) = node.try_receive_message() else {
            panic!("expected a delivered message");
        };
        message
    }

    #[test]
    fn node_send_message_not_inited() {
        let node = RadioMeshNode::new();
        let msg = RadioMessage::new_text(MessageKind::Message, "NODE_A", "hi");
        match node.send_message(msg) {
            Err(SendMessageError::NotInited) => {}
            other => panic!("Expected NotInited, got: {:?}", core::mem::discriminant(&other)),
        }
    }

    #[test]
    fn node_receive_message_not_inited() {
        let node = RadioMeshNode::new();
        let res = block_on(async { node.receive_message().await });
        match res {
            Err(ReceiveMessageError::NotInited) => {}
            other => panic!("Expected NotInited, got: {:?}", core::mem::discriminant(&other)),
        }
        match node.try_receive_message() {
            Err(ReceiveMessageError::NotInited) => {}
            other => panic!("Expected NotInited, got: {:?}", core::mem::discriminant(&other)),
        }
    }

    #[test]
    fn node_transmit_not_inited() {
        let mut node = RadioMeshNode::new();
        let res = block_on(async { node.send_message_with_ack("hi").await });
        match res {
            Err(TransmitMessageError::NotInited) => {}
            other => panic!("Expected NotInited, got: {:?}", core::mem::discriminant(&other)),
        }
        assert!(node.outgoing_queue_sender().is_err());
        assert!(node.incoming_queue_receiver().is_err());
    }

    #[test]
    fn fresh_node_has_empty_state() {
        let mut node = RadioMeshNode::new();
        assert!(node.neighbours().is_empty());
        assert!(node.message_log().is_empty());
        assert!(node.raw_log().is_empty());
        assert_eq!(node.node_id(), "");
        assert!(!node.is_acked("1000"));
        // polling before begin must not panic or touch any state
        block_on(node.poll());
        assert!(node.message_log().is_empty());
    }

    #[test]
    fn queued_text_reaches_the_radio() {
        let (mut node, _injection, capture) = initialized_node("NODE_A");
        assert!(node.send_text(MessageKind::Message, "ping").is_ok());
        block_on(node.poll());

        let sent = captured_text(&capture).unwrap();
        assert!(sent.starts_with("MSG:"));
        assert!(sent.ends_with(":NODE_A:ping"));
        assert_eq!(captured_text(&capture), None);
    }

    #[test]
    fn received_message_round_trip() {
        let (mut node, injection, capture) = initialized_node("NODE_A");
        injection
            .try_send(ReceivedFrame::from_text("MSG:500:NODE_B:pong", -38.0, 7.0).unwrap())
            .unwrap();
        block_on(node.poll());

        assert_eq!(captured_text(&capture).as_deref(), Some("FORWARDED:NODE_A:MSG:500:NODE_B:pong"));
        assert_eq!(captured_text(&capture).as_deref(), Some("ACK:500:NODE_A"));

        let delivered = received(&node);
        assert_eq!(delivered.sender.as_str(), "NODE_B");
        assert_eq!(delivered.msg_id.as_str(), "500");
        assert_eq!(delivered.content.as_str(), "pong");
        match node.try_receive_message() {
            Err(ReceiveMessageError::QueueEmpty) => {}
            other => panic!("Expected QueueEmpty, got: {:?}", core::mem::discriminant(&other)),
        }

        assert_eq!(node.node_id(), "NODE_A");
        assert_eq!(node.message_log().len(), 1);
        assert_eq!(node.raw_log().len(), 1);
        let info = node.neighbours().get("NODE_B").unwrap();
        assert_eq!(info.rssi, -38.0);
        assert_eq!(info.snr, 7.0);
    }

    #[test]
    fn awaited_receive_sees_queued_delivery() {
        let (mut node, injection, _capture) = initialized_node("NODE_A");
        injection
            .try_send(ReceivedFrame::from_text("MSG:501:NODE_B:hello", -38.0, 7.0).unwrap())
            .unwrap();
        block_on(node.poll());
        let delivered = match block_on(async { node.receive_message().await }) {
            Ok(message) => message,
            Err(_) => panic!("receive_message failed on an initialized node"),
        };
        assert_eq!(delivered.content.as_str(), "hello");
    }

    #[test]
    fn transmit_with_ack_correlates() {
        let (mut node, injection, capture) = initialized_node("NODE_A");
        let Ok(msg_id) = block_on(node.send_message_with_ack("hello")) else {
            panic!("send_message_with_ack failed on an initialized node");
        };

        let sent = captured_text(&capture).unwrap();
        assert!(sent.starts_with(&std::format!("MSG:{}:NODE_A:", msg_id)));
        assert!(!node.is_acked(&msg_id));

        injection
            .try_send(ReceivedFrame::from_text(&std::format!("ACK:{}:NODE_B", msg_id), -40.0, 8.0).unwrap())
            .unwrap();
        block_on(node.poll());
        assert!(node.is_acked(&msg_id));
        // the acknowledgement itself was neither logged as a message nor forwarded
        assert_eq!(node.message_log().len(), 0);
        assert_eq!(captured_text(&capture), None);
    }

    #[test]
    fn outgoing_queue_overflow_surfaces() {
        let (node, _injection, _capture) = initialized_node("NODE_A");
        for _ in 0..OUTGOING_MESSAGE_QUEUE_SIZE {
            assert!(node.send_text(MessageKind::Message, "fill").is_ok());
        }
        match node.send_text(MessageKind::Message, "overflow") {
            Err(SendMessageError::ChannelFull) => {}
            other => panic!("Expected ChannelFull, got: {:?}", core::mem::discriminant(&other)),
        }
    }

    #[test]
    fn external_queue_endpoints_work() {
        let (mut node, _injection, capture) = initialized_node("NODE_A");
        let Ok(sender) = node.outgoing_queue_sender() else {
            panic!("sender endpoint missing on an initialized node");
        };
        sender.try_send(RadioMessage::new_text(MessageKind::User, "NODE_A", "u1,pk")).unwrap();
        block_on(node.poll());
        assert!(captured_text(&capture).unwrap().ends_with(":NODE_A:u1,pk"));

        let Ok(receiver) = node.incoming_queue_receiver() else {
            panic!("receiver endpoint missing on an initialized node");
        };
        assert!(receiver.try_receive().is_err());
    }

    #[test]
    fn node_id_from_unique_formats_hardware_ids() {
        assert_eq!(node_id_from_unique(0x0000_1234_5678_9ABC).as_str(), "NODE_123456789ABC");
        assert_eq!(node_id_from_unique(0).as_str(), "NODE_000000000000");
        assert_eq!(node_id_from_unique(u64::MAX).as_str(), "NODE_FFFFFFFFFFFF");
    }

    #[test]
    fn default_link_parameters() {
        let config = RadioConfiguration::with("NODE_A");
        assert_eq!(config.node_id.as_str(), "NODE_A");
        assert_eq!(config.frequency_mhz, 868.0);
        assert_eq!(config.bandwidth_khz, 125.0);
        assert_eq!(config.spreading_factor, 12);
        assert_eq!(config.coding_rate, 8);
        assert_eq!(config.sync_word, 0x56);
    }
}
