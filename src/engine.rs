//! Protocol state machine shared by every node role.
//!
//! One poll cycle runs four phases against the radio device: expire stale
//! fragments, drain and handle a received packet if one is pending, emit the
//! periodic beacon when its interval elapsed, then transmit everything the
//! application queued. All radio access stays inside the cycle, which is what
//! keeps the half-duplex channel consistent without any locking.
//!
//! Received packets pass through a fixed pipeline: raw log, acknowledgement
//! short-circuit, fragment reassembly, sender extraction, neighbour upsert,
//! message log, forwarding, acknowledgement, application hand-off. The
//! ordering is load-bearing: acknowledgements must never reach the logs or
//! the forwarder, and a packet must be forwarded before its own
//! acknowledgement goes out.

use crate::ack_tracker::AckTracker;
use crate::fragmentation::{FragmentBuffer, ReassemblyOutcome};
use crate::message_log::{MessageLog, ReceivedMessage};
use crate::neighbours::{NeighbourInfo, NeighbourTable};
use crate::radio_devices::{RadioDevice, ReceivedFrame};
use crate::wire;
use crate::{
    IncomingMessageQueueSender, MessageKind, MessageText, MsgId, NodeId, OutgoingMessageQueueReceiver, RadioMessage,
    TransmitMessageError, BEACON_INTERVAL, BROADCAST_RECEIVER, INTER_FRAGMENT_DELAY, MAX_FRAGMENT_PAYLOAD, MAX_WIRE_LEN,
    MESSAGE_MAX_AGE,
};
use embassy_time::{Instant, Timer};
use log::{log, Level};

/// Sender recorded in the raw log, where no extraction has happened yet.
const RAW_LOG_SENDER: &str = "?";

pub(crate) struct MeshEngine {
    node_id: NodeId,
    pub(crate) neighbours: NeighbourTable,
    pub(crate) message_log: MessageLog,
    pub(crate) raw_log: MessageLog,
    fragments: FragmentBuffer,
    acks: AckTracker,
    last_beacon: Option<Instant>,
}

impl MeshEngine {
    /// Empty engine with no identity. Replaced by [`MeshEngine::with`] when
    /// the node comes up.
    pub(crate) const fn new() -> Self {
        MeshEngine {
            node_id: NodeId::new(),
            neighbours: NeighbourTable::new(),
            message_log: MessageLog::new(Some(MESSAGE_MAX_AGE)),
            raw_log: MessageLog::new(None),
            fragments: FragmentBuffer::new(),
            acks: AckTracker::new(),
            last_beacon: None,
        }
    }

    pub(crate) fn with(node_id: NodeId, now: Instant) -> Self {
        MeshEngine {
            node_id,
            last_beacon: Some(now),
            ..MeshEngine::new()
        }
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn is_acked(&self, msg_id: &str) -> bool {
        self.acks.is_acked(msg_id)
    }

    /// One full poll cycle. `now` is sampled once by the caller so every
    /// decision in the cycle sees the same clock.
    pub(crate) async fn poll_cycle(
        &mut self,
        device: &mut RadioDevice,
        outgoing: OutgoingMessageQueueReceiver,
        incoming: IncomingMessageQueueSender,
        now: Instant,
    ) {
        self.fragments.evict_expired(now);

        if device.packet_pending() {
            match device.read_data() {
                Ok(frame) => self.handle_frame(device, incoming, &frame, now).await,
                Err(_) => log!(Level::Warn, "Radio reported a packet but none could be read"),
            }
            device.start_receive();
        }

        match self.last_beacon {
            Some(last) if last + BEACON_INTERVAL < now => {
                self.send_beacon(device, now).await;
                self.last_beacon = Some(now);
            }
            Some(_) => {}
            None => self.last_beacon = Some(now),
        }

        while let Ok(envelope) = outgoing.try_receive() {
            self.dispatch_envelope(device, envelope, now).await;
        }
    }

    /// Runs one received frame through the receive pipeline.
    async fn handle_frame(
        &mut self,
        device: &mut RadioDevice,
        incoming: IncomingMessageQueueSender,
        frame: &ReceivedFrame,
        now: Instant,
    ) {
        let Ok(raw_text) = core::str::from_utf8(&frame.data) else {
            log!(Level::Warn, "Received frame is not valid UTF-8, dropping");
            return;
        };
        if raw_text.is_empty() {
            return;
        }
        log!(Level::Trace, "Received packet: {}", raw_text);

        self.raw_log.push(
            ReceivedMessage {
                timestamp: now,
                sender: wire::bounded_lossy(RAW_LOG_SENDER),
                content: wire::bounded_lossy(raw_text),
                rssi: frame.rssi,
                snr: frame.snr,
            },
            now,
        );

        // acknowledgements are consumed here even when malformed, so they can
        // never be logged as messages, forwarded or acknowledged themselves
        if wire::is_ack(raw_text) {
            if let Some(msg_id) = wire::ack_msg_id(raw_text) {
                self.acks.record_ack(msg_id);
                log!(Level::Debug, "Received acknowledgement for message {}", msg_id);
            }
            return;
        }

        let text: MessageText = match wire::parse_fragment(raw_text) {
            Some(header) => match self.fragments.insert(&header, now) {
                ReassemblyOutcome::Complete(full) => full,
                ReassemblyOutcome::Incomplete => return,
            },
            None => wire::bounded_lossy(raw_text),
        };

        let (sender, msg_id) = wire::sender_and_msg_id(&text);

        // every packet refreshes its sender, placeholder senders included
        self.neighbours.upsert(
            sender,
            NeighbourInfo {
                last_seen: now,
                rssi: frame.rssi,
                snr: frame.snr,
            },
        );

        self.message_log.push(
            ReceivedMessage {
                timestamp: now,
                sender: wire::bounded_lossy(sender),
                content: text.clone(),
                rssi: frame.rssi,
                snr: frame.snr,
            },
            now,
        );

        if !text.starts_with(wire::BEACON_PREFIX) && !text.starts_with(wire::FORWARDED_PREFIX) {
            match wire::forwarded_text(&self.node_id, &text) {
                Some(forwarded) => {
                    if device.transmit(forwarded.as_bytes()).is_err() {
                        log!(Level::Warn, "Failed to transmit forwarded copy of message {}", msg_id);
                    } else {
                        log!(Level::Debug, "Forwarded message: {}", forwarded.as_str());
                    }
                }
                None => log!(Level::Warn, "Forwarded copy would exceed {} bytes, not relaying", MAX_WIRE_LEN),
            }
        }

        if !msg_id.is_empty() {
            if let Some(ack) = wire::ack_text(msg_id, &self.node_id) {
                if device.transmit(ack.as_bytes()).is_err() {
                    log!(Level::Warn, "Failed to transmit acknowledgement for message {}", msg_id);
                } else {
                    log!(Level::Debug, "Acknowledged message {}", msg_id);
                }
            }
        }

        let payload = wire::message_payload(&text);
        if !msg_id.is_empty() && !payload.starts_with(wire::BEACON_PREFIX) {
            let envelope = RadioMessage {
                sender: wire::bounded_lossy(sender),
                receiver: wire::bounded_lossy(BROADCAST_RECEIVER),
                msg_id: wire::bounded_lossy(msg_id),
                kind: MessageKind::Message,
                content: wire::bounded_lossy(payload),
            };
            if incoming.try_send(envelope).is_err() {
                log!(
                    Level::Warn,
                    "Failed to send message to the incoming queue. The queue is full. Dropping message {}",
                    msg_id
                );
            } else {
                log!(target: "host_bridge", Level::Info, "Inbound message {} from {}: {}", msg_id, sender, payload);
            }
        }
    }

    /// Builds the wire string for `text`, transmits it whole or in numbered
    /// fragments, and registers the new id as awaiting acknowledgement.
    pub(crate) async fn send_message_with_ack(
        &mut self,
        device: &mut RadioDevice,
        text: &str,
        now: Instant,
    ) -> Result<MsgId, TransmitMessageError> {
        let msg_id = self.acks.next_message_id(now);
        let Some(full) = wire::message_text(&msg_id, &self.node_id, text) else {
            return Err(TransmitMessageError::MessageTooLong);
        };

        if full.len() <= MAX_FRAGMENT_PAYLOAD {
            if device.transmit(full.as_bytes()).is_err() {
                log!(Level::Warn, "Failed to transmit message {}", msg_id.as_str());
            } else {
                log!(Level::Debug, "Sent message: {}", full.as_str());
            }
        } else {
            let total = wire::fragment_chunks(&full).count();
            for (i, chunk) in wire::fragment_chunks(&full).enumerate() {
                match wire::fragment_text(&msg_id, i + 1, total, chunk) {
                    Some(packet) => {
                        if device.transmit(packet.as_bytes()).is_err() {
                            log!(
                                Level::Warn,
                                "Failed to transmit fragment {}/{} of message {}",
                                i + 1,
                                total,
                                msg_id.as_str()
                            );
                        }
                    }
                    None => log!(
                        Level::Warn,
                        "Fragment {}/{} of message {} does not fit a packet, skipping",
                        i + 1,
                        total,
                        msg_id.as_str()
                    ),
                }
                // give listeners time to store each piece before the next one
                Timer::after(INTER_FRAGMENT_DELAY).await;
            }
            log!(Level::Debug, "Sent message {} in {} fragment(s)", msg_id.as_str(), total);
        }

        self.acks.register_pending(&msg_id, now);
        log!(Level::Trace, "Messages awaiting acknowledgement: {}", self.acks.pending_count());
        Ok(msg_id)
    }

    /// Announces this node. Beacons ride the normal send path, so they carry
    /// a message id and get MSG-wrapped on the wire.
    async fn send_beacon(&mut self, device: &mut RadioDevice, now: Instant) {
        let Some(content) = wire::beacon_content(&self.node_id) else {
            return;
        };
        log!(Level::Debug, "Broadcasting beacon");
        let _ = self.send_message_with_ack(device, &content, now).await;
    }

    /// Sends one queued envelope over the air.
    async fn dispatch_envelope(&mut self, device: &mut RadioDevice, envelope: RadioMessage, now: Instant) {
        log!(
            target: "host_bridge",
            Level::Info,
            "Outbound {:?} from {} to {}: {}",
            envelope.kind,
            envelope.sender.as_str(),
            envelope.receiver.as_str(),
            envelope.content.as_str()
        );
        match self.send_message_with_ack(device, &envelope.content, now).await {
            Ok(msg_id) => log!(Level::Debug, "Queued {:?} sent as message {}", envelope.kind, msg_id.as_str()),
            Err(_) => log!(Level::Warn, "Queued {:?} is too long to send, dropping", envelope.kind),
        }
    }
}
