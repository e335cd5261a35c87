//! MQTT publish gateway.
//!
//! One message per frame, QoS 1, JSON payload with the stream name and the
//! absolute frame path. The stream name also rides in the topic
//! (`<prefix>/<stream>`) so consumers can filter broker-side.
//!
//! Two acknowledgment modes:
//! - **Confirmed** (polling strategies): `publish` blocks until the broker's
//!   PUBACK arrives, because the relay only advances the watermark on
//!   confirmed delivery. The relay keeps at most one message in flight per
//!   stream, so the next PUBACK is the acknowledgment for the message just
//!   sent.
//! - **Detached** (relocation strategy): `publish` returns once the message
//!   is queued; the connection driver thread logs each PUBACK outcome. A
//!   late broker failure never blocks the file relocation.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PubAckReason};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Outgoing;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::{FrameMessage, FrameRef};

/// Result of handing one frame to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker acknowledged delivery; `pkid` is its packet identifier.
    Confirmed { pkid: u16 },
    /// Message queued; acknowledgment is observed by the driver thread.
    Queued,
}

/// How `publish` treats broker acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    Confirmed,
    Detached,
}

/// The relay loop's view of the broker.
pub trait PublishGateway {
    fn publish(&mut self, frame: &FrameRef) -> Result<PublishOutcome>;
}

/// Topic a stream's frame messages publish to.
pub fn frame_topic(prefix: &str, stream: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), stream)
}

enum BrokerSignal {
    Connected,
    /// The event loop put our publish on the wire under this packet id.
    Sent { pkid: u16 },
    PubAck { pkid: u16, ok: bool, reason: String },
}

pub struct MqttGateway {
    client: Client,
    signals: Receiver<BrokerSignal>,
    mode: AckMode,
    topic: String,
    ack_timeout: Duration,
    driver: Option<std::thread::JoinHandle<()>>,
}

impl MqttGateway {
    /// Connect and wait for the broker's CONNACK. An unreachable broker is
    /// a startup failure, not something to retry into silently.
    pub fn connect(
        options: MqttOptions,
        topic: String,
        mode: AckMode,
        ack_timeout: Duration,
    ) -> Result<Self> {
        let (client, connection) = Client::new(options, 10);
        let (tx, signals) = channel();
        let detached = mode == AckMode::Detached;
        let driver = std::thread::spawn(move || drive_connection(connection, tx, detached));

        let gateway = Self {
            client,
            signals,
            mode,
            topic,
            ack_timeout,
            driver: Some(driver),
        };
        gateway.await_connack()?;
        Ok(gateway)
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.client.disconnect()?;
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        Ok(())
    }

    fn await_connack(&self) -> Result<()> {
        match self.signals.recv_timeout(self.ack_timeout) {
            Ok(BrokerSignal::Connected) => Ok(()),
            Ok(_) => Err(anyhow!("unexpected broker traffic before CONNACK")),
            Err(_) => Err(anyhow!(
                "no CONNACK from MQTT broker within {:?}",
                self.ack_timeout
            )),
        }
    }
}

/// Wait for the acknowledgment of the message just published: first learn
/// the packet id the event loop assigned to it, then accept only the PUBACK
/// carrying that id. Acks for other ids are leftovers from a message whose
/// wait already timed out; log and keep waiting.
fn await_publish_ack(
    signals: &Receiver<BrokerSignal>,
    timeout: Duration,
) -> Result<PublishOutcome> {
    let deadline = Instant::now() + timeout;
    let mut sent_pkid: Option<u16> = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match signals.recv_timeout(remaining) {
            // reconnect happened while we waited; keep waiting
            Ok(BrokerSignal::Connected) => continue,
            Ok(BrokerSignal::Sent { pkid }) => sent_pkid = Some(pkid),
            Ok(BrokerSignal::PubAck { pkid, ok, reason }) => match sent_pkid {
                Some(expected) if pkid == expected => {
                    if ok {
                        return Ok(PublishOutcome::Confirmed { pkid });
                    }
                    return Err(anyhow!("broker rejected message {pkid}: {reason}"));
                }
                _ => {
                    log::debug!("ignoring stale acknowledgment for message {}", pkid);
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                return Err(anyhow!(
                    "no acknowledgment from broker within {:?}",
                    timeout
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("MQTT connection driver stopped"))
            }
        }
    }
}

impl PublishGateway for MqttGateway {
    fn publish(&mut self, frame: &FrameRef) -> Result<PublishOutcome> {
        let payload = serde_json::to_vec(&FrameMessage::for_frame(frame))
            .context("could not serialize frame message")?;

        if self.mode == AckMode::Confirmed {
            // Clear signals left over from reconnects or a previous timeout
            // so the next PUBACK we see belongs to this message.
            while self.signals.try_recv().is_ok() {}
        }

        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("could not queue message for {}", frame.path.display()))?;

        match self.mode {
            AckMode::Detached => Ok(PublishOutcome::Queued),
            AckMode::Confirmed => await_publish_ack(&self.signals, self.ack_timeout),
        }
    }
}

fn drive_connection(
    mut connection: Connection,
    tx: Sender<BrokerSignal>,
    detached: bool,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    log::info!("connected to MQTT broker");
                    if tx.send(BrokerSignal::Connected).is_err() {
                        break;
                    }
                } else {
                    log::error!("MQTT broker refused connection: {:?}", ack.code);
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if !detached && tx.send(BrokerSignal::Sent { pkid }).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let ok = matches!(
                    ack.reason,
                    PubAckReason::Success | PubAckReason::NoMatchingSubscribers
                );
                if detached {
                    // Detached mode: the only required behavior is that the
                    // outcome is eventually logged.
                    if ok {
                        log::debug!("broker acknowledged message {}", ack.pkid);
                    } else {
                        log::error!(
                            "broker rejected message {}: {:?} (file already relocated)",
                            ack.pkid,
                            ack.reason
                        );
                    }
                } else {
                    let signal = BrokerSignal::PubAck {
                        pkid: ack.pkid,
                        ok,
                        reason: format!("{:?}", ack.reason),
                    };
                    if tx.send(signal).is_err() {
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc reconnects on the next iteration; pace the retries
                log::warn!("MQTT connection error: {}", e);
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrderingKey;
    use std::path::PathBuf;

    #[test]
    fn frame_topic_joins_prefix_and_stream() {
        assert_eq!(frame_topic("frames", "cam0"), "frames/cam0");
        assert_eq!(frame_topic("frames/", "cam0"), "frames/cam0");
    }

    fn signal_feed(signals: Vec<BrokerSignal>) -> Receiver<BrokerSignal> {
        let (tx, rx) = channel();
        for signal in signals {
            tx.send(signal).expect("send");
        }
        // keep the sender alive so the receiver times out instead of
        // reporting a disconnect
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn ack_for_the_sent_packet_confirms() {
        let rx = signal_feed(vec![
            BrokerSignal::Sent { pkid: 2 },
            BrokerSignal::PubAck {
                pkid: 2,
                ok: true,
                reason: "Success".into(),
            },
        ]);
        let outcome = await_publish_ack(&rx, Duration::from_millis(100)).expect("ack");
        assert_eq!(outcome, PublishOutcome::Confirmed { pkid: 2 });
    }

    #[test]
    fn stale_ack_from_a_timed_out_message_is_not_misattributed() {
        // ack for pkid 1 arrives first (its wait already timed out); only
        // the ack matching the packet just sent may confirm
        let rx = signal_feed(vec![
            BrokerSignal::PubAck {
                pkid: 1,
                ok: true,
                reason: "Success".into(),
            },
            BrokerSignal::Sent { pkid: 2 },
            BrokerSignal::PubAck {
                pkid: 1,
                ok: true,
                reason: "Success".into(),
            },
            BrokerSignal::PubAck {
                pkid: 2,
                ok: true,
                reason: "Success".into(),
            },
        ]);
        let outcome = await_publish_ack(&rx, Duration::from_millis(100)).expect("ack");
        assert_eq!(outcome, PublishOutcome::Confirmed { pkid: 2 });
    }

    #[test]
    fn rejected_ack_is_a_publish_failure() {
        let rx = signal_feed(vec![
            BrokerSignal::Sent { pkid: 3 },
            BrokerSignal::PubAck {
                pkid: 3,
                ok: false,
                reason: "QuotaExceeded".into(),
            },
        ]);
        let err = await_publish_ack(&rx, Duration::from_millis(100)).unwrap_err();
        assert!(format!("{err}").contains("QuotaExceeded"));
    }

    #[test]
    fn missing_ack_times_out() {
        let rx = signal_feed(vec![BrokerSignal::Sent { pkid: 4 }]);
        let err = await_publish_ack(&rx, Duration::from_millis(20)).unwrap_err();
        assert!(format!("{err}").contains("no acknowledgment"));
    }

    #[test]
    fn frame_message_carries_stream_and_absolute_path() {
        let frame = FrameRef {
            path: PathBuf::from("/mnt/nfs/streams/cam0/frames/frame_00000001.jpg"),
            stream: "cam0".to_string(),
            key: OrderingKey::Sequence(1),
        };

        let json = serde_json::to_string(&FrameMessage::for_frame(&frame)).expect("serialize");
        assert!(json.contains(r#""stream_name":"cam0""#));
        assert!(json.contains("/mnt/nfs/streams/cam0/frames/frame_00000001.jpg"));
    }
}
