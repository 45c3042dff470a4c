//! Per-connection session: read loop, deadlines, handshake, routing.
//!
//! The handshake tolerates arbitrary ordering: the usual sequence is
//! ICCID, framed registration, heartbeat, but a registration with no
//! prior ICCID lands the device in a synthetic group (migrated when the
//! ICCID shows up later), and a heartbeat from an unregistered device
//! binds it implicitly since the frame carries its physical ID.
//!
//! On close the session unbinds from the registry; the device entry
//! survives offline for the grace window, and orders and port state
//! machines are untouched.

use crate::codec::DnyCodec;
use crate::gateway::Gateway;
use crate::registry::{ConnHandle, DeviceRegistry, HeartbeatKind};
use crate::writer::ConnWriter;
use chrono::Utc;
use dny_core::frame::Frame;
use dny_core::payload::{
    encode_server_time, ChargeControl, ChargeControlAck, DeviceHeartbeat, FaultReport,
    PowerHeartbeat, QueryStatusReply, Settlement, SwipeCard,
};
use dny_core::{Command, DeviceId, DnyMessage};
use futures_util::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Handshake progress for one connection.
#[derive(Debug, Default)]
struct Handshake {
    iccid: Option<String>,
    bound: Option<DeviceId>,
}

/// Drive one accepted device connection until EOF, deadline, close
/// request, or shutdown.
pub async fn run_session(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |a| a.to_string());
    let (read_half, write_half) = stream.into_split();
    let writer = ConnWriter::new(write_half, gateway.config.tcp.write_timeout);
    let conn_id = gateway.registry.new_conn_id();
    let (handle, mut close_rx) = ConnHandle::new(conn_id, remote.clone(), writer);
    let mut framed = FramedRead::new(read_half, DnyCodec::new());
    let mut handshake = Handshake::default();

    info!(conn_id, remote = %remote, "connection accepted");

    loop {
        let deadline = if handshake.iccid.is_some() || handshake.bound.is_some() {
            gateway.config.tcp.steady_read_timeout
        } else {
            gateway.config.tcp.initial_read_timeout
        };
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(conn_id, "session stopping for shutdown");
                    break;
                }
            }
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    debug!(conn_id, "session close requested");
                    break;
                }
            }
            next = tokio::time::timeout(deadline, framed.next()) => {
                match next {
                    Err(_elapsed) => {
                        info!(conn_id, deadline_s = deadline.as_secs(), "read deadline exceeded");
                        break;
                    }
                    Ok(None) => {
                        debug!(conn_id, "connection closed by peer");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(conn_id, error = %e, "read error");
                        break;
                    }
                    Ok(Some(Ok(frame))) => {
                        handle_frame(&gateway, &handle, &mut handshake, frame).await;
                    }
                }
            }
        }
    }

    gateway.acks.drop_connection(conn_id).await;
    gateway.registry.unbind(conn_id).await;
    info!(conn_id, "session ended");
}

async fn handle_frame(
    gateway: &Arc<Gateway>,
    handle: &ConnHandle,
    handshake: &mut Handshake,
    frame: Frame,
) {
    match frame {
        Frame::Link => {
            if let Some(device_id) = handshake.bound {
                gateway
                    .registry
                    .record_heartbeat(device_id, HeartbeatKind::Link)
                    .await;
            } else {
                debug!(conn_id = handle.conn_id, "link keep-alive before registration");
            }
        }
        Frame::Iccid(iccid) => {
            debug!(conn_id = handle.conn_id, iccid = %iccid, "iccid observed");
            if handshake.bound.is_some() {
                gateway.registry.migrate_iccid(handle.conn_id, &iccid).await;
            }
            handshake.iccid = Some(iccid);
        }
        Frame::Dny(bytes) => match DnyMessage::decode(&bytes) {
            Ok(message) => handle_message(gateway, handle, handshake, message).await,
            Err(e) => {
                gateway.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(conn_id = handle.conn_id, error = %e, "malformed frame discarded");
            }
        },
    }
}

/// Bind the device for a frame that arrived before any registration.
async fn ensure_bound(
    gateway: &Arc<Gateway>,
    handle: &ConnHandle,
    handshake: &mut Handshake,
    physical_id: u32,
) -> DeviceId {
    if let Some(device_id) = handshake.bound {
        return device_id;
    }
    let iccid = handshake
        .iccid
        .clone()
        .unwrap_or_else(|| DeviceRegistry::synthetic_iccid(handle.conn_id));
    let outcome = gateway.registry.bind(handle, &iccid, physical_id, None).await;
    handshake.bound = Some(outcome.device_id);
    outcome.device_id
}

async fn handle_message(
    gateway: &Arc<Gateway>,
    handle: &ConnHandle,
    handshake: &mut Handshake,
    message: DnyMessage,
) {
    let tag = message.command_tag();
    match tag {
        Command::Register => {
            let iccid = handshake
                .iccid
                .clone()
                .unwrap_or_else(|| DeviceRegistry::synthetic_iccid(handle.conn_id));
            let firmware = (!message.payload.is_empty()).then(|| hex_string(&message.payload));
            let outcome = gateway
                .registry
                .bind(handle, &iccid, message.physical_id, firmware)
                .await;
            handshake.bound = Some(outcome.device_id);

            reply(handle, &message, server_time_payload()).await;

            // Seed port states; paced and fire-and-forget.
            let gateway = gateway.clone();
            let device_id = outcome.device_id;
            tokio::spawn(async move {
                if let Err(e) = gateway
                    .dispatcher
                    .send(device_id, Command::QueryStatus.code(), Vec::new())
                    .await
                {
                    debug!(device_id = %device_id, error = %e, "status seed query not sent");
                }
            });
        }
        Command::DeviceHeartbeat | Command::Heartbeat => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            gateway
                .registry
                .record_heartbeat(device_id, HeartbeatKind::Device)
                .await;
            match DeviceHeartbeat::parse(&message.payload) {
                Ok(heartbeat) => {
                    for (port, code) in heartbeat.port_statuses.iter().enumerate() {
                        gateway
                            .ports
                            .on_status_code(device_id, port as u8, *code)
                            .await;
                    }
                    gateway
                        .events
                        .record(
                            cg_protocol::Event::new(
                                cg_protocol::EventType::DeviceHeartbeat,
                                device_id,
                            )
                            .with_data("voltage_dv", heartbeat.voltage_dv)
                            .with_data("signal", heartbeat.signal),
                        )
                        .await;
                }
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "unparseable heartbeat payload");
                }
            }
        }
        Command::MainHeartbeat => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            gateway
                .registry
                .record_heartbeat(device_id, HeartbeatKind::Main)
                .await;
        }
        Command::GetServerTime => {
            reply(handle, &message, server_time_payload()).await;
        }
        Command::PowerHeartbeat => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            gateway
                .registry
                .record_heartbeat(device_id, HeartbeatKind::Power)
                .await;
            match PowerHeartbeat::parse(&message.payload) {
                Ok(telemetry) => {
                    gateway.handle_power_heartbeat(device_id, &telemetry).await;
                }
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "unparseable power heartbeat");
                }
            }
        }
        Command::Settlement => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            match Settlement::parse(&message.payload) {
                Ok(settlement) => {
                    gateway.handle_settlement(device_id, &settlement).await;
                    reply(handle, &message, Vec::new()).await;
                }
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "unparseable settlement");
                }
            }
        }
        Command::SwipeCard => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            match SwipeCard::parse(&message.payload) {
                Ok(swipe) => {
                    info!(device_id = %device_id, card_no = swipe.card_no, port = swipe.port,
                          "card swiped");
                    reply(handle, &message, Vec::new()).await;
                }
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "unparseable swipe payload");
                }
            }
        }
        Command::FaultReport => {
            let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
            match FaultReport::parse(&message.payload) {
                Ok(fault) => {
                    warn!(device_id = %device_id, port = fault.port, code = fault.fault_code,
                          "fault reported");
                    let _ = gateway
                        .ports
                        .apply(
                            device_id,
                            fault.port,
                            crate::ports::PortState::Fault,
                            crate::ports::TransitionReason::Fault,
                            Some(format!("fault-code-{}", fault.fault_code)),
                        )
                        .await;
                }
                Err(e) => {
                    debug!(device_id = %device_id, error = %e, "unparseable fault report");
                }
            }
        }
        Command::ChargeControl | Command::QueryStatus | Command::ModifyCharge
        | Command::DeviceLocate => {
            handle_reply(gateway, handle, handshake, message).await;
        }
        Command::Other(code) => {
            // Valid frame, unrouted opcode: logged, no ack, no state change.
            debug!(conn_id = handle.conn_id, code = format_args!("0x{code:02X}"),
                   "unrouted command ignored");
        }
    }
}

/// Correlate a device reply with its pending outbound command.
async fn handle_reply(
    gateway: &Arc<Gateway>,
    handle: &ConnHandle,
    handshake: &mut Handshake,
    message: DnyMessage,
) {
    let Some(pending) = gateway.acks.complete(handle.conn_id, message.message_id).await else {
        debug!(conn_id = handle.conn_id, message_id = message.message_id,
               "reply without pending command");
        return;
    };
    let device_id = ensure_bound(gateway, handle, handshake, message.physical_id).await;
    match message.command_tag() {
        Command::ChargeControl => {
            let sent = DnyMessage::decode(&pending.frame)
                .ok()
                .and_then(|m| ChargeControl::parse(&m.payload).ok());
            let ack = ChargeControlAck::parse(&message.payload);
            match (sent, ack) {
                (Some(sent), Ok(ack)) => {
                    gateway.handle_charge_ack(device_id, &sent, &ack).await;
                }
                (sent, ack) => {
                    warn!(device_id = %device_id, sent_ok = sent.is_some(),
                          ack_ok = ack.is_ok(), "undecodable charge-control ack");
                }
            }
        }
        Command::QueryStatus => match QueryStatusReply::parse(&message.payload) {
            Ok(reply) => {
                for (port, code) in reply.port_statuses.iter().enumerate() {
                    gateway
                        .ports
                        .on_status_code(device_id, port as u8, *code)
                        .await;
                }
            }
            Err(e) => {
                debug!(device_id = %device_id, error = %e, "unparseable status reply");
            }
        },
        _ => {
            debug!(device_id = %device_id, command = %message.command_tag(), "reply acknowledged");
        }
    }
}

/// Reply on the same connection, echoing the inbound message id so the
/// device can correlate.
async fn reply(handle: &ConnHandle, inbound: &DnyMessage, payload: Vec<u8>) {
    let frame = DnyMessage {
        physical_id: inbound.physical_id,
        message_id: inbound.message_id,
        command: inbound.command,
        payload,
    }
    .encode();
    if let Err(e) = handle.writer.write(&frame).await {
        warn!(conn_id = handle.conn_id, error = %e, "reply write failed");
    }
}

fn server_time_payload() -> Vec<u8> {
    encode_server_time(Utc::now().timestamp() as u32)
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02X}");
        s
    })
}
