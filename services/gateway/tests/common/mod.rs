//! Shared harness: an in-process gateway plus a scriptable fake device.
#![allow(dead_code)]

use dny_core::payload::{DeviceHeartbeat, PowerHeartbeat, Settlement};
use dny_core::{Command, DnyMessage};
use gateway::config::GatewayConfig;
use gateway::net::DeviceListener;
use gateway::Gateway;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub const ICCID: &str = "89860404D91623904882";
pub const PHYS: u32 = 0x04A2_28CD;

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl TestGateway {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// A config tuned for fast tests: short pacing, no webhook endpoints.
pub fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.device.min_send_interval = Duration::from_millis(20);
    config
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let (gateway, _sink_rx) = Gateway::new(config);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let listener = DeviceListener::start(gateway.clone(), "127.0.0.1:0", shutdown_rx)
        .await
        .expect("bind device listener");
    TestGateway {
        gateway,
        addr: listener.local_addr(),
        shutdown,
    }
}

/// A charging pile on the other end of the TCP connection.
pub struct FakeDevice {
    pub stream: TcpStream,
    pub physical_id: u32,
    next_message_id: u16,
}

impl FakeDevice {
    pub async fn connect(addr: SocketAddr, physical_id: u32) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        FakeDevice {
            stream,
            physical_id,
            next_message_id: 1,
        }
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    pub async fn send_iccid(&mut self) {
        self.send_raw(ICCID.as_bytes()).await;
    }

    pub async fn send_link(&mut self) {
        self.send_raw(b"link").await;
    }

    pub async fn send_message(&mut self, command: u8, payload: Vec<u8>) -> u16 {
        let message_id = self.message_id();
        let frame = DnyMessage {
            physical_id: self.physical_id,
            message_id,
            command,
            payload,
        }
        .encode();
        self.send_raw(&frame).await;
        message_id
    }

    pub async fn register(&mut self) -> u16 {
        self.send_message(Command::Register.code(), vec![0x80, 0x02, 0x02, 0x1E, 0x31, 0x06])
            .await
    }

    pub async fn heartbeat(&mut self, port_statuses: Vec<u8>) -> u16 {
        let payload = DeviceHeartbeat {
            voltage_dv: 2411,
            port_statuses,
            temperature: 0,
            signal: 0x61,
        }
        .encode();
        self.send_message(Command::DeviceHeartbeat.code(), payload).await
    }

    pub async fn power_heartbeat(&mut self, port: u8, status: u8, power_w: u16, order_no: &str) -> u16 {
        let payload = PowerHeartbeat {
            port,
            status,
            power_w,
            energy: 10,
            order_no: order_no.to_owned(),
        }
        .encode()
        .expect("power payload");
        self.send_message(Command::PowerHeartbeat.code(), payload).await
    }

    pub async fn settle(&mut self, port: u8, order_no: &str, stop_reason: u8) -> u16 {
        let payload = Settlement {
            port,
            order_no: order_no.to_owned(),
            energy: 250,
            seconds: 600,
            stop_reason,
        }
        .encode()
        .expect("settlement payload");
        self.send_message(Command::Settlement.code(), payload).await
    }

    /// Read one complete DNY frame from the server, with a timeout.
    pub async fn read_frame(&mut self) -> DnyMessage {
        self.try_read_frame(Duration::from_secs(5))
            .await
            .expect("expected a frame")
    }

    /// Read one frame or give up after `wait`.
    pub async fn try_read_frame(&mut self, wait: Duration) -> Option<DnyMessage> {
        let read = async {
            let mut header = [0u8; 5];
            self.stream.read_exact(&mut header).await.ok()?;
            let length = u16::from_le_bytes([header[3], header[4]]) as usize;
            let mut rest = vec![0u8; length];
            self.stream.read_exact(&mut rest).await.ok()?;
            let mut frame = header.to_vec();
            frame.extend_from_slice(&rest);
            Some(DnyMessage::decode(&frame).expect("server sent an invalid frame"))
        };
        tokio::time::timeout(wait, read).await.ok().flatten()
    }

    /// Read frames until one carries `command` (acks to other inbound
    /// traffic are skipped), or panic after `wait`.
    pub async fn read_frame_with_command(&mut self, command: u8, wait: Duration) -> DnyMessage {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for command frame");
            if let Some(frame) = self.try_read_frame(remaining).await {
                if frame.command == command {
                    return frame;
                }
            }
        }
    }

    /// Reply to a received frame, echoing its message id.
    pub async fn reply(&mut self, to: &DnyMessage, payload: Vec<u8>) {
        let frame = DnyMessage {
            physical_id: self.physical_id,
            message_id: to.message_id,
            command: to.command,
            payload,
        }
        .encode();
        self.send_raw(&frame).await;
    }
}

/// Poll until `predicate` holds or a few seconds pass.
pub async fn wait_until<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
