use super::CommandHandler;
use crate::bus::{Command, DiscoveryBus, Ping, Pong, Response, DEVICE_NAME_CAPACITY, MAX_RESPONSE_SIZE};
use crate::rendezvous::Rendezvous;
use async_trait::async_trait;
use nmx_core::{NmxError, NmxResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

struct SimDevice {
    name: String,
    handler: Option<CommandHandler>,
}

/// Simulated discovery bus with any number of named devices
pub struct SimBus {
    devices: Mutex<Vec<SimDevice>>,
    pongs: Rendezvous<Pong>,
    responses: Rendezvous<Response>,
    initialized: AtomicBool,
    init_fails: AtomicBool,
    commands: Mutex<Vec<Command>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            pongs: Rendezvous::new(),
            responses: Rendezvous::new(),
            initialized: AtomicBool::new(false),
            init_fails: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Add a device that answers pings and handles commands with `handler`
    pub fn add_device(&self, name: impl Into<String>, handler: CommandHandler) {
        self.devices.lock().push(SimDevice {
            name: name.into(),
            handler: Some(handler),
        });
    }

    /// Add a device that answers pings but never answers commands
    pub fn add_silent_device(&self, name: impl Into<String>) {
        self.devices.lock().push(SimDevice {
            name: name.into(),
            handler: None,
        });
    }

    /// Make every following `initialize` fail
    pub fn fail_initialize(&self) {
        self.init_fails.store(true, Ordering::SeqCst);
    }

    /// Commands published so far
    pub fn sent_commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Publish a pong that was not triggered by a ping
    pub fn inject_pong(&self, pong: Pong) -> bool {
        self.pongs.produce(pong)
    }

    /// Publish a response that was not triggered by a command
    pub fn inject_response(&self, response: Response) -> bool {
        self.responses.produce(response)
    }

    fn ensure_initialized(&self) -> NmxResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NmxError::InvalidState("bus not initialized".to_string()))
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryBus for SimBus {
    async fn initialize(&self, _deadline: Instant) -> NmxResult<()> {
        if self.init_fails.load(Ordering::SeqCst) {
            return Err(NmxError::Timeout(
                "bus publishers and subscribers did not match".to_string(),
            ));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ping_send(&self, ping: &Ping) -> NmxResult<()> {
        self.ensure_initialized()?;

        for device in self.devices.lock().iter() {
            // Names travel in a fixed, NUL-terminated field.
            let device_name: String = device
                .name
                .chars()
                .take(DEVICE_NAME_CAPACITY - 1)
                .collect();
            self.pongs.produce(Pong {
                request_id: ping.request_id,
                device_name,
            });
        }
        Ok(())
    }

    fn pong_listen(&self) {
        self.pongs.listen();
    }

    async fn pong_recv(&self, deadline: Instant) -> NmxResult<Pong> {
        self.pongs.consume(deadline).await
    }

    fn pong_reject(&self) {
        self.pongs.reject();
    }

    fn command_send(&self, command: &Command) -> NmxResult<()> {
        self.ensure_initialized()?;
        self.commands.lock().push(command.clone());

        let handler = self
            .devices
            .lock()
            .iter()
            .find(|d| d.name == command.device_name)
            .and_then(|d| d.handler.clone());

        let Some(handler) = handler else {
            return Ok(());
        };

        if let Some(payload) = handler(&command.payload) {
            if payload.len() > MAX_RESPONSE_SIZE {
                log::warn!(
                    "Simulated device {} response too large: {} bytes",
                    command.device_name,
                    payload.len()
                );
                return Ok(());
            }
            self.responses.produce(Response {
                request_id: command.request_id,
                payload,
            });
        }
        Ok(())
    }

    fn response_listen(&self) {
        self.responses.listen();
    }

    async fn response_recv(&self, deadline: Instant) -> NmxResult<Response> {
        self.responses.consume(deadline).await
    }

    fn response_reject(&self) {
        self.responses.reject();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::nmp_echo_handler;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ping_answered_by_every_device() {
        let bus = SimBus::new();
        bus.add_silent_device("node-A");
        bus.add_silent_device("a-very-long-device-name");
        bus.initialize(Instant::now()).await.unwrap();

        bus.pong_listen();
        bus.ping_send(&Ping { request_id: 3 }).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let first = bus.pong_recv(deadline).await.unwrap();
        let second = bus.pong_recv(deadline).await.unwrap();
        bus.pong_reject();

        assert_eq!(first.device_name, "node-A");
        assert_eq!(second.device_name.len(), DEVICE_NAME_CAPACITY - 1);
        assert_eq!(second.request_id, 3);
    }

    #[tokio::test]
    async fn test_pong_outside_listen_window_dropped() {
        let bus = SimBus::new();
        bus.add_silent_device("node-A");
        bus.initialize(Instant::now()).await.unwrap();

        bus.ping_send(&Ping { request_id: 1 }).unwrap();
        bus.pong_listen();
        let result = bus
            .pong_recv(Instant::now() + Duration::from_millis(20))
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_command_routed_by_name() {
        let bus = SimBus::new();
        bus.add_device("node-B", nmp_echo_handler());
        bus.initialize(Instant::now()).await.unwrap();

        let request = nmx_core::NmpMessage::new(
            nmx_core::NmpHeader::new(nmx_core::NmpOp::Read, 0, 0, 9),
            Bytes::from_static(b"hi"),
        );
        bus.response_listen();
        bus.command_send(&Command {
            request_id: 77,
            device_name: "node-B".to_string(),
            payload: request.encode().unwrap(),
        })
        .unwrap();

        let rsp = bus
            .response_recv(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        bus.response_reject();

        assert_eq!(rsp.request_id, 77);
        let decoded = nmx_core::NmpMessage::decode(&rsp.payload).unwrap();
        assert_eq!(decoded.seq(), 9);
        assert_eq!(&decoded.body[..], b"hi");
        assert_eq!(bus.sent_commands().len(), 1);
    }

    #[test]
    fn test_send_before_initialize_fails() {
        let bus = SimBus::new();
        assert!(bus.ping_send(&Ping { request_id: 1 }).is_err());
    }
}
