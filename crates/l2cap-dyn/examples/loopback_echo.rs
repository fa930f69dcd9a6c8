/// Example running two dynamic channel managers back to back in one process.
///
/// Device B registers an echo service on PSM 0x1001, device A opens a
/// channel to it and sends a few messages.
use async_trait::async_trait;
use l2cap_dyn::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hands every transport request straight to the other manager
struct Wire {
    local: Address,
    remote: Address,
    own: Mutex<Option<TransportEvents>>,
    peer: Mutex<Option<TransportEvents>>,
}

impl Wire {
    fn new(local: Address, remote: Address) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            own: Mutex::new(None),
            peer: Mutex::new(None),
        })
    }

    fn attach(&self, own: TransportEvents, peer: TransportEvents) {
        *self.own.lock() = Some(own);
        *self.peer.lock() = Some(peer);
    }
}

impl Transport for Wire {
    fn create_connection(&self, _address: Address) {
        if let Some(own) = self.own.lock().as_ref() {
            own.on_connection_complete(self.remote, true);
        }
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.on_connection_complete(self.local, true);
        }
    }

    fn disconnect(&self, _address: Address) {
        if let Some(own) = self.own.lock().as_ref() {
            own.on_disconnected(self.remote);
        }
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.on_disconnected(self.local);
        }
    }

    fn send_signal(&self, _address: Address, message: SignalingMessage) {
        println!("{} -> {}: {:?}", self.local, self.remote, message);
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.on_signal_frame(self.local, &message.serialize());
        }
    }

    fn send_data(&self, _address: Address, remote_cid: u16, payload: Vec<u8>) {
        if let Some(peer) = self.peer.lock().as_ref() {
            peer.on_data(self.local, remote_cid, payload);
        }
    }
}

/// Accepts every link
struct OpenGate;

#[async_trait]
impl SecurityGate for OpenGate {
    async fn check_security(&self, address: Address, policy: SecurityPolicy) -> bool {
        println!("Security check for {} ({:?}): granted", address, policy);
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("L2CAP Loopback Echo Example");
    println!("---------------------------");

    let addr_a: Address = "00:00:00:00:00:0A".parse()?;
    let addr_b: Address = "00:00:00:00:00:0B".parse()?;

    let wire_a = Wire::new(addr_a, addr_b);
    let wire_b = Wire::new(addr_b, addr_a);
    let device_a =
        DynamicChannelManager::new(ManagerConfig::default(), wire_a.clone(), Arc::new(OpenGate))?;
    let device_b =
        DynamicChannelManager::new(ManagerConfig::default(), wire_b.clone(), Arc::new(OpenGate))?;
    wire_a.attach(device_a.transport_events(), device_b.transport_events());
    wire_b.attach(device_b.transport_events(), device_a.transport_events());

    let handler = Handler::new();
    let psm = Psm::new(0x1001);

    // Echo service on device B
    let (registered_tx, mut registered_rx) = mpsc::unbounded_channel();
    device_b.register_service(
        psm,
        SecurityPolicy::Authentication,
        move |result| {
            let _ = registered_tx.send(result);
        },
        |mut channel: ChannelHandle| {
            println!("Service accepted {:?}", channel);
            tokio::spawn(async move {
                while let Some(data) = channel.recv().await {
                    if channel.send(data).is_err() {
                        break;
                    }
                }
            });
        },
        &handler,
    );
    let service = registered_rx
        .recv()
        .await
        .ok_or(L2capError::ManagerStopped)??;
    println!("Registered echo service on PSM {}", service.psm());

    // Client on device A
    let (open_tx, mut open_rx) = mpsc::unbounded_channel();
    let fail_tx = open_tx.clone();
    device_a.connect_channel(
        addr_b,
        psm,
        move |channel| {
            let _ = open_tx.send(Ok(channel));
        },
        move |reason| {
            let _ = fail_tx.send(Err(reason));
        },
        &handler,
    );
    let mut channel = match open_rx.recv().await {
        Some(Ok(channel)) => channel,
        Some(Err(reason)) => {
            eprintln!("Channel failed: {}", reason);
            return Ok(());
        }
        None => return Ok(()),
    };
    println!("Opened {:?}", channel);

    for text in ["hello", "dynamic", "channels"] {
        channel.send(text.as_bytes().to_vec())?;
        if let Some(echo) = channel.recv().await {
            println!("Echo: {}", String::from_utf8_lossy(&echo));
        }
    }

    channel.close();
    while channel.recv().await.is_some() {}
    println!("Channel closed");

    device_a.shutdown().await;
    device_b.shutdown().await;
    Ok(())
}
