use bytes::{BufMut, Bytes, BytesMut};
use jade_log::JadeLogger;
use log::{debug, error, info, Level};
use rakjade::{
    AdmissionLists, DefaultMotd, DisconnectReason, MessageCodec, RakServer, SessionEvents,
    SessionHandle,
};
use std::sync::Arc;
use tokio::time::Instant;

pub mod config;

/// A raw application message: leading id byte plus body.
#[derive(Debug, Clone)]
pub struct GameMessage {
    pub id: u8,
    pub body: Bytes,
}

/// Pass-through codec; real message decoding happens in the game layer,
/// which is not part of this server.
struct GameCodec;

impl MessageCodec for GameCodec {
    type Message = GameMessage;

    fn decode(&self, id: u8, body: Bytes) -> Option<Self::Message> {
        Some(GameMessage { id, body })
    }

    fn encode(&self, message: &Self::Message) -> Bytes {
        let mut writer = BytesMut::with_capacity(1 + message.body.len());
        writer.put_u8(message.id);
        writer.put_slice(&message.body);
        writer.freeze()
    }
}

/// Placeholder application layer: logs the session lifecycle and incoming
/// traffic.
struct GameLayer;

impl SessionEvents for GameLayer {
    type Message = GameMessage;

    fn on_connect(&self, session: &SessionHandle) {
        info!("peer connected: {} (guid {})", session.peer(), session.client_guid());
    }

    fn on_message(&self, session: &SessionHandle, message: GameMessage) {
        debug!(
            "message {:#04x} from {} ({} bytes)",
            message.id,
            session.peer(),
            message.body.len()
        );
    }

    fn on_disconnect(&self, session: &SessionHandle, reason: DisconnectReason) {
        info!("peer disconnected: {} ({:?})", session.peer(), reason);
    }
}

#[tokio::main]
async fn main() {
    if JadeLogger::init(Level::Info).is_err() {
        eprintln!("failed to install logger");
        std::process::exit(1);
    }

    let start_time = Instant::now();

    let config = match config::handle() {
        Ok(config) => config,
        Err(error) => {
            error!("failed to load configuration: {error}");
            std::process::exit(1);
        }
    };
    let transport_config = match config.transport_config() {
        Ok(transport_config) => transport_config,
        Err(error) => {
            error!("invalid configuration: {error}");
            std::process::exit(1);
        }
    };

    let motd = Arc::new(DefaultMotd {
        server_name: config.server.name.clone(),
    });
    let admission = Arc::new(AdmissionLists::new());

    let server = match RakServer::bind(
        transport_config,
        GameCodec,
        GameLayer,
        motd,
        admission,
        None,
    )
    .await
    {
        Ok(server) => server,
        Err(error) => {
            error!("startup failed: {error}");
            std::process::exit(1);
        }
    };

    info!(
        "{}'s load done in {:.2}s",
        config.server.name,
        start_time.elapsed().as_secs_f64()
    );

    if let Err(error) = server.run().await {
        error!("server stopped: {error}");
        std::process::exit(1);
    }
}
