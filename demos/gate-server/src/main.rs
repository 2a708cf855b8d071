//! Demo gateway node.
//!
//! Run with: cargo run -p gate-server -- --tcp-addr 127.0.0.1:3563 --ws-addr 127.0.0.1:3653
//!
//! Clients speak the JSON envelope `{"cmd": "...", "data": "<json>"}`:
//! - `Login {"user_id": "..."}` binds the session through the directory bus
//!   and is answered with `LoginAck`; the persisted image is kept alive
//!   while the connection stays up
//! - `Chat {"text": "..."}` is echoed back to the sender
//! - `Relay` frames are broadcast untouched to every session

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use clap::Parser;
use gate_core::{GateConfig, Session, SessionLearner, SessionStorage, session::set_guest_predicate};
use gate_session::{Agent, DirectoryBus, Message, SessionHandle, storage::MemoryStorage};
use gate_transport::{Gate, JsonProcessor, Routed};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gate-server", about = "Demo session gateway node")]
struct Args {
    /// Gateway config file (TOML). Missing file means defaults.
    #[arg(long, env = "GATE_CONFIG", default_value = "gate.toml")]
    config: PathBuf,

    /// Override `tcp_addr` from the config.
    #[arg(long)]
    tcp_addr: Option<String>,

    /// Override `ws_addr` from the config.
    #[arg(long)]
    ws_addr: Option<String>,

    /// Persisted sessions untouched for this long are evicted.
    #[arg(long, default_value_t = 600)]
    idle_ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Login {
    user_id: String,
}

impl Message for Login {
    const ID: &'static str = "Login";
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginAck {
    user_id: String,
    session_id: String,
}

impl Message for LoginAck {
    const ID: &'static str = "LoginAck";
}

#[derive(Debug, Serialize, Deserialize)]
struct Chat {
    text: String,
}

impl Message for Chat {
    const ID: &'static str = "Chat";
}

struct LogLearner;

impl SessionLearner for LogLearner {
    fn connect(&self, session: &Session) {
        info!(
            session_id = session.session_id(),
            network = session.network(),
            ip = session.ip(),
            "session connected"
        );
    }

    fn disconnect(&self, session: &Session) {
        info!(
            session_id = session.session_id(),
            user_id = session.user_id(),
            "session disconnected"
        );
    }
}

fn processor(
    logins: mpsc::UnboundedSender<Routed<Login>>,
    relay: mpsc::UnboundedSender<Bytes>,
) -> gate_core::Result<JsonProcessor> {
    let mut processor = JsonProcessor::new();
    processor.register::<Login>()?;
    processor.register::<LoginAck>()?;
    processor.register::<Chat>()?;

    processor.set_router::<Login>(logins)?;
    processor.set_handler::<Chat, _>(|msg, agent| agent.write_msg(&msg))?;
    processor.register_raw("Relay", move |_cmd, payload, _agent| {
        if relay.send(payload).is_err() {
            warn!("relay worker stopped");
        }
    })?;
    Ok(processor)
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Binds each logged-in session to its user id.
async fn login_worker(
    bus: DirectoryBus,
    mut logins: mpsc::UnboundedReceiver<Routed<Login>>,
    heartbeat_period: Duration,
) {
    while let Some(Routed { msg, agent }) = logins.recv().await {
        let Some(session) = agent.session_snapshot().await else {
            continue;
        };
        let mut handle = SessionHandle::new(bus.clone(), session);
        if let Err(e) = handle.bind(&msg.user_id).await {
            warn!(user_id = %msg.user_id, error = %e, "bind failed");
            continue;
        }
        if let Err(e) = handle.set("login_at", &unix_secs().to_string()).await {
            warn!(user_id = %msg.user_id, error = %e, "set failed");
        }
        tokio::spawn(keep_alive(
            bus.clone(),
            Arc::clone(&agent),
            msg.user_id.clone(),
            heartbeat_period,
        ));

        agent.write_msg(&LoginAck {
            user_id: msg.user_id,
            session_id: handle.session().session_id().to_string(),
        });
    }
}

/// Heartbeat `user_id` every `period` until the agent's connection closes.
async fn keep_alive(bus: DirectoryBus, agent: Arc<Agent>, user_id: String, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if agent.is_closed() || agent.user_id() != user_id {
            break;
        }
        if let Err(e) = bus.heartbeat(&user_id).await {
            warn!(%user_id, error = %e, "heartbeat failed");
            break;
        }
    }
}

async fn relay_worker(bus: DirectoryBus, mut payloads: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(payload) = payloads.recv().await {
        match bus.broadcast(payload).await {
            Ok(sent) => info!(sent, "relayed payload"),
            Err(e) => warn!(error = %e, "relay failed"),
        }
    }
}

async fn sweep_idle(storage: Arc<MemoryStorage>, ttl: Duration) {
    let mut ticker = tokio::time::interval(ttl / 2);
    loop {
        ticker.tick().await;
        match storage.expire_idle(ttl) {
            Ok(0) => {}
            Ok(evicted) => info!(evicted, "expired idle sessions"),
            Err(e) => warn!(error = %e, "idle sweep failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = GateConfig::load(&args.config)?;
    if let Some(addr) = args.tcp_addr {
        config.tcp_addr = addr;
    }
    if let Some(addr) = args.ws_addr {
        config.ws_addr = addr;
    }
    if config.tcp_addr.is_empty() && config.ws_addr.is_empty() {
        anyhow::bail!("no listener configured; set tcp_addr or ws_addr");
    }

    if let Err(e) = set_guest_predicate(|session| {
        session.user_id().is_empty() || session.user_id().starts_with("guest-")
    }) {
        warn!(error = %e, "guest predicate not installed");
    }

    let (login_tx, login_rx) = mpsc::unbounded_channel();
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let storage = Arc::new(MemoryStorage::new());

    let gate = Gate::builder()
        .config(config)
        .processor(Arc::new(processor(login_tx, relay_tx)?))
        .storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
        .session_learner(Arc::new(LogLearner))
        .build()?;

    let idle_ttl = Duration::from_secs(args.idle_ttl_secs.max(2));
    tokio::spawn(login_worker(gate.bus(), login_rx, idle_ttl / 2));
    tokio::spawn(relay_worker(gate.bus(), relay_rx));
    tokio::spawn(sweep_idle(storage, idle_ttl));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tcp_addr = %gate.config().tcp_addr,
        ws_addr = %gate.config().ws_addr,
        "gate-server starting"
    );
    gate.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await?;

    gate.on_destroy();
    info!("gate-server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use gate_session::{AgentLearner, MemoryConn, SessionDirectory};

    use super::*;

    #[tokio::test]
    async fn test_keep_alive_spares_connected_user() {
        let storage = Arc::new(MemoryStorage::new());
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (bus, _bus_task) = DirectoryBus::spawn(Arc::clone(&directory));

        let addr: SocketAddr = "127.0.0.1:3563".parse().unwrap();
        let (conn, peer) = MemoryConn::pair(addr, addr);
        let agent = Agent::new(conn, None, Arc::clone(&directory) as Arc<dyn AgentLearner>);
        tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.run().await }
        });
        peer.tx.send(Bytes::from_static(b"hello")).unwrap();
        while !agent
            .session_id()
            .is_some_and(|id| directory.agent(id).is_ok())
        {
            tokio::task::yield_now().await;
        }
        let session_id = agent.session_id().unwrap().to_string();
        directory.bind(&session_id, "alice").await.unwrap();
        directory.set(&session_id, "seat", "3").await.unwrap();

        let ttl = Duration::from_millis(300);
        let ticker = tokio::spawn(keep_alive(
            bus.clone(),
            Arc::clone(&agent),
            "alice".to_string(),
            Duration::from_millis(50),
        ));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(storage.expire_idle(ttl).unwrap(), 0);
        assert!(storage.query("alice").await.unwrap().is_some());

        agent.close();
        ticker.await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(storage.expire_idle(ttl).unwrap(), 1);
    }
}
