//! Async network side and the simulation thread.
//!
//! ```text
//!  ws conns ──▶ QueueSender ──▶ [ simulation thread: Engine ] ──▶ fan-out task ──▶ per-conn writers
//!  stdin desk ─┘                    (drain, handle, tick)
//! ```
//!
//! The engine never touches a socket and the network tasks never touch
//! combat state. Everything crosses on channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::actions::Command;
use crate::config::ServerConfig;
use crate::engine::{Engine, Inbound};
use crate::protocol::{ClientMessage, Outgoing, ServerMessage, Target};
use crate::state::{
    AccountStore, CombatState, CombatantId, CombatantSpec, ConnId, Encounter, GridGeometry,
    Registry,
};

type Hub = Arc<tokio::sync::Mutex<HashMap<ConnId, Writer>>>;

/// A connection's outbound channel. Broadcasts are held back until the
/// engine's own join frames for it have been routed.
struct Writer {
    tx: mpsc::UnboundedSender<String>,
    joined: bool,
}

impl Writer {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx, joined: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("server is busy, try again")]
    Full,

    #[error("simulation has stopped")]
    Closed,
}

/// Producer half of the inbound queue. Cloned into every connection task.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Inbound>,
    depth: Arc<AtomicUsize>,
    limit: usize,
}

/// Consumer half, owned by the simulation thread.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
    depth: Arc<AtomicUsize>,
    closed: bool,
}

pub fn queue(limit: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: depth.clone(),
            limit,
        },
        QueueReceiver {
            rx,
            depth,
            closed: false,
        },
    )
}

impl QueueSender {
    /// Enqueue an event. Client messages are refused once `limit` of them
    /// are pending; connection lifecycle and desk commands always go through.
    pub fn send(&self, event: Inbound) -> Result<(), QueueError> {
        let counted = matches!(event, Inbound::Message { .. });
        if counted && self.depth.fetch_add(1, Ordering::AcqRel) >= self.limit {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueError::Full);
        }
        self.tx.send(event).map_err(|_| {
            if counted {
                self.depth.fetch_sub(1, Ordering::AcqRel);
            }
            QueueError::Closed
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl QueueReceiver {
    /// Everything queued right now, in arrival order.
    pub fn drain(&mut self) -> Vec<Inbound> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if matches!(event, Inbound::Message { .. }) {
                        self.depth.fetch_sub(1, Ordering::AcqRel);
                    }
                    events.push(event);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        events
    }

    /// All senders are gone.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Run the engine on a dedicated thread until the inbound queue closes or
/// the fan-out side goes away.
pub fn spawn_simulation(
    mut engine: Engine,
    mut inbox: QueueReceiver,
    outbox: mpsc::UnboundedSender<Vec<Outgoing>>,
    tick: Duration,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("simulation".to_string())
        .spawn(move || {
            info!(tick_ms = tick.as_millis() as u64, "simulation running");
            loop {
                let started = Instant::now();
                let mut out = Vec::new();
                for event in inbox.drain() {
                    out.extend(guarded("handle", || engine.handle(event, started)));
                }
                out.extend(guarded("tick", || engine.tick(started)));

                if !out.is_empty() && outbox.send(out).is_err() {
                    warn!("fan-out closed; stopping simulation");
                    break;
                }
                if inbox.is_closed() {
                    info!("inbound queue closed; stopping simulation");
                    break;
                }

                let elapsed = started.elapsed();
                if elapsed < tick {
                    thread::sleep(tick - elapsed);
                }
            }
        })
}

/// Run one engine step. A panic loses that step's frames, not the thread.
fn guarded(step: &'static str, f: impl FnOnce() -> Vec<Outgoing>) -> Vec<Outgoing> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(out) => out,
        Err(_) => {
            error!(step, "engine step panicked; output dropped");
            Vec::new()
        }
    }
}

/// Route encoded frames to connection writers.
async fn fan_out(mut rx: mpsc::UnboundedReceiver<Vec<Outgoing>>, hub: Hub) {
    while let Some(batch) = rx.recv().await {
        route(&mut *hub.lock().await, batch);
    }
}

fn route(writers: &mut HashMap<ConnId, Writer>, batch: Vec<Outgoing>) {
    for frame in batch {
        match frame.target {
            Target::All => {
                for w in writers.values().filter(|w| w.joined) {
                    let _ = w.tx.send(frame.text.clone());
                }
            }
            Target::Conn(conn) => {
                if let Some(w) = writers.get_mut(&conn) {
                    w.joined = true;
                    let _ = w.tx.send(frame.text);
                }
            }
        }
    }
}

/// Parse one line typed at the desk.
pub fn parse_desk_line(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let args: Vec<&str> = rest.split_whitespace().collect();
    let id = |i: usize| -> Result<CombatantId, String> {
        args.get(i)
            .ok_or_else(|| format!("{word}: missing combatant id"))?
            .parse()
            .map_err(|_| format!("{word}: bad combatant id"))
    };

    let command = match word {
        "start" => Command::StartCombat,
        "next" => Command::NextTurn,
        "end" => Command::EndCombat,
        "remove" => Command::RemoveCombatant(id(0)?),
        "hp" => Command::SetHitPoints {
            combatant: id(0)?,
            hp: args
                .get(1)
                .and_then(|v| v.parse().ok())
                .ok_or("hp: expected hp <id> <n>")?,
        },
        "condition" => Command::AddCondition {
            combatant: id(0)?,
            name: args.get(1).ok_or("condition: missing name")?.to_string(),
            rounds: match args.get(2) {
                Some(v) => Some(v.parse().map_err(|_| "condition: bad rounds")?),
                None => None,
            },
        },
        "clear" => Command::RemoveCondition {
            combatant: id(0)?,
            name: args.get(1).ok_or("clear: missing name")?.to_string(),
        },
        "add" => {
            let spec: CombatantSpec =
                serde_json::from_str(rest).map_err(|e| format!("add: {e}"))?;
            Command::AddCombatant(spec)
        }
        "grid" => {
            let grid: GridGeometry = serde_json::from_str(rest).map_err(|e| format!("grid: {e}"))?;
            Command::SetGrid(grid)
        }
        other => return Err(format!("unknown desk command {other:?}")),
    };
    Ok(Some(command))
}

async fn desk_task(queue: QueueSender) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_desk_line(&line) {
            Ok(Some(command)) => {
                if queue.send(Inbound::Desk(command)).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(err = %e, "desk"),
        }
    }
    debug!("desk input closed");
}

async fn handle_ws_conn(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnId,
    hub: Hub,
    queue: QueueSender,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("accept ws")?;
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Register before announcing so the join frames have somewhere to go.
    hub.lock().await.insert(conn, Writer::new(tx.clone()));
    queue
        .send(Inbound::Connected {
            conn,
            peer: Some(peer),
        })?;

    while let Some(m) = stream.next().await {
        let m = match m {
            Ok(m) => m,
            Err(_) => break,
        };
        match m {
            Message::Text(s) => {
                let msg = match ClientMessage::parse(&s) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(conn, err = %e, "bad frame");
                        let _ = tx.send(ServerMessage::error(format!("bad message: {e}")).encode());
                        continue;
                    }
                };
                let kind = msg.kind();
                match queue.send(Inbound::Message { conn, msg }) {
                    Ok(()) => {}
                    Err(QueueError::Full) => {
                        warn!(conn, kind, depth = queue.depth(), "inbound queue full; dropping");
                        let _ = tx.send(ServerMessage::error(QueueError::Full.to_string()).encode());
                    }
                    Err(QueueError::Closed) => break,
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.lock().await.remove(&conn);
    let _ = queue.send(Inbound::Disconnected { conn });
    writer.abort();
    info!(peer = %peer, conn, "ws connection closed");
    Ok(())
}

/// Build the engine from configuration: accounts, encounter, dice seed.
pub fn build_engine(cfg: &ServerConfig) -> anyhow::Result<Engine> {
    let accounts = AccountStore::load(cfg.accounts_path.clone())
        .with_context(|| format!("load accounts from {}", cfg.accounts_path.display()))?;
    info!(path = %cfg.accounts_path.display(), accounts = accounts.count(), "accounts loaded");

    let state = match &cfg.encounter {
        Some(path) => {
            let encounter = Encounter::load(path)?;
            info!(path = %path.display(), combatants = encounter.combatants.len(), "encounter loaded");
            CombatState::from_encounter(encounter, cfg.seed)
        }
        None => CombatState::new(GridGeometry::default(), cfg.seed),
    };

    Ok(Engine::new(state, Registry::new(accounts), cfg.grid_resend))
}

/// Serve until the listener fails or the simulation stops.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let engine = build_engine(&cfg)?;
    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;

    let hub: Hub = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    let (queue_tx, queue_rx) = queue(cfg.max_queue);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<Outgoing>>();

    let simulation = spawn_simulation(engine, queue_rx, out_tx, cfg.tick)
        .context("spawn simulation thread")?;
    tokio::spawn(fan_out(out_rx, hub.clone()));
    tokio::spawn(desk_task(queue_tx.clone()));

    info!(bind = %cfg.bind, tick_ms = cfg.tick.as_millis() as u64, "tablesync listening");

    let next_conn = AtomicU64::new(1);
    loop {
        let (stream, peer) = listener.accept().await?;
        if simulation.is_finished() {
            anyhow::bail!("simulation thread stopped");
        }
        let conn = next_conn.fetch_add(1, Ordering::Relaxed);
        let hub = hub.clone();
        let queue = queue_tx.clone();
        info!(peer = %peer, conn, "tcp connection accepted");
        tokio::spawn(async move {
            if let Err(e) = handle_ws_conn(stream, peer, conn, hub, queue).await {
                warn!(peer = %peer, conn, err = %e, "ws connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Command;
    use crate::state::{AccountStore, Position, Side};
    use pretty_assertions::assert_eq;

    fn ping(conn: ConnId) -> Inbound {
        Inbound::Message {
            conn,
            msg: ClientMessage::Ping { nonce: None },
        }
    }

    #[test]
    fn test_queue_guard_drops_messages_only() {
        let (tx, mut rx) = queue(2);
        tx.send(ping(1)).unwrap();
        tx.send(ping(1)).unwrap();
        assert_eq!(tx.send(ping(1)), Err(QueueError::Full));
        // Lifecycle events are never refused.
        tx.send(Inbound::Disconnected { conn: 1 }).unwrap();
        tx.send(Inbound::Desk(Command::NextTurn)).unwrap();
        assert_eq!(tx.depth(), 2);

        assert_eq!(rx.drain().len(), 4);
        assert_eq!(tx.depth(), 0);
        tx.send(ping(1)).unwrap();
    }

    #[test]
    fn test_queue_reports_closed() {
        let (tx, mut rx) = queue(4);
        tx.send(ping(1)).unwrap();
        drop(tx);
        assert_eq!(rx.drain().len(), 1);
        assert!(rx.is_closed());
    }

    #[test]
    fn test_parse_desk_line() {
        assert_eq!(parse_desk_line("  "), Ok(None));
        assert_eq!(parse_desk_line("start"), Ok(Some(Command::StartCombat)));
        assert_eq!(parse_desk_line("remove 4"), Ok(Some(Command::RemoveCombatant(4))));
        assert_eq!(
            parse_desk_line("hp 2 -3"),
            Ok(Some(Command::SetHitPoints { combatant: 2, hp: -3 }))
        );
        assert_eq!(
            parse_desk_line("condition 3 prone 2"),
            Ok(Some(Command::AddCondition {
                combatant: 3,
                name: "prone".to_string(),
                rounds: Some(2)
            }))
        );
        assert!(parse_desk_line("hp x 3").is_err());
        assert!(parse_desk_line("fly").is_err());

        let Ok(Some(Command::AddCombatant(spec))) = parse_desk_line(
            r#"add {"name": "Ogre", "side": "enemy", "max_hp": 59, "position": {"x": 4, "y": 4}}"#,
        ) else {
            panic!("expected add_combatant");
        };
        assert_eq!(spec.side, Side::Enemy);
        assert_eq!(spec.position, Position::new(4, 4));
    }

    fn frame(target: Target, text: &str) -> Outgoing {
        Outgoing {
            target,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_broadcast_waits_for_join() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();
        writers.insert(7, Writer::new(tx));

        route(
            &mut writers,
            vec![
                frame(Target::All, "stale state"),
                frame(Target::Conn(7), "grid_update"),
                frame(Target::All, "fresh state"),
            ],
        );

        let mut seen = Vec::new();
        while let Ok(text) = rx.try_recv() {
            seen.push(text);
        }
        assert_eq!(seen, vec!["grid_update".to_string(), "fresh state".to_string()]);
    }

    #[test]
    fn test_guarded_step_survives_panic() {
        let out = guarded("handle", || panic!("bad roll"));
        assert_eq!(out, Vec::new());

        let ok = guarded("tick", || vec![frame(Target::All, "state")]);
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn test_simulation_thread_round_trip() {
        let engine = Engine::new(
            CombatState::new(GridGeometry::new(4, 4), Some(1)),
            Registry::new(AccountStore::in_memory()),
            Duration::from_millis(1500),
        );
        let (tx, rx) = queue(16);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = spawn_simulation(engine, rx, out_tx, Duration::from_millis(5)).unwrap();

        tx.send(Inbound::Connected { conn: 1, peer: None }).unwrap();
        tx.send(Inbound::Message {
            conn: 1,
            msg: ClientMessage::Ping { nonce: Some(9) },
        })
        .unwrap();

        let mut kinds = Vec::new();
        while !kinds.iter().any(|k: &String| k == "pong") {
            let batch = out_rx.blocking_recv().unwrap();
            kinds.extend(batch.iter().map(Outgoing::kind));
        }
        assert!(kinds.iter().any(|k| k == "grid_update"));

        drop(tx);
        handle.join().unwrap();
    }
}
