//! Connection engines that stand in for a real protocol implementation.
//!
//! [`ScriptedEngine`] is driven by tests: events are queued by hand and
//! every call made on the connection is recorded. [`SimulatedEngine`]
//! runs on its own and is what the server binary uses for local runs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::{
    Connection, ConnectionEngine, ConnectionEvent, EventStream, Jid, OpenedConnection, Payload,
};
use crate::errors::EngineError;
use crate::store::CredentialFiles;

/// A call observed by the scripted engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Open(PathBuf),
    Send { to: Jid, payload: Payload },
    Reconnect,
    End,
}

#[derive(Default)]
struct Script {
    calls: Vec<EngineCall>,
    events_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    events_rx: Option<EventStream>,
    fail_open: Option<EngineError>,
    fail_send: Option<(usize, EngineError)>,
    send_attempts: usize,
    identity: Option<Jid>,
}

/// Test engine whose events and failures are scripted up front.
///
/// Events emitted before `open` are buffered and delivered in order once
/// the session subscribes. The engine opens at most one connection.
#[derive(Clone)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Mutex::new(Script {
                events_tx: Some(tx),
                events_rx: Some(rx),
                ..Script::default()
            })),
        }
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    pub fn emit(&self, event: ConnectionEvent) {
        self.with_script(|s| {
            if let Some(tx) = &s.events_tx {
                let _ = tx.send(event);
            }
        });
    }

    /// Drop the event sender so the session sees the stream end.
    pub fn end_stream(&self) {
        self.with_script(|s| s.events_tx = None);
    }

    pub fn fail_open(&self, error: EngineError) {
        self.with_script(|s| s.fail_open = Some(error));
    }

    /// Fail the `nth` send attempt (zero-based).
    pub fn fail_send(&self, nth: usize, error: EngineError) {
        self.with_script(|s| s.fail_send = Some((nth, error)));
    }

    pub fn set_identity(&self, identity: Option<Jid>) {
        self.with_script(|s| s.identity = identity);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.with_script(|s| s.calls.clone())
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<(Jid, Payload)> {
        self.with_script(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    EngineCall::Send { to, payload } => Some((to.clone(), payload.clone())),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn count(&self, call: fn(&EngineCall) -> bool) -> usize {
        self.with_script(|s| s.calls.iter().filter(|c| call(c)).count())
    }
}

#[async_trait]
impl ConnectionEngine for ScriptedEngine {
    async fn open(&self, credentials: CredentialFiles) -> Result<OpenedConnection, EngineError> {
        let events = self.with_script(|s| {
            s.calls.push(EngineCall::Open(credentials.dir().to_path_buf()));
            if let Some(err) = s.fail_open.take() {
                return Err(err);
            }
            s.events_rx
                .take()
                .ok_or_else(|| EngineError::new("scripted engine already opened"))
        })?;

        Ok(OpenedConnection {
            handle: Box::new(ScriptedConnection {
                engine: self.clone(),
            }),
            events,
        })
    }
}

struct ScriptedConnection {
    engine: ScriptedEngine,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&self, to: &Jid, payload: Payload) -> Result<(), EngineError> {
        self.engine.with_script(|s| {
            let attempt = s.send_attempts;
            s.send_attempts += 1;
            if let Some((nth, err)) = &s.fail_send {
                if *nth == attempt {
                    return Err(err.clone());
                }
            }
            s.calls.push(EngineCall::Send {
                to: to.clone(),
                payload,
            });
            Ok(())
        })
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        self.engine.with_script(|s| s.calls.push(EngineCall::Reconnect));
        Ok(())
    }

    async fn end(&self) -> Result<(), EngineError> {
        self.engine.with_script(|s| s.calls.push(EngineCall::End));
        Ok(())
    }

    fn identity(&self) -> Option<Jid> {
        self.engine.with_script(|s| s.identity.clone())
    }
}

/// Self-driving engine for local runs without a protocol implementation.
///
/// Each connection issues a pairing code, refreshes it every
/// `code_refresh`, and reports a successful scan after `scan_after`.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    pub scan_after: Duration,
    pub code_refresh: Duration,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            scan_after: Duration::from_secs(10),
            code_refresh: Duration::from_secs(20),
        }
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect()
    };
    let (reference, noise_key, identity_key) = (part(48), part(44), part(44));
    format!("2@{reference},{noise_key},{identity_key}")
}

#[async_trait]
impl ConnectionEngine for SimulatedEngine {
    async fn open(&self, credentials: CredentialFiles) -> Result<OpenedConnection, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = Arc::new(Mutex::new(None));

        let user: u64 = rand::thread_rng().gen_range(10_000_000_000..99_999_999_999);
        let jid_raw = format!("{user}:1@s.whatsapp.net");
        let scan_after = self.scan_after;
        let refresh = self.code_refresh;
        let shared_identity = Arc::clone(&identity);

        info!(dir = %credentials.dir().display(), "simulated connection opened");

        let task = tokio::spawn(async move {
            let scanned = tokio::time::sleep(scan_after);
            tokio::pin!(scanned);
            loop {
                if tx.send(ConnectionEvent::PairingCode(random_code())).is_err() {
                    return;
                }
                tokio::select! {
                    _ = &mut scanned => break,
                    _ = tokio::time::sleep(refresh) => {}
                }
            }

            let _ = tx.send(ConnectionEvent::CredentialsUpdated(json!({
                "me": { "id": jid_raw },
                "registered": true,
            })));
            let jid = Jid::normalize(&jid_raw);
            *shared_identity.lock().unwrap_or_else(|e| e.into_inner()) = Some(jid.clone());
            let _ = tx.send(ConnectionEvent::Connected {
                identity: Some(jid),
            });

            // Keep the stream open until the session ends the connection.
            std::future::pending::<()>().await;
        });

        Ok(OpenedConnection {
            handle: Box::new(SimulatedConnection {
                identity,
                task: Mutex::new(Some(task)),
            }),
            events: rx,
        })
    }
}

struct SimulatedConnection {
    identity: Arc<Mutex<Option<Jid>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn send(&self, to: &Jid, payload: Payload) -> Result<(), EngineError> {
        info!(to = %to, kind = payload.kind(), "simulated send");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        info!("simulated reconnect");
        Ok(())
    }

    async fn end(&self) -> Result<(), EngineError> {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        Ok(())
    }

    fn identity(&self) -> Option<Jid> {
        self.identity.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
