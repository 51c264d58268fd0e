//!
//! Line delimited JSON RPC server and the getwork server it owns.
//!

use crate::{config::EffectiveConfig, getwork::GetworkServer, lines::LineReader, p2p::DynP2p};
use helm_chain::{ChainResultExt, DynChain, Network};
use helm_core::{
    debug, info,
    subsystems::{ActiveSubsystems, SubsystemGuard},
    task::{service::AsyncService, tick::TickService},
    trace, warn,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{io, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    runtime::Handle,
    select,
};
use triggered::{Listener, Trigger, trigger};

const RPC: &str = "rpc";

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("failed binding {service} to {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("rpc server was already started")]
    AlreadyStarted,
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// A started RPC server
pub trait RpcHandle: Send + Sync {
    fn stop(&self) -> RpcResult<()>;
}

pub type DynRpcHandle = Arc<dyn RpcHandle>;

/// RPC and getwork subsystem as seen by the orchestrator
pub trait RpcApi: Send + Sync {
    fn start(&self, chain: DynChain) -> RpcResult<DynRpcHandle>;

    /// The getwork server, once started and unless disabled. It runs as an async service.
    fn getwork(&self) -> Option<Arc<dyn AsyncService>>;

    /// Recounts the miners eligible for new work. Returns the new count.
    fn refresh_miner_count(&self) -> usize;

    /// Miner count as of the last refresh
    fn miner_count(&self) -> usize;
}

pub type DynRpc = Arc<dyn RpcApi>;

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub network: Network,
    pub bind: SocketAddr,
    pub getwork_bind: SocketAddr,
}

impl From<&EffectiveConfig> for RpcConfig {
    fn from(config: &EffectiveConfig) -> Self {
        Self { network: config.network, bind: config.rpc_bind, getwork_bind: config.getwork_bind }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    fn err(id: Value, error: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(error.into()) }
    }
}

struct Dispatcher {
    network: Network,
    chain: DynChain,
    p2p: DynP2p,
    getwork: Option<Arc<GetworkServer>>,
}

impl Dispatcher {
    fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        match method.as_str() {
            "ping" => RpcResponse::ok(id, json!("pong")),
            "get_info" => match self.chain.topo_height() {
                Ok(topoheight) => RpcResponse::ok(
                    id,
                    json!({
                        "network": self.network.name(),
                        "topoheight": topoheight,
                        "peers": self.p2p.peer_count(),
                        "miners": self.getwork.as_ref().map_or(0, |getwork| getwork.miner_count()),
                        "version": env!("CARGO_PKG_VERSION"),
                    }),
                ),
                Err(err) => RpcResponse::err(id, err.to_string()),
            },
            "get_topo" => {
                let Some(topoheight) = params.get("topoheight").and_then(Value::as_u64) else {
                    return RpcResponse::err(id, "missing topoheight parameter");
                };
                match self.chain.read_topo(topoheight).optional() {
                    Ok(Some(entry)) => RpcResponse::ok(
                        id,
                        json!({
                            "topoheight": topoheight,
                            "block_id": entry.block_id.to_string(),
                            "state_version": entry.state_version,
                            "height": entry.height,
                        }),
                    ),
                    Ok(None) => RpcResponse::ok(id, Value::Null),
                    Err(err) => RpcResponse::err(id, err.to_string()),
                }
            }
            _ => RpcResponse::err(id, format!("unknown method {}", method)),
        }
    }

    fn handle_line(&self, line: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.dispatch(request),
            Err(err) => RpcResponse::err(Value::Null, format!("malformed request: {}", err)),
        }
    }
}

/// Handle of a running [`RpcServer`]
struct ServerHandle {
    shutdown: Trigger,
    guard: Mutex<Option<Arc<SubsystemGuard>>>,
}

impl RpcHandle for ServerHandle {
    fn stop(&self) -> RpcResult<()> {
        self.shutdown.trigger();
        if self.guard.lock().take().is_some() {
            info!("[{}] stopping", RPC);
        }
        Ok(())
    }
}

pub struct RpcServer {
    config: RpcConfig,
    handle: Handle,
    subsystems: Arc<ActiveSubsystems>,
    p2p: DynP2p,
    tick_service: Arc<TickService>,
    getwork: Mutex<Option<Arc<GetworkServer>>>,
    started: Mutex<bool>,
}

impl RpcServer {
    pub fn new(config: RpcConfig, handle: Handle, subsystems: Arc<ActiveSubsystems>, p2p: DynP2p, tick_service: Arc<TickService>) -> Self {
        Self { config, handle, subsystems, p2p, tick_service, getwork: Mutex::new(None), started: Mutex::new(false) }
    }

    fn bind_rpc(&self) -> RpcResult<TcpListener> {
        let addr = self.config.bind;
        let _enter = self.handle.enter();
        std::net::TcpListener::bind(addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)
            })
            .map_err(|source| RpcError::Bind { service: RPC, addr, source })
    }

    async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: Listener, guard: Arc<SubsystemGuard>) {
        loop {
            select! {
                biased;
                _ = shutdown.clone() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!("[{}] client connected from {}", RPC, addr);
                        tokio::spawn(Self::client_session(stream, dispatcher.clone(), shutdown.clone(), guard.clone()));
                    }
                    Err(err) => warn!("[{}] failed accepting client: {}", RPC, err),
                }
            }
        }
        trace!("[{}] accept loop exited", RPC);
    }

    async fn client_session(stream: TcpStream, dispatcher: Arc<Dispatcher>, shutdown: Listener, _guard: Arc<SubsystemGuard>) {
        let (read, mut write) = stream.into_split();
        let mut lines = LineReader::new(read);
        loop {
            let line = select! {
                biased;
                _ = shutdown.clone() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            };
            let response = dispatcher.handle_line(&line);
            let Ok(mut encoded) = serde_json::to_string(&response) else {
                break;
            };
            encoded.push('\n');
            if write.write_all(encoded.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

impl RpcApi for RpcServer {
    fn start(&self, chain: DynChain) -> RpcResult<DynRpcHandle> {
        let mut started = self.started.lock();
        if *started {
            return Err(RpcError::AlreadyStarted);
        }

        let getwork = if EffectiveConfig::is_enabled(&self.config.getwork_bind) {
            let server = GetworkServer::bind(self.config.getwork_bind, chain.clone(), self.tick_service.clone())
                .map_err(|source| RpcError::Bind { service: "getwork", addr: self.config.getwork_bind, source })?;
            Some(Arc::new(server))
        } else {
            info!("[{}] getwork server disabled", RPC);
            None
        };

        let (shutdown, listener) = trigger();
        let guard = Arc::new(self.subsystems.guard());
        if EffectiveConfig::is_enabled(&self.config.bind) {
            let tcp_listener = self.bind_rpc()?;
            let dispatcher = Arc::new(Dispatcher { network: self.config.network, chain, p2p: self.p2p.clone(), getwork: getwork.clone() });
            info!("[{}] serving on {}", RPC, self.config.bind);
            self.handle.spawn(Self::accept_loop(tcp_listener, dispatcher, listener, guard.clone()));
        } else {
            info!("[{}] rpc server disabled", RPC);
        }

        *self.getwork.lock() = getwork;
        *started = true;
        debug!("[{}] started", RPC);
        Ok(Arc::new(ServerHandle { shutdown, guard: Mutex::new(Some(guard)) }))
    }

    fn getwork(&self) -> Option<Arc<dyn AsyncService>> {
        self.getwork.lock().clone().map(|getwork| getwork as Arc<dyn AsyncService>)
    }

    fn refresh_miner_count(&self) -> usize {
        let getwork = self.getwork.lock().clone();
        getwork.map_or(0, |getwork| getwork.refresh_miner_count())
    }

    fn miner_count(&self) -> usize {
        self.getwork.lock().as_ref().map_or(0, |getwork| getwork.miner_count())
    }
}
