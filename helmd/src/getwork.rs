use crate::lines::{LineReader, LineSender, Offer, line_queue, offer_line};
use helm_chain::{BlockId, DynChain};
use helm_core::{
    debug, info,
    task::{
        service::{AsyncService, AsyncServiceError, AsyncServiceFuture},
        tick::{TickReason, TickService},
    },
    trace, warn,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
};
use triggered::{Listener, Trigger, trigger};

const GETWORK: &str = "getwork-server";

/// How often the chain tip is checked for new work
pub const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GetworkMessage {
    Job { topoheight: u64, tip: String },
}

impl GetworkMessage {
    fn job(topoheight: u64, tip: BlockId) -> Self {
        GetworkMessage::Job { topoheight, tip: tip.to_string() }
    }
}

/// Polling work server for miners.
///
/// Each new chain tip is pushed to the first `miner_count` connected miners, in connection
/// order. The count is only updated by [`GetworkServer::refresh_miner_count`], so it may
/// lag behind connections by up to one refresh period.
pub struct GetworkServer {
    bind: SocketAddr,
    listener: Mutex<Option<std::net::TcpListener>>,
    chain: DynChain,
    tick_service: Arc<TickService>,
    miners: Mutex<BTreeMap<u64, LineSender>>,
    next_miner_id: AtomicU64,
    miner_count: AtomicUsize,
    last_job: Mutex<Option<GetworkMessage>>,
    shutdown: (Trigger, Listener),
}

impl GetworkServer {
    /// Binds the listener right away so address errors surface before serving starts
    pub fn bind(bind: SocketAddr, chain: DynChain, tick_service: Arc<TickService>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            bind,
            listener: Mutex::new(Some(listener)),
            chain,
            tick_service,
            miners: Mutex::new(BTreeMap::new()),
            next_miner_id: AtomicU64::new(0),
            miner_count: AtomicUsize::new(0),
            last_job: Mutex::new(None),
            shutdown: trigger(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// Recounts live miners. Returns the new count.
    pub fn refresh_miner_count(&self) -> usize {
        let mut miners = self.miners.lock();
        miners.retain(|_, sender| !sender.is_closed());
        let count = miners.len();
        self.miner_count.store(count, Ordering::Relaxed);
        count
    }

    pub fn miner_count(&self) -> usize {
        self.miner_count.load(Ordering::Relaxed)
    }

    fn notify(&self, job: &GetworkMessage) {
        let line = match serde_json::to_string(job) {
            Ok(line) => line,
            Err(err) => {
                warn!("[{}] failed encoding job: {}", GETWORK, err);
                return;
            }
        };
        let count = self.miner_count();
        let miners = self.miners.lock();
        for (miner_id, sender) in miners.iter().take(count) {
            if offer_line(sender, line.clone()) == Offer::Dropped {
                debug!("[{}] miner {} is too slow, dropped a job", GETWORK, miner_id);
            }
        }
        trace!("[{}] pushed job to {} miners", GETWORK, count.min(miners.len()));
    }

    /// Pushes a job when the chain tip moved past `last_topoheight`
    fn check_tip(&self, last_topoheight: &mut Option<u64>) {
        match self.chain.topo_height().and_then(|topoheight| Ok((topoheight, self.chain.read_topo(topoheight)?))) {
            Ok((topoheight, entry)) if *last_topoheight != Some(topoheight) => {
                *last_topoheight = Some(topoheight);
                let job = GetworkMessage::job(topoheight, entry.block_id);
                self.notify(&job);
                self.last_job.lock().replace(job);
            }
            Ok(_) => {}
            Err(err) => debug!("[{}] cannot read chain tip: {}", GETWORK, err),
        }
    }

    async fn job_loop(self: Arc<Self>, mut last_topoheight: Option<u64>) {
        while let TickReason::Wakeup = self.tick_service.tick(JOB_POLL_INTERVAL).await {
            self.check_tip(&mut last_topoheight);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let shutdown = self.shutdown.1.clone();
        loop {
            select! {
                biased;
                _ = shutdown.clone() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(self.clone().miner_session(stream, addr));
                    }
                    Err(err) => warn!("[{}] failed accepting miner: {}", GETWORK, err),
                }
            }
        }
    }

    async fn miner_session(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let miner_id = self.next_miner_id.fetch_add(1, Ordering::SeqCst);
        let (read, mut write) = stream.into_split();
        let (sender, mut receiver) = line_queue();
        let current_job = self.last_job.lock().clone();
        if let Some(line) = current_job.and_then(|job| serde_json::to_string(&job).ok()) {
            offer_line(&sender, line);
        }
        self.miners.lock().insert(miner_id, sender);
        debug!("[{}] miner {} connected from {}", GETWORK, miner_id, addr);

        let writer = tokio::spawn(async move {
            while let Some(mut line) = receiver.recv().await {
                line.push('\n');
                if write.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let shutdown = self.shutdown.1.clone();
        let mut lines = LineReader::new(read);
        loop {
            let line = select! {
                biased;
                _ = shutdown.clone() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => trace!("[{}] miner {}: {}", GETWORK, miner_id, line),
                Ok(None) | Err(_) => break,
            }
        }

        self.miners.lock().remove(&miner_id);
        writer.abort();
        debug!("[{}] miner {} disconnected", GETWORK, miner_id);
    }
}

impl AsyncService for GetworkServer {
    fn ident(self: Arc<Self>) -> &'static str {
        GETWORK
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            let listener = self
                .listener
                .lock()
                .take()
                .ok_or_else(|| AsyncServiceError::Service(format!("{} was already started", GETWORK)))?;
            let listener = TcpListener::from_std(listener).map_err(|err| AsyncServiceError::Service(err.to_string()))?;
            info!("[{}] serving miners on {}", GETWORK, self.bind);
            let mut last_topoheight = None;
            self.check_tip(&mut last_topoheight);
            tokio::join!(self.clone().accept_loop(listener), self.clone().job_loop(last_topoheight));
            Ok(())
        })
    }

    fn signal_exit(self: Arc<Self>) {
        trace!("sending an exit signal to {}", GETWORK);
        self.shutdown.0.trigger();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            self.miners.lock().clear();
            trace!("{} stopped", GETWORK);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_chain::{Block, BlockLinkage, ChainApi, block::LOCAL_PEER, memory::MemoryChain};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_reach_counted_miners_only() {
        let chain = Arc::new(MemoryChain::with_genesis(1.into()));
        let tick_service = Arc::new(TickService::new());
        let server = Arc::new(GetworkServer::bind("127.0.0.1:0".parse().unwrap(), chain.clone(), tick_service.clone()).unwrap());
        let addr = server.local_addr().unwrap();
        let worker = tokio::spawn(server.clone().start());

        let first = TcpStream::connect(addr).await.unwrap();
        let mut first = BufReader::new(first).lines();
        // Every miner gets the current job on connect
        let job = first.next_line().await.unwrap().unwrap();
        assert!(job.contains(r#""topoheight":0"#), "{}", job);
        let _second = TcpStream::connect(addr).await.unwrap();

        while server.miners.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.miner_count(), 0);
        assert_eq!(server.refresh_miner_count(), 2);

        chain.accept_block(Block::new(BlockLinkage::new(2.into(), 1, vec![1.into()]), 0, vec![]), LOCAL_PEER).unwrap();
        let job = first.next_line().await.unwrap().unwrap();
        assert!(job.contains(r#""topoheight":1"#), "{}", job);

        server.clone().signal_exit();
        tick_service.shutdown();
        worker.await.unwrap().unwrap();
    }
}
