use super::error::{DhtError, KrpcError};
use super::message::{Envelope, TransactionId};
use crate::bencode::Dict;
use crate::constants::{
    BEP42_MAX_CANDIDATES, BEP42_REQUIRED_VOTES, MAX_DATAGRAM, MAX_PENDING_QUERIES,
    TRANSACTION_ID_LEN,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Serves one KRPC method: `(querier endpoint, args) -> return dict`.
pub type Handler = Arc<dyn Fn(SocketAddr, Dict) -> Result<Dict, KrpcError> + Send + Sync>;

/// Notified with the new public endpoint once enough peers agree on it.
pub type EndpointListener = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// The request/response layer a routing table talks through.
///
/// `call` blocks the calling thread. It must not be invoked from inside an
/// async task; routing workers and handler threads are plain OS threads.
pub trait Transport: Send + Sync {
    fn call(
        &self,
        method: &str,
        args: Dict,
        to: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Dict, DhtError>;

    fn register(&self, method: &str, handler: Handler);

    fn local_endpoint(&self) -> SocketAddr;

    /// Our address as reported by remote nodes, once confirmed.
    fn public_endpoint(&self) -> Option<SocketAddr>;

    fn on_public_endpoint_change(&self, listener: EndpointListener);

    fn can_send_to(&self, endpoint: &SocketAddr) -> bool {
        endpoint.port() != 0 && endpoint.is_ipv6() == self.local_endpoint().is_ipv6()
    }
}

type Pending = HashMap<TransactionId, oneshot::Sender<Result<Dict, KrpcError>>>;

/// KRPC over a tokio UDP socket.
///
/// A receive task demultiplexes replies to waiting callers by transaction id
/// and runs inbound queries on the blocking pool. The BEP-42 `ip` field of
/// replies to our own queries is tallied per reporting host; once
/// [`BEP42_REQUIRED_VOTES`] hosts agree, the public endpoint is updated and
/// listeners run.
pub struct KrpcSocket {
    socket: Arc<UdpSocket>,
    runtime: Handle,
    local: SocketAddr,
    pending: Mutex<Pending>,
    handlers: RwLock<HashMap<String, Handler>>,
    public: RwLock<Option<SocketAddr>>,
    votes: Mutex<HashMap<SocketAddr, HashSet<IpAddr>>>,
    listeners: Mutex<Vec<EndpointListener>>,
    shutdown: CancellationToken,
}

impl KrpcSocket {
    pub fn bind(addr: SocketAddr, runtime: Handle) -> Result<Arc<Self>, DhtError> {
        let socket = runtime.block_on(UdpSocket::bind(addr))?;
        let local = socket.local_addr()?;
        info!("DHT socket bound to {}", local);

        let this = Arc::new(Self {
            socket: Arc::new(socket),
            runtime: runtime.clone(),
            local,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            public: RwLock::new(None),
            votes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        runtime.spawn(Self::run(
            Arc::downgrade(&this),
            this.socket.clone(),
            this.shutdown.clone(),
        ));
        Ok(this)
    }

    /// Stops the receive task. Outstanding calls run into their timeout.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn run(this: Weak<Self>, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = socket.recv_from(&mut buf) => {
                    let Some(this) = this.upgrade() else {
                        break;
                    };
                    match result {
                        Ok((n, from)) => this.dispatch(&buf[..n], from),
                        Err(e) => debug!("DHT socket receive error: {}", e),
                    }
                }
            }
        }
        debug!("DHT socket receive loop stopped");
    }

    pub(super) fn dispatch(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        match Envelope::parse(data) {
            Ok(Envelope::Query { tid, method, args }) => self.serve(tid, method, args, from),
            Ok(Envelope::Response { tid, ret, ip }) => {
                if self.complete(&tid, Ok(ret)) {
                    if let Some(ip) = ip {
                        self.vote(from.ip(), ip);
                    }
                } else {
                    trace!("unsolicited response from {}", from);
                }
            }
            Ok(Envelope::Error { tid, error }) => {
                self.complete(&tid, Err(error));
            }
            Err(e) => debug!("Failed to parse DHT message from {}: {}", from, e),
        }
    }

    /// Hands a reply to its waiting caller. Returns false if no query with
    /// that transaction id is outstanding.
    fn complete(&self, tid: &TransactionId, result: Result<Dict, KrpcError>) -> bool {
        match self.pending.lock().remove(tid) {
            Some(waiter) => {
                let _ = waiter.send(result);
                true
            }
            None => false,
        }
    }

    /// Reserves a transaction id for an outgoing query.
    pub(super) fn begin(
        &self,
    ) -> Result<(TransactionId, oneshot::Receiver<Result<Dict, KrpcError>>), DhtError> {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_QUERIES {
            return Err(DhtError::RateLimited);
        }
        let tid = self.transaction_id(&pending);
        let (tx, rx) = oneshot::channel();
        pending.insert(tid.clone(), tx);
        Ok((tid, rx))
    }

    fn serve(self: &Arc<Self>, tid: TransactionId, method: String, args: Dict, from: SocketAddr) {
        trace!("query {} from {}", method, from);
        let handler = self.handlers.read().get(&method).cloned();
        let socket = self.socket.clone();

        self.runtime.spawn(async move {
            let reply = match handler {
                None => Envelope::Error {
                    tid,
                    error: KrpcError::new(KrpcError::METHOD_UNKNOWN, "method unknown"),
                },
                Some(handler) => {
                    match tokio::task::spawn_blocking(move || handler(from, args)).await {
                        Ok(Ok(ret)) => Envelope::Response {
                            tid,
                            ret,
                            ip: Some(from),
                        },
                        Ok(Err(error)) => Envelope::Error { tid, error },
                        Err(_) => Envelope::Error {
                            tid,
                            error: KrpcError::new(KrpcError::SERVER, "handler failed"),
                        },
                    }
                }
            };

            match reply.encode() {
                Ok(data) => {
                    if let Err(e) = socket.send_to(&data, from).await {
                        debug!("Failed to reply to {}: {}", from, e);
                    }
                }
                Err(e) => debug!("Failed to encode reply to {}: {}", from, e),
            }
        });
    }

    fn vote(self: &Arc<Self>, reporter: IpAddr, reported: SocketAddr) {
        {
            let mut votes = self.votes.lock();
            if !votes.contains_key(&reported) && votes.len() >= BEP42_MAX_CANDIDATES {
                votes.clear();
            }
            let reporters = votes.entry(reported).or_default();
            reporters.insert(reporter);
            if reporters.len() < BEP42_REQUIRED_VOTES {
                return;
            }
            votes.clear();
        }

        {
            let mut public = self.public.write();
            if *public == Some(reported) {
                return;
            }
            *public = Some(reported);
        }

        info!("Public endpoint is now {}", reported);
        let this = self.clone();
        // Listeners rebuild routing state and may issue blocking calls.
        self.runtime.spawn_blocking(move || {
            for listener in this.listeners.lock().iter() {
                listener(reported);
            }
        });
    }

    fn transaction_id(&self, pending: &Pending) -> TransactionId {
        loop {
            let mut tid = [0u8; TRANSACTION_ID_LEN];
            rand::rng().fill(&mut tid);
            let tid = Bytes::copy_from_slice(&tid);
            if !pending.contains_key(&tid) {
                return tid;
            }
        }
    }
}

impl Transport for KrpcSocket {
    fn call(
        &self,
        method: &str,
        args: Dict,
        to: SocketAddr,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Dict, DhtError> {
        if !self.can_send_to(&to) {
            return Err(DhtError::Unreachable(to));
        }

        let (tid, rx) = self.begin()?;
        let query = Envelope::Query {
            tid: tid.clone(),
            method: method.to_string(),
            args,
        };
        let data = match query.encode() {
            Ok(data) => data,
            Err(e) => {
                self.pending.lock().remove(&tid);
                return Err(e);
            }
        };

        let socket = self.socket.clone();
        let result: Result<Dict, DhtError> = self.runtime.block_on(async move {
            if let Err(e) = socket.send_to(&data, to).await {
                return Err(DhtError::from(e));
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(DhtError::Cancelled),
                reply = tokio::time::timeout(timeout, rx) => match reply {
                    Ok(Ok(Ok(ret))) => Ok(ret),
                    Ok(Ok(Err(error))) => Err(DhtError::Remote {
                        code: error.code,
                        message: error.message,
                    }),
                    Ok(Err(_)) | Err(_) => Err(DhtError::Timeout),
                },
            }
        });

        self.pending.lock().remove(&tid);
        result
    }

    fn register(&self, method: &str, handler: Handler) {
        self.handlers.write().insert(method.to_string(), handler);
    }

    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn public_endpoint(&self) -> Option<SocketAddr> {
        *self.public.read()
    }

    fn on_public_endpoint_change(&self, listener: EndpointListener) {
        self.listeners.lock().push(listener);
    }
}

impl Drop for KrpcSocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
