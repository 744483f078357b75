//! An in-process network for exercising routing tables without sockets.

use super::error::DhtError;
use super::transport::{EndpointListener, Handler, Transport};
use crate::bencode::Dict;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<SocketAddr, Weak<MemoryTransport>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            addr,
            network: self.clone(),
            handlers: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            public: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        });
        self.endpoints
            .write()
            .insert(addr, Arc::downgrade(&transport));
        transport
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<MemoryTransport>> {
        self.endpoints.read().get(addr).and_then(Weak::upgrade)
    }
}

/// Delivers calls synchronously on the caller's thread. Unknown or offline
/// endpoints fail at once with a timeout.
pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    handlers: RwLock<HashMap<String, Handler>>,
    calls: Mutex<Vec<(String, SocketAddr)>>,
    offline: AtomicBool,
    public: RwLock<Option<SocketAddr>>,
    listeners: Mutex<Vec<EndpointListener>>,
}

impl MemoryTransport {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Outgoing calls so far as (method, destination).
    pub fn calls(&self) -> Vec<(String, SocketAddr)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str, to: SocketAddr) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(m, addr)| m == method && *addr == to)
            .count()
    }

    pub fn set_public_endpoint(&self, endpoint: SocketAddr) {
        *self.public.write() = Some(endpoint);
        for listener in self.listeners.lock().iter() {
            listener(endpoint);
        }
    }
}

impl Transport for MemoryTransport {
    fn call(
        &self,
        method: &str,
        args: Dict,
        to: SocketAddr,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Dict, DhtError> {
        self.calls.lock().push((method.to_string(), to));
        if cancel.is_cancelled() {
            return Err(DhtError::Cancelled);
        }
        if !self.can_send_to(&to) {
            return Err(DhtError::Unreachable(to));
        }

        let target = match self.network.lookup(&to) {
            Some(target) if !target.offline.load(Ordering::SeqCst) => target,
            _ => return Err(DhtError::Timeout),
        };
        let Some(handler) = target.handlers.read().get(method).cloned() else {
            return Err(DhtError::Remote {
                code: 204,
                message: "method unknown".into(),
            });
        };

        handler(self.addr, args).map_err(|e| DhtError::Remote {
            code: e.code,
            message: e.message,
        })
    }

    fn register(&self, method: &str, handler: Handler) {
        self.handlers.write().insert(method.to_string(), handler);
    }

    fn local_endpoint(&self) -> SocketAddr {
        self.addr
    }

    fn public_endpoint(&self) -> Option<SocketAddr> {
        *self.public.read()
    }

    fn on_public_endpoint_change(&self, listener: EndpointListener) {
        self.listeners.lock().push(listener);
    }
}
