use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use farmhand_castore::{tonic::channel_from_url, write::CasPeer, write::GrpcCasPeer};
use parking_lot::Mutex;
use tracing::{debug, instrument};

/// How long an unused stub is kept around.
pub const STUB_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid peer address {0}: {1}")]
    InvalidAddress(String, url::ParseError),

    #[error("unable to connect to {0}: {1}")]
    Connect(String, farmhand_castore::tonic::Error),
}

type Factory = Box<dyn Fn(&str) -> Result<Arc<dyn CasPeer>, Error> + Send + Sync>;

struct Stub {
    peer: Arc<dyn CasPeer>,
    last_access: Instant,
}

/// Stubs to other workers, keyed by their address and expired after
/// [STUB_EXPIRY] without access.
pub struct WorkerStubs {
    factory: Factory,
    expiry: Duration,
    stubs: Mutex<HashMap<String, Stub>>,
}

impl Default for WorkerStubs {
    fn default() -> Self {
        Self::new(grpc_stub)
    }
}

impl WorkerStubs {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn CasPeer>, Error> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            expiry: STUB_EXPIRY,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Returns the stub for `peer`, creating it if there is none yet.
    #[instrument(skip(self))]
    pub fn get(&self, peer: &str) -> Result<Arc<dyn CasPeer>, Error> {
        let now = Instant::now();
        let mut stubs = self.stubs.lock();
        stubs.retain(|_, stub| now.duration_since(stub.last_access) < self.expiry);

        if let Some(stub) = stubs.get_mut(peer) {
            stub.last_access = now;
            return Ok(stub.peer.clone());
        }

        debug!("creating stub");
        let peer_stub = (self.factory)(peer)?;
        stubs.insert(
            peer.to_string(),
            Stub {
                peer: peer_stub.clone(),
                last_access: now,
            },
        );
        Ok(peer_stub)
    }

    pub fn len(&self) -> usize {
        self.stubs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connects to `grpc+http://<peer>`. The channel connects lazily.
pub fn grpc_stub(peer: &str) -> Result<Arc<dyn CasPeer>, Error> {
    let url = url::Url::parse(&format!("grpc+http://{}", peer))
        .map_err(|e| Error::InvalidAddress(peer.to_string(), e))?;
    let channel = channel_from_url(&url).map_err(|e| Error::Connect(peer.to_string(), e))?;
    Ok(Arc::new(GrpcCasPeer::new(channel)))
}
