//! Dht node.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::{
    common::{Id, Node, Storage, Value},
    rpc::{Config, Info, Rpc, DEFAULT_SAVE_STATE_FREQUENCY},
    state::State,
    Result,
};

#[derive(Debug, Clone)]
/// Kademlia Dht node.
///
/// A handle to an actor thread owning the socket, the routing table and
/// the storage. Cloning is cheap, and the thread stops once every clone
/// is dropped or [Dht::shutdown] is called.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Debug, Default, Clone)]
/// A builder for the [Dht] node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set the port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);

        self
    }

    /// Set the interface to listen on.
    pub fn bind_address(mut self, bind_address: IpAddr) -> Self {
        self.0.bind_address = bind_address;

        self
    }

    /// Use an explicit Id instead of a random one.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);

        self
    }

    /// Set bucket size and replication factor.
    pub fn k(mut self, k: usize) -> Self {
        self.0.k = k.max(1);

        self
    }

    /// Set lookup parallelism.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.0.alpha = alpha.max(1);

        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set how often buckets are refreshed and stored values republished.
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.0.refresh_interval = refresh_interval;

        self
    }

    /// Set the time to live of stored values, `None` to keep them forever.
    pub fn storage_ttl(mut self, storage_ttl: Option<Duration>) -> Self {
        self.0.storage_ttl = storage_ttl;

        self
    }

    /// Set bootstrapping nodes, as `host:port` strings.
    pub fn bootstrap(mut self, bootstrap: &[String]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Save the node's state to `path` on start and then every `frequency`.
    ///
    /// Defaults to every [DEFAULT_SAVE_STATE_FREQUENCY] if `frequency` is `None`.
    pub fn save_state(mut self, path: impl Into<PathBuf>, frequency: Option<Duration>) -> Self {
        self.0.state_path = Some(path.into());
        self.0.save_state_frequency = frequency.unwrap_or(DEFAULT_SAVE_STATE_FREQUENCY);

        self
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }
}

impl Dht {
    /// Create a new Dht node.
    ///
    /// Binds the socket, then starts the actor thread, bootstrapping
    /// from [Config::bootstrap] in the background.
    pub fn new(config: Config) -> Result<Self> {
        Self::start(config, None)
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Restart a node from a snapshot written by [Dht::save_state].
    ///
    /// The Id, `k`, `alpha` and stored values come from the snapshot, the saved
    /// neighbors are added to the builder's bootstrapping nodes.
    pub fn load_state(path: impl AsRef<Path>, builder: DhtBuilder) -> Result<Self> {
        let state = State::load(path)?;

        let mut config = builder.0;
        config.id = Some(state.id);
        config.k = state.ksize;
        config.alpha = state.alpha;
        config.bootstrap.extend(state.bootstrap());

        Self::start(config, Some(state.storage))
    }

    fn start(config: Config, storage: Option<Storage>) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();

        let mut rpc = Rpc::new(&config)?;

        if let Some(storage) = storage {
            rpc = rpc.with_storage(storage);
        }

        if !config.bootstrap.is_empty() {
            rpc.bootstrap(&config.bootstrap, None);
        }

        thread::Builder::new()
            .name("Kadnode Dht actor thread".to_string())
            .spawn(move || run(rpc, receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Addresses of the nodes nearest to this node, to bootstrap from next time.
    pub fn bootstrappable_neighbors(&self) -> Result<Vec<SocketAddr>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<SocketAddr>>(1);

        self.0
            .send(ActorMessage::BootstrappableNeighbors(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Bootstrap from the given `host:port` addresses.
    ///
    /// Blocks until the lookup of this node's own Id is done, and returns the
    /// nodes nearest to it, empty if no address responded.
    pub fn bootstrap(&self, bootstrap: &[String]) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.0
            .send(ActorMessage::Bootstrap(bootstrap.to_vec(), sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Get the value stored under `key`, hashed to an [Id].
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Value>, DhtWasShutdown> {
        self.get_digest(Id::digest(key))
    }

    /// Get the value stored under an already hashed key.
    pub fn get_digest(&self, key: Id) -> Result<Option<Value>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Value>>(1);

        self.0
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Store `value` under `key`, hashed to an [Id], on the nodes nearest to it.
    ///
    /// Returns `true` if any node stored it, and
    /// [Error::RequestTooLarge](crate::Error::RequestTooLarge) without storing
    /// anything if the value can't fit in a `store` request.
    pub fn set(&self, key: impl AsRef<[u8]>, value: impl Into<Value>) -> Result<bool> {
        self.set_digest(Id::digest(key), value)
    }

    /// Store `value` under an already hashed key.
    pub fn set_digest(&self, key: Id, value: impl Into<Value>) -> Result<bool> {
        let (sender, receiver) = flume::bounded::<Result<bool>>(1);

        self.0
            .send(ActorMessage::Set(key, value.into(), sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)?
    }

    /// Write this node's Id, settings, nearest neighbors and stored values to
    /// `path`, to restart it later with [Dht::load_state].
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        self.state()?.save(path)
    }

    pub(crate) fn state(&self) -> Result<State, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<State>(1);

        self.0
            .send(ActorMessage::State(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    loop {
        loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => {
                    drop(receiver);
                    info!(id = ?rpc.id(), "Shutting down");
                    let _ = sender.send(());
                    return;
                }
                Ok(actor_message) => handle_message(&mut rpc, actor_message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!(id = ?rpc.id(), "All handles dropped, shutting down");
                    return;
                }
            }
        }

        rpc.tick();
    }
}

fn handle_message(rpc: &mut Rpc, actor_message: ActorMessage) {
    match actor_message {
        ActorMessage::Info(sender) => {
            let _ = sender.send(rpc.info());
        }
        ActorMessage::BootstrappableNeighbors(sender) => {
            let _ = sender.send(rpc.bootstrappable_neighbors());
        }
        ActorMessage::State(sender) => {
            let _ = sender.send(rpc.state());
        }
        ActorMessage::Bootstrap(bootstrap, sender) => rpc.bootstrap(&bootstrap, Some(sender)),
        ActorMessage::Get(key, sender) => rpc.get(key, sender),
        ActorMessage::Set(key, value, sender) => rpc.set(key, value, Some(sender)),
        ActorMessage::Shutdown(_) => {}
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    BootstrappableNeighbors(Sender<Vec<SocketAddr>>),
    State(Sender<State>),
    Shutdown(Sender<()>),
    Bootstrap(Vec<String>, Sender<Vec<Node>>),
    Get(Id, Sender<Option<Value>>),
    Set(Id, Value, Sender<Result<bool>>),
}

#[derive(thiserror::Error, Debug)]
#[error("The Dht was shutdown")]
/// The actor thread stopped, either by [Dht::shutdown] or a panic.
pub struct DhtWasShutdown;

/// Create a testnet of Dht nodes on localhost, each bootstrapped from
/// all the previous ones.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for _ in 0..count {
            let node = Dht::builder()
                .port(0)
                .bind_address([127, 0, 0, 1].into())
                .build()?;

            if !bootstrap.is_empty() {
                node.bootstrap(&bootstrap)?;
            }

            bootstrap.push(node.info()?.local_addr().to_string());
            nodes.push(node);
        }

        Ok(Self { bootstrap, nodes })
    }

    /// A node outside the testnet, bootstrapped from it.
    pub fn client(&self) -> Result<Dht> {
        let node = Dht::builder()
            .port(0)
            .bind_address([127, 0, 0, 1].into())
            .build()?;

        node.bootstrap(&self.bootstrap)?;

        Ok(node)
    }
}
