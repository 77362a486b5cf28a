//! AsyncDht node.

use std::net::SocketAddr;
use std::path::Path;

use crate::{
    common::{Id, Node, Value},
    dht::{ActorMessage, Dht, DhtWasShutdown},
    rpc::Info,
    state::State,
    Result,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
             .0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Addresses of the nodes nearest to this node, to bootstrap from next time.
    pub async fn bootstrappable_neighbors(&self) -> Result<Vec<SocketAddr>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<SocketAddr>>(1);

        self.0
             .0
            .send(ActorMessage::BootstrappableNeighbors(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Bootstrap from the given `host:port` addresses.
    ///
    /// See [Dht::bootstrap].
    pub async fn bootstrap(&self, bootstrap: &[String]) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.0
             .0
            .send(ActorMessage::Bootstrap(bootstrap.to_vec(), sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Values ===

    /// Get the value stored under `key`, hashed to an [Id].
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Value>, DhtWasShutdown> {
        self.get_digest(Id::digest(key)).await
    }

    /// Get the value stored under an already hashed key.
    pub async fn get_digest(&self, key: Id) -> Result<Option<Value>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Value>>(1);

        self.0
             .0
            .send(ActorMessage::Get(key, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Store `value` under `key`, hashed to an [Id], on the nodes nearest to it.
    ///
    /// Returns `true` if any node stored it, see [Dht::set].
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl Into<Value>) -> Result<bool> {
        self.set_digest(Id::digest(key), value).await
    }

    /// Store `value` under an already hashed key.
    pub async fn set_digest(&self, key: Id, value: impl Into<Value>) -> Result<bool> {
        let (sender, receiver) = flume::bounded::<Result<bool>>(1);

        self.0
             .0
            .send(ActorMessage::Set(key, value.into(), sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)?
    }

    /// Write this node's state to `path`, see [Dht::save_state].
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let (sender, receiver) = flume::bounded::<State>(1);

        self.0
             .0
            .send(ActorMessage::State(sender))
            .map_err(|_| DhtWasShutdown)?;

        let state = receiver.recv_async().await.map_err(|_| DhtWasShutdown)?;

        state.save(path)
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut dht = Dht::builder().port(0).build().unwrap().as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.get("alpha").await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn set_get() {
        async fn test() {
            let testnet = Testnet::new(5).unwrap();

            let a = testnet.client().unwrap().as_async();
            let b = testnet.client().unwrap().as_async();

            assert!(a.set("alpha", "beta").await.unwrap());
            assert_eq!(b.get("alpha").await.unwrap(), Some("beta".into()));
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn too_large_value_is_rejected() {
        async fn test() {
            let dht = Dht::builder().port(0).build().unwrap().as_async();

            let value = vec![0u8; crate::rpc::MAX_REQUEST_SIZE + 1];
            let result = dht.set("big", value).await;

            assert!(matches!(result, Err(crate::Error::RequestTooLarge(_))));
            assert_eq!(dht.get("big").await.unwrap(), None);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn bootstrap() {
        async fn test() {
            let testnet = Testnet::new(3).unwrap();

            let dht = Dht::builder()
                .port(0)
                .bind_address([127, 0, 0, 1].into())
                .build()
                .unwrap()
                .as_async();

            let nodes = dht.bootstrap(&testnet.bootstrap).await.unwrap();

            assert_eq!(nodes.len(), 3);
            assert_eq!(dht.info().await.unwrap().routing_table_size(), 3);
            assert_eq!(dht.bootstrappable_neighbors().await.unwrap().len(), 3);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn concurrent_sets() {
        let testnet = Testnet::new(5).unwrap();

        let mut handles = vec![];

        for i in 0..5 {
            let client = testnet.nodes[i].clone().as_async();

            handles.push(std::thread::spawn(move || {
                futures::executor::block_on(async {
                    client.set(format!("key-{i}"), i as i64).await.unwrap()
                })
            }));
        }

        for handle in handles {
            assert!(handle.join().unwrap());
        }

        let client = testnet.client().unwrap().as_async();

        for i in 0..5 {
            let value = futures::executor::block_on(client.get(format!("key-{i}"))).unwrap();

            assert_eq!(value, Some(Value::from(i as i64)));
        }
    }
}
