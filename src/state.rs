//! Snapshot of a node, to restart it without an external bootstrap list.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{Id, Storage};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StateRepr", into = "StateRepr")]
/// Everything needed to restart a node where it left off.
pub struct State {
    pub ksize: usize,
    pub alpha: usize,
    pub id: Id,
    /// Addresses of the nodes nearest to [State::id].
    pub neighbors: Vec<SocketAddr>,
    pub storage: Storage,
}

impl State {
    /// Write this snapshot to `path`, replacing any previous one.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = serde_bencode::to_bytes(self)?;

        fs::write(path, bytes)?;

        debug!(?path, neighbors = self.neighbors.len(), "Saved state");

        Ok(())
    }

    /// Read a snapshot written by [State::save].
    pub fn load(path: impl AsRef<Path>) -> Result<State> {
        let bytes = fs::read(path)?;

        match serde_bencode::from_bytes::<State>(&bytes) {
            Ok(state) => Ok(state),
            Err(serde_bencode::Error::Custom(reason)) => Err(Error::InvalidSnapshot(reason)),
            Err(error) => Err(Error::InvalidSnapshot(error.to_string())),
        }
    }

    /// [State::neighbors] as `ip:port` strings, ready to bootstrap from.
    pub fn bootstrap(&self) -> Vec<String> {
        self.neighbors.iter().map(|address| address.to_string()).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct StateRepr {
    ksize: usize,
    alpha: usize,
    #[serde(with = "serde_bytes")]
    id: Vec<u8>,
    neighbors: Vec<(String, u16)>,
    storage: Storage,
}

impl TryFrom<StateRepr> for State {
    type Error = String;

    fn try_from(repr: StateRepr) -> std::result::Result<Self, Self::Error> {
        let id = Id::from_bytes(&repr.id).map_err(|error| error.to_string())?;

        if repr.ksize == 0 || repr.alpha == 0 {
            return Err("ksize and alpha must be positive".to_string());
        }

        let neighbors = repr
            .neighbors
            .into_iter()
            .map(|(ip, port)| {
                ip.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, port))
                    .map_err(|_| format!("invalid neighbor ip: {ip}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(State {
            ksize: repr.ksize,
            alpha: repr.alpha,
            id,
            neighbors,
            storage: repr.storage,
        })
    }
}

impl From<State> for StateRepr {
    fn from(state: State) -> Self {
        StateRepr {
            ksize: state.ksize,
            alpha: state.alpha,
            id: state.id.to_vec(),
            neighbors: state
                .neighbors
                .iter()
                .map(|address| (address.ip().to_string(), address.port()))
                .collect(),
            storage: state.storage,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::common::Value;

    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kadnode-{}-{}", name, Id::random()))
    }

    #[test]
    fn save_and_load() {
        let mut storage = Storage::default();
        storage.set(Id::digest(b"alpha"), Value::from("beta"));
        storage.set(Id::digest(b"answer"), Value::from(42));

        let state = State {
            ksize: 20,
            alpha: 3,
            id: Id::random(),
            neighbors: vec![
                "127.0.0.1:8468".parse().unwrap(),
                "[::1]:8469".parse().unwrap(),
            ],
            storage,
        };

        let path = temp_path("state");
        state.save(&path).unwrap();

        let mut loaded = State::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.ksize, 20);
        assert_eq!(loaded.alpha, 3);
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.neighbors, state.neighbors);
        assert_eq!(
            loaded.bootstrap(),
            vec!["127.0.0.1:8468".to_string(), "[::1]:8469".to_string()]
        );
        assert_eq!(
            loaded.storage.get(&Id::digest(b"alpha")),
            Some(&Value::from("beta"))
        );
        assert_eq!(loaded.storage.len(), 2);
    }

    #[test]
    fn invalid_snapshot() {
        let path = temp_path("garbage");
        fs::write(&path, b"d5:ksizei20ee").unwrap();

        let result = State::load(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn missing_file() {
        let result = State::load(temp_path("missing"));

        assert!(matches!(result, Err(Error::IO(_))));
    }
}
