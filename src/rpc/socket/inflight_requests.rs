use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::{Method, MessageId};

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub message_id: MessageId,
    pub to: SocketAddr,
    pub method: Method,
    pub sent_at: Instant,
}

impl InflightRequest {
    /// Returns true if a response from `from` can answer this request.
    ///
    /// Same as comparing addresses but ignores the ip if it is unspecified,
    /// so requests sent to `0.0.0.0:port` accept responses from localhost.
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug)]
pub struct InflightRequests {
    requests: HashMap<MessageId, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }

    pub fn add(&mut self, message_id: MessageId, to: SocketAddr, method: Method) {
        self.requests.insert(
            message_id,
            InflightRequest {
                message_id,
                to,
                method,
                sent_at: Instant::now(),
            },
        );
    }

    /// Check if a message_id is still inflight.
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.requests.contains_key(message_id)
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&InflightRequest> {
        self.requests.get(message_id)
    }

    pub fn remove(&mut self, message_id: &MessageId) -> Option<InflightRequest> {
        self.requests.remove(message_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove and return requests sent more than `timeout` ago.
    pub fn cleanup(&mut self, timeout: Duration) -> Vec<InflightRequest> {
        let now = Instant::now();
        let mut expired = vec![];

        self.requests.retain(|_, request| {
            if now.duration_since(request.sent_at) >= timeout {
                expired.push(request.clone());
                false
            } else {
                true
            }
        });

        expired
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn does_match() {
        let request = InflightRequest {
            message_id: MessageId::random(),
            to: "127.0.0.1:6881".parse().unwrap(),
            method: Method::Ping,
            sent_at: Instant::now(),
        };

        assert!(request.does_match(&"127.0.0.1:6881".parse().unwrap()));
        assert!(!request.does_match(&"127.0.0.1:6882".parse().unwrap()));
        assert!(!request.does_match(&"10.0.0.1:6881".parse().unwrap()));

        let unspecified = InflightRequest {
            to: "0.0.0.0:6881".parse().unwrap(),
            ..request
        };

        assert!(unspecified.does_match(&"10.0.0.1:6881".parse().unwrap()));
    }

    #[test]
    fn cleanup_returns_expired() {
        let mut requests = InflightRequests::new();

        let old = MessageId::random();
        requests.add(old, "127.0.0.1:1".parse().unwrap(), Method::Ping);

        thread::sleep(Duration::from_millis(20));

        let fresh = MessageId::random();
        requests.add(fresh, "127.0.0.1:2".parse().unwrap(), Method::Store);

        let expired = requests.cleanup(Duration::from_millis(10));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, old);
        assert!(!requests.contains(&old));
        assert!(requests.contains(&fresh));
    }
}
