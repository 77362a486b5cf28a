//! UDP socket layer managing incoming/outgoing requests and responses.

mod inflight_requests;

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::common::{Frame, MessageId, Request, Response};
use crate::{Error, Result};

use super::config::{Config, DEFAULT_PORT};

pub use inflight_requests::InflightRequest;
use inflight_requests::InflightRequests;

/// Largest UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65_535;
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that frames Rpc requests and responses, and
/// correlates responses to inflight requests.
#[derive(Debug)]
pub struct RpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    request_timeout: Duration,
    inflight_requests: InflightRequests,
    buf: Vec<u8>,
}

#[derive(Debug)]
/// A datagram that passed validation.
pub enum Incoming {
    Request {
        from: SocketAddr,
        message_id: MessageId,
        request: Request,
    },
    /// Response to one of our inflight requests, no longer inflight.
    Response {
        from: SocketAddr,
        request: InflightRequest,
        response: Response,
    },
}

impl RpcSocket {
    pub fn new(config: &Config) -> Result<Self> {
        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::new(config.bind_address, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(config.bind_address, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(config.bind_address, 0)),
            }?
        };

        let local_addr = socket.local_addr()?;

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local_addr,
            request_timeout: config.request_timeout,
            inflight_requests: InflightRequests::new(),
            buf: vec![0; MAX_DATAGRAM_SIZE],
        })
    }

    #[cfg(test)]
    pub(crate) fn localhost(request_timeout: Duration) -> Result<Self> {
        Self::new(&Config {
            port: Some(0),
            bind_address: [127, 0, 0, 1].into(),
            request_timeout,
            ..Default::default()
        })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // === Public Methods ===

    /// Returns true if this message_id is still inflight.
    pub fn inflight(&self, message_id: &MessageId) -> bool {
        self.inflight_requests.contains(message_id)
    }

    /// Number of requests awaiting a response.
    pub fn inflight_count(&self) -> usize {
        self.inflight_requests.len()
    }

    /// Send a request to the given address and return its message_id.
    ///
    /// Fails without sending anything if the request can't be encoded or is
    /// too large. A failure to send is only logged, the request will time out.
    pub fn request(&mut self, address: SocketAddr, request: &Request) -> Result<MessageId> {
        let message_id = MessageId::random();
        let bytes = Frame::encode_request(message_id, request)?;

        self.inflight_requests
            .add(message_id, address, request.method());

        trace!(?address, ?message_id, method = %request.method(), "Sending request");

        if let Err(error) = self.socket.send_to(&bytes, address) {
            debug!(?error, ?address, "Error sending request message");
        }

        Ok(message_id)
    }

    /// Send a response to the given address.
    pub fn response(&mut self, address: SocketAddr, message_id: MessageId, response: &Response) {
        let result = Frame::encode_response(message_id, response)
            .and_then(|bytes| Ok(self.socket.send_to(&bytes, address)?));

        if let Err(error) = result {
            debug!(?error, ?address, "Error sending response message");
        }
    }

    /// Remove and return requests that got no response in time.
    pub fn timed_out(&mut self) -> Vec<InflightRequest> {
        self.inflight_requests.cleanup(self.request_timeout)
    }

    /// Receives a single datagram on the socket.
    ///
    /// Returns `None` if nothing valid was received, sleeping for
    /// [MAX_THREAD_BLOCK_DURATION] if the socket had nothing to read.
    pub fn recv_from(&mut self) -> Option<Incoming> {
        let (amt, from) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
                return None;
            }
            Err(error) => {
                trace!(?error, "recv_from failed unexpectedly");
                return None;
            }
        };

        if from.port() == 0 {
            trace!(?from, "Datagram from port 0");
            return None;
        }

        let bytes = &self.buf[..amt];

        match Frame::from_bytes(bytes) {
            Ok(Frame::Request {
                message_id,
                request,
            }) => {
                trace!(?from, ?message_id, method = %request.method(), "Received request");

                Some(Incoming::Request {
                    from,
                    message_id,
                    request,
                })
            }
            Ok(Frame::Response {
                message_id,
                payload,
            }) => self.expected_response(from, message_id, &payload),
            Err(Error::MalformedFrame(reason)) => {
                warn!(?from, size = amt, reason, "Dropping malformed frame");
                None
            }
            Err(error) => {
                debug!(
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid request"
                );
                None
            }
        }
    }

    // === Private Methods ===

    fn expected_response(
        &mut self,
        from: SocketAddr,
        message_id: MessageId,
        payload: &[u8],
    ) -> Option<Incoming> {
        let Some(request) = self.inflight_requests.get(&message_id) else {
            debug!(?from, ?message_id, "Unexpected response id, late or duplicate");
            return None;
        };

        if !request.does_match(&from) {
            trace!(?from, expected = ?request.to, "Response from wrong address");
            return None;
        }

        match Response::from_bytes(request.method, payload) {
            Ok(response) => {
                let request = self.inflight_requests.remove(&message_id)?;

                trace!(?from, ?message_id, "Received response");

                Some(Incoming::Response {
                    from,
                    request,
                    response,
                })
            }
            Err(error) => {
                debug!(?error, ?from, method = %request.method, "Malformed response");
                None
            }
        }
    }
}
