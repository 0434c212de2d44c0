use std::{io, net::IpAddr, time::Duration};

use common::{AsyncICMPSocket, Family, ICMPSocket};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{args::Config, error::ProbeError};

/// One open network endpoint able to carry ICMP messages for a single family.
/// Dropping it releases the underlying socket.
pub trait Endpoint {
    async fn send_to(
        &mut self,
        packet: &[u8],
        dst: &IpAddr,
    ) -> io::Result<usize>;
    /// Receive a bare ICMP message, returning its length and the sender.
    async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> io::Result<(usize, IpAddr)>;
}

/// Opens endpoints
pub trait Connector {
    type Endpoint: Endpoint;
    fn open(&self, family: Family) -> io::Result<Self::Endpoint>;
}

/// Raw ICMP sockets, the production transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawConnector;

impl Connector for RawConnector {
    type Endpoint = AsyncICMPSocket;

    fn open(&self, family: Family) -> io::Result<AsyncICMPSocket> {
        AsyncICMPSocket::new(ICMPSocket::new(family)?)
    }
}

impl Endpoint for AsyncICMPSocket {
    async fn send_to(
        &mut self,
        packet: &[u8],
        dst: &IpAddr,
    ) -> io::Result<usize> {
        AsyncICMPSocket::send_to(self, packet, dst).await
    }

    async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> io::Result<(usize, IpAddr)> {
        AsyncICMPSocket::recv_from(self, buf).await
    }
}

/// Result of a successful request/reply exchange
#[derive(Debug)]
pub struct Exchange {
    /// Time from just before the send until the reply was read
    pub rtt: Duration,
    pub reply: Vec<u8>,
    pub peer: IpAddr,
}

/// A single-use request/reply exchange over a freshly opened endpoint.
pub struct Session<E> {
    endpoint: E,
    family: Family,
    reply_timeout: Duration,
    recv_buffer_len: usize,
}

impl<E: Endpoint> Session<E> {
    pub fn open<C>(
        connector: &C,
        family: Family,
        config: &Config,
    ) -> Result<Self, ProbeError>
    where
        C: Connector<Endpoint = E>,
    {
        let endpoint = connector
            .open(family)
            .map_err(|source| ProbeError::Open { family, source })?;
        debug!(
            %family,
            protocol = family.protocol_number(),
            "opened endpoint"
        );
        Ok(Session {
            endpoint,
            family,
            reply_timeout: config.reply_timeout,
            recv_buffer_len: config.recv_buffer_len,
        })
    }

    /// Send `request` to `destination` and wait for one datagram.
    ///
    /// The session is consumed, so the endpoint is closed on every return
    /// path.
    pub async fn exchange(
        mut self,
        destination: &IpAddr,
        request: &[u8],
    ) -> Result<Exchange, ProbeError> {
        let start = Instant::now();
        let sent = self
            .endpoint
            .send_to(request, destination)
            .await
            .map_err(ProbeError::Send)?;
        if sent != request.len() {
            return Err(ProbeError::ShortWrite {
                got: sent,
                want: request.len(),
            });
        }
        trace!(
            bytes = sent,
            %destination,
            family = %self.family,
            "sent request"
        );

        let mut reply = vec![0u8; self.recv_buffer_len];
        // The deadline starts now, not at `start`
        let read = tokio::time::timeout(
            self.reply_timeout,
            self.endpoint.recv_from(&mut reply),
        )
        .await;
        let (len, peer) = match read {
            Ok(Ok(res)) => res,
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                return Err(ProbeError::Timeout)
            }
            Ok(Err(e)) => return Err(ProbeError::Receive(e)),
            Err(_elapsed) => {
                debug!(timeout = ?self.reply_timeout, "no reply");
                return Err(ProbeError::Timeout);
            }
        };
        let rtt = start.elapsed();
        reply.truncate(len);
        trace!(bytes = len, %peer, ?rtt, "received reply");

        Ok(Exchange { rtt, reply, peer })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use tokio::sync::oneshot;

    use super::*;
    use crate::icmp::reply_to;

    /// What the next opened endpoint does
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Behave like a compliant host answering after the delay
        Echo(Duration),
        /// Answer with these exact bytes
        Answer(Vec<u8>),
        ShortWrite,
        SendFail,
        Silent,
        RecvFail,
        OpenFail,
    }

    #[derive(Debug, Clone)]
    pub struct Sent {
        pub family: Family,
        pub dst: IpAddr,
        pub packet: Vec<u8>,
    }

    /// Hands out scripted endpoints and keeps track of their lifetime.
    #[derive(Default)]
    pub struct MockConnector {
        script: Mutex<VecDeque<Script>>,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
        pub sent: Arc<Mutex<Vec<Sent>>>,
        exhausted: Mutex<Option<oneshot::Sender<()>>>,
    }

    impl MockConnector {
        pub fn new(script: impl IntoIterator<Item = Script>) -> Self {
            MockConnector {
                script: Mutex::new(script.into_iter().collect()),
                ..Default::default()
            }
        }

        /// Fires once an endpoint is requested after the script ran out.
        pub fn on_exhausted(&self) -> oneshot::Receiver<()> {
            let (tx, rx) = oneshot::channel();
            *self.exhausted.lock().unwrap() = Some(tx);
            rx
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Connector for MockConnector {
        type Endpoint = MockEndpoint;

        fn open(&self, family: Family) -> io::Result<MockEndpoint> {
            let script = match self.script.lock().unwrap().pop_front() {
                Some(script) => script,
                None => {
                    if let Some(tx) = self.exhausted.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    Script::Silent
                }
            };
            if let Script::OpenFail = script {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "operation not permitted",
                ));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockEndpoint {
                family,
                script,
                request: Vec::new(),
                peer: None,
                sent: self.sent.clone(),
                closed: self.closed.clone(),
            })
        }
    }

    pub struct MockEndpoint {
        family: Family,
        script: Script,
        request: Vec<u8>,
        peer: Option<IpAddr>,
        sent: Arc<Mutex<Vec<Sent>>>,
        closed: Arc<AtomicUsize>,
    }

    impl Endpoint for MockEndpoint {
        async fn send_to(
            &mut self,
            packet: &[u8],
            dst: &IpAddr,
        ) -> io::Result<usize> {
            self.request = packet.to_vec();
            self.peer = Some(*dst);
            self.sent.lock().unwrap().push(Sent {
                family: self.family,
                dst: *dst,
                packet: packet.to_vec(),
            });
            match self.script {
                Script::ShortWrite => Ok(packet.len() - 1),
                Script::SendFail => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "network is unreachable",
                )),
                _ => Ok(packet.len()),
            }
        }

        async fn recv_from(
            &mut self,
            buf: &mut [u8],
        ) -> io::Result<(usize, IpAddr)> {
            let reply = match &self.script {
                Script::Echo(delay) => {
                    tokio::time::sleep(*delay).await;
                    reply_to(&self.request, self.family)
                }
                Script::Answer(bytes) => bytes.clone(),
                Script::RecvFail => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ))
                }
                _ => std::future::pending().await,
            };
            buf[..reply.len()].copy_from_slice(&reply);
            let peer = self.peer.unwrap_or(self.family.listen_address());
            Ok((reply.len(), peer))
        }
    }

    impl Drop for MockEndpoint {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
