use std::{io, net::IpAddr};

use thiserror::Error;

use crate::icmp::EchoMessage;

/// Everything that can go wrong while resolving the target or running a
/// single probe. Only `Resolve` is fatal, the rest end up as a lost packet.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("cannot resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("cannot open {family} socket: {source}")]
    Open {
        family: common::Family,
        #[source]
        source: io::Error,
    },

    #[error("send error: {0}")]
    Send(#[source] io::Error),

    #[error("short write: got {got}; want {want}")]
    ShortWrite { got: usize, want: usize },

    #[error("timeout waiting for reply")]
    Timeout,

    #[error("receive error: {0}")]
    Receive(#[source] io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("did not receive echo reply; got {message} from {peer}")]
    UnexpectedReply { message: EchoMessage, peer: IpAddr },
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout)
    }
}
