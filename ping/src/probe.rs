use std::{net::IpAddr, time::Duration};

use common::Family;
use tracing::debug;

use crate::{
    args::Config,
    error::ProbeError,
    icmp::{decode_message, encode_echo_request},
    session::{Connector, Session},
};

/// Result of one probe cycle
#[derive(Debug)]
pub enum ProbeOutcome {
    Success { rtt: Duration },
    Failure(ProbeError),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

/// Sends echo requests to a single target over fresh endpoints.
pub struct Prober<C> {
    connector: C,
    family: Family,
    target: IpAddr,
    config: Config,
}

impl<C: Connector> Prober<C> {
    pub fn new(connector: C, target: IpAddr, config: Config) -> Self {
        let target = Family::normalize(target);
        Prober {
            connector,
            family: Family::of(&target),
            target,
            config,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    #[cfg(test)]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run one echo attempt. Never fails, errors become
    /// [`ProbeOutcome::Failure`].
    pub async fn probe(&self) -> ProbeOutcome {
        match self.try_probe().await {
            Ok(rtt) => ProbeOutcome::Success { rtt },
            Err(e) => {
                debug!(
                    dst = %self.target,
                    timeout = e.is_timeout(),
                    error = %e,
                    "probe failed"
                );
                ProbeOutcome::Failure(e)
            }
        }
    }

    async fn try_probe(&self) -> Result<Duration, ProbeError> {
        let Config {
            identifier,
            sequence,
            strict,
            ..
        } = self.config;
        let request = encode_echo_request(self.family, identifier, sequence)?;
        let session =
            Session::open(&self.connector, self.family, &self.config)?;
        let exchange = session.exchange(&self.target, &request).await?;
        let message = decode_message(&exchange.reply, self.family)?;

        let accepted = if strict {
            message.answers(identifier, sequence)
        } else {
            message.is_echo_reply()
        };
        if !accepted {
            return Err(ProbeError::UnexpectedReply {
                message,
                peer: exchange.peer,
            });
        }
        Ok(exchange.rtt)
    }
}

/// Resolve `host` to the address to probe. IPv4 addresses win over IPv6 ones
/// when a name has both.
pub async fn resolve_target(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(Family::normalize(addr));
    }
    let resolve_err = |reason: String| ProbeError::Resolve {
        host: host.to_owned(),
        reason,
    };
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .map(|addr| Family::normalize(addr.ip()))
        .collect();
    debug!(host, ?addrs, "resolved");

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| resolve_err("no addresses found".to_owned()))
}
