use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Opts {
    /// Hostname or IP address to ping
    pub target: Option<String>,
    /// Only accept replies carrying our identifier and sequence number
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub strict: bool,
    /// Log more to stderr (-v info, -vv debug, -vvv trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime settings, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Echo identifier, the process id masked to 16 bits
    pub identifier: u16,
    /// Echo sequence number. Never incremented between probes.
    pub sequence: u16,
    /// How long to wait for a reply after sending
    pub reply_timeout: Duration,
    /// Pause between two probes
    pub interval: Duration,
    pub recv_buffer_len: usize,
    /// Check identifier and sequence of replies, not just their type
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identifier: (std::process::id() & 0xffff) as u16,
            sequence: 1,
            reply_timeout: Duration::from_millis(100),
            interval: Duration::from_millis(500),
            recv_buffer_len: 1500,
            strict: false,
        }
    }
}

impl From<&Opts> for Config {
    fn from(opts: &Opts) -> Self {
        Config {
            strict: opts.strict,
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_target() {
        let opts = Opts::try_parse_from(["ping", "example.com"]).unwrap();
        assert_eq!(opts.target.as_deref(), Some("example.com"));
        assert!(!opts.strict);
        assert_eq!(opts.verbose, 0);
    }

    #[test]
    fn missing_target_is_not_a_parse_error() {
        let opts = Opts::try_parse_from(["ping"]).unwrap();
        assert!(opts.target.is_none());
    }

    #[test]
    fn flags() {
        let opts =
            Opts::try_parse_from(["ping", "-vv", "--strict", "::1"]).unwrap();
        assert_eq!(opts.verbose, 2);
        let config = Config::from(&opts);
        assert!(config.strict);
        assert_eq!(config.sequence, 1);
        assert_eq!(config.reply_timeout, Duration::from_millis(100));
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.recv_buffer_len, 1500);
        assert_eq!(
            config.identifier,
            (std::process::id() & 0xffff) as u16
        );
    }

    #[test]
    fn extra_positional_rejected() {
        assert!(Opts::try_parse_from(["ping", "a", "b"]).is_err());
    }
}
