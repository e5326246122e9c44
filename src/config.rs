//! Configuration for the echo server.
//!
//! Everything comes from command-line arguments; there is no config file
//! and no persisted state. The only required argument is the TCP port.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "coecho")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded coroutine-driven TCP echo server", long_about = None)]
pub struct Config {
    /// TCP port to listen on
    pub port: u16,

    /// Address to bind to
    #[arg(short = 'l', long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Socket address the listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_argument() {
        let config = Config::try_parse_from(["coecho", "7000"]).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.bind_addr(), "0.0.0.0:7000".parse().unwrap());
    }

    #[test]
    fn test_missing_port_is_usage_error() {
        assert!(Config::try_parse_from(["coecho"]).is_err());
    }

    #[test]
    fn test_invalid_port_is_usage_error() {
        assert!(Config::try_parse_from(["coecho", "not-a-port"]).is_err());
        assert!(Config::try_parse_from(["coecho", "70000"]).is_err());
    }

    #[test]
    fn test_host_override() {
        let config =
            Config::try_parse_from(["coecho", "7000", "--host", "127.0.0.1"]).unwrap();
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
