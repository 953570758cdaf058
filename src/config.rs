use std::time::Duration;

use clap::Parser;

/// Configuration for the `lockd` server.
#[derive(Parser, Debug, Clone)]
#[command(name = "lockd")]
#[command(about = "Caching lock server")]
pub struct ServerConfig {
    /// TCP host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "LOCKD_HOST")]
    pub host: String,

    /// TCP port to bind to
    #[arg(long, default_value = "3772", env = "LOCKD_PORT")]
    pub port: u16,

    /// Log filter, in `tracing_subscriber::EnvFilter` syntax
    #[arg(long, default_value = "info", env = "LOCKD_LOG")]
    pub log: String,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Delay schedule for calls that are retried until acknowledged.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub backoff: BackoffConfig,
}
