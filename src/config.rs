use crate::error::{Error, Result};
use crate::net::codec::DEFAULT_MAX_FRAME_SIZE;
use serde_derive::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9270;

const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_BUFFER_SIZE: usize = 65536;
const DEFAULT_HIGH_WATERMARK: f64 = 0.8;
const DEFAULT_LOW_WATERMARK: f64 = 0.5;

/// Server-side settings. All durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub password: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ipv6: bool,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub connection_timeout: f64,
    pub auth_timeout: f64,
    pub heartbeat_interval: f64,
    pub heartbeat_timeout: f64,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub handler_threads: usize,
    pub enable_compression: bool,
    pub enable_backpressure: bool,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            password: String::new(),
            name: "conduit-server".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            ipv6: false,
            max_connections: 256,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connection_timeout: 30.0,
            auth_timeout: 10.0,
            heartbeat_interval: 30.0,
            heartbeat_timeout: 90.0,
            send_queue_size: DEFAULT_QUEUE_SIZE,
            receive_queue_size: DEFAULT_QUEUE_SIZE,
            handler_threads: 4,
            enable_compression: true,
            enable_backpressure: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from a TOML file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
        let config: ServerConfig =
            serdeconv::from_toml_file(path).map_err(|e| Error::Config(format!("server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(
            &self.password,
            self.send_queue_size,
            self.receive_queue_size,
            self.buffer_size,
            self.max_frame_size,
            self.high_watermark,
            self.low_watermark,
        )?;

        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".into()));
        }
        if self.handler_threads == 0 {
            return Err(Error::Config("handler_threads must be positive".into()));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port, self.ipv6)
    }

    #[inline]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.auth_timeout)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    #[inline]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout)
    }
}

/// Client-side settings. All durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub password: String,
    pub name: String,
    pub server_host: String,
    pub server_port: u16,
    pub ipv6: bool,
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub connect_timeout: f64,
    pub connection_timeout: f64,
    pub auth_timeout: f64,
    pub heartbeat_interval: f64,
    pub heartbeat_timeout: f64,
    pub rpc_timeout: f64,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub handler_threads: usize,
    pub enable_compression: bool,
    pub enable_backpressure: bool,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub reconnect_enabled: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay: f64,
    pub reconnect_delay_multiplier: f64,
    pub reconnect_delay_max: f64,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            password: String::new(),
            name: "conduit-client".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            ipv6: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: 10.0,
            connection_timeout: 30.0,
            auth_timeout: 10.0,
            heartbeat_interval: 30.0,
            heartbeat_timeout: 90.0,
            rpc_timeout: 30.0,
            send_queue_size: DEFAULT_QUEUE_SIZE,
            receive_queue_size: DEFAULT_QUEUE_SIZE,
            handler_threads: 2,
            enable_compression: true,
            enable_backpressure: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            reconnect_enabled: true,
            reconnect_attempts: 0,
            reconnect_delay: 1.0,
            reconnect_delay_multiplier: 2.0,
            reconnect_delay_max: 60.0,
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from a TOML file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
        let config: ClientConfig =
            serdeconv::from_toml_file(path).map_err(|e| Error::Config(format!("client config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_common(
            &self.password,
            self.send_queue_size,
            self.receive_queue_size,
            self.buffer_size,
            self.max_frame_size,
            self.high_watermark,
            self.low_watermark,
        )?;

        if self.reconnect_delay <= 0.0 || self.reconnect_delay_multiplier < 1.0 {
            return Err(Error::Config("reconnect backoff must grow".into()));
        }
        if self.handler_threads == 0 {
            return Err(Error::Config("handler_threads must be positive".into()));
        }

        Ok(())
    }

    pub fn server_addr(&self) -> Result<SocketAddr> {
        resolve(&self.server_host, self.server_port, self.ipv6)
    }

    /// Backoff delay for the given zero-based attempt number.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let delay = self.reconnect_delay * self.reconnect_delay_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.reconnect_delay_max))
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    #[inline]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.auth_timeout)
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    #[inline]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout)
    }

    #[inline]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rpc_timeout)
    }
}

fn validate_common(
    password: &str,
    send_queue: usize,
    receive_queue: usize,
    buffer_size: usize,
    max_frame_size: usize,
    high: f64,
    low: f64,
) -> Result<()> {
    if password.is_empty() {
        return Err(Error::Config("password is required".into()));
    }
    if send_queue == 0 || receive_queue == 0 {
        return Err(Error::Config("queue sizes must be positive".into()));
    }
    if buffer_size == 0 {
        return Err(Error::Config("buffer_size must be positive".into()));
    }
    if max_frame_size < 1024 {
        return Err(Error::Config("max_frame_size must be at least 1 KiB".into()));
    }
    if !(low > 0.0 && low < high && high <= 1.0) {
        return Err(Error::Config("watermarks must satisfy 0 < low < high <= 1".into()));
    }

    Ok(())
}

fn resolve(host: &str, port: u16, ipv6: bool) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {}:{}: {}", host, port, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == ipv6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("no address for {}:{}", host, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_server() -> ServerConfig {
        ServerConfig {
            password: "hunter2".into(),
            ..ServerConfig::default()
        }
    }

    fn valid_client() -> ClientConfig {
        ClientConfig {
            password: "hunter2".into(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ServerConfig::default();

        assert_eq!(config.auth_timeout, 10.0);
        assert_eq!(config.heartbeat_interval, 30.0);
        assert_eq!(config.heartbeat_timeout, 90.0);
        assert_eq!(config.send_queue_size, 1000);
        assert_eq!(config.receive_queue_size, 1000);
        assert_eq!(config.high_watermark, 0.8);
        assert_eq!(config.low_watermark, 0.5);

        let config = ClientConfig::default();
        assert_eq!(config.rpc_timeout, 30.0);
        assert_eq!(config.reconnect_attempts, 0);
    }

    #[test]
    fn test_missing_password_rejected() {
        assert!(ServerConfig::default().validate().is_err());
        assert!(valid_server().validate().is_ok());
    }

    #[test]
    fn test_watermark_order_enforced() {
        let mut config = valid_server();
        config.high_watermark = 0.4;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addr_resolution() {
        let config = valid_server();
        let addr = config.bind_addr().unwrap();

        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_ipv6_resolution() {
        let mut config = valid_server();
        config.host = "::1".into();
        config.ipv6 = true;

        let addr = config.bind_addr().unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn test_reconnect_backoff_caps() {
        let mut config = valid_client();
        config.reconnect_delay = 1.0;
        config.reconnect_delay_multiplier = 2.0;
        config.reconnect_delay_max = 10.0;

        assert_eq!(config.reconnect_backoff(0), Duration::from_secs_f64(1.0));
        assert_eq!(config.reconnect_backoff(2), Duration::from_secs_f64(4.0));
        assert_eq!(config.reconnect_backoff(10), Duration::from_secs_f64(10.0));
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml = serdeconv::to_toml_string(&valid_server()).unwrap();
        let back: ServerConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(back.password, "hunter2");
        assert_eq!(back.port, DEFAULT_PORT);
    }
}
