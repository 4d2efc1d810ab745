//! Process-wide configuration, loaded from environment variables with
//! sane defaults — same env-var-with-parse-or-default shape the rest of
//! this codebase uses for its other `*Config` structs.

use std::time::Duration;

/// Wire protocol family a listener port decodes frames as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// Ruptela FMB/Pro5 framed-records protocol.
    RuptelaFmbPro5,
    /// Ruptela ECO5 framed-records protocol (same wire format as FMB/Pro5).
    RuptelaEco5,
    /// Jimi / GT06 JM-LL301 framed-command protocol.
    Jimi,
    /// Accept connections and log frame boundaries only; never decode.
    LogOnly,
}

#[derive(Debug, Clone)]
pub struct PortConfig {
    pub port: u16,
    pub family: ProtocolFamily,
    /// Whether positive longitudes on this port should be flipped negative
    /// (western-hemisphere deployment). Required, not inferred — see
    /// spec.md §9(a): this is deployment-specific and must be set explicitly
    /// per port rather than guessed from the payload.
    pub hemisphere_west: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ports: Vec<PortConfig>,
    pub idle_timeout: Duration,
    pub max_connections_per_port: usize,
    pub subscriber_token: String,
    pub admin_bind_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        let hemisphere_west = std::env::var("GATEWAY_HEMISPHERE_WEST")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let mut ports = vec![
            PortConfig {
                port: env_u16("GATEWAY_PORT_RUPTELA_FMB", 6000),
                family: ProtocolFamily::RuptelaFmbPro5,
                hemisphere_west,
            },
            PortConfig {
                port: env_u16("GATEWAY_PORT_RUPTELA_ECO5", 6001),
                family: ProtocolFamily::RuptelaEco5,
                hemisphere_west,
            },
            PortConfig {
                port: env_u16("GATEWAY_PORT_JIMI", 7000),
                family: ProtocolFamily::Jimi,
                hemisphere_west,
            },
        ];

        // Optional bypass port (spec.md §6): accepts connections and logs
        // frame boundaries without attempting protocol decode.
        if let Some(port) = std::env::var("GATEWAY_PORT_LOGONLY")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            ports.push(PortConfig {
                port,
                family: ProtocolFamily::LogOnly,
                hemisphere_west,
            });
        }

        Self {
            ports,
            idle_timeout: Duration::from_secs(env_u64("GATEWAY_IDLE_TIMEOUT_SECS", 300)),
            max_connections_per_port: env_u64("GATEWAY_MAX_CONNECTIONS", 100) as usize,
            subscriber_token: std::env::var("GATEWAY_SUBSCRIBER_TOKEN")
                .unwrap_or_else(|_| "dev-secret".to_string()),
            admin_bind_addr: std::env::var("GATEWAY_ADMIN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
