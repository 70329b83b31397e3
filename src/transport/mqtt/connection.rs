//! Connection configuration for the MQTT client
//!
//! Pure functions: broker URL parsing and `MqttOptions` assembly from the
//! static config section plus the per-connect parameters the session hands
//! over.

use crate::config::MqttSection;
use crate::transport::{ConnectParams, LastWill, TransportError};
use rumqttc::v5::mqttbytes::v5::LastWill as MqttLastWill;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Maximum packet size accepted and sent
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state of the underlying MQTT event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No event loop running
    Idle,
    /// Event loop started, waiting for ConnAck
    Connecting,
    /// ConnAck received
    Connected,
    /// Event loop ended with reason
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Broker endpoint parsed from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` URLs
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, TransportError> {
    let invalid = || TransportError::InvalidBrokerUrl(broker_url.to_string());

    let url = Url::parse(broker_url).map_err(|_| invalid())?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(invalid()),
    };
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Translate the session's last will into the protocol type
pub fn to_mqtt_last_will(will: &LastWill) -> MqttLastWill {
    MqttLastWill::new(
        will.topic.clone(),
        will.payload.to_vec(),
        will.qos,
        will.retain,
        None,
    )
}

/// Build options for one connection
pub fn configure_mqtt_options(
    config: &MqttSection,
    params: &ConnectParams,
    credentials: Option<(String, String)>,
) -> Result<MqttOptions, TransportError> {
    let endpoint = parse_broker_url(&config.broker_url)?;

    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_clean_start(params.clean_session);
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(will) = &params.last_will {
        mqtt_options.set_last_will(to_mqtt_last_will(will));
    }

    Ok(mqtt_options)
}

/// Credentials from the environment variables named in the config
pub fn credentials_from_env(config: &MqttSection) -> Option<(String, String)> {
    let username = std::env::var(config.username_env.as_ref()?).ok()?;
    let password = config
        .password_env
        .as_ref()
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_default();
    Some((username, password))
}
