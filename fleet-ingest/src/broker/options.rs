use std::sync::Arc;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration};

use super::SessionError;
use crate::config::{BrokerConfig, Transport};

/// Largest packet accepted or sent; storage reports with many drives exceed rumqttc's default.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Address handed to rumqttc: a bare host for TCP, a full URL for WebSockets.
pub fn broker_address(config: &BrokerConfig) -> String {
    match config.transport {
        Transport::Tcp => config.host.clone(),
        Transport::Websockets => {
            let scheme = if config.tls { "wss" } else { "ws" };
            let path = if config.ws_path.starts_with('/') {
                config.ws_path.clone()
            } else {
                format!("/{}", config.ws_path)
            };
            format!("{scheme}://{}:{}{path}", config.host, config.port)
        }
    }
}

pub fn mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, SessionError> {
    let mut options = MqttOptions::new(&config.client_id, broker_address(config), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(config.clean_session);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    let transport = match (config.transport, config.tls) {
        (Transport::Tcp, false) => rumqttc::Transport::Tcp,
        (Transport::Websockets, false) => rumqttc::Transport::Ws,
        (Transport::Tcp, true) => rumqttc::Transport::Tls(tls_configuration(config)?),
        (Transport::Websockets, true) => rumqttc::Transport::Wss(tls_configuration(config)?),
    };
    options.set_transport(transport);

    Ok(options)
}

fn tls_configuration(config: &BrokerConfig) -> Result<TlsConfiguration, SessionError> {
    Ok(match fleet_tls::client_config(&config.tls_settings())? {
        Some(client) => TlsConfiguration::Rustls(Arc::new(client)),
        None => TlsConfiguration::default(),
    })
}
