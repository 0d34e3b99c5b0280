//! Application session: the one gateway connection owned by a running app.
//!
//! Created once onboarding has produced a gateway token and torn down at shutdown. Whatever
//! needs the gateway borrows the connection from here; there is no global instance.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::config::{self, Config};
use crate::gateway::{ClientInfo, ConnectionState, GatewayConnection};

/// Options the host application adds on top of [`Config`].
#[derive(Default)]
pub struct SessionOptions {
    pub client: Option<ClientInfo>,
    pub on_status: Option<Box<dyn Fn(bool) + Send + Sync>>,
    pub on_event: Option<Box<dyn Fn(&str, &Value) + Send + Sync>>,
}

/// Owns the gateway connection for the lifetime of the app.
pub struct CompanionSession {
    connection: GatewayConnection,
}

impl CompanionSession {
    /// Build the connection from config and start connecting. Fails when onboarding has not
    /// produced a gateway token yet.
    pub fn start(config: &Config, options: SessionOptions) -> Result<Self> {
        let Some(token) = config::resolve_gateway_token(config) else {
            bail!(
                "onboarding incomplete: no gateway token (set gateway.auth.token or COMPANION_GATEWAY_TOKEN)"
            );
        };
        let url = config::resolve_gateway_url(config);
        if config.gateway.url.is_none() && !config::is_loopback_bind(&config.gateway.bind) {
            log::warn!("gateway at {} is not loopback; token is sent in clear over ws://", url);
        }

        let mut builder = GatewayConnection::builder(url, token)
            .reconnect(config.client.reconnect.policy())
            .request_timeout(config.client.request_timeout())
            .require_handshake(config.client.require_handshake);
        if let Some(client) = options.client {
            builder = builder.client(client);
        }
        if let Some(on_status) = options.on_status {
            builder = builder.on_status(on_status);
        }
        if let Some(on_event) = options.on_event {
            builder = builder.on_event(on_event);
        }

        let connection = builder.build();
        log::info!("starting gateway session to {}", connection.options().url);
        connection.connect();
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &GatewayConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Disconnect and stop reconnecting.
    pub async fn shutdown(self) {
        self.connection.disconnect().await;
    }
}

impl Drop for CompanionSession {
    /// A session dropped without `shutdown` still stops the connection, even if clones of it
    /// are held elsewhere.
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_requires_token() {
        if std::env::var("COMPANION_GATEWAY_TOKEN").is_ok() {
            return;
        }
        let err = match CompanionSession::start(&Config::default(), SessionOptions::default()) {
            Ok(_) => panic!("expected missing token error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("onboarding incomplete"));
    }

    #[tokio::test]
    async fn start_and_shutdown_without_gateway() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("t".into());
        // Nothing listens on port 1; the session keeps retrying until shut down.
        config.gateway.port = 1;
        config.client.reconnect.initial_delay_ms = 10;
        config.client.reconnect.max_delay_ms = 10;

        let session = CompanionSession::start(&config, SessionOptions::default()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!session.state().is_open());
        let conn = session.connection().clone();
        session.shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dropping_session_stops_reconnecting() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("t".into());
        config.gateway.port = 1;
        config.client.reconnect.initial_delay_ms = 10;
        config.client.reconnect.max_delay_ms = 10;

        let session = CompanionSession::start(&config, SessionOptions::default()).unwrap();
        let conn = session.connection().clone();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        drop(session);

        let mut states = conn.state_changes();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while *states.borrow_and_update() != ConnectionState::Disconnected {
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("connection stops");
        // A live supervisor would cycle through Connecting and Reconnecting every 10ms.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
