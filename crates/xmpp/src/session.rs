use std::fmt;
use std::time::Duration;

use tern_core::config::Config;
use tern_core::event::{EventPayload, EventSource};
use tracing::{debug, info, instrument, warn};

use crate::{
    connection::{Connection, SessionTasks, Shared},
    error::{ConnectionError, XmppError},
    jid::Jid,
    transport::ConnectionConfig,
};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Online,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Online)
                | (Connecting, Disconnected)
                | (Online, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials and endpoint for [`Connection::log_in`].
#[derive(Clone, PartialEq, Eq)]
pub struct LogInRequest {
    pub domain: String,
    /// Local part only, without `@domain`.
    pub username: String,
    pub password: String,
    pub service: Option<String>,
    pub resource: Option<String>,
    pub timeout_seconds: u32,
}

impl LogInRequest {
    pub const DEFAULT_TIMEOUT_SECONDS: u32 = 30;

    pub fn new(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
            service: None,
            resource: None,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            username: self.username.clone(),
            domain: self.domain.clone(),
            password: self.password.clone(),
            service: self.service.clone(),
            resource: self.resource.clone(),
            timeout_seconds: self.timeout_seconds,
        }
    }
}

impl fmt::Debug for LogInRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogInRequest")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("service", &self.service)
            .field("resource", &self.resource)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl From<&Config> for LogInRequest {
    fn from(config: &Config) -> Self {
        Self {
            domain: config.account.domain.clone(),
            username: config.account.username.clone(),
            password: config.account.password.clone(),
            service: config.account.service.clone(),
            resource: config.account.resource.clone(),
            timeout_seconds: config.connection.timeout_seconds,
        }
    }
}

impl Connection {
    /// Authenticate, run the plugins' before-online hooks, announce presence
    /// and go online.
    ///
    /// Fails with [`XmppError::AlreadyConnecting`] or
    /// [`XmppError::AlreadyOnline`] unless disconnected. A logout that races
    /// the login makes it fail with [`XmppError::ConnectionLost`].
    #[instrument(skip_all, fields(domain = %request.domain, username = %request.username))]
    pub async fn log_in(&self, request: LogInRequest) -> Result<(), XmppError> {
        if request.username.contains('@') {
            warn!("username contains '@'; expected the local part only");
        }

        let config = request.connection_config();
        let epoch = self.begin_login(request)?;
        info!("logging in");

        let connect = self.transport().connect(&config);
        let connected = tokio::time::timeout(
            Duration::from_secs(u64::from(config.timeout_seconds)),
            connect,
        )
        .await
        .unwrap_or(Err(ConnectionError::Timeout));

        let jid = match connected {
            Ok(jid) => jid,
            Err(error) => {
                warn!(%error, "login failed");
                if self.abandon_login(epoch) {
                    self.emit_event(
                        "system.error.occurred",
                        EventPayload::ErrorOccurred {
                            component: "connection".to_string(),
                            message: error.to_string(),
                            recoverable: error.is_retryable(),
                        },
                    );
                    self.notify_offline().await;
                }
                return Err(error.into());
            }
        };

        if !self.attach_session(epoch, &jid) {
            debug!("login superseded while authenticating");
            if let Err(error) = self.transport().close().await {
                debug!(%error, "closing superseded transport failed");
            }
            return Err(XmppError::ConnectionLost);
        }
        info!(jid = %jid, "authenticated");
        self.emit_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished {
                jid: jid.to_string(),
            },
        );

        self.run_before_online(&jid).await;

        let presence = self.presence(&[]).tree();
        if let Err(error) = self.send(presence).await {
            warn!(%error, "initial presence failed");
            self.handle_transport_failure(
                epoch,
                ConnectionError::TransportError(error.to_string()),
            )
            .await;
            return Err(XmppError::ConnectionLost);
        }

        let online = {
            let shared = self.lock_shared();
            shared.epoch == epoch && self.set_state(ConnectionState::Online)
        };
        if !online {
            return Err(XmppError::ConnectionLost);
        }

        info!(jid = %jid, "online");
        self.emit_event(
            "xmpp.session.online",
            EventPayload::Online {
                jid: jid.to_string(),
            },
        );
        Ok(())
    }

    /// Announce unavailability, end the session and forget the credentials.
    /// Does nothing when already disconnected.
    #[instrument(skip_all)]
    pub async fn log_out(&self) {
        if self.state() == ConnectionState::Disconnected {
            debug!("log_out while disconnected");
            return;
        }

        let unavailable = self.presence(&[("type", "unavailable")]).tree();
        if let Err(error) = self.send(unavailable).await {
            debug!(%error, "could not announce unavailability");
        }

        let (tasks, epoch) = {
            let mut shared = self.lock_shared();
            let tasks = self.teardown_locked(&mut shared, true);
            (tasks, shared.epoch)
        };
        info!("logged out");
        self.stop_session(tasks, epoch).await;
        self.notify_offline().await;
    }

    /// Drop the stream and log in again with the stored credentials.
    ///
    /// Plugins see only `unregister_handlers`, so their state survives; the
    /// normal login sequence then re-registers them.
    #[instrument(skip_all)]
    pub async fn reconnect_silently(&self) -> Result<(), XmppError> {
        let (credentials, tasks, epoch) = {
            let mut shared = self.lock_shared();
            let credentials = shared.credentials.clone().ok_or(XmppError::NotConnected)?;
            let tasks = self.teardown_locked(&mut shared, false);
            (credentials, tasks, shared.epoch)
        };
        info!("reconnecting");
        self.stop_session(tasks, epoch).await;
        for plugin in self.plugins() {
            plugin.unregister_handlers(self);
        }
        self.log_in(credentials).await
    }

    /// Tear down after the transport failed. Stale epochs are ignored.
    pub(crate) async fn handle_transport_failure(&self, epoch: u64, error: ConnectionError) {
        let (tasks, epoch) = {
            let mut shared = self.lock_shared();
            if shared.epoch != epoch {
                debug!(%error, "ignoring failure from a previous session");
                return;
            }
            let tasks = self.teardown_locked(&mut shared, false);
            (tasks, shared.epoch)
        };

        warn!(%error, "connection lost");
        self.emit_event(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason: error.to_string(),
            },
        );
        self.stop_session(tasks, epoch).await;
        self.notify_offline().await;
    }

    fn begin_login(&self, request: LogInRequest) -> Result<u64, XmppError> {
        let mut shared = self.lock_shared();
        match self.state() {
            ConnectionState::Connecting => return Err(XmppError::AlreadyConnecting),
            ConnectionState::Online => return Err(XmppError::AlreadyOnline),
            ConnectionState::Disconnected => {}
        }
        shared.epoch += 1;
        shared.credentials = Some(request);
        self.set_state(ConnectionState::Connecting);
        Ok(shared.epoch)
    }

    fn abandon_login(&self, epoch: u64) -> bool {
        let shared = self.lock_shared();
        shared.epoch == epoch && self.set_state(ConnectionState::Disconnected)
    }

    fn attach_session(&self, epoch: u64, jid: &Jid) -> bool {
        let mut shared = self.lock_shared();
        if shared.epoch != epoch || self.state() != ConnectionState::Connecting {
            return false;
        }
        self.set_user_jid(Some(jid.clone()));
        shared.session = Some(self.spawn_session(epoch));
        true
    }

    async fn run_before_online(&self, jid: &Jid) {
        self.emit_event(
            "xmpp.session.before",
            EventPayload::BeforeOnline {
                jid: jid.to_string(),
            },
        );

        let plugins = self.plugins();
        for plugin in &plugins {
            plugin.register_handlers(self);
        }
        for plugin in &plugins {
            if let Err(error) = plugin.on_before_online(self).await {
                warn!(plugin = plugin.name(), %error, "before-online hook failed");
                self.publish(
                    "plugin.lifecycle.error",
                    EventSource::Plugin(plugin.name().to_string()),
                    EventPayload::PluginError {
                        plugin_id: plugin.name().to_string(),
                        error: error.to_string(),
                    },
                );
            }
        }
    }

    async fn notify_offline(&self) {
        for plugin in self.plugins() {
            plugin.unregister_handlers(self);
            plugin.on_offline().await;
        }
        self.emit_event("xmpp.session.offline", EventPayload::Offline);
    }

    /// Move to `Disconnected`, failing every pending request. Returns the
    /// session tasks for the caller to stop outside the lock.
    fn teardown_locked(&self, shared: &mut Shared, forget_credentials: bool) -> Option<SessionTasks> {
        shared.epoch += 1;
        if forget_credentials {
            shared.credentials = None;
        }
        let pending = shared.pending.len();
        for (_, request) in shared.pending.drain() {
            request.reject(XmppError::ConnectionLost);
        }
        if pending > 0 {
            debug!(pending, "rejected pending requests");
        }
        self.set_state(ConnectionState::Disconnected);
        self.set_user_jid(None);
        shared.session.take()
    }

    async fn stop_session(&self, tasks: Option<SessionTasks>, epoch: u64) {
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        // a newer login owns the transport now
        if self.lock_shared().epoch != epoch {
            return;
        }
        if let Err(error) = self.transport().close().await {
            debug!(%error, "closing transport failed");
        }
    }
}
