use async_trait::async_trait;

use crate::{connection::Connection, error::XmppError};

/// Lifecycle hooks for a protocol extension attached to a [`Connection`].
///
/// On login the connection calls `register_handlers` on every plugin, then
/// awaits each `on_before_online` in registration order before announcing
/// presence. On logout or connection loss it calls `unregister_handlers`
/// followed by `on_offline`. A silent reconnect only unregisters handlers.
#[async_trait]
pub trait PluginLifecycle: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn register_handlers(&self, connection: &Connection);

    fn unregister_handlers(&self, connection: &Connection);

    async fn on_before_online(&self, _connection: &Connection) -> Result<(), XmppError> {
        Ok(())
    }

    async fn on_offline(&self) {}
}
