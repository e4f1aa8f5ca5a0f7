use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::envelope::Envelope;
use crate::core::gate::TypeGate;
use crate::core::wire::Wire;
use crate::error::{ProtocolError, Result};
use crate::protocol::identity::PeerId;
use crate::transport::connection::Connection;

type HandlerFn =
    dyn Fn(&MessageContext, Envelope, &TypeGate) -> Result<Vec<ProtocolError>> + Send + Sync + 'static;
type ConnectionFn = dyn Fn(&Connection) + Send + Sync + 'static;
type ErrorFn = dyn Fn(&Connection, &ProtocolError) + Send + Sync + 'static;

/// Where a received object came from.
#[derive(Debug, Clone)]
pub struct MessageContext {
    connection: Connection,
    sender: Option<PeerId>,
}

impl MessageContext {
    pub fn new(connection: Connection, sender: Option<PeerId>) -> Self {
        Self { connection, sender }
    }

    /// The connection the bytes arrived on. For relayed objects this is
    /// the hub connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Originating peer, when known (direct P2P link or hub relay).
    pub fn sender(&self) -> Option<PeerId> {
        self.sender
    }

    /// Send `object` back on the connection it arrived on.
    pub fn reply<T: Wire>(&self, object: &T) -> Result<()> {
        self.connection.send(object)
    }
}

/// Type-key routing table plus connection lifecycle callbacks.
///
/// Shared by every connection of an endpoint. Handlers run on scheduler
/// workers and must not block.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<Cow<'static, str>, Arc<HandlerFn>>>,
    on_connect: RwLock<Vec<Arc<ConnectionFn>>>,
    on_disconnect: RwLock<Vec<Arc<ConnectionFn>>>,
    on_error: RwLock<Vec<Arc<ErrorFn>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route objects of type `T` to `handler`. Replaces any earlier handler
    /// for the same key.
    pub fn register<T, F>(&self, handler: F)
    where
        T: Wire,
        F: Fn(&MessageContext, T) -> Result<()> + Send + Sync + 'static,
    {
        let erased = move |ctx: &MessageContext, envelope: Envelope, gate: &TypeGate| {
            let (object, field_errors) = envelope.unwrap::<T>(gate)?;
            handler(ctx, object)?;
            Ok(field_errors)
        };
        self.handlers
            .write()
            .insert(Cow::Borrowed(T::TYPE_KEY), Arc::new(erased));
    }

    pub fn unregister(&self, type_key: &str) -> bool {
        self.handlers.write().remove(type_key).is_some()
    }

    pub fn has_handler(&self, type_key: &str) -> bool {
        self.handlers.read().contains_key(type_key)
    }

    /// Gate-check `envelope`, then run its handler.
    ///
    /// Returns the recoverable field errors the decode produced.
    pub fn dispatch(
        &self,
        ctx: &MessageContext,
        envelope: Envelope,
        gate: &TypeGate,
    ) -> Result<Vec<ProtocolError>> {
        gate.check(&envelope.type_key)?;
        let handler = self
            .handlers
            .read()
            .get(envelope.type_key.as_str())
            .cloned()
            .ok_or_else(|| ProtocolError::UnexpectedMessage(envelope.type_key.clone()))?;
        handler(ctx, envelope, gate)
    }

    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_connect.write().push(Arc::new(callback));
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_disconnect.write().push(Arc::new(callback));
    }

    /// Error channel: connection failures, gate rejections, decode and
    /// handler errors.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Connection, &ProtocolError) + Send + Sync + 'static,
    {
        self.on_error.write().push(Arc::new(callback));
    }

    pub(crate) fn notify_connect(&self, conn: &Connection) {
        let callbacks = self.on_connect.read().clone();
        for callback in callbacks {
            callback(conn);
        }
    }

    pub(crate) fn notify_disconnect(&self, conn: &Connection) {
        let callbacks = self.on_disconnect.read().clone();
        for callback in callbacks {
            callback(conn);
        }
    }

    pub(crate) fn notify_error(&self, conn: &Connection, error: &ProtocolError) {
        let callbacks = self.on_error.read().clone();
        for callback in callbacks {
            callback(conn, error);
        }
    }
}
