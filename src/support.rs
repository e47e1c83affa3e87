//! Per-consumer facade onto a shared process variable.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use tokio::sync::oneshot;
use tracing::trace;

use crate::{
    cell::{ValueCell, VersionNumber},
    error::PvError,
    provider::ProviderCore,
    shared::{ConsumerId, NotifyCallback, SharedPv},
    value::{PvValue, ValueType},
};

/// How an operation's completion callback was, or will be, invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The callback has already run, on the calling thread, before returning
    Immediate,
    /// The callback will run later on a worker thread
    Deferred,
}

impl Completion {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Completion::Immediate)
    }
}

/// Snapshot of a variable's bookkeeping, as seen from one facade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvDiagnostics {
    /// Notifications delivered but not yet acknowledged, across all consumers
    pub notification_pending: usize,
    /// Consumers with a registered notify callback
    pub notify_callbacks: usize,
    /// Live facades for this variable
    pub consumers: usize,
    /// Whether the backend is pushing updates for this variable
    pub notifications_active: bool,
    /// Version of the cached value
    pub version: VersionNumber,
}

/// One consumer's handle to a process variable.
///
/// Facades for the same variable share its backend connection and cached value, but
/// each has its own notify subscription. At most one read or write may be in flight
/// per facade at a time; this is not checked. Dropping the facade cancels its
/// subscription and releases any notification it has not acknowledged.
pub struct PvSupport {
    core: Arc<ProviderCore>,
    pv: usize,
    consumer: ConsumerId,
    name: String,
    value_type: ValueType,
    element_count: usize,
    readable: bool,
    writeable: bool,
    blocking: bool,
    notifiable: bool,
}

impl PvSupport {
    pub(crate) fn new(
        core: Arc<ProviderCore>,
        shared: &SharedPv,
        pv: usize,
        consumer: ConsumerId,
    ) -> PvSupport {
        let notifiable = shared.can_notify(core.poll_interval.is_some());
        PvSupport {
            core,
            pv,
            consumer,
            name: shared.name().to_owned(),
            value_type: shared.value_type(),
            element_count: shared.element_count(),
            readable: shared.is_readable(),
            writeable: shared.is_writeable(),
            blocking: shared.is_blocking(),
            notifiable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn can_read(&self) -> bool {
        self.readable
    }

    pub fn can_write(&self) -> bool {
        self.writeable
    }

    pub fn can_notify(&self) -> bool {
        self.notifiable
    }

    /// Read the newest available value.
    ///
    /// `done` receives the value, or the backend's failure. Variables that are
    /// currently delivering notifications answer from their cached value rather than
    /// pulling from the backend.
    pub fn read<F>(&self, done: F) -> Result<Completion, PvError>
    where
        F: FnOnce(Result<ValueCell, PvError>) + Send + 'static,
    {
        if !self.readable {
            return Err(PvError::Unsupported("read"));
        }
        let defer = self.blocking && self.core.pool.has_workers();
        let immediate = self.core.with_registry(|reg| {
            if reg.shutdown {
                return Err(PvError::Unavailable("provider has been shut down"));
            }
            let shared = &mut reg.pvs[self.pv];
            shared.invalidate_initial_value();
            if shared.serves_cached_reads() {
                return Ok(Some(Ok(shared.last_value().clone())));
            }
            if defer {
                return Ok(None);
            }
            Ok(Some(shared.pull()))
        })?;
        if let Some(result) = immediate {
            done(result);
            return Ok(Completion::Immediate);
        }
        let core = self.core.clone();
        let pv = self.pv;
        self.core.pool.submit(move || done(core.pull(pv)))?;
        Ok(Completion::Deferred)
    }

    /// Write a value under a newly created version
    pub fn write<F>(&self, value: impl Into<PvValue>, done: F) -> Result<Completion, PvError>
    where
        F: FnOnce(Result<ValueCell, PvError>) + Send + 'static,
    {
        self.write_versioned(value, VersionNumber::new(), done)
    }

    /// Write a value, tagging it with the given version.
    ///
    /// The value is converted to the variable's type first; values that cannot be
    /// converted, or that have the wrong element count, are rejected before anything
    /// reaches the backend. `done` receives the written value.
    pub fn write_versioned<F>(
        &self,
        value: impl Into<PvValue>,
        version: VersionNumber,
        done: F,
    ) -> Result<Completion, PvError>
    where
        F: FnOnce(Result<ValueCell, PvError>) + Send + 'static,
    {
        if !self.writeable {
            return Err(PvError::NotWritable);
        }
        let value = self.coerce(value.into())?;
        self.core.with_registry(|reg| {
            if reg.shutdown {
                return Err(PvError::Unavailable("provider has been shut down"));
            }
            reg.pvs[self.pv].invalidate_initial_value();
            Ok(())
        })?;
        if self.blocking && self.core.pool.has_workers() {
            let core = self.core.clone();
            let pv = self.pv;
            self.core
                .pool
                .submit(move || done(core.complete_write(pv, value, version)))?;
            return Ok(Completion::Deferred);
        }
        done(self.core.complete_write(self.pv, value, version));
        Ok(Completion::Immediate)
    }

    fn coerce(&self, value: PvValue) -> Result<PvValue, PvError> {
        let value = if value.value_type() == self.value_type {
            value
        } else {
            value.convert_to(self.value_type)?
        };
        if value.len() != self.element_count {
            return Err(PvError::TypeMismatch(format!(
                "{} holds {} elements, got {}",
                self.name,
                self.element_count,
                value.len()
            )));
        }
        Ok(value)
    }

    /// Subscribe to changes of value.
    ///
    /// The first subscription immediately receives the current value. Every
    /// invocation of `callback` must be followed by a call to
    /// [`PvSupport::notify_finished`] before the next one can happen. Subscribing
    /// again replaces the callback.
    pub fn notify<F>(&self, callback: F) -> Result<(), PvError>
    where
        F: Fn(Result<ValueCell, PvError>) + Send + Sync + 'static,
    {
        self.set_notify(Some(Arc::new(callback)))
    }

    /// Replace the notify callback; `None` cancels the subscription
    pub fn set_notify(&self, callback: Option<NotifyCallback>) -> Result<(), PvError> {
        let Some(callback) = callback else {
            self.cancel_notify();
            return Ok(());
        };
        if !self.notifiable {
            return Err(PvError::Unsupported("notify"));
        }
        self.core.subscribe(self.pv, self.consumer, callback)
    }

    /// Stop receiving notifications.
    ///
    /// At most one more notification can still arrive: one whose delivery had
    /// already passed its last check when this was called. Acknowledging it is
    /// harmless while the facade stays unsubscribed. If the facade subscribes again
    /// straight away, that late notification may run next to the new subscription's
    /// initial one, and acknowledging it counts against the new subscription.
    pub fn cancel_notify(&self) {
        trace!("{}: Consumer {} cancelling notifications", self.name, self.consumer);
        self.core.cancel(self.pv, self.consumer);
    }

    /// Acknowledge the last notification, allowing the next one to be delivered
    pub fn notify_finished(&self) {
        self.core.notify_finished(self.pv, self.consumer);
    }

    /// A handle that can acknowledge notifications on behalf of this facade.
    ///
    /// Callbacks should capture this rather than the facade itself.
    pub fn acknowledger(&self) -> NotifyAck {
        NotifyAck {
            core: Arc::downgrade(&self.core),
            pv: self.pv,
            consumer: self.consumer,
        }
    }

    /// The value the variable had when it was opened.
    ///
    /// Fails with [`PvError::Unavailable`] once the variable has been read, written
    /// or subscribed to through any facade.
    pub fn initial_value(&self) -> Result<ValueCell, PvError> {
        self.core.with_registry(|reg| reg.pvs[self.pv].initial_value())
    }

    pub fn diagnostics(&self) -> PvDiagnostics {
        self.core.with_registry(|reg| {
            let shared = &reg.pvs[self.pv];
            PvDiagnostics {
                notification_pending: shared.notification_pending(),
                notify_callbacks: shared.notify_callbacks(),
                consumers: shared.consumer_count(),
                notifications_active: shared.notifications_active,
                version: shared.last_value().version(),
            }
        })
    }

    /// Read, blocking the calling thread until the value is available.
    ///
    /// Must not be called from within an async runtime; use [`PvSupport::read_async`].
    pub fn read_blocking(&self) -> Result<ValueCell, PvError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.read(move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv()
            .map_err(|_| PvError::Unavailable("read was abandoned"))?
    }

    pub fn write_blocking(&self, value: impl Into<PvValue>) -> Result<ValueCell, PvError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.write(value, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv()
            .map_err(|_| PvError::Unavailable("write was abandoned"))?
    }

    pub async fn read_async(&self) -> Result<ValueCell, PvError> {
        let (tx, rx) = oneshot::channel();
        self.read(move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .map_err(|_| PvError::Unavailable("read was abandoned"))?
    }

    pub async fn write_async(&self, value: impl Into<PvValue>) -> Result<ValueCell, PvError> {
        let (tx, rx) = oneshot::channel();
        self.write(value, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .map_err(|_| PvError::Unavailable("write was abandoned"))?
    }
}

impl fmt::Debug for PvSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PvSupport")
            .field("name", &self.name)
            .field("consumer", &self.consumer)
            .field("value_type", &self.value_type)
            .field("element_count", &self.element_count)
            .finish()
    }
}

impl Drop for PvSupport {
    fn drop(&mut self) {
        self.core.unregister(self.pv, self.consumer);
    }
}

/// Acknowledges notifications for a facade without keeping its provider alive
#[derive(Clone)]
pub struct NotifyAck {
    core: Weak<ProviderCore>,
    pv: usize,
    consumer: ConsumerId,
}

impl NotifyAck {
    pub fn notify_finished(&self) {
        if let Some(core) = self.core.upgrade() {
            core.notify_finished(self.pv, self.consumer);
        }
    }
}
