//! The provider: composition root owning every shared variable of one backend.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Backend, ReadySignal},
    cell::{ValueCell, VersionNumber},
    dispatch,
    error::PvError,
    pool::WorkerPool,
    shared::{ConsumerId, Delivery, NotifyCallback, SharedPv, transfer_in, transfer_out},
    support::PvSupport,
    timer::TimerQueue,
    utils::{
        get_default_poll_period, get_default_retry_delay, get_default_synchronous,
        get_default_worker_threads,
    },
    value::{PvValue, ValueType},
};

/// Everything guarded by the provider lock
pub(crate) struct Registry {
    pub pvs: Vec<SharedPv>,
    by_name: HashMap<String, usize>,
    /// Push variables ready for their next round, with the signal to wait on
    pub armed_push: BTreeMap<usize, ReadySignal>,
    /// Poll-only variables ready for their next round
    pub armed_polled: BTreeSet<usize>,
    /// Bumped on every change to the armed sets
    pub generation: u64,
    /// Push variables just re-armed, whose ready token may already have been taken
    pub reconsider: VecDeque<usize>,
    pub poll_enabled: bool,
    pub shutdown: bool,
    wake_requested: bool,
}

impl Registry {
    fn new(poll_enabled: bool) -> Self {
        Registry {
            pvs: Vec::new(),
            by_name: HashMap::new(),
            armed_push: BTreeMap::new(),
            armed_polled: BTreeSet::new(),
            generation: 0,
            reconsider: VecDeque::new(),
            poll_enabled,
            shutdown: false,
            wake_requested: false,
        }
    }

    /// Bring the dispatch registration of a variable in line with its state
    pub fn refresh_dispatch(&mut self, pv: usize) {
        let shared = &self.pvs[pv];
        let armed = shared.is_armed(self.poll_enabled);
        let changed = match &shared.ready {
            Some(signal) if armed => {
                let newly_armed = self.armed_push.insert(pv, signal.clone()).is_none();
                if newly_armed {
                    self.reconsider.push_back(pv);
                }
                newly_armed
            }
            Some(_) => self.armed_push.remove(&pv).is_some(),
            None if armed => self.armed_polled.insert(pv),
            None => self.armed_polled.remove(&pv),
        };
        if changed {
            self.generation += 1;
            self.wake_requested = true;
        }
    }

    fn request_wake(&mut self) {
        self.wake_requested = true;
    }
}

/// State shared between the provider handle, its facades and its threads
pub(crate) struct ProviderCore {
    name: String,
    backend: Arc<dyn Backend>,
    state: ReentrantMutex<RefCell<Registry>>,
    pub pool: WorkerPool,
    timer: TimerQueue,
    wakeup: Sender<()>,
    retry_delay: Duration,
    pub poll_interval: Option<Duration>,
}

impl ProviderCore {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` under the provider lock.
    ///
    /// Anything `f` releases from the registry must be returned rather than dropped
    /// inside, because dropping a callback may re-enter the provider.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let guard = self.state.lock();
        let (result, wake) = {
            let mut registry = guard.borrow_mut();
            let result = f(&mut registry);
            (result, mem::take(&mut registry.wake_requested))
        };
        drop(guard);
        if wake {
            // A full channel already holds a pending wake-up
            let _ = self.wakeup.try_send(());
        }
        result
    }

    /// Run a notification round outside the lock
    pub fn deliver(&self, pv: usize, delivery: Delivery) {
        delivery.run(|consumer, epoch| {
            self.with_registry(|reg| !reg.shutdown && reg.pvs[pv].awaits_delivery(consumer, epoch))
        });
    }

    fn open(&self, name: &str) -> Result<(usize, ConsumerId), PvError> {
        let existing = self.with_registry(|reg| {
            if reg.shutdown {
                return Err(PvError::Unavailable("provider has been shut down"));
            }
            Ok(reg
                .by_name
                .get(name)
                .map(|&pv| (pv, reg.pvs[pv].add_consumer())))
        })?;
        if let Some(opened) = existing {
            return Ok(opened);
        }
        // Connecting and the first read happen outside the provider lock
        let shared = SharedPv::open(name, self.backend.open(name)?);
        let (opened, unused) = self.with_registry(move |reg| {
            if reg.shutdown {
                return (
                    Err(PvError::Unavailable("provider has been shut down")),
                    Some(shared),
                );
            }
            if let Some(&pv) = reg.by_name.get(name) {
                // Another consumer opened the same variable meanwhile
                return (Ok((pv, reg.pvs[pv].add_consumer())), Some(shared));
            }
            reg.pvs.push(shared);
            let pv = reg.pvs.len() - 1;
            reg.by_name.insert(name.to_owned(), pv);
            (Ok((pv, reg.pvs[pv].add_consumer())), None)
        });
        if let Some(unused) = unused {
            debug!("{}: Dropping duplicate connection", unused.name());
        }
        opened
    }

    pub fn unregister(&self, pv: usize, consumer: ConsumerId) {
        let slot = self.with_registry(|reg| {
            let slot = reg.pvs[pv].remove_consumer(consumer);
            reg.refresh_dispatch(pv);
            slot
        });
        drop(slot);
    }

    pub fn subscribe(
        self: &Arc<Self>,
        pv: usize,
        consumer: ConsumerId,
        callback: NotifyCallback,
    ) -> Result<(), PvError> {
        let (subscribed, delivery, retry) = self.with_registry(|reg| {
            if reg.shutdown {
                return Err(PvError::Unavailable("provider has been shut down"));
            }
            let poll_enabled = reg.poll_enabled;
            let shared = &mut reg.pvs[pv];
            if !shared.can_notify(poll_enabled) {
                return Err(PvError::Unsupported("notify"));
            }
            shared.invalidate_initial_value();
            let subscribed = shared.subscribe(consumer, callback.clone())?;
            if subscribed.first_for_variable {
                shared.refresh_last_value();
            }
            let mut retry = false;
            if shared.is_push()
                && !shared.notifications_active
                && !shared.activation_pending
                && let Err(e) = shared.activate()
            {
                warn!(
                    "{}: Could not activate notifications, retrying in {:?}: {e}",
                    shared.name(),
                    self.retry_delay
                );
                shared.activation_pending = true;
                retry = true;
            }
            let delivery = if subscribed.first_for_consumer {
                shared.initial_delivery(consumer)
            } else {
                None
            };
            reg.refresh_dispatch(pv);
            Ok((subscribed, delivery, retry))
        })?;
        // Replaced callbacks are released only now that the lock is free
        drop(subscribed);
        drop(callback);
        if retry {
            self.schedule_activation(pv);
        }
        if let Some(delivery) = delivery {
            self.deliver(pv, delivery);
        }
        Ok(())
    }

    pub fn cancel(&self, pv: usize, consumer: ConsumerId) {
        let released = self.with_registry(|reg| {
            let released = reg.pvs[pv].unsubscribe(consumer);
            reg.refresh_dispatch(pv);
            released
        });
        drop(released);
    }

    pub fn notify_finished(&self, pv: usize, consumer: ConsumerId) {
        self.with_registry(|reg| {
            let shared = &mut reg.pvs[pv];
            if !shared.acknowledge(consumer) {
                debug!(
                    "{}: Ignoring notify_finished from consumer {consumer}, nothing outstanding",
                    shared.name()
                );
                return;
            }
            reg.refresh_dispatch(pv);
        });
    }

    /// Blocking pull for a deferred read; the I/O happens outside the provider lock
    pub fn pull(&self, pv: usize) -> Result<ValueCell, PvError> {
        let (io, value_type, count) = self.with_registry(|reg| {
            let shared = &reg.pvs[pv];
            (shared.io.clone(), shared.value_type(), shared.element_count())
        });
        let fetched = transfer_in(&io, value_type, count)?;
        Ok(self.with_registry(|reg| {
            let shared = &mut reg.pvs[pv];
            match fetched {
                Some(cell) => shared.fold(cell),
                None => shared.last_value().clone(),
            }
        }))
    }

    pub fn complete_write(
        &self,
        pv: usize,
        value: PvValue,
        version: VersionNumber,
    ) -> Result<ValueCell, PvError> {
        let io = self.with_registry(|reg| reg.pvs[pv].io.clone());
        let written = transfer_out(&io, value, version)?;
        self.with_registry(|reg| reg.pvs[pv].fold(written.clone()));
        Ok(written)
    }

    fn schedule_activation(self: &Arc<Self>, pv: usize) {
        let core = Arc::downgrade(self);
        let scheduled = self.timer.submit_after(self.retry_delay, move || {
            if let Some(core) = core.upgrade() {
                core.retry_activation(pv);
            }
        });
        if let Err(e) = scheduled {
            debug!("Not retrying notification activation: {e}");
        }
    }

    fn retry_activation(self: &Arc<Self>, pv: usize) {
        let again = self.with_registry(|reg| {
            if reg.shutdown {
                return false;
            }
            let shared = &mut reg.pvs[pv];
            if shared.notify_callbacks() == 0 {
                debug!("{}: No subscribers left, abandoning activation", shared.name());
                shared.activation_pending = false;
                return false;
            }
            match shared.activate() {
                Ok(()) => {
                    info!("{}: Notifications activated after retrying", shared.name());
                    reg.refresh_dispatch(pv);
                    false
                }
                Err(e) => {
                    debug!("{}: Activation still failing: {e}", shared.name());
                    true
                }
            }
        });
        if again {
            self.schedule_activation(pv);
        }
    }
}

/// Configures and starts a [`PvProvider`].
///
/// Unset options take their defaults from the environment, see [`crate::utils`].
pub struct ProviderBuilder {
    backend: Arc<dyn Backend>,
    worker_threads: usize,
    synchronous: bool,
    retry_delay: Duration,
    poll_interval: Option<Duration>,
}

impl ProviderBuilder {
    pub fn new<B: Backend>(backend: B) -> Self {
        ProviderBuilder {
            backend: Arc::new(backend),
            worker_threads: get_default_worker_threads(),
            synchronous: get_default_synchronous(),
            retry_delay: get_default_retry_delay(),
            poll_interval: get_default_poll_period(),
        }
    }
    /// Number of threads running blocking backend I/O
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }
    /// Run every operation inline in the calling thread, without a worker pool
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }
    /// How long to wait before retrying a failed notification activation
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
    /// How often poll-only variables are checked for subscribers. `None` means
    /// poll-only variables cannot be subscribed to.
    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn start(self) -> Result<PvProvider, PvError> {
        let name = self.backend.name().to_owned();
        let pool = if self.synchronous {
            WorkerPool::synchronous()
        } else {
            WorkerPool::new(&name, self.worker_threads)?
        };
        let (wakeup, wakeup_receiver) = crossbeam_channel::bounded(1);
        let core = Arc::new(ProviderCore {
            name: name.clone(),
            backend: self.backend,
            state: ReentrantMutex::new(RefCell::new(Registry::new(
                self.poll_interval.is_some(),
            ))),
            pool,
            timer: TimerQueue::new(),
            wakeup,
            retry_delay: self.retry_delay,
            poll_interval: self.poll_interval,
        });
        let dispatcher = {
            let core = core.clone();
            thread::Builder::new()
                .name(format!("pv-dispatch-{name}"))
                .spawn(move || dispatch::run(core, wakeup_receiver))?
        };
        info!(
            "Started provider '{name}' ({})",
            if self.synchronous {
                "synchronous".to_string()
            } else {
                format!("{} worker threads", self.worker_threads)
            }
        );
        Ok(PvProvider {
            core,
            dispatcher: Some(dispatcher),
        })
    }
}

/// Hands out [`PvSupport`] facades for the variables of one backend.
///
/// Every facade for the same variable name shares one backend connection. The
/// provider runs a dispatch thread delivering notifications, a worker pool for
/// blocking I/O and a timer for retries; all of these stop on
/// [`PvProvider::shutdown`] or when the provider is dropped.
pub struct PvProvider {
    core: Arc<ProviderCore>,
    dispatcher: Option<JoinHandle<()>>,
}

impl PvProvider {
    /// Start a provider with default settings
    pub fn start<B: Backend>(backend: B) -> Result<PvProvider, PvError> {
        ProviderBuilder::new(backend).start()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Create a new consumer facade for the named variable
    pub fn create_pv_support(&self, name: &str) -> Result<PvSupport, PvError> {
        let (pv, consumer) = self.core.open(name)?;
        let support = self
            .core
            .with_registry(|reg| PvSupport::new(self.core.clone(), &reg.pvs[pv], pv, consumer));
        Ok(support)
    }

    /// Create a facade, requiring the variable to hold values of the given type
    pub fn create_pv_support_as(
        &self,
        name: &str,
        value_type: ValueType,
    ) -> Result<PvSupport, PvError> {
        let support = self.create_pv_support(name)?;
        if support.value_type() != value_type {
            return Err(PvError::TypeMismatch(format!(
                "{name} holds {} values, not {value_type}",
                support.value_type()
            )));
        }
        Ok(support)
    }

    pub fn is_shut_down(&self) -> bool {
        self.dispatcher.is_none()
    }

    /// Stop the dispatch loop, worker pool and retry timer, and wait for their threads.
    ///
    /// Existing facades stay valid, but every further operation on them fails with
    /// [`PvError::Unavailable`].
    pub fn shutdown(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        debug!("Shutting down provider '{}'", self.name());
        let released = self.core.with_registry(|reg| {
            reg.shutdown = true;
            reg.request_wake();
            reg.pvs
                .iter_mut()
                .flat_map(|pv| pv.clear_subscriptions())
                .collect::<Vec<_>>()
        });
        if dispatcher.thread().id() != thread::current().id() && dispatcher.join().is_err() {
            error!("Dispatch thread for '{}' panicked", self.name());
        }
        self.core.pool.shutdown();
        self.core.timer.shutdown();
        drop(released);
        info!("Provider '{}' shut down", self.name());
    }
}

impl Drop for PvProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
