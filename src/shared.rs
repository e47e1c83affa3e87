//! State shared by every consumer of one process variable.
//!
//! A [`SharedPv`] owns the single backend connection for its variable, the most
//! recent [`ValueCell`] and the bookkeeping for notification rounds. It is only ever
//! touched while holding the provider lock; backend I/O additionally takes the
//! per-variable `io` mutex, always after the provider lock and never before it.

use std::{
    collections::BTreeMap,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    backend::{ProcessVariable, ReadySignal},
    cell::{ValueCell, VersionNumber},
    error::PvError,
    value::{PvValue, ValueType},
};

/// Identifies one consumer facade within its variable
pub(crate) type ConsumerId = u64;

/// Callback invoked with each change of value a consumer has subscribed to.
///
/// Every invocation must be acknowledged with
/// [`PvSupport::notify_finished`](crate::PvSupport::notify_finished) before the
/// variable delivers anything further.
pub type NotifyCallback = Arc<dyn Fn(Result<ValueCell, PvError>) + Send + Sync>;

/// Connection to the backend, serialising all I/O on one variable
pub(crate) type SharedIo = Arc<Mutex<Box<dyn ProcessVariable>>>;

#[derive(Default)]
pub(crate) struct ConsumerSlot {
    callback: Option<NotifyCallback>,
    /// Holds a notification credit that has not been acknowledged yet
    outstanding: bool,
    /// Changes whenever the subscription is cancelled, so that deliveries started
    /// for an earlier subscription can be recognised
    epoch: u64,
    /// Newest version handed to this consumer
    delivered: VersionNumber,
}

/// Outcome of registering a notify callback
pub(crate) struct Subscribed {
    /// The callback that was replaced, to be dropped outside the provider lock
    pub replaced: Option<NotifyCallback>,
    /// The consumer had no callback before this registration
    pub first_for_consumer: bool,
    /// No consumer of the variable had a callback before this registration
    pub first_for_variable: bool,
}

pub(crate) struct SharedPv {
    name: String,
    pub io: SharedIo,
    value_type: ValueType,
    element_count: usize,
    readable: bool,
    writeable: bool,
    blocking: bool,
    /// Present for push-capable variables
    pub ready: Option<ReadySignal>,
    last_value: ValueCell,
    notification_pending: usize,
    notify_callbacks: usize,
    consumers: BTreeMap<ConsumerId, ConsumerSlot>,
    next_consumer: ConsumerId,
    next_epoch: u64,
    initial_value_valid: bool,
    pub notifications_active: bool,
    pub activation_pending: bool,
}

impl SharedPv {
    /// Take ownership of a freshly opened backend connection
    pub fn open(name: &str, mut io: Box<dyn ProcessVariable>) -> SharedPv {
        let readable = io.is_readable();
        if readable && let Err(e) = io.read_latest() {
            warn!("{name}: Initial read failed, starting from the open-time value: {e}");
        }
        let last_value = ValueCell::new(io.buffer().clone(), io.version());
        debug!(
            "{name}: Opened {} x{} ({}{}{})",
            io.value_type(),
            io.element_count(),
            if readable { "r" } else { "" },
            if io.is_writeable() { "w" } else { "" },
            if io.ready_signal().is_some() { ", push" } else { "" },
        );
        SharedPv {
            name: name.to_owned(),
            value_type: io.value_type(),
            element_count: io.element_count(),
            readable,
            writeable: io.is_writeable(),
            blocking: io.is_blocking(),
            ready: io.ready_signal(),
            io: Arc::new(Mutex::new(io)),
            last_value,
            notification_pending: 0,
            notify_callbacks: 0,
            consumers: BTreeMap::new(),
            next_consumer: 1,
            next_epoch: 1,
            initial_value_valid: true,
            notifications_active: false,
            activation_pending: false,
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

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_push(&self) -> bool {
        self.ready.is_some()
    }

    pub fn can_notify(&self, poll_enabled: bool) -> bool {
        self.readable && (self.is_push() || poll_enabled)
    }

    pub fn last_value(&self) -> &ValueCell {
        &self.last_value
    }

    pub fn notification_pending(&self) -> usize {
        self.notification_pending
    }

    pub fn notify_callbacks(&self) -> usize {
        self.notify_callbacks
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// The open-time value, as long as nothing has read, written or subscribed yet
    pub fn initial_value(&self) -> Result<ValueCell, PvError> {
        if self.initial_value_valid {
            Ok(self.last_value.clone())
        } else {
            Err(PvError::Unavailable("initial value has already been superseded"))
        }
    }

    pub fn invalidate_initial_value(&mut self) {
        self.initial_value_valid = false;
    }

    /// Whether a new notification round may be started for this variable
    pub fn is_armed(&self, poll_enabled: bool) -> bool {
        if self.notify_callbacks == 0 || self.notification_pending > 0 {
            return false;
        }
        if self.is_push() {
            self.notifications_active
        } else {
            self.readable && poll_enabled
        }
    }

    /// Whether a read must be answered from the cache instead of the backend.
    ///
    /// Pushed values are only consumed by notification rounds while anyone is
    /// subscribed, and nothing is pulled while a round is still being delivered.
    pub fn serves_cached_reads(&self) -> bool {
        self.notification_pending > 0
            || (self.is_push() && self.notifications_active && self.notify_callbacks > 0)
    }

    /// Merge a newly transferred value, never letting `last_value` go backwards.
    ///
    /// Returns whichever cell is now current.
    pub fn fold(&mut self, cell: ValueCell) -> ValueCell {
        if cell.version() >= self.last_value.version() {
            self.last_value = cell;
        } else {
            trace!(
                "{}: Ignoring value older than the cached one ({:?} < {:?})",
                self.name,
                cell.version(),
                self.last_value.version()
            );
        }
        self.last_value.clone()
    }

    /// Pull the newest value from the backend into `last_value`, and return it
    pub fn pull(&mut self) -> Result<ValueCell, PvError> {
        match transfer_in(&self.io, self.value_type, self.element_count)? {
            Some(cell) => Ok(self.fold(cell)),
            None => Ok(self.last_value.clone()),
        }
    }

    /// Bring `last_value` up to date for a new subscriber, if that can be done quickly
    pub fn refresh_last_value(&mut self) {
        if self.blocking || !self.readable {
            return;
        }
        if let Err(e) = self.pull() {
            warn!("{}: Failed to refresh value for subscriber: {e}", self.name);
        }
    }

    /// Ask the backend to start pushing updates
    pub fn activate(&mut self) -> Result<(), PvError> {
        self.io.lock().activate_notifications()?;
        debug!("{}: Notifications active", self.name);
        self.notifications_active = true;
        self.activation_pending = false;
        Ok(())
    }

    pub fn add_consumer(&mut self) -> ConsumerId {
        let id = self.next_consumer;
        self.next_consumer += 1;
        self.consumers.insert(id, ConsumerSlot::default());
        trace!("{}: Added consumer {id}", self.name);
        id
    }

    /// Unregister a consumer, releasing its credit and its callback.
    ///
    /// The slot is handed back so it can be dropped outside the provider lock.
    pub fn remove_consumer(&mut self, id: ConsumerId) -> Option<ConsumerSlot> {
        let slot = self.consumers.remove(&id)?;
        if slot.outstanding {
            debug!("{}: Consumer {id} removed with a notification outstanding", self.name);
            self.notification_pending -= 1;
        }
        if slot.callback.is_some() {
            self.notify_callbacks -= 1;
        }
        Some(slot)
    }

    pub fn subscribe(
        &mut self,
        id: ConsumerId,
        callback: NotifyCallback,
    ) -> Result<Subscribed, PvError> {
        let first_for_variable = self.notify_callbacks == 0;
        let slot = self
            .consumers
            .get_mut(&id)
            .ok_or(PvError::Unavailable("consumer is no longer registered"))?;
        let replaced = slot.callback.replace(callback);
        let first_for_consumer = replaced.is_none();
        if first_for_consumer {
            self.notify_callbacks += 1;
        }
        Ok(Subscribed {
            replaced,
            first_for_consumer,
            first_for_variable: first_for_variable && first_for_consumer,
        })
    }

    /// Drop a consumer's callback, releasing any credit it holds
    pub fn unsubscribe(&mut self, id: ConsumerId) -> Option<NotifyCallback> {
        let slot = self.consumers.get_mut(&id)?;
        let callback = slot.callback.take()?;
        self.notify_callbacks -= 1;
        slot.epoch = self.next_epoch;
        self.next_epoch += 1;
        if mem::take(&mut slot.outstanding) {
            trace!("{}: Consumer {id} cancelled with a notification outstanding", self.name);
            self.notification_pending -= 1;
        }
        Some(callback)
    }

    /// Release the credit held by a consumer; `false` if it held none
    pub fn acknowledge(&mut self, id: ConsumerId) -> bool {
        match self.consumers.get_mut(&id) {
            Some(slot) if slot.outstanding => {
                slot.outstanding = false;
                self.notification_pending -= 1;
                true
            }
            _ => false,
        }
    }

    /// Whether a delivery started for `epoch` should still reach this consumer
    pub fn awaits_delivery(&self, id: ConsumerId, epoch: u64) -> bool {
        self.consumers
            .get(&id)
            .is_some_and(|slot| slot.outstanding && slot.epoch == epoch && slot.callback.is_some())
    }

    /// Drop every subscription, returning the callbacks to be released by the caller
    pub fn clear_subscriptions(&mut self) -> Vec<NotifyCallback> {
        let mut released = Vec::new();
        for slot in self.consumers.values_mut() {
            slot.outstanding = false;
            slot.epoch = self.next_epoch;
            released.extend(slot.callback.take());
        }
        self.next_epoch += 1;
        self.notification_pending = 0;
        self.notify_callbacks = 0;
        released
    }

    /// The immediate delivery of the current value to a new subscriber
    pub fn initial_delivery(&mut self, id: ConsumerId) -> Option<Delivery> {
        let value = self.last_value.clone();
        let slot = self.consumers.get_mut(&id)?;
        let callback = slot.callback.clone()?;
        slot.outstanding = true;
        slot.delivered = slot.delivered.max(value.version());
        self.notification_pending += 1;
        Some(Delivery {
            name: self.name.clone(),
            result: Ok(value),
            targets: vec![(id, slot.epoch, callback)],
        })
    }

    /// Start a notification round if the backend has something new.
    ///
    /// Must only be called while no earlier round is pending. Queued push values
    /// that every subscriber has already seen are skipped.
    pub fn do_notify(&mut self) -> Option<Delivery> {
        assert_eq!(
            self.notification_pending, 0,
            "{}: Notification round started while one is still pending",
            self.name
        );
        loop {
            let fetched = fetch_update(&self.io, self.is_push(), self.value_type, self.element_count);
            let exhausted = !self.is_push() || !matches!(fetched, Ok(Some(_)));
            if let Some(delivery) = self.start_round(fetched) {
                return Some(delivery);
            }
            if exhausted {
                return None;
            }
        }
    }

    /// Start a round from a value polled without holding the provider lock.
    ///
    /// If the variable stopped being armed meanwhile the value is only cached.
    pub fn complete_poll(
        &mut self,
        fetched: Result<Option<ValueCell>, PvError>,
        armed: bool,
    ) -> Option<Delivery> {
        if !armed {
            if let Ok(Some(cell)) = fetched {
                self.fold(cell);
            }
            return None;
        }
        self.start_round(fetched)
    }

    /// Fold a fetched value and hand it to every subscriber that has not seen it
    fn start_round(&mut self, fetched: Result<Option<ValueCell>, PvError>) -> Option<Delivery> {
        let result = match fetched {
            Ok(Some(cell)) => Ok(self.fold(cell)),
            Ok(None) => return None,
            Err(e) => {
                warn!("{}: Backend failed to provide an update: {e}", self.name);
                Err(e)
            }
        };
        let version = result.as_ref().ok().map(ValueCell::version);
        let mut targets = Vec::with_capacity(self.notify_callbacks);
        for (id, slot) in self.consumers.iter_mut() {
            let Some(callback) = &slot.callback else {
                continue;
            };
            if let Some(version) = version {
                if version <= slot.delivered {
                    continue;
                }
                slot.delivered = version;
            }
            slot.outstanding = true;
            targets.push((*id, slot.epoch, callback.clone()));
        }
        if targets.is_empty() {
            trace!("{}: Nothing new for any subscriber", self.name);
            return None;
        }
        self.notification_pending += targets.len();
        trace!("{}: Notifying {} consumers", self.name, targets.len());
        Some(Delivery {
            name: self.name.clone(),
            result,
            targets,
        })
    }
}

/// A notification round, run once the provider lock has been released
#[must_use]
pub(crate) struct Delivery {
    name: String,
    result: Result<ValueCell, PvError>,
    targets: Vec<(ConsumerId, u64, NotifyCallback)>,
}

impl Delivery {
    /// Invoke every target callback for which `still_wanted` holds at the time
    pub fn run(self, still_wanted: impl Fn(ConsumerId, u64) -> bool) {
        for (id, epoch, callback) in self.targets {
            if !still_wanted(id, epoch) {
                trace!("{}: Skipping delivery to cancelled consumer {id}", self.name);
                continue;
            }
            let result = self.result.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                error!("{}: Notify callback for consumer {id} panicked", self.name);
            }
        }
    }
}

/// Swap the backend buffer out into a new cell, leaving a zeroed buffer behind
fn take_buffer(io: &mut dyn ProcessVariable, value_type: ValueType, count: usize) -> ValueCell {
    let value = mem::replace(io.buffer_mut(), PvValue::zeroed(value_type, count));
    ValueCell::new(value, io.version())
}

/// Fetch the next value for a notification round.
///
/// Push variables hand over their next queued value; poll-only variables are read.
pub(crate) fn fetch_update(
    io: &Mutex<Box<dyn ProcessVariable>>,
    push: bool,
    value_type: ValueType,
    count: usize,
) -> Result<Option<ValueCell>, PvError> {
    if !push {
        return transfer_in(io, value_type, count);
    }
    let mut io = io.lock();
    if !io.read_non_blocking()? {
        return Ok(None);
    }
    Ok(Some(take_buffer(&mut **io, value_type, count)))
}

/// Pull the newest value from the backend; `None` if nothing newer was available
pub(crate) fn transfer_in(
    io: &Mutex<Box<dyn ProcessVariable>>,
    value_type: ValueType,
    count: usize,
) -> Result<Option<ValueCell>, PvError> {
    let mut io = io.lock();
    if !io.read_latest()? {
        return Ok(None);
    }
    Ok(Some(take_buffer(&mut **io, value_type, count)))
}

/// Write `value` by swapping it into the backend buffer and back out again
pub(crate) fn transfer_out(
    io: &Mutex<Box<dyn ProcessVariable>>,
    value: PvValue,
    version: VersionNumber,
) -> Result<ValueCell, PvError> {
    let mut io = io.lock();
    let previous = mem::replace(io.buffer_mut(), value);
    let outcome = io.write(version);
    let written = mem::replace(io.buffer_mut(), previous);
    outcome.map(|_| ValueCell::new(written, version))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::backend::{Access, Backend, IntercomBackend, RegisterDevice};

    fn recording_callback() -> (NotifyCallback, crossbeam_channel::Receiver<ValueCell>) {
        let (tx, rx) = unbounded();
        let callback: NotifyCallback = Arc::new(move |result: Result<ValueCell, PvError>| {
            tx.send(result.unwrap()).unwrap();
        });
        (callback, rx)
    }

    fn intercom_pv() -> (SharedPv, crate::backend::intercom::Intercom<i32>) {
        let backend = IntercomBackend::new("test");
        let value = backend.add_pv("COUNT", 0i32).unwrap();
        let mut shared = SharedPv::open("COUNT", backend.open("COUNT").unwrap());
        shared.activate().unwrap();
        (shared, value)
    }

    #[test]
    fn single_notification_in_flight_per_consumer() {
        let (mut shared, value) = intercom_pv();
        let id = shared.add_consumer();
        let (callback, seen) = recording_callback();
        assert!(shared.subscribe(id, callback).unwrap().first_for_consumer);
        shared.initial_delivery(id).unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().value(), &PvValue::Int32(vec![0]));
        assert!(!shared.is_armed(false));

        value.store(1).unwrap();
        value.store(2).unwrap();
        assert!(shared.acknowledge(id));
        assert!(shared.is_armed(false));
        shared.do_notify().unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().value(), &PvValue::Int32(vec![1]));
        // Until acknowledged, no new round may start
        assert!(!shared.is_armed(false));
        assert!(seen.try_recv().is_err());
        assert!(shared.acknowledge(id));
        assert!(!shared.acknowledge(id));
        shared.do_notify().unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().value(), &PvValue::Int32(vec![2]));
    }

    #[test]
    #[should_panic(expected = "still pending")]
    fn notify_round_requires_no_pending_credit() {
        let (mut shared, _value) = intercom_pv();
        let id = shared.add_consumer();
        let (callback, _seen) = recording_callback();
        shared.subscribe(id, callback).unwrap();
        let _delivery = shared.initial_delivery(id);
        let _ = shared.do_notify();
    }

    #[test]
    fn pending_count_matches_outstanding_consumers() {
        let (mut shared, value) = intercom_pv();
        let ids: Vec<_> = (0..3).map(|_| shared.add_consumer()).collect();
        let count = Arc::new(AtomicUsize::new(0));
        for id in &ids[..2] {
            let count = count.clone();
            shared
                .subscribe(
                    *id,
                    Arc::new(move |_: Result<ValueCell, PvError>| {
                        count.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        value.store(7).unwrap();
        let delivery = shared.do_notify().unwrap();
        assert_eq!(delivery.targets.len(), 2);
        assert_eq!(shared.notification_pending(), 2);
        delivery.run(|_, _| true);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // Removing a consumer with an outstanding credit releases it
        assert!(shared.remove_consumer(ids[0]).is_some());
        assert_eq!(shared.notification_pending(), 1);
        assert_eq!(shared.notify_callbacks(), 1);
        // Consumers that never subscribed hold nothing
        assert!(!shared.acknowledge(ids[2]));
        assert!(shared.acknowledge(ids[1]));
        assert_eq!(shared.notification_pending(), 0);
    }

    #[test]
    fn cancelled_deliveries_are_skipped() {
        let (mut shared, value) = intercom_pv();
        let id = shared.add_consumer();
        let (callback, seen) = recording_callback();
        shared.subscribe(id, callback).unwrap();
        value.store(3).unwrap();
        let delivery = shared.do_notify().unwrap();
        let (_, epoch, _) = &delivery.targets[0];
        let epoch = *epoch;
        assert!(shared.unsubscribe(id).is_some());
        assert_eq!(shared.notification_pending(), 0);
        assert!(!shared.awaits_delivery(id, epoch));
        delivery.run(|id, epoch| shared.awaits_delivery(id, epoch));
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn queued_values_never_repeat_a_version() {
        let (mut shared, value) = intercom_pv();
        let id = shared.add_consumer();
        let (callback, seen) = recording_callback();
        shared.subscribe(id, callback).unwrap();
        shared.initial_delivery(id).unwrap().run(|_, _| true);
        let initial = seen.try_recv().unwrap().version();

        // While the credit is held, the application stores and a consumer writes
        value.store(1).unwrap();
        let written =
            transfer_out(&shared.io, PvValue::Int32(vec![2]), VersionNumber::new()).unwrap();
        let version = written.version();
        shared.fold(written);
        assert!(shared.acknowledge(id));

        // The older stored value is superseded by the write
        shared.do_notify().unwrap().run(|_, _| true);
        let cell = seen.try_recv().unwrap();
        assert!(cell.version() > initial);
        assert_eq!(cell.version(), version);
        assert_eq!(cell.value(), &PvValue::Int32(vec![2]));
        assert!(shared.acknowledge(id));

        // The echo of the write has nothing new to say
        assert!(shared.do_notify().is_none());
        assert!(seen.try_recv().is_err());
        assert!(shared.is_armed(false));

        value.store(3).unwrap();
        shared.do_notify().unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().value(), &PvValue::Int32(vec![3]));
    }

    #[test]
    fn late_subscribers_do_not_hide_values_from_others() {
        let (mut shared, _value) = intercom_pv();
        let first = shared.add_consumer();
        let (callback, seen) = recording_callback();
        shared.subscribe(first, callback).unwrap();
        shared.initial_delivery(first).unwrap().run(|_, _| true);
        seen.try_recv().unwrap();
        assert!(shared.acknowledge(first));

        let written =
            transfer_out(&shared.io, PvValue::Int32(vec![8]), VersionNumber::new()).unwrap();
        let version = written.version();
        shared.fold(written);
        // A newcomer is handed the written value straight away
        let second = shared.add_consumer();
        let (callback, late_seen) = recording_callback();
        shared.subscribe(second, callback).unwrap();
        shared.initial_delivery(second).unwrap().run(|_, _| true);
        assert_eq!(late_seen.try_recv().unwrap().version(), version);
        assert!(shared.acknowledge(second));

        // The echo of the write still reaches the first subscriber, and only them
        let delivery = shared.do_notify().unwrap();
        assert_eq!(delivery.targets.len(), 1);
        assert_eq!(shared.notification_pending(), 1);
        delivery.run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().version(), version);
        assert!(late_seen.try_recv().is_err());
    }

    #[test]
    fn unarmed_poll_results_are_only_cached() {
        let device = RegisterDevice::new("dev");
        device.add_register("TEMP", 20.0f64, Access::Read).unwrap();
        let mut shared = SharedPv::open("TEMP", device.open("TEMP").unwrap());
        let id = shared.add_consumer();
        let (callback, seen) = recording_callback();
        shared.subscribe(id, callback).unwrap();
        shared.initial_delivery(id).unwrap().run(|_, _| true);
        seen.try_recv().unwrap();
        assert!(shared.acknowledge(id));

        let version = device.poke("TEMP", 22.0f64).unwrap();
        let fetched = transfer_in(&shared.io, ValueType::Float64, 1);
        assert!(shared.complete_poll(fetched, false).is_none());
        assert_eq!(shared.last_value().version(), version);
        assert_eq!(shared.notification_pending(), 0);

        // Nothing was delivered, so the next poll still hands the value out
        let fetched = transfer_in(&shared.io, ValueType::Float64, 1);
        shared.complete_poll(fetched, true).unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().version(), version);
        assert!(shared.acknowledge(id));
        let fetched = transfer_in(&shared.io, ValueType::Float64, 1);
        assert!(shared.complete_poll(fetched, true).is_none());
    }

    #[test]
    fn cached_value_never_goes_backwards() {
        let (mut shared, _value) = intercom_pv();
        let older = VersionNumber::new();
        let newer = VersionNumber::new();
        shared.fold(ValueCell::new(PvValue::Int32(vec![5]), newer));
        let current = shared.fold(ValueCell::new(PvValue::Int32(vec![4]), older));
        assert_eq!(current.version(), newer);
        assert_eq!(current.value(), &PvValue::Int32(vec![5]));
    }

    #[test]
    fn polled_rounds_only_deliver_new_versions() {
        let device = RegisterDevice::new("dev");
        device.add_register("TEMP", 20.0f64, Access::Read).unwrap();
        let mut shared = SharedPv::open("TEMP", device.open("TEMP").unwrap());
        assert!(!shared.is_push());
        assert!(shared.can_notify(true));
        assert!(!shared.can_notify(false));

        let id = shared.add_consumer();
        let (callback, seen) = recording_callback();
        shared.subscribe(id, callback).unwrap();
        shared.initial_delivery(id).unwrap().run(|_, _| true);
        seen.try_recv().unwrap();
        shared.acknowledge(id);
        assert!(shared.is_armed(true));
        assert!(shared.do_notify().is_none());

        device.poke("TEMP", 21.5f64).unwrap();
        shared.do_notify().unwrap().run(|_, _| true);
        assert_eq!(seen.try_recv().unwrap().value(), &PvValue::Float64(vec![21.5]));
    }

    #[test]
    fn transfers_swap_buffers() {
        let (shared, value) = intercom_pv();
        let version = VersionNumber::new();
        let cell = transfer_out(&shared.io, PvValue::Int32(vec![42]), version).unwrap();
        assert_eq!(cell.version(), version);
        assert_eq!(value.load(), 42);
        // The written value was echoed to our own, activated, queue
        let cell = transfer_in(&shared.io, ValueType::Int32, 1).unwrap().unwrap();
        assert_eq!(cell.value(), &PvValue::Int32(vec![42]));
        assert!(transfer_in(&shared.io, ValueType::Int32, 1).unwrap().is_none());
    }
}
