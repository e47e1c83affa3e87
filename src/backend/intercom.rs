use std::{
    collections::{HashMap, VecDeque},
    marker::PhantomData,
    sync::{Arc, Weak},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    backend::{Access, Backend, PVAlreadyExists, ProcessVariable, ReadySignal},
    cell::VersionNumber,
    error::PvError,
    value::PvValue,
};

/// Updates each open connection buffers before discarding the oldest
const DEFAULT_QUEUE_LENGTH: usize = 3;

/// Pushed updates waiting to be read by one connection
#[derive(Debug)]
struct UpdateQueue {
    items: Mutex<VecDeque<(PvValue, VersionNumber)>>,
    capacity: usize,
    signal: Sender<()>,
}

impl UpdateQueue {
    fn new(capacity: usize) -> (Arc<UpdateQueue>, Receiver<()>) {
        let (signal, ready) = crossbeam_channel::bounded(1);
        (
            Arc::new(UpdateQueue {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                signal,
            }),
            ready,
        )
    }

    fn push(&self, value: PvValue, version: VersionNumber) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                trace!("Update queue full, discarding oldest entry");
                items.pop_front();
            }
            items.push_back((value, version));
        }
        // A full signal channel already means "look at me"
        let _ = self.signal.try_send(());
    }

    fn pop(&self) -> Option<(PvValue, VersionNumber)> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if !items.is_empty() {
            let _ = self.signal.try_send(());
        }
        item
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}

#[derive(Debug)]
struct PV {
    name: String,
    value: PvValue,
    /// Version of the last store, from either side
    version: VersionNumber,
    access: Access,
    /// Update queues of the connections that have activated notifications
    listeners: Vec<Weak<UpdateQueue>>,
    /// Channel to send values written by consumers to the application
    sender: broadcast::Sender<PvValue>,
}

impl PV {
    fn new(name: &str, value: PvValue, access: Access) -> Self {
        PV {
            name: name.to_owned(),
            value,
            version: VersionNumber::new(),
            access,
            listeners: Vec::new(),
            sender: broadcast::Sender::new(16),
        }
    }

    /// Replace the value and queue it on every listening connection
    fn publish(&mut self, value: PvValue, version: VersionNumber) {
        self.value = value;
        self.version = version;
        // Drop the queues of connections that have since closed
        self.listeners.retain(|queue| queue.strong_count() > 0);
        for queue in self.listeners.iter().filter_map(Weak::upgrade) {
            queue.push(self.value.clone(), version);
        }
    }

    /// Store a value from the application side
    fn store(&mut self, value: &PvValue) -> Result<VersionNumber, PvError> {
        let value = value.convert_to(self.value.value_type())?;
        if value.len() != self.value.len() {
            return Err(PvError::TypeMismatch(format!(
                "{} holds {} elements, got {}",
                self.name,
                self.value.len(),
                value.len()
            )));
        }
        let version = VersionNumber::new();
        self.publish(value, version);
        Ok(version)
    }
}

/// Typed interface to reading and writing a PV from application code
#[derive(Debug)]
pub struct Intercom<T>
where
    T: TryFrom<PvValue>,
    PvValue: From<T>,
{
    pv: Arc<Mutex<PV>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Intercom<T>
where
    T: TryFrom<PvValue>,
    PvValue: From<T>,
{
    fn clone(&self) -> Self {
        Self {
            pv: self.pv.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Intercom<T>
where
    T: TryFrom<PvValue>,
    PvValue: From<T>,
{
    fn new(pv: Arc<Mutex<PV>>) -> Self {
        if cfg!(debug_assertions) {
            // The library user should not be able to do this, so this indicates an
            // error in our logic
            let Ok(_) = TryInto::<T>::try_into(pv.lock().value.clone()) else {
                panic!("Failed to convert PV to static type");
            };
        }
        Self {
            pv,
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> T {
        let value = self.pv.lock().value.clone();
        match value.try_into() {
            Ok(v) => v,
            _ => panic!("Backend logic should ensure this conversion never fails!"),
        }
    }

    /// Store a new value, pushing it to every subscribed connection
    pub fn store(&self, value: T) -> Result<VersionNumber, PvError> {
        self.pv.lock().store(&value.into())
    }

    pub fn version(&self) -> VersionNumber {
        self.pv.lock().version
    }

    /// Receive every value written to this PV by a consumer
    pub fn subscribe(&self) -> broadcast::Receiver<PvValue> {
        self.pv.lock().sender.subscribe()
    }
}

/// Connection to one intercom PV, as handed to the engine
pub struct IntercomVariable {
    name: String,
    pv: Arc<Mutex<PV>>,
    access: Access,
    queue: Arc<UpdateQueue>,
    ready: Receiver<()>,
    /// Whether our queue is registered with the PV
    active: bool,
    buffer: PvValue,
    version: VersionNumber,
}

impl ProcessVariable for IntercomVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_readable(&self) -> bool {
        self.access.is_readable()
    }

    fn is_writeable(&self) -> bool {
        self.access.is_writeable()
    }

    fn ready_signal(&self) -> Option<ReadySignal> {
        self.access.is_readable().then(|| self.ready.clone())
    }

    fn activate_notifications(&mut self) -> Result<(), PvError> {
        if !self.active {
            debug!("Intercom: Activating notifications for {}", self.name);
            self.pv.lock().listeners.push(Arc::downgrade(&self.queue));
            self.active = true;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<(), PvError> {
        let pv = self.pv.lock();
        self.buffer = pv.value.clone();
        self.version = pv.version;
        // Anything still queued is older than what we just read
        self.queue.clear();
        Ok(())
    }

    fn read_non_blocking(&mut self) -> Result<bool, PvError> {
        if let Some((value, version)) = self.queue.pop() {
            self.buffer = value;
            self.version = version;
            return Ok(true);
        }
        if !self.active {
            let pv = self.pv.lock();
            if pv.version > self.version {
                self.buffer = pv.value.clone();
                self.version = pv.version;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn write(&mut self, version: VersionNumber) -> Result<(), PvError> {
        if !self.access.is_writeable() {
            return Err(PvError::NotWritable);
        }
        let mut pv = self.pv.lock();
        pv.publish(self.buffer.clone(), version);
        self.version = version;
        let _ = pv.sender.send(self.buffer.clone());
        Ok(())
    }

    fn buffer(&self) -> &PvValue {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut PvValue {
        &mut self.buffer
    }

    fn version(&self) -> VersionNumber {
        self.version
    }
}

/// In-process variable store, exchanging values between application code and consumers.
///
/// Application code holds typed [`Intercom`] handles; consumers reach the same values
/// through a [`PvProvider`](crate::PvProvider) built on this backend. Every store from
/// either side is pushed to all connections that have subscribed.
#[derive(Clone, Debug)]
pub struct IntercomBackend {
    name: String,
    pvs: Arc<Mutex<HashMap<String, Arc<Mutex<PV>>>>>,
    queue_length: usize,
    /// A Prefix that is inserted in front of any PV name
    pub prefix: String,
    /// Automatically map PV alternative names with a "_RBV" suffix, read-only
    pub rbv: bool,
}

impl IntercomBackend {
    pub fn new(name: &str) -> IntercomBackend {
        IntercomBackend {
            name: name.to_owned(),
            pvs: Default::default(),
            queue_length: DEFAULT_QUEUE_LENGTH,
            prefix: String::new(),
            rbv: false,
        }
    }

    /// Number of pushed updates each connection keeps before dropping the oldest
    pub fn with_queue_length(mut self, length: usize) -> Self {
        self.queue_length = length.max(1);
        self
    }

    pub fn add_pv<T>(&self, name: &str, initial_value: T) -> Result<Intercom<T>, PVAlreadyExists>
    where
        T: TryFrom<PvValue>,
        PvValue: From<T>,
    {
        self.add_pv_with_access(name, initial_value, Access::ReadWrite)
    }

    pub fn add_pv_with_access<T>(
        &self,
        name: &str,
        initial_value: T,
        access: Access,
    ) -> Result<Intercom<T>, PVAlreadyExists>
    where
        T: TryFrom<PvValue>,
        PvValue: From<T>,
    {
        let pv = Arc::new(Mutex::new(PV::new(
            name,
            PvValue::from(initial_value),
            access,
        )));
        let mut pvmap = self.pvs.lock();
        if pvmap.contains_key(name) {
            return Err(PVAlreadyExists(name.to_owned()));
        }
        pvmap.insert(name.to_owned(), pv.clone());
        Ok(Intercom::<T>::new(pv))
    }

    /// Normalize a PV name by stripping prefix/suffix
    fn normalize_pv_name<'a>(&self, pv_name: &'a str) -> &'a str {
        let mut name = pv_name.strip_prefix(&self.prefix).unwrap_or(pv_name);
        if self.rbv {
            name = name.strip_suffix("_RBV").unwrap_or(name);
        }
        name
    }
}

impl Backend for IntercomBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, pv_name: &str) -> Result<Box<dyn ProcessVariable>, PvError> {
        if !pv_name.starts_with(&self.prefix) {
            return Err(PvError::NotFound(pv_name.to_owned()));
        }
        let pv = self
            .pvs
            .lock()
            .get(self.normalize_pv_name(pv_name))
            .ok_or_else(|| PvError::NotFound(pv_name.to_owned()))?
            .clone();
        let (buffer, version, access) = {
            let inner = pv.lock();
            let access = if self.rbv && pv_name.ends_with("_RBV") {
                Access::Read
            } else {
                inner.access
            };
            (inner.value.clone(), inner.version, access)
        };
        let (queue, ready) = UpdateQueue::new(self.queue_length);
        debug!("Intercom: Opened {pv_name} ({access:?})");
        Ok(Box::new(IntercomVariable {
            name: pv_name.to_owned(),
            pv,
            access,
            queue,
            ready,
            active: false,
            buffer,
            version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_intercom() {
        let backend = IntercomBackend::new("test");
        let si = backend.add_pv("TEST", "Test String".to_string()).unwrap();
        assert_eq!(si.load(), "Test String");
        si.store("Another".to_string()).unwrap();
        let pv = backend.open("TEST").unwrap();
        assert_eq!(pv.buffer(), &PvValue::String(vec!["Another".to_string()]));
        assert!(backend.add_pv("TEST", 1i32).is_err());
    }

    #[test]
    fn queues_only_after_activation() {
        let backend = IntercomBackend::new("test").with_queue_length(3);
        let value = backend.add_pv("COUNT", 0i32).unwrap();
        let mut pv = backend.open("COUNT").unwrap();
        let ready = pv.ready_signal().unwrap();

        value.store(1).unwrap();
        assert!(ready.try_recv().is_err());
        // Without notifications a non-blocking read just picks up the newest value
        assert!(pv.read_non_blocking().unwrap());
        assert_eq!(pv.buffer(), &PvValue::Int32(vec![1]));
        assert!(!pv.read_non_blocking().unwrap());

        pv.activate_notifications().unwrap();
        for i in 2..7 {
            value.store(i).unwrap();
        }
        assert!(ready.try_recv().is_ok());
        // Only the newest three survive, and the signal is raised again while
        // anything remains queued
        let mut seen = Vec::new();
        while pv.read_non_blocking().unwrap() {
            seen.push(i32::try_from(pv.buffer().clone()).unwrap());
            if seen.len() < 3 {
                assert!(ready.try_recv().is_ok());
            }
        }
        assert_eq!(seen, vec![4, 5, 6]);
        assert!(ready.try_recv().is_err());
    }

    #[test]
    fn consumer_writes_reach_other_connections() {
        let backend = IntercomBackend::new("test");
        let value = backend.add_pv("SETPOINT", 1.5f64).unwrap();
        let mut app_writes = value.subscribe();
        let mut writer = backend.open("SETPOINT").unwrap();
        let mut reader = backend.open("SETPOINT").unwrap();
        writer.activate_notifications().unwrap();
        reader.activate_notifications().unwrap();

        *writer.buffer_mut() = PvValue::Float64(vec![3.0]);
        let version = VersionNumber::new();
        writer.write(version).unwrap();

        assert_eq!(value.load(), 3.0);
        assert_eq!(app_writes.try_recv().unwrap(), PvValue::Float64(vec![3.0]));
        assert!(reader.read_non_blocking().unwrap());
        assert_eq!(reader.version(), version);
        // Subscribers sharing the writing connection see the write too
        assert!(writer.read_non_blocking().unwrap());
        assert_eq!(writer.buffer(), &PvValue::Float64(vec![3.0]));
        assert!(!writer.read_non_blocking().unwrap());
    }

    #[test]
    fn prefix_and_readback_aliases() {
        let mut backend = IntercomBackend::new("test");
        backend.prefix = "BL01:".to_string();
        backend.rbv = true;
        backend.add_pv("GAIN", 2u16).unwrap();

        assert!(matches!(backend.open("GAIN"), Err(PvError::NotFound(_))));
        assert!(matches!(
            backend.open("BL01:MISSING"),
            Err(PvError::NotFound(_))
        ));
        let pv = backend.open("BL01:GAIN").unwrap();
        assert!(pv.is_writeable());
        let mut rbv = backend.open("BL01:GAIN_RBV").unwrap();
        assert!(rbv.is_readable());
        assert!(!rbv.is_writeable());
        assert!(matches!(
            rbv.write(VersionNumber::new()),
            Err(PvError::NotWritable)
        ));
    }
}
