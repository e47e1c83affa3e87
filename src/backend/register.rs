//! A poll-only device made of named registers.
//!
//! Registers never push updates: consumers only see changes when they read, or via
//! the provider's poll cycle. An optional access latency makes every variable
//! "blocking", which moves its I/O onto the provider's worker pool. Faults can be
//! injected per register to exercise error paths.

use std::{collections::HashMap, sync::Arc, thread, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::{
    backend::{Access, Backend, PVAlreadyExists, ProcessVariable},
    cell::VersionNumber,
    error::PvError,
    value::PvValue,
};

/// Error raised by a register with an injected fault
#[derive(Debug, Error)]
#[error("Register {register} faulted: {reason}")]
pub struct RegisterFault {
    pub register: String,
    pub reason: String,
}

#[derive(Debug)]
struct Register {
    value: PvValue,
    version: VersionNumber,
    access: Access,
    fault: Option<String>,
}

impl Register {
    fn check_fault(&self, name: &str) -> Result<(), PvError> {
        match &self.fault {
            Some(reason) => Err(PvError::backend(RegisterFault {
                register: name.to_owned(),
                reason: reason.clone(),
            })),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegisterDevice {
    name: String,
    registers: Arc<Mutex<HashMap<String, Arc<Mutex<Register>>>>>,
    latency: Option<Duration>,
}

impl RegisterDevice {
    pub fn new(name: &str) -> Self {
        RegisterDevice {
            name: name.to_owned(),
            registers: Default::default(),
            latency: None,
        }
    }

    /// Make every register access take at least this long
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn add_register(
        &self,
        name: &str,
        initial_value: impl Into<PvValue>,
        access: Access,
    ) -> Result<(), PVAlreadyExists> {
        let mut registers = self.registers.lock();
        if registers.contains_key(name) {
            return Err(PVAlreadyExists(name.to_owned()));
        }
        registers.insert(
            name.to_owned(),
            Arc::new(Mutex::new(Register {
                value: initial_value.into(),
                version: VersionNumber::new(),
                access,
                fault: None,
            })),
        );
        Ok(())
    }

    fn register(&self, name: &str) -> Result<Arc<Mutex<Register>>, PvError> {
        self.registers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| PvError::NotFound(name.to_owned()))
    }

    /// Change a register from the device side, as the hardware would
    pub fn poke(&self, name: &str, value: impl Into<PvValue>) -> Result<VersionNumber, PvError> {
        let register = self.register(name)?;
        let mut register = register.lock();
        let value = value.into().convert_to(register.value.value_type())?;
        if value.len() != register.value.len() {
            return Err(PvError::TypeMismatch(format!(
                "register {name} holds {} elements, got {}",
                register.value.len(),
                value.len()
            )));
        }
        register.value = value;
        register.version = VersionNumber::new();
        Ok(register.version)
    }

    /// Inspect a register without going through a connection
    pub fn peek(&self, name: &str) -> Result<PvValue, PvError> {
        Ok(self.register(name)?.lock().value.clone())
    }

    /// Make every access to a register fail until the fault is cleared with `None`
    pub fn set_fault(&self, name: &str, reason: Option<&str>) -> Result<(), PvError> {
        self.register(name)?.lock().fault = reason.map(str::to_owned);
        Ok(())
    }
}

impl Backend for RegisterDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, pv_name: &str) -> Result<Box<dyn ProcessVariable>, PvError> {
        let register = self.register(pv_name)?;
        let (buffer, version, access) = {
            let inner = register.lock();
            (inner.value.clone(), inner.version, inner.access)
        };
        Ok(Box::new(RegisterVariable {
            name: pv_name.to_owned(),
            register,
            access,
            latency: self.latency,
            buffer,
            version,
        }))
    }
}

pub struct RegisterVariable {
    name: String,
    register: Arc<Mutex<Register>>,
    access: Access,
    latency: Option<Duration>,
    buffer: PvValue,
    version: VersionNumber,
}

impl RegisterVariable {
    fn wait_for_bus(&self) {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
    }
}

impl ProcessVariable for RegisterVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_readable(&self) -> bool {
        self.access.is_readable()
    }

    fn is_writeable(&self) -> bool {
        self.access.is_writeable()
    }

    fn is_blocking(&self) -> bool {
        self.latency.is_some()
    }

    fn read(&mut self) -> Result<(), PvError> {
        self.wait_for_bus();
        let register = self.register.lock();
        register.check_fault(&self.name)?;
        trace!("Register {}: read", self.name);
        self.buffer = register.value.clone();
        self.version = register.version;
        Ok(())
    }

    fn read_non_blocking(&mut self) -> Result<bool, PvError> {
        self.read().map(|_| true)
    }

    fn write(&mut self, version: VersionNumber) -> Result<(), PvError> {
        if !self.access.is_writeable() {
            return Err(PvError::NotWritable);
        }
        self.wait_for_bus();
        let mut register = self.register.lock();
        register.check_fault(&self.name)?;
        trace!("Register {}: write", self.name);
        register.value = self.buffer.clone();
        register.version = version;
        self.version = version;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_are_poll_only() {
        let device = RegisterDevice::new("dev");
        device
            .add_register("ADC0", vec![0u16; 4], Access::Read)
            .unwrap();
        let mut pv = device.open("ADC0").unwrap();
        assert!(pv.ready_signal().is_none());
        assert!(!pv.is_blocking());
        assert_eq!(pv.element_count(), 4);

        let version = device.poke("ADC0", vec![1u16, 2, 3, 4]).unwrap();
        assert!(pv.read_latest().unwrap());
        assert_eq!(pv.buffer(), &PvValue::UInt16(vec![1, 2, 3, 4]));
        assert_eq!(pv.version(), version);
        assert!(matches!(
            pv.write(VersionNumber::new()),
            Err(PvError::NotWritable)
        ));
        assert!(device.poke("ADC0", vec![1u16]).is_err());
        assert!(matches!(device.open("ADC9"), Err(PvError::NotFound(_))));
    }

    #[test]
    fn register_names_are_unique() {
        let device = RegisterDevice::new("dev");
        device.add_register("GAIN", 1u8, Access::ReadWrite).unwrap();
        let Err(PVAlreadyExists(name)) = device.add_register("GAIN", 2u8, Access::Read) else {
            panic!("Expected the second register to be refused");
        };
        assert_eq!(name, "GAIN");
        assert_eq!(device.peek("GAIN").unwrap(), PvValue::UInt8(vec![1]));
    }

    #[test]
    fn injected_faults_are_backend_failures() {
        let device = RegisterDevice::new("dev").with_latency(Duration::from_millis(1));
        device
            .add_register("DAC0", 0.0f64, Access::ReadWrite)
            .unwrap();
        let mut pv = device.open("DAC0").unwrap();
        assert!(pv.is_blocking());
        device.set_fault("DAC0", Some("bus timeout")).unwrap();
        let Err(PvError::BackendFailure(err)) = pv.read() else {
            panic!("Expected a backend failure");
        };
        assert!(err.to_string().contains("bus timeout"));
        device.set_fault("DAC0", None).unwrap();
        *pv.buffer_mut() = PvValue::Float64(vec![2.5]);
        pv.write(VersionNumber::new()).unwrap();
        assert_eq!(device.peek("DAC0").unwrap(), PvValue::Float64(vec![2.5]));
    }
}
