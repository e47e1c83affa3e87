//! Interface between the engine and the devices that hold variable values

pub mod intercom;
pub mod register;

pub use intercom::IntercomBackend;
pub use register::RegisterDevice;

use thiserror::Error;

use crate::{cell::VersionNumber, error::PvError, value::PvValue, value::ValueType};

/// A backend was asked to add a variable under a name it already holds
#[derive(Debug, Error)]
#[error("PV already exists: {0}")]
pub struct PVAlreadyExists(pub String);

/// Signal raised by push-capable variables when new data has been queued.
///
/// Tokens are coalesced: the channel holds at most one, and the variable raises it
/// again after a read if further values are still queued.
pub type ReadySignal = crossbeam_channel::Receiver<()>;

/// Access rights of a variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Access {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Access {
    pub fn is_readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn is_writeable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Provides process variables to a [`PvProvider`](crate::PvProvider)
pub trait Backend: Send + Sync + 'static {
    /// Name of this backend, the first half of every variable's identity
    fn name(&self) -> &str;

    /// Open a connection to a single variable.
    ///
    /// Each call returns an independent connection. The engine only ever opens one
    /// per variable name, and owns it exclusively. Unknown names should fail with
    /// [`PvError::NotFound`].
    fn open(&self, pv_name: &str) -> Result<Box<dyn ProcessVariable>, PvError>;
}

/// One open connection to a variable.
///
/// Data moves through an internal buffer: reads fill [`ProcessVariable::buffer`],
/// writes send whatever it holds. The engine exchanges the buffer with its own
/// storage by swapping, so implementations must not assume that the buffer still
/// holds the last value they read.
pub trait ProcessVariable: Send {
    fn name(&self) -> &str;

    fn is_readable(&self) -> bool;

    fn is_writeable(&self) -> bool;

    /// Element type of the variable, fixed for its lifetime
    fn value_type(&self) -> ValueType {
        self.buffer().value_type()
    }

    /// Element count of the variable, fixed for its lifetime
    fn element_count(&self) -> usize {
        self.buffer().len()
    }

    /// Whether reads or writes may block for a noticeable time.
    ///
    /// The engine hands I/O on blocking variables to its worker pool.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Push-capable variables return the signal raised when new data is queued.
    ///
    /// Variables returning `None` are poll-only.
    fn ready_signal(&self) -> Option<ReadySignal> {
        None
    }

    /// Ask the device to start queuing pushed updates for this connection.
    ///
    /// Called once a consumer subscribes. May fail transiently, in which case it is
    /// retried later.
    fn activate_notifications(&mut self) -> Result<(), PvError> {
        Ok(())
    }

    /// Read the current value into the buffer, blocking as long as necessary
    fn read(&mut self) -> Result<(), PvError>;

    /// Transfer the next queued value into the buffer.
    ///
    /// Returns `false` if nothing was queued. Poll-only variables can implement this
    /// as a full read.
    fn read_non_blocking(&mut self) -> Result<bool, PvError>;

    /// Transfer the newest value into the buffer, discarding any older ones.
    fn read_latest(&mut self) -> Result<bool, PvError> {
        if self.ready_signal().is_none() {
            self.read()?;
            return Ok(true);
        }
        let mut any = false;
        while self.read_non_blocking()? {
            any = true;
        }
        Ok(any)
    }

    /// Send the buffer contents to the device, tagged with the given version
    fn write(&mut self, version: VersionNumber) -> Result<(), PvError>;

    fn buffer(&self) -> &PvValue;

    fn buffer_mut(&mut self) -> &mut PvValue;

    /// Version of the data currently in the buffer
    fn version(&self) -> VersionNumber;
}
