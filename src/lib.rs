// #![warn(missing_docs)]

//! Shared access to process variables, for many independent consumers at once.
//!
//! A device or data source (a [`backend::Backend`]) holds a set of named values,
//! "process variables". Many consumers, such as the records of an EPICS-style
//! database, want to read, write or watch the same variables at the same time,
//! without each of them holding its own connection to a possibly slow device.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! The crate approaches the problem by separating:
//!
//! - The [backend] interface that devices implement, with two small built-in backends:
//!   - [`backend::IntercomBackend`]: an in-process store, giving application code
//!     typed access objects to values that consumers see as process variables. The
//!     access objects can be cloned and passed across thread boundaries.
//!   - [`backend::RegisterDevice`]: a poll-only register map, with optional access
//!     latency and injectable faults.
//! - A [`PvProvider`], owning one shared connection per variable name, the thread
//!   that dispatches change notifications, and a pool of workers for blocking I/O.
//! - [`PvSupport`] facades, one per consumer, through which values are read, written
//!   and subscribed to. Completion is always reported through a callback taking a
//!   [`Result`], together with a [`Completion`] telling whether it already ran.
//! - Representing values of any of the supported element types ([`PvValue`]), with
//!   conversions between them wherever no information is lost.
//!
//! ## Example
//!
//! Exposing a single [i32] through the intercom backend, and watching it change:
//!
//! ```
//! use pvsupport::{PvProvider, PvValue, backend::IntercomBackend};
//!
//! let backend = IntercomBackend::new("demo");
//! let counter = backend.add_pv("COUNTER", 42i32).unwrap();
//! let provider = PvProvider::start(backend).unwrap();
//!
//! let support = provider.create_pv_support("COUNTER").unwrap();
//! assert_eq!(support.read_blocking().unwrap().value(), &PvValue::Int32(vec![42]));
//!
//! let ack = support.acknowledger();
//! support
//!     .notify(move |update| {
//!         println!("COUNTER is now {}", update.unwrap().value());
//!         ack.notify_finished();
//!     })
//!     .unwrap();
//! counter.store(43).unwrap();
//! ```
//!
//! ## Notifications
//!
//! Each facade has at most one notification in flight: after its callback has run
//! it must call [`PvSupport::notify_finished`] (or the [`support::NotifyAck`] handle)
//! before it is given the next value. A variable only starts a new round once every
//! subscriber has acknowledged the previous one. Values are delivered in version
//! order, and a newly subscribed facade is always handed the current value straight
//! away. Backends that cannot push updates are polled instead, if the provider has a
//! poll interval.

pub mod backend;
pub mod cell;
mod dispatch;
pub mod error;
pub mod pool;
mod provider;
mod shared;
pub mod support;
pub mod timer;
pub mod utils;
pub mod value;

pub use crate::cell::{ValueCell, VersionNumber};
pub use crate::error::PvError;
pub use crate::provider::{ProviderBuilder, PvProvider};
pub use crate::shared::NotifyCallback;
pub use crate::support::{Completion, PvDiagnostics, PvSupport};
pub use crate::value::{PvValue, ValueType};
