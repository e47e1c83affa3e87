//! The dispatch loop delivering notifications for one provider.
//!
//! A single thread waits on the ready signals of every armed push variable at once,
//! plus a wake-up channel used to tell it that the set has changed. Armed poll-only
//! variables are checked each time the poll interval elapses. Poll-only variables on
//! blocking devices are read without holding the provider lock, so that a slow device
//! never stalls the facades of other variables.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Select};
use tracing::{debug, trace};

use crate::{
    backend::ReadySignal,
    provider::ProviderCore,
    shared::{Delivery, SharedIo, transfer_in},
    value::ValueType,
};

/// The loop's copy of the armed push variables
#[derive(Default)]
struct DispatchTable {
    generation: Option<u64>,
    push: Vec<(usize, ReadySignal)>,
    polling: bool,
}

pub(crate) fn run(core: Arc<ProviderCore>, wakeup: Receiver<()>) {
    debug!("Dispatch loop for '{}' started", core.name());
    let mut table = DispatchTable::default();
    let mut next_poll = Instant::now();

    loop {
        let Some(refreshed) = core.with_registry(|reg| {
            if reg.shutdown {
                return None;
            }
            if table.generation == Some(reg.generation) {
                return Some(None);
            }
            Some(Some(DispatchTable {
                generation: Some(reg.generation),
                push: reg
                    .armed_push
                    .iter()
                    .map(|(pv, signal)| (*pv, signal.clone()))
                    .collect(),
                polling: !reg.armed_polled.is_empty(),
            }))
        }) else {
            break;
        };
        if let Some(refreshed) = refreshed {
            trace!(
                "Dispatch table now has {} push variables{}",
                refreshed.push.len(),
                if refreshed.polling { ", polling" } else { "" }
            );
            if refreshed.polling && !table.polling {
                next_poll = Instant::now() + poll_interval(&core);
            }
            table = refreshed;
        }

        let mut select = Select::new();
        select.recv(&wakeup);
        for (_, signal) in &table.push {
            select.recv(signal);
        }
        let ready = if table.polling {
            select.ready_deadline(next_poll).ok()
        } else {
            Some(select.ready())
        };

        match ready {
            Some(0) => {
                let _ = wakeup.try_recv();
                reconsider(&core);
            }
            Some(index) => {
                let (pv, signal) = &table.push[index - 1];
                dispatch_one(&core, *pv, Some(signal));
            }
            None => {
                let polled: Vec<usize> =
                    core.with_registry(|reg| reg.armed_polled.iter().copied().collect());
                for pv in polled {
                    dispatch_one(&core, pv, None);
                }
                next_poll = Instant::now() + poll_interval(&core);
            }
        }
    }
    debug!("Dispatch loop for '{}' exiting", core.name());
}

fn poll_interval(core: &ProviderCore) -> Duration {
    // Polled variables are only ever armed with an interval configured
    core.poll_interval.unwrap_or(Duration::from_secs(1))
}

/// Give each re-armed push variable a chance to deliver values queued meanwhile
fn reconsider(core: &ProviderCore) {
    let pending: Vec<usize> = core.with_registry(|reg| reg.reconsider.drain(..).collect());
    for pv in pending {
        dispatch_one(core, pv, None);
    }
}

/// What a notification round needs once the provider lock has been released
enum Round {
    Deliver(Delivery),
    /// A blocking poll-only variable, read without holding the provider lock
    Poll(SharedIo, ValueType, usize),
}

/// Run one notification round for a variable, if it is still armed
fn dispatch_one(core: &ProviderCore, pv: usize, token: Option<&ReadySignal>) {
    let round = core.with_registry(|reg| {
        if reg.shutdown || !reg.pvs[pv].is_armed(reg.poll_enabled) {
            return None;
        }
        if let Some(token) = token {
            let _ = token.try_recv();
        }
        let shared = &mut reg.pvs[pv];
        if !shared.is_push() && shared.is_blocking() {
            return Some(Round::Poll(
                shared.io.clone(),
                shared.value_type(),
                shared.element_count(),
            ));
        }
        let delivery = shared.do_notify();
        reg.refresh_dispatch(pv);
        delivery.map(Round::Deliver)
    });
    let delivery = match round {
        None => None,
        Some(Round::Deliver(delivery)) => Some(delivery),
        Some(Round::Poll(io, value_type, count)) => {
            let fetched = transfer_in(&io, value_type, count);
            core.with_registry(|reg| {
                if reg.shutdown {
                    return None;
                }
                // Subscriptions may have changed while the device was busy
                let armed = reg.pvs[pv].is_armed(reg.poll_enabled);
                let delivery = reg.pvs[pv].complete_poll(fetched, armed);
                reg.refresh_dispatch(pv);
                delivery
            })
        }
    };
    if let Some(delivery) = delivery {
        core.deliver(pv, delivery);
    }
}
