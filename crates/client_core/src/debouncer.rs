//! Per-device trailing-edge debounce of user intents.
//!
//! Every call to [`Debouncer::submit_intent`] overwrites the buffered state for
//! that device and restarts its quiescence timer. Only when the window passes
//! without another call is a single [`Command`] carrying the last buffered
//! state emitted on the output channel. Devices never share a timer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use shared::domain::{Command, DeviceKey, DeviceState};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(500);

struct PendingIntent {
    generation: u64,
    desired: DeviceState,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    next_generation: u64,
    pending: HashMap<DeviceKey, PendingIntent>,
}

impl Slots {
    /// Removes the buffered intent only if it still belongs to `generation`.
    /// A timer that lost the race against a newer submission finds a higher
    /// generation and emits nothing.
    fn take_if_current(&mut self, device: DeviceKey, generation: u64) -> Option<DeviceState> {
        match self.pending.get(&device) {
            Some(intent) if intent.generation == generation => {
                self.pending.remove(&device).map(|intent| intent.desired)
            }
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    slots: Arc<Mutex<Slots>>,
    output: mpsc::UnboundedSender<Command>,
}

impl Debouncer {
    /// Must be used from within a tokio runtime; timers are spawned tasks.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (output, commands) = mpsc::unbounded_channel();
        (
            Self {
                window,
                slots: Arc::new(Mutex::new(Slots::default())),
                output,
            },
            commands,
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn submit_intent(&self, device: DeviceKey, desired: DeviceState) {
        let mut slots = self.lock();
        slots.next_generation += 1;
        let generation = slots.next_generation;

        if let Some(previous) = slots.pending.remove(&device) {
            previous.timer.abort();
            trace!(%device, from = %previous.desired, to = %desired, "quiescence timer reset");
        }

        let timer = tokio::spawn(fire_after(
            Arc::clone(&self.slots),
            self.output.clone(),
            device,
            generation,
            self.window,
        ));
        slots.pending.insert(
            device,
            PendingIntent {
                generation,
                desired,
                timer,
            },
        );
    }

    /// The state that will be emitted for `device` if the user stops now.
    pub fn pending(&self, device: DeviceKey) -> Option<DeviceState> {
        self.lock().pending.get(&device).map(|intent| intent.desired)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Emits every buffered intent immediately, e.g. before shutting down.
    pub fn flush(&self) -> usize {
        let drained: Vec<(DeviceKey, PendingIntent)> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (device, intent) in drained {
            intent.timer.abort();
            emit(&self.output, device, intent.desired);
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn fire_after(
    slots: Arc<Mutex<Slots>>,
    output: mpsc::UnboundedSender<Command>,
    device: DeviceKey,
    generation: u64,
    window: Duration,
) {
    tokio::time::sleep(window).await;
    let desired = slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take_if_current(device, generation);
    if let Some(desired) = desired {
        emit(&output, device, desired);
    }
}

fn emit(output: &mpsc::UnboundedSender<Command>, device: DeviceKey, desired: DeviceState) {
    let command = Command::new(device, desired);
    debug!(%device, command_id = %command.command_id, state = %desired, "intent settled");
    if output.send(command).is_err() {
        warn!(%device, "command receiver dropped; intent discarded");
    }
}

#[cfg(test)]
#[path = "tests/debouncer_tests.rs"]
mod tests;
