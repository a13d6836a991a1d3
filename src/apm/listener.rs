use std::ops::Deref;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use apm::event::Event;

pub type EventHook = fn(&Event);

/// Fans events out to registered hooks. Dispatch is infallible; a poisoned
/// hook list simply drops the event.
pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<EventHook>>,
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_hook(&self, hook: EventHook) {
        if let Ok(mut guard) = self.hooks.write() {
            self.no_hooks.store(false, Ordering::SeqCst);
            guard.push(hook);
        }
    }

    pub fn dispatch(&self, event: &Event) {
        if self.no_hooks.load(Ordering::SeqCst) {
            return;
        }

        if let Ok(guard) = self.hooks.read() {
            for hook in guard.deref().iter() {
                hook(event);
            }
        }
    }
}
