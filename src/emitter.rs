//! Buffered re-emission sink over a uinput virtual keyboard.
//!
//! `emit` only queues; `flush` commits the queue as one batch, after which
//! the virtual device appends the synchronizing report. The virtual device
//! is distinct from any grabbed device and is never grabbed itself, so
//! emitted events are not read back by the daemon.

use std::io;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use tracing::info;

use crate::wire::KeyEvent;

/// Highest key code published on the virtual device. The macro daemon may
/// emit any keyboard code, not just those seen on a physical device.
const KEY_CODE_MAX: u16 = 0x2ff;

pub struct VirtualOut {
    dev: VirtualDevice,
    queue: Vec<InputEvent>,
}

impl VirtualOut {
    /// Create the virtual keyboard, publishing the full key range.
    pub fn new() -> io::Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 1..=KEY_CODE_MAX {
            keys.insert(Key::new(code));
        }
        let dev = VirtualDeviceBuilder::new()?
            .name("kbdd virtual keyboard")
            .with_keys(&keys)?
            .build()?;
        info!("virtual keyboard created");
        Ok(VirtualOut { dev, queue: Vec::new() })
    }

    /// Queue one synthetic key event.
    pub fn emit(&mut self, ev: KeyEvent) {
        self.queue
            .push(InputEvent::new(EventType::KEY, ev.code, ev.value));
    }

    /// Commit all queued events and clear the queue. The queue is cleared
    /// even when the write fails; stale keystrokes must not replay later.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let result = self.dev.emit(&self.queue);
        self.queue.clear();
        result
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
