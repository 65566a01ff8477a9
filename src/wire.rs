//! On-wire action records exchanged with the macro daemon.
//!
//! Each message is one fixed-size record. Both endpoints run on the same
//! host, so fields are native-endian; the layout is fixed here rather than
//! dumping an in-memory struct:
//!
//! ```text
//! offset  size  field
//!      0     8  tv_sec   (i64)
//!      8     8  tv_usec  (i64)
//!     16     4  value    (i32)  0=release 1=press 2=repeat
//!     20     2  code     (u16)
//!     22     1  done     (u8)   0 or 1
//!     23     1  reserved        zero on encode, ignored on decode
//! ```

use crate::error::SocketError;

/// Size in bytes of one encoded [`Action`].
pub const ACTION_SIZE: usize = 24;

/// Kernel key-event values.
pub mod key_value {
    pub const RELEASE: i32 = 0;
    pub const PRESS: i32 = 1;
    pub const REPEAT: i32 = 2;
}

/// One key event as read from a grabbed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyEvent {
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub code: u16,
    pub value: i32,
}

impl KeyEvent {
    pub fn new(code: u16, value: i32) -> Self {
        KeyEvent {
            tv_sec: 0,
            tv_usec: 0,
            code,
            value,
        }
    }
}

/// The wire unit between the keyboard daemon and the macro daemon.
///
/// `done == true` terminates a response burst and carries no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    pub ev: KeyEvent,
    pub done: bool,
}

impl Action {
    /// An event carrier (`done = false`).
    pub fn event(ev: KeyEvent) -> Self {
        Action { ev, done: false }
    }

    /// The burst-terminating sentinel.
    pub fn done() -> Self {
        Action {
            ev: KeyEvent::default(),
            done: true,
        }
    }

    pub fn encode(&self) -> [u8; ACTION_SIZE] {
        let mut buf = [0u8; ACTION_SIZE];
        buf[0..8].copy_from_slice(&self.ev.tv_sec.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.ev.tv_usec.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.ev.value.to_ne_bytes());
        buf[20..22].copy_from_slice(&self.ev.code.to_ne_bytes());
        buf[22] = self.done as u8;
        buf
    }

    pub fn decode(buf: &[u8; ACTION_SIZE]) -> Result<Self, SocketError> {
        let done = match buf[22] {
            0 => false,
            1 => true,
            _ => return Err(SocketError::Decode("done flag out of range")),
        };
        Ok(Action {
            ev: KeyEvent {
                tv_sec: i64::from_ne_bytes(buf[0..8].try_into().unwrap()),
                tv_usec: i64::from_ne_bytes(buf[8..16].try_into().unwrap()),
                value: i32::from_ne_bytes(buf[16..20].try_into().unwrap()),
                code: u16::from_ne_bytes(buf[20..22].try_into().unwrap()),
            },
            done,
        })
    }
}
