// kbdd - Keyboard daemon for the hotkey/macro system
// Grabs physical keyboards, filters keys against the passthrough set,
// and relays opted-in keys to the macro daemon over a unix socket.

pub mod config;
pub mod daemon;
pub mod device;
pub mod emitter;
pub mod error;
pub mod fswatch;
pub mod passthrough;
pub mod poller;
pub mod registry;
pub mod shutdown;
pub mod socket;
pub mod wire;

pub use daemon::{hotplug_reactor, passthrough_reactor, ErrorBudget, KbdDaemon};
pub use device::{DeviceState, KbdDevice};
pub use emitter::VirtualOut;
pub use error::{DaemonError, DeviceError, ReloadError, SocketError, WatchError};
pub use fswatch::{FsEvent, FsWatcher};
pub use passthrough::PassthroughSet;
pub use poller::{wait_readable, Readiness};
pub use registry::DeviceRegistry;
pub use shutdown::Shutdown;
pub use socket::FrameSocket;
pub use wire::{Action, KeyEvent, ACTION_SIZE};
