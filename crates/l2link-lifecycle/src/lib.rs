//! Kernel-side tunnel lifecycle
//!
//! Drives one tunnel record's kernel objects (L2TPv3 tunnel, session and the
//! Ethernet pseudo-interface) between `ABSENT` and `INTERFACE_UP`. All OS
//! access goes through the [`TunnelControl`] and [`ModuleLoader`] traits so
//! the controller can run against the in-memory fakes in tests.

pub mod control;
pub mod controller;
pub mod error;
pub mod iproute;
pub mod memory;
pub mod modules;

pub use control::{InterfaceState, SessionSpec, TunnelControl, TunnelSpec};
pub use controller::{KernelState, LifecycleController};
pub use error::{LifecycleError, Stage};
pub use iproute::IpRouteControl;
pub use memory::{MemoryControl, MemoryModules};
pub use modules::{ModuleLoader, Modprobe};
