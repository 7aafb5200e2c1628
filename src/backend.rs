//! The narrow, language-neutral contract between [`RspTarget`] and
//! [`CallbackManager`](crate::callback::CallbackManager).
//!
//! `Backend` is deliberately small: it's what a future in-process
//! host-debugger backend would also have to implement (spec.md §4.4), so it
//! carries only primitive memory/register/control/breakpoint operations and
//! the four event-callback slots. Nothing in `CallbackManager` depends on
//! `RspTarget` directly -- only on this trait.

use crate::error::Result;
use crate::Endian;

/// A boxed, type-erased slot for one of the four event-callback hooks a
/// `Backend` notifies when its corresponding breakpoint kind fires.
pub type EventCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Operations a debug-control backend must provide. [`RspTarget`](crate::rsp_target::RspTarget)
/// is the only implementation specified here; an in-process host-debugger
/// backend is recognized as a second implementation but out of scope.
pub trait Backend: Send + Sync {
    fn get_reg(&self, name: &str) -> Result<u64>;
    fn write_reg(&self, name: &str, val: u64) -> Result<()>;

    fn read_uint8(&self, addr: u64) -> Result<u8>;
    fn read_uint16(&self, addr: u64) -> Result<u16>;
    fn read_uint32(&self, addr: u64) -> Result<u32>;
    fn read_uint64(&self, addr: u64) -> Result<u64>;

    fn write_uint8(&self, addr: u64, val: u8) -> Result<()>;
    fn write_uint16(&self, addr: u64, val: u16) -> Result<()>;
    fn write_uint32(&self, addr: u64, val: u32) -> Result<()>;
    fn write_uint64(&self, addr: u64, val: u64) -> Result<()>;

    fn run(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn step(&self) -> Result<()>;
    fn shutdown(&self) -> Result<()>;
    fn target_is_running(&self) -> bool;

    fn set_read_breakpoint(&self, addr: u64) -> Result<()>;
    fn del_read_breakpoint(&self, addr: u64) -> Result<()>;
    fn set_write_breakpoint(&self, addr: u64) -> Result<()>;
    fn del_write_breakpoint(&self, addr: u64) -> Result<()>;
    fn set_access_breakpoint(&self, addr: u64) -> Result<()>;
    fn del_access_breakpoint(&self, addr: u64) -> Result<()>;
    fn set_exec_breakpoint(&self, addr: u64) -> Result<()>;
    fn del_exec_breakpoint(&self, addr: u64) -> Result<()>;

    fn set_on_read_callback(&self, cb: EventCallback);
    fn set_on_write_callback(&self, cb: EventCallback);
    fn set_on_access_callback(&self, cb: EventCallback);
    fn set_on_execute_callback(&self, cb: EventCallback);

    fn endian(&self) -> Endian;
    fn set_endian(&self, endian: Endian);
}
