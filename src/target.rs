//! The user-facing façade: composes a [`Backend`] and a [`CallbackManager`]
//! (plus an optional struct-layout registry) into one object.
//!
//! Grounded on the original `monk.Monk` class: a single entry point that
//! owns the connection's lifetime and forwards reads, writes, execution
//! control, and hook installation to its collaborators.

use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::callback::{CallbackHandle, CallbackManager};
use crate::error::Result;
use crate::rsp_target::RspTarget;
use crate::struct_access::{Struct, StructLayoutRegistry};
use crate::{AddrSize, Endian};

/// Connection parameters. `endian`/`addr_size` default to `little`/`4`
/// per spec.md §6 and may be overridden before connecting.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub endian: Endian,
    pub addr_size: AddrSize,
}

impl TargetConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TargetConfig {
            host: host.into(),
            port,
            endian: Endian::Little,
            addr_size: AddrSize::Four,
        }
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_addr_size(mut self, addr_size: AddrSize) -> Self {
        self.addr_size = addr_size;
        self
    }
}

/// A connected remote target: memory/register access, execution control,
/// and callback-based breakpoint hooks, with an optional dynamic
/// struct-field layer on top.
pub struct Target {
    backend: Arc<dyn Backend>,
    callbacks: Arc<CallbackManager>,
    structs: Mutex<StructLayoutRegistry>,
}

impl Target {
    /// Connect to a gdbstub and bring up the full stack: `RspTarget` as
    /// the `Backend`, a `CallbackManager` wired into its four event
    /// slots.
    pub fn connect(config: TargetConfig) -> Result<Self> {
        let rsp = RspTarget::connect(&config.host, config.port, config.endian, config.addr_size)?;
        let backend: Arc<dyn Backend> = rsp;
        let callbacks = Arc::new(CallbackManager::new(Arc::clone(&backend)));
        callbacks.install();

        Ok(Target {
            backend,
            callbacks,
            structs: Mutex::new(StructLayoutRegistry::new()),
        })
    }

    // ---- memory/register access --------------------------------------------

    pub fn read_register(&self, name: &str) -> Result<u64> {
        self.backend.get_reg(name)
    }

    pub fn write_register(&self, name: &str, val: u64) -> Result<()> {
        self.backend.write_reg(name, val)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.backend.read_uint8(addr)
    }
    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        self.backend.read_uint16(addr)
    }
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.backend.read_uint32(addr)
    }
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.backend.read_uint64(addr)
    }

    pub fn write_u8(&self, addr: u64, val: u8) -> Result<()> {
        self.backend.write_uint8(addr, val)
    }
    pub fn write_u16(&self, addr: u64, val: u16) -> Result<()> {
        self.backend.write_uint16(addr, val)
    }
    pub fn write_u32(&self, addr: u64, val: u32) -> Result<()> {
        self.backend.write_uint32(addr, val)
    }
    pub fn write_u64(&self, addr: u64, val: u64) -> Result<()> {
        self.backend.write_uint64(addr, val)
    }

    // ---- execution control --------------------------------------------------

    pub fn run(&self) -> Result<()> {
        self.backend.run()
    }
    pub fn stop(&self) -> Result<()> {
        self.backend.stop()
    }
    pub fn step(&self) -> Result<()> {
        self.backend.step()
    }
    pub fn is_running(&self) -> bool {
        self.backend.target_is_running()
    }

    pub fn endian(&self) -> Endian {
        self.backend.endian()
    }
    pub fn set_endian(&self, endian: Endian) {
        self.backend.set_endian(endian)
    }

    // ---- callback hooks -------------------------------------------------------

    pub fn on_read(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.callbacks.on_read(addr, cb)
    }
    pub fn on_write(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.callbacks.on_write(addr, cb)
    }
    pub fn on_access(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.callbacks.on_access(addr, cb)
    }
    pub fn on_execute(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.callbacks.on_execute(addr, cb)
    }
    pub fn remove_callback(&self, handle: CallbackHandle) -> Result<()> {
        self.callbacks.remove_callback(handle)
    }

    // ---- dynamic struct access --------------------------------------------------

    /// Populate the struct-layout registry. Ordinarily filled by the
    /// out-of-scope symbols subsystem; exposed directly here since that
    /// collaborator is not part of this crate.
    pub fn register_struct_layout(&self, layout: crate::struct_access::StructLayout) {
        self.structs.lock().unwrap().register(layout);
    }

    /// Resolve `base_addr` as an instance of the named struct layout.
    pub fn struct_at(&self, layout_name: &str, base_addr: u64) -> Option<Struct> {
        let layout = self.structs.lock().unwrap().get(layout_name)?;
        Some(Struct::new(base_addr, layout))
    }

    pub fn read_struct_field(&self, s: &Struct, field_name: &str) -> Result<u64> {
        s.read_field(self.backend.as_ref(), field_name)
    }

    pub fn write_struct_field(&self, s: &Struct, field_name: &str, val: u64) -> Result<()> {
        s.write_field(self.backend.as_ref(), field_name, val)
    }

    /// Tear down the connection: joins the event thread, stops the
    /// target, detaches, and closes the socket. Must be called from the
    /// thread that called `connect`.
    pub fn shutdown(&self) -> Result<()> {
        self.backend.shutdown()
    }
}
