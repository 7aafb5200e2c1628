//! The stateful RSP target controller: command serialization, run/stop
//! bookkeeping, feature negotiation, register-layout discovery,
//! breakpoint/watchpoint management, and the asynchronous stop-event loop.
//!
//! This is the hard part of the crate (spec.md §2 puts it at ~45% of the
//! implementation). Three long-lived threads participate per connection:
//! `PacketIO`'s reader and writer (owned by [`io::PacketIO`]), and this
//! module's own stop-event thread. A fourth, short-lived kind of thread —
//! a callback worker spawned by [`crate::callback::CallbackManager`] — is
//! deliberately *not* allowed to drive execution; see [`guard_thread`].

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::backend::{Backend, EventCallback};
use crate::breakpoint::BreakpointKind;
use crate::error::{Result, RspError};
use crate::event::{self, EventKind, StopReason};
use crate::hex;
use crate::io::PacketIO;
use crate::regs::{self, RegisterLayout};
use crate::{AddrSize, Endian};

/// How long the event thread waits on the stop queue per poll, and sleeps
/// between empty polls. Short enough that `cmd_step`'s "wait for the stop
/// queue to drain" spin doesn't stall noticeably.
const EVENT_POLL: Duration = Duration::from_micros(100);

thread_local! {
    static IS_CALLBACK_WORKER: Cell<bool> = Cell::new(false);
}

/// Marks the calling thread as a callback worker, so that `RspTarget`'s
/// execution-command guard refuses to let it drive execution. Called once
/// by [`crate::callback::CallbackManager`] at the top of every spawned
/// worker, before the user's function runs.
pub(crate) fn mark_current_thread_as_callback_worker() {
    IS_CALLBACK_WORKER.with(|c| c.set(true));
}

fn is_callback_worker() -> bool {
    IS_CALLBACK_WORKER.with(|c| c.get())
}

/// The five fields spec.md §3 names as "target state", guarded together
/// because they're only ever read or written while holding `event_lock`
/// (or on the event thread itself, which amounts to the same thing).
#[derive(Debug, Default)]
struct TargetState {
    target_is_stopped: bool,
    user_stopped: bool,
    saved_bp: Option<u64>,
    callback_unset_bp: bool,
}

/// Stateful controller over one [`PacketIO`] connection: the only
/// implementation of [`Backend`] this crate specifies.
pub struct RspTarget {
    io: PacketIO,
    reg_layout: RegisterLayout,
    addr_size: AddrSize,
    endian: Mutex<Endian>,

    owner_thread: ThreadId,
    event_thread_id: Mutex<Option<ThreadId>>,
    event_thread_handle: Mutex<Option<JoinHandle<()>>>,

    /// Guards any send/recv pair that must see its matched reply.
    rsp_lock: Mutex<()>,
    /// Mutually excludes callbacks/execution-changing commands from the
    /// stop-event thread's own handling of a hit.
    event_lock: Mutex<()>,
    state: Mutex<TargetState>,

    shutdown: AtomicBool,

    on_read: Mutex<Option<EventCallback>>,
    on_write: Mutex<Option<EventCallback>>,
    on_access: Mutex<Option<EventCallback>>,
    on_execute: Mutex<Option<EventCallback>>,
}

impl RspTarget {
    /// Open a connection and run the strict initialization sequence from
    /// spec.md §3/§4.2: drain stale queues, query initial stop status,
    /// force a stop, negotiate features, discover the register layout,
    /// then start the stop-event thread. The calling thread becomes the
    /// *owner thread* — the only thread (besides the event thread) ever
    /// permitted to drive execution commands, and the only one permitted
    /// to call [`RspTarget::close`].
    pub fn connect(host: &str, port: u16, endian: Endian, addr_size: AddrSize) -> Result<Arc<Self>> {
        let io = PacketIO::connect(host, port)?;
        let owner_thread = thread::current().id();

        while io.recv(Some(Duration::from_millis(20))).is_some() {}
        while io.recv_stop(Duration::from_millis(20)).is_some() {}

        io.send(b"?")?;
        let initial_reply = io.recv_stop_blocking().ok_or(RspError::ConnectionReset)?;
        // A reply this crate can classify as a halt means the stub is
        // already stopped; anything else is treated conservatively as
        // "running", so the forced stop below actually sends `vCtrlC`
        // rather than silently assuming a halt that never happened. This
        // whole construction phase is single-threaded (no event/callback
        // threads exist yet), so driving `io` directly here needs none of
        // `RspTarget`'s own locking.
        if event::classify_stop(&initial_reply, None).is_none() {
            io.send(b"vCtrlC")?;
        }

        io.send(
            b"qSupported:multiprocess+;swbreak+;hwbreak+;qRelocInsn+;fork-events+;\
              exec-events+;vContSupported+;QThreadEvents+;no-resumed+;xmlRegisters=i386",
        )?;
        let _ = io.recv(None);

        let reg_layout = discover_register_layout(&io)?;
        log::debug!("discovered {} registers", reg_layout.len());

        let target = Arc::new(RspTarget {
            io,
            reg_layout,
            addr_size,
            endian: Mutex::new(endian),
            owner_thread,
            event_thread_id: Mutex::new(None),
            event_thread_handle: Mutex::new(None),
            rsp_lock: Mutex::new(()),
            event_lock: Mutex::new(()),
            state: Mutex::new(TargetState {
                target_is_stopped: true,
                ..Default::default()
            }),
            shutdown: AtomicBool::new(false),
            on_read: Mutex::new(None),
            on_write: Mutex::new(None),
            on_access: Mutex::new(None),
            on_execute: Mutex::new(None),
        });

        let event_thread = {
            let target = Arc::clone(&target);
            thread::Builder::new()
                .name("rsp-target-event".into())
                .spawn(move || target.event_loop())
                .expect("failed to spawn stop-event thread")
        };
        *target.event_thread_handle.lock().unwrap() = Some(event_thread);

        Ok(target)
    }

    pub fn register_layout(&self) -> &RegisterLayout {
        &self.reg_layout
    }

    /// Terminate the connection: signal shutdown, join the event thread,
    /// stop the target, detach (`D;1`), then tear down `PacketIO`. Must be
    /// called from the owner thread; callbacks are forbidden from calling
    /// it (spec.md §3's lifecycle note).
    pub fn close(&self) -> Result<()> {
        if thread::current().id() != self.owner_thread {
            return Err(RspError::NotOwningThread);
        }

        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.event_thread_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let _ = self.cmd_stop();
        let _ = self.io.send(b"D;1");
        self.io.shutdown();
        Ok(())
    }

    // ---- rsp_lock-guarded command/reply pairs ----------------------------

    fn send_cmd_recv(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        log::trace!("send_cmd_recv: acquiring rsp_lock for {:?}", String::from_utf8_lossy(cmd));
        let _guard = self.rsp_lock.lock().unwrap();
        self.io.send(cmd)?;
        let reply = self.io.recv(None).ok_or(RspError::ConnectionReset)?;
        log::trace!(
            "send_cmd_recv: releasing rsp_lock, reply {:?}",
            String::from_utf8_lossy(&reply)
        );
        Ok(reply)
    }

    pub fn read_memory(&self, addr: u64, size: usize) -> Result<u64> {
        let cmd = format!("m{},{:x}", hex::hexaddr(addr, self.addr_size.bytes()), size);
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        hex::byte_order_int(&reply, self.endian()).ok_or_else(|| RspError::UnexpectedReply {
            context: "read_memory",
            reply: String::from_utf8_lossy(&reply).into_owned(),
        })
    }

    pub fn write_memory(&self, addr: u64, val: u64, size: usize) -> Result<()> {
        let data = hex::encode_sized_int(val, size, self.endian());
        let cmd = format!(
            "M{},{:x},{}",
            hex::hexaddr(addr, self.addr_size.bytes()),
            size,
            data
        );
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        if reply == b"OK" {
            Ok(())
        } else {
            Err(RspError::MemoryWrite { addr })
        }
    }

    pub fn read_register_by_name(&self, name: &str) -> Result<u64> {
        let desc = self
            .reg_layout
            .lookup(name)
            .cloned()
            .ok_or_else(|| RspError::RegisterUnknown { name: name.to_string() })?;
        let cmd = format!("p{:x}", desc.index);
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        if reply.first() == Some(&b'E') {
            return Err(RspError::RegisterRead {
                name: name.to_string(),
                index: desc.index,
                reply: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
        hex::byte_order_int(&reply, self.endian()).ok_or_else(|| RspError::RegisterRead {
            name: name.to_string(),
            index: desc.index,
            reply: String::from_utf8_lossy(&reply).into_owned(),
        })
    }

    pub fn write_register_by_name(&self, name: &str, val: u64) -> Result<()> {
        let desc = self
            .reg_layout
            .lookup(name)
            .cloned()
            .ok_or_else(|| RspError::RegisterUnknown { name: name.to_string() })?;
        let data = hex::encode_sized_int(val, desc.size_bytes as usize, self.endian());
        let cmd = format!("P{:x}={}", desc.index, data);
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        if reply == b"OK" {
            Ok(())
        } else {
            Err(RspError::UnexpectedReply {
                context: "write_register",
                reply: String::from_utf8_lossy(&reply).into_owned(),
            })
        }
    }

    // ---- breakpoints/watchpoints ------------------------------------------

    fn set_bp(&self, kind: BreakpointKind, addr: u64, watch_size: u32) -> Result<()> {
        let size = kind.set_size_arg(watch_size);
        let cmd = format!(
            "Z{},{},{:x}",
            kind.wire_code(),
            hex::hexaddr(addr, self.addr_size.bytes()),
            size
        );
        log::debug!("set_bp: {kind:?} at {addr:#x}");
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        if reply == b"OK" {
            Ok(())
        } else {
            log::warn!("set_bp: {kind:?} at {addr:#x} rejected: {:?}", String::from_utf8_lossy(&reply));
            Err(RspError::BreakpointSet {
                kind,
                addr,
                reply: String::from_utf8_lossy(&reply).into_owned(),
            })
        }
    }

    fn remove_bp(&self, kind: BreakpointKind, addr: u64, watch_size: u32) -> Result<()> {
        let size = kind.set_size_arg(watch_size);
        let cmd = format!(
            "z{},{},{:x}",
            kind.wire_code(),
            hex::hexaddr(addr, self.addr_size.bytes()),
            size
        );
        log::debug!("remove_bp: {kind:?} at {addr:#x}");
        let reply = self.send_cmd_recv(cmd.as_bytes())?;
        if reply == b"OK" {
            Ok(())
        } else {
            log::warn!("remove_bp: {kind:?} at {addr:#x} rejected: {:?}", String::from_utf8_lossy(&reply));
            Err(RspError::BreakpointRemove {
                kind,
                addr,
                reply: String::from_utf8_lossy(&reply).into_owned(),
            })
        }
    }

    pub fn set_sw_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_bp(BreakpointKind::SwExec, addr, 0)
    }

    /// Remove the software breakpoint at `addr`. If called from a
    /// callback worker and `addr` is the currently-hit PC, marks
    /// `callback_unset_bp` so the event thread's step-and-rearm dance is
    /// skipped (spec.md §4.2 "Breakpoint removal from within a callback").
    pub fn remove_sw_breakpoint(&self, addr: u64) -> Result<()> {
        if is_callback_worker() {
            if let Ok(pc) = self.read_register_by_name("pc") {
                if pc == addr {
                    self.state.lock().unwrap().callback_unset_bp = true;
                }
            }
        }
        self.remove_bp(BreakpointKind::SwExec, addr, 0)
    }

    pub fn set_hw_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_bp(BreakpointKind::HwExec, addr, 0)
    }

    pub fn remove_hw_breakpoint(&self, addr: u64) -> Result<()> {
        self.remove_bp(BreakpointKind::HwExec, addr, 0)
    }

    pub fn set_watchpoint(&self, kind: BreakpointKind, addr: u64, size: u32) -> Result<()> {
        self.set_bp(kind, addr, size)
    }

    pub fn remove_watchpoint(&self, kind: BreakpointKind, addr: u64, size: u32) -> Result<()> {
        self.remove_bp(kind, addr, size)
    }

    // ---- execution commands -----------------------------------------------

    /// Returns `Err` if the calling thread may not drive execution at
    /// all; otherwise `Ok(is_owner)`.
    fn guard_thread(&self, cmd: &'static str) -> Result<bool> {
        if is_callback_worker() {
            return Err(RspError::ExecutionDisallowed {
                cmd,
                reason: "callbacks may not drive target execution",
            });
        }
        let cur = thread::current().id();
        let is_owner = cur == self.owner_thread;
        let is_event = *self.event_thread_id.lock().unwrap() == Some(cur);
        if !is_owner && !is_event {
            return Err(RspError::NotOwningThread);
        }
        Ok(is_owner)
    }

    fn acquire_event_lock_when_stop_queue_empty(&self) -> MutexGuard<'_, ()> {
        loop {
            let guard = self.event_lock.lock().unwrap();
            if self.io.stop_queue_is_empty() {
                return guard;
            }
            drop(guard);
            thread::sleep(EVENT_POLL);
        }
    }

    pub fn cmd_continue(&self) -> Result<()> {
        let is_owner = self.guard_thread("continue")?;
        {
            let state = self.state.lock().unwrap();
            if !state.target_is_stopped {
                log::trace!("cmd_continue: already running, no-op");
                return Ok(());
            }
            if !is_owner && state.user_stopped {
                log::trace!("cmd_continue: user-stopped and not owner, no-op");
                return Ok(());
            }
        }

        let saved = self.state.lock().unwrap().saved_bp;
        if saved.is_some() {
            log::debug!("cmd_continue: stepping over saved breakpoint before resuming");
            self.cmd_step()?;
        }
        self.state.lock().unwrap().user_stopped = false;

        log::debug!("cmd_continue: acquiring event_lock (owner={is_owner})");
        let _event_guard = if is_owner {
            Some(self.event_lock.lock().unwrap())
        } else {
            None
        };
        {
            let _rsp_guard = self.rsp_lock.lock().unwrap();
            self.state.lock().unwrap().target_is_stopped = false;
            self.io.send(b"vCont;c")?;
        }
        log::debug!("cmd_continue: releasing event_lock");
        Ok(())
    }

    pub fn cmd_step(&self) -> Result<()> {
        let is_owner = self.guard_thread("step")?;
        {
            let state = self.state.lock().unwrap();
            if !state.target_is_stopped {
                log::trace!("cmd_step: already running, no-op");
                return Ok(());
            }
            if !is_owner && state.user_stopped {
                log::trace!("cmd_step: user-stopped and not owner, no-op");
                return Ok(());
            }
        }

        log::debug!("cmd_step: acquiring event_lock (owner={is_owner})");
        let _event_guard = if is_owner {
            Some(self.acquire_event_lock_when_stop_queue_empty())
        } else {
            None
        };

        {
            let _rsp_guard = self.rsp_lock.lock().unwrap();
            self.io.send(b"vCont;s")?;
        }
        // The step may itself report completion via a stop packet; it
        // carries no information we act on here, so it's drained and
        // discarded.
        let _ = self.io.recv_stop(Duration::from_secs(1));

        if let Ok(pc) = self.read_register_by_name("pc") {
            self.dispatch_event(EventKind::Execute, pc);
        }

        let saved = self.state.lock().unwrap().saved_bp.take();
        if let Some(addr) = saved {
            log::debug!("cmd_step: re-arming saved breakpoint at {addr:#x}");
            let _ = self.set_sw_breakpoint(addr);
        }
        log::debug!("cmd_step: releasing event_lock");
        Ok(())
    }

    pub fn cmd_stop(&self) -> Result<()> {
        self.guard_thread("stop")?;
        self.state.lock().unwrap().user_stopped = true;
        if self.state.lock().unwrap().target_is_stopped {
            log::trace!("cmd_stop: already stopped, no-op");
            return Ok(());
        }
        log::debug!("cmd_stop: acquiring event_lock");
        let _event_guard = self.event_lock.lock().unwrap();
        let _rsp_guard = self.rsp_lock.lock().unwrap();
        self.state.lock().unwrap().target_is_stopped = true;
        self.io.send(b"vCtrlC")?;
        log::debug!("cmd_stop: releasing event_lock");
        Ok(())
    }

    // ---- event dispatch -----------------------------------------------------

    fn dispatch_event(&self, kind: EventKind, addr: u64) {
        let slot = match kind {
            EventKind::Read => &self.on_read,
            EventKind::Write => &self.on_write,
            EventKind::Access => &self.on_access,
            EventKind::Execute => &self.on_execute,
        };
        let guard = slot.lock().unwrap();
        if let Some(f) = guard.as_ref() {
            f(addr);
        }
    }

    fn query_stop_reason(&self) -> Option<Vec<u8>> {
        let _rsp_guard = self.rsp_lock.lock().unwrap();
        self.io.send(b"?").ok()?;
        self.io.recv_stop_blocking()
    }

    /// The stop-event thread's handling of one stop-reply packet: classify
    /// it, dispatch the corresponding event (re-arming/saving the software
    /// breakpoint as needed per spec.md §4.2's seven-step sequence), then
    /// resume unless the stop was user-initiated.
    fn handle_stop_event(&self, packet: &[u8]) {
        self.state.lock().unwrap().target_is_stopped = true;

        // A preliminary classification with no secondary reply maps any
        // SIGTRAP straight to SwBreak (event::classify_stop's documented
        // fallback) and anything else to its final answer; this doubles as
        // the signal-is-SIGTRAP test that decides whether a secondary `?`
        // query is worth issuing.
        let prelim = event::classify_stop(packet, None);
        let (reason, secondary) = if prelim == Some(StopReason::SwBreak) {
            let secondary = self.query_stop_reason();
            (
                event::classify_stop(packet, secondary.as_deref()),
                secondary,
            )
        } else {
            (prelim, None)
        };

        match reason {
            Some(reason) => {
                if let Some(kind) = reason.event_kind() {
                    let addr = match reason {
                        StopReason::SwBreak | StopReason::HwBreak => {
                            self.read_register_by_name("pc").ok()
                        }
                        StopReason::ReadWatch | StopReason::WriteWatch | StopReason::AccessWatch => {
                            secondary
                                .as_deref()
                                .and_then(event::parse_watch_addr)
                                .or_else(|| self.read_register_by_name("pc").ok())
                        }
                        StopReason::UserInterrupt => None,
                    };

                    if let Some(addr) = addr {
                        if reason == StopReason::SwBreak {
                            self.state.lock().unwrap().callback_unset_bp = false;
                            let _ = self.remove_sw_breakpoint(addr);
                        }

                        self.dispatch_event(kind, addr);

                        if reason == StopReason::SwBreak
                            && !self.state.lock().unwrap().callback_unset_bp
                        {
                            self.state.lock().unwrap().saved_bp = Some(addr);
                        }
                    }
                }
                let _ = self.cmd_continue();
            }
            None => {
                log::warn!(
                    "unrecognized stop reason in {:?}; leaving target stopped",
                    String::from_utf8_lossy(packet)
                );
            }
        }
    }

    fn event_loop(self: Arc<Self>) {
        *self.event_thread_id.lock().unwrap() = Some(thread::current().id());
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let guard = self.event_lock.lock().unwrap();
            match self.io.recv_stop(EVENT_POLL) {
                Some(packet) => {
                    self.handle_stop_event(&packet);
                    drop(guard);
                }
                None => {
                    drop(guard);
                    thread::sleep(EVENT_POLL);
                }
            }
        }
    }
}

/// Discover the register layout by walking `target.xml`'s `xi:include`s
/// (spec.md §4.2's register-layout discovery algorithm). Falls back to
/// treating `target.xml` itself as a feature document when it carries no
/// includes, so that stubs which inline their `<reg>` elements directly
/// are still discovered correctly.
fn discover_register_layout(io: &PacketIO) -> Result<RegisterLayout> {
    let target_xml = qxfer_read_once(io, "target.xml")?;
    let hrefs = regs::parse_xi_includes(&target_xml);

    if hrefs.is_empty() {
        return Ok(RegisterLayout::from_feature_xml([target_xml.as_str()]));
    }

    let mut docs = Vec::with_capacity(hrefs.len());
    for href in hrefs {
        docs.push(qxfer_read_chunked(io, &href)?);
    }
    let doc_refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    Ok(RegisterLayout::from_feature_xml(doc_refs))
}

fn qxfer_read_once(io: &PacketIO, annex: &str) -> Result<String> {
    io.send(format!("qXfer:features:read:{annex}:0,ffb").as_bytes())?;
    let reply = io.recv(None).ok_or(RspError::ConnectionReset)?;
    if reply.is_empty() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&reply[1..]).into_owned())
}

fn qxfer_read_chunked(io: &PacketIO, annex: &str) -> Result<String> {
    let mut content = String::new();
    let mut offset: usize = 0;
    loop {
        let cmd = format!("qXfer:features:read:{annex}:{offset:x},ffb");
        io.send(cmd.as_bytes())?;
        let reply = io.recv(None).ok_or(RspError::ConnectionReset)?;
        if reply.is_empty() {
            break;
        }
        let is_last = reply[0] == b'l';
        let body = &reply[1..];
        content.push_str(&String::from_utf8_lossy(body));
        offset += body.len();
        if is_last || content.ends_with("</feature>") {
            break;
        }
    }
    Ok(content)
}

impl Backend for RspTarget {
    fn get_reg(&self, name: &str) -> Result<u64> {
        self.read_register_by_name(name)
    }

    fn write_reg(&self, name: &str, val: u64) -> Result<()> {
        self.write_register_by_name(name, val)
    }

    fn read_uint8(&self, addr: u64) -> Result<u8> {
        Ok(self.read_memory(addr, 1)? as u8)
    }
    fn read_uint16(&self, addr: u64) -> Result<u16> {
        Ok(self.read_memory(addr, 2)? as u16)
    }
    fn read_uint32(&self, addr: u64) -> Result<u32> {
        Ok(self.read_memory(addr, 4)? as u32)
    }
    fn read_uint64(&self, addr: u64) -> Result<u64> {
        self.read_memory(addr, 8)
    }

    fn write_uint8(&self, addr: u64, val: u8) -> Result<()> {
        self.write_memory(addr, val as u64, 1)
    }
    fn write_uint16(&self, addr: u64, val: u16) -> Result<()> {
        self.write_memory(addr, val as u64, 2)
    }
    fn write_uint32(&self, addr: u64, val: u32) -> Result<()> {
        self.write_memory(addr, val as u64, 4)
    }
    fn write_uint64(&self, addr: u64, val: u64) -> Result<()> {
        self.write_memory(addr, val, 8)
    }

    fn run(&self) -> Result<()> {
        self.cmd_continue()
    }
    fn stop(&self) -> Result<()> {
        self.cmd_stop()
    }
    fn step(&self) -> Result<()> {
        self.cmd_step()
    }
    fn shutdown(&self) -> Result<()> {
        self.close()
    }
    fn target_is_running(&self) -> bool {
        !self.state.lock().unwrap().target_is_stopped
    }

    // The Backend façade exposes only `addr` for watchpoints (spec.md
    // §4.4); the watch size defaults to the target's pointer width, which
    // a `Target`-level watchpoint helper can always override by going
    // through `RspTarget::set_watchpoint` directly.
    fn set_read_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_bp(BreakpointKind::ReadWatch, addr, self.addr_size.bytes() as u32)
    }
    fn del_read_breakpoint(&self, addr: u64) -> Result<()> {
        self.remove_bp(BreakpointKind::ReadWatch, addr, self.addr_size.bytes() as u32)
    }
    fn set_write_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_bp(BreakpointKind::WriteWatch, addr, self.addr_size.bytes() as u32)
    }
    fn del_write_breakpoint(&self, addr: u64) -> Result<()> {
        self.remove_bp(BreakpointKind::WriteWatch, addr, self.addr_size.bytes() as u32)
    }
    fn set_access_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_bp(BreakpointKind::AccessWatch, addr, self.addr_size.bytes() as u32)
    }
    fn del_access_breakpoint(&self, addr: u64) -> Result<()> {
        self.remove_bp(BreakpointKind::AccessWatch, addr, self.addr_size.bytes() as u32)
    }
    fn set_exec_breakpoint(&self, addr: u64) -> Result<()> {
        self.set_sw_breakpoint(addr)
    }
    fn del_exec_breakpoint(&self, addr: u64) -> Result<()> {
        self.remove_sw_breakpoint(addr)
    }

    fn set_on_read_callback(&self, cb: EventCallback) {
        *self.on_read.lock().unwrap() = Some(cb);
    }
    fn set_on_write_callback(&self, cb: EventCallback) {
        *self.on_write.lock().unwrap() = Some(cb);
    }
    fn set_on_access_callback(&self, cb: EventCallback) {
        *self.on_access.lock().unwrap() = Some(cb);
    }
    fn set_on_execute_callback(&self, cb: EventCallback) {
        *self.on_execute.lock().unwrap() = Some(cb);
    }

    fn endian(&self) -> Endian {
        *self.endian.lock().unwrap()
    }
    fn set_endian(&self, endian: Endian) {
        *self.endian.lock().unwrap() = endian;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn callback_worker_marker_is_thread_local() {
        assert!(!is_callback_worker());
        let handle = thread::spawn(|| {
            mark_current_thread_as_callback_worker();
            is_callback_worker()
        });
        assert!(handle.join().unwrap());
        assert!(!is_callback_worker());
    }

    /// Build an `RspTarget` directly over a connected `PacketIO`, bypassing
    /// `connect`'s handshake -- these tests only exercise commands that
    /// don't depend on feature negotiation or register discovery having
    /// already happened, so scripting that handshake would only add noise.
    fn test_target(io: PacketIO, initially_stopped: bool, saved_bp: Option<u64>) -> RspTarget {
        RspTarget {
            io,
            reg_layout: RegisterLayout::from_feature_xml([
                r#"<feature><reg name="pc" bitsize="32" regnum="0"/></feature>"#,
            ]),
            addr_size: AddrSize::Four,
            endian: Mutex::new(Endian::Little),
            owner_thread: thread::current().id(),
            event_thread_id: Mutex::new(None),
            event_thread_handle: Mutex::new(None),
            rsp_lock: Mutex::new(()),
            event_lock: Mutex::new(()),
            state: Mutex::new(TargetState {
                target_is_stopped: initially_stopped,
                saved_bp,
                ..Default::default()
            }),
            shutdown: AtomicBool::new(false),
            on_read: Mutex::new(None),
            on_write: Mutex::new(None),
            on_access: Mutex::new(None),
            on_execute: Mutex::new(None),
        }
    }

    fn listener_and_io() -> (TcpListener, PacketIO) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let io = PacketIO::connect("127.0.0.1", port).unwrap();
        (listener, io)
    }

    fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(&crate::packet::make_packet(payload)).unwrap();
    }

    /// Read the next complete frame's payload, leaving trailing bytes in
    /// `buf` for the next call.
    fn recv_payload(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
        let mut scratch = [0u8; 4096];
        loop {
            if let Some((payload, consumed)) = crate::packet::extract_frame(buf) {
                buf.drain(..consumed);
                return String::from_utf8_lossy(&payload).into_owned();
            }
            let n = stream.read(&mut scratch).unwrap();
            assert!(n > 0, "stub connection closed early");
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    /// Like [`recv_payload`], but returns the literal `$...#cc` frame text
    /// (including checksum) so tests can assert on spec.md §8's exact
    /// wire-format examples.
    fn recv_raw_frame(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
        let mut scratch = [0u8; 4096];
        loop {
            if let Some((_, consumed)) = crate::packet::extract_frame(buf) {
                let frame: Vec<u8> = buf[..consumed].to_vec();
                buf.drain(..consumed);
                return String::from_utf8_lossy(&frame).into_owned();
            }
            let n = stream.read(&mut scratch).unwrap();
            assert!(n > 0, "stub connection closed early");
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    // ---- Invariant 5: callback/unrelated threads may not drive execution ---

    #[test]
    fn execution_command_from_callback_worker_is_disallowed() {
        let (listener, io) = listener_and_io();
        let accept = thread::spawn(move || listener.accept().unwrap());
        let target = Arc::new(test_target(io, true, None));

        let t = Arc::clone(&target);
        let result = thread::spawn(move || {
            mark_current_thread_as_callback_worker();
            t.cmd_continue()
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(RspError::ExecutionDisallowed { .. })));
        accept.join().unwrap();
    }

    #[test]
    fn execution_command_from_unrelated_thread_is_not_owning() {
        let (listener, io) = listener_and_io();
        let accept = thread::spawn(move || listener.accept().unwrap());
        let target = Arc::new(test_target(io, true, None));

        let t = Arc::clone(&target);
        let result = thread::spawn(move || t.cmd_step()).join().unwrap();

        assert!(matches!(result, Err(RspError::NotOwningThread)));
        accept.join().unwrap();
    }

    // ---- spec.md §8 literal wire-format scenarios --------------------------

    #[test]
    fn write_memory_emits_literal_packet_from_spec() {
        let (listener, io) = listener_and_io();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            assert_eq!(recv_raw_frame(&mut stream, &mut buf), "$M11111111,1,01#bf");
            send_frame(&mut stream, b"OK");
        });

        let target = test_target(io, true, None);
        target.write_memory(0x11111111, 0x01, 1).unwrap();
        stub.join().unwrap();
    }

    #[test]
    fn write_memory_non_ok_reply_raises_memory_write_error() {
        let (listener, io) = listener_and_io();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let _ = recv_payload(&mut stream, &mut buf);
            send_frame(&mut stream, b"E01");
        });

        let target = test_target(io, true, None);
        let err = target.write_memory(0x11111111, 0x01, 1).unwrap_err();
        assert!(matches!(err, RspError::MemoryWrite { addr } if addr == 0x11111111));
        stub.join().unwrap();
    }

    #[test]
    fn set_sw_breakpoint_emits_literal_packet_from_spec() {
        let (listener, io) = listener_and_io();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            assert_eq!(recv_raw_frame(&mut stream, &mut buf), "$Z0,12345678,4#ba");
            send_frame(&mut stream, b"OK");
        });

        let target = test_target(io, true, None);
        target.set_sw_breakpoint(0x12345678).unwrap();
        stub.join().unwrap();
    }

    // ---- "a second identical cmd_stop ... sends no packet" -----------------

    #[test]
    fn second_cmd_stop_sends_no_packet() {
        let (listener, io) = listener_and_io();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            assert_eq!(recv_payload(&mut stream, &mut buf), "vCtrlC");
            assert!(buf.is_empty(), "unexpected leftover bytes after vCtrlC: {buf:?}");

            stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            let mut scratch = [0u8; 64];
            match stream.read(&mut scratch) {
                Ok(0) => {}
                Ok(n) => panic!("second cmd_stop sent extra bytes: {:?}", &scratch[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => panic!("unexpected read error: {e}"),
            }
        });

        let target = test_target(io, false, None);
        target.cmd_stop().unwrap();
        target.cmd_stop().unwrap();

        stub.join().unwrap();
    }

    // ---- "cmd_step drains at most one stop packet and re-arms saved_bp
    // exactly once" ----------------------------------------------------------

    #[test]
    fn cmd_step_drains_at_most_one_stop_packet_and_rearms_once() {
        let (listener, io) = listener_and_io();
        let stub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();

            assert_eq!(recv_payload(&mut stream, &mut buf), "vCont;s");
            // Two stop replies land back-to-back; cmd_step must drain only
            // the first and leave the second for the next consumer.
            send_frame(&mut stream, b"S05");
            send_frame(&mut stream, b"S05");

            assert_eq!(recv_payload(&mut stream, &mut buf), "p0");
            send_frame(&mut stream, b"00100000"); // pc == 0x1000, little-endian

            assert_eq!(recv_payload(&mut stream, &mut buf), "Z0,00001000,4");
            send_frame(&mut stream, b"OK");
        });

        let target = test_target(io, true, Some(0x1000));
        target.cmd_step().unwrap();

        assert!(
            target.state.lock().unwrap().saved_bp.is_none(),
            "cmd_step must clear saved_bp after re-arming it exactly once"
        );
        assert!(
            !target.io.stop_queue_is_empty(),
            "the second stop reply should still be queued, not drained by cmd_step"
        );
        assert!(target.io.recv_stop(Duration::from_millis(200)).is_some());

        stub.join().unwrap();
    }
}
