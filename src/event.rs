//! Event kinds dispatched to user callbacks, and stop-reply classification.

/// The four kinds of event a user callback can be registered against.
/// Distinct from [`BreakpointKind`](crate::breakpoint::BreakpointKind):
/// `Execute` events are triggered by either `SwExec` or `HwExec`
/// breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Read,
    Write,
    Access,
    Execute,
}

/// Signal numbers RSP stop replies carry in their `T<nn>` field.
mod signal {
    pub const SIGINT: u32 = 2;
    pub const SIGTRAP: u32 = 5;
}

/// The reason a `SIGTRAP`-class stop occurred, as far as this crate can
/// determine from the stop reply alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A user-initiated stop (`vCtrlC`); not a breakpoint hit.
    UserInterrupt,
    SwBreak,
    HwBreak,
    ReadWatch,
    WriteWatch,
    AccessWatch,
}

impl StopReason {
    /// The [`EventKind`] a breakpoint hit with this reason should dispatch
    /// to. `None` for stops that aren't breakpoint/watchpoint hits.
    pub fn event_kind(self) -> Option<EventKind> {
        match self {
            StopReason::SwBreak | StopReason::HwBreak => Some(EventKind::Execute),
            StopReason::ReadWatch => Some(EventKind::Read),
            StopReason::WriteWatch => Some(EventKind::Write),
            StopReason::AccessWatch => Some(EventKind::Access),
            StopReason::UserInterrupt => None,
        }
    }
}

/// Parse the two-digit signal code out of a `T<nn>...`/`S<nn>` stop reply.
/// Returns `None` if `packet` isn't signal-shaped.
fn parse_signal_code(packet: &[u8]) -> Option<u32> {
    if packet.len() < 3 {
        return None;
    }
    if packet[0] != b'T' && packet[0] != b'S' {
        return None;
    }
    std::str::from_utf8(&packet[1..3]).ok()?.parse().ok()
}

/// Classify a stop-reply packet. `secondary_query` is the reply to the
/// follow-up `?` query RspTarget issues on a SIGTRAP to disambiguate
/// breakpoint vs. watchpoint; it carries the `swbreak`/`hwbreak`/`watch`/
/// `rwatch`/`awatch` annotation fields a modern stub appends per the RSP
/// stop-reply grammar.
///
/// Returns `None` for a signal this crate doesn't classify (logged and
/// left stopped by the caller, per spec.md §4.2).
pub fn classify_stop(packet: &[u8], secondary_query: Option<&[u8]>) -> Option<StopReason> {
    let code = parse_signal_code(packet)?;

    if code == signal::SIGINT {
        return Some(StopReason::UserInterrupt);
    }

    if code != signal::SIGTRAP {
        return None;
    }

    // Without a secondary query we can't disambiguate further; fall back
    // to the historical default of treating any SIGTRAP as a software
    // breakpoint hit.
    let reply = match secondary_query {
        Some(r) => r,
        None => return Some(StopReason::SwBreak),
    };

    // `rwatch:`/`awatch:` must be checked before the bare `watch:` check:
    // `"watch:"` is itself a substring of both, so checking it first would
    // misclassify every read/access watchpoint as a write watchpoint.
    if has_field(reply, b"rwatch:") {
        Some(StopReason::ReadWatch)
    } else if has_field(reply, b"awatch:") {
        Some(StopReason::AccessWatch)
    } else if has_field(reply, b"watch:") {
        Some(StopReason::WriteWatch)
    } else if has_field(reply, b"hwbreak") {
        Some(StopReason::HwBreak)
    } else {
        // Either an explicit `swbreak` annotation, or no annotation at
        // all (older stubs) -- both mean software breakpoint.
        Some(StopReason::SwBreak)
    }
}

fn has_field(reply: &[u8], field: &[u8]) -> bool {
    reply.windows(field.len()).any(|w| w == field)
}

/// Extract the address out of a `watch:<addr>;`/`rwatch:<addr>;`/
/// `awatch:<addr>;` annotation field in a stop reply, if present.
pub fn parse_watch_addr(reply: &[u8]) -> Option<u64> {
    for field in [&b"rwatch:"[..], b"awatch:", b"watch:"] {
        if let Some(pos) = reply
            .windows(field.len())
            .position(|w| w == field)
        {
            let rest = &reply[pos + field.len()..];
            let end = rest.iter().position(|&b| b == b';').unwrap_or(rest.len());
            let digits = std::str::from_utf8(&rest[..end]).ok()?;
            return u64::from_str_radix(digits, 16).ok();
        }
    }
    None
}
