//! Breakpoint/watchpoint kinds and their RSP wire codes.

/// The five breakpoint/watchpoint kinds RSP's `Z`/`z` packets support.
/// Wire codes map 1:1 onto the `0..4` suffix of those packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    SwExec,
    HwExec,
    ReadWatch,
    WriteWatch,
    AccessWatch,
}

impl BreakpointKind {
    /// The numeral that follows `Z`/`z` on the wire for this kind.
    pub fn wire_code(self) -> u8 {
        match self {
            BreakpointKind::SwExec => 0,
            BreakpointKind::HwExec => 1,
            BreakpointKind::WriteWatch => 2,
            BreakpointKind::ReadWatch => 3,
            BreakpointKind::AccessWatch => 4,
        }
    }

    /// The `kind` argument of a `Z<n>,<addr>,<kind>` packet: `4` for the two
    /// exec breakpoint kinds (a fixed-size instruction word), or the
    /// caller-supplied watch size for watchpoints.
    pub fn set_size_arg(self, watch_size: u32) -> u32 {
        match self {
            BreakpointKind::SwExec => 4,
            BreakpointKind::HwExec => 0,
            BreakpointKind::ReadWatch | BreakpointKind::WriteWatch | BreakpointKind::AccessWatch => {
                watch_size
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_rsp_numbering() {
        assert_eq!(BreakpointKind::SwExec.wire_code(), 0);
        assert_eq!(BreakpointKind::HwExec.wire_code(), 1);
        assert_eq!(BreakpointKind::WriteWatch.wire_code(), 2);
        assert_eq!(BreakpointKind::ReadWatch.wire_code(), 3);
        assert_eq!(BreakpointKind::AccessWatch.wire_code(), 4);
    }
}
