//! TCP connection-state tracking
//!
//! Classic conntrack semantics: the balancer owns neither endpoint's
//! socket, so session state is inferred purely from observed control bits.
//! `next_state` is a pure lookup over (state, direction, flag class); the
//! caller applies side effects (timer rescheduling, counters) when a
//! transition lands.

use std::time::Duration;

/// Tracked TCP session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpState {
    /// No packets seen yet
    None = 0,
    /// SYN seen from the client
    SynSent = 1,
    /// SYN-ACK seen from the server
    SynRecv = 2,
    /// Three-way handshake completed
    Established = 3,
    /// FIN seen, waiting for the close to progress
    FinWait = 4,
    /// Peer closed, local side still open
    CloseWait = 5,
    /// Final ACK outstanding
    LastAck = 6,
    /// Waiting out 2*MSL
    TimeWait = 7,
    /// Fully closed
    Close = 8,
    /// Simultaneous open: SYNs crossed on the wire
    SynSent2 = 9,
}

/// Number of tracked states
pub const TCP_STATE_COUNT: usize = 10;

/// Packet direction relative to the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dir {
    /// Client toward the virtual service
    Original = 0,
    /// Real server back toward the client
    Reply = 1,
}

/// Collapsed TCP control-bit class, by fixed precedence:
/// RST beats SYN, SYN(+ACK) beats FIN, FIN beats ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlagClass {
    /// SYN without ACK
    Syn = 0,
    /// SYN with ACK
    SynAck = 1,
    /// FIN (any ACK)
    Fin = 2,
    /// Bare ACK
    Ack = 3,
    /// RST
    Rst = 4,
    /// None of the above
    None = 5,
}

/// TCP header flag bits
pub mod flags {
    /// FIN control bit
    pub const FIN: u8 = 0x01;
    /// SYN control bit
    pub const SYN: u8 = 0x02;
    /// RST control bit
    pub const RST: u8 = 0x04;
    /// ACK control bit
    pub const ACK: u8 = 0x10;
}

impl FlagClass {
    /// Classify a raw TCP flags byte
    #[inline(always)]
    pub fn from_tcp_flags(bits: u8) -> Self {
        if bits & flags::RST != 0 {
            FlagClass::Rst
        } else if bits & flags::SYN != 0 {
            if bits & flags::ACK != 0 {
                FlagClass::SynAck
            } else {
                FlagClass::Syn
            }
        } else if bits & flags::FIN != 0 {
            FlagClass::Fin
        } else if bits & flags::ACK != 0 {
            FlagClass::Ack
        } else {
            FlagClass::None
        }
    }
}

/// Outcome of a state-machine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to (or stay in) a state
    To(TcpState),
    /// Packet is acceptable but changes nothing
    Ignore,
    /// Packet is not valid in this state; caller should drop or reset
    Invalid,
}

// Cell encoding for the transition table below.
const S_SS: u8 = TcpState::SynSent as u8;
const S_SR: u8 = TcpState::SynRecv as u8;
const S_ES: u8 = TcpState::Established as u8;
const S_FW: u8 = TcpState::FinWait as u8;
const S_CW: u8 = TcpState::CloseWait as u8;
const S_LA: u8 = TcpState::LastAck as u8;
const S_TW: u8 = TcpState::TimeWait as u8;
const S_CL: u8 = TcpState::Close as u8;
const S_S2: u8 = TcpState::SynSent2 as u8;
const S_IV: u8 = 0xFE;
const S_IG: u8 = 0xFF;

/// The conntrack transition table: [direction][flag class][current state].
///
/// Column order: None, SynSent, SynRecv, Established, FinWait, CloseWait,
/// LastAck, TimeWait, Close, SynSent2.
#[rustfmt::skip]
const TRANSITIONS: [[[u8; TCP_STATE_COUNT]; 6]; 2] = [
    [
        // ORIGINAL
        /*         sNO   sSS   sSR   sES   sFW   sCW   sLA   sTW   sCL   sS2 */
        /*syn*/   [S_SS, S_SS, S_IG, S_IG, S_IG, S_IG, S_IG, S_SS, S_SS, S_S2],
        /*synack*/[S_IV, S_IV, S_SR, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_SR],
        /*fin*/   [S_IV, S_IV, S_FW, S_FW, S_LA, S_LA, S_LA, S_TW, S_CL, S_IV],
        /*ack*/   [S_ES, S_IV, S_ES, S_ES, S_CW, S_CW, S_TW, S_TW, S_CL, S_IV],
        /*rst*/   [S_IV, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL],
        /*none*/  [S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV],
    ],
    [
        // REPLY
        /*         sNO   sSS   sSR   sES   sFW   sCW   sLA   sTW   sCL   sS2 */
        /*syn*/   [S_IV, S_S2, S_IV, S_IV, S_IV, S_IV, S_IV, S_SS, S_IV, S_S2],
        /*synack*/[S_IV, S_SR, S_IG, S_IG, S_IG, S_IG, S_IG, S_IG, S_IG, S_SR],
        /*fin*/   [S_IV, S_IV, S_FW, S_FW, S_LA, S_LA, S_LA, S_TW, S_CL, S_IV],
        /*ack*/   [S_IV, S_IG, S_SR, S_ES, S_CW, S_CW, S_TW, S_TW, S_CL, S_IG],
        /*rst*/   [S_IV, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL],
        /*none*/  [S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV],
    ],
];

#[inline(always)]
fn decode(cell: u8) -> Transition {
    match cell {
        S_IV => Transition::Invalid,
        S_IG => Transition::Ignore,
        n => Transition::To(match n {
            0 => TcpState::None,
            1 => TcpState::SynSent,
            2 => TcpState::SynRecv,
            3 => TcpState::Established,
            4 => TcpState::FinWait,
            5 => TcpState::CloseWait,
            6 => TcpState::LastAck,
            7 => TcpState::TimeWait,
            8 => TcpState::Close,
            _ => TcpState::SynSent2,
        }),
    }
}

/// Pure transition function over (state, direction, flag class)
#[inline(always)]
pub fn next_state(state: TcpState, dir: Dir, class: FlagClass) -> Transition {
    decode(TRANSITIONS[dir as usize][class as usize][state as usize])
}

impl TcpState {
    /// Idle timeout for a connection sitting in this state
    pub fn timeout(self) -> Duration {
        match self {
            TcpState::None => Duration::from_secs(10),
            TcpState::SynSent => Duration::from_secs(120),
            TcpState::SynRecv => Duration::from_secs(60),
            TcpState::Established => Duration::from_secs(5 * 24 * 3600),
            TcpState::FinWait => Duration::from_secs(120),
            TcpState::CloseWait => Duration::from_secs(60),
            TcpState::LastAck => Duration::from_secs(30),
            TcpState::TimeWait => Duration::from_secs(120),
            TcpState::Close => Duration::from_secs(10),
            TcpState::SynSent2 => Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_class_precedence() {
        use flags::*;
        assert_eq!(FlagClass::from_tcp_flags(RST | SYN | ACK), FlagClass::Rst);
        assert_eq!(FlagClass::from_tcp_flags(SYN | ACK), FlagClass::SynAck);
        assert_eq!(FlagClass::from_tcp_flags(SYN), FlagClass::Syn);
        assert_eq!(FlagClass::from_tcp_flags(FIN | ACK), FlagClass::Fin);
        assert_eq!(FlagClass::from_tcp_flags(ACK), FlagClass::Ack);
        assert_eq!(FlagClass::from_tcp_flags(0), FlagClass::None);
    }

    #[test]
    fn test_syn_retransmission_holds_state() {
        assert_eq!(
            next_state(TcpState::SynSent, Dir::Original, FlagClass::Syn),
            Transition::To(TcpState::SynSent)
        );
    }

    #[test]
    fn test_simultaneous_open() {
        assert_eq!(
            next_state(TcpState::SynSent, Dir::Reply, FlagClass::Syn),
            Transition::To(TcpState::SynSent2)
        );
        assert_eq!(
            next_state(TcpState::SynSent2, Dir::Reply, FlagClass::SynAck),
            Transition::To(TcpState::SynRecv)
        );
    }

    #[test]
    fn test_rst_closes_from_anywhere_tracked() {
        for dir in [Dir::Original, Dir::Reply] {
            assert_eq!(
                next_state(TcpState::Established, dir, FlagClass::Rst),
                Transition::To(TcpState::Close)
            );
            assert_eq!(
                next_state(TcpState::SynSent, dir, FlagClass::Rst),
                Transition::To(TcpState::Close)
            );
        }
        // Nothing tracked yet: an RST out of nowhere is invalid.
        assert_eq!(
            next_state(TcpState::None, Dir::Original, FlagClass::Rst),
            Transition::Invalid
        );
    }

    #[test]
    fn test_reopen_from_close() {
        assert_eq!(
            next_state(TcpState::Close, Dir::Original, FlagClass::Syn),
            Transition::To(TcpState::SynSent)
        );
        assert_eq!(
            next_state(TcpState::TimeWait, Dir::Original, FlagClass::Syn),
            Transition::To(TcpState::SynSent)
        );
    }

    #[test]
    fn test_handshake_path() {
        assert_eq!(
            next_state(TcpState::None, Dir::Original, FlagClass::Syn),
            Transition::To(TcpState::SynSent)
        );
        assert_eq!(
            next_state(TcpState::SynSent, Dir::Reply, FlagClass::SynAck),
            Transition::To(TcpState::SynRecv)
        );
        assert_eq!(
            next_state(TcpState::SynRecv, Dir::Original, FlagClass::Ack),
            Transition::To(TcpState::Established)
        );
    }

    #[test]
    fn test_close_sequence() {
        assert_eq!(
            next_state(TcpState::Established, Dir::Original, FlagClass::Fin),
            Transition::To(TcpState::FinWait)
        );
        assert_eq!(
            next_state(TcpState::FinWait, Dir::Reply, FlagClass::Fin),
            Transition::To(TcpState::LastAck)
        );
        assert_eq!(
            next_state(TcpState::LastAck, Dir::Original, FlagClass::Ack),
            Transition::To(TcpState::TimeWait)
        );
    }

    #[test]
    fn test_ignore_cells() {
        assert_eq!(
            next_state(TcpState::Established, Dir::Original, FlagClass::Syn),
            Transition::Ignore
        );
        assert_eq!(
            next_state(TcpState::Established, Dir::Reply, FlagClass::SynAck),
            Transition::Ignore
        );
    }

    #[test]
    fn test_none_class_always_invalid() {
        for s in 0..TCP_STATE_COUNT as u8 {
            let state = match s {
                0 => TcpState::None,
                1 => TcpState::SynSent,
                2 => TcpState::SynRecv,
                3 => TcpState::Established,
                4 => TcpState::FinWait,
                5 => TcpState::CloseWait,
                6 => TcpState::LastAck,
                7 => TcpState::TimeWait,
                8 => TcpState::Close,
                _ => TcpState::SynSent2,
            };
            for dir in [Dir::Original, Dir::Reply] {
                assert_eq!(next_state(state, dir, FlagClass::None), Transition::Invalid);
            }
        }
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(TcpState::Established.timeout(), Duration::from_secs(432_000));
        assert_eq!(TcpState::SynSent.timeout(), Duration::from_secs(120));
        assert_eq!(TcpState::TimeWait.timeout(), Duration::from_secs(120));
        assert_eq!(TcpState::Close.timeout(), Duration::from_secs(10));
    }
}
