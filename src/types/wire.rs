//! Numeric codes shared with terminal firmware
//!
//! These values are a wire-compatibility contract. Codes below 50 originate on the
//! terminal; the 50 range is synthesized by the server when no terminal answer exists.

/// Reason byte carried in acknowledgment payloads
pub mod ack_reason {
    pub const ACK_GOOD: u8 = 0;
    pub const NAK_TCP_DOWN: u8 = 1;
    pub const SERVER_ACK_TIMED_OUT: u8 = 2;
}

/// Command response status
pub mod cmd_status {
    pub const GOOD: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const FAILED_NO_CURRENT_USERS: u8 = 3;
    pub const FAILED_CRC: u8 = 10;
    pub const UID_EXISTS: u8 = 20;

    // Synthesized server-side
    pub const CMD_ACK_TIMED_OUT: u8 = 50;
    pub const ROUTE_CLOSED: u8 = 51;
    pub const CMD_TIME_OUT: u8 = 52;
    pub const SENT_TO_INACTIVE_CLIENT: u8 = 53;
    pub const TOO_MANY_OUTSTANDING_COMMANDS: u8 = 54;
    pub const MALFORMED_RESPONSE: u8 = 55;

    /// Human readable name for logs.
    pub fn name(status: u8) -> &'static str {
        match status {
            GOOD => "GOOD",
            FAILED => "FAILED",
            FAILED_NO_CURRENT_USERS => "FAILED_NO_CURRENT_USERS",
            FAILED_CRC => "FAILED_CRC",
            UID_EXISTS => "UID_EXISTS",
            CMD_ACK_TIMED_OUT => "CMD_ACK_TIMED_OUT",
            ROUTE_CLOSED => "ROUTE_CLOSED",
            CMD_TIME_OUT => "CMD_TIME_OUT",
            SENT_TO_INACTIVE_CLIENT => "SENT_TO_INACTIVE_CLIENT",
            TOO_MANY_OUTSTANDING_COMMANDS => "TOO_MANY_OUTSTANDING_COMMANDS",
            MALFORMED_RESPONSE => "MALFORMED_RESPONSE",
            _ => "UNKNOWN",
        }
    }
}

/// Command type byte, first byte of a CMD payload
pub mod cmd_type {
    pub const DELETE_ALL_USERS: u8 = 1;
    pub const GET_ALL_USERS: u8 = 2;
    pub const DELETE_SPECIFIC_USER: u8 = 3;
    pub const DISCONNECT: u8 = 4;
    pub const ADD_USER: u8 = 6;
    pub const GET_ALL_USERS_AND_SYNC: u8 = 8;
    pub const SYNC: u8 = 9;
    pub const DISPLAY_MSG_LCD: u8 = 14;

    // Diagnostic builds only
    pub const ECHO: u8 = 100;
    pub const TIME_OUT_NEXT_PACKET: u8 = 101;
    pub const VOID: u8 = 102;
    pub const SEND_MULTI_PART_RSP: u8 = 103;
    pub const SEND_MULTI_PART_RSP_FAIL: u8 = 104;
    pub const ADD_USER_TO_FLASH: u8 = 105;
    pub const DELETE_SPECIFIC_USER_FLASH: u8 = 106;
    pub const SEND_TEST_LOGIN_PACKET: u8 = 107;
    pub const SET_DEVICE_ID_TEST: u8 = 108;
    pub const GET_DEVICE_ID_TEST: u8 = 109;
    pub const ACK_STRESS_TEST: u8 = 110;
}

/// FOTA sub-type, carried in both FOTA and FOTA_ACK payloads
pub mod fota_type {
    pub const START: u8 = 0;
    pub const START_ACK: u8 = 1;
    pub const META: u8 = 2;
    pub const META_ACK: u8 = 3;
    pub const FINAL: u8 = 4;
    pub const FINAL_ACK: u8 = 5;
    pub const FINAL_TEST_ONLY: u8 = 6;
    pub const FINAL_TEST_ACK: u8 = 7;
}

/// FOTA acknowledgment status
pub mod fota_status {
    pub const GOOD: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const TIMEDOUT: u8 = 2;
    pub const FAILED_SAME_FW: u8 = 3;
    pub const FAILED_CRC16: u8 = 4;
    pub const FAILED_CRC32: u8 = 5;
    pub const FAILED_REASON_UNKNOWN: u8 = 6;
}

/// Firmware transfer geometry
pub mod fota_layout {
    use crate::types::LARGE_PAYLOAD;

    pub const MAGIC_MARKER: u32 = 0x1337_BEEF;
    pub const SEGMENTS_PER_BLOCK: usize = 8;
    pub const SEGMENT_LEN: usize = LARGE_PAYLOAD;
    pub const BLOCK_LEN: usize = SEGMENTS_PER_BLOCK * SEGMENT_LEN;
    /// Versions at or above this are validation builds that must not be committed
    pub const VALIDATION_VERSION_MIN: u16 = 0xFF00;
}
