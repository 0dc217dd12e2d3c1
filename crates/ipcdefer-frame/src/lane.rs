//! Built-in lane IDs.
//!
//! Lanes 0-255 are reserved for built-in use.

/// Connection management (ping, pong, close).
pub const CONTROL: u16 = 0;

/// Request/response traffic, registrations and broadcasts.
pub const RPC: u16 = 1;

/// First lane ID free for application use.
pub const USER_LANE_START: u16 = 256;

/// Returns a human-readable name for a lane ID.
pub fn lane_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        RPC => "RPC",
        2..=255 => "RESERVED",
        _ => "USER",
    }
}

/// Returns true if the lane ID is in the reserved range.
pub fn is_reserved(id: u16) -> bool {
    id < USER_LANE_START
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_range() {
        assert_eq!(lane_name(CONTROL), "CONTROL");
        assert_eq!(lane_name(RPC), "RPC");
        assert_eq!(lane_name(17), "RESERVED");
        assert_eq!(lane_name(USER_LANE_START), "USER");
        assert!(is_reserved(RPC));
        assert!(!is_reserved(USER_LANE_START));
    }
}
