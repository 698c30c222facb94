//! Safelink is the Crazyflie's alternating-bit protocol on top of the radio's own ack/retry
//!  mechanism. Two toggle bits in the CRTP header's reserved field identify duplicates: the
//!  "up" bit for host-to-copter packets, the "down" bit for copter-to-host packets.
//!
//! ```ascii
//! header bit 3: up
//! header bit 2: down
//! ```

use crate::crtp::crtp_message::CrtpMessage;


pub const SAFELINK_ENABLE_REQUEST: [u8; 3] = [0xff, 0x05, 0x01];

/// The copter confirms safelink by echoing the request after the exchange status byte
pub fn is_safelink_confirmation(response: &[u8]) -> bool {
    response.len() == 4 && response[1..] == SAFELINK_ENABLE_REQUEST
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SafeLinkState {
    up: bool,
    down: bool,
}

impl Default for SafeLinkState {
    fn default() -> Self {
        SafeLinkState::new()
    }
}

impl SafeLinkState {
    pub fn new() -> SafeLinkState {
        SafeLinkState {
            up: false,
            down: true,
        }
    }

    pub fn up(&self) -> bool {
        self.up
    }

    pub fn down(&self) -> bool {
        self.down
    }

    fn link_bits(&self) -> u8 {
        ((self.up as u8) << 1) | (self.down as u8)
    }

    pub fn stamp(&self, message: &CrtpMessage) -> CrtpMessage {
        message.with_link_bits(self.link_bits())
    }

    /// Advances the toggle bits after an acknowledged exchange. The down bit only advances if
    ///  the copter actually sent a packet carrying the expected down bit - anything else is a
    ///  retransmission of a packet we already received.
    pub fn on_acknowledged(&mut self, received_header: Option<u8>) {
        self.up = !self.up;

        if let Some(header) = received_header {
            let received_down = header & 0x04 != 0;
            if received_down == self.down {
                self.down = !self.down;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::crtp::crtp_message::CrtpPort;
    use super::*;

    #[rstest]
    #[case::confirmed(&[0x01, 0xff, 0x05, 0x01], true)]
    #[case::other_status_byte(&[0x31, 0xff, 0x05, 0x01], true)]
    #[case::too_short(&[0x01, 0xff, 0x05], false)]
    #[case::too_long(&[0x01, 0xff, 0x05, 0x01, 0x00], false)]
    #[case::wrong_echo(&[0x01, 0xff, 0x05, 0x00], false)]
    #[case::nothing(&[], false)]
    fn test_confirmation(#[case] response: &[u8], #[case] expected: bool) {
        assert_eq!(is_safelink_confirmation(response), expected);
    }

    #[test]
    fn test_stamp_initial_bits() {
        let state = SafeLinkState::new();
        let msg = CrtpMessage::new(CrtpPort::Param, 1, vec![7]);

        // up=0, down=1
        assert_eq!(state.stamp(&msg).header(), 0x25);
        assert_eq!(state.stamp(&CrtpMessage::keep_alive()).header(), 0xf7);
    }

    #[test]
    fn test_up_flips_on_every_ack() {
        let mut state = SafeLinkState::new();
        for i in 0..6 {
            assert_eq!(state.up(), i % 2 == 1);
            state.on_acknowledged(None);
        }
    }

    #[test]
    fn test_down_stays_without_downlink_packet() {
        let mut state = SafeLinkState::new();
        state.on_acknowledged(None);
        state.on_acknowledged(None);
        assert!(state.down());
    }

    #[rstest]
    #[case::expected_bit(0x04, false)]
    #[case::duplicate(0x00, true)]
    fn test_down_flip_after_ack(#[case] received_bits: u8, #[case] down_after: bool) {
        let mut state = SafeLinkState::new();
        state.on_acknowledged(Some(0x20 | received_bits));
        assert_eq!(state.down(), down_after);
    }

    #[test]
    fn test_down_alternates_with_alternating_downlink() {
        let mut state = SafeLinkState::new();

        state.on_acknowledged(Some(0x24));
        assert!(!state.down());
        state.on_acknowledged(Some(0x24)); // retransmission
        assert!(!state.down());
        state.on_acknowledged(Some(0x20));
        assert!(state.down());
    }
}
