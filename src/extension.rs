//! Extension transform chain
//!
//! Frames pass through an ordered chain of transforms: outgoing frames before
//! encoding, incoming frames (in reverse order) after decoding. A transform
//! declares which RSV bits it claims; the connection relaxes the decoder's
//! reserved-bit check accordingly.
//!
//! No extension ships with the crate; this is the hook point for
//! permessage-deflate and friends.

use crate::error::Result;
use crate::frame::Frame;

/// A per-connection frame transform negotiated during the handshake
pub trait Extension: Send {
    /// Token used in Sec-WebSocket-Extensions
    fn name(&self) -> &str;

    /// RSV bits this transform claims, packed as `frame::RSV1 | RSV2 | RSV3`
    fn rsv_claim(&self) -> u8;

    /// Transform an outgoing frame before it is encoded.
    ///
    /// May set claimed RSV bits and replace the payload.
    fn on_outgoing(&mut self, frame: &mut Frame) -> Result<()>;

    /// Transform an incoming frame after it has been decoded
    fn on_incoming(&mut self, frame: &mut Frame) -> Result<()>;
}

/// RSV bits permitted on the wire given the negotiated chain
pub(crate) fn claimed_rsv(chain: &[Box<dyn Extension>]) -> u8 {
    chain.iter().fold(0, |bits, ext| bits | ext.rsv_claim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, RSV1, RSV2};

    struct Claiming(u8);

    impl Extension for Claiming {
        fn name(&self) -> &str {
            "claiming"
        }

        fn rsv_claim(&self) -> u8 {
            self.0
        }

        fn on_outgoing(&mut self, frame: &mut Frame) -> Result<()> {
            frame.header.rsv1 = true;
            Ok(())
        }

        fn on_incoming(&mut self, _frame: &mut Frame) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn chain_claims_are_ored() {
        let chain: Vec<Box<dyn Extension>> =
            vec![Box::new(Claiming(RSV1)), Box::new(Claiming(RSV2))];
        assert_eq!(claimed_rsv(&chain), RSV1 | RSV2);
        assert_eq!(claimed_rsv(&[]), 0);
    }
}
