//! loraham-test-harness: a mock node simulator and scripted peers for
//! testing the LoRaHam harness without a real node.
//!
//! [`MockTnc`] accepts one link connection on a loopback port and answers
//! injected packets through a responder from [`responders`].

pub mod mock_tnc;
pub mod responders;

pub use mock_tnc::{MockTnc, Responder};
pub use responders::pkt_line;
