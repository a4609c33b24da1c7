//! Modbus TCP Codec
//!
//! Bit-exact encoding and decoding of Modbus TCP application data units:
//! a 7-byte MBAP header followed by a function-code PDU. Only function codes
//! 1-6 are understood; anything else degrades to an exception reply.

mod frame;
mod pdu;

pub use frame::*;
pub use pdu::*;
