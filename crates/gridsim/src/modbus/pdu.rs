//! Function-code PDUs
//!
//! Bit payloads are packed MSB-first in 8-bit groups; register payloads are
//! big-endian 16-bit words.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use gridsim_types::PointType;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Most coils/inputs a single read may request
pub const MAX_READ_BITS: u16 = 2000;

/// Most registers a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;

// ─────────────────────────────────────────────────────────────────────────────
// Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(FunctionCode::ReadCoils),
            2 => Some(FunctionCode::ReadDiscreteInputs),
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            5 => Some(FunctionCode::WriteSingleCoil),
            6 => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Table a read function addresses
    pub fn read_table(self) -> Option<PointType> {
        match self {
            FunctionCode::ReadCoils => Some(PointType::Coil),
            FunctionCode::ReadDiscreteInputs => Some(PointType::DiscreteInput),
            FunctionCode::ReadHoldingRegisters => Some(PointType::HoldingRegister),
            FunctionCode::ReadInputRegisters => Some(PointType::InputRegister),
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => None,
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 1,
    IllegalDataAddress = 2,
    IllegalDataValue = 3,
    ServerDeviceFailure = 4,
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(ExceptionCode::IllegalFunction),
            2 => Some(ExceptionCode::IllegalDataAddress),
            3 => Some(ExceptionCode::IllegalDataValue),
            4 => Some(ExceptionCode::ServerDeviceFailure),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// A PDU that could not be understood
///
/// Always answered with an exception reply, never propagated further.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("function {function:#04x}: {reason} -> {exception}")]
pub struct DecodeError {
    /// Raw function code byte (0 when the PDU was empty)
    pub function: u8,
    pub exception: ExceptionCode,
    pub reason: &'static str,
}

impl DecodeError {
    fn new(function: u8, exception: ExceptionCode, reason: &'static str) -> Self {
        Self {
            function,
            exception,
            reason,
        }
    }

    /// The exception response this error maps to
    pub fn to_response(&self) -> Response {
        Response::Exception {
            function: self.function,
            code: self.exception,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded request PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Function codes 1-4
    Read {
        function: FunctionCode,
        address: u16,
        quantity: u16,
    },
    /// Function code 5
    WriteSingleCoil { address: u16, value: bool },
    /// Function code 6
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::Read { function, .. } => *function,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Request::Read { address, .. }
            | Request::WriteSingleCoil { address, .. }
            | Request::WriteSingleRegister { address, .. } => *address,
        }
    }
}

/// Decode a request PDU
pub fn decode_request(pdu: &[u8]) -> Result<Request, DecodeError> {
    let Some((&raw_function, mut body)) = pdu.split_first() else {
        return Err(DecodeError::new(0, ExceptionCode::IllegalFunction, "empty PDU"));
    };
    let function = FunctionCode::from_u8(raw_function).ok_or_else(|| {
        DecodeError::new(raw_function, ExceptionCode::IllegalFunction, "unsupported function")
    })?;
    if body.len() != 4 {
        return Err(DecodeError::new(
            raw_function,
            ExceptionCode::IllegalFunction,
            "malformed PDU",
        ));
    }
    let address = body.get_u16();
    let operand = body.get_u16();

    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            if operand == 0 || operand > MAX_READ_BITS {
                return Err(DecodeError::new(
                    raw_function,
                    ExceptionCode::IllegalDataValue,
                    "quantity out of range",
                ));
            }
            Ok(Request::Read {
                function,
                address,
                quantity: operand,
            })
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            if operand == 0 || operand > MAX_READ_REGISTERS {
                return Err(DecodeError::new(
                    raw_function,
                    ExceptionCode::IllegalDataValue,
                    "quantity out of range",
                ));
            }
            Ok(Request::Read {
                function,
                address,
                quantity: operand,
            })
        }
        FunctionCode::WriteSingleCoil => {
            let value = match operand {
                0xFF00 => true,
                0x0000 => false,
                _ => {
                    return Err(DecodeError::new(
                        raw_function,
                        ExceptionCode::IllegalDataValue,
                        "coil value must be 0xFF00 or 0x0000",
                    ));
                }
            };
            Ok(Request::WriteSingleCoil { address, value })
        }
        FunctionCode::WriteSingleRegister => Ok(Request::WriteSingleRegister {
            address,
            value: operand,
        }),
    }
}

/// Encode a request PDU (client side)
pub fn encode_request(request: &Request) -> BytesMut {
    let mut dst = BytesMut::with_capacity(5);
    dst.put_u8(request.function().code());
    match *request {
        Request::Read {
            address, quantity, ..
        } => {
            dst.put_u16(address);
            dst.put_u16(quantity);
        }
        Request::WriteSingleCoil { address, value } => {
            dst.put_u16(address);
            dst.put_u16(if value { 0xFF00 } else { 0x0000 });
        }
        Request::WriteSingleRegister { address, value } => {
            dst.put_u16(address);
            dst.put_u16(value);
        }
    }
    dst
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// A response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Function codes 1 and 2
    Bits {
        function: FunctionCode,
        values: Vec<bool>,
    },
    /// Function codes 3 and 4
    Registers {
        function: FunctionCode,
        values: Vec<u16>,
    },
    /// Echo of function code 5
    WriteSingleCoil { address: u16, value: bool },
    /// Echo of function code 6
    WriteSingleRegister { address: u16, value: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Response::Exception { function, code }
    }

    /// Raw function code byte as it appears on the wire
    pub fn function_byte(&self) -> u8 {
        match self {
            Response::Bits { function, .. } | Response::Registers { function, .. } => {
                function.code()
            }
            Response::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil.code(),
            Response::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.code(),
            Response::Exception { function, .. } => function | 0x80,
        }
    }
}

/// Encode a response PDU
pub fn encode_response(response: &Response) -> BytesMut {
    let mut dst = BytesMut::new();
    dst.put_u8(response.function_byte());
    match response {
        Response::Bits { values, .. } => {
            let packed = pack_bits(values);
            dst.put_u8(packed.len() as u8);
            dst.put_slice(&packed);
        }
        Response::Registers { values, .. } => {
            dst.put_u8((values.len() * 2) as u8);
            for value in values {
                dst.put_u16(*value);
            }
        }
        Response::WriteSingleCoil { address, value } => {
            dst.put_u16(*address);
            dst.put_u16(if *value { 0xFF00 } else { 0x0000 });
        }
        Response::WriteSingleRegister { address, value } => {
            dst.put_u16(*address);
            dst.put_u16(*value);
        }
        Response::Exception { code, .. } => dst.put_u8(code.code()),
    }
    dst
}

/// Decode a response PDU (client side)
///
/// `quantity` trims the padding bits of a bit response.
pub fn decode_response(pdu: &[u8], quantity: u16) -> Result<Response, DecodeError> {
    let Some((&raw_function, mut body)) = pdu.split_first() else {
        return Err(DecodeError::new(0, ExceptionCode::IllegalFunction, "empty PDU"));
    };
    let malformed =
        || DecodeError::new(raw_function, ExceptionCode::IllegalFunction, "malformed PDU");

    if raw_function & 0x80 != 0 {
        let code = body
            .first()
            .and_then(|c| ExceptionCode::from_u8(*c))
            .ok_or_else(malformed)?;
        return Ok(Response::Exception {
            function: raw_function & 0x7F,
            code,
        });
    }

    let function = FunctionCode::from_u8(raw_function).ok_or_else(|| {
        DecodeError::new(raw_function, ExceptionCode::IllegalFunction, "unsupported function")
    })?;

    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let (&count, data) = body.split_first().ok_or_else(malformed)?;
            if data.len() != count as usize || (quantity as usize) > data.len() * 8 {
                return Err(malformed());
            }
            Ok(Response::Bits {
                function,
                values: unpack_bits(data, quantity as usize),
            })
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let (&count, mut data) = body.split_first().ok_or_else(malformed)?;
            if data.len() != count as usize || count % 2 != 0 {
                return Err(malformed());
            }
            let mut values = Vec::with_capacity(data.len() / 2);
            while data.has_remaining() {
                values.push(data.get_u16());
            }
            Ok(Response::Registers { function, values })
        }
        FunctionCode::WriteSingleCoil => {
            if body.len() != 4 {
                return Err(malformed());
            }
            let address = body.get_u16();
            let value = body.get_u16() == 0xFF00;
            Ok(Response::WriteSingleCoil { address, value })
        }
        FunctionCode::WriteSingleRegister => {
            if body.len() != 4 {
                return Err(malformed());
            }
            let address = body.get_u16();
            let value = body.get_u16();
            Ok(Response::WriteSingleRegister { address, value })
        }
    }
}

/// Pack bits MSB-first: the first value lands in bit 7 of the first byte
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, bit)| if *bit { acc | (0x80 >> i) } else { acc })
        })
        .collect()
}

/// Inverse of [`pack_bits`]
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_register_response_round_trip() {
        let response = Response::Registers {
            function: FunctionCode::ReadHoldingRegisters,
            values: vec![50, 1000],
        };
        let pdu = encode_response(&response);
        assert_eq!(&pdu[..], &[0x03, 0x04, 0x00, 0x32, 0x03, 0xE8]);
        let decoded = decode_response(&pdu, 2).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_bits_pack_msb_first() {
        let values = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&values);
        assert_eq!(packed, vec![0b1011_0000, 0b1000_0000]);
        assert_eq!(unpack_bits(&packed, values.len()), values.to_vec());
    }

    #[test]
    fn test_decode_read_request() {
        let request = decode_request(&[0x03, 0x9C, 0x41, 0x00, 0x02]).unwrap();
        assert_eq!(
            request,
            Request::Read {
                function: FunctionCode::ReadHoldingRegisters,
                address: 40001,
                quantity: 2,
            }
        );
        assert_eq!(&encode_request(&request)[..], &[0x03, 0x9C, 0x41, 0x00, 0x02]);
    }

    #[test]
    fn test_decode_errors_map_to_exception_codes() {
        let err = decode_request(&[0x10, 0x00, 0x00, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.exception, ExceptionCode::IllegalFunction);

        let err = decode_request(&[0x03, 0x00]).unwrap_err();
        assert_eq!(err.exception, ExceptionCode::IllegalFunction);

        let err = decode_request(&[0x05, 0x00, 0x01, 0x12, 0x34]).unwrap_err();
        assert_eq!(err.exception, ExceptionCode::IllegalDataValue);

        let err = decode_request(&[0x03, 0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert_eq!(err.exception, ExceptionCode::IllegalDataValue);

        let reply = encode_response(&err.to_response());
        assert_eq!(&reply[..], &[0x83, 0x03]);
    }

    #[test]
    fn test_write_coil_accepts_on_and_off() {
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x0A, 0xFF, 0x00]).unwrap(),
            Request::WriteSingleCoil {
                address: 10,
                value: true
            }
        );
        assert_eq!(
            decode_request(&[0x05, 0x00, 0x0A, 0x00, 0x00]).unwrap(),
            Request::WriteSingleCoil {
                address: 10,
                value: false
            }
        );
    }
}
