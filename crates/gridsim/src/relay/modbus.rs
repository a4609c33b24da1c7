//! Modbus connection task
//!
//! Frames come off the socket, malformed ones are answered on the spot and
//! the rest are parked as pending requests while the engine answers.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use gridsim_types::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::RelayResult;
use super::endpoint::Connection;
use crate::modbus::{
    Adu, ExceptionCode, Request, Response, decode_request, encode_adu, encode_response, next_frame,
};
use crate::server::{ControlMessage, TraceDirection};

/// A request forwarded to the engine and not yet answered
pub struct PendingRequest {
    pub request: Request,
    /// Unit id of the incoming ADU, echoed in the reply
    pub unit_id: u8,
    pub endpoint: String,
    pub created: Instant,
    pub(crate) reply: mpsc::Sender<Bytes>,
}

impl PendingRequest {
    /// Encode `response` as the reply ADU for `transaction_id`
    pub fn reply_adu(&self, transaction_id: u16, response: &Response) -> Bytes {
        encode_adu(transaction_id, self.unit_id, &encode_response(response))
    }
}

pub(super) async fn serve(mut stream: TcpStream, mut conn: Connection) -> RelayResult<()> {
    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(32);
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                loop {
                    match next_frame(&mut buf) {
                        Ok(Some(adu)) => {
                            if let Some(reply) = handle_adu(&conn, adu, &reply_tx) {
                                stream.write_all(&reply).await?;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(endpoint = %conn.endpoint, peer = %conn.peer, error = %e, "Dropping client");
                            return Ok(());
                        }
                    }
                }
            }
            Some(reply) = reply_rx.recv() => {
                stream.write_all(&reply).await?;
            }
            _ = conn.shutdown.changed() => return Ok(()),
        }
    }
}

/// Immediate reply for requests that never reach the engine
fn handle_adu(conn: &Connection, adu: Adu, reply_tx: &mpsc::Sender<Bytes>) -> Option<Bytes> {
    let transaction_id = adu.header.transaction_id;
    let unit_id = adu.header.unit_id;
    let raw = encode_adu(transaction_id, unit_id, &adu.pdu);
    conn.relay.trace_modbus(
        TraceDirection::In,
        &conn.endpoint,
        transaction_id,
        adu.pdu.first().copied().unwrap_or(0),
        &raw,
    );

    let request = match decode_request(&adu.pdu) {
        Ok(request) => request,
        Err(e) => {
            debug!(endpoint = %conn.endpoint, transaction_id, error = %e, "Rejected request");
            let reply = encode_adu(
                transaction_id,
                unit_id,
                &encode_response(&e.to_response()),
            );
            conn.relay.trace_modbus(
                TraceDirection::Out,
                &conn.endpoint,
                transaction_id,
                e.function | 0x80,
                &reply,
            );
            return Some(reply);
        }
    };

    let pending = PendingRequest {
        request,
        unit_id,
        endpoint: conn.endpoint.clone(),
        created: Instant::now(),
        reply: reply_tx.clone(),
    };
    if let Some(stale) = conn.relay.insert_pending(transaction_id, pending) {
        debug!(transaction_id, endpoint = %stale.endpoint, "Transaction id reused; dropping older request");
    }

    let command = command_for(
        transaction_id,
        conn.endpoint.clone(),
        conn.spec.unit_id.unwrap_or(unit_id),
        &request,
    );
    if !conn.relay.publish(command) {
        // Nobody on the control channel will ever answer
        let pending = conn.relay.take_pending(transaction_id)?;
        let response = Response::exception(
            request.function().code(),
            ExceptionCode::ServerDeviceFailure,
        );
        let reply = pending.reply_adu(transaction_id, &response);
        conn.relay.trace_modbus(
            TraceDirection::Out,
            &conn.endpoint,
            transaction_id,
            response.function_byte(),
            &reply,
        );
        return Some(reply);
    }
    trace!(transaction_id, function = request.function().code(), "Forwarded to engine");
    None
}

/// `MODBUS_CMD` for a decoded request
pub fn command_for(
    request_id: u16,
    endpoint: String,
    unit_id: u8,
    request: &Request,
) -> ControlMessage {
    let (quantity, value) = match *request {
        Request::Read { quantity, .. } => (Some(quantity), None),
        Request::WriteSingleCoil { value, .. } => (None, Some(Value::Bool(value))),
        Request::WriteSingleRegister { value, .. } => (None, Some(Value::from(value))),
    };
    ControlMessage::ModbusCmd {
        request_id,
        endpoint,
        unit_id,
        function_code: request.function().code(),
        address: request.address(),
        quantity,
        value,
    }
}

/// Response PDU for an engine reply to `request`
///
/// Replies that do not fit the request degrade to exception 4.
pub fn response_for(
    request: &Request,
    values: Option<Vec<Value>>,
    exception_code: Option<u8>,
) -> Response {
    let function = request.function();
    let failure = || Response::exception(function.code(), ExceptionCode::ServerDeviceFailure);

    if let Some(code) = exception_code {
        return Response::exception(
            function.code(),
            ExceptionCode::from_u8(code).unwrap_or(ExceptionCode::ServerDeviceFailure),
        );
    }

    match *request {
        Request::Read { quantity, .. } => {
            let values = values.unwrap_or_default();
            if values.len() != quantity as usize {
                return failure();
            }
            match function.read_table() {
                Some(table) if table.is_bit() => Response::Bits {
                    function,
                    values: values.iter().map(Value::truthy).collect(),
                },
                Some(_) => match values.iter().map(u16::try_from).collect::<Result<Vec<u16>, _>>() {
                    Ok(values) => Response::Registers { function, values },
                    Err(_) => failure(),
                },
                None => failure(),
            }
        }
        Request::WriteSingleCoil { address, value } => Response::WriteSingleCoil { address, value },
        Request::WriteSingleRegister { address, value } => {
            Response::WriteSingleRegister { address, value }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::FunctionCode;

    #[test]
    fn test_command_carries_quantity_or_value() {
        let read = Request::Read {
            function: FunctionCode::ReadHoldingRegisters,
            address: 0,
            quantity: 2,
        };
        let json = serde_json::to_value(command_for(1, "127.0.0.1:502".into(), 1, &read)).unwrap();
        assert_eq!(json["type"], "MODBUS_CMD");
        assert_eq!(json["functionCode"], 3);
        assert_eq!(json["quantity"], 2);
        assert!(json.get("value").is_none());

        let write = Request::WriteSingleCoil {
            address: 4,
            value: true,
        };
        let json = serde_json::to_value(command_for(2, "x".into(), 1, &write)).unwrap();
        assert_eq!(json["value"], true);
        assert!(json.get("quantity").is_none());
    }

    #[test]
    fn test_register_reply() {
        let read = Request::Read {
            function: FunctionCode::ReadHoldingRegisters,
            address: 0,
            quantity: 2,
        };
        let response = response_for(&read, Some(vec![Value::Int(50), Value::Int(1000)]), None);
        assert_eq!(
            response,
            Response::Registers {
                function: FunctionCode::ReadHoldingRegisters,
                values: vec![50, 1000]
            }
        );
    }

    #[test]
    fn test_short_or_bad_reply_is_device_failure() {
        let read = Request::Read {
            function: FunctionCode::ReadHoldingRegisters,
            address: 0,
            quantity: 2,
        };
        let short = response_for(&read, Some(vec![Value::Int(1)]), None);
        assert_eq!(
            short,
            Response::exception(3, ExceptionCode::ServerDeviceFailure)
        );
        let negative = response_for(&read, Some(vec![Value::Int(1), Value::Int(-1)]), None);
        assert_eq!(
            negative,
            Response::exception(3, ExceptionCode::ServerDeviceFailure)
        );
    }

    #[test]
    fn test_exception_code_passes_through() {
        let read = Request::Read {
            function: FunctionCode::ReadCoils,
            address: 9,
            quantity: 1,
        };
        assert_eq!(
            response_for(&read, None, Some(2)),
            Response::exception(1, ExceptionCode::IllegalDataAddress)
        );
    }
}
