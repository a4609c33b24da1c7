//! Engine ⇄ Relay Bridge
//!
//! Runs an in-process engine as the control-plane peer of the relay:
//! configures endpoints from the project, answers `MODBUS_CMD` from the data
//! model and supplies the IED model on request.

use gridsim_types::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SharedEngine;
use crate::modbus::{ExceptionCode, FunctionCode, Request, Response};
use crate::relay::RelayState;
use crate::server::{ControlMessage, EndpointSpec, IedNode, Protocol};

pub struct Bridge {
    engine: SharedEngine,
    relay: RelayState,
    ied_model: Option<IedNode>,
}

impl Bridge {
    pub fn new(engine: SharedEngine, relay: RelayState, ied_model: Option<IedNode>) -> Self {
        Self {
            engine,
            relay,
            ied_model,
        }
    }

    /// Subscribe to the relay, then configure its endpoints
    ///
    /// Subscribing first guarantees no `GET_IED_MODEL` or `MODBUS_CMD` is
    /// published before the bridge can see it.
    pub async fn start(
        self,
        endpoints: Vec<(Protocol, Vec<EndpointSpec>)>,
    ) -> JoinHandle<()> {
        let mut rx = self.relay.subscribe();

        if let Some(model) = self.ied_model.clone() {
            self.relay
                .handle_control(ControlMessage::IedModel { model })
                .await;
        }
        for (protocol, specs) in endpoints {
            self.relay
                .handle_control(ControlMessage::SetProtocolEndpoints {
                    protocol,
                    endpoints: specs,
                })
                .await;
        }

        tokio::spawn(async move {
            info!("Engine bridge running");
            loop {
                match rx.recv().await {
                    Ok(msg) => self.handle(msg).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine bridge lagging; commands dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Engine bridge stopped");
        })
    }

    async fn handle(&self, msg: ControlMessage) {
        let reply = match msg {
            ControlMessage::ModbusCmd {
                request_id,
                unit_id,
                function_code,
                address,
                quantity,
                value,
                ..
            } => Some(self.execute_modbus(request_id, unit_id, function_code, address, quantity, value)),
            ControlMessage::GetIedModel => match &self.ied_model {
                Some(model) => Some(ControlMessage::IedModel {
                    model: model.clone(),
                }),
                None => {
                    debug!("Relay asked for an IED model but the project has none");
                    None
                }
            },
            _ => None,
        };
        if let Some(reply) = reply {
            self.relay.handle_control(reply).await;
        }
    }

    fn execute_modbus(
        &self,
        request_id: u16,
        unit_id: u8,
        function_code: u8,
        address: u16,
        quantity: Option<u16>,
        value: Option<Value>,
    ) -> ControlMessage {
        let response = match request_from_command(function_code, address, quantity, value.as_ref()) {
            Some(request) => self.engine.lock().substation_mut().handle_modbus(unit_id, &request),
            None => Response::exception(function_code, ExceptionCode::IllegalDataValue),
        };
        debug!(request_id, unit_id, function_code, address, "Modbus command executed");
        response_message(request_id, function_code, response)
    }
}

/// Rebuild a decoded request from `MODBUS_CMD` fields
pub fn request_from_command(
    function_code: u8,
    address: u16,
    quantity: Option<u16>,
    value: Option<&Value>,
) -> Option<Request> {
    let function = FunctionCode::from_u8(function_code)?;
    match function {
        FunctionCode::WriteSingleCoil => Some(Request::WriteSingleCoil {
            address,
            value: value?.truthy(),
        }),
        FunctionCode::WriteSingleRegister => Some(Request::WriteSingleRegister {
            address,
            value: u16::try_from(value?).ok()?,
        }),
        _ => Some(Request::Read {
            function,
            address,
            quantity: quantity?,
        }),
    }
}

/// `MODBUS_RESP` for a data-model response
pub fn response_message(request_id: u16, function_code: u8, response: Response) -> ControlMessage {
    let (values, exception_code) = match response {
        Response::Bits { values, .. } => (Some(values.into_iter().map(Value::Bool).collect()), None),
        Response::Registers { values, .. } => {
            (Some(values.into_iter().map(Value::from).collect()), None)
        }
        Response::WriteSingleCoil { value, .. } => (Some(vec![Value::Bool(value)]), None),
        Response::WriteSingleRegister { value, .. } => (Some(vec![Value::from(value)]), None),
        Response::Exception { code, .. } => (None, Some(code.code())),
    };
    ControlMessage::ModbusResp {
        request_id,
        function_code,
        values,
        exception_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_command() {
        assert_eq!(
            request_from_command(3, 10, Some(2), None),
            Some(Request::Read {
                function: FunctionCode::ReadHoldingRegisters,
                address: 10,
                quantity: 2
            })
        );
        assert_eq!(
            request_from_command(6, 1, None, Some(&Value::Int(7))),
            Some(Request::WriteSingleRegister {
                address: 1,
                value: 7
            })
        );
        assert_eq!(request_from_command(6, 1, None, Some(&Value::Int(-7))), None);
        assert_eq!(request_from_command(3, 1, None, None), None);
        assert_eq!(request_from_command(0x2B, 1, Some(1), None), None);
    }

    #[test]
    fn test_exception_becomes_exception_code() {
        let msg = response_message(
            9,
            3,
            Response::exception(3, ExceptionCode::IllegalDataAddress),
        );
        assert_eq!(
            msg,
            ControlMessage::ModbusResp {
                request_id: 9,
                function_code: 3,
                values: None,
                exception_code: Some(2)
            }
        );
    }
}
