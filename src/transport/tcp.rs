//! Modbus TCP transport over a plain `TcpStream`, using rmodbus's MBAP
//! framing (`ModbusProto::TcpUdp`) instead of RTU's CRC16/silence framing.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use rmodbus::ModbusProto;

use crate::core::register::{NetworkTransportConfig, RegisterType};
use crate::error::TransportError;

use super::{generate_read_request, generate_write_request, parse_read_response, Transport};

pub struct TcpTransport {
    host: String,
    port: u16,
    response_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, response_timeout: Duration) -> Self {
        Self {
            host,
            port,
            response_timeout,
            stream: None,
        }
    }

    pub fn from_config(cfg: &NetworkTransportConfig, response_timeout: Duration) -> Option<Self> {
        match cfg {
            NetworkTransportConfig::Tcp { host, port } => {
                Some(Self::new(host.clone(), *port, response_timeout))
            }
            NetworkTransportConfig::Rtu { .. } => None,
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        match self.exchange_inner(request) {
            Ok(response) => Ok(response),
            Err(err) if err.is_retryable() => {
                self.stream = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn exchange_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Io("not connected".into()))?;
        stream
            .write_all(request)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        // MBAP header is 7 bytes: transaction id, protocol id, length, unit id.
        let mut header = [0u8; 7];
        stream.read_exact(&mut header).map_err(map_io_error)?;
        let body_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if body_len == 0 || body_len > 253 {
            return Err(TransportError::Malformed(format!(
                "implausible MBAP length {body_len}"
            )));
        }
        // `body_len` counts the unit id already consumed as header[6].
        let mut body = vec![0u8; body_len - 1];
        stream.read_exact(&mut body).map_err(map_io_error)?;

        let mut frame = Vec::with_capacity(header.len() + body.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&body);

        if body.len() >= 2 && (body[0] & 0x80) != 0 {
            return Err(TransportError::BadFunction(body[1]));
        }
        Ok(frame)
    }
}

fn map_io_error(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::TimedOut || err.kind() == std::io::ErrorKind::WouldBlock {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_read_timeout(Some(self.response_timeout))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_write_timeout(Some(self.response_timeout))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (mut request, raw) =
            generate_read_request(ModbusProto::TcpUdp, slave, kind, first_register, count)?;
        let response = self.exchange(&raw)?;
        parse_read_response(&mut request, kind, count, &response)
    }

    fn write_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let (mut request, raw) =
            generate_write_request(ModbusProto::TcpUdp, slave, kind, first_register, values)?;
        let response = self.exchange(&raw)?;
        request
            .parse_ok(&response)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(())
    }
}
