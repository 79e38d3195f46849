//! Modbus RTU transport over a serial line: port open/configure plus
//! frame-length guessing via `rmodbus::guess_response_frame_len`.

use std::time::{Duration, Instant};

use rmodbus::ModbusProto;
use serialport::{DataBits, Parity as WireParity, SerialPort, StopBits};

use crate::core::register::{NetworkTransportConfig, Parity, RegisterType};
use crate::error::TransportError;

use super::{generate_read_request, generate_write_request, parse_read_response, Transport};

pub struct RtuTransport {
    device: String,
    baud: u32,
    parity: Parity,
    data_bits: u8,
    stop_bits: u8,
    response_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl RtuTransport {
    pub fn new(
        device: String,
        baud: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
        response_timeout: Duration,
    ) -> Self {
        Self {
            device,
            baud,
            parity,
            data_bits,
            stop_bits,
            response_timeout,
            port: None,
        }
    }

    pub fn from_config(cfg: &NetworkTransportConfig, response_timeout: Duration) -> Option<Self> {
        match cfg {
            NetworkTransportConfig::Rtu {
                device,
                baud,
                parity,
                data_bits,
                stop_bits,
                ..
            } => Some(Self::new(
                device.clone(),
                *baud,
                *parity,
                *data_bits,
                *stop_bits,
                response_timeout,
            )),
            NetworkTransportConfig::Tcp { .. } => None,
        }
    }

    fn read_exact_timeout(
        &mut self,
        buf: &mut Vec<u8>,
        need: usize,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Io("not connected".into()))?;
        let mut chunk = [0u8; 64];
        while buf.len() < need {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            let want = (need - buf.len()).min(chunk.len());
            match port.read(&mut chunk[..want]) {
                Ok(0) => {}
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => return Err(TransportError::Io(err.to_string())),
            }
        }
        Ok(())
    }

    fn read_response(&mut self) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.response_timeout;
        let mut collected = Vec::with_capacity(8);
        self.read_exact_timeout(&mut collected, 6, deadline)?;

        let mut header = [0u8; 6];
        header.copy_from_slice(&collected[..6]);
        let guessed_len = rmodbus::guess_response_frame_len(&header, ModbusProto::Rtu)
            .map_err(|e| TransportError::Malformed(e.to_string()))? as usize;

        if !(4..=256).contains(&guessed_len) {
            return Err(TransportError::Malformed(format!(
                "implausible frame length {guessed_len}"
            )));
        }

        self.read_exact_timeout(&mut collected, guessed_len, deadline)?;
        collected.truncate(guessed_len);
        Ok(collected)
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        match self.exchange_inner(request) {
            Ok(response) => Ok(response),
            Err(err) if err.is_retryable() => {
                // A timed-out or wedged line is treated as a dropped
                // connection so the worker's reconnect/backoff takes over
                // rather than re-issuing onto the same broken port.
                self.port = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn exchange_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| TransportError::Io("not connected".into()))?;
            port.write_all(request)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            port.flush().map_err(|e| TransportError::Io(e.to_string()))?;
        }
        let response = self.read_response()?;
        if response.len() >= 2 && (response[1] & 0x80) != 0 {
            let code = response.get(2).copied().unwrap_or(0);
            return Err(TransportError::BadFunction(code));
        }
        Ok(response)
    }
}

impl Transport for RtuTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let builder = serialport::new(&self.device, self.baud).timeout(self.response_timeout);
        let builder = builder.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let builder = builder.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        let builder = builder.parity(match self.parity {
            Parity::N => WireParity::None,
            Parity::E => WireParity::Even,
            Parity::O => WireParity::Odd,
        });
        let port = builder.open().map_err(|e| TransportError::Io(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.port = None;
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn read_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let (mut request, raw) = generate_read_request(ModbusProto::Rtu, slave, kind, first_register, count)?;
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
        let (mut request, raw) = generate_write_request(ModbusProto::Rtu, slave, kind, first_register, values)?;
        let response = self.exchange(&raw)?;
        request
            .parse_ok(&response)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(())
    }
}
