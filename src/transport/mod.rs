//! Transport abstraction: a thin capability over the wire codec.
//! Implementations map coils/discrete-inputs to one `u16` per register so
//! the executor can treat all four register spaces uniformly.

pub mod rtu;
pub mod tcp;

use crate::core::register::RegisterType;
use crate::error::TransportError;

pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    fn read_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    fn write_block(
        &mut self,
        slave: u8,
        kind: RegisterType,
        first_register: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;
}

/// Build the Modbus request frame for one register block read, used by both
/// transports before they hand bytes to their respective wire framing.
pub(crate) fn generate_read_request(
    proto: rmodbus::ModbusProto,
    slave: u8,
    kind: RegisterType,
    first_register: u16,
    count: u16,
) -> Result<(rmodbus::client::ModbusRequest, Vec<u8>), TransportError> {
    let mut request = rmodbus::client::ModbusRequest::new(slave, proto);
    let mut raw = Vec::with_capacity(8);
    let zero_based = first_register.saturating_sub(1);
    let result = match kind {
        RegisterType::Coil => request.generate_get_coils(zero_based, count, &mut raw),
        RegisterType::Bit => request.generate_get_discretes(zero_based, count, &mut raw),
        RegisterType::Holding => request.generate_get_holdings(zero_based, count, &mut raw),
        RegisterType::Input => request.generate_get_inputs(zero_based, count, &mut raw),
    };
    result.map_err(|e| TransportError::Malformed(e.to_string()))?;
    Ok((request, raw))
}

/// Build the Modbus request frame for one register block write. Holding
/// multi-write sends one 16-bit word per register, index for index.
pub(crate) fn generate_write_request(
    proto: rmodbus::ModbusProto,
    slave: u8,
    kind: RegisterType,
    first_register: u16,
    values: &[u16],
) -> Result<(rmodbus::client::ModbusRequest, Vec<u8>), TransportError> {
    let mut request = rmodbus::client::ModbusRequest::new(slave, proto);
    let mut raw = Vec::with_capacity(16);
    let zero_based = first_register.saturating_sub(1);
    let result = match kind {
        RegisterType::Coil => {
            let bools: Vec<bool> = values.iter().map(|v| *v != 0).collect();
            request.generate_set_coils_bulk(zero_based, &bools, &mut raw)
        }
        RegisterType::Holding => {
            if values.len() == 1 {
                request.generate_set_holding(zero_based, values[0], &mut raw)
            } else {
                request.generate_set_holdings_bulk(zero_based, values, &mut raw)
            }
        }
        RegisterType::Bit | RegisterType::Input => {
            return Err(TransportError::BadFunction(0));
        }
    };
    result.map_err(|e| TransportError::Malformed(e.to_string()))?;
    Ok((request, raw))
}

/// Parse a read response into one u16 per register: 16-bit register spaces
/// pass through as big-endian words, boolean spaces are unpacked
/// bit-per-register (LSB of the first data byte is the first coil) so the
/// executor can treat all four register spaces uniformly.
pub(crate) fn parse_read_response(
    request: &mut rmodbus::client::ModbusRequest,
    kind: RegisterType,
    count: u16,
    response: &[u8],
) -> Result<Vec<u16>, TransportError> {
    request
        .parse_ok(response)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

    if response.len() < 3 {
        return Err(TransportError::Malformed("response too short".into()));
    }

    if kind.is_boolean() {
        let mut bools: Vec<u16> = response[3..response.len() - 2]
            .iter()
            .flat_map(|byte| (0..8).map(move |i| ((*byte) & (1 << i) != 0) as u16))
            .collect();
        if bools.len() > count as usize {
            bools.truncate(count as usize);
        }
        if bools.len() != count as usize {
            return Err(TransportError::Malformed(
                "unexpected number of bits in response".into(),
            ));
        }
        Ok(bools)
    } else {
        let words: Vec<u16> = response[3..response.len() - 2]
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();
        if words.len() != count as usize {
            return Err(TransportError::Malformed(
                "unexpected number of registers in response".into(),
            ));
        }
        Ok(words)
    }
}
