//! PDU (function code + payload) encode/decode. Every builder and parser
//! works against a fixed-size stack buffer — no heap allocation on the
//! request/response hot path.

use crate::bytes::{pack_bits, read_u16_be, unpack_bits, write_u16_be};
use crate::error::{Error, ExceptionCode, Result};

/// Largest payload Modbus allows in a single PDU (excludes the function
/// code byte itself).
pub const MAX_PDU_SIZE: usize = 253;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

const EXCEPTION_BIT: u8 = 0x80;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// A PDU: function code plus payload, stored in a fixed-size array.
#[derive(Clone, Copy)]
pub struct Pdu {
    function: u8,
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl Pdu {
    pub fn new(function: u8) -> Self {
        Self {
            function,
            data: [0u8; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Builds a PDU from a function code and a raw payload slice.
    pub fn from_slice(function: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PDU_SIZE {
            return Err(Error::InvalidRequest {
                reason: "payload exceeds maximum PDU size",
            });
        }
        let mut pdu = Self::new(function);
        pdu.data[..payload.len()].copy_from_slice(payload);
        pdu.len = payload.len();
        Ok(pdu)
    }

    pub fn function_code(&self) -> u8 {
        self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_BIT != 0
    }

    /// Original (non-exception-flagged) function code an exception reply
    /// corresponds to.
    pub fn base_function_code(&self) -> u8 {
        self.function & !EXCEPTION_BIT
    }

    pub fn exception_code(&self) -> Option<ExceptionCode> {
        if self.is_exception() && self.len >= 1 {
            Some(ExceptionCode::from_u8(self.data[0]))
        } else {
            None
        }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(Error::InvalidRequest {
                reason: "PDU payload overflow",
            });
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    fn push_u16(&mut self, value: u16) -> Result<()> {
        if self.len + 2 > MAX_PDU_SIZE {
            return Err(Error::InvalidRequest {
                reason: "PDU payload overflow",
            });
        }
        write_u16_be(&mut self.data[self.len..self.len + 2], 0, value);
        self.len += 2;
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.len + bytes.len() > MAX_PDU_SIZE {
            return Err(Error::InvalidRequest {
                reason: "PDU payload overflow",
            });
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Serializes `function` followed by `payload` into `out`, returning the
    /// number of bytes written (`1 + payload.len()`).
    pub fn write_frame(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() < 1 + self.len {
            return Err(Error::InvalidArgument {
                reason: "destination buffer too small for PDU",
            });
        }
        out[0] = self.function;
        out[1..1 + self.len].copy_from_slice(self.payload());
        Ok(1 + self.len)
    }

    /// Builds an exception reply PDU for `request_function` with `code`.
    pub fn exception(request_function: u8, code: ExceptionCode) -> Self {
        let mut pdu = Self::new(request_function | EXCEPTION_BIT);
        // infallible: one byte into an empty MAX_PDU_SIZE buffer
        pdu.push(code.to_u8()).unwrap();
        pdu
    }
}

fn check_read_quantity(count: u16, max: u16) -> Result<()> {
    if count == 0 || count > max {
        return Err(Error::InvalidRequest {
            reason: "read quantity out of range",
        });
    }
    Ok(())
}

fn check_write_quantity(count: u16, max: u16) -> Result<()> {
    if count == 0 || count > max {
        return Err(Error::InvalidRequest {
            reason: "write quantity out of range",
        });
    }
    Ok(())
}

/// Request-side builders.
pub mod request {
    use super::*;

    pub fn read_bits(function: u8, start: u16, count: u16) -> Result<Pdu> {
        check_read_quantity(count, 2000)?;
        let mut pdu = Pdu::new(function);
        pdu.push_u16(start)?;
        pdu.push_u16(count)?;
        Ok(pdu)
    }

    pub fn read_coils(start: u16, count: u16) -> Result<Pdu> {
        read_bits(FC_READ_COILS, start, count)
    }

    pub fn read_discrete_inputs(start: u16, count: u16) -> Result<Pdu> {
        read_bits(FC_READ_DISCRETE_INPUTS, start, count)
    }

    pub fn read_registers(function: u8, start: u16, count: u16) -> Result<Pdu> {
        check_read_quantity(count, 125)?;
        let mut pdu = Pdu::new(function);
        pdu.push_u16(start)?;
        pdu.push_u16(count)?;
        Ok(pdu)
    }

    pub fn read_holding_registers(start: u16, count: u16) -> Result<Pdu> {
        read_registers(FC_READ_HOLDING_REGISTERS, start, count)
    }

    pub fn read_input_registers(start: u16, count: u16) -> Result<Pdu> {
        read_registers(FC_READ_INPUT_REGISTERS, start, count)
    }

    pub fn write_single_coil(address: u16, value: bool) -> Result<Pdu> {
        let mut pdu = Pdu::new(FC_WRITE_SINGLE_COIL);
        pdu.push_u16(address)?;
        pdu.push_u16(if value { COIL_ON } else { COIL_OFF })?;
        Ok(pdu)
    }

    pub fn write_single_register(address: u16, value: u16) -> Result<Pdu> {
        let mut pdu = Pdu::new(FC_WRITE_SINGLE_REGISTER);
        pdu.push_u16(address)?;
        pdu.push_u16(value)?;
        Ok(pdu)
    }

    pub fn write_multiple_coils(start: u16, values: &[bool]) -> Result<Pdu> {
        let count = values.len();
        check_write_quantity(count as u16, 1968)?;
        let mut pdu = Pdu::new(FC_WRITE_MULTIPLE_COILS);
        pdu.push_u16(start)?;
        pdu.push_u16(count as u16)?;
        let mut packed = [0u8; 246];
        let byte_count = pack_bits(values, &mut packed);
        pdu.push(byte_count as u8)?;
        pdu.extend(&packed[..byte_count])?;
        Ok(pdu)
    }

    pub fn write_multiple_registers(start: u16, values: &[u16]) -> Result<Pdu> {
        let count = values.len();
        check_write_quantity(count as u16, 123)?;
        let mut pdu = Pdu::new(FC_WRITE_MULTIPLE_REGISTERS);
        pdu.push_u16(start)?;
        pdu.push_u16(count as u16)?;
        pdu.push((count * 2) as u8)?;
        for &v in values {
            pdu.push_u16(v)?;
        }
        Ok(pdu)
    }

    pub fn read_write_multiple_registers(
        read_start: u16,
        read_count: u16,
        write_start: u16,
        write_values: &[u16],
    ) -> Result<Pdu> {
        check_read_quantity(read_count, 125)?;
        check_write_quantity(write_values.len() as u16, 121)?;
        let mut pdu = Pdu::new(FC_READ_WRITE_MULTIPLE_REGISTERS);
        pdu.push_u16(read_start)?;
        pdu.push_u16(read_count)?;
        pdu.push_u16(write_start)?;
        pdu.push_u16(write_values.len() as u16)?;
        pdu.push((write_values.len() * 2) as u8)?;
        for &v in write_values {
            pdu.push_u16(v)?;
        }
        Ok(pdu)
    }
}

/// Decoded form of a read-bits response (coils/discrete inputs), with
/// values unpacked into a fixed-size array.
pub struct Bits {
    pub values: [bool; 2000],
    pub count: usize,
}

impl Bits {
    pub fn as_slice(&self) -> &[bool] {
        &self.values[..self.count]
    }
}

/// Decoded form of a read-registers response.
pub struct Registers {
    pub values: [u16; 125],
    pub count: usize,
}

impl Registers {
    pub fn as_slice(&self) -> &[u16] {
        &self.values[..self.count]
    }
}

/// Response-side parsers. Each takes the *request* parameters needed to
/// know how many values to expect (the response itself only carries a byte
/// count) and the reply PDU.
pub mod response {
    use super::*;

    fn check_exception(pdu: &Pdu) -> Result<()> {
        if pdu.is_exception() {
            let code = pdu.exception_code().unwrap_or(ExceptionCode::Other(0));
            return Err(Error::Exception(code));
        }
        Ok(())
    }

    pub fn read_bits(pdu: &Pdu, expected_count: u16) -> Result<Bits> {
        check_exception(pdu)?;
        let payload = pdu.payload();
        if payload.is_empty() {
            return Err(Error::Framing {
                reason: "read-bits response missing byte count",
            });
        }
        let byte_count = payload[0] as usize;
        if byte_count != (expected_count as usize).div_ceil(8) || payload.len() < 1 + byte_count {
            return Err(Error::Framing {
                reason: "read-bits response byte count mismatch",
            });
        }
        let mut bits = Bits {
            values: [false; 2000],
            count: expected_count as usize,
        };
        unpack_bits(&payload[1..], expected_count as usize, &mut bits.values);
        Ok(bits)
    }

    pub fn read_registers(pdu: &Pdu, expected_count: u16) -> Result<Registers> {
        check_exception(pdu)?;
        let payload = pdu.payload();
        if payload.is_empty() {
            return Err(Error::Framing {
                reason: "read-registers response missing byte count",
            });
        }
        let byte_count = payload[0] as usize;
        if byte_count != expected_count as usize * 2 || payload.len() < 1 + byte_count {
            return Err(Error::Framing {
                reason: "read-registers response byte count mismatch",
            });
        }
        let mut regs = Registers {
            values: [0u16; 125],
            count: expected_count as usize,
        };
        for i in 0..expected_count as usize {
            regs.values[i] = read_u16_be(&payload[1..], i * 2);
        }
        Ok(regs)
    }

    /// Write-class responses (FC 0x05/0x06/0x0F/0x10) just echo back the
    /// request fields; this validates the echo matches and returns nothing
    /// further.
    pub fn write_echo(pdu: &Pdu, expected_payload: &[u8]) -> Result<()> {
        check_exception(pdu)?;
        if pdu.payload() != expected_payload {
            return Err(Error::Framing {
                reason: "write response echo mismatch",
            });
        }
        Ok(())
    }

    pub fn read_write_multiple_registers(pdu: &Pdu, expected_read_count: u16) -> Result<Registers> {
        read_registers(pdu, expected_read_count)
    }
}

/// Server-side reply builders, mirroring the request builders but producing
/// the response-shaped payload.
pub mod reply {
    use super::*;

    pub fn read_bits(function: u8, values: &[bool]) -> Result<Pdu> {
        let mut pdu = Pdu::new(function);
        let mut packed = [0u8; 250];
        let byte_count = pack_bits(values, &mut packed);
        pdu.push(byte_count as u8)?;
        pdu.extend(&packed[..byte_count])?;
        Ok(pdu)
    }

    pub fn read_registers(function: u8, values: &[u16]) -> Result<Pdu> {
        let mut pdu = Pdu::new(function);
        pdu.push((values.len() * 2) as u8)?;
        for &v in values {
            pdu.push_u16(v)?;
        }
        Ok(pdu)
    }

    pub fn echo(function: u8, field_a: u16, field_b: u16) -> Result<Pdu> {
        let mut pdu = Pdu::new(function);
        pdu.push_u16(field_a)?;
        pdu.push_u16(field_b)?;
        Ok(pdu)
    }
}

/// Validates a write-single-coil value is one of the two values the
/// protocol permits, returning the boolean it represents.
pub fn decode_coil_value(raw: u16) -> Result<bool> {
    match raw {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        _ => Err(Error::InvalidRequest {
            reason: "coil value must be 0x0000 or 0xFF00",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_request_bytes() {
        let pdu = request::read_holding_registers(0x0000, 0x0002).unwrap();
        let mut buf = [0u8; 8];
        let n = pdu.write_frame(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn read_holding_registers_response_parses() {
        let pdu = Pdu::from_slice(0x03, &[0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        let regs = response::read_registers(&pdu, 2).unwrap();
        assert_eq!(regs.as_slice(), &[0x1234, 0x5678]);
    }

    #[test]
    fn exception_reply_round_trip() {
        let pdu = Pdu::exception(FC_WRITE_SINGLE_COIL, ExceptionCode::IllegalDataValue);
        assert!(pdu.is_exception());
        assert_eq!(pdu.base_function_code(), FC_WRITE_SINGLE_COIL);
        assert_eq!(pdu.exception_code(), Some(ExceptionCode::IllegalDataValue));

        let err = response::write_echo(&pdu, &[]).unwrap_err();
        assert_eq!(err, Error::Exception(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn overflow_is_rejected() {
        let huge = [0u16; 200];
        assert!(request::write_multiple_registers(0, &huge).is_err());
    }

    #[test]
    fn coil_value_validation() {
        assert_eq!(decode_coil_value(0xFF00).unwrap(), true);
        assert_eq!(decode_coil_value(0x0000).unwrap(), false);
        assert!(decode_coil_value(0x1234).is_err());
    }

    #[test]
    fn write_single_coil_rejects_on_server_side_but_builds_client_side() {
        // The client builder only emits the two legal wire values.
        let pdu = request::write_single_coil(0x0000, true).unwrap();
        let mut buf = [0u8; 8];
        let n = pdu.write_frame(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x05, 0x00, 0x00, 0xFF, 0x00]);
    }
}
