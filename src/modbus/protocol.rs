//! Modbus TCP framing for Read Holding Registers (function 0x03).
//!
//! ```text
//! | transaction id (2) | protocol id (2) = 0 | length (2) | unit id (1) | PDU ... |
//! ```
//! `length` counts the unit id plus the PDU.

use bytes::{BufMut, BytesMut};

use crate::utils::error::ReadError;

pub const MBAP_HEADER_LEN: usize = 7;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const EXCEPTION_FLAG: u8 = 0x80;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_PDU_LEN: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self, ReadError> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };

        if header.protocol_id != 0 {
            return Err(ReadError::InvalidResponse(format!(
                "unexpected protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.pdu_len() > MAX_PDU_LEN {
            return Err(ReadError::InvalidResponse(format!("invalid MBAP length {}", header.length)));
        }
        Ok(header)
    }

    /// Bytes that follow the header.
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHoldingRegisters {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub start_register: u16,
    pub count: u16,
}

impl ReadHoldingRegisters {
    pub fn new(transaction_id: u16, unit_id: u8, start_register: u16, count: u16) -> Result<Self, ReadError> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ReadError::ConfigMismatch(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_REGISTERS
            )));
        }
        if start_register as u32 + count as u32 > u16::MAX as u32 + 1 {
            return Err(ReadError::ConfigMismatch(format!(
                "registers {}+{} exceed address space",
                start_register, count
            )));
        }
        Ok(Self {
            transaction_id,
            unit_id,
            start_register,
            count,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        frame.put_u16(self.transaction_id);
        frame.put_u16(0);
        frame.put_u16(6);
        frame.put_u8(self.unit_id);
        frame.put_u8(READ_HOLDING_REGISTERS);
        frame.put_u16(self.start_register);
        frame.put_u16(self.count);
        frame
    }

    /// Validate a response header + PDU against this request and extract the registers.
    pub fn decode_response(&self, header: &MbapHeader, pdu: &[u8]) -> Result<Vec<u16>, ReadError> {
        if header.transaction_id != self.transaction_id {
            return Err(ReadError::TransactionMismatch {
                sent: self.transaction_id,
                received: header.transaction_id,
            });
        }
        if header.unit_id != self.unit_id {
            return Err(ReadError::InvalidResponse(format!(
                "response from unit {} to request for unit {}",
                header.unit_id, self.unit_id
            )));
        }

        let (&function, body) = pdu
            .split_first()
            .ok_or_else(|| ReadError::InvalidResponse("empty PDU".to_string()))?;

        if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
            let code = body
                .first()
                .copied()
                .ok_or_else(|| ReadError::InvalidResponse("exception without code".to_string()))?;
            return Err(ReadError::Exception {
                function: READ_HOLDING_REGISTERS,
                code,
            });
        }
        if function != READ_HOLDING_REGISTERS {
            return Err(ReadError::InvalidResponse(format!("unexpected function code 0x{:02x}", function)));
        }

        let expected_bytes = self.count as usize * 2;
        let (&byte_count, data) = body
            .split_first()
            .ok_or_else(|| ReadError::InvalidResponse("missing byte count".to_string()))?;

        if byte_count as usize != expected_bytes || data.len() != expected_bytes {
            return Err(ReadError::InvalidResponse(format!(
                "expected {} data bytes, got byte count {} with {} bytes",
                expected_bytes,
                byte_count,
                data.len()
            )));
        }

        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Server-side response encoding, used by the mock device.
pub fn encode_registers_response(transaction_id: u16, unit_id: u8, registers: &[u16]) -> BytesMut {
    let byte_count = registers.len() * 2;
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 2 + byte_count);
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((3 + byte_count) as u16);
    frame.put_u8(unit_id);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u8(byte_count as u8);
    for &register in registers {
        frame.put_u16(register);
    }
    frame
}

pub fn encode_exception_response(transaction_id: u16, unit_id: u8, function: u8, code: u8) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 2);
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16(3);
    frame.put_u8(unit_id);
    frame.put_u8(function | EXCEPTION_FLAG);
    frame.put_u8(code);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: &[u8]) -> (MbapHeader, &[u8]) {
        let mut header = [0u8; MBAP_HEADER_LEN];
        header.copy_from_slice(&frame[..MBAP_HEADER_LEN]);
        (MbapHeader::parse(&header).unwrap(), &frame[MBAP_HEADER_LEN..])
    }

    #[test]
    fn test_request_encoding() {
        let request = ReadHoldingRegisters::new(0x0102, 1, 0x0004, 2).unwrap();
        assert_eq!(
            request.encode().as_ref(),
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x04, 0x00, 0x02]
        );
    }

    #[test]
    fn test_rejects_bad_register_counts() {
        assert!(ReadHoldingRegisters::new(1, 1, 0, 0).is_err());
        assert!(ReadHoldingRegisters::new(1, 1, 0, 126).is_err());
        assert!(ReadHoldingRegisters::new(1, 1, 65535, 2).is_err());
        assert!(ReadHoldingRegisters::new(1, 1, 65534, 2).is_ok());
    }

    #[test]
    fn test_decode_registers() {
        let request = ReadHoldingRegisters::new(7, 3, 0, 2).unwrap();
        let frame = encode_registers_response(7, 3, &[0x1234, 0xABCD]);
        let (header, pdu) = split(&frame);
        assert_eq!(header.pdu_len(), pdu.len());
        assert_eq!(request.decode_response(&header, pdu).unwrap(), vec![0x1234, 0xABCD]);
    }

    #[test]
    fn test_decode_exception() {
        let request = ReadHoldingRegisters::new(7, 1, 100, 2).unwrap();
        let frame = encode_exception_response(7, 1, READ_HOLDING_REGISTERS, 0x02);
        let (header, pdu) = split(&frame);
        match request.decode_response(&header, pdu) {
            Err(ReadError::Exception { function: 0x03, code: 0x02 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_detects_mismatches() {
        let request = ReadHoldingRegisters::new(7, 1, 0, 2).unwrap();

        let frame = encode_registers_response(8, 1, &[1, 2]);
        let (header, pdu) = split(&frame);
        assert!(matches!(
            request.decode_response(&header, pdu),
            Err(ReadError::TransactionMismatch { sent: 7, received: 8 })
        ));

        let frame = encode_registers_response(7, 1, &[1]);
        let (header, pdu) = split(&frame);
        assert!(matches!(request.decode_response(&header, pdu), Err(ReadError::InvalidResponse(_))));
    }

    #[test]
    fn test_header_rejects_foreign_protocol() {
        let header = [0x00, 0x01, 0x00, 0x05, 0x00, 0x06, 0x01];
        assert!(MbapHeader::parse(&header).is_err());
    }
}
