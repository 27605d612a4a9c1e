use async_trait::async_trait;
use log::{debug, info, log_enabled, trace, Level};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{MbapHeader, ReadHoldingRegisters, MBAP_HEADER_LEN};
use crate::utils::error::{ConnectionError, ReadError};

/// Register-oriented access to one device.
#[async_trait]
pub trait ModbusClientTrait: Send {
    /// Open the session if it is not already open.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    /// Read `count` holding registers. Connects lazily; any failure leaves the client
    /// disconnected so the next call starts from a fresh socket.
    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        start_register: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, ReadError>;

    /// Release the socket. Safe to call more than once.
    async fn close(&mut self);

    fn address(&self) -> &str;
}

pub struct ModbusTcpClient {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    next_transaction: u16,
}

impl ModbusTcpClient {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            stream: None,
            next_transaction: 1,
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        id
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Dropped connection to {}", self.address);
        }
    }

    async fn exchange(&mut self, request: &ReadHoldingRegisters) -> Result<Vec<u16>, ReadError> {
        let stream = self.stream.as_mut().ok_or(ReadError::NotConnected)?;

        let frame = request.encode();
        if log_enabled!(Level::Trace) {
            trace!("📤 {} <- {}", self.address, hex::encode(&frame));
        }
        stream.write_all(&frame).await?;

        let mut header_bytes = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header_bytes).await?;
        let header = MbapHeader::parse(&header_bytes)?;

        let mut pdu = vec![0u8; header.pdu_len()];
        stream.read_exact(&mut pdu).await?;
        if log_enabled!(Level::Trace) {
            trace!("📥 {} -> {}{}", self.address, hex::encode(header_bytes), hex::encode(&pdu));
        }

        request.decode_response(&header, &pdu)
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusTcpClient {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.stream.is_some() {
            return Ok(());
        }

        debug!("🔌 Connecting to Modbus TCP device at {}", self.address);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectionError::Refused {
                    address: self.address.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    address: self.address.clone(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };

        // Requests are tiny and latency matters more than throughput
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        info!("✅ Connected to {}", self.address);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        start_register: u16,
        count: u16,
        read_timeout: Duration,
    ) -> Result<Vec<u16>, ReadError> {
        let request = ReadHoldingRegisters::new(self.next_transaction_id(), unit_id, start_register, count)?;

        if let Err(e) = self.connect().await {
            return Err(e.into());
        }

        let result = match timeout(read_timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout(read_timeout.as_millis() as u64)),
        };

        if result.is_err() {
            self.disconnect();
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("🔒 Modbus connection to {} closed", self.address);
        }
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::mock_server::{MockBehavior, MockModbusServer};
    use crate::utils::error::ErrorSeverity;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_reads_registers_from_device() {
        let server = MockModbusServer::start().await.unwrap();
        server.set_registers(10, &[0x0002, 0x0001]).await;

        let mut client = ModbusTcpClient::new(server.address(), TIMEOUT);
        assert!(!client.is_connected());

        let registers = client.read_holding_registers(1, 10, 2, TIMEOUT).await.unwrap();
        assert_eq!(registers, vec![0x0002, 0x0001]);
        assert!(client.is_connected());

        // Connection is reused
        let again = client.read_holding_registers(1, 10, 2, TIMEOUT).await.unwrap();
        assert_eq!(again, registers);
        assert_eq!(server.connection_count(), 1);

        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let server = MockModbusServer::start().await.unwrap();
        let address = server.address().to_string();
        server.shutdown().await;

        let mut client = ModbusTcpClient::new(address, TIMEOUT);
        let err = client.read_holding_registers(1, 0, 2, TIMEOUT).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(err.severity(), ErrorSeverity::Transient);
    }

    #[tokio::test]
    async fn test_exception_is_fatal_and_disconnects() {
        let server = MockModbusServer::start().await.unwrap();
        server.set_behavior(MockBehavior::Exception(0x02)).await;

        let mut client = ModbusTcpClient::new(server.address(), TIMEOUT);
        let err = client.read_holding_registers(1, 0, 2, TIMEOUT).await.unwrap_err();
        assert_eq!(err.severity(), ErrorSeverity::Fatal);
        assert!(!client.is_connected());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_device_times_out_then_reconnects() {
        let server = MockModbusServer::start().await.unwrap();
        server.set_behavior(MockBehavior::Silent).await;

        let mut client = ModbusTcpClient::new(server.address(), TIMEOUT);
        let err = client
            .read_holding_registers(1, 0, 1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Timeout(100)));
        assert!(!client.is_connected());

        server.set_behavior(MockBehavior::Normal).await;
        server.set_registers(0, &[42]).await;
        let registers = client.read_holding_registers(1, 0, 1, TIMEOUT).await.unwrap();
        assert_eq!(registers, vec![42]);
        assert_eq!(server.connection_count(), 2);
        server.shutdown().await;
    }
}
