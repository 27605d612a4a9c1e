pub mod client;
pub mod mock_server;
pub mod protocol;

pub use client::{ModbusClientTrait, ModbusTcpClient};
pub use mock_server::{MockBehavior, MockModbusServer};
pub use protocol::{MbapHeader, ReadHoldingRegisters};
