//! In-process Modbus TCP device for tests and local experiments.
//!
//! Serves holding registers from a shared map and can be told to answer with an
//! exception or to go quiet, so callers can exercise their failure paths.

use log::{debug, trace};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::protocol::{
    encode_exception_response, encode_registers_response, MbapHeader, MAX_READ_REGISTERS, MBAP_HEADER_LEN,
    READ_HOLDING_REGISTERS,
};

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// How the mock answers read requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    #[default]
    Normal,
    /// Answer every request with this exception code
    Exception(u8),
    /// Accept requests but never reply
    Silent,
}

#[derive(Debug, Default)]
struct MockState {
    holding_registers: HashMap<u16, u16>,
    behavior: MockBehavior,
}

pub struct MockModbusServer {
    address: String,
    state: Arc<Mutex<MockState>>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockModbusServer {
    /// Bind to an ephemeral localhost port and start serving.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let state = Arc::new(Mutex::new(MockState::default()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(Self::run_server(
            listener,
            state.clone(),
            connections.clone(),
            shutdown_rx,
        ));

        debug!("Mock Modbus device listening on {}", address);
        Ok(Self {
            address,
            state,
            connections,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn set_register(&self, register: u16, value: u16) {
        self.state.lock().await.holding_registers.insert(register, value);
    }

    pub async fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock().await;
        for (offset, &value) in values.iter().enumerate() {
            state.holding_registers.insert(start.wrapping_add(offset as u16), value);
        }
    }

    /// Store a 32-bit counter across two registers, low word first.
    pub async fn set_counter(&self, start: u16, value: u32) {
        self.set_registers(start, &[(value & 0xFFFF) as u16, (value >> 16) as u16])
            .await;
    }

    pub async fn set_behavior(&self, behavior: MockBehavior) {
        self.state.lock().await.behavior = behavior;
    }

    /// Stop accepting connections and wait for the accept loop to end.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    async fn run_server(
        listener: TcpListener,
        state: Arc<Mutex<MockState>>,
        connections: Arc<AtomicUsize>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    if let Ok((stream, peer)) = result {
                        connections.fetch_add(1, Ordering::SeqCst);
                        trace!("Mock device accepted {}", peer);
                        let client_state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_client(stream, client_state).await {
                                trace!("Mock device client {} ended: {}", peer, e);
                            }
                        });
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    }

    async fn handle_client(mut stream: TcpStream, state: Arc<Mutex<MockState>>) -> io::Result<()> {
        loop {
            let mut header_bytes = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header_bytes).await?;
            let header = MbapHeader::parse(&header_bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

            let mut pdu = vec![0u8; header.pdu_len()];
            stream.read_exact(&mut pdu).await?;

            let guard = state.lock().await;
            let response = match guard.behavior {
                MockBehavior::Silent => continue,
                MockBehavior::Exception(code) => encode_exception_response(
                    header.transaction_id,
                    header.unit_id,
                    pdu.first().copied().unwrap_or(READ_HOLDING_REGISTERS),
                    code,
                ),
                MockBehavior::Normal => Self::answer(&header, &pdu, &guard.holding_registers),
            };
            drop(guard);

            stream.write_all(&response).await?;
        }
    }

    fn answer(header: &MbapHeader, pdu: &[u8], registers: &HashMap<u16, u16>) -> bytes::BytesMut {
        let (tid, unit) = (header.transaction_id, header.unit_id);
        let function = pdu.first().copied().unwrap_or(0);

        if function != READ_HOLDING_REGISTERS || pdu.len() != 5 {
            return encode_exception_response(tid, unit, function, ILLEGAL_FUNCTION);
        }

        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);
        if count == 0 || count > MAX_READ_REGISTERS {
            return encode_exception_response(tid, unit, function, ILLEGAL_DATA_VALUE);
        }

        let values: Option<Vec<u16>> = (0..count)
            .map(|offset| registers.get(&start.wrapping_add(offset)).copied())
            .collect();

        match values {
            Some(values) => encode_registers_response(tid, unit, &values),
            None => encode_exception_response(tid, unit, function, ILLEGAL_DATA_ADDRESS),
        }
    }
}

impl Drop for MockModbusServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
