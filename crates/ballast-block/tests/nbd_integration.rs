//! End-to-end NBD protocol tests over a real TCP loopback session.
//!
//! A minimal NBD client drives the server through handshake, negotiation,
//! and transmission against the in-memory object backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use ballast_block::{NbdServer, ServerConfig, ShutdownHandle};
use ballast_store::ObjectClient;

const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943;
const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
const NBD_REQUEST_MAGIC: u32 = 0x25609513;
const NBD_REPLY_MAGIC: u32 = 0x67446698;

const NBD_OPT_GO: u32 = 7;
const NBD_OPT_ABORT: u32 = 2;
const NBD_REP_ACK: u32 = 1;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_POLICY: u32 = (1 << 31) | 2;
const NBD_REP_ERR_UNSUP: u32 = (1 << 31) | 1;

const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;

const TEST_EXPORT_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

async fn start_server(client: Arc<ObjectClient>) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
    let config = ServerConfig::default()
        .bind("127.0.0.1", 0)
        .export_size(TEST_EXPORT_SIZE);
    let server = NbdServer::bind(config, client).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, shutdown, task)
}

struct TestClient {
    stream: TcpStream,
}

#[derive(Debug)]
struct OptionReply {
    reply_type: u32,
    data: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream }
    }

    /// Consume the greeting and send our flags.
    async fn handshake(&mut self) {
        assert_eq!(self.stream.read_u64().await.unwrap(), NBD_INIT_MAGIC);
        assert_eq!(self.stream.read_u64().await.unwrap(), NBD_OPTS_MAGIC);
        let flags = self.stream.read_u16().await.unwrap();
        assert_ne!(flags & 0x0001, 0, "server must advertise FIXED_NEWSTYLE");
        self.stream.write_u32(0x0001).await.unwrap();
    }

    async fn send_option(&mut self, option: u32, payload: &[u8]) {
        self.stream.write_u64(NBD_OPTS_MAGIC).await.unwrap();
        self.stream.write_u32(option).await.unwrap();
        self.stream.write_u32(payload.len() as u32).await.unwrap();
        self.stream.write_all(payload).await.unwrap();
    }

    async fn read_option_reply(&mut self, expect_option: u32) -> OptionReply {
        assert_eq!(self.stream.read_u64().await.unwrap(), NBD_REP_MAGIC);
        assert_eq!(self.stream.read_u32().await.unwrap(), expect_option);
        let reply_type = self.stream.read_u32().await.unwrap();
        let length = self.stream.read_u32().await.unwrap();
        let mut data = vec![0u8; length as usize];
        if length > 0 {
            self.stream.read_exact(&mut data).await.unwrap();
        }
        OptionReply { reply_type, data }
    }

    /// Negotiate an export. On success returns (size, transmission flags);
    /// on refusal returns the error reply type.
    async fn go(&mut self, export: &str) -> Result<(u64, u16), u32> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(export.len() as u32).to_be_bytes());
        payload.extend_from_slice(export.as_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        self.send_option(NBD_OPT_GO, &payload).await;

        let mut export_info = None;
        loop {
            let reply = self.read_option_reply(NBD_OPT_GO).await;
            match reply.reply_type {
                NBD_REP_INFO => {
                    let info_type = u16::from_be_bytes([reply.data[0], reply.data[1]]);
                    if info_type == 0 {
                        let size = u64::from_be_bytes(reply.data[2..10].try_into().unwrap());
                        let flags = u16::from_be_bytes([reply.data[10], reply.data[11]]);
                        export_info = Some((size, flags));
                    }
                }
                NBD_REP_ACK => return Ok(export_info.expect("REP_INFO before REP_ACK")),
                other => return Err(other),
            }
        }
    }

    async fn send_command(&mut self, kind: u16, handle: u64, offset: u64, length: u32) {
        self.stream.write_u32(NBD_REQUEST_MAGIC).await.unwrap();
        self.stream.write_u16(0).await.unwrap();
        self.stream.write_u16(kind).await.unwrap();
        self.stream.write_u64(handle).await.unwrap();
        self.stream.write_u64(offset).await.unwrap();
        self.stream.write_u32(length).await.unwrap();
    }

    async fn read_simple_reply(&mut self, expect_handle: u64) -> u32 {
        assert_eq!(self.stream.read_u32().await.unwrap(), NBD_REPLY_MAGIC);
        let errno = self.stream.read_u32().await.unwrap();
        assert_eq!(self.stream.read_u64().await.unwrap(), expect_handle);
        errno
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> u32 {
        self.send_command(NBD_CMD_WRITE, 0x57, offset, data.len() as u32)
            .await;
        self.stream.write_all(data).await.unwrap();
        self.read_simple_reply(0x57).await
    }

    async fn read(&mut self, offset: u64, length: u32) -> (u32, Vec<u8>) {
        self.send_command(NBD_CMD_READ, 0x52, offset, length).await;
        let errno = self.read_simple_reply(0x52).await;
        let mut data = vec![0u8; if errno == 0 { length as usize } else { 0 }];
        if errno == 0 && length > 0 {
            self.stream.read_exact(&mut data).await.unwrap();
        }
        (errno, data)
    }

    async fn flush(&mut self) -> u32 {
        self.send_command(NBD_CMD_FLUSH, 0x46, 0, 0).await;
        self.read_simple_reply(0x46).await
    }

    async fn disconnect(mut self) {
        self.send_command(NBD_CMD_DISC, 0x44, 0, 0).await;
        // No reply; wait for the server to drop the connection.
        let mut buf = [0u8; 1];
        let _ = self.stream.read(&mut buf).await;
    }
}

/// Connect, handshake, and negotiate in one step.
async fn attach(addr: SocketAddr, export: &str) -> TestClient {
    let mut client = TestClient::connect(addr).await;
    client.handshake().await;
    let (size, flags) = client.go(export).await.expect("negotiation succeeds");
    assert_eq!(size, TEST_EXPORT_SIZE);
    assert_ne!(flags & 0x0001, 0); // HAS_FLAGS
    assert_ne!(flags & 0x0004, 0); // SEND_FLUSH
    client
}

#[tokio::test]
async fn test_basic_persistence() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "alpha").await;
    assert_eq!(client.write(0, b"Hello").await, 0);
    let (errno, data) = client.read(0, 5).await;
    assert_eq!(errno, 0);
    assert_eq!(&data, b"Hello");
    assert_eq!(client.flush().await, 0);
    client.disconnect().await;

    // A new session observes the flushed bytes.
    let mut client = retry_attach(addr, "alpha").await;
    let (errno, data) = client.read(0, 5).await;
    assert_eq!(errno, 0);
    assert_eq!(&data, b"Hello");
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_sparse_read_is_zeros() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "beta").await;
    let (errno, data) = client.read(1048576, 4096).await;
    assert_eq!(errno, 0);
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|b| *b == 0));
    client.disconnect().await;

    // No data objects were created by reading.
    assert!(store
        .head("blocks/beta/0000000000000000")
        .await
        .unwrap()
        .is_none());

    shutdown.signal();
}

#[tokio::test]
async fn test_unflushed_writes_are_not_durable() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "delta").await;
    assert_eq!(client.write(0, b"X").await, 0);
    client.disconnect().await;

    let mut client = retry_attach(addr, "delta").await;
    let (errno, data) = client.read(0, 1).await;
    assert_eq!(errno, 0);
    assert_eq!(data, vec![0u8]);
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_persistence_across_server_restart() {
    let store = Arc::new(ObjectClient::in_memory());

    let (addr, shutdown, task) = start_server(Arc::clone(&store)).await;
    let mut client = attach(addr, "alpha").await;
    assert_eq!(client.write(4096, b"survives").await, 0);
    assert_eq!(client.flush().await, 0);
    client.disconnect().await;
    shutdown.signal();
    task.await.unwrap();

    // Fresh server process against the same object store.
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;
    let mut client = retry_attach(addr, "alpha").await;
    let (errno, data) = client.read(4096, 8).await;
    assert_eq!(errno, 0);
    assert_eq!(&data, b"survives");
    client.disconnect().await;
    shutdown.signal();
}

#[tokio::test]
async fn test_lease_excludes_second_writer() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let holder = attach(addr, "epsilon").await;

    // A second client is refused by policy while the lease is held.
    let mut second = TestClient::connect(addr).await;
    second.handshake().await;
    assert_eq!(second.go("epsilon").await.unwrap_err(), NBD_REP_ERR_POLICY);

    // A different export is unaffected.
    let other = attach(addr, "other").await;
    other.disconnect().await;

    // Clean disconnect releases the lease for the next client.
    holder.disconnect().await;
    let third = retry_attach(addr, "epsilon").await;
    third.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_out_of_range_is_einval_and_session_survives() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "edge").await;

    let (errno, _) = client.read(TEST_EXPORT_SIZE, 1).await;
    assert_eq!(errno, 22);

    assert_eq!(client.write(TEST_EXPORT_SIZE - 1, b"ab").await, 22);

    // The session is still alive and serves valid requests.
    let (errno, data) = client.read(0, 16).await;
    assert_eq!(errno, 0);
    assert_eq!(data.len(), 16);
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_zero_length_ops_succeed() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "nil").await;
    let (errno, data) = client.read(0, 0).await;
    assert_eq!(errno, 0);
    assert!(data.is_empty());
    assert_eq!(client.write(0, b"").await, 0);
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_unknown_command_is_einval() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "odd").await;
    client.send_command(9, 0x99, 0, 0).await;
    assert_eq!(client.read_simple_reply(0x99).await, 22);

    // Still alive.
    let (errno, _) = client.read(0, 1).await;
    assert_eq!(errno, 0);
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_abort_option_acked() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = TestClient::connect(addr).await;
    client.handshake().await;
    client.send_option(NBD_OPT_ABORT, &[]).await;
    let reply = client.read_option_reply(NBD_OPT_ABORT).await;
    assert_eq!(reply.reply_type, NBD_REP_ACK);
    assert!(reply.data.is_empty());

    shutdown.signal();
}

#[tokio::test]
async fn test_unknown_option_keeps_negotiating() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = TestClient::connect(addr).await;
    client.handshake().await;

    // NBD_OPT_STARTTLS is not supported; negotiation continues.
    client.send_option(5, &[]).await;
    let reply = client.read_option_reply(5).await;
    assert_eq!(reply.reply_type, NBD_REP_ERR_UNSUP);

    let (size, _) = client.go("after-unsup").await.unwrap();
    assert_eq!(size, TEST_EXPORT_SIZE);
    client.disconnect().await;

    shutdown.signal();
}

#[tokio::test]
async fn test_cross_block_write_over_the_wire() {
    let store = Arc::new(ObjectClient::in_memory());
    let (addr, shutdown, _task) = start_server(Arc::clone(&store)).await;

    let mut client = attach(addr, "gamma").await;
    let payload = vec![0xABu8; 262144];
    assert_eq!(client.write(65536, &payload).await, 0);
    assert_eq!(client.flush().await, 0);

    let (errno, data) = client.read(65536, 262144).await;
    assert_eq!(errno, 0);
    assert!(data.iter().all(|b| *b == 0xAB));

    // Straddling reads mix durable data and zeros correctly.
    let (errno, data) = client.read(65536 + 262144 - 4, 8).await;
    assert_eq!(errno, 0);
    assert_eq!(&data[..4], &[0xAB; 4]);
    assert_eq!(&data[4..], &[0u8; 4]);
    client.disconnect().await;

    shutdown.signal();
}

/// Attach with retries: lease release after a disconnect is asynchronous
/// on the server side, but must complete within a couple of seconds.
async fn retry_attach(addr: SocketAddr, export: &str) -> TestClient {
    for _ in 0..40 {
        let mut client = TestClient::connect(addr).await;
        client.handshake().await;
        if client.go(export).await.is_ok() {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not attach to '{export}' within 2s");
}
