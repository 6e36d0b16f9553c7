//! A mock cluster speaking the tessera wire protocol.
//!
//! Each node accepts logins, serves `ArbitraryDurationProc(ms)` (sleeps,
//! then answers SUCCESS), and returns canned results for the system
//! procedures the runtime issues during startup and topology refresh.
//! Nodes know the whole cluster, so topology responses can reference
//! peers the client has not connected to yet.

// Shared by several test binaries; each uses a subset.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tessera_wire::{
    ClientResponse, Hashinator, ParamType, ParamValue, ProcedureInvocation, ResultTable, Status,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What one node knows: its own id and the whole cluster's layout.
#[derive(Clone)]
struct NodeSpec {
    host_id: i32,
    cluster: (i64, i32),
    /// (host id, client port) for every node, self included.
    peers: Vec<(i32, u16)>,
}

pub struct MockNode {
    pub addr: SocketAddr,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl MockNode {
    /// A single node on an ephemeral port.
    pub async fn start(host_id: i32, cluster: (i64, i32)) -> MockNode {
        Self::start_at("127.0.0.1:0".parse().unwrap(), host_id, cluster).await
    }

    /// A single node on a specific address; used by reconnection tests
    /// that restart the node on the same port.
    pub async fn start_at(addr: SocketAddr, host_id: i32, cluster: (i64, i32)) -> MockNode {
        let listener = TcpListener::bind(addr).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let spec = NodeSpec {
            host_id,
            cluster,
            peers: vec![(host_id, port)],
        };
        Self::serve(listener, spec)
    }

    /// A whole cluster: `n` nodes that all report the same topology.
    pub async fn start_cluster(cluster: (i64, i32), n: usize) -> Vec<MockNode> {
        let mut listeners = Vec::with_capacity(n);
        let mut peers = Vec::with_capacity(n);
        for host_id in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.push((host_id as i32, listener.local_addr().unwrap().port()));
            listeners.push(listener);
        }
        listeners
            .into_iter()
            .enumerate()
            .map(|(host_id, listener)| {
                Self::serve(
                    listener,
                    NodeSpec {
                        host_id: host_id as i32,
                        cluster,
                        peers: peers.clone(),
                    },
                )
            })
            .collect()
    }

    fn serve(listener: TcpListener, spec: NodeSpec) -> MockNode {
        let addr = listener.local_addr().unwrap();
        let conn_tasks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tasks = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let task = tokio::spawn(serve_connection(stream, spec.clone()));
                tasks.lock().unwrap().push(task);
            }
        });
        MockNode {
            addr,
            accept_task,
            conn_tasks,
        }
    }

    /// Drop the listener and every live connection.
    pub fn kill(&self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_connection(mut stream: TcpStream, spec: NodeSpec) {
    // Login exchange: consume the login frame, answer with identity.
    if read_frame(&mut stream).await.is_none() {
        return;
    }
    let mut body = BytesMut::new();
    body.put_u8(2); // protocol version
    body.put_i8(0); // success
    body.put_i32(spec.host_id);
    body.put_i64(1); // connection id
    body.put_i64(spec.cluster.0);
    body.put_i32(spec.cluster.1);
    let build = b"mock-1.0";
    body.put_i32(build.len() as i32);
    body.put_slice(build);
    if write_frame_to(&mut stream, &body).await.is_err() {
        return;
    }

    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = i32::from_be_bytes(len_buf);
        if len <= 0 {
            return;
        }
        let mut frame = vec![0u8; len as usize];
        if read_half.read_exact(&mut frame).await.is_err() {
            return;
        }
        let invocation = match ProcedureInvocation::read_from(Bytes::from(frame)) {
            Ok(inv) => inv,
            Err(_) => return,
        };
        let writer = writer.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let response = dispatch(&invocation, &spec).await;
            let _ = send_response(&writer, response).await;
        });
    }
}

async fn dispatch(invocation: &ProcedureInvocation, spec: &NodeSpec) -> ClientResponse {
    let handle = invocation.client_handle();
    let mut response = match invocation.proc_name() {
        "ArbitraryDurationProc" => {
            let ms = invocation
                .params()
                .ok()
                .and_then(|p| match p.get(0) {
                    Some(ParamValue::I64(v)) => Some(*v),
                    Some(ParamValue::I32(v)) => Some(*v as i64),
                    _ => None,
                })
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
            let mut table = ResultTable::new(vec![("RESULT", ParamType::BigInt)]);
            table.add_row(vec![ParamValue::I64(ms)]);
            ClientResponse::new(Status::Success, vec![table], "")
        }
        "@Ping" | "@Subscribe" => ClientResponse::new(Status::Success, Vec::new(), ""),
        "@Statistics" => topo_response(spec),
        "@SystemCatalog" => catalog_response(),
        "@SystemInformation" => overview_response(spec),
        "@GetPartitionKeys" => partition_keys_response(spec),
        other => ClientResponse::new(
            Status::UnexpectedFailure,
            Vec::new(),
            format!("unknown procedure {other}"),
        ),
    };
    response.set_client_handle(handle);
    response
}

/// One partition per node; every node appears in every partition's Sites
/// so the client discovers unconnected peers.
fn topo_response(spec: &NodeSpec) -> ClientResponse {
    let sites = spec
        .peers
        .iter()
        .map(|(id, _)| format!("{id}:0"))
        .collect::<Vec<_>>()
        .join(",");
    let mut partitions = ResultTable::new(vec![
        ("Partition", ParamType::Integer),
        ("Leader", ParamType::String),
        ("Sites", ParamType::String),
    ]);
    for (i, (host_id, _)) in spec.peers.iter().enumerate() {
        partitions.add_row(vec![
            ParamValue::I32(i as i32),
            ParamValue::Str(format!("{host_id}:0")),
            ParamValue::Str(sites.clone()),
        ]);
    }

    let mut hash_config = ResultTable::new(vec![("HASHCONFIG", ParamType::VarBinary)]);
    hash_config.add_row(vec![ParamValue::Bytes(Bytes::from(
        Hashinator::config_bytes(&ring_tokens(spec.peers.len())),
    ))]);

    ClientResponse::new(Status::Success, vec![partitions, hash_config], "")
}

/// Evenly spaced tokens over the i64 range, one per partition.
fn ring_tokens(n: usize) -> Vec<(i64, i32)> {
    let span = (u64::MAX as u128) + 1;
    (0..n)
        .map(|i| {
            let token = (i64::MIN as i128) + (i as i128 * span as i128 / n as i128);
            (token as i64, i as i32)
        })
        .collect()
}

fn catalog_response() -> ClientResponse {
    let mut table = ResultTable::new(vec![
        ("CAT", ParamType::String),
        ("SCHEMA", ParamType::String),
        ("NAME", ParamType::String),
        ("TYPE", ParamType::String),
        ("REMARKS", ParamType::String),
        ("UNUSED", ParamType::String),
        ("INFO", ParamType::String),
    ]);
    table.add_row(vec![
        ParamValue::Str("".into()),
        ParamValue::Str("".into()),
        ParamValue::Str("ArbitraryDurationProc".into()),
        ParamValue::Str("PROCEDURE".into()),
        ParamValue::Str("".into()),
        ParamValue::Str("".into()),
        ParamValue::Str(
            r#"{"readOnly":false,"singlePartition":true,"partitionParameter":0,"partitionParameterType":6}"#
                .into(),
        ),
    ]);
    ClientResponse::new(Status::Success, vec![table], "")
}

fn overview_response(spec: &NodeSpec) -> ClientResponse {
    let mut table = ResultTable::new(vec![
        ("HOST_ID", ParamType::Integer),
        ("KEY", ParamType::String),
        ("VALUE", ParamType::String),
    ]);
    for (host_id, port) in &spec.peers {
        table.add_row(vec![
            ParamValue::I32(*host_id),
            ParamValue::Str("IPADDRESS".into()),
            ParamValue::Str("127.0.0.1".into()),
        ]);
        table.add_row(vec![
            ParamValue::I32(*host_id),
            ParamValue::Str("CLIENTPORT".into()),
            ParamValue::Str(port.to_string()),
        ]);
        table.add_row(vec![
            ParamValue::I32(*host_id),
            ParamValue::Str("ADMINPORT".into()),
            ParamValue::Str(port.wrapping_add(1000).to_string()),
        ]);
    }
    ClientResponse::new(Status::Success, vec![table], "")
}

fn partition_keys_response(spec: &NodeSpec) -> ClientResponse {
    let mut table = ResultTable::new(vec![
        ("PARTITION_ID", ParamType::Integer),
        ("PARTITION_KEY", ParamType::Integer),
    ]);
    for i in 0..spec.peers.len() as i32 {
        table.add_row(vec![ParamValue::I32(i), ParamValue::I32(i)]);
    }
    ClientResponse::new(Status::Success, vec![table], "")
}

async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = i32::from_be_bytes(len_buf);
    if len <= 0 {
        return None;
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.ok()?;
    Some(Bytes::from(body))
}

async fn write_frame_to(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_i32(body.len() as i32);
    frame.put_slice(body);
    stream.write_all(&frame).await
}

async fn send_response(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    response: ClientResponse,
) -> std::io::Result<()> {
    let mut body = BytesMut::new();
    response.write_to(&mut body);
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_i32(body.len() as i32);
    frame.put_slice(&body);
    writer.lock().await.write_all(&frame).await
}

/// Settle time after connect: lets the subscription and topology traffic
/// complete so tests observe a quiet client.
pub async fn settle(client: &tessera_client::Client) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.drain().await;
}
