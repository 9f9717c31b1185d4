use super::protocol::{
    self, Broker, MetadataRequest, MetadataResponse, ProduceRequest, ProduceResponse,
    ProtocolError, RequestHeader,
};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

const NODE_ID: i32 = 1;
const PARTITION_COUNT: i32 = 3;

/// A message recorded from a produce request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
}

/// Errors the server ran into while serving requests
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", .0.join("\n"))]
pub struct RecordedErrors(pub Vec<String>);

#[derive(Default)]
struct Recorded {
    messages: Vec<Message>,
    errors: Vec<String>,
    next_offsets: HashMap<(String, i32), i64>,
    topics: BTreeSet<String>,
}

struct State {
    broker: Broker,
    recorded: Mutex<Recorded>,
}

impl State {
    fn record_error(&self, err: impl ToString) {
        let err = err.to_string();
        warn!(error = %err, "kafkatest request failed");
        self.recorded.lock().errors.push(err);
    }

    /// Answer one request frame. `None` means no response is sent.
    fn handle(&self, mut frame: Bytes) -> Result<Option<Bytes>, ProtocolError> {
        let header = RequestHeader::decode(&mut frame)?;
        let version = header.api_version;
        debug!(
            api_key = header.api_key,
            version,
            correlation_id = header.correlation_id,
            "kafkatest request"
        );

        let mut out = BytesMut::with_capacity(256);
        out.put_i32(header.correlation_id);

        match header.api_key {
            protocol::API_VERSIONS => protocol::encode_api_versions(version, &mut out),
            api_key if !protocol::supports(api_key, version) => {
                return Err(ProtocolError::Unsupported { api_key, version });
            }
            protocol::METADATA => {
                let request = MetadataRequest::decode(&mut frame, version)?;
                self.metadata(request).encode(version, &mut out);
            }
            protocol::PRODUCE => {
                let request = ProduceRequest::decode(&mut frame)?;
                let acks = request.acks;
                let response = self.produce(request)?;
                if acks == 0 {
                    return Ok(None);
                }
                response.encode(version, &mut out);
            }
            api_key => return Err(ProtocolError::Unsupported { api_key, version }),
        }
        Ok(Some(out.freeze()))
    }

    fn metadata(&self, request: MetadataRequest) -> MetadataResponse {
        let mut recorded = self.recorded.lock();
        let topics: Vec<String> = match request.topics {
            Some(topics) => {
                recorded.topics.extend(topics.iter().cloned());
                topics
            }
            None => recorded.topics.iter().cloned().collect(),
        };
        MetadataResponse {
            broker: self.broker.clone(),
            controller_id: NODE_ID,
            topics: topics.into_iter().map(|t| (t, PARTITION_COUNT)).collect(),
        }
    }

    /// Assign offsets and record the messages. A request that fails records
    /// nothing.
    fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, ProtocolError> {
        let mut recorded = self.recorded.lock();
        let mut messages = Vec::new();
        let mut next_offsets = HashMap::new();
        let mut topics = Vec::with_capacity(request.topics.len());

        for topic in request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                let key = (topic.name.clone(), partition.index);
                let first_offset = next_offsets
                    .get(&key)
                    .or_else(|| recorded.next_offsets.get(&key))
                    .copied()
                    .unwrap_or(0);
                let mut next = first_offset;

                for batch in partition.batches {
                    let base = next;
                    for record in batch.records {
                        let millis = batch
                            .first_timestamp
                            .checked_add(record.timestamp_delta)
                            .ok_or(ProtocolError::Overflow("record timestamp"))?;
                        let offset = base
                            .checked_add(record.offset_delta)
                            .ok_or(ProtocolError::Overflow("record offset"))?;
                        messages.push(Message {
                            topic: topic.name.clone(),
                            partition: partition.index,
                            offset,
                            key: record.key,
                            value: record.value,
                            timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
                        });
                    }
                    next = base
                        .checked_add(i64::from(batch.last_offset_delta))
                        .and_then(|last| last.checked_add(1))
                        .ok_or(ProtocolError::Overflow("batch offset"))?;
                }

                next_offsets.insert(key, next);
                partitions.push((partition.index, first_offset));
            }
            topics.push((topic.name, partitions));
        }

        for (topic, _) in &topics {
            recorded.topics.insert(topic.clone());
        }
        recorded.next_offsets.extend(next_offsets);
        recorded.messages.extend(messages);
        Ok(ProduceResponse { topics })
    }
}

/// An incomplete Kafka broker for tests.
///
/// It is the only broker of its cluster, leads every partition, records
/// produced messages and answers metadata requests. Every topic has three
/// partitions.
pub struct Server {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: watch::Sender<bool>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind an ephemeral port on 127.0.0.1 and start serving
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            broker: Broker {
                node_id: NODE_ID,
                host: addr.ip().to_string(),
                port: i32::from(addr.port()),
            },
            recorded: Mutex::new(Recorded::default()),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_loop = tokio::spawn(accept(listener, Arc::clone(&state), shutdown_rx));
        debug!(%addr, "kafkatest server listening");

        Ok(Self {
            addr,
            state,
            shutdown,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Recorded messages in arrival order, or every error seen while serving
    pub fn messages(&self) -> Result<Vec<Message>, RecordedErrors> {
        let recorded = self.state.recorded.lock();
        if !recorded.errors.is_empty() {
            return Err(RecordedErrors(recorded.errors.clone()));
        }
        Ok(recorded.messages.clone())
    }

    /// Stop accepting, signal every connection and wait for them to finish
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.accept_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "kafkatest accept loop failed");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept(listener: TcpListener, state: Arc<State>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "kafkatest connection");
                    connections.spawn(serve(stream, Arc::clone(&state), shutdown.clone()));
                }
                Err(err) => {
                    state.record_error(format!("accept: {}", err));
                    break;
                }
            },
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve(stream: TcpStream, state: Arc<State>, mut shutdown: watch::Receiver<bool>) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            None => return,
            Some(Ok(frame)) => frame.freeze(),
            Some(Err(err)) => {
                if err.kind() != io::ErrorKind::ConnectionReset {
                    state.record_error(format!("read: {}", err));
                }
                return;
            }
        };

        match state.handle(frame) {
            Ok(Some(response)) => {
                if let Err(err) = framed.send(response).await {
                    debug!(error = %err, "kafkatest write failed");
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                state.record_error(err);
                return;
            }
        }
    }
}
