//! A blocking TCP implementation of `rpc_pb::Client`/`rpc_pb::Server`.
//!
//! One thread pair serves each connection: a reader thread that
//! decodes frames and dispatches into the bound `rpc_pb::Server`, and
//! the calling thread that writes the response back out under a
//! per-connection write lock. There is no poll loop and no TLS; synod
//! targets a trusted cluster network, not an Internet-facing one.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use biometrics::Counter;

use buffertk::{stack_pack, Unpackable};

use indicio::{clue, INFO};

use rpc_pb::{Context, Error as RpcError, Frame, Request, Response, Server, Status};

use crate::LOGGING;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECT: Counter = Counter::new("synod.transport.wire.connect");
static CONNECT_FAILED: Counter = Counter::new("synod.transport.wire.connect.error");
static CALL: Counter = Counter::new("synod.transport.wire.call");
static CALL_FAILED: Counter = Counter::new("synod.transport.wire.call.error");
static ACCEPT: Counter = Counter::new("synod.transport.wire.accept");
static DISPATCH: Counter = Counter::new("synod.transport.wire.dispatch");
static DISPATCH_FAILED: Counter = Counter::new("synod.transport.wire.dispatch.error");
static FRAME_CORRUPT: Counter = Counter::new("synod.transport.wire.frame_corrupt");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CONNECT);
    collector.register_counter(&CONNECT_FAILED);
    collector.register_counter(&CALL);
    collector.register_counter(&CALL_FAILED);
    collector.register_counter(&ACCEPT);
    collector.register_counter(&DISPATCH);
    collector.register_counter(&DISPATCH_FAILED);
    collector.register_counter(&FRAME_CORRUPT);
}

const MAX_FRAME_HEADER: usize = 32;

fn write_framed(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let frame = Frame::from_buffer(body);
    let frame_bytes = stack_pack(frame).to_vec();
    debug_assert!(frame_bytes.len() <= MAX_FRAME_HEADER);
    stream.write_all(&[frame_bytes.len() as u8])?;
    stream.write_all(&frame_bytes)?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_framed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_byte = [0u8; 1];
    stream.read_exact(&mut len_byte)?;
    let mut frame_bytes = vec![0u8; len_byte[0] as usize];
    stream.read_exact(&mut frame_bytes)?;
    let (frame, _) = Frame::unpack(&frame_bytes).map_err(|_| {
        FRAME_CORRUPT.click();
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed frame header")
    })?;
    let mut body = vec![0u8; frame.size as usize];
    stream.read_exact(&mut body)?;
    if crc32c::crc32c(&body) != frame.crc32c {
        FRAME_CORRUPT.click();
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame checksum mismatch",
        ));
    }
    Ok(body)
}

//////////////////////////////////////////// TcpClient ///////////////////////////////////////////

/// A single, lazily-connected TCP link to one peer.  Every call takes
/// an exclusive lock on the stream: requests to the same peer are
/// pipelined by the caller's own thread, not multiplexed in flight,
/// which is adequate for the request volumes a replicated log sees.
pub struct TcpClient {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    seq_no: AtomicU64,
}

impl TcpClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Mutex::new(None),
            seq_no: AtomicU64::new(0),
        }
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut TcpStream) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        let mut guard = self.stream.lock().unwrap();
        if guard.is_none() {
            CONNECT.click();
            match TcpStream::connect(&self.addr) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    *guard = Some(stream);
                }
                Err(err) => {
                    CONNECT_FAILED.click();
                    return Err(err);
                }
            }
        }
        let stream = guard.as_mut().unwrap();
        match f(stream) {
            Ok(value) => Ok(value),
            Err(err) => {
                // The connection is presumed dead; drop it so the next
                // call reconnects instead of retrying a broken stream.
                *guard = None;
                Err(err)
            }
        }
    }
}

impl rpc_pb::Client for TcpClient {
    fn call(&self, ctx: &Context, server: &str, method: &str, req: &[u8]) -> Status {
        CALL.click();
        let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            service: server,
            method,
            seq_no,
            body: req,
            caller: ctx.clients(),
            trace: ctx.trace_id(),
        };
        let request_bytes = stack_pack(request).to_vec();
        let result = self.with_stream(|stream| {
            write_framed(stream, &request_bytes)?;
            read_framed(stream)
        });
        let response_bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                CALL_FAILED.click();
                clue!(LOGGING, INFO, {
                    wire_client_call_failed: {
                        addr: self.addr.clone(),
                        error: err.to_string(),
                    },
                });
                return Err(RpcError::from(err));
            }
        };
        let (response, _) = match Response::unpack(&response_bytes) {
            Ok(pair) => pair,
            Err(err) => return Err(RpcError::from(err)),
        };
        if let Some(rpc_error) = response.rpc_error {
            let (err, _) = RpcError::unpack(rpc_error).map_err(RpcError::from)?;
            return Err(err);
        }
        match (response.body, response.service_error) {
            (Some(body), _) => Ok(Ok(body.to_vec())),
            (None, Some(err)) => Ok(Err(err.to_vec())),
            (None, None) => Ok(Ok(Vec::new())),
        }
    }
}

//////////////////////////////////////////// TcpServer ///////////////////////////////////////////

/// Binds a `rpc_pb::Server` to a TCP listener.  Each accepted
/// connection gets its own thread that reads requests, dispatches
/// them, and writes replies back in order.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub fn bind(addr: impl AsRef<str>) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr.as_ref())?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve `server` forever, spawning a thread per connection.
    /// Returns only if accepting fails outright.
    pub fn serve<S: Server + Send + Sync + 'static>(
        self,
        server: Arc<S>,
    ) -> std::io::Result<()> {
        for incoming in self.listener.incoming() {
            let stream = incoming?;
            ACCEPT.click();
            let server = Arc::clone(&server);
            std::thread::spawn(move || {
                if let Err(err) = serve_connection(stream, server) {
                    clue!(LOGGING, INFO, {
                        wire_server_connection_closed: {
                            error: err.to_string(),
                        },
                    });
                }
            });
        }
        Ok(())
    }
}

fn serve_connection<S: Server + ?Sized>(
    mut stream: TcpStream,
    server: Arc<S>,
) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    loop {
        let request_bytes = match read_framed(&mut stream) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };
        let (request, _) = Request::unpack(&request_bytes).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed request")
        })?;
        DISPATCH.click();
        let ctx = Context::from(&request);
        let seq_no = request.seq_no;
        let trace = request.trace;
        let status = server.call(&ctx, request.method, request.body);
        let response_bytes = match status {
            Ok(Ok(body)) => {
                let response = Response {
                    seq_no,
                    trace,
                    body: Some(&body),
                    service_error: None,
                    rpc_error: None,
                };
                stack_pack(response).to_vec()
            }
            Ok(Err(service_error)) => {
                let response = Response {
                    seq_no,
                    trace,
                    body: None,
                    service_error: Some(&service_error),
                    rpc_error: None,
                };
                stack_pack(response).to_vec()
            }
            Err(rpc_error) => {
                DISPATCH_FAILED.click();
                let rpc_error_bytes = stack_pack(rpc_error).to_vec();
                let response = Response {
                    seq_no,
                    trace,
                    body: None,
                    service_error: None,
                    rpc_error: Some(&rpc_error_bytes),
                };
                stack_pack(response).to_vec()
            }
        };
        write_framed(&mut stream, &response_bytes)?;
    }
}
