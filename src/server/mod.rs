//! Reference co-processor.
//!
//! [`HsmServer`] answers protocol frames from a key cache, an object store,
//! and tables of registered callbacks and algorithms. It plugs straight into a
//! [`Loopback`](crate::protocol::Loopback) for in-process use, or sits behind
//! a [`NetworkServer`] that speaks the same frames over TCP.
//!
//! State is shared by every connection. The handshake is not: each value
//! returned by [`HsmServer::connection`] starts closed and refuses anything
//! outside the COMM group until it is opened.
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bincode::{Decode, Encode};
use log::{debug, info, warn};

use crate::{
    config::ServerConfig,
    protocol::{
        ErrorCode, FrameHandler, Header, NvmMetadata, ProtocolTransport, TransportError,
        header::{COMM_DATA_LEN, action, decode_body, encode_body, group},
        message::{
            CRYPTO_RESPONSE_SIZE, CUSTOM_CB_COUNT, CUSTOM_INVOKE, CUSTOM_QUERY,
            CUSTOM_RESPONSE_SIZE, CommInitResponse, CryptoRequest, CryptoResponse, CustomRequest,
            CustomResponse, IdRequest, KeyCacheRequest, KeyCacheResponse, KeyExportResponse,
            METADATA_SIZE, NVM_MAX_DESTROY, NVM_READ_RESPONSE_SIZE, NvmAddObjectDmaRequest,
            NvmDestroyRequest, NvmInitResponse, NvmListRequest, NvmListResponse,
            NvmMetadataResponse, NvmReadDmaRequest, NvmReadRequest, NvmReadResponse, RcResponse,
        },
    },
};

mod dma;
mod keystore;
mod nvm;
mod thread;

pub use dma::DmaPolicy;
pub use thread::ThreadPool;

use keystore::{CachedKey, KeyStore};
use nvm::ObjectStore;

/// Application callback. `Err` carries the handler's own return code, which
/// the client receives alongside a successful dispatch. Handlers run without
/// the server state locked, so they may call back into the server.
pub type CustomHandler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, i32> + Send + Sync>;

/// Algorithm implementation, given the cached key bytes and the input.
pub type CryptoHandler = Arc<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, ErrorCode> + Send + Sync>;

struct Core {
    config: ServerConfig,
    next_client_id: u32,
    keys: KeyStore,
    nvm: ObjectStore,
    custom: [Option<CustomHandler>; CUSTOM_CB_COUNT as usize],
    crypto: HashMap<u16, CryptoHandler>,
}

pub struct HsmServer {
    core: Arc<Mutex<Core>>,
    client_id: Option<u32>,
}

type Reply = Result<Vec<u8>, ErrorCode>;

fn body<D: Decode<()>>(payload: &[u8]) -> Result<(D, &[u8]), ErrorCode> {
    decode_body(payload).map_err(|e| {
        debug!("undecodable request body: {e}");
        ErrorCode::BadArgs
    })
}

fn reply<E: Encode>(body: &E, trailing: &[u8]) -> Reply {
    encode_body(body, trailing).map_err(|e| {
        warn!("failed to encode response: {e}");
        ErrorCode::Aborted
    })
}

fn ok() -> Reply {
    reply(&RcResponse { rc: 0 }, &[])
}

fn ensure_room(len: usize, body_size: usize) -> Result<(), ErrorCode> {
    if len > COMM_DATA_LEN - body_size {
        warn!("{len} byte output does not fit a response");
        return Err(ErrorCode::NoSpace);
    }
    Ok(())
}

impl HsmServer {
    pub fn new(config: ServerConfig) -> Self {
        let core = Core {
            next_client_id: config.first_client_id,
            keys: KeyStore::new(config.key_slots),
            nvm: ObjectStore::new(config.nvm_capacity, config.nvm_max_objects),
            custom: Default::default(),
            crypto: HashMap::new(),
            config,
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            client_id: None,
        }
    }

    /// A new, unopened session over the same state.
    pub fn connection(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            client_id: None,
        }
    }

    /// Client id handed out by this session's handshake.
    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_custom<F>(&self, id: u16, handler: F) -> Result<(), ErrorCode>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, i32> + Send + Sync + 'static,
    {
        let mut core = self.core();
        let slot = core
            .custom
            .get_mut(usize::from(id))
            .ok_or(ErrorCode::BadArgs)?;
        *slot = Some(Arc::new(handler));
        info!("registered callback {id}");
        Ok(())
    }

    pub fn register_crypto<F>(&self, algorithm: u16, handler: F)
    where
        F: Fn(&[u8], &[u8]) -> Result<Vec<u8>, ErrorCode> + Send + Sync + 'static,
    {
        self.core().crypto.insert(algorithm, Arc::new(handler));
        info!("registered algorithm {algorithm:#06x}");
    }

    fn dispatch(&mut self, header: &Header, payload: &[u8]) -> Reply {
        if header.group != group::COMM && self.client_id.is_none() {
            debug!("request {} before the handshake", header.kind());
            return Err(ErrorCode::Aborted);
        }

        match header.group {
            group::COMM => self.comm(header.action, payload),
            group::NVM => self.nvm(header.action, payload),
            group::KEY => self.key(header.action, payload),
            group::CRYPTO => self.crypto(header.action, payload),
            group::CUSTOM => self.custom(header.action, payload),
            _ => Err(ErrorCode::Unsupported),
        }
    }

    fn comm(&mut self, action: u16, payload: &[u8]) -> Reply {
        match action {
            action::comm::INIT => {
                let (client_id, server_id) = {
                    let mut core = self.core();
                    let client_id = core.next_client_id;
                    core.next_client_id = client_id.wrapping_add(1);
                    (client_id, core.config.server_id)
                };
                self.client_id = Some(client_id);
                info!("client {client_id} connected");
                reply(
                    &CommInitResponse {
                        client_id,
                        server_id,
                    },
                    &[],
                )
            }
            action::comm::CLOSE => {
                if let Some(client_id) = self.client_id.take() {
                    info!("client {client_id} closed");
                }
                Ok(Vec::new())
            }
            action::comm::ECHO => Ok(payload.to_vec()),
            _ => Err(ErrorCode::Unsupported),
        }
    }

    fn nvm(&mut self, action: u16, payload: &[u8]) -> Reply {
        match action {
            action::nvm::INIT => {
                let server_nvm_id = self.core().config.server_nvm_id;
                reply(
                    &NvmInitResponse {
                        rc: 0,
                        client_nvm_id: self.client_id.unwrap_or_default(),
                        server_nvm_id,
                    },
                    &[],
                )
            }
            action::nvm::CLEANUP => {
                self.core().nvm.reclaim();
                ok()
            }
            action::nvm::GET_AVAILABLE => reply(&self.core().nvm.available(), &[]),
            action::nvm::ADD_OBJECT => {
                let (metadata, data): (NvmMetadata, _) = body(payload)?;
                self.core().nvm.add(metadata, data.to_vec())?;
                ok()
            }
            action::nvm::LIST => {
                let (req, _): (NvmListRequest, _) = body(payload)?;
                let (count, id) = self.core().nvm.list(req.access, req.flags, req.start_id);
                reply(&NvmListResponse { rc: 0, count, id }, &[])
            }
            action::nvm::GET_METADATA => {
                let (req, _): (IdRequest, _) = body(payload)?;
                let metadata = self.core().nvm.metadata(req.id)?;
                reply(&NvmMetadataResponse { rc: 0, metadata }, &[])
            }
            action::nvm::DESTROY_OBJECTS => {
                let (req, ids): (NvmDestroyRequest, _) = body(payload)?;
                let count = usize::from(req.count);
                if count > NVM_MAX_DESTROY || ids.len() != 2 * count {
                    return Err(ErrorCode::BadArgs);
                }
                let ids: Vec<u16> = ids
                    .chunks_exact(2)
                    .map(|id| u16::from_be_bytes([id[0], id[1]]))
                    .collect();
                self.core().nvm.destroy(&ids)?;
                ok()
            }
            action::nvm::READ => {
                let (req, _): (NvmReadRequest, _) = body(payload)?;
                if usize::from(req.len) > COMM_DATA_LEN - NVM_READ_RESPONSE_SIZE {
                    return Err(ErrorCode::BadArgs);
                }
                let core = self.core();
                let data = core.nvm.read(req.id, req.offset, req.len)?;
                reply(
                    &NvmReadResponse {
                        rc: 0,
                        len: data.len() as u16,
                    },
                    data,
                )
            }
            action::nvm::ADD_OBJECT_DMA32 => self.add_object_dma::<u32>(payload),
            action::nvm::READ_DMA32 => self.read_dma::<u32>(payload),
            action::nvm::ADD_OBJECT_DMA64 => self.add_object_dma::<u64>(payload),
            action::nvm::READ_DMA64 => self.read_dma::<u64>(payload),
            _ => Err(ErrorCode::Unsupported),
        }
    }

    fn add_object_dma<A>(&mut self, payload: &[u8]) -> Reply
    where
        A: Decode<()> + Into<u64>,
    {
        let (req, _): (NvmAddObjectDmaRequest<A>, _) = body(payload)?;
        let metadata_addr = req.metadata_hostaddr.into();
        let data_addr = req.data_hostaddr.into();
        let data_len = usize::from(req.data_len);

        let mut core = self.core();
        core.config.dma.check(metadata_addr, METADATA_SIZE)?;
        core.config.dma.check(data_addr, data_len)?;

        // SAFETY: both regions passed the configured policy, which only admits
        // memory the client lent for the duration of this request.
        let (metadata, data) = unsafe {
            (
                dma::read_host(metadata_addr, METADATA_SIZE),
                dma::read_host(data_addr, data_len),
            )
        };
        let (metadata, _): (NvmMetadata, _) = body(&metadata)?;
        let metadata = NvmMetadata {
            len: req.data_len,
            ..metadata
        };

        debug!("direct-memory add of object {} ({data_len} bytes)", metadata.id);
        core.nvm.add(metadata, data)?;
        ok()
    }

    fn read_dma<A>(&mut self, payload: &[u8]) -> Reply
    where
        A: Decode<()> + Into<u64>,
    {
        let (req, _): (NvmReadDmaRequest<A>, _) = body(payload)?;
        let addr = req.data_hostaddr.into();

        let core = self.core();
        core.config.dma.check(addr, usize::from(req.len))?;
        let data = core.nvm.read(req.id, req.offset, req.len)?;

        // SAFETY: the region passed the configured policy and `data` is no
        // longer than the checked length.
        unsafe { dma::write_host(addr, data) };
        ok()
    }

    fn key(&mut self, action: u16, payload: &[u8]) -> Reply {
        let mut core = self.core();
        let core = &mut *core;

        match action {
            action::key::CACHE => {
                let (req, key): (KeyCacheRequest, _) = body(payload)?;
                if req.len as usize != key.len() {
                    return Err(ErrorCode::BadArgs);
                }
                let cached = CachedKey {
                    flags: req.flags,
                    label: req.label,
                    data: key.to_vec(),
                };
                let id = core.keys.cache(req.id, cached, &core.nvm)?;
                reply(&KeyCacheResponse { rc: 0, id }, &[])
            }
            action::key::EXPORT => {
                let (req, _): (IdRequest, _) = body(payload)?;
                let key = core.keys.get(req.id).ok_or(ErrorCode::NotFound)?;
                reply(
                    &KeyExportResponse {
                        rc: 0,
                        len: key.data.len() as u32,
                        label: key.label,
                    },
                    &key.data,
                )
            }
            action::key::EVICT => {
                let (req, _): (IdRequest, _) = body(payload)?;
                core.keys.evict(req.id)?;
                ok()
            }
            action::key::COMMIT => {
                let (req, _): (IdRequest, _) = body(payload)?;
                core.keys.commit(req.id, &mut core.nvm)?;
                ok()
            }
            action::key::ERASE => {
                let (req, _): (IdRequest, _) = body(payload)?;
                core.keys
                    .erase(req.id, &mut core.nvm, core.config.erase_missing)?;
                ok()
            }
            _ => Err(ErrorCode::Unsupported),
        }
    }

    fn custom(&mut self, id: u16, payload: &[u8]) -> Reply {
        let (req, input): (CustomRequest, _) = body(payload)?;
        let handler = self
            .core()
            .custom
            .get(usize::from(id))
            .ok_or(ErrorCode::BadArgs)?
            .clone();

        match (req.kind, handler) {
            (CUSTOM_QUERY, Some(_)) => reply(&CustomResponse { rc: 0, err: 0 }, &[]),
            (CUSTOM_QUERY, None) => reply(
                &CustomResponse {
                    rc: ErrorCode::NoHandler.into(),
                    err: 0,
                },
                &[],
            ),
            (CUSTOM_INVOKE, Some(handler)) => match handler(input) {
                Ok(output) => {
                    ensure_room(output.len(), CUSTOM_RESPONSE_SIZE)?;
                    reply(&CustomResponse { rc: 0, err: 0 }, &output)
                }
                Err(err) => {
                    debug!("callback {id} returned {err}");
                    reply(&CustomResponse { rc: 0, err }, &[])
                }
            },
            (CUSTOM_INVOKE, None) => Err(ErrorCode::NoHandler),
            _ => Err(ErrorCode::BadArgs),
        }
    }

    fn crypto(&mut self, algorithm: u16, payload: &[u8]) -> Reply {
        let (req, input): (CryptoRequest, _) = body(payload)?;
        if usize::from(req.len) != input.len() {
            return Err(ErrorCode::BadArgs);
        }

        let (handler, key) = {
            let core = self.core();
            let handler = core
                .crypto
                .get(&algorithm)
                .cloned()
                .ok_or(ErrorCode::NoHandler)?;
            let key = core.keys.get(req.key_id).ok_or(ErrorCode::NotFound)?;
            (handler, key.data.clone())
        };

        let output = handler(&key, input)?;
        ensure_room(output.len(), CRYPTO_RESPONSE_SIZE)?;
        reply(
            &CryptoResponse {
                rc: 0,
                len: output.len() as u16,
            },
            &output,
        )
    }
}

impl FrameHandler for HsmServer {
    fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let (header, payload) = match Header::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping malformed request: {e}");
                return Vec::new();
            }
        };

        let body = match self.dispatch(&header, payload) {
            Ok(body) => body,
            Err(code) => {
                debug!("request {} failed: {code}", header.issued());
                // An rc-only body is a prefix of every response layout.
                reply(&RcResponse { rc: code.into() }, &[]).unwrap_or_default()
            }
        };

        Header::frame(header.issued(), &body).unwrap_or_else(|e| {
            warn!("failed to frame response: {e}");
            Vec::new()
        })
    }
}

/// Serves [`HsmServer`] sessions over TCP, one session per connection.
pub struct NetworkServer {
    listener: TcpListener,
    server: HsmServer,
    pool: ThreadPool,
}

impl NetworkServer {
    pub fn bind(address: SocketAddr, server: HsmServer) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        let workers = server.core().config.workers;
        Ok(Self {
            listener,
            server,
            pool: ThreadPool::new(workers),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let session = self.server.connection();
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, session) {
                            warn!("connection ended with error: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, mut session: HsmServer) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    debug!("accepted {peer}");
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(TransportError::Closed) => {
                debug!("{peer} hung up");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = session.handle_frame(&frame);
        transport.write_frame(&response)?;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::{
        Client, ClientConfig,
        protocol::{Issued, Kind, Label, Loopback, TcpTransport},
    };

    use super::*;

    fn request(server: &mut HsmServer, kind: Kind, payload: &[u8]) -> (Header, Vec<u8>) {
        let frame = Header::frame(Issued { seq: 9, kind }, payload).unwrap();
        let response = server.handle_frame(&frame);
        let (header, body) = Header::parse(&response).unwrap();
        (header, body.to_vec())
    }

    fn rc(body: &[u8]) -> ErrorCode {
        let (resp, _): (RcResponse, _) = decode_body(body).unwrap();
        ErrorCode::from(resp.rc)
    }

    #[test]
    fn response_echoes_request_identity() {
        let mut server = HsmServer::new(ServerConfig::default());
        let kind = Kind::new(group::COMM, action::comm::ECHO);
        let (header, body) = request(&mut server, kind, b"ping");

        assert_eq!(header.issued(), Issued { seq: 9, kind });
        assert_eq!(body, b"ping");
    }

    #[test]
    fn unknown_group_is_unsupported() {
        let mut server = HsmServer::new(ServerConfig::default());
        request(&mut server, Kind::new(group::COMM, action::comm::INIT), &[]);

        let (_, body) = request(&mut server, Kind::new(0x0F00, 1), &[]);
        assert_eq!(rc(&body), ErrorCode::Unsupported);
    }

    #[test]
    fn truncated_body_is_bad_args() {
        let mut server = HsmServer::new(ServerConfig::default());
        request(&mut server, Kind::new(group::COMM, action::comm::INIT), &[]);

        let (_, body) = request(&mut server, Kind::new(group::NVM, action::nvm::READ), &[0, 1]);
        assert_eq!(rc(&body), ErrorCode::BadArgs);
    }

    #[test]
    fn malformed_frame_gets_no_answer() {
        let mut server = HsmServer::new(ServerConfig::default());
        assert!(server.handle_frame(&[0, 1, 0]).is_empty());
    }

    #[test]
    fn connections_share_state_not_handshake() {
        let server = HsmServer::new(ServerConfig::default());
        let mut first = Client::connect(Loopback::new(server.connection()), ClientConfig::default())
            .unwrap();
        let mut second =
            Client::connect(Loopback::new(server.connection()), ClientConfig::default()).unwrap();

        let ids = first.open().unwrap();
        first.nvm_add_object(3, 0, 0, b"shared", b"abc").unwrap();

        assert_eq!(
            second.nvm_metadata(3).unwrap_err().code(),
            Some(ErrorCode::Aborted)
        );
        assert_eq!(second.open().unwrap().client_id, ids.client_id + 1);
        assert_eq!(second.nvm_read(3, 0, 3).unwrap(), b"abc");
    }

    #[test]
    fn registering_out_of_range_callback() {
        let server = HsmServer::new(ServerConfig::default());
        assert_eq!(
            server.register_custom(CUSTOM_CB_COUNT, |_: &[u8]| Ok(Vec::new())),
            Err(ErrorCode::BadArgs)
        );
    }

    #[test]
    fn callbacks_may_reenter_the_server() {
        let server = HsmServer::new(ServerConfig::default());
        let handle = server.connection();
        server
            .register_custom(0, move |input: &[u8]| {
                handle
                    .register_custom(1, |_: &[u8]| Ok(b"second".to_vec()))
                    .map_err(i32::from)?;
                Ok(input.to_vec())
            })
            .unwrap();

        let mut client = Client::connect(Loopback::new(server.connection()), ClientConfig::default())
            .unwrap();
        client.open().unwrap();
        assert_eq!(client.custom_call(0, b"first").unwrap().data, b"first");
        assert_eq!(client.custom_call(1, b"").unwrap().data, b"second");
    }

    #[test]
    fn serves_over_tcp() {
        let server = NetworkServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            HsmServer::new(ServerConfig::default().with_workers(2)),
        )
        .unwrap();
        let address = server.local_addr().unwrap();
        thread::spawn(move || server.listen());

        let mut client = Client::connect(TcpTransport::new(address), ClientConfig::default())
            .unwrap();
        client.open().unwrap();
        assert_eq!(client.echo(b"over the wire").unwrap(), b"over the wire");

        let full: Vec<u8> = (0..client.max_payload()).map(|i| i as u8).collect();
        assert_eq!(client.echo(&full).unwrap(), full);

        let id = client.key_cache(0, b"net", &[7; 16], None).unwrap();
        let (label, key) = client.key_export(id).unwrap();
        assert_eq!(label, Label::try_from("net").unwrap());
        assert_eq!(key, vec![7; 16]);

        client.close().unwrap();
        client.disconnect().unwrap();
    }
}
