//! Plugin pipeline behaviour across the request lifecycle.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use callframe::{
    BincodeCodec, CallContext, Codec, HookPoint, Plugin, PluginError, RpcServer, ServerConfig,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use common::{Args, Arith, Reply, WireClient};

/// Rejects every other call before the header is read.
struct AlternatingVeto {
    invocations: AtomicUsize,
}

#[async_trait]
impl Plugin for AlternatingVeto {
    fn name(&self) -> &str {
        "alternating-veto"
    }

    async fn pre_read_request_header(&self, _ctx: &mut CallContext) -> Result<(), PluginError> {
        let n = self.invocations.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 1 {
            return Err(PluginError::new(self.name(), "call vetoed"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn a_vetoing_pre_read_hook_suppresses_exactly_half_the_responses() {
    let mut server = RpcServer::new(ServerConfig::default());
    server
        .add_plugin(Arc::new(AlternatingVeto {
            invocations: AtomicUsize::new(0),
        }))
        .expect("install plugin");
    server.register(&Arith, &[]).expect("register Arith");
    let server = Arc::new(server);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(Arc::clone(&server).serve_conn(server_io));
    let mut client = WireClient::new(client_io);

    for seq in 0..10_u64 {
        client.send_request("/arith/mul", seq, &Args { a: 7, b: 8 }).await;
    }

    // The reader handles requests in order, so vetoed calls are the odd
    // invocations; only even seqs may answer.
    let mut answered = HashSet::new();
    for _ in 0..5 {
        let (header, reply): (_, Option<Reply>) = client.read_response().await;
        assert!(!header.is_error());
        assert_eq!(reply, Some(Reply { c: 56 }));
        assert_eq!(header.seq % 2, 0, "vetoed call {} answered", header.seq);
        answered.insert(header.seq);
    }
    assert_eq!(answered.len(), 5);
}

#[derive(Default)]
struct RegisterRecorder {
    seen: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl Plugin for RegisterRecorder {
    fn name(&self) -> &str {
        "register-recorder"
    }

    fn hooks(&self) -> &[HookPoint] {
        &[HookPoint::Register]
    }

    fn register(&self, path: &str, metadata: &[String]) -> Result<(), PluginError> {
        self.seen
            .lock()
            .expect("recorder lock")
            .push((path.to_owned(), metadata.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn register_hooks_see_every_path_with_base_metadata_appended() {
    let recorder = Arc::new(RegisterRecorder::default());
    let mut server = RpcServer::new(ServerConfig::default());
    server.add_plugin(Arc::clone(&recorder) as Arc<dyn Plugin>).expect("install");
    server.set_base_metadata("weight=10");
    server.register(&Arith, &["group=math"]).expect("register");

    let seen = recorder.seen.lock().expect("recorder lock");
    let paths: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
    assert!(paths.contains(&"/arith/mul"));
    assert!(paths.contains(&"/arith/boom"));
    assert!(paths.contains(&"/arith/slow"));
    for (_, metadata) in seen.iter() {
        assert_eq!(metadata, &["group=math".to_owned(), "weight=10".to_owned()]);
    }
}

struct RejectingRegistrar;

#[async_trait]
impl Plugin for RejectingRegistrar {
    fn name(&self) -> &str {
        "rejecting-registrar"
    }

    fn hooks(&self) -> &[HookPoint] {
        &[HookPoint::Register]
    }

    fn register(&self, _path: &str, _metadata: &[String]) -> Result<(), PluginError> {
        Err(PluginError::new(self.name(), "registration refused"))
    }
}

#[tokio::test]
async fn a_rejecting_register_hook_makes_registration_fatal() {
    let mut server = RpcServer::new(ServerConfig::default());
    server.add_plugin(Arc::new(RejectingRegistrar)).expect("install");
    let err = server.register(&Arith, &[]).unwrap_err();
    assert!(err.to_string().contains("registration refused"));
}

/// Retargets panicking calls onto the safe sibling before the body is read.
struct Retarget;

#[async_trait]
impl Plugin for Retarget {
    fn name(&self) -> &str {
        "retarget"
    }

    async fn post_read_request_header(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        if ctx.path() == "/arith/boom" {
            ctx.set_service_method("/arith/mul");
        }
        Ok(())
    }
}

#[tokio::test]
async fn header_hooks_may_replace_the_resolved_service() {
    let mut server = RpcServer::new(ServerConfig::default());
    server.add_plugin(Arc::new(Retarget)).expect("install");
    server.register(&Arith, &[]).expect("register");
    let server = Arc::new(server);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(Arc::clone(&server).serve_conn(server_io));
    let mut client = WireClient::new(client_io);

    let (header, reply): (_, Option<Reply>) =
        client.call("/arith/boom", 4, &Args { a: 6, b: 6 }).await;
    assert!(!header.is_error(), "unexpected error: {}", header.error);
    assert_eq!(reply, Some(Reply { c: 36 }));
}

/// Overwrites the raw argument after the body frame is read.
struct FixedArgs;

#[async_trait]
impl Plugin for FixedArgs {
    fn name(&self) -> &str {
        "fixed-args"
    }

    async fn post_read_request_body(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let payload = BincodeCodec::default()
            .encode(&Args { a: 2, b: 3 })
            .map_err(|err| PluginError::new(self.name(), err.to_string()))?;
        ctx.set_argument(Bytes::from(payload));
        Ok(())
    }
}

#[tokio::test]
async fn body_hooks_may_transform_the_payload() {
    let mut server = RpcServer::new(ServerConfig::default());
    server.add_plugin(Arc::new(FixedArgs)).expect("install");
    server.register(&Arith, &[]).expect("register");
    let server = Arc::new(server);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(Arc::clone(&server).serve_conn(server_io));
    let mut client = WireClient::new(client_io);

    let (header, reply): (_, Option<Reply>) =
        client.call("/arith/mul", 8, &Args { a: 100, b: 100 }).await;
    assert!(!header.is_error());
    assert_eq!(reply, Some(Reply { c: 6 }));
}

struct ConnectionVeto;

#[async_trait]
impl Plugin for ConnectionVeto {
    fn name(&self) -> &str {
        "connection-veto"
    }

    async fn post_conn_accept(&self, _peer: Option<SocketAddr>) -> Result<(), PluginError> {
        Err(PluginError::new(self.name(), "connection refused"))
    }
}

#[tokio::test]
async fn a_rejecting_accept_hook_drops_the_connection_silently() {
    let mut server = RpcServer::new(ServerConfig::default());
    server.add_plugin(Arc::new(ConnectionVeto)).expect("install");
    server.register(&Arith, &[]).expect("register");
    let server = Arc::new(server);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(Arc::clone(&server).serve_listener(listener));

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = [0_u8; 16];
    let read = stream.read(&mut buf).await.expect("read eof");
    assert_eq!(read, 0, "rejected connection should close without bytes");
}

/// Rejects every body, then watches whether the error response still runs
/// the scoped write hooks.
#[derive(Default)]
struct WriteObserver {
    rejected_bodies: AtomicUsize,
    pre_writes: AtomicUsize,
    post_writes: AtomicUsize,
}

#[async_trait]
impl Plugin for WriteObserver {
    fn name(&self) -> &str {
        "write-observer"
    }

    fn hooks(&self) -> &[HookPoint] {
        &[
            HookPoint::PostReadRequestBody,
            HookPoint::PreWriteResponse,
            HookPoint::PostWriteResponse,
        ]
    }

    async fn post_read_request_body(&self, _ctx: &mut CallContext) -> Result<(), PluginError> {
        self.rejected_bodies.fetch_add(1, Ordering::SeqCst);
        Err(PluginError::new(self.name(), "body rejected"))
    }

    async fn pre_write_response(&self, _ctx: &mut CallContext) -> Result<(), PluginError> {
        self.pre_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn post_write_response(&self, _ctx: &CallContext) -> Result<(), PluginError> {
        self.post_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn scoped_write_hooks_run_for_error_responses_too() {
    let observer = Arc::new(WriteObserver::default());
    let server = RpcServer::new(ServerConfig::default());
    let group = server
        .group("g", vec![Arc::clone(&observer) as Arc<dyn Plugin>])
        .expect("open group");
    group.register(&Arith, &[]).expect("register through group");
    let server = Arc::new(server);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(Arc::clone(&server).serve_conn(server_io));
    let mut client = WireClient::new(client_io);

    let (header, reply): (_, Option<Reply>) =
        client.call("/g/arith/mul", 3, &Args { a: 1, b: 1 }).await;
    assert!(header.error.contains("body rejected"));
    assert_eq!(header.seq, 3);
    assert!(reply.is_none());

    assert_eq!(observer.rejected_bodies.load(Ordering::SeqCst), 1);
    assert_eq!(observer.pre_writes.load(Ordering::SeqCst), 1);
    assert_eq!(observer.post_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn group_plugins_reach_services_registered_through_the_group() {
    let recorder = Arc::new(RegisterRecorder::default());
    let server = RpcServer::new(ServerConfig::default());
    let group = server
        .group("v1", vec![Arc::clone(&recorder) as Arc<dyn Plugin>])
        .expect("open group");
    group.register(&Arith, &[]).expect("register through group");

    let seen = recorder.seen.lock().expect("recorder lock");
    let paths: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
    assert!(paths.contains(&"/v1/arith/mul"));
    assert_eq!(group.plugins().len(), 1);
}
