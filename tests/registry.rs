//! Registration protocol, path construction, and serve_request mode.

mod common;

use callframe::{
    CodecConn, DottedPathScheme, Method, Receiver, RegisterError, RpcServer, ServerConfig,
};

use common::{Args, Arith, Reply, WireClient};

struct Empty;

impl<C: callframe::Codec> Receiver<C> for Empty {
    fn name(&self) -> &str {
        "Empty"
    }

    fn methods(&self) -> Vec<Method<C>> {
        Vec::new()
    }
}

#[test]
fn a_receiver_without_methods_is_fatal() {
    let server = RpcServer::new(ServerConfig::default());
    let err = server.register(&Empty, &[]).unwrap_err();
    assert!(matches!(err, RegisterError::NoMethods(_)));
}

#[test]
fn registering_the_same_paths_twice_is_fatal() {
    let server = RpcServer::new(ServerConfig::default());
    server.register(&Arith, &[]).expect("first registration");
    let err = server.register(&Arith, &[]).unwrap_err();
    match err {
        RegisterError::Multi(errs) => {
            assert_eq!(errs.len(), 3);
            assert!(errs
                .iter()
                .all(|e| matches!(e, RegisterError::DuplicatePath(_))));
        }
        other => panic!("expected a multi-error, got {other}"),
    }
}

#[test]
fn invalid_names_are_fatal() {
    let server = RpcServer::new(ServerConfig::default());
    let err = server.named_register("bad name", &Arith, &[]).unwrap_err();
    assert!(matches!(err, RegisterError::InvalidName(_)));

    let err = server.group("sp ace", Vec::new()).err().expect("bad prefix");
    assert!(matches!(err, RegisterError::InvalidName(_)));
}

#[test]
fn routers_stay_sorted_across_registrations() {
    let server = RpcServer::new(ServerConfig::default());
    server.named_register("Zeta", &Arith, &[]).expect("zeta");
    server.named_register("Alpha", &Arith, &[]).expect("alpha");

    let routers = server.routers();
    let mut sorted = routers.clone();
    sorted.sort();
    assert_eq!(routers, sorted);
    assert!(routers.contains(&"/alpha/mul".to_owned()));
    assert!(routers.contains(&"/zeta/mul".to_owned()));
}

#[test]
fn nested_groups_concatenate_their_prefixes() {
    let server = RpcServer::new(ServerConfig::default());
    let group = server
        .group("v1", Vec::new())
        .and_then(|g| g.group("beta", Vec::new()))
        .expect("nested group");
    group.register(&Arith, &[]).expect("register");

    assert!(server.routers().contains(&"/v1/beta/arith/mul".to_owned()));
}

#[test]
fn the_dotted_scheme_reproduces_the_historical_contract() {
    let server =
        RpcServer::new(ServerConfig::default()).with_path_scheme(DottedPathScheme);
    server.register(&Arith, &[]).expect("register");

    let routers = server.routers();
    assert!(routers.contains(&"Arith.Mul".to_owned()));
    assert!(routers.contains(&"Arith.Boom".to_owned()));
}

#[tokio::test]
async fn serve_request_handles_exactly_one_call() {
    let server = RpcServer::new(ServerConfig::default());
    server.register(&Arith, &[]).expect("register");

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut conn = CodecConn::new(server_io, callframe::BincodeCodec::default());
    let mut client = WireClient::new(client_io);

    client.send_request("/arith/mul", 1, &Args { a: 2, b: 9 }).await;
    client.send_request("/arith/mul", 2, &Args { a: 3, b: 9 }).await;

    server.serve_request(&mut conn).await.expect("first request");
    let (header, reply): (_, Option<Reply>) = client.read_response().await;
    assert_eq!(header.seq, 1);
    assert_eq!(reply, Some(Reply { c: 18 }));

    // The second request is still queued on the connection.
    server.serve_request(&mut conn).await.expect("second request");
    let (header, reply): (_, Option<Reply>) = client.read_response().await;
    assert_eq!(header.seq, 2);
    assert_eq!(reply, Some(Reply { c: 27 }));
}

#[tokio::test]
async fn serve_request_reports_dispatch_failures_and_still_answers() {
    let server = RpcServer::new(ServerConfig::default());
    server.register(&Arith, &[]).expect("register");

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mut conn = CodecConn::new(server_io, callframe::BincodeCodec::default());
    let mut client = WireClient::new(client_io);

    client.send_request("/nope", 7, &Args { a: 1, b: 1 }).await;
    let err = server.serve_request(&mut conn).await.unwrap_err();
    assert!(err.to_string().contains("can't find service"));

    let (header, reply): (_, Option<Reply>) = client.read_response().await;
    assert_eq!(header.seq, 7);
    assert!(header.error.contains("can't find service"));
    assert!(reply.is_none());
}
