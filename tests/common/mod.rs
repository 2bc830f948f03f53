//! Shared fixtures: a wire-level test client and reference receivers.
#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use callframe::{
    BincodeCodec, CallContext, Codec, HandlerFuture, Method, Receiver, RequestHeader,
    ResponseHeader,
};
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Minimal client speaking the default wire format: bincode headers and
/// bodies inside length-delimited frames.
pub struct WireClient<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    codec: BincodeCodec,
}

impl<T> WireClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, LengthDelimitedCodec::new()),
            codec: BincodeCodec::default(),
        }
    }

    pub async fn send_request<A: Serialize>(&mut self, service_method: &str, seq: u64, arg: &A) {
        let header = RequestHeader {
            service_method: service_method.to_owned(),
            seq,
        };
        let header = self.codec.encode(&header).expect("encode request header");
        let body = self.codec.encode(arg).expect("encode request body");
        self.framed
            .send(Bytes::from(header))
            .await
            .expect("send header frame");
        self.framed
            .send(Bytes::from(body))
            .await
            .expect("send body frame");
    }

    /// Send one raw frame, bypassing header/body encoding.
    pub async fn send_frame(&mut self, payload: &[u8]) {
        self.framed
            .send(Bytes::copy_from_slice(payload))
            .await
            .expect("send raw frame");
    }

    /// Read one response. Error responses carry no decodable reply.
    pub async fn read_response<R: DeserializeOwned>(&mut self) -> (ResponseHeader, Option<R>) {
        let frame = self
            .framed
            .next()
            .await
            .expect("response header frame")
            .expect("response header io");
        let header: ResponseHeader = self.codec.decode(&frame).expect("decode response header");
        let body = self
            .framed
            .next()
            .await
            .expect("response body frame")
            .expect("response body io");
        if header.is_error() {
            (header, None)
        } else {
            (header, Some(self.codec.decode(&body).expect("decode reply")))
        }
    }

    pub async fn call<A, R>(
        &mut self,
        service_method: &str,
        seq: u64,
        arg: &A,
    ) -> (ResponseHeader, Option<R>)
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.send_request(service_method, seq, arg).await;
        self.read_response().await
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Args {
    pub a: i32,
    pub b: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub c: i32,
}

fn mul<'a>(args: Args, _ctx: &'a mut CallContext) -> HandlerFuture<'a, Reply> {
    Box::pin(async move { Ok(Reply { c: args.a * args.b }) })
}

fn boom<'a>(_args: Args, _ctx: &'a mut CallContext) -> HandlerFuture<'a, Reply> {
    Box::pin(async move { panic!("boom") })
}

fn slow<'a>(args: Args, _ctx: &'a mut CallContext) -> HandlerFuture<'a, Reply> {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Reply { c: args.a * args.b })
    })
}

/// Reference receiver with a well-behaved, a panicking, and a slow method.
pub struct Arith;

impl<C: Codec> Receiver<C> for Arith {
    fn name(&self) -> &str {
        "Arith"
    }

    fn methods(&self) -> Vec<Method<C>> {
        vec![
            Method::handler("Mul", mul),
            Method::handler("Boom", boom),
            Method::handler("Slow", slow),
        ]
    }
}
