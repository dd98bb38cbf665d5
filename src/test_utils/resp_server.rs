//! Scripted RESP server on a loopback port

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::store::resp::RespCodec;
use crate::store::resp::RespValue;

/// What the server writes back for one command
pub(crate) struct Reply {
    frames: Vec<RespValue>,
    delay: Duration,
    hangup: bool,
}

impl Reply {
    pub(crate) fn value(value: RespValue) -> Self {
        Self {
            frames: vec![value],
            delay: Duration::ZERO,
            hangup: false,
        }
    }

    pub(crate) fn ok() -> Self {
        Self::value(RespValue::Simple("OK".into()))
    }

    /// Hangs up without answering
    pub(crate) fn drop_connection() -> Self {
        Self {
            frames: Vec::new(),
            delay: Duration::ZERO,
            hangup: true,
        }
    }

    pub(crate) fn error(message: &str) -> Self {
        Self::value(RespValue::Error(message.into()))
    }

    /// Holds the reply back for `delay`
    pub(crate) fn after(
        mut self,
        delay: Duration,
    ) -> Self {
        self.delay = delay;
        self
    }

    /// Writes `value` right behind the reply, as a push would arrive
    pub(crate) fn then(
        mut self,
        value: RespValue,
    ) -> Self {
        self.frames.push(value);
        self
    }

    /// Closes the connection once the frames are written
    pub(crate) fn hangup(mut self) -> Self {
        self.hangup = true;
        self
    }
}

type Handler = Arc<dyn Fn(&[Bytes]) -> Reply + Send + Sync>;

/// Accepts any number of connections and answers each command through the
/// handler. Stops when dropped.
pub(crate) struct RespServer {
    endpoint: String,
    accepted: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl RespServer {
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: Fn(&[Bytes]) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let endpoint = listener.local_addr().expect("local addr").to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handler: Handler = Arc::new(handler);

        let counter = accepted.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, handler.clone(), stop.clone()));
            }
        });

        Self {
            endpoint,
            accepted,
            shutdown,
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Connections accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for RespServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    stream: TcpStream,
    handler: Handler,
    stop: CancellationToken,
) {
    let mut framed = Framed::new(stream, RespCodec);
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(Ok(RespValue::Array(items))) = frame else {
            break;
        };
        let args: Vec<Bytes> = items
            .into_iter()
            .filter_map(|item| match item {
                RespValue::Bulk(arg) => Some(arg),
                _ => None,
            })
            .collect();

        let reply = handler(&args);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        let mut out = BytesMut::new();
        for value in &reply.frames {
            encode(value, &mut out);
        }
        if framed.get_mut().write_all(&out).await.is_err() || reply.hangup {
            break;
        }
    }
}

fn encode(
    value: &RespValue,
    out: &mut BytesMut,
) {
    match value {
        RespValue::Simple(s) => line(out, b'+', s.as_bytes()),
        RespValue::Error(s) => line(out, b'-', s.as_bytes()),
        RespValue::Integer(n) => line(out, b':', n.to_string().as_bytes()),
        RespValue::Bulk(bytes) => {
            line(out, b'$', bytes.len().to_string().as_bytes());
            out.put_slice(bytes);
            out.put_slice(b"\r\n");
        }
        RespValue::Nil => out.put_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            line(out, b'*', items.len().to_string().as_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}

fn line(
    out: &mut BytesMut,
    tag: u8,
    body: &[u8],
) {
    out.put_u8(tag);
    out.put_slice(body);
    out.put_slice(b"\r\n");
}

/// Whether `arg` names the command `name`, ignoring case
pub(crate) fn is_command(
    args: &[Bytes],
    name: &str,
) -> bool {
    args.first()
        .is_some_and(|arg| arg.eq_ignore_ascii_case(name.as_bytes()))
}

pub(crate) fn bulk(s: &str) -> RespValue {
    RespValue::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}
