//! Scripted SOCKS5 upstreams for race, session and listener tests.

use crate::addr::TargetAddr;
use crate::socks::{self, Reply};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How a mock upstream answers each connection
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Finish the handshake after `delay`, report `bound`, then echo
    Succeed { delay: Duration, bound: SocketAddr },
    /// Answer the CONNECT with a failure reply code after `delay`
    Reject { delay: Duration, code: u8 },
    /// Read the greeting and never answer
    Stall,
    /// Answer the greeting with a SOCKS4 version byte
    BadVersion,
}

/// A local SOCKS5 upstream that counts connections it has seen closed
pub struct MockUpstream {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<TargetAddr>>>,
    behavior: Arc<Mutex<Behavior>>,
    task: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let targets = Arc::new(Mutex::new(Vec::new()));
        let behavior = Arc::new(Mutex::new(behavior));

        let task = {
            let accepted = accepted.clone();
            let closed = closed.clone();
            let targets = targets.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let behavior = behavior.lock().unwrap().clone();
                    let closed = closed.clone();
                    let targets = targets.clone();
                    tokio::spawn(async move {
                        serve(stream, behavior, targets).await;
                        closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self {
            addr,
            accepted,
            closed,
            targets,
            behavior,
            task,
        }
    }

    /// Change how connections accepted from now on are answered
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections whose peer (the proxy under test) has closed them
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().unwrap().clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, behavior: Behavior, targets: Arc<Mutex<Vec<TargetAddr>>>) {
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).await.is_err() {
        return;
    }

    match behavior {
        Behavior::Stall => {}
        Behavior::BadVersion => {
            let _ = stream.write_all(&[0x04, 0x00]).await;
        }
        Behavior::Succeed { delay, bound } => {
            tokio::time::sleep(delay).await;
            if answer(&mut stream, Reply::Succeeded, &bound.into(), &targets)
                .await
                .is_err()
            {
                return;
            }
            let (mut reader, mut writer) = stream.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            return;
        }
        Behavior::Reject { delay, code } => {
            tokio::time::sleep(delay).await;
            let reply = [0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
            if answer_raw(&mut stream, &reply, &targets).await.is_err() {
                return;
            }
        }
    }

    drain_until_closed(&mut stream).await;
}

async fn answer(
    stream: &mut TcpStream,
    reply: Reply,
    bound: &TargetAddr,
    targets: &Mutex<Vec<TargetAddr>>,
) -> socks::SocksResult<()> {
    stream.write_all(&[0x05, 0x00]).await?;
    let target = socks::read_request(stream).await?;
    targets.lock().unwrap().push(target);
    socks::write_reply(stream, reply, bound).await
}

async fn answer_raw(
    stream: &mut TcpStream,
    reply: &[u8],
    targets: &Mutex<Vec<TargetAddr>>,
) -> socks::SocksResult<()> {
    stream.write_all(&[0x05, 0x00]).await?;
    let target = socks::read_request(stream).await?;
    targets.lock().unwrap().push(target);
    stream.write_all(reply).await?;
    Ok(())
}

async fn drain_until_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 512];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}

/// An address nothing is listening on
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Poll `cond` until it holds or `within` elapses
pub async fn eventually(within: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
