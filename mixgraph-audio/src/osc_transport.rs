//! UDP transport speaking OSC to a running server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_std::channel::{self, Receiver, Sender};
use async_std::net::{ToSocketAddrs, UdpSocket};
use async_std::task;
use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::backend::{BackendError, BackendMessage, BackendResult, BoxFuture, Bundle, RawArg, Transport};
use crate::callbacks::CallbackRegistry;
use crate::query_tree::QueryTreeGroup;

/// Addresses answered through the reply channel rather than callbacks.
const REPLY_ADDRESSES: &[&str] = &["/g_queryTree.reply", "/done", "/fail"];

const RECV_POLL: Duration = Duration::from_millis(50);

pub struct OscTransport {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    callbacks: Arc<Mutex<Option<Arc<CallbackRegistry>>>>,
    replies: Receiver<BackendMessage>,
    query_gate: async_std::sync::Mutex<()>,
    reply_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl OscTransport {
    /// Bind a local socket, register for notifications and start listening.
    pub async fn connect(server: &str, reply_timeout: Duration) -> BackendResult<Self> {
        let server_addr = server
            .to_socket_addrs()
            .await?
            .next()
            .ok_or_else(|| BackendError(format!("cannot resolve {}", server)))?;
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let callbacks: Arc<Mutex<Option<Arc<CallbackRegistry>>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (sender, replies) = channel::unbounded();

        task::spawn(listen(socket.clone(), sender, callbacks.clone(), shutdown.clone()));

        let transport = Self {
            socket,
            server_addr,
            callbacks,
            replies,
            query_gate: async_std::sync::Mutex::new(()),
            reply_timeout,
            shutdown,
        };
        transport
            .send_packet(&OscPacket::Message(OscMessage {
                addr: "/notify".to_string(),
                args: vec![OscType::Int(1)],
            }))
            .await?;
        log::info!(target: "mixgraph::provider", "connected to {}", server_addr);
        Ok(transport)
    }

    async fn send_packet(&self, packet: &OscPacket) -> BackendResult {
        let buf = rosc::encoder::encode(packet).map_err(|e| BackendError(e.to_string()))?;
        self.socket.send_to(&buf, self.server_addr).await?;
        Ok(())
    }

    async fn await_reply(&self, addr: &str) -> BackendResult<BackendMessage> {
        let wait = async {
            loop {
                let message = self
                    .replies
                    .recv()
                    .await
                    .map_err(|_| BackendError("listener stopped".into()))?;
                if message.addr == addr {
                    return Ok(message);
                }
                if message.addr == "/fail" {
                    return Err(BackendError(message.render()));
                }
            }
        };
        async_std::future::timeout(self.reply_timeout, wait)
            .await
            .map_err(|_| BackendError(format!("timed out waiting for {}", addr)))?
    }
}

impl Drop for OscTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    replies: Sender<BackendMessage>,
    callbacks: Arc<Mutex<Option<Arc<CallbackRegistry>>>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 65536];
    while !shutdown.load(Ordering::Relaxed) {
        let received = match async_std::future::timeout(RECV_POLL, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                log::warn!(target: "mixgraph::provider", "osc receive failed: {}", e);
                break;
            }
            Ok(Ok((n, _))) => n,
        };
        let packet = match rosc::decoder::decode_udp(&buf[..received]) {
            Ok((_, packet)) => packet,
            Err(e) => {
                log::debug!(target: "mixgraph::provider", "undecodable packet: {:?}", e);
                continue;
            }
        };
        let mut messages = Vec::new();
        flatten(packet, &mut messages);
        for message in messages {
            if REPLY_ADDRESSES.contains(&message.addr.as_str()) {
                if replies.send(message).await.is_err() {
                    return;
                }
                continue;
            }
            let registry = callbacks.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(registry) = registry {
                registry.dispatch(&message);
            }
        }
    }
}

fn flatten(packet: OscPacket, out: &mut Vec<BackendMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(BackendMessage {
            addr: msg.addr,
            args: msg.args.into_iter().filter_map(osc_to_raw).collect(),
        }),
        OscPacket::Bundle(bundle) => {
            for p in bundle.content {
                flatten(p, out);
            }
        }
    }
}

impl Transport for OscTransport {
    fn send_bundle(&self, bundle: Bundle) -> BoxFuture<'_, BackendResult> {
        Box::pin(async move {
            let timetag = match bundle.timetag {
                Some(offset) => osc_time_from_now(offset),
                None => osc_time_immediate(),
            };
            let content = bundle
                .messages
                .into_iter()
                .map(|m| {
                    OscPacket::Message(OscMessage {
                        addr: m.addr,
                        args: m.args.into_iter().map(raw_to_osc).collect(),
                    })
                })
                .collect();
            self.send_packet(&OscPacket::Bundle(OscBundle { timetag, content })).await
        })
    }

    fn query_tree(&self) -> BoxFuture<'_, BackendResult<QueryTreeGroup>> {
        Box::pin(async move {
            let _gate = self.query_gate.lock().await;
            while self.replies.try_recv().is_ok() {}
            self.send_packet(&OscPacket::Message(OscMessage {
                addr: "/g_queryTree".to_string(),
                args: vec![OscType::Int(0), OscType::Int(1)],
            }))
            .await?;
            let reply = self.await_reply("/g_queryTree.reply").await?;
            QueryTreeGroup::from_reply(&reply.args)
        })
    }

    fn attach_callbacks(&self, registry: Arc<CallbackRegistry>) {
        *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    }
}

pub fn raw_to_osc(arg: RawArg) -> OscType {
    match arg {
        RawArg::Int(v) => OscType::Int(v),
        RawArg::Float(v) => OscType::Float(v),
        RawArg::Str(s) => OscType::String(s),
        RawArg::Blob(b) => OscType::Blob(b),
    }
}

/// Types without a `RawArg` counterpart are dropped.
pub fn osc_to_raw(arg: OscType) -> Option<RawArg> {
    match arg {
        OscType::Int(v) => Some(RawArg::Int(v)),
        OscType::Float(v) => Some(RawArg::Float(v)),
        OscType::Double(v) => Some(RawArg::Float(v as f32)),
        OscType::Long(v) => Some(RawArg::Int(v as i32)),
        OscType::String(s) => Some(RawArg::Str(s)),
        OscType::Blob(b) => Some(RawArg::Blob(b)),
        _ => None,
    }
}

/// Servers count time from 1900-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// (monotonic instant, wall-clock seconds) captured once; timetags advance
/// with the monotonic clock so wall-clock adjustments don't reorder bundles.
static CLOCK_ANCHOR: LazyLock<(Instant, f64)> = LazyLock::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    (Instant::now(), wall)
});

pub fn osc_time_from_now(offset_secs: f64) -> OscTime {
    let (anchor_instant, anchor_wall) = &*CLOCK_ANCHOR;
    let total = anchor_wall + anchor_instant.elapsed().as_secs_f64() + offset_secs;
    let seconds = total as u64 + NTP_UNIX_OFFSET;
    let fractional = (total.fract() * u32::MAX as f64) as u32;
    OscTime { seconds: seconds as u32, fractional }
}

/// The (0, 1) timetag: execute on receipt.
pub fn osc_time_immediate() -> OscTime {
    OscTime { seconds: 0, fractional: 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task::block_on;

    async fn recv_packet(socket: &UdpSocket) -> (OscPacket, SocketAddr) {
        let mut buf = vec![0u8; 65536];
        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..n]).unwrap();
        (packet, from)
    }

    #[test]
    fn conversions_keep_values() {
        assert_eq!(raw_to_osc(RawArg::Str("gate".into())), OscType::String("gate".into()));
        assert_eq!(osc_to_raw(OscType::Double(0.5)), Some(RawArg::Float(0.5)));
        assert_eq!(osc_to_raw(OscType::Nil), None);
    }

    #[test]
    fn timetags() {
        assert_eq!(osc_time_immediate(), OscTime { seconds: 0, fractional: 1 });
        let now = osc_time_from_now(0.0);
        let later = osc_time_from_now(10.0);
        assert!(later.seconds >= now.seconds + 9);
    }

    #[test]
    fn sends_bundles_and_answers_tree_queries() {
        block_on(async {
            let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = server.local_addr().unwrap().to_string();
            let transport = OscTransport::connect(&addr, Duration::from_secs(2)).await.unwrap();

            let (notify, client) = recv_packet(&server).await;
            match notify {
                OscPacket::Message(m) => assert_eq!(m.addr, "/notify"),
                other => panic!("unexpected {:?}", other),
            }

            transport
                .send_bundle(Bundle {
                    timetag: None,
                    messages: vec![BackendMessage::new("/g_new", vec![1000.into(), 0.into(), 1.into()])],
                })
                .await
                .unwrap();
            match recv_packet(&server).await.0 {
                OscPacket::Bundle(b) => {
                    assert_eq!(b.timetag, osc_time_immediate());
                    assert_eq!(b.content.len(), 1);
                }
                other => panic!("unexpected {:?}", other),
            }

            let query = task::spawn(async move {
                let tree = transport.query_tree().await;
                (transport, tree)
            });
            let (_, client_again) = recv_packet(&server).await;
            assert_eq!(client, client_again);
            let reply = OscPacket::Message(OscMessage {
                addr: "/g_queryTree.reply".into(),
                args: vec![
                    OscType::Int(0),
                    OscType::Int(0),
                    OscType::Int(1),
                    OscType::Int(1),
                    OscType::Int(0),
                ],
            });
            server.send_to(&rosc::encoder::encode(&reply).unwrap(), client).await.unwrap();
            let (_transport, tree) = query.await;
            assert_eq!(tree.unwrap().child_ids(), vec![1]);
        });
    }
}
