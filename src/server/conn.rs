//! Per-WebSocket connection state machine
//!
//! Every live socket gets exactly two workers: a read pump (single
//! reader, decodes frames, forwards them to the owning endpoint) and a
//! write pump (single writer, serializes outbound frames and keep-alive
//! control traffic). Terminal conditions from either side funnel into one
//! close handshake that runs exactly once.
//!
//! Outbound delivery favors fresh data: when the bounded send queue is
//! full the oldest pending frame is shed and counted, so a slow reader
//! sees recent shell output instead of a stalled backlog.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::proto::{codec, ProtoMsg};
use crate::server::Telemetry;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_SERVICE_RESTART: u16 = 1012;

/// Budget for flushing in-flight writes while draining.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Keep-alive and buffering knobs for one connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub send_buffer: usize,
}

impl From<&Config> for ConnConfig {
    fn from(config: &Config) -> Self {
        ConnConfig {
            ping_period: config.ping_period,
            pong_wait: config.pong_wait,
            write_wait: config.write_wait,
            send_buffer: config.send_buffer,
        }
    }
}

enum Outbound {
    /// An already-encoded frame, delivered as one binary message.
    Data(Bytes),
    /// Reply to an inbound ping.
    Pong(Vec<u8>),
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Outbound::Data(bytes) => Message::Binary(bytes.to_vec()),
            Outbound::Pong(payload) => Message::Pong(payload),
        }
    }
}

/// Bounded outbound queue with drop-oldest overflow.
struct SendQueue {
    items: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        SendQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the number of items shed to make room.
    fn push(&self, item: Outbound) -> u64 {
        let mut items = self.items.lock();
        let mut shed = 0;
        while items.len() >= self.capacity {
            items.pop_front();
            shed += 1;
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        shed
    }

    fn pop(&self) -> Option<Outbound> {
        self.items.lock().pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

struct Shared {
    config: ConnConfig,
    state: AtomicU8,
    queue: SendQueue,
    close_reason: Mutex<Option<CloseFrame<'static>>>,
    /// Cancelled on the first terminal condition.
    cancel: CancellationToken,
    /// Cancelled once both pumps have finished and the socket is closed.
    done: CancellationToken,
    /// Last proof of life from the peer.
    last_pong: Mutex<Instant>,
    telemetry: Arc<Telemetry>,
}

impl Shared {
    /// Record the terminal condition. The first caller wins the close
    /// frame; every caller trips the cancellation token.
    fn terminate(&self, code: u16, reason: Cow<'static, str>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(CloseFrame { code, reason });
            }
        }
        self.cancel.cancel();
    }

    /// Queue an item, charging any shed frames to the drop counter.
    fn enqueue(&self, item: Outbound) {
        let shed = self.queue.push(item);
        if shed > 0 {
            self.telemetry
                .outbound_dropped
                .fetch_add(shed, Ordering::Relaxed);
            debug!(shed, "outbound queue full, dropped oldest");
        }
    }

    fn pong_deadline(&self) -> Instant {
        *self.last_pong.lock() + self.config.pong_wait
    }

    fn touch_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }
}

/// Handle to a live connection. Cheap to clone; the pumps it spawned own
/// the socket halves.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Split the socket and spawn the read and write pumps. Decoded
    /// inbound messages arrive on the returned channel, which closes when
    /// the read pump exits.
    pub fn spawn(
        socket: WebSocket,
        config: ConnConfig,
        telemetry: Arc<Telemetry>,
    ) -> (Connection, mpsc::Receiver<ProtoMsg>) {
        let (sink, stream) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.send_buffer);
        let shared = Arc::new(Shared {
            queue: SendQueue::new(config.send_buffer),
            config,
            state: AtomicU8::new(STATE_OPEN),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            last_pong: Mutex::new(Instant::now()),
            telemetry,
        });

        let reader = tokio::spawn(read_pump(stream, Arc::clone(&shared), inbound_tx));
        let writer = tokio::spawn(write_pump(sink, Arc::clone(&shared)));

        let watcher = Arc::clone(&shared);
        tokio::spawn(async move {
            let _ = tokio::join!(reader, writer);
            watcher.state.store(STATE_CLOSED, Ordering::Release);
            watcher.done.cancel();
        });

        (Connection { shared }, inbound_rx)
    }

    /// Queue an encoded frame for delivery. Silently ignored once the
    /// connection is draining.
    pub fn send(&self, frame: Bytes) {
        if self.shared.state.load(Ordering::Acquire) != STATE_OPEN {
            return;
        }
        self.shared.enqueue(Outbound::Data(frame));
    }

    /// Caller-initiated close with the given code and reason.
    pub fn close(&self, code: u16, reason: impl Into<Cow<'static, str>>) {
        self.shared.terminate(code, reason.into());
    }

    /// Resolves once the close handshake has completed and both pumps
    /// have exited.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await;
    }

    /// Token tripped by the first terminal condition.
    pub fn cancelled(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<ProtoMsg>,
) {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(result) = next else {
            shared.terminate(CLOSE_NORMAL, Cow::Borrowed(""));
            break;
        };
        match result {
            Ok(Message::Binary(data)) => {
                let msg = match codec::decode(&data) {
                    Ok(msg) => msg,
                    Err(err) => {
                        shared
                            .telemetry
                            .decode_failures
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(error = %err, "closing connection on undecodable frame");
                        shared.terminate(CLOSE_UNSUPPORTED_DATA, Cow::Borrowed("unsupported data"));
                        break;
                    }
                };
                // a slow endpoint backpressures the socket read here
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            shared.terminate(CLOSE_NORMAL, Cow::Borrowed(""));
                            break;
                        }
                    }
                }
            }
            Ok(Message::Text(_)) => {
                shared
                    .telemetry
                    .decode_failures
                    .fetch_add(1, Ordering::Relaxed);
                shared.terminate(CLOSE_UNSUPPORTED_DATA, Cow::Borrowed("unsupported data"));
                break;
            }
            Ok(Message::Ping(payload)) => {
                shared.enqueue(Outbound::Pong(payload));
            }
            Ok(Message::Pong(_)) => {
                shared
                    .telemetry
                    .pongs_received
                    .fetch_add(1, Ordering::Relaxed);
                shared.touch_pong();
            }
            Ok(Message::Close(_)) => {
                shared.terminate(CLOSE_NORMAL, Cow::Borrowed(""));
                break;
            }
            Err(err) => {
                debug!(error = %err, "read error");
                shared.terminate(CLOSE_GOING_AWAY, Cow::Borrowed("read error"));
                break;
            }
        }
    }
    // dropping the sender closes the inbound channel once drained
}

async fn write_pump(mut sink: SplitSink<WebSocket, Message>, shared: Arc<Shared>) {
    let write_wait = shared.config.write_wait;
    let mut ping_timer = tokio::time::interval_at(
        Instant::now() + shared.config.ping_period,
        shared.config.ping_period,
    );
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'pump: loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break 'pump,
            _ = tokio::time::sleep_until(shared.pong_deadline()) => {
                shared.terminate(CLOSE_GOING_AWAY, Cow::Borrowed("keepalive timeout"));
                break 'pump;
            }
            _ = ping_timer.tick() => {
                if write(&mut sink, Message::Ping(Vec::new()), write_wait).await.is_err() {
                    shared.terminate(CLOSE_GOING_AWAY, Cow::Borrowed("write error"));
                    break 'pump;
                }
                shared.telemetry.pings_sent.fetch_add(1, Ordering::Relaxed);
            }
            _ = shared.queue.wait() => {
                while let Some(item) = shared.queue.pop() {
                    if write(&mut sink, item.into_message(), write_wait).await.is_err() {
                        shared.terminate(CLOSE_GOING_AWAY, Cow::Borrowed("write error"));
                        break 'pump;
                    }
                }
            }
        }
    }

    // close handshake: drain in-flight writes, then close the socket
    shared.state.store(STATE_DRAINING, Ordering::Release);
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Some(item) = shared.queue.pop() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() || write(&mut sink, item.into_message(), left.min(write_wait)).await.is_err() {
            break;
        }
    }
    let frame = shared
        .close_reason
        .lock()
        .take()
        .unwrap_or(CloseFrame {
            code: CLOSE_NORMAL,
            reason: Cow::Borrowed(""),
        });
    let _ = write(&mut sink, Message::Close(Some(frame)), write_wait).await;
    let _ = timeout(write_wait, sink.close()).await;
    shared.cancel.cancel();
}

async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    wait: Duration,
) -> Result<(), ()> {
    match timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: u8) -> Outbound {
        Outbound::Data(Bytes::from(vec![n]))
    }

    fn as_byte(item: Outbound) -> u8 {
        match item {
            Outbound::Data(bytes) => bytes[0],
            Outbound::Pong(_) => panic!("expected data"),
        }
    }

    #[test]
    fn send_queue_keeps_newest_under_pressure() {
        let queue = SendQueue::new(2);
        assert_eq!(queue.push(data(0)), 0);
        assert_eq!(queue.push(data(1)), 0);
        // saturated: each push sheds the head
        assert_eq!(queue.push(data(2)), 1);
        assert_eq!(queue.push(data(3)), 1);
        assert_eq!(queue.push(data(4)), 1);

        // the most recent two remain, in order
        assert_eq!(as_byte(queue.pop().unwrap()), 3);
        assert_eq!(as_byte(queue.pop().unwrap()), 4);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn send_queue_wakes_waiter() {
        let queue = Arc::new(SendQueue::new(4));
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            as_byte(waiter.pop().unwrap())
        });
        tokio::task::yield_now().await;
        queue.push(data(7));
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[test]
    fn first_terminal_condition_wins_the_close_frame() {
        let shared = Shared {
            config: ConnConfig {
                ping_period: Duration::from_secs(30),
                pong_wait: Duration::from_secs(60),
                write_wait: Duration::from_secs(10),
                send_buffer: 4,
            },
            state: AtomicU8::new(STATE_OPEN),
            queue: SendQueue::new(4),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            last_pong: Mutex::new(Instant::now()),
            telemetry: Arc::new(Telemetry::default()),
        };

        shared.terminate(CLOSE_UNSUPPORTED_DATA, Cow::Borrowed("unsupported data"));
        shared.terminate(CLOSE_NORMAL, Cow::Borrowed(""));
        assert!(shared.cancel.is_cancelled());

        let frame = shared.close_reason.lock().take().unwrap();
        assert_eq!(frame.code, CLOSE_UNSUPPORTED_DATA);
        assert_eq!(frame.reason, "unsupported data");
    }
}
