//! Per-device control sessions.
//!
//! A [`ControlSession`] owns one persistent TCP connection to a bulb. A
//! single reader task drains the socket, correlating responses to pending
//! requests by id and turning unsolicited `props` pushes into registry
//! updates plus [`StateChange`](crate::events::StateChange) events. Because
//! there is exactly one reader per connection, events from one device are
//! published in the order the device sent them.
//!
//! Sessions never reconnect on their own: when the transport drops, every
//! pending request fails with [`Error::ConnectionLost`] and the session goes
//! to [`SessionState::Disconnected`] for good. Reconnection policy belongs to
//! the retry supervisor (see [`crate::retry`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use serde_json::{Value, json};
use strum_macros::Display;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::events::{EventBus, StateChange};
use crate::protocol::{self, Incoming, Method};
use crate::registry::DeviceRegistry;
use crate::types::{Brightness, Flow, Kelvin, Power, Rgb};

type Result<T> = std::result::Result<T, Error>;
type PendingMap = HashMap<u32, oneshot::Sender<Result<Vec<Value>>>>;

/// Default control port for the bulbs' LAN protocol.
pub const CONTROL_PORT: u16 = 55443;

/// Transition effect sent with state-changing commands.
const EFFECT: &str = "smooth";
const EFFECT_DURATION_MS: u64 = 500;

/// Lifecycle of a session.
///
/// `Disconnected -> Connecting -> Ready -> Disconnected` on transport error,
/// or `Ready -> Closing -> Disconnected` on explicit close. A disconnected
/// session never becomes ready again; open a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

/// Tunables for opening and driving a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Idle period after which the keep-alive probe polls the bulb.
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

/// Handle to one live bulb connection.
///
/// Clones share the underlying connection; whoever opened the session owns
/// its lifecycle and is the one that should call
/// [`close`](ControlSession::close). Other holders (the sync coordinator)
/// only send commands through their clone.
#[derive(Debug, Clone)]
pub struct ControlSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU32,
    state: watch::Sender<SessionState>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    registry: DeviceRegistry,
    events: EventBus,
    config: SessionConfig,
}

impl ControlSession {
    /// Open a session with default configuration.
    pub async fn connect(
        addr: SocketAddr,
        registry: DeviceRegistry,
        events: EventBus,
    ) -> Result<Self> {
        Self::connect_with(addr, registry, events, SessionConfig::default()).await
    }

    /// Open a session, failing with [`Error::ConnectTimeout`] or
    /// [`Error::Connect`] if the bulb cannot be reached.
    pub async fn connect_with(
        addr: SocketAddr,
        registry: DeviceRegistry,
        events: EventBus,
        config: SessionConfig,
    ) -> Result<Self> {
        let (state, _) = watch::channel(SessionState::Connecting);

        let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                registry.mark_unreachable(addr, SystemTime::now());
                return Err(Error::ConnectTimeout(addr));
            }
            Ok(Err(err)) => {
                registry.mark_unreachable(addr, SystemTime::now());
                return Err(Error::connect(addr, err));
            }
            Ok(Ok(stream)) => stream,
        };
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(SessionInner {
            addr,
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            state,
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            registry,
            events,
            config,
        });
        inner.state.send_replace(SessionState::Ready);

        tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        let session = ControlSession { inner };
        tokio::spawn(keepalive_loop(session.clone()));
        Ok(session)
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions (e.g. to learn about a disconnect).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// How long the session has been idle.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().unwrap().elapsed()
    }

    /// Close the connection. Pending requests fail with
    /// [`Error::ConnectionLost`]; the device is not marked unreachable.
    pub async fn close(&self) {
        self.inner.state.send_replace(SessionState::Closing);
        self.inner.cancel.cancel();
        let _ = self.inner.writer.lock().await.shutdown().await;
        self.inner.fail_pending();
        self.inner.state.send_replace(SessionState::Disconnected);
    }

    /// Set the power state.
    pub async fn set_power(&self, power: Power) -> Result<()> {
        self.request(
            Method::SetPower,
            vec![json!(power.to_string()), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
        .await?;
        Ok(())
    }

    /// Toggle power. The wire protocol's `set_power` needs an explicit
    /// target state, so the current one is queried first.
    pub async fn toggle(&self) -> Result<()> {
        let props = self.get_properties(&["power"]).await?;
        let on = props.first().and_then(Value::as_str) == Some("on");
        self.set_power(if on { Power::Off } else { Power::On }).await
    }

    /// Set the brightness. The firmware's accepted range starts at 1, so a
    /// zero brightness is sent as 1.
    pub async fn set_brightness(&self, brightness: Brightness) -> Result<()> {
        self.request(
            Method::SetBright,
            vec![
                json!(brightness.value().max(1)),
                json!(EFFECT),
                json!(EFFECT_DURATION_MS),
            ],
        )
        .await?;
        Ok(())
    }

    /// Set an RGB color.
    pub async fn set_rgb(&self, color: Rgb) -> Result<()> {
        self.request(
            Method::SetRgb,
            vec![json!(color.packed()), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
        .await?;
        Ok(())
    }

    /// Set a white color temperature.
    pub async fn set_color_temperature(&self, kelvin: Kelvin) -> Result<()> {
        self.request(
            Method::SetCtAbx,
            vec![json!(kelvin.kelvin()), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
        .await?;
        Ok(())
    }

    /// Start a color flow on the bulb.
    pub async fn start_flow(&self, flow: &Flow) -> Result<()> {
        self.request(Method::StartCf, flow.to_params()).await?;
        Ok(())
    }

    /// Stop the running color flow. Succeeds even when no flow is active.
    pub async fn stop_flow(&self) -> Result<()> {
        self.request(Method::StopCf, vec![]).await?;
        Ok(())
    }

    /// Assign the bulb's stored name.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.request(Method::SetName, vec![json!(name)]).await?;
        Ok(())
    }

    /// Query properties by name; values come back positionally.
    pub async fn get_properties(&self, properties: &[&str]) -> Result<Vec<Value>> {
        let params = properties.iter().map(|p| json!(p)).collect();
        self.request(Method::GetProp, params).await
    }

    /// Send one command and await its correlated response.
    pub(crate) async fn request(&self, method: Method, params: Vec<Value>) -> Result<Vec<Value>> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(Error::NotReady(state));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        let line = protocol::encode_command(id, method, &params)?;
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                debug!("write to {} failed: {err}", self.inner.addr);
                self.inner.pending.lock().unwrap().remove(&id);
                self.inner.disconnect();
                return Err(Error::ConnectionLost);
            }
        }
        self.inner.touch();

        match timeout(self.inner.config.response_timeout, rx).await {
            // Timed out: nobody will complete this request anymore.
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(Error::ResponseTimeout)
            }
            // Sender dropped without a reply; the session died.
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Ok(Ok(result)) => result,
        }
    }
}

impl SessionInner {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Transport-level failure: fail everything pending and go dark.
    fn disconnect(&self) {
        let state = *self.state.borrow();
        if state == SessionState::Disconnected || state == SessionState::Closing {
            return;
        }
        self.state.send_replace(SessionState::Disconnected);
        self.fail_pending();
        self.registry.mark_unreachable(self.addr, SystemTime::now());
        self.cancel.cancel();
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }

    fn handle_line(&self, line: &str) {
        self.touch();
        match protocol::decode_line(line) {
            Ok(Incoming::Response { id, result }) => {
                match self.pending.lock().unwrap().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("{}: response for unknown id {id} dropped", self.addr),
                }
            }
            Ok(Incoming::Props(delta)) => {
                let state = self
                    .registry
                    .apply_delta(self.addr, &delta, SystemTime::now());
                self.events.publish(StateChange {
                    addr: self.addr,
                    state,
                });
            }
            Err(err) => warn!("{}: dropping undecodable frame: {err}", self.addr),
        }
    }
}

/// Sole reader for one connection.
async fn read_loop(inner: Arc<SessionInner>, read_half: OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => inner.handle_line(&line),
                Ok(None) => {
                    debug!("{}: connection closed by peer", inner.addr);
                    inner.disconnect();
                    break;
                }
                Err(err) => {
                    debug!("{}: read error: {err}", inner.addr);
                    inner.disconnect();
                    break;
                }
            }
        }
    }
}

/// Polls the bulb when the session sits idle, keeping NAT/firewall state and
/// the bulb's connection slot warm.
async fn keepalive_loop(session: ControlSession) {
    let interval = session.inner.config.keepalive_interval;
    loop {
        tokio::select! {
            _ = session.inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if session.state() != SessionState::Ready {
            break;
        }
        if session.idle_for() >= interval
            && let Err(err) = session.get_properties(&["power"]).await
        {
            debug!("{}: keep-alive probe failed: {err}", session.addr());
        }
    }
}
