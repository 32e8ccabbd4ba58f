//! Group synchronization of bulb state.
//!
//! The coordinator consumes the state-change stream and keeps the non-master
//! members of each group consistent with the master, per the group's policy.
//! Propagation is best-effort and fire-and-forget: a member with no usable
//! session is skipped, a failing member never blocks or rolls back the
//! others, and failures are only counted and logged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::Error;
use crate::events::StateChange;
use crate::session::{ControlSession, SessionState};
use crate::types::{Brightness, Color, DeviceState, Kelvin, Power, Rgb};

type Result<T> = std::result::Result<T, Error>;

/// Delay between successive members under the `Sequence` policy.
const SEQUENCE_STAGGER: Duration = Duration::from_millis(150);

/// Maximum brightness offset (either direction) under the `Random` policy.
const RANDOM_JITTER: i64 = 15;

/// How a group propagates its master's state to the other members.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum SyncPolicy {
    /// Members copy the master's state exactly.
    Mirror,
    /// Members get the master's power state inverted; brightness and color
    /// are left untouched.
    Alternate,
    /// Members copy the master's state in member-list order, each delayed by
    /// a fixed stagger relative to the previous.
    Sequence,
    /// Members copy the master's state with a per-target brightness jitter.
    Random,
}

impl SyncPolicy {
    pub fn requires_master(&self) -> bool {
        matches!(self, SyncPolicy::Mirror | SyncPolicy::Alternate)
    }
}

/// A named set of devices synchronized to one master.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncGroup {
    id: Uuid,
    name: String,
    members: Vec<SocketAddr>,
    policy: SyncPolicy,
    master: Option<SocketAddr>,
}

impl SyncGroup {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member addresses in definition order (the order `Sequence` uses).
    pub fn members(&self) -> &[SocketAddr] {
        &self.members
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn master(&self) -> Option<SocketAddr> {
        self.master
    }

    /// Rename the group.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Replace the member list.
    ///
    /// Like every edit, this is validated when the group is handed back to
    /// [`GroupStore::update`], not here.
    pub fn set_members(&mut self, members: Vec<SocketAddr>) {
        self.members = members;
    }

    pub fn set_policy(&mut self, policy: SyncPolicy) {
        self.policy = policy;
    }

    pub fn set_master(&mut self, master: Option<SocketAddr>) {
        self.master = master;
    }

    fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::EmptyGroup(self.name.clone()));
        }
        for (i, member) in self.members.iter().enumerate() {
            if self.members[..i].contains(member) {
                return Err(Error::DuplicateMember {
                    group: self.name.clone(),
                    member: *member,
                });
            }
        }
        match self.master {
            Some(master) if !self.members.contains(&master) => {
                return Err(Error::master_not_member(&self.name, master));
            }
            None if self.policy.requires_master() => {
                return Err(Error::MasterRequired {
                    group: self.name.clone(),
                    policy: self.policy,
                });
            }
            _ => {}
        }
        Ok(())
    }
}

/// CRUD store for group definitions; a cheaply cloneable handle.
///
/// Invalid configurations are rejected here, at create/update time — never
/// during propagation.
#[derive(Debug, Clone, Default)]
pub struct GroupStore {
    inner: Arc<Mutex<HashMap<Uuid, SyncGroup>>>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        name: &str,
        members: Vec<SocketAddr>,
        policy: SyncPolicy,
        master: Option<SocketAddr>,
    ) -> Result<SyncGroup> {
        let group = SyncGroup {
            id: Uuid::new_v4(),
            name: name.to_string(),
            members,
            policy,
            master,
        };
        group.validate()?;
        self.inner
            .lock()
            .unwrap()
            .insert(group.id, group.clone());
        Ok(group)
    }

    /// Replace a stored group with an edited copy.
    ///
    /// # Example
    ///
    /// ```
    /// use yeelight_rs::{GroupStore, SyncPolicy};
    ///
    /// let store = GroupStore::new();
    /// let master = "10.0.0.2:55443".parse().unwrap();
    /// let mut group = store
    ///     .create(
    ///         "hall",
    ///         vec![master, "10.0.0.3:55443".parse().unwrap()],
    ///         SyncPolicy::Mirror,
    ///         Some(master),
    ///     )
    ///     .unwrap();
    ///
    /// group.set_name("hallway");
    /// store.update(group).unwrap();
    /// ```
    pub fn update(&self, group: SyncGroup) -> Result<()> {
        group.validate()?;
        let mut groups = self.inner.lock().unwrap();
        if !groups.contains_key(&group.id) {
            return Err(Error::GroupNotFound(group.id));
        }
        groups.insert(group.id, group);
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<SyncGroup> {
        self.inner
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(Error::GroupNotFound(id))
    }

    pub fn get(&self, id: Uuid) -> Option<SyncGroup> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<SyncGroup> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Groups whose master is the given device.
    pub fn mastered_by(&self, addr: SocketAddr) -> Vec<SyncGroup> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|g| g.master == Some(addr))
            .cloned()
            .collect()
    }

    /// Serialize every group for the caller's persistent store.
    pub fn snapshot(&self) -> Result<String> {
        serde_json::to_string(&self.all()).map_err(Error::JsonDump)
    }

    /// Load previously persisted groups. Invalid records are rejected.
    pub fn load_snapshot(&self, snapshot: &str) -> Result<usize> {
        let groups: Vec<SyncGroup> = serde_json::from_str(snapshot).map_err(Error::JsonLoad)?;
        for group in &groups {
            group.validate()?;
        }
        let count = groups.len();
        let mut map = self.inner.lock().unwrap();
        for group in groups {
            map.insert(group.id, group);
        }
        Ok(count)
    }
}

/// Non-owning directory of open sessions, keyed by device address.
///
/// The coordinator sends commands through these handles but never closes
/// them; lifecycle stays with whoever opened each session.
#[derive(Debug, Clone, Default)]
pub struct SessionMap {
    inner: Arc<Mutex<HashMap<SocketAddr, ControlSession>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: ControlSession) {
        self.inner
            .lock()
            .unwrap()
            .insert(session.addr(), session);
    }

    pub fn unregister(&self, addr: SocketAddr) -> Option<ControlSession> {
        self.inner.lock().unwrap().remove(&addr)
    }

    pub fn get(&self, addr: SocketAddr) -> Option<ControlSession> {
        self.inner.lock().unwrap().get(&addr).cloned()
    }
}

/// One command of a propagation plan.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SyncCommand {
    SetPower(Power),
    SetBrightness(Brightness),
    SetRgb(Rgb),
    SetColorTemperature(Kelvin),
}

/// The exact-copy plan: power, then brightness, then color, in that order.
/// `Color::White` carries no temperature, so it adds no color command.
fn mirror_plan(state: DeviceState) -> Vec<SyncCommand> {
    match state {
        DeviceState::Unknown => Vec::new(),
        DeviceState::Off => vec![SyncCommand::SetPower(Power::Off)],
        DeviceState::On { brightness, color } => {
            let mut plan = vec![
                SyncCommand::SetPower(Power::On),
                SyncCommand::SetBrightness(brightness),
            ];
            match color {
                Color::Rgb(rgb) => plan.push(SyncCommand::SetRgb(rgb)),
                Color::Temperature(kelvin) => {
                    plan.push(SyncCommand::SetColorTemperature(kelvin))
                }
                Color::White => {}
            }
            plan
        }
    }
}

/// Compute the commands for one target member.
fn plan_for(policy: SyncPolicy, master_state: DeviceState, jitter_seed: u64) -> Vec<SyncCommand> {
    match policy {
        SyncPolicy::Mirror | SyncPolicy::Sequence => mirror_plan(master_state),
        SyncPolicy::Alternate => master_state
            .power()
            .map(|p| vec![SyncCommand::SetPower(p.inverted())])
            .unwrap_or_default(),
        SyncPolicy::Random => mirror_plan(master_state)
            .into_iter()
            .map(|command| match command {
                SyncCommand::SetBrightness(b) => {
                    SyncCommand::SetBrightness(jittered(b, jitter_seed))
                }
                other => other,
            })
            .collect(),
    }
}

/// Brightness with a bounded offset, kept within the firmware-valid 1-100.
fn jittered(brightness: Brightness, seed: u64) -> Brightness {
    let offset = (seed % (2 * RANDOM_JITTER as u64 + 1)) as i64 - RANDOM_JITTER;
    Brightness::clamped((brightness.value() as i64 + offset).clamp(1, 100))
}

/// Per-invocation seed; not reproducible, just spread.
fn jitter_seed(salt: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    nanos ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Counters aggregated for observability; sync errors are never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Members fully updated.
    pub propagated: u64,
    /// Members skipped for lack of a ready session.
    pub skipped: u64,
    /// Members whose plan failed partway.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    propagated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Propagates master state changes to group members.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    groups: GroupStore,
    sessions: SessionMap,
    stats: Arc<StatCounters>,
}

impl SyncCoordinator {
    pub fn new(groups: GroupStore, sessions: SessionMap) -> Self {
        Self {
            groups,
            sessions,
            stats: Arc::new(StatCounters::default()),
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            propagated: self.stats.propagated.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Consume state-change events until cancelled or the bus closes.
    ///
    /// Events from one device arrive in the order its session read them;
    /// lagging behind the bus only drops superseded snapshots.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<StateChange>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("sync coordinator lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Fan a state change out to every group mastered by the device.
    /// A device that masters no group propagates nothing.
    fn handle(&self, event: StateChange) {
        for group in self.groups.mastered_by(event.addr) {
            debug!(
                "propagating {:?} from {} to group {}",
                event.state,
                event.addr,
                group.name()
            );
            let sessions = self.sessions.clone();
            let stats = Arc::clone(&self.stats);
            let state = event.state;
            tokio::spawn(async move {
                propagate(&group, state, &sessions, &stats).await;
            });
        }
    }
}

/// Push the master's state to every other member of one group.
async fn propagate(
    group: &SyncGroup,
    master_state: DeviceState,
    sessions: &SessionMap,
    stats: &StatCounters,
) {
    let targets: Vec<SocketAddr> = group
        .members()
        .iter()
        .copied()
        .filter(|m| Some(*m) != group.master())
        .collect();

    let sends = targets.into_iter().enumerate().map(|(position, member)| {
        let plan = plan_for(group.policy(), master_state, jitter_seed(position as u64));
        let delay = match group.policy() {
            SyncPolicy::Sequence => SEQUENCE_STAGGER * position as u32,
            _ => Duration::ZERO,
        };
        let session = sessions.get(member);
        let group_name = group.name().to_string();

        async move {
            if plan.is_empty() {
                return;
            }
            let Some(session) = session else {
                debug!("{group_name}: no session for {member}, skipping");
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if session.state() != SessionState::Ready {
                debug!("{group_name}: session for {member} not ready, skipping");
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            for command in plan {
                if let Err(err) = dispatch(&session, &command).await {
                    warn!("{group_name}: propagation to {member} failed: {err}");
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            stats.propagated.fetch_add(1, Ordering::Relaxed);
        }
    });

    futures::future::join_all(sends).await;
}

async fn dispatch(session: &ControlSession, command: &SyncCommand) -> Result<()> {
    match command {
        SyncCommand::SetPower(power) => session.set_power(*power).await,
        SyncCommand::SetBrightness(brightness) => session.set_brightness(*brightness).await,
        SyncCommand::SetRgb(rgb) => session.set_rgb(*rgb).await,
        SyncCommand::SetColorTemperature(kelvin) => session.set_color_temperature(*kelvin).await,
    }
}
