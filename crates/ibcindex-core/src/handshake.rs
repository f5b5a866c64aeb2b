//! Handshake state tracker: connection and channel state machines.
//!
//! ```text
//! connection:  INIT ──(try on counterparty)──▶ TRYOPEN ──(ack)──▶ OPEN
//!              (B's own row starts at TRYOPEN and opens on confirm)
//! channel:     same, gated on its connection being OPEN, plus
//!              OPEN ──(close_init / close_confirm)──▶ CLOSED
//! ```
//!
//! A step applies only when the entity is in the expected predecessor state.
//! Otherwise it waits in a bounded buffer keyed by whatever it is waiting on
//! and is retried when that entity changes, or on the next sweep. When the
//! counterparty chain is known but not indexed, the steps it would host are
//! never observed, so INIT may go straight to OPEN on ack.
//!
//! Replays are no-ops: each `(entity, step)` is recorded once, after the
//! entity row it changed, and a step whose target state is already reached
//! only records its event row.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::anomaly::{self, Anomaly, AnomalyKind};
use crate::error::Result;
use crate::event::{CanonicalEvent, ChannelHandshake, ConnectionHandshake, EventKind, HandshakeStep};
use crate::model::{ChannelRow, ConnectionRow, HandshakeEntity, HandshakeEventRow};
use crate::pending::{Pending, PendingQueue};
use crate::store::ReadModelStore;
use crate::topology::{Counterparty, Topology};
use crate::types::{ChannelKey, ChannelStatus, ClientKey, ConnectionKey, ConnectionStatus};

/// What a buffered step is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait {
    /// A state change of this entity.
    Entity(HandshakeEntity),
    /// The counterparty chain to become resolvable.
    Topology,
}

/// One unit of handshake work derived from an event.
#[derive(Debug, Clone)]
enum Action {
    /// The step's effect on the entity on the emitting chain.
    Own(CanonicalEvent),
    /// An `open_try` advancing the initiator's entity from INIT to TRYOPEN.
    AdvanceInitiator(CanonicalEvent),
}

impl Action {
    fn event(&self) -> &CanonicalEvent {
        match self {
            Self::Own(ev) | Self::AdvanceInitiator(ev) => ev,
        }
    }

    fn describe(&self) -> String {
        let ev = self.event();
        let what = match &ev.kind {
            EventKind::ConnectionHandshake(c) => {
                format!("connection {} {}", c.connection_id, c.step.as_str())
            }
            EventKind::ChannelHandshake(c) => {
                format!("channel {}/{} {}", c.port_id, c.channel_id, c.step.as_str())
            }
            other => other.name().to_string(),
        };
        match self {
            Self::Own(_) => what,
            Self::AdvanceInitiator(_) => format!("{what} (initiator side)"),
        }
    }
}

enum StepResult {
    Applied(HandshakeEntity),
    Noop,
    Blocked(Wait),
}

pub struct HandshakeTracker {
    store: Arc<dyn ReadModelStore>,
    topology: Topology,
    pending: PendingQueue<Wait, Action>,
}

impl HandshakeTracker {
    pub fn new(
        store: Arc<dyn ReadModelStore>,
        topology: Topology,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            topology,
            pending: PendingQueue::new(capacity, ttl),
        }
    }

    /// Number of buffered steps.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply one handshake event. Other events are ignored.
    pub async fn apply(&mut self, ev: &CanonicalEvent, now: DateTime<Utc>) -> Result<()> {
        let is_try = match &ev.kind {
            EventKind::ConnectionHandshake(c) => c.step == HandshakeStep::OpenTry,
            EventKind::ChannelHandshake(c) => c.step == HandshakeStep::OpenTry,
            _ => return Ok(()),
        };
        let mut work = VecDeque::new();
        work.push_back(Pending {
            key: Wait::Topology,
            value: Action::Own(ev.clone()),
            enqueued_at: now,
        });
        if is_try {
            work.push_back(Pending {
                key: Wait::Topology,
                value: Action::AdvanceInitiator(ev.clone()),
                enqueued_at: now,
            });
        }
        self.run(work, now).await
    }

    /// Escalate expired steps and retry the rest.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        let sweep = self.pending.sweep(now);
        for item in sweep.expired {
            let ev = item.value.event();
            anomaly::record(
                self.store.as_ref(),
                Anomaly::new(
                    AnomalyKind::Ordering,
                    ev.chain_id.clone(),
                    item.value.describe(),
                    &ev.event_id(),
                    format!("handshake step still waiting for {:?} after TTL", item.key),
                    now,
                ),
            )
            .await?;
        }
        self.run(sweep.retry.into(), now).await
    }

    async fn run(
        &mut self,
        mut work: VecDeque<Pending<Wait, Action>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        while let Some(item) = work.pop_front() {
            match self.step(&item.value).await? {
                StepResult::Applied(entity) => {
                    work.extend(self.pending.take(&Wait::Entity(entity)));
                    work.extend(self.pending.take(&Wait::Topology));
                }
                StepResult::Noop => {}
                StepResult::Blocked(wait) => {
                    tracing::debug!(step = %item.value.describe(), wait = ?wait, "handshake step buffered");
                    let evicted = self.pending.requeue(Pending {
                        key: wait,
                        value: item.value,
                        enqueued_at: item.enqueued_at,
                    });
                    if let Some(evicted) = evicted {
                        self.overflow(evicted, now).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn overflow(&self, evicted: Pending<Wait, Action>, now: DateTime<Utc>) -> Result<()> {
        let ev = evicted.value.event();
        anomaly::record(
            self.store.as_ref(),
            Anomaly::new(
                AnomalyKind::BufferOverflow,
                ev.chain_id.clone(),
                evicted.value.describe(),
                &ev.event_id(),
                "handshake buffer full; oldest step evicted",
                now,
            ),
        )
        .await?;
        Ok(())
    }

    async fn step(&self, action: &Action) -> Result<StepResult> {
        let ev = action.event();
        match (&ev.kind, action) {
            (EventKind::ConnectionHandshake(c), Action::Own(_)) => self.connection_own(ev, c).await,
            (EventKind::ConnectionHandshake(c), Action::AdvanceInitiator(_)) => {
                self.connection_initiator(ev, c).await
            }
            (EventKind::ChannelHandshake(c), Action::Own(_)) => self.channel_own(ev, c).await,
            (EventKind::ChannelHandshake(c), Action::AdvanceInitiator(_)) => {
                self.channel_initiator(ev, c).await
            }
            _ => Ok(StepResult::Noop),
        }
    }

    async fn record_step(
        &self,
        entity: &HandshakeEntity,
        step: HandshakeStep,
        ev: &CanonicalEvent,
    ) -> Result<()> {
        self.store
            .insert_handshake_event(HandshakeEventRow {
                entity: entity.clone(),
                step,
                event: ev.event_ref(),
            })
            .await?;
        Ok(())
    }

    // ─── Connections ─────────────────────────────────────────────────────────

    async fn connection_own(
        &self,
        ev: &CanonicalEvent,
        c: &ConnectionHandshake,
    ) -> Result<StepResult> {
        let key = ConnectionKey::new(c.ibc, ev.chain_id.clone(), c.connection_id.clone());
        let entity = HandshakeEntity::Connection(key.clone());
        if self.store.has_handshake_event(&entity, c.step).await? {
            return Ok(StepResult::Noop);
        }
        let existing = self.store.get_connection(&key).await?;

        let next = match (c.step, existing) {
            // Connections do not close.
            (HandshakeStep::CloseInit | HandshakeStep::CloseConfirm, _) => {
                return Ok(StepResult::Noop)
            }
            (HandshakeStep::OpenInit | HandshakeStep::OpenTry, Some(_)) => None,
            (HandshakeStep::OpenInit | HandshakeStep::OpenTry, None) => {
                let client = ClientKey::new(c.ibc, ev.chain_id.clone(), c.client_id.clone());
                let counterparty = self.topology.client_counterparty(&client).await?;
                let status = if c.step == HandshakeStep::OpenInit {
                    ConnectionStatus::Init
                } else {
                    ConnectionStatus::Tryopen
                };
                Some(ConnectionRow {
                    key: key.clone(),
                    client_id: c.client_id.clone(),
                    counterparty_chain_id: counterparty.chain_id().map(str::to_string),
                    counterparty_client_id: c.counterparty_client_id.clone(),
                    counterparty_connection_id: c.counterparty_connection_id.clone(),
                    status,
                    created_at: ev.event_ref(),
                    updated_at: ev.event_ref(),
                })
            }
            (_, None) => return Ok(StepResult::Blocked(Wait::Entity(entity))),
            (_, Some(row)) if row.status == ConnectionStatus::Open => None,
            (HandshakeStep::OpenAck, Some(mut row)) => {
                if row.status == ConnectionStatus::Init {
                    match self.topology.connection_counterparty(&key, None).await? {
                        Counterparty::External(_) => {}
                        Counterparty::Indexed(_) => {
                            return Ok(StepResult::Blocked(Wait::Entity(entity)))
                        }
                        Counterparty::Unknown => return Ok(StepResult::Blocked(Wait::Topology)),
                    }
                }
                row.status = ConnectionStatus::Open;
                if c.counterparty_connection_id.is_some() {
                    row.counterparty_connection_id = c.counterparty_connection_id.clone();
                }
                Some(row)
            }
            (_, Some(mut row)) => {
                // open_confirm
                if row.status != ConnectionStatus::Tryopen {
                    return Ok(StepResult::Blocked(Wait::Entity(entity)));
                }
                row.status = ConnectionStatus::Open;
                Some(row)
            }
        };

        match next {
            Some(mut row) => {
                if row.counterparty_chain_id.is_none() {
                    row.counterparty_chain_id = self
                        .topology
                        .connection_counterparty(&key, Some(&c.client_id))
                        .await?
                        .chain_id()
                        .map(str::to_string);
                }
                row.updated_at = ev.event_ref();
                tracing::debug!(connection = %key, status = %row.status, "connection updated");
                self.store.put_connection(row).await?;
                self.record_step(&entity, c.step, ev).await?;
                Ok(StepResult::Applied(entity))
            }
            None => {
                self.record_step(&entity, c.step, ev).await?;
                Ok(StepResult::Noop)
            }
        }
    }

    /// `open_try` on B moves A's connection INIT → TRYOPEN.
    async fn connection_initiator(
        &self,
        ev: &CanonicalEvent,
        c: &ConnectionHandshake,
    ) -> Result<StepResult> {
        let Some(initiator_conn) = &c.counterparty_connection_id else {
            return Ok(StepResult::Noop);
        };
        let client = ClientKey::new(c.ibc, ev.chain_id.clone(), c.client_id.clone());
        let initiator_chain = match self.topology.client_counterparty(&client).await? {
            Counterparty::Indexed(chain) => chain,
            Counterparty::External(_) => return Ok(StepResult::Noop),
            Counterparty::Unknown => return Ok(StepResult::Blocked(Wait::Topology)),
        };
        let key = ConnectionKey::new(c.ibc, initiator_chain, initiator_conn.clone());
        let entity = HandshakeEntity::Connection(key.clone());
        match self.store.get_connection(&key).await? {
            None => Ok(StepResult::Blocked(Wait::Entity(entity))),
            Some(mut row) if row.status == ConnectionStatus::Init => {
                row.status = ConnectionStatus::Tryopen;
                row.counterparty_connection_id = Some(c.connection_id.clone());
                if row.counterparty_chain_id.is_none() {
                    row.counterparty_chain_id = Some(ev.chain_id.clone());
                }
                row.updated_at = ev.event_ref();
                tracing::debug!(connection = %key, "connection advanced to TRYOPEN by counterparty");
                self.store.put_connection(row).await?;
                Ok(StepResult::Applied(entity))
            }
            Some(_) => Ok(StepResult::Noop),
        }
    }

    // ─── Channels ────────────────────────────────────────────────────────────

    async fn connection_open(&self, key: &ConnectionKey) -> Result<bool> {
        Ok(self
            .store
            .get_connection(key)
            .await?
            .map(|c| c.status == ConnectionStatus::Open)
            .unwrap_or(false))
    }

    async fn channel_own(&self, ev: &CanonicalEvent, c: &ChannelHandshake) -> Result<StepResult> {
        let key = ChannelKey::new(
            c.ibc,
            ev.chain_id.clone(),
            c.port_id.clone(),
            c.channel_id.clone(),
        );
        let entity = HandshakeEntity::Channel(key.clone());
        if self.store.has_handshake_event(&entity, c.step).await? {
            return Ok(StepResult::Noop);
        }
        let conn_key = ConnectionKey::new(c.ibc, ev.chain_id.clone(), c.connection_id.clone());
        let existing = self.store.get_channel(&key).await?;

        let next = match (c.step, existing) {
            (HandshakeStep::OpenInit | HandshakeStep::OpenTry, Some(_)) => None,
            (HandshakeStep::OpenInit | HandshakeStep::OpenTry, None) => {
                let counterparty = self
                    .topology
                    .channel_counterparty(&key, Some(&c.connection_id))
                    .await?;
                let status = if c.step == HandshakeStep::OpenInit {
                    ChannelStatus::Init
                } else {
                    ChannelStatus::Tryopen
                };
                Some(ChannelRow {
                    key: key.clone(),
                    connection_id: c.connection_id.clone(),
                    counterparty_chain_id: counterparty.chain_id().map(str::to_string),
                    counterparty_port_id: c.counterparty_port_id.clone(),
                    counterparty_channel_id: c.counterparty_channel_id.clone(),
                    version: c.version.clone(),
                    status,
                    created_at: ev.event_ref(),
                    updated_at: ev.event_ref(),
                })
            }
            (_, None) => return Ok(StepResult::Blocked(Wait::Entity(entity))),
            (HandshakeStep::OpenAck | HandshakeStep::OpenConfirm, Some(row))
                if matches!(row.status, ChannelStatus::Open | ChannelStatus::Closed) =>
            {
                None
            }
            (HandshakeStep::OpenAck, Some(mut row)) => {
                if !self.connection_open(&conn_key).await? {
                    return Ok(StepResult::Blocked(Wait::Entity(HandshakeEntity::Connection(
                        conn_key,
                    ))));
                }
                if row.status == ChannelStatus::Init {
                    match self.topology.channel_counterparty(&key, None).await? {
                        Counterparty::External(_) => {}
                        Counterparty::Indexed(_) => {
                            return Ok(StepResult::Blocked(Wait::Entity(entity)))
                        }
                        Counterparty::Unknown => return Ok(StepResult::Blocked(Wait::Topology)),
                    }
                }
                row.status = ChannelStatus::Open;
                if c.counterparty_channel_id.is_some() {
                    row.counterparty_channel_id = c.counterparty_channel_id.clone();
                }
                if c.version.is_some() {
                    row.version = c.version.clone();
                }
                Some(row)
            }
            (HandshakeStep::OpenConfirm, Some(mut row)) => {
                if row.status != ChannelStatus::Tryopen {
                    return Ok(StepResult::Blocked(Wait::Entity(entity)));
                }
                if !self.connection_open(&conn_key).await? {
                    return Ok(StepResult::Blocked(Wait::Entity(HandshakeEntity::Connection(
                        conn_key,
                    ))));
                }
                row.status = ChannelStatus::Open;
                Some(row)
            }
            (HandshakeStep::CloseInit | HandshakeStep::CloseConfirm, Some(mut row)) => match row.status {
                ChannelStatus::Closed => None,
                ChannelStatus::Open => {
                    row.status = ChannelStatus::Closed;
                    Some(row)
                }
                ChannelStatus::Init | ChannelStatus::Tryopen => {
                    return Ok(StepResult::Blocked(Wait::Entity(entity)))
                }
            },
        };

        match next {
            Some(mut row) => {
                if row.counterparty_chain_id.is_none() {
                    row.counterparty_chain_id = self
                        .topology
                        .channel_counterparty(&key, Some(&c.connection_id))
                        .await?
                        .chain_id()
                        .map(str::to_string);
                }
                row.updated_at = ev.event_ref();
                tracing::debug!(channel = %key, status = %row.status, "channel updated");
                self.store.put_channel(row).await?;
                self.record_step(&entity, c.step, ev).await?;
                Ok(StepResult::Applied(entity))
            }
            None => {
                self.record_step(&entity, c.step, ev).await?;
                Ok(StepResult::Noop)
            }
        }
    }

    /// `open_try` on B moves A's channel INIT → TRYOPEN.
    async fn channel_initiator(
        &self,
        ev: &CanonicalEvent,
        c: &ChannelHandshake,
    ) -> Result<StepResult> {
        let Some(initiator_channel) = &c.counterparty_channel_id else {
            return Ok(StepResult::Noop);
        };
        let own = ChannelKey::new(
            c.ibc,
            ev.chain_id.clone(),
            c.port_id.clone(),
            c.channel_id.clone(),
        );
        let initiator_chain = match self
            .topology
            .channel_counterparty(&own, Some(&c.connection_id))
            .await?
        {
            Counterparty::Indexed(chain) => chain,
            Counterparty::External(_) => return Ok(StepResult::Noop),
            Counterparty::Unknown => return Ok(StepResult::Blocked(Wait::Topology)),
        };
        let key = ChannelKey::new(
            c.ibc,
            initiator_chain,
            c.counterparty_port_id.clone(),
            initiator_channel.clone(),
        );
        let entity = HandshakeEntity::Channel(key.clone());
        match self.store.get_channel(&key).await? {
            None => Ok(StepResult::Blocked(Wait::Entity(entity))),
            Some(mut row) if row.status == ChannelStatus::Init => {
                row.status = ChannelStatus::Tryopen;
                row.counterparty_channel_id = Some(c.channel_id.clone());
                if row.counterparty_chain_id.is_none() {
                    row.counterparty_chain_id = Some(ev.chain_id.clone());
                }
                row.updated_at = ev.event_ref();
                tracing::debug!(channel = %key, "channel advanced to TRYOPEN by counterparty");
                self.store.put_channel(row).await?;
                Ok(StepResult::Applied(entity))
            }
            Some(_) => Ok(StepResult::Noop),
        }
    }
}
