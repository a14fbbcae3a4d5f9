//! Talkgroup registry: membership, talker arbitration and squelch timeout.
//!
//! The registry is a plain value owned by the reflector core and mutated only
//! from its event loop. It knows nothing about the transport; mutating calls
//! return [`TalkerChange`] events which the core translates into broadcasts.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

/// Server-assigned identifier of a connected client, unique for the process
/// lifetime.
pub type ClientId = u32;

/// Talkgroup 0 is the "not subscribed" sentinel; it carries no membership and
/// no talker.
pub const NO_TG: u32 = 0;

/// Emitted whenever a talkgroup's current talker changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TalkerChange {
    pub tg: u32,
    pub old: Option<ClientId>,
    pub new: Option<ClientId>,
}

#[derive(Debug)]
struct TalkerSlot {
    client: ClientId,
    last_audio: Instant,
}

/// Authoritative map of talkgroup membership and current talkers.
#[derive(Debug)]
pub struct TgRegistry {
    sql_timeout: Duration,
    sql_timeout_blocktime: Duration,
    members: HashMap<u32, HashSet<ClientId>>,
    tg_of: HashMap<ClientId, u32>,
    talkers: HashMap<u32, TalkerSlot>,
    blocked_until: HashMap<ClientId, Instant>,
}

impl TgRegistry {
    /// `sql_timeout` of zero disables the squelch timeout entirely.
    pub fn new(sql_timeout: Duration, sql_timeout_blocktime: Duration) -> Self {
        Self {
            sql_timeout,
            sql_timeout_blocktime,
            members: HashMap::new(),
            tg_of: HashMap::new(),
            talkers: HashMap::new(),
            blocked_until: HashMap::new(),
        }
    }

    /// Move `client` into `tg`, leaving any previous talkgroup first.
    ///
    /// Joining the talkgroup the client is already in is a no-op. Joining
    /// [`NO_TG`] is a plain leave.
    pub fn join(&mut self, client: ClientId, tg: u32) -> Vec<TalkerChange> {
        if self.tg_of(client) == tg {
            return Vec::new();
        }
        let events = self.leave(client);
        if tg != NO_TG {
            self.members.entry(tg).or_default().insert(client);
            self.tg_of.insert(client, tg);
        }
        events
    }

    /// Remove `client` from its talkgroup, clearing the talker slot if it was
    /// the current talker there.
    pub fn leave(&mut self, client: ClientId) -> Vec<TalkerChange> {
        let Some(tg) = self.tg_of.remove(&client) else {
            return Vec::new();
        };
        if let Some(set) = self.members.get_mut(&tg) {
            set.remove(&client);
            if set.is_empty() {
                self.members.remove(&tg);
            }
        }
        match self.talkers.get(&tg) {
            Some(slot) if slot.client == client => {
                self.talkers.remove(&tg);
                vec![TalkerChange {
                    tg,
                    old: Some(client),
                    new: None,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Full cleanup on disconnect: membership, talker slot and block entry.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<TalkerChange> {
        let events = self.leave(client);
        self.blocked_until.remove(&client);
        events
    }

    /// Seat, refresh or clear the talker of `tg`.
    ///
    /// Seating is refused when the candidate is not a member of `tg` or is
    /// inside its squelch block window. Re-seating the incumbent refreshes
    /// the last-audio timestamp without emitting an event. Clearing an empty
    /// slot is a no-op.
    pub fn set_talker(
        &mut self,
        tg: u32,
        client: Option<ClientId>,
        now: Instant,
    ) -> Option<TalkerChange> {
        if tg == NO_TG {
            return None;
        }
        match client {
            Some(c) => {
                if !self.is_member(c, tg) || self.is_blocked(c, now) {
                    return None;
                }
                if let Some(slot) = self.talkers.get_mut(&tg) {
                    if slot.client == c {
                        slot.last_audio = now;
                        return None;
                    }
                }
                let old = self
                    .talkers
                    .insert(
                        tg,
                        TalkerSlot {
                            client: c,
                            last_audio: now,
                        },
                    )
                    .map(|slot| slot.client);
                Some(TalkerChange {
                    tg,
                    old,
                    new: Some(c),
                })
            }
            None => self.talkers.remove(&tg).map(|slot| TalkerChange {
                tg,
                old: Some(slot.client),
                new: None,
            }),
        }
    }

    pub fn talker(&self, tg: u32) -> Option<ClientId> {
        self.talkers.get(&tg).map(|slot| slot.client)
    }

    pub fn members(&self, tg: u32) -> impl Iterator<Item = ClientId> + '_ {
        self.members.get(&tg).into_iter().flatten().copied()
    }

    pub fn has_members(&self, tg: u32) -> bool {
        self.members.get(&tg).is_some_and(|set| !set.is_empty())
    }

    pub fn is_member(&self, client: ClientId, tg: u32) -> bool {
        self.members
            .get(&tg)
            .is_some_and(|set| set.contains(&client))
    }

    /// Current talkgroup of `client`, [`NO_TG`] when unsubscribed.
    pub fn tg_of(&self, client: ClientId) -> u32 {
        self.tg_of.get(&client).copied().unwrap_or(NO_TG)
    }

    /// Whether `client` is still inside a squelch block window.
    pub fn is_blocked(&self, client: ClientId, now: Instant) -> bool {
        self.blocked_until
            .get(&client)
            .is_some_and(|&until| now < until)
    }

    /// Evaluate the squelch timeout.
    ///
    /// Called on every incoming audio frame and on the periodic tick. A
    /// talker whose last audio is `sql_timeout` old is cleared and blocked
    /// for `sql_timeout_blocktime` to suppress immediate re-seizure.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<TalkerChange> {
        self.blocked_until.retain(|_, until| now < *until);
        if self.sql_timeout.is_zero() {
            return Vec::new();
        }
        let stale: Vec<u32> = self
            .talkers
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_audio) >= self.sql_timeout)
            .map(|(&tg, _)| tg)
            .collect();
        let mut events = Vec::with_capacity(stale.len());
        for tg in stale {
            if let Some(slot) = self.talkers.remove(&tg) {
                self.blocked_until
                    .insert(slot.client, now + self.sql_timeout_blocktime);
                events.push(TalkerChange {
                    tg,
                    old: Some(slot.client),
                    new: None,
                });
            }
        }
        events
    }
}
