use cordstate_models::{event::Event, id::GuildId, stats::PendingCounters};
use dashmap::DashMap;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Guild-scoped events that arrived before their guild, held until the
/// guild create shows up.
pub(crate) struct PendingEvents {
    queues: DashMap<GuildId, VecDeque<(Instant, Event)>>,
    depth: usize,
    ttl: Duration,
}

impl PendingEvents {
    pub fn new(depth: usize, ttl: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            depth,
            ttl,
        }
    }

    /// Holds `event` back. Once a guild has `depth` events queued the oldest
    /// is dropped to make room. Expired events of every guild are pruned
    /// first, so guilds that never arrive don't keep their queues.
    pub fn push(&self, guild_id: GuildId, event: Event, stats: &PendingCounters) {
        self.prune(stats);
        if self.depth == 0 {
            stats.overflowed.inc();
            return;
        }
        let mut queue = self.queues.entry(guild_id).or_default();
        while queue.len() >= self.depth {
            if let Some((_, dropped)) = queue.pop_front() {
                stats.overflowed.inc();
                debug!(guild = ?guild_id, event = dropped.name(), "Pending queue full, dropping oldest event");
            }
        }
        trace!(guild = ?guild_id, event = event.name(), "Holding event until its guild arrives");
        queue.push_back((Instant::now(), event));
        stats.queued.inc();
    }

    /// Removes and returns the queued events of a guild that have not
    /// expired, oldest first.
    pub fn take(&self, guild_id: GuildId, stats: &PendingCounters) -> Vec<Event> {
        let Some((_, queue)) = self.queues.remove(&guild_id) else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut events = Vec::with_capacity(queue.len());
        for (queued_at, event) in queue {
            if now.duration_since(queued_at) > self.ttl {
                stats.expired.inc();
                debug!(guild = ?guild_id, event = event.name(), "Dropping expired pending event");
            } else {
                events.push(event);
            }
        }
        events
    }

    fn prune(&self, stats: &PendingCounters) {
        let now = Instant::now();
        self.queues.retain(|guild_id, queue| {
            while let Some((queued_at, _)) = queue.front() {
                if now.duration_since(*queued_at) <= self.ttl {
                    break;
                }
                if let Some((_, expired)) = queue.pop_front() {
                    stats.expired.inc();
                    trace!(guild = ?guild_id, event = expired.name(), "Pruned expired pending event");
                }
            }
            !queue.is_empty()
        });
    }

    #[cfg(test)]
    pub fn guilds(&self) -> usize {
        self.queues.len()
    }

    /// Drops everything queued for a guild that will not arrive.
    pub fn discard(&self, guild_id: GuildId, stats: &PendingCounters) {
        if let Some((_, queue)) = self.queues.remove(&guild_id) {
            stats.discarded.inc_by(queue.len() as u64);
            debug!(guild = ?guild_id, count = queue.len(), "Discarded pending events");
        }
    }

    pub fn len(&self, guild_id: GuildId) -> usize {
        self.queues.get(&guild_id).map_or(0, |q| q.len())
    }
}
