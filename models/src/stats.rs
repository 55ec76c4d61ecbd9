use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::event::Event;

pub struct EventStats {
    pub ready: IntCounter,
    pub guild_create: IntCounter,
    pub guild_update: IntCounter,
    pub guild_delete: IntCounter,
    pub channel_create: IntCounter,
    pub channel_update: IntCounter,
    pub channel_delete: IntCounter,
    pub role_create: IntCounter,
    pub role_update: IntCounter,
    pub role_delete: IntCounter,
    pub member_add: IntCounter,
    pub member_update: IntCounter,
    pub member_remove: IntCounter,
    pub member_chunk: IntCounter,
    pub message_create: IntCounter,
    pub message_update: IntCounter,
    pub message_delete: IntCounter,
    pub user_update: IntCounter,
    pub malformed: IntCounter,
}

pub struct ResourceCounters {
    pub guilds: IntGauge,
    pub channels: IntGauge,
    pub roles: IntGauge,
    pub members: IntGauge,
    pub messages: IntGauge,
    pub users: IntGauge,
}

pub struct FetchCounters {
    pub requested: IntCounter,
    pub succeeded: IntCounter,
    pub failed: IntCounter,
    pub cancelled: IntCounter,
}

/// Counters for guild-scoped events that arrived before their guild.
pub struct PendingCounters {
    pub queued: IntCounter,
    pub replayed: IntCounter,
    pub overflowed: IntCounter,
    pub expired: IntCounter,
    pub discarded: IntCounter,
}

pub struct CacheStats {
    pub registry: Registry,
    pub event_counts: EventStats,
    pub resource_counts: ResourceCounters,
    pub fetch_counts: FetchCounters,
    pub pending_counts: PendingCounters,
}

impl CacheStats {
    pub fn new() -> prometheus::Result<Self> {
        let event_counter = IntCounterVec::new(
            Opts::new("gateway_events", "Events received from the gateway"),
            &["events"],
        )?;
        let resource_counter = IntGaugeVec::new(
            Opts::new("resource_counts", "Counts of all cached resources"),
            &["count"],
        )?;
        let fetch_counter = IntCounterVec::new(
            Opts::new("fetches", "On-demand fetches by outcome"),
            &["outcome"],
        )?;
        let pending_counter = IntCounterVec::new(
            Opts::new("pending_events", "Events held back for an unknown guild"),
            &["state"],
        )?;

        let registry = Registry::new_custom(Some("cordstate".into()), None)?;
        registry.register(Box::new(event_counter.clone()))?;
        registry.register(Box::new(resource_counter.clone()))?;
        registry.register(Box::new(fetch_counter.clone()))?;
        registry.register(Box::new(pending_counter.clone()))?;

        let event = |name: &str| event_counter.get_metric_with_label_values(&[name]);
        let resource = |name: &str| resource_counter.get_metric_with_label_values(&[name]);
        let fetch = |name: &str| fetch_counter.get_metric_with_label_values(&[name]);
        let pending = |name: &str| pending_counter.get_metric_with_label_values(&[name]);

        Ok(CacheStats {
            event_counts: EventStats {
                ready: event("Ready")?,
                guild_create: event("GuildCreate")?,
                guild_update: event("GuildUpdate")?,
                guild_delete: event("GuildDelete")?,
                channel_create: event("ChannelCreate")?,
                channel_update: event("ChannelUpdate")?,
                channel_delete: event("ChannelDelete")?,
                role_create: event("RoleCreate")?,
                role_update: event("RoleUpdate")?,
                role_delete: event("RoleDelete")?,
                member_add: event("MemberAdd")?,
                member_update: event("MemberUpdate")?,
                member_remove: event("MemberRemove")?,
                member_chunk: event("MemberChunk")?,
                message_create: event("MessageCreate")?,
                message_update: event("MessageUpdate")?,
                message_delete: event("MessageDelete")?,
                user_update: event("UserUpdate")?,
                malformed: event("Malformed")?,
            },
            resource_counts: ResourceCounters {
                guilds: resource("Guilds")?,
                channels: resource("Channels")?,
                roles: resource("Roles")?,
                members: resource("Members")?,
                messages: resource("Messages")?,
                users: resource("Users")?,
            },
            fetch_counts: FetchCounters {
                requested: fetch("Requested")?,
                succeeded: fetch("Succeeded")?,
                failed: fetch("Failed")?,
                cancelled: fetch("Cancelled")?,
            },
            pending_counts: PendingCounters {
                queued: pending("Queued")?,
                replayed: pending("Replayed")?,
                overflowed: pending("Overflowed")?,
                expired: pending("Expired")?,
                discarded: pending("Discarded")?,
            },
            registry,
        })
    }

    pub fn update(&self, event: &Event) {
        match event {
            Event::Ready(_) => self.event_counts.ready.inc(),
            Event::GuildCreate(_) => self.event_counts.guild_create.inc(),
            Event::GuildUpdate(_) => self.event_counts.guild_update.inc(),
            Event::GuildDelete(_) => self.event_counts.guild_delete.inc(),
            Event::ChannelCreate(_) => self.event_counts.channel_create.inc(),
            Event::ChannelUpdate(_) => self.event_counts.channel_update.inc(),
            Event::ChannelDelete(_) => self.event_counts.channel_delete.inc(),
            Event::RoleCreate(_) => self.event_counts.role_create.inc(),
            Event::RoleUpdate(_) => self.event_counts.role_update.inc(),
            Event::RoleDelete(_) => self.event_counts.role_delete.inc(),
            Event::MemberAdd(_) => self.event_counts.member_add.inc(),
            Event::MemberUpdate(_) => self.event_counts.member_update.inc(),
            Event::MemberRemove(_) => self.event_counts.member_remove.inc(),
            Event::MemberChunk(_) => self.event_counts.member_chunk.inc(),
            Event::MessageCreate(_) => self.event_counts.message_create.inc(),
            Event::MessageUpdate(_) => self.event_counts.message_update.inc(),
            Event::MessageDelete(_) => self.event_counts.message_delete.inc(),
            Event::UserUpdate(_) => self.event_counts.user_update.inc(),
        }
    }
}
