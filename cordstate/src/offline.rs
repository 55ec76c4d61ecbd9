use async_trait::async_trait;
use cordstate_cache::fetch::{Fetch, FetchError};
use cordstate_models::{
    channel::Channel,
    id::{ChannelId, GuildId, UserId},
    member::Member,
    user::User,
};
use tracing::debug;

/// A replay has no network to ask, so every lookup misses.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineFetch;

#[async_trait]
impl Fetch for OfflineFetch {
    async fn members(
        &self,
        guild_id: GuildId,
        user_ids: Vec<UserId>,
    ) -> Result<Vec<Member>, FetchError> {
        debug!(guild = ?guild_id, users = user_ids.len(), "Offline member lookup");
        Ok(Vec::new())
    }

    async fn user(&self, user_id: UserId) -> Result<User, FetchError> {
        debug!(user = ?user_id, "Offline user lookup");
        Err(FetchError::NotFound)
    }

    async fn channel(&self, channel_id: ChannelId) -> Result<Channel, FetchError> {
        debug!(channel = ?channel_id, "Offline channel lookup");
        Err(FetchError::NotFound)
    }
}
