#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod offline;

use cordstate_cache::{config::CacheConfig, Scope, State};
use cordstate_models::{event::Event, stats::CacheStats};
use offline::OfflineFetch;
use prometheus::{Encoder, TextEncoder};
use std::{env, error::Error, sync::Arc};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var("CORDSTATE_EVENT_LOG").ok())
        .ok_or("Expected an event log as the first argument or in CORDSTATE_EVENT_LOG")?;
    let config = CacheConfig::from_env()?;
    tracing::info!(path = %path, ?config, "Replaying event log");

    let (state, mut dispatcher) = State::new(config, Arc::new(OfflineFetch), Handle::current())?;

    let scope = Scope::new();
    state.subscribe([], &scope, |notification| {
        for change in &notification.changes {
            tracing::debug!(
                event = notification.event,
                op = ?change.op,
                key = ?change.key,
                "Cache change"
            );
        }
    });
    let delivery = tokio::spawn(async move { dispatcher.run().await });

    let file = File::open(&path).await?;
    let stats = Arc::clone(state.stats());
    let events = LinesStream::new(BufReader::new(file).lines())
        .filter_map(move |line| decode(line, &stats));
    state.merger().run(events).await;

    state.fetcher().shutdown();
    let cache = state.cache();
    let counts = &state.stats().resource_counts;
    tracing::info!(
        guilds = cache.guilds().len(),
        channels = counts.channels.get(),
        roles = counts.roles.get(),
        members = counts.members.get(),
        messages = counts.messages.get(),
        users = counts.users.get(),
        "Replay finished"
    );

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&state.stats().registry.gather(), &mut buffer)?;

    scope.cancel();
    drop(state);
    delivery.await?;

    println!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

fn decode(line: std::io::Result<String>, stats: &CacheStats) -> Option<Event> {
    let line = match line {
        Ok(line) => line,
        Err(err) => {
            tracing::error!(error = ?err, "Failed to read the event log");
            return None;
        }
    };
    if line.trim().is_empty() {
        return None;
    }
    match Event::from_json(line.as_bytes()) {
        Ok(event) => Some(event),
        Err(err) => {
            stats.event_counts.malformed.inc();
            tracing::warn!(error = %err, "Skipping undecodable event");
            None
        }
    }
}
