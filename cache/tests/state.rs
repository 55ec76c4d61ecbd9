use async_trait::async_trait;
use cordstate_cache::{
    change::EntityKey,
    config::CacheConfig,
    fetch::{Fetch, FetchError},
    state::{AuthorDisplay, AuthorTag},
    subscription::Filter,
    Scope, State,
};
use cordstate_models::{
    channel::Channel,
    event::{EntityKind, Event, Op},
    field::Field,
    id::{ChannelId, GuildId, Id, UserId},
    member::Member,
    message::Message,
    user::User,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::runtime::Handle;

/// Answers member lookups with nickname "B" and records every request.
#[derive(Default)]
struct Remote {
    requests: Mutex<Vec<(GuildId, Vec<UserId>)>>,
}

#[async_trait]
impl Fetch for Remote {
    async fn members(
        &self,
        guild_id: GuildId,
        user_ids: Vec<UserId>,
    ) -> Result<Vec<Member>, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((guild_id, user_ids.clone()));
        Ok(user_ids
            .into_iter()
            .map(|id| Member {
                user: User::stub(id),
                nick: Field::Value("B".into()),
                roles: Field::Value(vec![Id::new(2)]),
                joined_at: Field::Null,
            })
            .collect())
    }

    async fn user(&self, _user_id: UserId) -> Result<User, FetchError> {
        Err(FetchError::NotFound)
    }

    async fn channel(&self, _channel_id: ChannelId) -> Result<Channel, FetchError> {
        Err(FetchError::NotFound)
    }
}

fn state(remote: Arc<Remote>) -> (State, cordstate_cache::subscription::Dispatcher) {
    let (state, dispatcher) =
        State::new(CacheConfig::default(), remote, Handle::current()).unwrap();
    state
        .merger()
        .apply_raw(
            br#"{"t":"GUILD_CREATE","d":{"id":"1","name":"g",
                "roles":[{"id":"1","permissions":"0"},{"id":"2","color":42,"position":1,"permissions":"0"}]}}"#,
        )
        .unwrap();
    (state, dispatcher)
}

fn message(author: u64, webhook: bool) -> Message {
    let raw = format!(
        r#"{{"id":"77","channel_id":"3","guild_id":"1","author":{{"id":"{author}","username":"name{author}"}}{}}}"#,
        if webhook { r#","webhook_id":"8""# } else { "" }
    );
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test(start_paused = true)]
async fn miss_then_resolve_fetches_once_per_window() {
    let remote = Arc::new(Remote::default());
    let (state, _dispatcher) = state(Arc::clone(&remote));
    let scope = Scope::new();

    for user in [5, 6, 5, 7] {
        assert!(state
            .fetcher()
            .ensure_member(Id::new(1), Id::new(user), &scope)
            .is_none());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requests = remote.requests.lock().unwrap().clone();
    assert_eq!(requests, vec![(Id::new(1), vec![Id::new(5), Id::new(6), Id::new(7)])]);
    let member = state.cache().member(Id::new(1), Id::new(6)).unwrap();
    assert_eq!(member.nick.value().unwrap(), "B");
}

#[tokio::test(start_paused = true)]
async fn author_display_requests_missing_members() {
    let remote = Arc::new(Remote::default());
    let (state, _dispatcher) = state(Arc::clone(&remote));
    let scope = Scope::new();

    let first = state.author_display(&message(5, false), &scope).unwrap();
    assert_eq!(
        first,
        AuthorDisplay {
            name: "name5".into(),
            color: None,
            tag: None,
        }
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let resolved = state.author_display(&message(5, false), &scope).unwrap();
    assert_eq!(resolved.name, "B");
    assert_eq!(resolved.color, Some(42));

    let webhook = state.author_display(&message(9, true), &scope).unwrap();
    assert_eq!(webhook.tag, Some(AuthorTag::Webhook));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.requests.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetches_for_ended_scopes_never_run() {
    let remote = Arc::new(Remote::default());
    let (state, _dispatcher) = state(Arc::clone(&remote));
    let panel = Scope::new();
    {
        let _guard = panel.guard();
        state.fetcher().ensure_member(Id::new(1), Id::new(5), &panel);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(remote.requests.lock().unwrap().is_empty());
    assert!(state.cache().member(Id::new(1), Id::new(5)).is_none());
}

#[tokio::test(start_paused = true)]
async fn subscriptions_filter_and_stop_on_cancel() {
    let remote = Arc::new(Remote::default());
    let (state, mut dispatcher) = state(remote);
    dispatcher.dispatch_pending();

    let scope = Scope::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    state.subscribe(
        [Filter::new(Op::Update, EntityKind::Member)],
        &scope,
        move |notification| {
            sink.lock()
                .unwrap()
                .push((notification.op, notification.kind))
        },
    );

    let member_update = |nick: &str| {
        format!(r#"{{"t":"MEMBER_UPDATE","d":{{"guild_id":"1","member":{{"user":{{"id":"5"}},"nick":"{nick}"}}}}}}"#)
    };
    let merger = state.merger();
    merger.apply_raw(member_update("a").as_bytes()).unwrap();
    merger.apply_raw(member_update("b").as_bytes()).unwrap();
    merger
        .apply_raw(br#"{"t":"CHANNEL_CREATE","d":{"id":"3","guild_id":"1","type":0}}"#)
        .unwrap();
    merger
        .apply_raw(br#"{"t":"CHANNEL_DELETE","d":{"id":"3","guild_id":"1"}}"#)
        .unwrap();
    dispatcher.dispatch_pending();

    // the first update has to create the member and is still an update
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(Op::Update, EntityKind::Member); 2]
    );

    merger.apply_raw(member_update("b").as_bytes()).unwrap();
    dispatcher.dispatch_pending();
    assert_eq!(seen.lock().unwrap().len(), 3);

    scope.cancel();
    merger.apply_raw(member_update("c").as_bytes()).unwrap();
    dispatcher.dispatch_pending();
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert!(state.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dispatcher_runs_on_its_own_task() {
    let remote = Arc::new(Remote::default());
    let (state, mut dispatcher) = state(remote);
    dispatcher.dispatch_pending();
    let scope = Scope::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state.subscribe([], &scope, move |notification| {
        let _ = tx.send(notification.changes.first().map(|change| change.key));
    });
    let delivery = tokio::spawn(async move { dispatcher.run().await });

    state
        .merger()
        .apply(Event::from_json(br#"{"t":"USER_UPDATE","d":{"id":"4","username":"x"}}"#).unwrap())
        .unwrap();
    let key = rx.recv().await.unwrap().unwrap();
    assert_eq!(key, EntityKey::User(Id::new(4)));

    scope.cancel();
    drop(state);
    delivery.await.unwrap();
}
