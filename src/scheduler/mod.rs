//! The scheduler supervisor: owns one ticker per (system, feed) pair and
//! reconciles that set against the database on demand.
//!
//! Mutating operations (start, refresh, delete, reset, shutdown) are
//! serialized through one async mutex so the ticker map is never observed
//! in a torn state; status reads and manual triggers only take a read view.

pub mod ticker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::FeedConfig;
use crate::db;
use crate::update::recorder::{self, FeedStatus};
use crate::update::{FeedUpdate, UpdateContext};
use ticker::{resolve_schedule, run_ticker, Schedule, TickerArgs, TickerCommand};

/// Backoff bounds for restarting a crashed ticker task.
const RESTART_BACKOFF_INITIAL: StdDuration = StdDuration::from_secs(1);
const RESTART_BACKOFF_MAX: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no such feed: {system_id}/{feed_id}")]
    NoSuchFeed { system_id: String, feed_id: String },
    #[error("update already in progress")]
    UpdateInProgress,
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("update task failed: {0}")]
    TaskFailed(String),
}

type FeedKey = (String, String);

struct TickerHandle {
    config: Arc<FeedConfig>,
    schedule: Schedule,
    status: Arc<RwLock<FeedStatus>>,
    commands: mpsc::Sender<TickerCommand>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    ctx: Arc<UpdateContext>,
    update_timeout: StdDuration,
    tickers: RwLock<HashMap<FeedKey, TickerHandle>>,
    /// Serializes mutating operations.
    ops: Mutex<()>,
    /// Bumped on reset/shutdown so late restart callbacks from a previous
    /// generation detect they are stale and no-op.
    generation: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(ctx: Arc<UpdateContext>, update_timeout: StdDuration) -> Self {
        Self {
            ctx,
            update_timeout,
            tickers: RwLock::new(HashMap::new()),
            ops: Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load every active system from the database and create its tickers.
    pub async fn start(&self) -> Result<(), sqlx::Error> {
        let _ops = self.ops.lock().await;
        let systems = db::list_active_systems(&self.ctx.pool).await?;
        info!(systems = systems.len(), "Starting scheduler");
        for system_id in systems {
            self.refresh_locked(&system_id).await?;
        }
        Ok(())
    }

    /// Reconcile the tickers for one system with its desired feed set.
    pub async fn refresh_system(&self, system_id: &str) -> Result<(), sqlx::Error> {
        let _ops = self.ops.lock().await;
        self.refresh_locked(system_id).await
    }

    /// Stop every ticker belonging to a system. Blocks until in-flight
    /// updates complete; the database rows are the caller's concern.
    pub async fn delete_system(&self, system_id: &str) {
        let _ops = self.ops.lock().await;
        let removed = {
            let mut map = self.tickers.write().await;
            let keys: Vec<FeedKey> = map
                .keys()
                .filter(|(sid, _)| sid == system_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| map.remove(&key))
                .collect::<Vec<_>>()
        };
        info!(system_id, tickers = removed.len(), "Deleting system from scheduler");
        stop_handles(removed).await;
    }

    /// Stop every ticker and rebuild the whole set from the database.
    /// Bounded by the longest in-flight update.
    pub async fn reset(&self) -> Result<usize, sqlx::Error> {
        let _ops = self.ops.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let all = {
            let mut map = self.tickers.write().await;
            map.drain().map(|(_, handle)| handle).collect::<Vec<_>>()
        };
        info!(tickers = all.len(), "Resetting scheduler");
        stop_handles(all).await;

        let systems = db::list_active_systems(&self.ctx.pool).await?;
        for system_id in &systems {
            self.refresh_locked(system_id).await?;
        }

        let count = self.tickers.read().await.len();
        info!(tickers = count, "Scheduler reset complete");
        Ok(count)
    }

    /// Live status of every ticker, ordered by (system, feed).
    pub async fn status(&self) -> Vec<FeedStatus> {
        let map = self.tickers.read().await;
        let mut statuses = Vec::with_capacity(map.len());
        for handle in map.values() {
            statuses.push(handle.status.read().await.clone());
        }
        drop(map);
        statuses.sort_by(|a, b| {
            (a.system_id.as_str(), a.feed_id.as_str())
                .cmp(&(b.system_id.as_str(), b.feed_id.as_str()))
        });
        statuses
    }

    /// Route a manual fire to the named ticker and wait for its result.
    /// Fails fast when no such ticker exists or one is already running.
    pub async fn trigger_update(
        &self,
        system_id: &str,
        feed_id: &str,
        force: bool,
    ) -> Result<FeedUpdate, TriggerError> {
        let sender = {
            let map = self.tickers.read().await;
            match map.get(&(system_id.to_string(), feed_id.to_string())) {
                Some(handle) => handle.commands.clone(),
                None => {
                    return Err(TriggerError::NoSuchFeed {
                        system_id: system_id.to_string(),
                        feed_id: feed_id.to_string(),
                    })
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(TickerCommand::Fire {
                force,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TriggerError::ShuttingDown)?;
        reply_rx.await.map_err(|_| TriggerError::ShuttingDown)?
    }

    /// Signal every ticker to stop and wait up to `deadline` for in-flight
    /// updates. After the deadline, outstanding tasks are abandoned.
    pub async fn shutdown(&self, deadline: StdDuration) {
        let _ops = self.ops.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let all = {
            let mut map = self.tickers.write().await;
            map.drain().map(|(_, handle)| handle).collect::<Vec<_>>()
        };
        info!(tickers = all.len(), "Shutting down scheduler");

        for handle in &all {
            let _ = handle.stop.send(true);
        }
        let join_all = futures::future::join_all(all.into_iter().map(|handle| handle.task));
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Shutdown deadline exceeded, abandoning in-flight updates"
            );
        }
    }

    async fn refresh_locked(&self, system_id: &str) -> Result<(), sqlx::Error> {
        // A system that is not ACTIVE has an empty desired set.
        let desired: Vec<(FeedConfig, usize)> = match db::get_system(&self.ctx.pool, system_id)
            .await?
        {
            Some(row) if row.status == db::SystemStatus::Active => {
                db::feeds_for_system(&self.ctx.pool, system_id).await?
            }
            _ => Vec::new(),
        };
        let agency_tz = db::first_valid_agency_timezone(&self.ctx.pool, system_id).await?;

        let mut to_stop = Vec::new();
        let mut to_create = Vec::new();
        {
            let map = self.tickers.read().await;
            let desired_by_id: HashMap<&str, (&FeedConfig, usize)> = desired
                .iter()
                .map(|(config, order)| (config.id.as_str(), (config, *order)))
                .collect();

            for (key, handle) in map.iter().filter(|((sid, _), _)| sid == system_id) {
                match desired_by_id.get(key.1.as_str()) {
                    // Unchanged: keep the live ticker.
                    Some((config, order))
                        if **config == *handle.config
                            && resolve_schedule(config, *order, agency_tz) == handle.schedule => {}
                    // Changed: recreate rather than reconfigure in place.
                    Some(_) => to_stop.push(key.clone()),
                    // Removed.
                    None => to_stop.push(key.clone()),
                }
            }

            for (config, order) in &desired {
                let key = (system_id.to_string(), config.id.clone());
                let unchanged_live = map
                    .get(&key)
                    .is_some_and(|handle| !to_stop.contains(&key) && *handle.config == *config);
                if !unchanged_live {
                    to_create.push((config.clone(), *order));
                }
            }
        }

        if !to_stop.is_empty() || !to_create.is_empty() {
            info!(
                system_id,
                stopping = to_stop.len(),
                creating = to_create.len(),
                "Refreshing system feeds"
            );
        }

        let removed = {
            let mut map = self.tickers.write().await;
            to_stop
                .into_iter()
                .filter_map(|key| map.remove(&key))
                .collect::<Vec<_>>()
        };
        stop_handles(removed).await;

        for (config, order) in to_create {
            let handle = self.create_ticker(system_id, config, order, agency_tz).await;
            let key = (system_id.to_string(), handle.config.id.clone());
            self.tickers.write().await.insert(key, handle);
        }
        Ok(())
    }

    async fn create_ticker(
        &self,
        system_id: &str,
        config: FeedConfig,
        install_order: usize,
        agency_tz: Option<chrono_tz::Tz>,
    ) -> TickerHandle {
        let schedule = resolve_schedule(&config, install_order, agency_tz);

        // Seed live status from the latest durable records so a restart or
        // reset does not zero the observable history.
        let (last_successful, last_finished) =
            match recorder::latest_times(&self.ctx.pool, system_id, &config.id).await {
                Ok(times) => times,
                Err(e) => {
                    warn!(system_id, feed_id = %config.id, error = %e, "Failed to load last update times");
                    (None, None)
                }
            };

        let config = Arc::new(config);
        let status = Arc::new(RwLock::new(FeedStatus {
            system_id: system_id.to_string(),
            feed_id: config.id.clone(),
            feed_config: (*config).clone(),
            currently_running: false,
            last_successful_update_ms: last_successful,
            last_finished_update_ms: last_finished,
            next_fire_ms: None,
        }));

        let (command_tx, command_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let args = TickerArgs {
            ctx: self.ctx.clone(),
            system_id: system_id.to_string(),
            config: config.clone(),
            schedule: schedule.clone(),
            status: status.clone(),
            commands: Arc::new(Mutex::new(command_rx)),
            stop: stop_rx,
            update_timeout: self.update_timeout,
        };
        let task = spawn_supervised(args, self.generation.clone());

        TickerHandle {
            config,
            schedule,
            status,
            commands: command_tx,
            stop: stop_tx,
            task,
        }
    }
}

/// Signal a batch of tickers to stop and wait for each to finish its
/// in-flight update.
async fn stop_handles(handles: Vec<TickerHandle>) {
    for handle in &handles {
        let _ = handle.stop.send(true);
    }
    for handle in handles {
        if let Err(e) = handle.task.await {
            error!(error = %e, "Ticker supervision task failed during stop");
        }
    }
}

/// Run the ticker, restarting it with exponential backoff if it panics.
/// Restarts from a previous generation (a reset or shutdown happened in
/// between) detect the stale generation and no-op.
fn spawn_supervised(args: TickerArgs, generation: Arc<AtomicU64>) -> JoinHandle<()> {
    let spawned_in = generation.load(Ordering::SeqCst);
    tokio::spawn(async move {
        let mut backoff = RESTART_BACKOFF_INITIAL;
        loop {
            let incarnation = tokio::spawn(run_ticker(args.clone()));
            match incarnation.await {
                Ok(()) => break,
                Err(e) => {
                    if *args.stop.borrow() || generation.load(Ordering::SeqCst) != spawned_in {
                        break;
                    }
                    error!(
                        system_id = %args.system_id,
                        feed_id = %args.config.id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Ticker task panicked, restarting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                    if *args.stop.borrow() || generation.load(Ordering::SeqCst) != spawned_in {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingPolicy;
    use crate::feeds::{FeedParser, NyctStationRow, ParseError, ParsedFeed, ParserRegistry};
    use crate::update::tests::spawn_feed_server;
    use crate::update::UpdateStatus;
    use axum::routing::get;
    use axum::Router;
    use sqlx::SqlitePool;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A trivial parser so scheduler tests can serve arbitrary small bodies.
    struct NoopParser;

    impl FeedParser for NoopParser {
        fn feed_type(&self) -> &'static str {
            "TEST_NOOP"
        }

        fn parse(&self, _bytes: &[u8], _options: &serde_json::Value) -> Result<ParsedFeed, ParseError> {
            Ok(ParsedFeed::NyctStations(vec![NyctStationRow {
                gtfs_stop_id: "X01".into(),
                complex_id: "1".into(),
                stop_name: None,
                borough: None,
                daytime_routes: None,
                lat: None,
                lon: None,
            }]))
        }
    }

    async fn test_scheduler() -> (Arc<Scheduler>, SqlitePool) {
        let pool = db::test_pool().await;
        let mut registry = ParserRegistry::with_builtin();
        registry.register(Arc::new(NoopParser));
        let ctx = Arc::new(UpdateContext {
            pool: pool.clone(),
            client: reqwest::Client::new(),
            registry: Arc::new(registry),
            parse_timeout: StdDuration::from_secs(10),
            database_timeout: StdDuration::from_secs(10),
        });
        let scheduler = Arc::new(Scheduler::new(ctx, StdDuration::from_secs(30)));
        (scheduler, pool)
    }

    fn noop_feed(id: &str, url: String, policy: SchedulingPolicy, period_ms: Option<u64>) -> FeedConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "TEST_NOOP",
            "url": url,
            "scheduling_policy": match policy {
                SchedulingPolicy::Default => "DEFAULT",
                SchedulingPolicy::Periodic => "PERIODIC",
                SchedulingPolicy::Daily => "DAILY",
                SchedulingPolicy::None => "NONE",
            },
            "update_period_ms": period_ms,
        }))
        .unwrap()
    }

    async fn install(
        pool: &SqlitePool,
        scheduler: &Scheduler,
        system_id: &str,
        feeds: Vec<FeedConfig>,
    ) {
        db::upsert_system(pool, system_id, None, db::SystemStatus::Active, "{}")
            .await
            .unwrap();
        db::replace_feeds(pool, system_id, &feeds).await.unwrap();
        scheduler.refresh_system(system_id).await.unwrap();
    }

    async fn count_updates(pool: &SqlitePool, system_id: &str, feed_id: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM feed_updates WHERE system_id = ? AND feed_id = ?",
        )
        .bind(system_id)
        .bind(feed_id)
        .fetch_one(pool)
        .await
        .unwrap();
        count
    }

    async fn count_with_status(pool: &SqlitePool, status: UpdateStatus) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM feed_updates WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(pool)
                .await
                .unwrap();
        count
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_steady_state_updates_then_skips() {
        let counter = Arc::new(AtomicUsize::new(0));
        let frozen = Arc::new(AtomicBool::new(false));
        let route_counter = counter.clone();
        let route_frozen = frozen.clone();
        let base = spawn_feed_server(Router::new().route(
            "/feed",
            get(move || {
                let counter = route_counter.clone();
                let frozen = route_frozen.clone();
                async move {
                    if frozen.load(Ordering::SeqCst) {
                        "constant-body".to_string()
                    } else {
                        format!("body-{}", counter.fetch_add(1, Ordering::SeqCst))
                    }
                }
            }),
        ))
        .await;

        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed(
            "rt",
            format!("{}/feed", base),
            SchedulingPolicy::Periodic,
            Some(40),
        );
        install(&pool, &scheduler, "nyc", vec![feed]).await;

        tokio::time::sleep(StdDuration::from_millis(500)).await;
        let updated = count_with_status(&pool, UpdateStatus::Updated).await;
        assert!(updated >= 4, "expected steady updates, got {}", updated);

        // Identical bodies from here on: attempts flip to SKIPPED.
        frozen.store(true, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_millis(400)).await;
        let skipped = count_with_status(&pool, UpdateStatus::Skipped).await;
        assert!(skipped >= 1, "expected skips after content froze");

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_feed_drops_ticks_and_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let (route_active, route_max, route_counter) =
            (active.clone(), max_active.clone(), counter.clone());
        let base = spawn_feed_server(Router::new().route(
            "/slow",
            get(move || {
                let active = route_active.clone();
                let max_active = route_max.clone();
                let counter = route_counter.clone();
                async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now_active, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(150)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    format!("slow-{}", counter.fetch_add(1, Ordering::SeqCst))
                }
            }),
        ))
        .await;

        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed(
            "slow",
            format!("{}/slow", base),
            SchedulingPolicy::Periodic,
            Some(30),
        );
        install(&pool, &scheduler, "nyc", vec![feed]).await;

        tokio::time::sleep(StdDuration::from_millis(700)).await;
        scheduler.shutdown(StdDuration::from_secs(5)).await;

        // ~150ms per run over ~700ms: a handful of runs, nowhere near the
        // ~23 ticks the period alone would produce.
        let count = count_updates(&pool, "nyc", "slow").await;
        assert!((2..=8).contains(&count), "expected dropped ticks, got {}", count);
        assert_eq!(max_active.load(Ordering::SeqCst), 1, "updates overlapped");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_trigger_while_running_fails_fast() {
        let base = spawn_feed_server(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(StdDuration::from_millis(400)).await;
                "slow body"
            }),
        ))
        .await;

        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed("manual", format!("{}/slow", base), SchedulingPolicy::None, None);
        install(&pool, &scheduler, "nyc", vec![feed]).await;

        let background = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.trigger_update("nyc", "manual", true).await })
        };
        tokio::time::sleep(StdDuration::from_millis(100)).await;

        // The first update is mid-download: the ticker reports it as running
        // and rejects a second fire instead of queueing it.
        let statuses = scheduler.status().await;
        assert!(statuses[0].currently_running);
        let second = scheduler.trigger_update("nyc", "manual", true).await;
        assert!(matches!(second, Err(TriggerError::UpdateInProgress)));

        let first = background.await.unwrap().unwrap();
        assert_eq!(first.status, UpdateStatus::Updated);

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_unknown_feed_fails() {
        let (scheduler, _pool) = test_scheduler().await;
        let result = scheduler.trigger_update("nope", "missing", false).await;
        assert!(matches!(result, Err(TriggerError::NoSuchFeed { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_blocks_until_runner_finishes() {
        let base = spawn_feed_server(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(StdDuration::from_millis(300)).await;
                "slow body"
            }),
        ))
        .await;

        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed("f", format!("{}/slow", base), SchedulingPolicy::None, None);
        install(&pool, &scheduler, "nyc", vec![feed]).await;

        let background = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.trigger_update("nyc", "f", true).await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        scheduler.delete_system("nyc").await;

        // Delete waited for the in-flight run, whose record is persisted.
        assert_eq!(count_updates(&pool, "nyc", "f").await, 1);
        assert!(scheduler.status().await.is_empty());
        let result = background.await.unwrap();
        assert!(result.is_ok());

        // And nothing fires afterwards.
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(count_updates(&pool, "nyc", "f").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_rebuilds_from_database() {
        let (scheduler, pool) = test_scheduler().await;
        let feed_a = noop_feed("fa", "http://127.0.0.1:1/a".into(), SchedulingPolicy::None, None);
        let feed_b = noop_feed("fb", "http://127.0.0.1:1/b".into(), SchedulingPolicy::None, None);
        install(&pool, &scheduler, "aaa", vec![feed_a]).await;
        install(&pool, &scheduler, "bbb", vec![feed_b]).await;
        assert_eq!(scheduler.status().await.len(), 2);

        // Remove system B behind the scheduler's back, then reset.
        sqlx::query("DELETE FROM feeds WHERE system_id = 'bbb'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM systems WHERE id = 'bbb'")
            .execute(&pool)
            .await
            .unwrap();

        let count = scheduler.reset().await.unwrap();
        assert_eq!(count, 1);
        let statuses = scheduler.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].system_id, "aaa");
        assert_eq!(statuses[0].feed_id, "fa");

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_recreates_changed_feed() {
        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed("f", "http://127.0.0.1:1/old".into(), SchedulingPolicy::None, None);
        install(&pool, &scheduler, "nyc", vec![feed.clone()]).await;
        assert_eq!(scheduler.status().await[0].feed_config.url, "http://127.0.0.1:1/old");

        let mut changed = feed;
        changed.url = "http://127.0.0.1:1/new".into();
        db::replace_feeds(&pool, "nyc", &[changed]).await.unwrap();
        scheduler.refresh_system("nyc").await.unwrap();

        let statuses = scheduler.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].feed_config.url, "http://127.0.0.1:1/new");

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_removes_dropped_feed() {
        let (scheduler, pool) = test_scheduler().await;
        let feed_one = noop_feed("one", "http://127.0.0.1:1/1".into(), SchedulingPolicy::None, None);
        let feed_two = noop_feed("two", "http://127.0.0.1:1/2".into(), SchedulingPolicy::None, None);
        install(&pool, &scheduler, "nyc", vec![feed_one.clone(), feed_two]).await;
        assert_eq!(scheduler.status().await.len(), 2);

        db::replace_feeds(&pool, "nyc", &[feed_one]).await.unwrap();
        scheduler.refresh_system("nyc").await.unwrap();

        let statuses = scheduler.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].feed_id, "one");

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_is_seeded_from_update_history() {
        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed("f", "http://127.0.0.1:1/f".into(), SchedulingPolicy::None, None);

        // History exists before the ticker is (re)created.
        let mut past = crate::update::FeedUpdate::begin("nyc", &feed);
        past.started_at_ms = 1000;
        past.finished_at_ms = Some(1500);
        past.status = UpdateStatus::Updated;
        past.content_hash = Some("abc".into());
        recorder::insert(&pool, &past).await.unwrap();

        install(&pool, &scheduler, "nyc", vec![feed]).await;
        let statuses = scheduler.status().await;
        assert_eq!(statuses[0].last_successful_update_ms, Some(1500));
        assert_eq!(statuses[0].last_finished_update_ms, Some(1500));
        assert!(statuses[0].next_fire_ms.is_none());

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_future_updates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let route_counter = counter.clone();
        let base = spawn_feed_server(Router::new().route(
            "/feed",
            get(move || {
                let counter = route_counter.clone();
                async move { format!("body-{}", counter.fetch_add(1, Ordering::SeqCst)) }
            }),
        ))
        .await;

        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed(
            "rt",
            format!("{}/feed", base),
            SchedulingPolicy::Periodic,
            Some(40),
        );
        install(&pool, &scheduler, "nyc", vec![feed]).await;
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        scheduler.shutdown(StdDuration::from_secs(5)).await;
        assert!(scheduler.status().await.is_empty());

        let after_shutdown = count_updates(&pool, "nyc", "rt").await;
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(count_updates(&pool, "nyc", "rt").await, after_shutdown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_loads_only_active_systems() {
        let (scheduler, pool) = test_scheduler().await;
        let feed = noop_feed("f", "http://127.0.0.1:1/f".into(), SchedulingPolicy::None, None);

        db::upsert_system(&pool, "active", None, db::SystemStatus::Active, "{}")
            .await
            .unwrap();
        db::replace_feeds(&pool, "active", std::slice::from_ref(&feed))
            .await
            .unwrap();
        db::upsert_system(&pool, "broken", None, db::SystemStatus::InstallFailed, "{}")
            .await
            .unwrap();
        db::replace_feeds(&pool, "broken", &[feed]).await.unwrap();

        scheduler.start().await.unwrap();
        let statuses = scheduler.status().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].system_id, "active");

        scheduler.shutdown(StdDuration::from_secs(5)).await;
    }
}
