//! Per-feed tickers: one long-lived task per (system, feed) that turns the
//! feed's scheduling policy into update runs with at-most-one-in-flight
//! discipline. Slow feeds drop ticks instead of queueing them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::TriggerError;
use crate::config::{FeedConfig, SchedulingPolicy};
use crate::feeds::is_realtime;
use crate::update::recorder::{self, FeedStatus};
use crate::update::{run_update, FeedUpdate, UpdateContext, UpdateStatus};

/// A feed's scheduling policy with every default resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Periodic { period: StdDuration },
    Daily { time: NaiveTime, tz: Tz },
    /// Never fires autonomously; manual updates still route through the
    /// ticker for concurrency discipline.
    None,
}

impl Schedule {
    /// The next autonomous fire strictly after `now`. `last_fire` is the
    /// previous fire instant, if any; a fresh periodic ticker fires
    /// immediately.
    pub fn next_fire(
        &self,
        now: DateTime<Utc>,
        last_fire: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Periodic { period } => {
                let period = Duration::from_std(*period).unwrap_or(Duration::milliseconds(1));
                Some(match last_fire {
                    Some(last) => (last + period).max(now),
                    None => now,
                })
            }
            Schedule::Daily { time, tz } => next_daily_occurrence(now, *time, *tz),
            Schedule::None => None,
        }
    }
}

/// Resolve a feed's configured policy into a concrete schedule.
///
/// DEFAULT becomes PERIODIC for realtime feeds and DAILY otherwise. A DAILY
/// feed without an explicit time gets the staggered install-order default;
/// without an explicit timezone it uses the system's agency timezone,
/// falling back to UTC.
pub fn resolve_schedule(
    config: &FeedConfig,
    install_order: usize,
    agency_tz: Option<Tz>,
) -> Schedule {
    let policy = match config.scheduling_policy {
        SchedulingPolicy::Default => {
            if is_realtime(&config.feed_type) {
                SchedulingPolicy::Periodic
            } else {
                SchedulingPolicy::Daily
            }
        }
        other => other,
    };

    match policy {
        SchedulingPolicy::Periodic => Schedule::Periodic {
            period: StdDuration::from_millis(config.periodic_period_ms()),
        },
        SchedulingPolicy::Daily => {
            let time = config
                .daily_update_time
                .as_deref()
                .and_then(|raw| NaiveTime::parse_from_str(raw, "%H:%M").ok())
                .unwrap_or_else(|| default_daily_time(install_order));
            let tz = config
                .daily_update_timezone
                .as_deref()
                .and_then(|raw| raw.parse::<Tz>().ok())
                .or(agency_tz)
                .unwrap_or_else(|| {
                    warn!(
                        feed_id = %config.id,
                        "No timezone configured or resolvable from agencies, using UTC"
                    );
                    chrono_tz::UTC
                });
            Schedule::Daily { time, tz }
        }
        SchedulingPolicy::None => Schedule::None,
        SchedulingPolicy::Default => unreachable!("resolved above"),
    }
}

/// Default daily update time for the k-th feed in install order: 03:00 plus
/// ten minutes per feed, rolling past midnight.
pub fn default_daily_time(install_order: usize) -> NaiveTime {
    let minutes = (3 * 60 + 10 * install_order as u64) % (24 * 60);
    NaiveTime::from_num_seconds_from_midnight_opt(minutes as u32 * 60, 0)
        .unwrap_or(NaiveTime::MIN)
}

/// The next instant strictly after `now` whose wall-clock time in `tz`
/// equals `time`. DST gaps resolve to the next existing instant; repeated
/// wall times fire only on the first occurrence.
fn next_daily_occurrence(now: DateTime<Utc>, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let mut date = now.with_timezone(&tz).date_naive();
    // Three days covers "today's occurrence already passed" plus any gap.
    for _ in 0..3 {
        if let Some(candidate) = local_instant(NaiveDateTime::new(date, time), tz) {
            if candidate > now {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn local_instant(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        LocalResult::None => {
            // Skipped by a DST gap: scan forward for the next existing
            // wall-clock minute.
            let mut probe = local;
            for _ in 0..(24 * 60) {
                probe = probe + Duration::minutes(1);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    LocalResult::Ambiguous(first, _) => return Some(first.with_timezone(&Utc)),
                    LocalResult::None => continue,
                }
            }
            None
        }
    }
}

/// A manual fire request routed through the ticker.
pub(crate) enum TickerCommand {
    Fire {
        force: bool,
        reply: oneshot::Sender<Result<FeedUpdate, TriggerError>>,
    },
}

#[derive(Clone)]
pub(crate) struct TickerArgs {
    pub ctx: Arc<UpdateContext>,
    pub system_id: String,
    pub config: Arc<FeedConfig>,
    pub schedule: Schedule,
    pub status: Arc<RwLock<FeedStatus>>,
    /// Shared so a restarted ticker incarnation can keep receiving.
    pub commands: Arc<Mutex<mpsc::Receiver<TickerCommand>>>,
    pub stop: watch::Receiver<bool>,
    /// Hard cap on one update run.
    pub update_timeout: StdDuration,
}

/// The ticker task body. Returns when stopped or when the command channel
/// closes. The `running` flag lives in `status` and is mutated only here,
/// which is what provides the at-most-one-in-flight guarantee without a
/// per-feed lock.
pub(crate) async fn run_ticker(args: TickerArgs) {
    let TickerArgs {
        ctx,
        system_id,
        config,
        schedule,
        status,
        commands,
        mut stop,
        update_timeout,
    } = args;

    let mut commands = commands.lock().await;
    let mut in_flight: Option<InFlight> = None;
    let mut next_fire = schedule.next_fire(Utc::now(), None);
    status.write().await.next_fire_ms = next_fire.map(|t| t.timestamp_millis());

    info!(
        system_id = %system_id,
        feed_id = %config.id,
        schedule = ?schedule,
        "Ticker started"
    );

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = wait_until(next_fire), if next_fire.is_some() => {
                let fired_at = Utc::now();
                if in_flight.is_some() {
                    // Backpressure: drop the tick rather than queue it.
                    debug!(
                        system_id = %system_id,
                        feed_id = %config.id,
                        "Dropping tick, update still in progress"
                    );
                } else {
                    status.write().await.currently_running = true;
                    in_flight = Some(InFlight {
                        task: spawn_runner(ctx.clone(), system_id.clone(), config.clone(), false, update_timeout),
                        reply: None,
                    });
                }
                next_fire = schedule.next_fire(Utc::now(), Some(fired_at));
                status.write().await.next_fire_ms = next_fire.map(|t| t.timestamp_millis());
            }
            command = commands.recv() => {
                match command {
                    Some(TickerCommand::Fire { force, reply }) => {
                        if in_flight.is_some() {
                            let _ = reply.send(Err(TriggerError::UpdateInProgress));
                        } else {
                            status.write().await.currently_running = true;
                            in_flight = Some(InFlight {
                                task: spawn_runner(ctx.clone(), system_id.clone(), config.clone(), force, update_timeout),
                                reply: Some(reply),
                            });
                        }
                    }
                    None => break,
                }
            }
            result = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                let reply = in_flight.take().and_then(|f| f.reply);
                settle(&status, &system_id, &config.id, result, reply).await;
            }
        }
    }

    // Stopping waits for the in-flight run; the attempt record is always
    // persisted before the ticker goes away.
    if let Some(flight) = in_flight.take() {
        let result = flight.task.await;
        settle(&status, &system_id, &config.id, result, flight.reply).await;
    }

    info!(system_id = %system_id, feed_id = %config.id, "Ticker stopped");
}

struct InFlight {
    task: JoinHandle<FeedUpdate>,
    reply: Option<oneshot::Sender<Result<FeedUpdate, TriggerError>>>,
}

async fn join_in_flight(in_flight: &mut Option<InFlight>) -> Result<FeedUpdate, tokio::task::JoinError> {
    match in_flight {
        Some(flight) => (&mut flight.task).await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let delay = (at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            tokio::time::sleep(delay).await;
        }
        None => std::future::pending().await,
    }
}

/// Record a finished (or crashed) run in the live status and answer any
/// pending manual-fire caller.
async fn settle(
    status: &Arc<RwLock<FeedStatus>>,
    system_id: &str,
    feed_id: &str,
    result: Result<FeedUpdate, tokio::task::JoinError>,
    reply: Option<oneshot::Sender<Result<FeedUpdate, TriggerError>>>,
) {
    match result {
        Ok(update) => {
            let finished_at = update
                .finished_at_ms
                .unwrap_or_else(|| Utc::now().timestamp_millis());
            status.write().await.record_finished(update.status, finished_at);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(update));
            }
        }
        Err(join_err) => {
            status.write().await.currently_running = false;
            error!(system_id, feed_id, error = %join_err, "Update task failed");
            if let Some(reply) = reply {
                let _ = reply.send(Err(TriggerError::TaskFailed(join_err.to_string())));
            }
        }
    }
}

/// Spawn one runner invocation, bounded by the update cap so a wedged run
/// cannot block the ticker's stop path forever. A capped run is recorded as
/// an internal error.
fn spawn_runner(
    ctx: Arc<UpdateContext>,
    system_id: String,
    config: Arc<FeedConfig>,
    force: bool,
    cap: StdDuration,
) -> JoinHandle<FeedUpdate> {
    tokio::spawn(async move {
        match tokio::time::timeout(cap, run_update(&ctx, &system_id, &config, force)).await {
            Ok(update) => update,
            Err(_) => {
                warn!(
                    system_id = %system_id,
                    feed_id = %config.id,
                    cap_secs = cap.as_secs(),
                    "Update exceeded its time cap, abandoning"
                );
                let mut update = FeedUpdate::begin(&system_id, &config);
                update.started_at_ms -= cap.as_millis() as i64;
                update.finish(
                    UpdateStatus::FailedInternalError,
                    Some(format!("update cancelled after exceeding {}s cap", cap.as_secs())),
                );
                if let Err(e) = recorder::insert(&ctx.pool, &update).await {
                    error!(
                        system_id = %system_id,
                        feed_id = %config.id,
                        error = %e,
                        "Failed to persist capped update record"
                    );
                }
                update
            }
        }
    })
}
