use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{Receiver, Sender, Stage};
use rand::Rng;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};

use crate::settings::Settings;
use crate::types::{Message, Target};

/// A target admitted into the schedule table, with its next fire time.
/// Owned exclusively by the scheduler; downstream stages get copies of the
/// inner [`Target`], never a handle to this.
#[derive(Debug)]
struct ScheduledTarget {
    target: Target,
    next_fire: Instant,
}

/// Head stage: keeps the per-target schedule table and emits due targets
/// on a fixed tick.
///
/// Target-list reloads arrive on the control queue and are merged keyed by
/// url; nothing else ever mutates the table.
pub struct Scheduler {
    settings: Settings,
}

impl Scheduler {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Merge a reload batch into the schedule table.
    ///
    /// First fire times are spread by a random jitter proportional to the
    /// batch size, so registering many targets at once does not burst them
    /// all into the same tick.
    fn reload(&self, entries: &[Value], config: &mut HashMap<String, ScheduledTarget>) {
        let accepted: Vec<Target> =
            entries.iter().filter_map(|entry| validate_target(entry, &self.settings)).collect();

        let spread = accepted.len() as f64 / f64::from(self.settings.max_connections_per_second);
        let mut rng = rand::thread_rng();
        let now = Instant::now();

        for target in accepted {
            let jitter = Duration::from_secs_f64(rng.gen_range(0.0..=spread));
            config.insert(
                target.url.clone(),
                ScheduledTarget { next_fire: now + jitter, target },
            );
        }
    }

    /// One evaluation pass: advance elapsed entries by their own interval
    /// (fixed cadence, immune to execution jitter) and emit them as a
    /// batch, unless downstream is too far behind.
    fn tick(&self, config: &mut HashMap<String, ScheduledTarget>, sink: &Sender<Message>) {
        let now = Instant::now();
        let mut due = Vec::new();

        for entry in config.values_mut() {
            if entry.next_fire <= now {
                entry.next_fire += Duration::from_secs(entry.target.schedule);
                due.push(entry.target.clone());
            }
        }

        if due.is_empty() {
            return;
        }

        if sink.depth() > 2 * config.len() {
            tracing::warn!("have to drop a batch of {} due targets, running busy", due.len());
        } else {
            sink.put(Message::Due(due));
        }
    }
}

#[async_trait]
impl Stage<Message> for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        let mut config: HashMap<String, ScheduledTarget> = HashMap::new();
        let mut timer = tokio::time::interval(self.settings.tick_period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            match source.try_take() {
                Some(Message::Terminal) => return Ok(()),
                Some(Message::Reload(entries)) => self.reload(&entries, &mut config),
                Some(other) => {
                    tracing::warn!("scheduler ignoring unexpected message: {other:?}");
                }
                None => {}
            }

            self.tick(&mut config, &sink);
        }
    }
}

/// Admission check for one raw target entry. Pure; rejects the whole entry
/// on any violation so one malformed target never blocks the others.
pub fn validate_target(entry: &Value, settings: &Settings) -> Option<Target> {
    let Some(fields) = entry.as_object() else {
        tracing::warn!("wrong target config, not an object: {entry}");
        return None;
    };

    let Some(url) = fields.get("url").and_then(Value::as_str) else {
        tracing::warn!("wrong 'url' in target config: {entry}");
        return None;
    };

    let schedule = match fields.get("schedule").and_then(Value::as_u64) {
        Some(schedule)
            if (settings.min_poll_period_sec..=settings.max_poll_period_sec)
                .contains(&schedule) =>
        {
            schedule
        }
        _ => {
            tracing::warn!("wrong 'schedule' in target config: {entry}");
            return None;
        }
    };

    let regex = match fields.get("regex") {
        None | Some(Value::Null) => None,
        Some(Value::String(pattern)) if pattern.is_empty() => None,
        Some(Value::String(pattern)) => Some(pattern.clone()),
        Some(_) => {
            tracing::warn!("wrong 'regex' in target config: {entry}");
            return None;
        }
    };

    Some(Target { url: url.to_string(), schedule, regex })
}
