use chrono::{DateTime, Duration, Utc};

use crate::config::PipelineSection;
use crate::date_util::midnight_utc;
use crate::sync::{SyncState, SyncWindow};

/// Decide the next window to fetch.
///
/// Within a run, windows are contiguous: each begins where `previous` ended.
/// The first window of a run starts at `default_start_date` when nothing has
/// been committed yet, otherwise `lookback_days` before the high-water mark
/// (never earlier than `default_start_date`) so late-arriving records are
/// picked up again. Returns `None` once the window would start at or after `now`.
pub fn next_window(
    state: &SyncState,
    previous: Option<&SyncWindow>,
    config: &PipelineSection,
    now: DateTime<Utc>,
) -> Option<SyncWindow> {
    let (begin, sequence) = match previous {
        Some(prev) => (prev.end, prev.sequence + 1),
        None => (first_begin(state, config), 1),
    };
    window_from(begin, sequence, config, now)
}

fn first_begin(state: &SyncState, config: &PipelineSection) -> DateTime<Utc> {
    let floor = midnight_utc(config.default_start_date);
    match state.high_water_mark {
        Some(hwm) => Duration::try_days(config.lookback_days)
            .and_then(|lookback| hwm.checked_sub_signed(lookback))
            .map_or(floor, |begin| begin.max(floor)),
        None => floor,
    }
}

/// A window starting at an explicit `begin`, clamped to `now`.
pub fn window_from(
    begin: DateTime<Utc>,
    sequence: u32,
    config: &PipelineSection,
    now: DateTime<Utc>,
) -> Option<SyncWindow> {
    if begin >= now {
        return None;
    }
    let end = Duration::try_days(config.batch_size_days.max(1))
        .and_then(|batch| begin.checked_add_signed(batch))
        .map_or(now, |end| end.min(now));
    Some(SyncWindow {
        begin,
        end,
        sequence,
    })
}

/// Every window a run would fetch, in order.
pub fn plan(
    state: &SyncState,
    start: Option<DateTime<Utc>>,
    config: &PipelineSection,
    now: DateTime<Utc>,
) -> Vec<SyncWindow> {
    let mut windows = Vec::new();
    let mut next = match start {
        Some(begin) => window_from(begin, 1, config, now),
        None => next_window(state, None, config, now),
    };
    while let Some(window) = next {
        next = next_window(state, Some(&window), config, now);
        windows.push(window);
    }
    windows
}
