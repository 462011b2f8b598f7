//! "Most recent" and "next" calendar event resolution across season boundaries.

use chrono::{DateTime, Datelike, Utc};
use pitwall_adapters::{AdapterError, CalendarProvider};
use pitwall_core::CalendarEvent;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LOOKBACK_SEASONS: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no competitive event has started yet in seasons {searched:?}")]
    NoPastEvent { searched: Vec<i32> },
}

/// Latest competitive event that started at or before `now`, and the season it belongs to.
///
/// Seasons are searched from `now`'s year backwards, `lookback` seasons deep. A season whose
/// calendar cannot be fetched counts as having no qualifying event.
pub async fn resolve_most_recent<C>(
    calendar: &C,
    now: DateTime<Utc>,
    lookback: u32,
) -> Result<(CalendarEvent, i32), ResolveError>
where
    C: CalendarProvider + ?Sized,
{
    let current = now.year();
    let mut searched = Vec::new();

    for season in (0..=lookback as i32).map(|back| current - back) {
        searched.push(season);
        let events = match calendar.event_schedule(season).await {
            Ok(events) => events,
            Err(err) => {
                warn!(season, error = %err, "calendar unavailable; treating season as empty");
                continue;
            }
        };

        let latest = events
            .into_iter()
            .filter(|e| e.format.is_competitive() && e.start <= now)
            .max_by_key(|e| e.start);
        if let Some(event) = latest {
            debug!(season, round = event.round, name = %event.name, "resolved most recent event");
            return Ok((event, season));
        }
    }

    Err(ResolveError::NoPastEvent { searched })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Upcoming {
    Scheduled(CalendarEvent),
    /// The calendar has nothing left; round 1 of `season` with unknown dates.
    Placeholder { season: i32 },
}

/// Earliest competitive event of `now`'s season whose weekend has not started yet.
///
/// Only a calendar that was fetched and has nothing left yields a placeholder; a failed
/// fetch is returned to the caller.
pub async fn resolve_upcoming<C>(calendar: &C, now: DateTime<Utc>) -> Result<Upcoming, AdapterError>
where
    C: CalendarProvider + ?Sized,
{
    let season = now.year();
    let events = calendar.event_schedule(season).await?;

    let next = events
        .into_iter()
        .filter(|e| e.format.is_competitive() && e.weekend_start() > now)
        .min_by_key(|e| e.weekend_start());
    Ok(match next {
        Some(event) => Upcoming::Scheduled(event),
        None => Upcoming::Placeholder { season: season + 1 },
    })
}
