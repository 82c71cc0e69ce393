//! Window planner: turns one tick into the work units the engine executes.

use crate::config::{RelativeUnit, RelativeValue, ScraperSettings, SourceConfig, WindowUnit};
use crate::timeutil::{self, TimeError};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("range scrape requires rangeKeys")]
    MissingRangeKeys,
}

/// One HTTP request within a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    /// No time bounds in the request.
    Instant,
    /// Explicit half-open window rendered into start/end query parameters.
    Window {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Relative window rendered as a single `<unit>=<value>` parameter.
    Relative { unit: RelativeUnit, value: i64 },
}

#[derive(Debug)]
pub struct ScrapePlan {
    pub units: Vec<WorkUnit>,
    /// Last-success advances to this when every unit succeeds.
    pub end: DateTime<Utc>,
}

/// Time format used for rendering and parsing this source's timestamps:
/// rangeKeys.dateFormat, then scrape.timeFormat, then the global default.
pub fn time_format<'a>(source: &'a SourceConfig, defaults: &'a ScraperSettings) -> &'a str {
    source
        .scrape
        .range_keys
        .as_ref()
        .and_then(|rk| rk.date_format.as_deref())
        .or(source.scrape.time_format.as_deref())
        .unwrap_or(&defaults.default_time_format)
}

/// Compute the work units for one tick of `source` at wall-clock `now`.
pub fn plan_scrape(
    source: &SourceConfig,
    defaults: &ScraperSettings,
    now: DateTime<Utc>,
    last_success: Option<DateTime<Utc>>,
) -> Result<ScrapePlan, PlanError> {
    match source.scrape.mode {
        crate::config::ScrapeMode::Instant => Ok(ScrapePlan {
            units: vec![WorkUnit::Instant],
            end: now,
        }),
        crate::config::ScrapeMode::Range => {
            let range_keys = source
                .scrape
                .range_keys
                .as_ref()
                .ok_or(PlanError::MissingRangeKeys)?;

            if let Some(unit) = range_keys.unit {
                let value = match &range_keys.value {
                    RelativeValue::Fixed(v) => *v,
                    RelativeValue::Keyword(_) => {
                        let frequency = timeutil::parse_frequency(&source.frequency)?;
                        frequency.num_seconds() / unit.seconds()
                    }
                };
                let value = if range_keys.take_negative {
                    -value.abs()
                } else {
                    value
                };
                return Ok(ScrapePlan {
                    units: vec![WorkUnit::Relative { unit, value }],
                    end: now,
                });
            }

            let format = time_format(source, defaults);
            let start = match last_success {
                Some(start) => start,
                None => match &range_keys.first_scrape_start {
                    Some(raw) => timeutil::parse_datetime(raw, Some(format))?,
                    None => now - timeutil::parse_frequency(&source.frequency)?,
                },
            };
            let delta = source
                .scrape
                .parallel_window
                .as_ref()
                .map(parallel_delta);
            let units = timeutil::window_slices(start, now, delta)
                .into_iter()
                .map(|(start, end)| WorkUnit::Window { start, end })
                .collect();
            Ok(ScrapePlan { units, end: now })
        }
    }
}

fn parallel_delta(window: &crate::config::ParallelWindow) -> Duration {
    let value = window.value as i64;
    match window.unit {
        WindowUnit::Minutes => Duration::minutes(value),
        WindowUnit::Hours => Duration::hours(value),
        WindowUnit::Days => Duration::days(value),
    }
}
