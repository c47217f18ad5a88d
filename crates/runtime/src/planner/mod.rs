//! Schedule planning: timezone validation, cron synthesis, and fire-time
//! computation.
//!
//! All stored instants are UTC. Recurring schedules are snapshotted into a
//! 5-field UTC cron expression at plan time: the user's local `HH:MM` is
//! converted to UTC on the schedule's start date and frozen. A recurring
//! job therefore keeps a stable UTC fire time across DST transitions,
//! which shifts its local wall-clock by the DST offset.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::config::TimezoneSettings;
use crate::types::{Frequency, PlannerError, Schedule, ScheduleRequest};

/// Day-of-week names in `days_of_week` index order (0 = Sunday).
const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Plans job fire times. Construct once from the timezone policy and share.
#[derive(Debug, Clone)]
pub struct TimePlanner {
    settings: TimezoneSettings,
}

impl TimePlanner {
    pub fn new(settings: TimezoneSettings) -> Self {
        Self { settings }
    }

    /// Parse and policy-check an IANA zone name.
    pub fn validate_timezone(&self, name: &str) -> Result<Tz, PlannerError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| PlannerError::InvalidTimezone(name.to_string()))?;
        if !self.settings.allowed.is_empty()
            && !self.settings.allowed.iter().any(|allowed| allowed == name)
        {
            return Err(PlannerError::InvalidTimezone(format!(
                "{name} is not in the allowed zone list"
            )));
        }
        Ok(tz)
    }

    /// Check a schedule request for completeness and consistency.
    pub fn validate_schedule(
        &self,
        request: &ScheduleRequest,
        timezone: &str,
    ) -> Result<(), PlannerError> {
        let tz = self.validate_timezone(timezone)?;
        match request {
            ScheduleRequest::Once { date, time } => {
                let (hour, minute) = parse_time(time)?;
                local_instant(tz, *date, hour, minute)?;
                Ok(())
            }
            ScheduleRequest::Recurring {
                frequency,
                time,
                start_date,
                end_date,
                days_of_week,
                day_of_month,
            } => {
                let (hour, minute) = parse_time(time)?;
                local_instant(tz, *start_date, hour, minute)?;
                if let Some(end) = end_date {
                    if end <= start_date {
                        return Err(PlannerError::OutOfRange(format!(
                            "end_date {end} must be after start_date {start_date}"
                        )));
                    }
                }
                match frequency {
                    Frequency::Weekly => {
                        if days_of_week.is_empty() {
                            return Err(PlannerError::MissingField("days_of_week"));
                        }
                        if let Some(day) = days_of_week.iter().find(|d| **d > 6) {
                            return Err(PlannerError::OutOfRange(format!(
                                "day_of_week {day} must be within 0..=6"
                            )));
                        }
                    }
                    Frequency::Monthly => {
                        let day = day_of_month.unwrap_or(1);
                        if !(1..=31).contains(&day) {
                            return Err(PlannerError::OutOfRange(format!(
                                "day_of_month {day} must be within 1..=31"
                            )));
                        }
                    }
                    Frequency::Daily => {}
                }
                Ok(())
            }
        }
    }

    /// Resolve a request into a stored `Schedule` (cron snapshot included
    /// for recurring jobs).
    pub fn resolve_schedule(
        &self,
        request: &ScheduleRequest,
        timezone: &str,
    ) -> Result<Schedule, PlannerError> {
        self.validate_schedule(request, timezone)?;
        let tz = self.validate_timezone(timezone)?;
        match request {
            ScheduleRequest::Once { date, time } => {
                let (hour, minute) = parse_time(time)?;
                let instant = local_instant(tz, *date, hour, minute)?;
                Ok(Schedule::Once {
                    date_time: instant.with_timezone(&Utc),
                })
            }
            ScheduleRequest::Recurring {
                frequency,
                time,
                start_date,
                end_date,
                days_of_week,
                day_of_month,
            } => {
                let cron_expression = self.build_cron_expression(request, timezone)?;
                Ok(Schedule::Recurring {
                    frequency: *frequency,
                    time: time.clone(),
                    start_date: *start_date,
                    end_date: *end_date,
                    days_of_week: days_of_week.clone(),
                    day_of_month: match frequency {
                        Frequency::Monthly => Some(day_of_month.unwrap_or(1)),
                        _ => *day_of_month,
                    },
                    cron_expression,
                })
            }
        }
    }

    /// First fire time for a freshly planned schedule.
    ///
    /// One-time schedules must be strictly in the future. Recurring
    /// schedules yield the next cron occurrence at or after `now`, but
    /// never before the start date.
    pub fn plan_first_fire(
        &self,
        schedule: &Schedule,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PlannerError> {
        let tz = self.validate_timezone(timezone)?;
        match schedule {
            Schedule::Once { date_time } => {
                if *date_time <= now {
                    return Err(PlannerError::PastSchedule(date_time.to_rfc3339()));
                }
                Ok(*date_time)
            }
            Schedule::Recurring {
                start_date,
                end_date,
                cron_expression,
                ..
            } => {
                let start_bound = local_instant(tz, *start_date, 0, 0)?.with_timezone(&Utc);
                // `after` is exclusive; back off one second for "at or after".
                let from = now.max(start_bound) - chrono::Duration::seconds(1);
                self.next_fire(cron_expression, from, *end_date, timezone)
            }
        }
    }

    /// Synthesize the 5-field UTC cron expression for a recurring request.
    pub fn build_cron_expression(
        &self,
        request: &ScheduleRequest,
        timezone: &str,
    ) -> Result<String, PlannerError> {
        let tz = self.validate_timezone(timezone)?;
        let ScheduleRequest::Recurring {
            frequency,
            time,
            start_date,
            days_of_week,
            day_of_month,
            ..
        } = request
        else {
            return Err(PlannerError::MissingField("recurring schedule"));
        };

        let (hour, minute) = parse_time(time)?;
        // Convert the local wall-clock on the start date to UTC; day fields
        // are filled from the local spec and not shifted across the UTC
        // midnight boundary.
        let local = local_instant(tz, *start_date, hour, minute)?;
        let utc = local.with_timezone(&Utc);
        let (utc_minute, utc_hour) = (utc.minute(), utc.hour());

        let expression = match frequency {
            Frequency::Daily => format!("{utc_minute} {utc_hour} * * *"),
            Frequency::Weekly => {
                let mut days: Vec<u8> = days_of_week.clone();
                days.sort_unstable();
                days.dedup();
                if days.is_empty() {
                    return Err(PlannerError::MissingField("days_of_week"));
                }
                let names: Vec<&str> = days
                    .iter()
                    .map(|d| {
                        DOW_NAMES
                            .get(*d as usize)
                            .copied()
                            .ok_or_else(|| {
                                PlannerError::OutOfRange(format!(
                                    "day_of_week {d} must be within 0..=6"
                                ))
                            })
                    })
                    .collect::<Result<_, _>>()?;
                format!("{utc_minute} {utc_hour} * * {}", names.join(","))
            }
            Frequency::Monthly => {
                let day = day_of_month.unwrap_or(1);
                if !(1..=31).contains(&day) {
                    return Err(PlannerError::OutOfRange(format!(
                        "day_of_month {day} must be within 1..=31"
                    )));
                }
                format!("{utc_minute} {utc_hour} {day} * *")
            }
        };

        // Sanity-check the synthesized expression parses.
        parse_cron(&expression)?;
        Ok(expression)
    }

    /// Smallest cron occurrence strictly after `from`, bounded by the
    /// schedule end date (inclusive to 23:59:59 in the user zone).
    pub fn next_fire(
        &self,
        cron_expression: &str,
        from: DateTime<Utc>,
        end_date: Option<NaiveDate>,
        timezone: &str,
    ) -> Result<DateTime<Utc>, PlannerError> {
        let schedule = parse_cron(cron_expression)?;
        let occurrence = schedule
            .after(&from)
            .next()
            .ok_or(PlannerError::EndDateExceeded)?;
        if let Some(bound) = self.end_bound(end_date, timezone)? {
            if occurrence > bound {
                return Err(PlannerError::EndDateExceeded);
            }
        }
        Ok(occurrence)
    }

    /// Up to `n` occurrences strictly after `from`, stopping early at the
    /// end date.
    pub fn next_n_fires(
        &self,
        cron_expression: &str,
        n: usize,
        from: DateTime<Utc>,
        end_date: Option<NaiveDate>,
        timezone: &str,
    ) -> Result<Vec<DateTime<Utc>>, PlannerError> {
        let schedule = parse_cron(cron_expression)?;
        let bound = self.end_bound(end_date, timezone)?;
        let mut fires = Vec::with_capacity(n);
        for occurrence in schedule.after(&from) {
            if fires.len() >= n {
                break;
            }
            if let Some(bound) = bound {
                if occurrence > bound {
                    break;
                }
            }
            fires.push(occurrence);
        }
        Ok(fires)
    }

    /// UTC instant of a schedule's local-midnight start.
    pub fn day_start_utc(
        &self,
        date: NaiveDate,
        timezone: &str,
    ) -> Result<DateTime<Utc>, PlannerError> {
        let tz = self.validate_timezone(timezone)?;
        Ok(local_instant(tz, date, 0, 0)?.with_timezone(&Utc))
    }

    /// UTC instant of the schedule window's end: 23:59:59 on the end date
    /// in the user zone.
    pub fn end_bound(
        &self,
        end_date: Option<NaiveDate>,
        timezone: &str,
    ) -> Result<Option<DateTime<Utc>>, PlannerError> {
        let Some(end) = end_date else {
            return Ok(None);
        };
        let tz = self.validate_timezone(timezone)?;
        let bound = local_end_of_day(tz, end)?;
        Ok(Some(bound.with_timezone(&Utc)))
    }
}

/// Parse a 5-field cron expression. The `cron` crate requires a leading
/// seconds field, so one is prepended here; stored expressions stay
/// 5-field.
pub fn parse_cron(expression: &str) -> Result<CronSchedule, PlannerError> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(PlannerError::InvalidCron(format!(
            "{expression}: expected 5 fields (min hour dom mon dow), got {fields}"
        )));
    }
    CronSchedule::from_str(&format!("0 {expression}"))
        .map_err(|e| PlannerError::InvalidCron(format!("{expression}: {e}")))
}

fn parse_time(time: &str) -> Result<(u32, u32), PlannerError> {
    let (hour, minute) = time
        .split_once(':')
        .ok_or_else(|| PlannerError::InvalidTime(time.to_string()))?;
    let hour: u32 = hour
        .parse()
        .map_err(|_| PlannerError::InvalidTime(time.to_string()))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| PlannerError::InvalidTime(time.to_string()))?;
    if hour > 23 || minute > 59 {
        return Err(PlannerError::InvalidTime(time.to_string()));
    }
    Ok((hour, minute))
}

fn local_instant(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Tz>, PlannerError> {
    tz.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
        .earliest()
        .ok_or_else(|| {
            PlannerError::InvalidTime(format!(
                "{date} {hour:02}:{minute:02} does not exist in {tz}"
            ))
        })
}

fn local_end_of_day(tz: Tz, date: NaiveDate) -> Result<DateTime<Tz>, PlannerError> {
    tz.with_ymd_and_hms(date.year(), date.month(), date.day(), 23, 59, 59)
        .latest()
        .ok_or_else(|| {
            PlannerError::InvalidTime(format!("{date} 23:59:59 does not exist in {tz}"))
        })
}
