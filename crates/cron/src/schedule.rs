//! Next-run computation for every schedule kind.

use std::{fmt, str::FromStr, time::Duration};

use {
    chrono::{DateTime, TimeDelta, Utc},
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result, parse::parse_duration};

/// When a job fires.
///
/// A schedule maps the previous fire time to the next one. `None` as input
/// means "never fired", `None` as output means "nothing further scheduled".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Cron expression with 5, 6, or 7 fields, evaluated in `tz` (UTC if unset).
    Cron {
        expr: String,
        tz: Option<Tz>,
        parsed: Box<cron::Schedule>,
    },
    /// Fixed interval measured from the previous fire time.
    Every { every: Duration, step: TimeDelta },
    /// Fires once, as soon as the scheduler starts.
    Immediately,
    /// Never fires on its own; runs only when triggered.
    #[default]
    OnDemand,
}

impl Schedule {
    /// Parse a schedule string.
    ///
    /// Accepts an empty string or `@on-demand` / `@never` for on-demand jobs,
    /// `@immediately`, `@every <duration>`, the `@hourly`-style shorthands, and
    /// plain cron expressions. A trailing ` TZ=<zone>` selects a timezone.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some((expr, tz)) = input.rsplit_once(" TZ=") {
            return Self::parse_with_tz(expr, Some(tz));
        }
        Self::parse_with_tz(input, None)
    }

    /// Parse a schedule string evaluated in the named IANA timezone.
    pub fn parse_with_tz(input: &str, tz: Option<&str>) -> Result<Self> {
        let input = input.trim();
        let tz = tz
            .map(|name| {
                name.trim()
                    .parse::<Tz>()
                    .map_err(|_| Error::unknown_timezone(name))
            })
            .transpose()?;

        match input {
            "" | "@on-demand" | "@never" | "@manual" => return Ok(Self::OnDemand),
            "@immediately" => return Ok(Self::Immediately),
            _ => {},
        }

        if let Some(every) = input.strip_prefix("@every") {
            let every = parse_duration(every)?;
            if every.is_zero() {
                return Err(Error::invalid_schedule(input, "interval must be > 0"));
            }
            let step = TimeDelta::from_std(every)
                .map_err(|_| Error::invalid_schedule(input, "interval out of range"))?;
            return Ok(Self::Every { every, step });
        }

        let expanded = match input {
            "@yearly" | "@annually" => "0 0 0 1 1 * *",
            "@monthly" => "0 0 0 1 * * *",
            "@weekly" => "0 0 0 * * Sun *",
            "@daily" | "@midnight" => "0 0 0 * * * *",
            "@hourly" => "0 0 * * * * *",
            other => other,
        };

        let parsed = expanded
            .parse::<cron::Schedule>()
            .or_else(|_| {
                // The `cron` crate wants seconds (and optionally a year).
                // Five-field expressions get "0" seconds and a "*" year.
                format!("0 {expanded} *").parse::<cron::Schedule>()
            })
            .map_err(|source| Error::CronParse {
                expr: input.to_string(),
                source,
            })?;

        Ok(Self::Cron {
            expr: input.to_string(),
            tz,
            parsed: Box::new(parsed),
        })
    }

    /// Shorthand for an interval schedule.
    pub fn every(every: Duration) -> Result<Self> {
        Self::parse(&format!("@every {}", crate::parse::format_duration(every)))
    }

    /// The next fire time after `previous`, relative to the current clock.
    #[must_use]
    pub fn next(&self, previous: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        self.next_at(previous, Utc::now())
    }

    /// The next fire time after `previous`, with `now` standing in for the
    /// reference time when there is no previous run.
    ///
    /// Whenever the result is `Some(next)` and `previous` is `Some(t)`,
    /// `next > t`.
    #[must_use]
    pub fn next_at(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { tz, parsed, .. } => {
                let from = previous.unwrap_or(now);
                match tz {
                    Some(tz) => parsed
                        .after(&from.with_timezone(tz))
                        .next()
                        .map(|dt| dt.with_timezone(&Utc)),
                    None => parsed.after(&from).next(),
                }
            },
            Self::Every { step, .. } => {
                let next = previous.unwrap_or(now).checked_add_signed(*step)?;
                // Intervals missed during a stall are skipped, not replayed.
                if next > now {
                    Some(next)
                } else {
                    now.checked_add_signed(*step)
                }
            },
            Self::Immediately => match previous {
                None => Some(now),
                Some(_) => None,
            },
            Self::OnDemand => None,
        }
    }

    /// Whether the schedule never fires on its own.
    #[must_use]
    pub fn is_on_demand(&self) -> bool {
        matches!(self, Self::OnDemand)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron { expr, tz: None, .. } => f.write_str(expr),
            Self::Cron {
                expr, tz: Some(tz), ..
            } => write!(f, "{expr} TZ={tz}"),
            Self::Every { every, .. } => {
                write!(f, "@every {}", crate::parse::format_duration(*every))
            },
            Self::Immediately => f.write_str("@immediately"),
            Self::OnDemand => f.write_str("@on-demand"),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        value.to_string()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone, rstest::rstest};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn cron_five_field() {
        let s = Schedule::parse("0 9 * * *").unwrap();
        let now = at(2024, 2, 1, 0, 0, 0);
        let next = s.next_at(None, now).unwrap();
        assert_eq!(next, at(2024, 2, 1, 9, 0, 0));
    }

    #[test]
    fn cron_with_timezone() {
        let s = Schedule::parse("0 9 * * * TZ=Europe/Paris").unwrap();
        let now = at(2024, 2, 1, 0, 0, 0);
        // 9:00 Paris is 08:00 UTC in winter.
        assert_eq!(s.next_at(None, now).unwrap(), at(2024, 2, 1, 8, 0, 0));
        assert_eq!(s.to_string(), "0 9 * * * TZ=Europe/Paris");
    }

    #[test]
    fn cron_follows_previous_not_clock() {
        let s = Schedule::parse("*/15 * * * *").unwrap();
        let prev = at(2024, 2, 1, 10, 15, 0);
        let now = at(2030, 1, 1, 0, 0, 0);
        assert_eq!(s.next_at(Some(prev), now).unwrap(), at(2024, 2, 1, 10, 30, 0));
    }

    #[test]
    fn every_uses_previous_or_now() {
        let s = Schedule::parse("@every 1s").unwrap();
        let now = at(2024, 2, 1, 0, 0, 0);
        assert_eq!(s.next_at(None, now).unwrap(), at(2024, 2, 1, 0, 0, 1));
        let prev = at(2024, 2, 1, 0, 0, 10);
        assert_eq!(s.next_at(Some(prev), now).unwrap(), at(2024, 2, 1, 0, 0, 11));
    }

    #[test]
    fn every_skips_intervals_missed_while_stalled() {
        let s = Schedule::parse("@every 1m").unwrap();
        let scheduled = at(2024, 2, 1, 0, 0, 0);

        // Woke shortly after the fire time: keep the phase.
        let woke = at(2024, 2, 1, 0, 0, 2);
        assert_eq!(s.next_at(Some(scheduled), woke).unwrap(), at(2024, 2, 1, 0, 1, 0));

        // Woke an hour late: one run from now, not sixty back to back.
        let woke = at(2024, 2, 1, 1, 0, 5);
        assert_eq!(s.next_at(Some(scheduled), woke).unwrap(), at(2024, 2, 1, 1, 1, 5));
    }

    #[test]
    fn immediately_fires_once() {
        let s = Schedule::parse("@immediately").unwrap();
        let now = at(2024, 2, 1, 0, 0, 0);
        assert_eq!(s.next_at(None, now), Some(now));
        assert_eq!(s.next_at(Some(now), now), None);
    }

    #[rstest]
    #[case("")]
    #[case("@on-demand")]
    #[case("@never")]
    fn on_demand_never_fires(#[case] input: &str) {
        let s = Schedule::parse(input).unwrap();
        assert!(s.is_on_demand());
        assert_eq!(s.next(None), None);
        assert_eq!(s.next(Some(Utc::now())), None);
    }

    #[rstest]
    #[case("@hourly")]
    #[case("@daily")]
    #[case("@weekly")]
    #[case("@monthly")]
    #[case("@yearly")]
    #[case("*/5 * * * *")]
    #[case("30 */2 * * * *")]
    #[case("@every 90s")]
    #[case("@every 1h30m")]
    fn next_is_strictly_after_previous(#[case] input: &str) {
        let s = Schedule::parse(input).unwrap();
        let mut t = at(2024, 12, 31, 23, 59, 59);
        for _ in 0..20 {
            let next = s.next_at(Some(t), t).unwrap();
            assert!(next > t, "{input}: {next} <= {t}");
            t = next;
        }
    }

    #[rstest]
    #[case("not valid")]
    #[case("@every")]
    #[case("@every 0")]
    #[case("@every 5x")]
    #[case("0 9 * * * TZ=Mars/Olympus")]
    fn rejects_invalid(#[case] input: &str) {
        assert!(Schedule::parse(input).is_err());
    }

    #[test]
    fn serde_uses_the_schedule_string() {
        let s = Schedule::every(Duration::from_secs(90)).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"@every 1m30s\"");
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), "@every 1m30s");
    }
}
