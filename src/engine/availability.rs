use chrono::{NaiveDate, TimeDelta, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::model::*;

use super::EngineError;

// ── Slot generation ───────────────────────────────────────────────
//
// Per date: overrides replace the weekly windows (available overrides supply
// their own hours, an all-day block empties the date, a windowed block punches
// a hole). Each effective window is cut into back-to-back slots of its slot
// length, then slots touching active bookings or already over are dropped.

/// A civil window in effect on one date, in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: u16,
    pub end: u16,
    pub slot_minutes: u16,
}

impl DayWindow {
    fn as_span(&self) -> Span {
        Span::new(self.start as Ms, self.end as Ms)
    }
}

/// Windows the instructor offers on `date`, sorted by start.
pub fn effective_windows(cal: &InstructorCalendar, date: NaiveDate) -> Vec<DayWindow> {
    let overrides = cal.overrides_on(date);

    let weekly = || {
        cal.windows
            .iter()
            .filter(|w| w.applies_on(date))
            .map(|w| DayWindow {
                start: w.start.minutes(),
                end: w.end.minutes(),
                slot_minutes: w.slot_minutes,
            })
            .collect::<Vec<_>>()
    };

    if overrides.is_empty() {
        return weekly();
    }
    if overrides.iter().any(|o| o.is_all_day_block()) {
        return Vec::new();
    }

    let extra: Vec<DayWindow> = overrides
        .iter()
        .filter(|o| o.is_available)
        .filter_map(|o| {
            o.window().map(|(start, end)| DayWindow {
                start: start.minutes(),
                end: end.minutes(),
                slot_minutes: o.slot_minutes,
            })
        })
        .collect();
    let mut base = if extra.is_empty() { weekly() } else { extra };
    base.sort_by_key(|w| w.start);

    let mut blocked: Vec<Span> = overrides
        .iter()
        .filter(|o| !o.is_available)
        .filter_map(|o| o.window())
        .filter(|(start, end)| start < end)
        .map(|(start, end)| Span::new(start.minutes() as Ms, end.minutes() as Ms))
        .collect();
    if blocked.is_empty() {
        return base;
    }
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);

    let mut out = Vec::new();
    for w in base {
        for piece in subtract_intervals(&[w.as_span()], &blocked) {
            out.push(DayWindow {
                start: piece.start as u16,
                end: piece.end as u16,
                slot_minutes: w.slot_minutes,
            });
        }
    }
    out
}

/// Resolve a civil date + minutes-since-midnight in `tz`. `None` inside a DST gap;
/// the earlier instant when the wall clock repeats.
pub fn local_instant(tz: Tz, date: NaiveDate, minutes: u16) -> Option<Ms> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    let local = midnight.checked_add_signed(TimeDelta::minutes(minutes as i64))?;
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Where an instant range sits on the studio's wall clock:
/// `(day_of_week, start_minute, end_minute)` relative to the local start date.
/// `end_minute` may pass 1440 when the range runs past midnight.
pub fn local_placement(tz: Tz, span: &Span) -> Option<(u8, u32, u32)> {
    let start = tz.timestamp_millis_opt(span.start).single()?;
    let date = start.date_naive();
    // The wall clock, not elapsed time since midnight: the two differ on DST days.
    let start_min = start.hour() * 60 + start.minute();
    let end_min = start_min + (span.duration_ms() / 60_000) as u32;
    Some((day_of_week(date), start_min, end_min))
}

/// Instant spans of the effective windows on `date`.
fn window_spans(cal: &InstructorCalendar, tz: Tz, date: NaiveDate) -> Vec<(DayWindow, Span)> {
    effective_windows(cal, date)
        .into_iter()
        .filter_map(|w| {
            let start = local_instant(tz, date, w.start)?;
            let end = local_instant(tz, date, w.end)?;
            (start < end).then(|| (w, Span::new(start, end)))
        })
        .collect()
}

/// Lazy, restartable slot sequence for one instructor over an inclusive date range.
pub struct SlotGenerator<'a> {
    calendar: &'a InstructorCalendar,
    tz: Tz,
    first: NaiveDate,
    last: NaiveDate,
    now: Ms,
}

impl<'a> SlotGenerator<'a> {
    pub fn new(
        calendar: &'a InstructorCalendar,
        tz: Tz,
        first: NaiveDate,
        last: NaiveDate,
        now: Ms,
    ) -> Self {
        Self {
            calendar,
            tz,
            first,
            last,
            now,
        }
    }

    /// Ascending by `slot_start`. Each call starts over from the first date.
    pub fn iter(&self) -> impl Iterator<Item = TimeSlot> + '_ {
        let last = self.last;
        self.first
            .iter_days()
            .take_while(move |d| *d <= last)
            .flat_map(move |date| self.slots_on(date))
    }

    pub fn slots_on(&self, date: NaiveDate) -> Vec<TimeSlot> {
        let mut slots = Vec::new();
        for window in effective_windows(self.calendar, date) {
            let step = window.slot_minutes.max(1);
            let mut cursor = window.start;
            while cursor + step <= window.end {
                let next = cursor + step;
                if let (Some(slot_start), Some(slot_end)) = (
                    local_instant(self.tz, date, cursor),
                    local_instant(self.tz, date, next),
                ) && slot_start < slot_end
                {
                    slots.push(TimeSlot { slot_start, slot_end });
                }
                cursor = next;
            }
        }
        slots.retain(|s| {
            s.slot_end > self.now
                && self
                    .calendar
                    .active_overlapping(&s.span())
                    .next()
                    .is_none()
        });
        slots.sort_by_key(|s| (s.slot_start, s.slot_end));
        slots.dedup();
        slots
    }
}

/// A request is bookable when it sits inside one effective window of its local
/// date and is not already over. Active-booking overlap is checked separately.
pub fn check_within_availability(
    cal: &InstructorCalendar,
    tz: Tz,
    span: &Span,
    now: Ms,
) -> Result<(), EngineError> {
    if span.end <= now {
        return Err(EngineError::SlotUnavailable);
    }
    let date = tz
        .timestamp_millis_opt(span.start)
        .single()
        .ok_or(EngineError::SlotUnavailable)?
        .date_naive();
    let covered = window_spans(cal, tz, date)
        .iter()
        .any(|(_, window)| window.contains_span(span));
    if covered {
        Ok(())
    } else {
        Err(EngineError::SlotUnavailable)
    }
}

// ── Interval helpers ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
