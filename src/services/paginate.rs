use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::SensorDataPoint;

/// Pagination state threaded between page fetches. `end` is the boundary
/// consumed so far: the oldest timestamp when walking backward, the newest
/// when walking forward. Boundaries are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CursorInfo {
    pub end: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
pub struct CursorPlan {
    pub direction: Direction,
    pub origin: i64,
    /// Inclusive far bound for forward walks (range queries).
    pub stop_at: Option<i64>,
    pub limit: usize,
    pub max_pages: usize,
    pub sensors: Vec<String>,
    pub target_per_sensor: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: CursorInfo,
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    Satisfied,
    Exhausted,
    ReachedBound,
    PageCap,
}

#[derive(Debug)]
pub struct CursorOutcome {
    pub rows: Vec<SensorDataPoint>,
    pub pages: usize,
    pub end: WalkEnd,
}

impl CursorPlan {
    fn in_bounds(&self, time: i64) -> bool {
        match self.direction {
            Direction::Backward => time <= self.origin,
            Direction::Forward => {
                time >= self.origin && self.stop_at.map_or(true, |stop| time <= stop)
            }
        }
    }

    fn advance(&self, boundary: Option<i64>, time: i64) -> Option<i64> {
        Some(match (self.direction, boundary) {
            (_, None) => time,
            (Direction::Backward, Some(current)) => current.min(time),
            (Direction::Forward, Some(current)) => current.max(time),
        })
    }
}

/// Cap on how far a page request may widen, as a multiple of `plan.limit`.
const MAX_WIDEN_FACTOR: usize = 64;

/// Walks an end/limit cursor in the plan's direction, accumulating rows until
/// every sensor has `target_per_sensor` points or the backend runs dry.
///
/// Boundaries are inclusive, so a full page whose rows all sit on the cursor
/// timestamp cannot move the cursor. The walk then re-requests the same
/// boundary with a doubled limit; past `MAX_WIDEN_FACTOR` it fails with
/// `Error::Incomplete`.
///
/// A fetch error aborts the walk; rows gathered so far are dropped.
pub async fn walk_cursor<F, Fut>(
    plan: &CursorPlan,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<CursorOutcome>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Vec<SensorDataPoint>>>,
{
    let base_limit = plan.limit.max(1);
    let widen_cap = base_limit.saturating_mul(MAX_WIDEN_FACTOR);
    let requested: HashSet<&str> = plan.sensors.iter().map(String::as_str).collect();
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<SensorDataPoint> = Vec::new();
    let mut cursor = CursorInfo {
        end: Some(plan.origin),
        limit: Some(base_limit),
    };
    let mut pending: Vec<String> = plan.sensors.clone();
    let mut pages = 0usize;

    while pages < plan.max_pages {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let limit = cursor.limit.unwrap_or(base_limit);
        let page = fetch(PageRequest {
            cursor,
            sensors: pending.clone(),
        })
        .await?;
        pages += 1;

        if page.is_empty() {
            return Ok(finish(rows, pages, WalkEnd::Exhausted));
        }

        let page_len = page.len();
        let mut fresh = 0usize;
        let mut boundary: Option<i64> = None;
        for point in page {
            boundary = plan.advance(boundary, point.time);
            if !plan.in_bounds(point.time) {
                continue;
            }
            if !requested.is_empty() && !requested.contains(point.sensor.as_str()) {
                continue;
            }
            if seen.insert((point.time, point.sensor.clone())) {
                fresh += 1;
                *counts.entry(point.sensor.clone()).or_default() += 1;
                rows.push(point);
            }
        }
        tracing::debug!(page = pages, rows = page_len, fresh, limit, "fetched cursor page");

        if let Some(target) = plan.target_per_sensor {
            pending.retain(|sensor| counts.get(sensor).copied().unwrap_or(0) < target);
            if pending.is_empty() {
                return Ok(finish(rows, pages, WalkEnd::Satisfied));
            }
        }
        if page_len < limit {
            return Ok(finish(rows, pages, WalkEnd::Exhausted));
        }
        if fresh == 0 || boundary == cursor.end {
            if limit >= widen_cap {
                return Err(Error::Incomplete(format!(
                    "cursor stuck at {:?} with {page_len} rows per page (limit {limit})",
                    cursor.end
                )));
            }
            let widened = limit.saturating_mul(2).min(widen_cap);
            tracing::warn!(
                page = pages,
                cursor_end = ?cursor.end,
                limit = widened,
                "cursor did not advance; widening page"
            );
            cursor.limit = Some(widened);
            continue;
        }
        if let (Direction::Forward, Some(stop), Some(edge)) =
            (plan.direction, plan.stop_at, boundary)
        {
            if edge > stop {
                return Ok(finish(rows, pages, WalkEnd::ReachedBound));
            }
        }
        cursor = CursorInfo {
            end: boundary,
            limit: Some(base_limit),
        };
    }

    tracing::warn!(
        max_pages = plan.max_pages,
        rows = rows.len(),
        "pagination hit the page cap; returning accumulated rows"
    );
    Ok(finish(rows, pages, WalkEnd::PageCap))
}

fn finish(rows: Vec<SensorDataPoint>, pages: usize, end: WalkEnd) -> CursorOutcome {
    CursorOutcome { rows, pages, end }
}

/// Orders rows in walk direction (ties by `sensor_order`) and keeps the first
/// `n` per sensor.
pub fn take_per_sensor(
    mut rows: Vec<SensorDataPoint>,
    n: usize,
    direction: Direction,
    sensor_order: &[String],
) -> Vec<SensorDataPoint> {
    let rank: HashMap<&str, usize> = sensor_order
        .iter()
        .enumerate()
        .map(|(idx, sensor)| (sensor.as_str(), idx))
        .collect();
    rows.sort_by(|a, b| {
        let by_time = match direction {
            Direction::Forward => a.time.cmp(&b.time),
            Direction::Backward => b.time.cmp(&a.time),
        };
        by_time.then_with(|| {
            let ra = rank.get(a.sensor.as_str()).copied().unwrap_or(usize::MAX);
            let rb = rank.get(b.sensor.as_str()).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb).then_with(|| a.sensor.cmp(&b.sensor))
        })
    });

    let mut taken: HashMap<String, usize> = HashMap::new();
    rows.into_iter()
        .filter(|row| {
            let count = taken.entry(row.sensor.clone()).or_default();
            if *count < n {
                *count += 1;
                true
            } else {
                false
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPage {
    /// 1-based page number.
    pub page: usize,
    pub count: usize,
}

impl OffsetPage {
    pub fn skip(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.count)
    }
}

/// Page/count pagination: stops on the first empty page, otherwise advances
/// to the next page, up to `max_pages`.
pub async fn walk_offset<T, F, Fut>(
    page_size: usize,
    max_pages: usize,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<Vec<T>>
where
    F: FnMut(OffsetPage) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let count = page_size.max(1);
    let mut items = Vec::new();
    for page in 1..=max_pages {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch = fetch(OffsetPage { page, count }).await?;
        if batch.is_empty() {
            return Ok(items);
        }
        tracing::debug!(page, items = batch.len(), "fetched offset page");
        items.extend(batch);
    }
    tracing::warn!(
        max_pages,
        items = items.len(),
        "offset pagination hit the page cap; returning accumulated items"
    );
    Ok(items)
}
