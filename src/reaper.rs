use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};

/// Background task that periodically expires stale pending requests.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.expire_stale_bookings(now_ms()).await {
            Ok(0) => debug!("sweep found nothing to expire"),
            Ok(n) => info!(expired = n, "sweep expired pending bookings"),
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "journal compacted"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineSettings, NewBooking, NewOverride};
    use crate::limits::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Arc<Engine> {
        Arc::new(
            Engine::new(
                test_wal_path(name),
                Arc::new(NotifyHub::new()),
                EngineSettings::default(),
            )
            .unwrap(),
        )
    }

    /// A pending request made five hours ago for a lesson a month out.
    async fn stale_request(engine: &Engine) -> Booking {
        let tutor = Caller::new(Ulid::new(), Role::Instructor);
        let day = chrono::Utc::now().date_naive() + chrono::Days::new(30);
        engine
            .add_override(
                &tutor,
                NewOverride {
                    instructor_id: tutor.id,
                    date: day,
                    start: Some(CivilTime::hm(10, 0)),
                    end: Some(CivilTime::hm(11, 0)),
                    is_available: true,
                    reason: None,
                    slot_minutes: 60,
                },
            )
            .await
            .unwrap();
        let start = day
            .and_hms_opt(10, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        engine
            .create_booking(
                &Caller::new(Ulid::new(), Role::Member),
                NewBooking {
                    instructor_id: tutor.id,
                    span: Span::new(start, start + HOUR_MS),
                    notes: None,
                },
                now_ms() - 5 * HOUR_MS,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweeper_expires_stale_requests() {
        let engine = engine("sweeper.wal");
        let booking = stale_request(&engine).await;
        let student = Caller::new(booking.member_id, Role::Member);

        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let stored = engine.get_booking(&student, &booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Expired);
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let engine = engine("compactor.wal");
        stale_request(&engine).await;
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        let idle = tokio::spawn(run_compactor(engine.clone(), 100, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        idle.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        let busy = tokio::spawn(run_compactor(engine.clone(), 2, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        busy.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
