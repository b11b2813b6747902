use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use ulid::Ulid;

use lessond::engine::{Engine, EngineSettings, NewBooking, NewOverride, now_ms};
use lessond::model::{Caller, CivilTime, Role, Span};
use lessond::notify::NotifyHub;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAYS_OPEN: u64 = 100;

fn engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("lessond_bench");
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    Arc::new(
        Engine::new(path, Arc::new(NotifyHub::new()), EngineSettings::default())
            .expect("open engine"),
    )
}

fn first_day() -> NaiveDate {
    Utc::now().date_naive() + Days::new(30)
}

fn hour_start(day_offset: u64, hour: u32) -> i64 {
    (first_day() + Days::new(day_offset))
        .and_hms_opt(hour, 0, 0)
        .expect("valid hour")
        .and_utc()
        .timestamp_millis()
}

/// An instructor bookable around the clock for `DAYS_OPEN` days.
async fn open_instructor(engine: &Engine) -> Caller {
    let tutor = Caller::new(Ulid::new(), Role::Instructor);
    for offset in 0..DAYS_OPEN {
        engine
            .add_override(
                &tutor,
                NewOverride {
                    instructor_id: tutor.id,
                    date: first_day() + Days::new(offset),
                    start: Some(CivilTime::hm(0, 0)),
                    end: Some(CivilTime::hm(24, 0)),
                    is_available: true,
                    reason: None,
                    slot_minutes: 60,
                },
            )
            .await
            .expect("open day");
    }
    tutor
}

fn hourly(instructor_id: Ulid, i: u64) -> NewBooking {
    let start = hour_start(i / 24, (i % 24) as u32);
    NewBooking {
        instructor_id,
        span: Span::new(start, start + HOUR),
        notes: None,
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential() {
    let engine = engine("sequential");
    let tutor = open_instructor(&engine).await;
    let student = Caller::new(Ulid::new(), Role::Member);

    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        engine
            .create_booking(&student, hourly(tutor.id, i), now_ms())
            .await
            .expect("free slot");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

/// Many members race for the same slots; exactly one request per slot may win.
async fn phase2_contention() {
    let engine = engine("contention");
    let tutor = open_instructor(&engine).await;
    let n_members = 20;
    let n_slots = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_members {
        let engine = engine.clone();
        let (won, lost) = (won.clone(), lost.clone());
        let tutor_id = tutor.id;
        handles.push(tokio::spawn(async move {
            let member = Caller::new(Ulid::new(), Role::Member);
            for i in 0..n_slots {
                match engine.create_booking(&member, hourly(tutor_id, i), now_ms()).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("member task");
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_members} members x {n_slots} slots: {won} won, {lost} refused in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won as u64, n_slots, "every slot booked exactly once");
}

async fn phase3_slots_under_load() {
    let engine = engine("read_under_load");
    let reader_tutor = open_instructor(&engine).await;
    let member = Caller::new(Ulid::new(), Role::Member);
    for i in (0..200).step_by(3) {
        engine
            .create_booking(&member, hourly(reader_tutor.id, i), now_ms())
            .await
            .expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let tutor = open_instructor(&engine).await;
            let member = Caller::new(Ulid::new(), Role::Member);
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) && i < DAYS_OPEN * 24 {
                let _ = engine.create_booking(&member, hourly(tutor.id, i), now_ms()).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        let tutor_id = reader_tutor.id;
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            let first = first_day();
            let last = first + Days::new(13);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let _ = engine.available_slots(&tutor_id, first, last, now_ms()).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("reader task"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("two-week slot query", &mut all);
}

#[tokio::main]
async fn main() {
    println!("=== lessond stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] contention for the same slots");
    phase2_contention().await;

    println!("\n[phase 3] slot query latency under write load");
    phase3_slots_under_load().await;

    println!("\n=== benchmark complete ===");
}
