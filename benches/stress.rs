use std::sync::Arc;
use std::time::{Duration, Instant};

use campusd::audit::AuditHub;
use campusd::catalog::{FacilityInfo, FacilityKind, FacilityRegistry};
use campusd::engine::Ledger;
use campusd::identity::Principal;
use campusd::model::Slot;
use chrono::{Local, NaiveDate, NaiveTime};
use ulid::Ulid;

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn open_ledger(name: &str, facilities: &[Ulid]) -> Arc<Ledger> {
    let dir = std::env::temp_dir().join("campusd_bench");
    std::fs::create_dir_all(&dir).expect("bench dir");
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let catalog = FacilityRegistry::from_facilities(
        facilities
            .iter()
            .enumerate()
            .map(|(i, id)| FacilityInfo {
                id: *id,
                name: format!("Room {i}"),
                kind: FacilityKind::Hall,
                capacity: 30,
                active: true,
            })
            .collect(),
    )
    .expect("catalog");
    Arc::new(Ledger::new(path, Arc::new(catalog), Arc::new(AuditHub::new())).expect("ledger"))
}

/// Quarter-hour slot number `n` of a day, wrapping at midnight.
fn quarter(date: NaiveDate, n: u32) -> Slot {
    let minutes = (n % 95) * 15;
    let start = NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0).expect("start");
    let end_min = minutes + 15;
    let end = NaiveTime::from_hms_opt(end_min / 60, end_min % 60, 0).expect("end");
    Slot::new(date, start, end)
}

fn day(offset: i64) -> NaiveDate {
    Local::now().date_naive() + chrono::Duration::days(offset)
}

async fn phase1_sequential() {
    let room = Ulid::new();
    let ledger = open_ledger("seq", &[room]);
    let who = Principal::student("bench");

    let n = 2000u32;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        // Spread over days so partitions stay small.
        let slot = quarter(day(1 + (i / 95) as i64), i);
        let t = Instant::now();
        ledger
            .request_booking(&who, Ulid::new(), room, slot)
            .await
            .expect("request");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} requests in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("request latency", &mut latencies);
}

async fn phase2_contended_slot() {
    let room = Ulid::new();
    let ledger = open_ledger("contended", &[room]);
    let slot = quarter(day(3), 40);
    let n_tasks = 64;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let who = Principal::student(format!("student{i}"));
            ledger
                .request_booking(&who, Ulid::new(), room, slot)
                .await
                .expect("request")
                .is_confirmed()
        }));
    }
    let mut confirmed = 0;
    for h in handles {
        if h.await.expect("join") {
            confirmed += 1;
        }
    }
    println!(
        "  {n_tasks} racing requests for one slot: {confirmed} confirmed, {} waitlisted in {:.2}ms",
        n_tasks - confirmed,
        start.elapsed().as_secs_f64() * 1000.0
    );
}

async fn phase3_cancel_promote_chain() {
    let room = Ulid::new();
    let ledger = open_ledger("chain", &[room]);
    let slot = quarter(day(4), 10);
    let n = 200;

    let mut current = None;
    for i in 0..n {
        let who = Principal::student(format!("student{i}"));
        let id = Ulid::new();
        let out = ledger.request_booking(&who, id, room, slot).await.expect("request");
        if out.is_confirmed() {
            current = Some((who, id));
        }
    }

    // Each cancellation hands the slot to the next in line.
    let mut latencies = Vec::with_capacity(n);
    while let Some((who, id)) = current.take() {
        let t = Instant::now();
        let out = ledger.cancel_booking(&who, id).await.expect("cancel");
        latencies.push(t.elapsed());
        current = out
            .promoted
            .first()
            .map(|p| (Principal::student(p.booking.owner.clone()), p.booking.id));
    }
    print_latency("cancel + promote latency", &mut latencies);
}

async fn phase4_reads_under_write_load() {
    let rooms: Vec<Ulid> = (0..4).map(|_| Ulid::new()).collect();
    let ledger = open_ledger("reads", &rooms);
    let date = day(5);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for (w, room) in rooms.iter().copied().enumerate() {
        let ledger = ledger.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let who = Principal::student(format!("writer{w}"));
            let mut i = 0u32;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = ledger
                    .request_booking(&who, Ulid::new(), room, quarter(date, i))
                    .await;
                i += 1;
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut readers = Vec::new();
    for r in 0..8 {
        let ledger = ledger.clone();
        let room = rooms[r % rooms.len()];
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for _ in 0..500 {
                let t = Instant::now();
                let _ = ledger.availability(room, date, None).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.expect("join"));
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

#[tokio::main]
async fn main() {
    println!("=== campusd ledger stress benchmark ===\n");

    println!("[phase 1] sequential request throughput");
    phase1_sequential().await;

    println!("\n[phase 2] contention on one slot");
    phase2_contended_slot().await;

    println!("\n[phase 3] cancellation promotion chain");
    phase3_cancel_promote_chain().await;

    println!("\n[phase 4] read latency under write load");
    phase4_reads_under_write_load().await;

    println!("\n=== benchmark complete ===");
}
