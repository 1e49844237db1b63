use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

struct Target {
    host: String,
    port: u16,
    staff_password: String,
    customer_password: String,
}

impl Target {
    async fn connect(&self, user: &str, database: &str, password: &str) -> Client {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(database)
            .user(user)
            .password(password);

        let (client, conn) = config.connect(NoTls).await.expect("connect failed");
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                eprintln!("connection error: {e}");
            }
        });
        client
    }

    async fn tech(&self) -> Client {
        self.connect(&format!("bench-{}", Ulid::new()), "service", &self.staff_password)
            .await
    }

    async fn customer(&self, account: Ulid) -> Client {
        self.connect(&account.to_string(), "customer", &self.customer_password)
            .await
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

/// Value of `column` in the first row returned by `sql`.
async fn first(client: &Client, sql: &str, column: &str) -> String {
    let messages = client.simple_query(sql).await.expect(sql);
    messages
        .into_iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get(column).map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no {column} in result of {sql}"))
}

/// A bay number range per run so reruns against one server rarely collide.
fn bay_base() -> u32 {
    (Ulid::new().random() % 1_000) as u32 * 10
}

async fn create_bays(tech: &Client, base: u32, n: u32) -> Vec<String> {
    let mut ids = Vec::with_capacity(n as usize);
    for i in 0..n {
        ids.push(first(tech, &format!("INSERT INTO bays (number) VALUES ({})", base + i + 1), "id").await);
    }
    ids
}

/// Book and confirm `n` service appointments, each in its own slot.
async fn confirmed_appointments(target: &Target, tech: &Client, n: usize) -> Vec<String> {
    let customer = target.customer(Ulid::new()).await;
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = first(
            &customer,
            &format!(
                "INSERT INTO appointments (kind, subject_id, scheduled_date, time_slot, customer_name, customer_email) \
                 VALUES ('service', '{}', '2026-11-20', '{:02}:{:02}', 'Bench', 'bench@example.com')",
                Ulid::new(),
                8 + i / 60,
                i % 60
            ),
            "id",
        )
        .await;
        tech.batch_execute(&format!("UPDATE appointments SET status = 'confirmed' WHERE id = '{id}'"))
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

async fn phase1_sequential_cycle(target: &Target, base: u32) {
    let tech = target.tech().await;
    let bays = create_bays(&tech, base, 1).await;
    let appointments = confirmed_appointments(target, &tech, 200).await;

    let mut seat = Vec::with_capacity(appointments.len());
    let mut complete = Vec::with_capacity(appointments.len());
    let start = Instant::now();
    for appt in &appointments {
        let t = Instant::now();
        tech.batch_execute(&format!(
            "UPDATE bays SET status = 'occupied', current_booking = '{appt}' WHERE id = '{}'",
            bays[0]
        ))
        .await
        .unwrap();
        seat.push(t.elapsed());

        let progress = first(
            &tech,
            &format!("INSERT INTO repair_progress (appointment_id, status) VALUES ('{appt}', 'in_progress')"),
            "id",
        )
        .await;
        let t = Instant::now();
        tech.batch_execute(&format!(
            "UPDATE repair_progress SET status = 'completed', free_bay = true WHERE id = '{progress}'"
        ))
        .await
        .unwrap();
        complete.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {} seat/complete cycles through one bay in {:.2}s",
        appointments.len(),
        elapsed.as_secs_f64()
    );
    print_latency("assign", &mut seat);
    print_latency("complete + release", &mut complete);
}

/// Many consoles try to seat the same appointment at different bays at
/// once. Exactly one may win per appointment.
async fn phase2_assign_race(target: &Target, base: u32) {
    let n_appointments = 50;
    let n_racers = 8;

    let tech = target.tech().await;
    let bays = create_bays(&tech, base + 1, n_racers as u32).await;
    let appointments = confirmed_appointments(target, &tech, n_appointments).await;

    let mut racers = Vec::with_capacity(n_racers);
    for _ in 0..n_racers {
        racers.push(target.tech().await);
    }
    let racers = std::sync::Arc::new(racers);

    let start = Instant::now();
    let mut violations = 0;
    let mut conflicts = 0;
    for appt in &appointments {
        let mut handles = Vec::with_capacity(n_racers);
        for (r, bay) in bays.iter().enumerate() {
            let racers = racers.clone();
            let sql = format!("UPDATE bays SET status = 'occupied', current_booking = '{appt}' WHERE id = '{bay}'");
            handles.push(tokio::spawn(async move { racers[r].batch_execute(&sql).await.is_ok() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap_or(false) {
                winners += 1;
            }
        }
        conflicts += n_racers - winners;
        if winners != 1 {
            violations += 1;
        }
        // free the winning bay for the next round
        let progress = first(
            &tech,
            &format!("INSERT INTO repair_progress (appointment_id, status) VALUES ('{appt}', 'in_progress')"),
            "id",
        )
        .await;
        tech.batch_execute(&format!(
            "UPDATE repair_progress SET status = 'completed', free_bay = true WHERE id = '{progress}'"
        ))
        .await
        .unwrap();
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_appointments} appointments x {n_racers} racers in {:.2}s: {conflicts} conflicts, {violations} violations",
        elapsed.as_secs_f64()
    );
    assert_eq!(violations, 0, "an appointment was seated at more than one bay");
}

async fn phase3_listing_latency(target: &Target) {
    let n_readers = 10;
    let reads_per_reader = 200;
    let mut handles = Vec::with_capacity(n_readers);
    for _ in 0..n_readers {
        let client = target.tech().await;
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute("SELECT * FROM appointments WHERE status = 'completed' AND page_size = 50")
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap_or_default());
    }
    print_latency("appointment listing", &mut all);
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("BAYFLOW_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("BAYFLOW_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid BAYFLOW_PORT"),
        staff_password: std::env::var("BAYFLOW_STAFF_PASSWORD").unwrap_or_else(|_| "bayflow".into()),
        customer_password: std::env::var("BAYFLOW_CUSTOMER_PASSWORD").unwrap_or_else(|_| "bayflow".into()),
    };

    println!("=== bayflow contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    let base = bay_base();
    println!("[phase 1] sequential assign / complete cycle");
    phase1_sequential_cycle(&target, base).await;

    println!("\n[phase 2] concurrent assigns of one appointment");
    phase2_assign_race(&target, base).await;

    println!("\n[phase 3] listing latency");
    phase3_listing_latency(&target).await;

    println!("\ndone");
}
