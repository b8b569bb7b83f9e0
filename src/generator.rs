//! Random transaction feed for local runs against the in-memory queue manager.

use chrono::{SecondsFormat, Utc};
use mqbridge_client::mq::InMemoryQueueManager;
use mqbridge_client::MqMessage;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

const TRANSACTION_TYPES: &[&str] = &[
    "purchase",
    "refund",
    "payment",
    "transfer",
    "deposit",
    "withdrawal",
];
const CATEGORIES: &[&str] = &[
    "electronics",
    "clothing",
    "food",
    "services",
    "utilities",
    "entertainment",
];
const STATUSES: &[&str] = &["completed", "pending", "failed", "processing"];
const CURRENCIES: &[&str] = &["USD", "EUR", "GBP"];
const PAYMENT_METHODS: &[&str] =
    &["credit_card", "debit_card", "paypal", "bank_transfer", "cash"];
const DEVICE_TYPES: &[&str] = &["mobile", "web", "pos", "atm"];
const FIRST_NAMES: &[&str] = &[
    "Ada", "Grace", "Linus", "Margaret", "Dennis", "Barbara", "Ken", "Frances",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Hopper", "Torvalds", "Hamilton", "Ritchie", "Liskov", "Thompson", "Allen",
];
const MERCHANTS: &[&str] = &[
    "Acme Corp",
    "Globex",
    "Initech",
    "Umbrella Retail",
    "Stark Supplies",
    "Wayne Foods",
];
const CITIES: &[(&str, &str)] = &[
    ("Seoul", "South Korea"),
    ("London", "United Kingdom"),
    ("New York", "United States"),
    ("Berlin", "Germany"),
    ("Toronto", "Canada"),
    ("Sydney", "Australia"),
];

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, choices: &[&'a str]) -> &'a str {
    choices.choose(rng).copied().unwrap_or_default()
}

/// One random transaction document.
pub fn generate_transaction<R: Rng + ?Sized>(rng: &mut R) -> Value {
    let first = pick(rng, FIRST_NAMES);
    let last = pick(rng, LAST_NAMES);
    let (city, country) = CITIES.choose(rng).copied().unwrap_or(("Seoul", "South Korea"));
    let amount = (rng.random_range(10.0..5000.0_f64) * 100.0).round() / 100.0;

    json!({
        "transaction_id": Uuid::new_v4().to_string(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "customer_id": format!("CUST-{}", rng.random_range(10000..=99999)),
        "customer_name": format!("{first} {last}"),
        "customer_email": format!("{}.{}@example.com", first.to_lowercase(), last.to_lowercase()),
        "transaction_type": pick(rng, TRANSACTION_TYPES),
        "category": pick(rng, CATEGORIES),
        "amount": amount,
        "currency": pick(rng, CURRENCIES),
        "status": pick(rng, STATUSES),
        "merchant_id": format!("MERCH-{}", rng.random_range(1000..=9999)),
        "merchant_name": pick(rng, MERCHANTS),
        "location": {
            "city": city,
            "country": country,
            "latitude": rng.random_range(-90.0..90.0_f64),
            "longitude": rng.random_range(-180.0..180.0_f64),
        },
        "payment_method": pick(rng, PAYMENT_METHODS),
        "device_type": pick(rng, DEVICE_TYPES),
        "ip_address": format!(
            "{}.{}.{}.{}",
            rng.random_range(1..=223),
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random_range(1..=254)
        ),
        "metadata": {
            "session_id": Uuid::new_v4().to_string(),
            "campaign_id": format!("CAMP-{}", rng.random_range(100..=999)),
        }
    })
}

/// Puts a transaction on `queue` every `every` until `stop` turns true.
pub async fn run(
    qm: Arc<InMemoryQueueManager>,
    queue: String,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!("Generating a transaction on {} every {:?}", queue, every);
    let mut ticker = tokio::time::interval(every);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let transaction = generate_transaction(&mut rand::rng());
        let payload = match serde_json::to_vec_pretty(&transaction) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode transaction: {}", e);
                continue;
            }
        };
        match qm.put_committed(&queue, MqMessage::new(payload)) {
            Ok(_) => {
                sent += 1;
                info!(
                    "Generated transaction #{} {} ({} {} {})",
                    sent,
                    transaction["transaction_id"].as_str().unwrap_or_default(),
                    transaction["transaction_type"].as_str().unwrap_or_default(),
                    transaction["currency"].as_str().unwrap_or_default(),
                    transaction["amount"]
                );
            }
            Err(e) => warn!("Failed to put generated transaction on {}: {}", queue, e),
        }
    }
    info!("Transaction generator stopped after {} message(s)", sent);
}
