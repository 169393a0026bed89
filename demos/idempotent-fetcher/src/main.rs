//! # Idempotent Fetcher Example
//!
//! Every fetch is an operation keyed by a client-chosen request id. Retrying
//! the same request replays the stored response summary, while a failed fetch
//! runs again. Concurrent duplicates are turned away while the first one is in
//! flight. Uses `reqwest` directly and the in-memory repository, so no database
//! is needed.

use std::sync::Arc;

use ana::{AnaError, Manager, Operation, Reaper, ReaperConfig};
use ana_testing::InMemoryRepository;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct FetchSummary {
    status: u16,
    bytes: usize,
}

struct FetchOperation {
    request_id: String,
    url: String,
    requested_at: DateTime<Utc>,
    client: reqwest::Client,
}

impl FetchOperation {
    fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            requested_at: Utc::now(),
            client,
        }
    }
}

#[async_trait]
impl<C: Send> Operation<C> for FetchOperation {
    type Payload = String;
    type Output = FetchSummary;

    fn key(&self) -> &str {
        &self.request_id
    }

    fn target(&self) -> &str {
        "GET"
    }

    fn payload(&self) -> &String {
        &self.url
    }

    fn reference_time(&self) -> DateTime<Utc> {
        self.requested_at
    }

    fn timeout(&self) -> Duration {
        Duration::seconds(15)
    }

    fn expiration(&self) -> Duration {
        Duration::minutes(5)
    }

    async fn call(&self, _ctx: &mut C) -> Result<FetchSummary> {
        info!(url = %self.url, "fetching");
        let response = self.client.get(&self.url).send().await?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", status);
        }

        let body = response.text().await?;
        Ok(FetchSummary {
            status,
            bytes: body.len(),
        })
    }
}

fn report(label: &str, outcome: &Result<FetchSummary, AnaError>) {
    match outcome {
        Ok(summary) => println!(
            "  {:<10} HTTP {} ({} bytes)",
            label, summary.status, summary.bytes
        ),
        Err(e) => println!("  {:<10} {} [{}]", label, e, e.error_code()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let repository = InMemoryRepository::<String, FetchSummary>::new();
    let manager = Arc::new(Manager::new(repository.clone()));

    let urls = vec![
        "https://example.com",
        "https://httpbin.org/status/200",
        "https://httpbin.org/status/404",
    ];

    for url in urls {
        let operation = Arc::new(FetchOperation::new(client.clone(), url));
        println!("Fetching: {} (request {})", url, operation.request_id);

        // Duplicates racing the first attempt.
        let racers: Vec<_> = (0..3)
            .map(|_| {
                let manager = manager.clone();
                let operation = operation.clone();
                tokio::spawn(async move { manager.call(operation.as_ref()).await })
            })
            .collect();

        for racer in racers {
            report("racer", &racer.await?);
        }

        // A client retry after the fact.
        report("retry", &manager.call(operation.as_ref()).await);
    }

    let sweep = Reaper::new(repository.clone(), ReaperConfig::default())
        .sweep_once()
        .await?;
    println!(
        "Tracked {} requests, maintenance touched {}",
        repository.len(),
        sweep.total()
    );

    Ok(())
}
