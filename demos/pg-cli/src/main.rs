//! # PostgreSQL CLI Example
//!
//! Runs one operation through a PostgreSQL-backed manager. Run it twice within
//! the same minute and the second run replays the stored result instead of
//! doing the work again.
//!
//! ```text
//! ANA_DATABASE_URL=postgres://localhost/ana \
//!     cargo run -p pg-cli-demo -- [key] [target] [payload] [failure message]
//! ```

use ana::{Manager, Operation, Reaper};
use ana_postgres::{PgConfig, PgContext, PgRepository};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DebugPayload {
    text: String,
    value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DebugResult {
    text: String,
    value: i64,
}

struct DebugOperation {
    key: String,
    target: String,
    payload: DebugPayload,
    reference_time: DateTime<Utc>,
    failure: Option<String>,
}

impl DebugOperation {
    fn from_args() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let key = args.next().unwrap_or_else(|| "default key".to_string());
        let target = args.next().unwrap_or_else(|| "default target".to_string());
        let text = args
            .next()
            .unwrap_or_else(|| "default payload value".to_string());
        let failure = args.next();

        // Same minute, same operation.
        let reference_time = Utc::now().duration_trunc(Duration::minutes(1))?;

        Ok(Self {
            key,
            target,
            payload: DebugPayload { text, value: 1 },
            reference_time,
            failure,
        })
    }
}

#[async_trait]
impl Operation<PgContext<DebugPayload, DebugResult>> for DebugOperation {
    type Payload = DebugPayload;
    type Output = DebugResult;

    fn key(&self) -> &str {
        &self.key
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn payload(&self) -> &DebugPayload {
        &self.payload
    }

    fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    fn timeout(&self) -> Duration {
        Duration::minutes(1)
    }

    fn expiration(&self) -> Duration {
        Duration::minutes(1)
    }

    async fn call(
        &self,
        _ctx: &mut PgContext<DebugPayload, DebugResult>,
    ) -> Result<DebugResult> {
        println!("Not already processed");

        if let Some(failure) = &self.failure {
            anyhow::bail!("{}", failure);
        }

        Ok(DebugResult {
            text: self.payload.text.clone(),
            value: 42,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PgConfig::from_env()?;
    let repository = PgRepository::<DebugPayload, DebugResult>::new(config.connect().await?);
    repository.migrate().await?;

    let manager = Manager::new(repository.clone());
    let operation = DebugOperation::from_args()?;
    let result = manager.call(&operation).await;

    println!("OPERATION");
    println!("  Key:           {}", operation.key);
    println!("  Target:        {}", operation.target);
    println!("  Payload:       {:?}", operation.payload);
    println!("  ReferenceTime: {}", operation.reference_time);

    println!("\nRESULT");
    match result {
        Ok(result) => println!("  Result: {:?}", result),
        Err(e) => println!("  Error:  {} ({})", e, e.error_code()),
    }

    let report = Reaper::new(repository, config.reaper_config())
        .sweep_once()
        .await?;
    println!("\nMAINTENANCE");
    println!("  Rows touched: {}", report.total());

    Ok(())
}
