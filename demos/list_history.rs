//! Lists the first page of test history twice in parallel and shows that
//! only one request goes out.
//!
//! ```text
//! TESTHIST_BASE_URL=http://127.0.0.1:3001 RUST_LOG=testhist=debug \
//!     cargo run --example list_history [config.json]
//! ```

use std::path::Path;
use std::sync::Arc;

use testhist::background::spawn_sweeper;
use testhist::config::ClientConfig;
use testhist::history::{HistoryApi, QueryParams, SortOrder};
use testhist::store::{HistoryStore, TracingReporter};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_file(Path::new(&path))?,
        None => ClientConfig::default(),
    }
    .with_env_overrides();

    let api = HistoryApi::from_config(&config)?;
    let store = HistoryStore::new(api, Arc::new(TracingReporter));
    let sweeper = spawn_sweeper(store.api().cache(), store.detach_token());

    let params = QueryParams::new()
        .page(1)
        .page_size(10)
        .sort("createdAt", SortOrder::Desc);
    let (a, b) = tokio::join!(store.load(params.clone()), store.load(params));

    match (a, b) {
        (Ok(a), Ok(b)) => {
            println!(
                "shared result: {}",
                if Arc::ptr_eq(&a, &b) { "yes" } else { "no" }
            );
            let state = store.snapshot();
            println!("page {} of {} records", state.current_page, state.total_records);
            for record in &state.records {
                println!(
                    "  {:<24} {:<12} {}",
                    record.id,
                    record.test_type.as_deref().unwrap_or("-"),
                    record.status.as_deref().unwrap_or("-"),
                );
            }
        }
        (Err(e), _) | (_, Err(e)) => eprintln!("load failed: {e}"),
    }

    store.detach();
    sweeper.stop().await;
    Ok(())
}
