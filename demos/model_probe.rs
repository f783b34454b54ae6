//! Model probe: fetches one model and its first page of vehicle APIs.
//!
//! This example shows:
//! - Loading configuration from a TOML file and the environment
//! - Observing queries until they settle
//! - Following live updates for the model over the shared connection
//!
//! Run with: `cargo run --example model_probe -- <model-id> [config.toml]`
//!
//! Set `STUDIO_TOKEN` to send a bearer token, `STUDIO_LOG=studio_cache=debug`
//! to see cache activity.

use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{Result, WrapErr, eyre};
use futures::StreamExt;
use studio_cache::logging;
use studio_cache::prelude::*;
use studio_cache::resources::User;
use tokio::time::{Duration, timeout};

async fn settle<V: Clone + Send + Sync + 'static>(observer: &mut QueryObserver<V>) -> QueryResult<V> {
    let mut result = observer.result();
    while result.is_loading() {
        match observer.changed().await {
            Some(next) => result = next,
            None => break,
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let mut args = std::env::args().skip(1);
    let model_id = args.next().ok_or_else(|| eyre!("usage: model_probe <model-id> [config.toml]"))?;
    let config = match args.next() {
        Some(path) => StudioConfig::load(Path::new(&path))
            .wrap_err_with(|| format!("loading {path}"))?
            .with_env_overrides()?,
        None => StudioConfig::from_env()?,
    };
    logging::init(&config.log_filter).map_err(|e| eyre!("logging: {e}"))?;

    let session = SessionStore::new();
    if let Ok(token) = std::env::var("STUDIO_TOKEN") {
        let probe = User {
            id: "probe".into(),
            name: "model probe".into(),
            email: None,
        };
        session.login(probe, AccessToken::new(token));
    }

    let client = QueryClient::with_config(config.query.clone());
    let resources = Resources::new(client.clone(), session.clone(), Arc::new(config.resource_api()));

    let mut model = client.observe(resources.model(Some(&model_id)));
    let mut apis = client.observe(resources.model_apis(Some(&model_id), 1));

    let model = settle(&mut model).await;
    match (model.data(), model.error.as_ref()) {
        (Some(model), _) => println!("{} ({}) {:?}", model.name, model.id, model.visibility),
        (None, Some(error)) => return Err(eyre!("could not load model: {error}")),
        (None, None) => return Err(eyre!("model {model_id} not loaded")),
    }

    let apis = settle(&mut apis).await;
    if let Some(page) = apis.data() {
        println!("{} vehicle APIs, page {}/{}", page.total_results, page.page, page.total_pages);
        for api in &page.results {
            println!("  {:<40} {}", api.name, api.kind);
        }
    }

    let pool = ConnectionPool::new(WebSocketConnector::new());
    if let Some(conn) = pool.get_connection(&config.socket_url, session.access_token().as_deref()).await {
        conn.emit("join", &serde_json::json!({ "model": model_id }))?;
        let mut updates = Subscription::new(conn.events("model:updated")).stream();
        if let Ok(Some(update)) = timeout(Duration::from_secs(5), updates.next()).await {
            println!("live update: {update}");
            client.invalidate(&query_key!["model", model_id.as_str()]);
        }
    }
    pool.shutdown();

    Ok(())
}
