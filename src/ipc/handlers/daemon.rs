use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn ping(_params: Value, _ctx: &AppContext) -> Result<Value> {
    Ok(json!({ "pong": true }))
}

pub async fn status(_params: Value, ctx: &AppContext) -> Result<Value> {
    let node = ctx.reconciler.snapshot().await;
    let planets = ctx.registry.planets().await;
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "port": ctx.config.port,
        "dataDir": ctx.config.data_dir,
        "planetCount": planets.len(),
        "node": node,
    }))
}
