use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

pub async fn launch(_params: Value, ctx: &AppContext) -> Result<Value> {
    let state = ctx.reconciler.launch().await?;
    Ok(serde_json::to_value(state)?)
}

pub async fn shutdown(_params: Value, ctx: &AppContext) -> Result<Value> {
    let state = ctx.reconciler.shutdown().await?;
    Ok(serde_json::to_value(state)?)
}

pub async fn get_state(_params: Value, ctx: &AppContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.reconciler.snapshot().await)?)
}

pub async fn gc(_params: Value, ctx: &AppContext) -> Result<Value> {
    let reclaimed = ctx.store.gc(ctx.config.gc_timeout()).await?;
    // The repo just shrank; refresh the published snapshot now instead of
    // leaving the stale size up until the next poll tick.
    ctx.reconciler.poll_once().await;
    Ok(json!({ "reclaimed": reclaimed }))
}
