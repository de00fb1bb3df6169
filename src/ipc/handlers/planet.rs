use crate::AppContext;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

#[derive(Deserialize)]
struct CreateParams {
    name: String,
    #[serde(default)]
    about: String,
    #[serde(default = "default_template")]
    template: String,
}

fn default_template() -> String {
    "Plain".to_string()
}

#[derive(Deserialize)]
struct UpdateParams {
    #[serde(rename = "planetId")]
    planet_id: Uuid,
    name: Option<String>,
    about: Option<String>,
    template: Option<String>,
}

#[derive(Deserialize)]
struct PlanetIdParams {
    #[serde(rename = "planetId")]
    planet_id: Uuid,
}

pub async fn create(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: CreateParams = serde_json::from_value(params)?;
    let planet = ctx.registry.create_planet(&p.name, &p.about, &p.template).await?;
    Ok(serde_json::to_value(planet)?)
}

/// Edit name/about/template; absent fields keep their value. The edit shows
/// up on the site at the next publish.
pub async fn update(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: UpdateParams = serde_json::from_value(params)?;
    let planet = ctx
        .registry
        .update_planet(p.planet_id, |planet| {
            if let Some(name) = p.name {
                planet.name = name;
            }
            if let Some(about) = p.about {
                planet.about = about;
            }
            if let Some(template) = p.template {
                planet.template = template;
            }
        })
        .await?;
    Ok(serde_json::to_value(planet)?)
}

pub async fn list(_params: Value, ctx: &AppContext) -> Result<Value> {
    let planets = ctx.registry.planets().await;
    Ok(json!({ "planets": planets }))
}

/// Delete a planet, release its pinned roots and drop its naming key.
///
/// Registry removal is the authoritative step; node-side cleanup is
/// best-effort so an offline node cannot block the delete. Orphaned objects
/// fall to the next GC.
pub async fn delete(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: PlanetIdParams = serde_json::from_value(params)?;
    let (planet, roots) = ctx.registry.delete_planet(p.planet_id).await?;

    for root in &roots {
        if let Err(e) = ctx.store.unpin(root).await {
            warn!(planet_id = %planet.id, root = %root, err = %e, "failed to unpin deleted planet root");
        }
    }
    if let Err(e) = ctx.api.key_rm(&planet.naming_key_ref).await {
        warn!(planet_id = %planet.id, key = %planet.naming_key_ref, err = %e, "failed to remove naming key");
    }

    Ok(json!({ "deleted": planet.id }))
}

pub async fn publish(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: PlanetIdParams = serde_json::from_value(params)?;
    let record = ctx.pipeline.publish(p.planet_id).await?;
    Ok(serde_json::to_value(record)?)
}
