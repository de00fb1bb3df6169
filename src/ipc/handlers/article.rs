use crate::AppContext;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "planetId")]
    planet_id: Uuid,
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    #[serde(rename = "planetId")]
    planet_id: Uuid,
    #[serde(rename = "articleId")]
    article_id: Uuid,
    title: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(rename = "planetId")]
    planet_id: Uuid,
    #[serde(rename = "articleId")]
    article_id: Uuid,
}

pub async fn create(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: CreateParams = serde_json::from_value(params)?;
    let article = ctx.registry.create_article(p.planet_id, &p.title, &p.content).await?;
    Ok(serde_json::to_value(article)?)
}

pub async fn update(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: UpdateParams = serde_json::from_value(params)?;
    let article = ctx
        .registry
        .update_article(p.planet_id, p.article_id, |article| {
            if let Some(title) = p.title {
                article.title = title;
            }
            if let Some(content) = p.content {
                article.content = content;
            }
        })
        .await?;
    Ok(serde_json::to_value(article)?)
}

pub async fn delete(params: Value, ctx: &AppContext) -> Result<Value> {
    let p: DeleteParams = serde_json::from_value(params)?;
    ctx.registry.delete_article(p.planet_id, p.article_id).await?;
    Ok(json!({ "deleted": p.article_id }))
}
