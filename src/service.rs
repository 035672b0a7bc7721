use std::sync::Arc;
use tide::http::mime;

use crate::ideas::{IdeaError, IdeasStore};
use crate::spotify::SpotifyClient;
use crate::LOG;

const DEFAULT_OFFSET: usize = 0;
const DEFAULT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct Context {
    spotify: Arc<SpotifyClient>,
    ideas: Arc<IdeasStore>,
    version: String,
}

impl Context {
    pub fn new(spotify: Arc<SpotifyClient>, ideas: Arc<IdeasStore>, version: &str) -> Self {
        Self {
            spotify,
            ideas,
            version: version.to_string(),
        }
    }
}

pub fn app(ctx: Context) -> tide::Server<Context> {
    let mut app = tide::with_state(ctx);
    app.at("/status").get(status);
    app.at("/now-playing").get(now_playing);
    app.at("/ideas")
        .get(list_ideas)
        .head(list_ideas)
        .post(add_idea)
        .options(ideas_preflight)
        .all(method_not_allowed);
    app.with(crate::logging::LogMiddleware::new());
    app.with(ResponseHeaders);
    app
}

pub async fn start(ctx: Context, addr: String) -> crate::Result<()> {
    let app = app(ctx);
    slog::info!(LOG, "running at {}", addr);
    app.listen(addr).await?;
    Ok(())
}

/// Allows any origin and defaults non-empty bodies to json
struct ResponseHeaders;

#[async_trait::async_trait]
impl tide::Middleware<Context> for ResponseHeaders {
    async fn handle(&self, req: tide::Request<Context>, next: tide::Next<'_, Context>) -> tide::Result {
        let mut resp = next.run(req).await;
        resp.insert_header("access-control-allow-origin", "*");
        if resp.header("content-type").is_none() && resp.len() != Some(0) {
            resp.set_content_type(mime::JSON);
        }
        Ok(resp)
    }
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &req.state().version
    }))
}

async fn now_playing(req: tide::Request<Context>) -> tide::Result {
    match req.state().spotify.current_song().await {
        Ok(song) => Ok(resp!(json => song)),
        Err(e) => {
            slog::error!(LOG, "error getting current song"; "error" => %e);
            Ok(resp!(status => 500, message => format!("error getting current song: {}", e)))
        }
    }
}

/// A query value, or `default` when it's absent or not a non-negative integer
fn query_or(req: &tide::Request<Context>, key: &str, default: usize) -> usize {
    req.url()
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(serde::Serialize)]
struct IdeaList<T> {
    ideas: T,
}

async fn list_ideas(req: tide::Request<Context>) -> tide::Result {
    let offset = query_or(&req, "offset", DEFAULT_OFFSET);
    let limit = query_or(&req, "limit", DEFAULT_LIMIT);
    match req.state().ideas.list(offset, limit).await {
        Ok(ideas) => Ok(resp!(json => IdeaList { ideas })),
        Err(e) => {
            slog::error!(LOG, "error listing ideas"; "offset" => offset, "limit" => limit, "error" => %e);
            Ok(resp!(status => 500, message => format!("error listing ideas: {}", e)))
        }
    }
}

#[derive(serde::Deserialize)]
struct NewIdea {
    idea: String,
}

async fn add_idea(mut req: tide::Request<Context>) -> tide::Result {
    let new: NewIdea = match req.body_json().await {
        Ok(new) => new,
        Err(e) => {
            slog::warn!(LOG, "malformed idea body"; "error" => %e);
            return Ok(resp!(status => 400, message => format!("invalid request body: {}", e)));
        }
    };
    match req.state().ideas.append(&new.idea).await {
        Ok(idea) => Ok(resp!(json => idea)),
        Err(e @ IdeaError::Invalid(_)) => Ok(resp!(status => 400, message => e.to_string())),
        Err(e) => {
            slog::error!(LOG, "error storing idea"; "error" => %e);
            Ok(resp!(status => 500, message => format!("error storing idea: {}", e)))
        }
    }
}

async fn ideas_preflight(_req: tide::Request<Context>) -> tide::Result {
    let mut resp = tide::Response::new(204);
    resp.insert_header("access-control-allow-methods", "GET, POST, OPTIONS");
    resp.insert_header("access-control-allow-headers", "Content-Type");
    Ok(resp)
}

async fn method_not_allowed(req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(
        status => 405,
        message => format!("method {} not allowed on {}", req.method(), req.url().path())
    ))
}
