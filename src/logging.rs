use std::time::Instant;

use crate::LOG;

/// Logs one line per request through the app's slog logger
#[derive(Debug, Default, Clone)]
pub struct LogMiddleware {
    _priv: (),
}

impl LogMiddleware {
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(&self, req: tide::Request<State>, next: tide::Next<'_, State>) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let status = resp.status();

        if let Some(e) = resp.error() {
            slog::error!(
                LOG, "request failed";
                "method" => method, "path" => path, "status" => status as u16,
                "elapsed_ms" => elapsed_ms, "error" => %e,
            );
        } else if status.is_server_error() {
            slog::error!(
                LOG, "request";
                "method" => method, "path" => path, "status" => status as u16, "elapsed_ms" => elapsed_ms,
            );
        } else if status.is_client_error() {
            slog::warn!(
                LOG, "request";
                "method" => method, "path" => path, "status" => status as u16, "elapsed_ms" => elapsed_ms,
            );
        } else {
            slog::info!(
                LOG, "request";
                "method" => method, "path" => path, "status" => status as u16, "elapsed_ms" => elapsed_ms,
            );
        }
        Ok(resp)
    }
}
