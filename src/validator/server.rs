//! HTTP listener that routes every inbound request through the validator.

use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use tower_http::trace::TraceLayer;

use super::RequestValidator;

impl RequestValidator {
    /// Bind a listener on the schedule's configured host and port and serve
    /// it in the background.
    ///
    /// The listener lives until the runtime shuts down so that requests
    /// arriving after the schedule is done are still recorded as errors.
    pub async fn serve(&self) -> anyhow::Result<SocketAddr> {
        let addr = self.schedule().config().server_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?;
        self.set_address(bound);

        tracing::info!("Request validator listening on {}", bound);

        let app = router(self.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!("Request validator listener stopped: {}", e);
            }
        });

        Ok(bound)
    }
}

fn router(validator: RequestValidator) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(validator)
}

async fn dispatch(State(validator): State<RequestValidator>, request: Request) -> Response {
    validator.handle(request).await
}
