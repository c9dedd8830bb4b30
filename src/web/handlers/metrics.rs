use salvo::prelude::*;
use serde_json::json;

use crate::web::metrics::Metrics;
use crate::web::web_state;

#[handler]
pub async fn metrics(res: &mut Response) {
    let state = web_state();

    res.render(Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "relay": Metrics::snapshot(),
    })));
}
