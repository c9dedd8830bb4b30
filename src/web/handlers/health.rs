use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let state = web_state();
    let rooms = state.bridge.db().channel_store().count_rooms().await.ok();
    let status = if rooms.is_some() { "running" } else { "degraded" };

    res.render(Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "rooms": rooms,
        "sources": state.bridge.sources().ids(),
        "provisioning": state.bridge.provisioning_in_progress(),
    })));
}
