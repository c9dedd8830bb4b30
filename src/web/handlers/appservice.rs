use salvo::prelude::*;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::bridge::logic::is_puppet_user_id;
use crate::web::handlers::render_matrix_error;
use crate::web::web_state;

#[handler]
pub async fn put_transaction(req: &mut Request, res: &mut Response) {
    let Some(txn_id) = req.param::<String>("txn_id") else {
        render_matrix_error(res, StatusCode::BAD_REQUEST, "M_MISSING_PARAM", "missing txn id");
        return;
    };
    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(err) => {
            warn!("rejected malformed transaction txn_id={}: {}", txn_id, err);
            render_matrix_error(res, StatusCode::BAD_REQUEST, "M_NOT_JSON", "invalid json body");
            return;
        }
    };

    let relayed = web_state()
        .processor
        .process_transaction(&txn_id, &body)
        .await;
    debug!("transaction processed txn_id={} relayed={}", txn_id, relayed);
    res.render(Json(json!({})));
}

#[handler]
pub async fn get_user(req: &mut Request, res: &mut Response) {
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    let settings = web_state().bridge.settings();

    if is_puppet_user_id(&user_id, &settings.puppet_prefix, &settings.server_name) {
        res.render(Json(json!({})));
    } else {
        render_matrix_error(res, StatusCode::NOT_FOUND, "M_NOT_FOUND", "user not managed by bridge");
    }
}

#[handler]
pub async fn get_room_alias(res: &mut Response) {
    render_matrix_error(res, StatusCode::NOT_FOUND, "M_NOT_FOUND", "room aliases are not provisioned");
}
