use salvo::prelude::*;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::web::handlers::{
    appservice::{get_room_alias, get_user, put_transaction},
    health::{get_status, health_check},
    metrics::metrics,
    provisioning::list_rooms,
    render_matrix_error,
};
use crate::web::web_state;

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("status").get(get_status))
        .push(Router::with_path("metrics").get(metrics))
        .push(Router::with_path("admin/rooms").get(list_rooms))
        .push(
            Router::with_path("_matrix/app/v1")
                .hoop(require_hs_token)
                .push(Router::with_path("transactions/{txn_id}").put(put_transaction))
                .push(Router::with_path("users/{user_id}").get(get_user))
                .push(Router::with_path("rooms/{alias}").get(get_room_alias)),
        )
        .push(
            Router::with_path("transactions/{txn_id}")
                .hoop(require_hs_token)
                .put(put_transaction),
        )
}

/// Token presented by the homeserver, from the `Authorization` header or the legacy query parameter.
fn presented_token<'a>(authorization: Option<&'a str>, query: Option<&'a str>) -> Option<&'a str> {
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or(query)
        .filter(|token| !token.is_empty())
}

#[handler]
pub async fn require_hs_token(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);
    let query = req.query::<String>("access_token");
    let expected = web_state().hs_token.expose_secret();

    match presented_token(authorization.as_deref(), query.as_deref()) {
        Some(token) if token == expected => {}
        Some(_) => {
            warn!("rejected appservice request with bad hs_token path={}", req.uri().path());
            render_matrix_error(res, StatusCode::FORBIDDEN, "M_FORBIDDEN", "bad hs_token");
            ctrl.skip_rest();
        }
        None => {
            render_matrix_error(res, StatusCode::FORBIDDEN, "M_FORBIDDEN", "missing hs_token");
            ctrl.skip_rest();
        }
    }
}
