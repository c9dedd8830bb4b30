pub mod appservice;
pub mod health;
pub mod metrics;
pub mod provisioning;

use salvo::prelude::*;
use serde_json::json;

/// Renders a Matrix-style error body.
pub(crate) fn render_matrix_error(res: &mut Response, status: StatusCode, errcode: &str, error: &str) {
    res.status_code(status);
    res.render(Json(json!({ "errcode": errcode, "error": error })));
}
