use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(100).clamp(1, 1000), offset.unwrap_or(0).max(0))
}

#[handler]
pub async fn list_rooms(req: &mut Request, res: &mut Response) {
    let (limit, offset) = page(req.query::<i64>("limit"), req.query::<i64>("offset"));
    let channels = web_state().bridge.db().channel_store();

    let rooms = match channels.list_room_mappings(limit, offset).await {
        Ok(rooms) => rooms,
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("database error: {}", err),
            );
            return;
        }
    };
    let total = channels.count_rooms().await.ok();

    res.render(Json(json!({
        "rooms": rooms,
        "count": rooms.len(),
        "total": total,
        "limit": limit,
        "offset": offset,
    })));
}
