use rocket::{
    http::Status, response::status::Custom, serde::json::Json, Catcher, Request, Route,
};

use crate::model::api::vote::Message;

mod admin;
mod elections;
mod voting;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(admin::routes());
    routes.extend(elections::routes());
    routes.extend(voting::routes());
    routes
}

pub fn catchers() -> Vec<Catcher> {
    catchers![default_catcher]
}

/// Errors raised before a handler runs, such as failed guards or unmatched
/// routes, get the same JSON body as handler errors.
#[catch(default)]
fn default_catcher(status: Status, _req: &Request<'_>) -> Custom<Json<Message>> {
    Custom(status, Json(Message::new(status.reason_lossy())))
}
