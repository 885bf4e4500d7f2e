use log::debug;
use rocket::{
    http::Status,
    response::status::Custom,
    serde::json::{Error as JsonError, Json},
    Route, State,
};

use crate::{
    coordinator::VoteCoordinator,
    error::{Error, Result},
    logging::RequestId,
    model::{
        api::vote::{Message, VoteSpec, VotedStatus},
        auth::AuthToken,
        db::voter::Voter,
        mongodb::Id,
    },
    store::{DynStore, ElectionStore, VoterLedger},
};

pub fn routes() -> Vec<Route> {
    routes![cast_vote, has_voted]
}

#[post("/elections/vote", data = "<vote>", format = "json")]
async fn cast_vote(
    token: AuthToken<Voter>,
    vote: std::result::Result<Json<VoteSpec>, JsonError<'_>>,
    coordinator: &State<VoteCoordinator>,
    request_id: RequestId,
) -> Result<Custom<Json<Message>>> {
    let vote = vote.map_err(Error::bad_request)?;
    debug!("{request_id} vote by {} in election {}", token.id, vote.election_id);
    coordinator
        .cast_vote(token.id, vote.election_id, vote.candidate_id)
        .await?;
    Ok(Custom(
        Status::Created,
        Json(Message::new("Vote cast successfully")),
    ))
}

#[get("/voter/elections/<election_id>/voted")]
async fn has_voted(
    token: AuthToken<Voter>,
    election_id: Id,
    store: &State<DynStore>,
) -> Result<Json<VotedStatus>> {
    if store.election(election_id).await?.is_none() {
        return Err(Error::not_found(format!("Election {election_id}")));
    }
    let voted = store.has_voted(token.id, election_id).await?;
    Ok(Json(VotedStatus {
        election_id: election_id.into(),
        voted,
    }))
}
