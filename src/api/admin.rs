use log::info;
use rocket::{
    http::Status,
    response::status::Custom,
    serde::json::{Error as JsonError, Json},
    Route, State,
};

use crate::{
    error::{Error, Result},
    model::{
        api::{
            election::{
                ElectionDescription, ElectionSpec, ElectionUpdate, PhaseUpdate, UpdateRejection,
            },
            voter::VoterDescription,
        },
        auth::{Admin, AuthToken},
        db::{
            audit::{AuditAction, AuditEntry},
            election::NewElection,
        },
        mongodb::Id,
    },
    schedule::PhaseScheduler,
    store::{audit, DynAudit, DynStore, ElectionStore, PhaseChange, VoterDirectory},
};

pub fn routes() -> Vec<Route> {
    routes![
        create_election,
        update_election,
        set_phase,
        all_voters,
        pending_voters,
        approve_voter
    ]
}

#[post("/elections", data = "<spec>", format = "json")]
async fn create_election(
    token: AuthToken<Admin>,
    spec: std::result::Result<Json<ElectionSpec>, JsonError<'_>>,
    store: &State<DynStore>,
    audit_sink: &State<DynAudit>,
    scheduler: &State<PhaseScheduler>,
) -> Result<Custom<Json<ElectionDescription>>> {
    let spec = spec.map_err(Error::bad_request)?.into_inner();
    spec.validate().map_err(Error::bad_request)?;

    let election = store.create_election(NewElection::from(spec)).await?;
    info!("Election {} created by admin {}", election.id, token.id);
    let action = AuditAction::ElectionCreated {
        election_id: election.id,
    };
    audit(audit_sink.inner().as_ref(), AuditEntry::by_admin(token.id, action)).await;
    scheduler.schedule(&election).await;

    Ok(Custom(Status::Created, Json(election.into())))
}

/// Edit an election's details. Candidates are fixed at creation.
#[put("/elections/<election_id>", data = "<update>", format = "json")]
async fn update_election(
    token: AuthToken<Admin>,
    election_id: Id,
    update: std::result::Result<Json<ElectionUpdate>, JsonError<'_>>,
    store: &State<DynStore>,
    audit_sink: &State<DynAudit>,
    scheduler: &State<PhaseScheduler>,
) -> Result<Json<ElectionDescription>> {
    let update = update.map_err(Error::bad_request)?.into_inner();
    let election = store
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {election_id}")))?;
    let details = update.apply_to(&election).map_err(|e| match e {
        UpdateRejection::Locked { .. } => Error::Status(Status::Conflict, e.to_string()),
        UpdateRejection::Invalid(reason) => Error::bad_request(reason),
    })?;

    // Compare-and-set on the phase we checked the update against.
    let Some(updated) = store
        .update_details(election_id, election.phase, details)
        .await?
    else {
        return Err(Error::Status(
            Status::Conflict,
            format!("Election {election_id} changed phase during the update"),
        ));
    };
    info!("Election {election_id} updated by admin {}", token.id);
    let action = AuditAction::ElectionUpdated { election_id };
    audit(audit_sink.inner().as_ref(), AuditEntry::by_admin(token.id, action)).await;
    scheduler.schedule(&updated).await;
    Ok(Json(updated.into()))
}

/// Move an election forward in its lifecycle ahead of its schedule.
#[put("/elections/<election_id>/phase", data = "<update>", format = "json")]
async fn set_phase(
    token: AuthToken<Admin>,
    election_id: Id,
    update: std::result::Result<Json<PhaseUpdate>, JsonError<'_>>,
    store: &State<DynStore>,
    audit_sink: &State<DynAudit>,
    scheduler: &State<PhaseScheduler>,
) -> Result<Json<ElectionDescription>> {
    let phase = update.map_err(Error::bad_request)?.phase;
    match store.set_phase(election_id, phase).await? {
        PhaseChange::Changed(election) => {
            info!("Election {election_id} moved to {phase} by admin {}", token.id);
            let action = AuditAction::ElectionPhaseChanged { election_id, phase };
            audit(audit_sink.inner().as_ref(), AuditEntry::by_admin(token.id, action)).await;
            scheduler.schedule(&election).await;
            Ok(Json(election.into()))
        }
        PhaseChange::Rejected(current) => Err(Error::Status(
            Status::Conflict,
            format!("Election {election_id} is {current}, cannot move to {phase}"),
        )),
        PhaseChange::NotFound => Err(Error::not_found(format!("Election {election_id}"))),
    }
}

#[get("/admin/voters")]
async fn all_voters(
    _token: AuthToken<Admin>,
    store: &State<DynStore>,
) -> Result<Json<Vec<VoterDescription>>> {
    let voters = store.voters().await?;
    Ok(Json(voters.into_iter().map(Into::into).collect()))
}

#[get("/admin/voters/pending")]
async fn pending_voters(
    _token: AuthToken<Admin>,
    store: &State<DynStore>,
) -> Result<Json<Vec<VoterDescription>>> {
    let voters = store.pending_voters().await?;
    Ok(Json(voters.into_iter().map(Into::into).collect()))
}

#[put("/admin/voters/<voter_id>/approve")]
async fn approve_voter(
    token: AuthToken<Admin>,
    voter_id: Id,
    store: &State<DynStore>,
    audit_sink: &State<DynAudit>,
) -> Result<()> {
    if !store.approve_voter(voter_id).await? {
        return Err(Error::not_found(format!("Voter {voter_id}")));
    }
    info!("Voter {voter_id} approved by admin {}", token.id);
    let action = AuditAction::VoterApproved { voter_id };
    audit(audit_sink.inner().as_ref(), AuditEntry::by_admin(token.id, action)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rocket::{
        http::ContentType,
        local::asynchronous::Client,
        serde::json::{json, serde_json},
    };

    use crate::api::testing::bearer;
    use crate::model::db::{
        audit::ActorType,
        election::{ElectionCore, Phase},
        voter::{NewVoter, Voter},
    };
    use crate::store::MemoryStore;

    use super::*;

    #[backend_test]
    async fn create_election_as_admin(client: Client, store: MemoryStore) {
        let admin_id = Id::new();
        let spec = ElectionSpec::example();
        let response = client
            .post(uri!(create_election))
            .header(ContentType::JSON)
            .header(bearer::<Admin>(&client, admin_id))
            .body(json!(spec).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Created, response.status());
        let created: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(created["phase"], "scheduled");
        assert_eq!(created["title"], spec.title.as_str());
        assert_eq!(created["candidates"][1]["count"], 0);

        let elections = store.elections().await.unwrap();
        assert_eq!(elections.len(), 1);
        assert_eq!(created["id"], elections[0].id.to_string());

        // Starts tomorrow, so the opening is pending.
        let scheduler = client.rocket().state::<PhaseScheduler>().unwrap();
        assert!(scheduler.is_scheduled(elections[0].id).await);

        let audited = store.audit_entries().await;
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].actor_id, Some(admin_id));
        assert_eq!(audited[0].actor_type, ActorType::Admin);
        assert_eq!(
            audited[0].action,
            AuditAction::ElectionCreated {
                election_id: elections[0].id
            }
        );
    }

    #[backend_test]
    async fn invalid_elections_are_rejected(client: Client, store: MemoryStore) {
        let mut spec = ElectionSpec::example();
        spec.candidates.clear();
        let response = client
            .post(uri!(create_election))
            .header(ContentType::JSON)
            .header(bearer::<Admin>(&client, Id::new()))
            .body(json!(spec).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());

        // Voters cannot create elections.
        let response = client
            .post(uri!(create_election))
            .header(ContentType::JSON)
            .header(bearer::<Voter>(&client, Id::new()))
            .body(json!(ElectionSpec::example()).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Forbidden, response.status());

        assert!(store.elections().await.unwrap().is_empty());
    }

    #[backend_test]
    async fn update_election_details(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Scheduled))
            .await;
        let admin_id = Id::new();
        let new_end = election.end_time + Duration::days(1);

        let response = client
            .put(uri!(update_election(election.id)))
            .header(ContentType::JSON)
            .header(bearer::<Admin>(&client, admin_id))
            .body(json!({ "title": "Dhaka-10 re-run", "endTime": new_end }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let updated: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(updated["title"], "Dhaka-10 re-run");
        assert_eq!(updated["description"], election.description.as_str());

        let stored = store.election(election.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Dhaka-10 re-run");
        assert_eq!(stored.end_time, new_end);
        assert_eq!(stored.candidates, election.candidates);

        let audited = store.audit_entries().await;
        assert_eq!(
            audited.last().map(|e| &e.action),
            Some(&AuditAction::ElectionUpdated {
                election_id: election.id
            })
        );
        let scheduler = client.rocket().state::<PhaseScheduler>().unwrap();
        assert!(scheduler.is_scheduled(election.id).await);
    }

    #[backend_test]
    async fn running_elections_refuse_schedule_edits(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;
        let auth = || bearer::<Admin>(&client, Id::new());

        let moved_start = election.start_time - Duration::hours(1);
        let response = client
            .put(uri!(update_election(election.id)))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "startTime": moved_start }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());

        let response = client
            .put(uri!(update_election(election.id)))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "endTime": election.start_time }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());

        let response = client
            .put(uri!(update_election(Id::new())))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "title": "Nowhere" }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::NotFound, response.status());

        let stored = store.election(election.id).await.unwrap().unwrap();
        assert_eq!(stored.details(), election.details());
    }

    #[backend_test]
    async fn phases_only_move_forward(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;
        let auth = || bearer::<Admin>(&client, Id::new());

        let response = client
            .put(uri!(set_phase(election.id)))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "phase": "ended" }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let stored = store.election(election.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Ended);

        let response = client
            .put(uri!(set_phase(election.id)))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "phase": "ongoing" }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());

        let response = client
            .put(uri!(set_phase(Id::new())))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "phase": "ended" }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::NotFound, response.status());

        let response = client
            .put(uri!(set_phase(election.id)))
            .header(ContentType::JSON)
            .header(auth())
            .body(json!({ "phase": "finished" }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());

        let changes = store
            .audit_entries()
            .await
            .into_iter()
            .filter(|e| matches!(e.action, AuditAction::ElectionPhaseChanged { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[backend_test]
    async fn approve_pending_voters(client: Client, store: MemoryStore) {
        let voter = store
            .insert_voter(NewVoter::new("Mitu".to_string(), "Sylhet-1".to_string()))
            .await;
        let auth = || bearer::<Admin>(&client, Id::new());

        let response = client
            .get(uri!(pending_voters))
            .header(auth())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let pending: Vec<serde_json::Value> =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], voter.id.to_string());
        assert_eq!(pending[0]["name"], "Mitu");
        assert_eq!(pending[0]["approved"], false);

        let response = client
            .put(uri!(approve_voter(voter.id)))
            .header(auth())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        assert!(store.voter(voter.id).await.unwrap().unwrap().approved);

        let response = client
            .get(uri!(pending_voters))
            .header(auth())
            .dispatch()
            .await;
        let pending: Vec<serde_json::Value> =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert!(pending.is_empty());

        let response = client
            .put(uri!(approve_voter(Id::new())))
            .header(auth())
            .dispatch()
            .await;
        assert_eq!(Status::NotFound, response.status());

        let response = client.get(uri!(all_voters)).header(auth()).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let all: Vec<serde_json::Value> =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["approved"], true);

        let response = client
            .get(uri!(all_voters))
            .header(bearer::<Voter>(&client, voter.id))
            .dispatch()
            .await;
        assert_eq!(Status::Forbidden, response.status());
    }
}
