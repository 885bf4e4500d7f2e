use log::warn;
use rocket::{
    form::{error::ErrorKind, Errors},
    response::stream::{Event, EventStream},
    serde::json::Json,
    tokio::{select, sync::broadcast::error::RecvError},
    Route, Shutdown, State,
};

use crate::{
    error::{Error, Result},
    model::{
        api::election::{ElectionDescription, ElectionResults},
        mongodb::Id,
    },
    notifier::{BroadcastNotifier, UPDATE_RESULTS_EVENT},
    store::{BallotStore, DynStore, ElectionStore},
};

pub fn routes() -> Vec<Route> {
    routes![get_elections, get_election, get_results, stream_results]
}

#[get("/elections")]
async fn get_elections(store: &State<DynStore>) -> Result<Json<Vec<ElectionDescription>>> {
    let elections = store.elections().await?;
    Ok(Json(elections.into_iter().map(Into::into).collect()))
}

#[get("/elections/<election_id>")]
async fn get_election(
    election_id: Id,
    store: &State<DynStore>,
) -> Result<Json<ElectionDescription>> {
    let election = store
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {election_id}")))?;
    Ok(Json(election.into()))
}

#[get("/elections/<election_id>/results")]
async fn get_results(election_id: Id, store: &State<DynStore>) -> Result<Json<ElectionResults>> {
    let election = store
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {election_id}")))?;
    let total_ballots = store.ballot_count(election_id).await?;
    let tallies = store.region_tallies(election_id).await?;
    Ok(Json(ElectionResults::new(election, total_ballots, tallies)))
}

/// Live result updates as server-sent events, optionally for one election.
/// Nothing is replayed: a new subscriber should fetch current counts first.
#[get("/elections/results/stream?<election>")]
fn stream_results(
    election: std::result::Result<Id, Errors<'_>>,
    notifier: &State<BroadcastNotifier>,
    mut shutdown: Shutdown,
) -> Result<EventStream![]> {
    let election = match election {
        Ok(id) => Some(id),
        Err(errors) if errors.iter().all(|e| matches!(e.kind, ErrorKind::Missing)) => None,
        Err(errors) => return Err(Error::bad_request(format!("election filter: {errors}"))),
    };
    let mut updates = notifier.subscribe();
    Ok(EventStream! {
        loop {
            let update = select! {
                biased;
                update = updates.recv() => match update {
                    Ok(update) => update,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Result stream fell behind, skipped {skipped} updates");
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            if election.map_or(true, |id| *update.election_id == id) {
                yield Event::json(&update).event(UPDATE_RESULTS_EVENT);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, serde_json},
    };

    use crate::api::testing::bearer;
    use crate::model::{
        db::election::{ElectionCore, Phase},
        db::voter::{NewVoter, Voter},
    };
    use crate::store::{MemoryStore, VoterDirectory};

    use super::*;

    async fn vote_as_new_voter(
        client: &Client,
        store: &MemoryStore,
        region: &str,
        election_id: Id,
        candidate_id: Id,
    ) {
        let voter = store
            .insert_voter(NewVoter::new("Refat".to_string(), region.to_string()))
            .await;
        store.approve_voter(voter.id).await.unwrap();
        let body = json!({
            "electionId": election_id.to_string(),
            "candidateId": candidate_id.to_string(),
        });
        let response = client
            .post("/elections/vote")
            .header(ContentType::JSON)
            .header(bearer::<Voter>(client, voter.id))
            .body(body.to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Created, response.status());
    }

    #[backend_test]
    async fn list_and_get(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;

        let response = client.get(uri!(get_elections)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let listed: Vec<serde_json::Value> =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], election.id.to_string());
        assert_eq!(listed[0]["phase"], "ongoing");

        let response = client.get(uri!(get_election(election.id))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let described: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(described["title"], election.title.as_str());
        assert_eq!(described["candidates"][0]["count"], 0);

        let response = client.get(uri!(get_election(Id::new()))).dispatch().await;
        assert_eq!(Status::NotFound, response.status());
    }

    #[backend_test]
    async fn results_break_down_by_region(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;
        let c1 = election.candidates[0].id;
        let c2 = election.candidates[1].id;
        vote_as_new_voter(&client, &store, "Dhaka-10", election.id, c1).await;
        vote_as_new_voter(&client, &store, "Dhaka-10", election.id, c2).await;
        vote_as_new_voter(&client, &store, "Sylhet-1", election.id, c1).await;

        let response = client.get(uri!(get_results(election.id))).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let results: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(results["totalBallots"], 3);
        let total: u64 = results["candidates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["count"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 3);
        let dhaka = &results["regions"]["Dhaka-10"];
        assert_eq!(dhaka[c1.to_string()], 1);
        assert_eq!(dhaka[c2.to_string()], 1);
        assert_eq!(results["regions"]["Sylhet-1"][c1.to_string()], 1);
        assert!(results["regions"]["Sylhet-1"].get(c2.to_string()).is_none());
    }

    #[backend_test]
    async fn stream_carries_committed_votes(client: Client, store: MemoryStore) {
        let election = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;
        let other = store
            .insert_election(ElectionCore::example(Phase::Ongoing))
            .await;
        let c1 = election.candidates[0].id;

        let response = client
            .get(format!("/elections/results/stream?election={}", election.id))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());

        vote_as_new_voter(&client, &store, "Dhaka-10", election.id, c1).await;
        vote_as_new_voter(&client, &store, "Dhaka-10", other.id, other.candidates[0].id).await;
        vote_as_new_voter(&client, &store, "Dhaka-10", election.id, c1).await;

        // End the stream so the body can be read to completion.
        client.rocket().shutdown().notify();
        let body = response.into_string().await.unwrap();
        let events: Vec<serde_json::Value> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["electionId"], election.id.to_string());
        assert_eq!(events[0]["totalVotes"], 1);
        assert_eq!(events[1]["totalVotes"], 2);
        let named = body
            .lines()
            .filter(|line| line.starts_with("event:") && line.ends_with(UPDATE_RESULTS_EVENT))
            .count();
        assert_eq!(named, 2);
    }

    #[backend_test]
    async fn malformed_stream_filter_is_rejected(client: Client) {
        let response = client
            .get("/elections/results/stream?election=not-an-id")
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());
        let body: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert!(body["message"].as_str().unwrap().contains("election filter"));

        // Leaving the filter out is still fine.
        let response = client.get("/elections/results/stream").dispatch().await;
        assert_eq!(Status::Ok, response.status());
    }
}
