//! The SPA-facing HTTP surface. Routes translate domain verbs into log
//! proposals; reads come straight from the state machine, optionally behind
//! a NOOP linearizability barrier.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use scoot_consensus::Proposer;
use scoot_state::{ReplicatedLog, ScooterStateMachine};
use scoot_types::{ScooterCommand, ScootError};

/// How many fresh slots to try when competing proposers keep winning ours.
const COMMIT_ATTEMPTS: usize = 3;

pub struct ApiState {
    pub machine: Arc<ScooterStateMachine>,
    pub log: Arc<ReplicatedLog>,
    pub proposer: Arc<Proposer>,
}

impl ApiState {
    /// Drive one command through consensus until a slot decides exactly our
    /// bytes. A slot can decide a competing proposer's command instead; that
    /// request still returned "success" to *its* caller, so we simply take
    /// the next slot and try again, bounded.
    async fn commit_command(&self, cmd: &ScooterCommand) -> Result<(), ScootError> {
        let bytes = cmd.encode()?;
        for _ in 0..COMMIT_ATTEMPTS {
            let slot = self.log.take_next_index().await;
            let decision = self.proposer.propose(slot, slot, &bytes).await?;
            if decision.command == bytes {
                return Ok(());
            }
            debug!(slot, "slot decided a competing command; retrying on a fresh slot");
        }
        Err(ScootError::SlotContention {
            attempts: COMMIT_ATTEMPTS,
        })
    }

    /// Linearizability barrier: once our NOOP decides, every previously
    /// committed command has been applied on this replica.
    async fn barrier(&self) -> Result<(), ScootError> {
        self.commit_command(&ScooterCommand::Noop).await
    }
}

#[derive(Deserialize)]
struct ReserveBody {
    reservation_id: String,
}

#[derive(Deserialize)]
struct ReleaseBody {
    distance: i64,
}

/// Route one request. Generic over the body so tests can drive it with
/// `Full<Bytes>` while the server feeds it `hyper::body::Incoming`.
pub async fn handle<B>(state: Arc<ApiState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let linearizable = parts
        .uri
        .query()
        .map(|q| q.split('&').any(|pair| pair == "linearizable=true"))
        .unwrap_or(false);

    match (parts.method.as_str(), segments.as_slice()) {
        ("GET", ["scooters"]) => list_scooters(&state, linearizable).await,
        ("GET", ["scooters", id]) => get_scooter(&state, id, linearizable).await,
        ("PUT", ["scooters", id]) => create_scooter(&state, id).await,
        ("POST", ["scooters", id, "reservations"]) => {
            match read_json::<ReserveBody, B>(body).await {
                Ok(parsed) => reserve_scooter(&state, id, parsed).await,
                Err(resp) => resp,
            }
        }
        ("POST", ["scooters", id, "releases"]) => {
            match read_json::<ReleaseBody, B>(body).await {
                Ok(parsed) => release_scooter(&state, id, parsed).await,
                Err(resp) => resp,
            }
        }
        ("POST", ["snapshot"]) => take_snapshot(&state).await,
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "no such route"})),
    }
}

async fn list_scooters(state: &ApiState, linearizable: bool) -> Response<Full<Bytes>> {
    if linearizable {
        if let Err(err) = state.barrier().await {
            return error_response(&err);
        }
    }
    let scooters = state.machine.get_scooters().await;
    json_response(StatusCode::OK, json!(scooters))
}

async fn get_scooter(state: &ApiState, id: &str, linearizable: bool) -> Response<Full<Bytes>> {
    if linearizable {
        if let Err(err) = state.barrier().await {
            return error_response(&err);
        }
    }
    match state.machine.get_scooter(id).await {
        Some(scooter) => json_response(StatusCode::OK, json!(scooter)),
        None => error_response(&ScootError::NotFound(id.to_string())),
    }
}

async fn create_scooter(state: &ApiState, id: &str) -> Response<Full<Bytes>> {
    // Fast-path validation; Apply defends against the race where a
    // concurrent CREATE for the same id wins an earlier slot.
    if state.machine.get_scooter(id).await.is_some() {
        return error_response(&ScootError::AlreadyExists(id.to_string()));
    }

    let cmd = ScooterCommand::Create {
        scooter_id: id.to_string(),
    };
    match state.commit_command(&cmd).await {
        Ok(()) => json_response(
            StatusCode::OK,
            json!({"status": "scooter created", "id": id}),
        ),
        Err(err) => error_response(&err),
    }
}

async fn reserve_scooter(state: &ApiState, id: &str, body: ReserveBody) -> Response<Full<Bytes>> {
    match state.machine.get_scooter(id).await {
        None => return error_response(&ScootError::NotFound(id.to_string())),
        Some(scooter) if !scooter.is_available => {
            return error_response(&ScootError::NotAvailable(id.to_string()));
        }
        Some(_) => {}
    }

    let cmd = ScooterCommand::Reserve {
        scooter_id: id.to_string(),
        reservation_id: body.reservation_id,
    };
    match state.commit_command(&cmd).await {
        Ok(()) => json_response(
            StatusCode::OK,
            json!({"status": "scooter reserved", "id": id}),
        ),
        Err(err) => error_response(&err),
    }
}

async fn release_scooter(state: &ApiState, id: &str, body: ReleaseBody) -> Response<Full<Bytes>> {
    if body.distance < 0 {
        return error_response(&ScootError::NegativeDistance(body.distance));
    }
    match state.machine.get_scooter(id).await {
        None => return error_response(&ScootError::NotFound(id.to_string())),
        Some(scooter) if scooter.is_available => {
            return error_response(&ScootError::NotReserved(id.to_string()));
        }
        Some(_) => {}
    }

    let cmd = ScooterCommand::Release {
        scooter_id: id.to_string(),
        distance: body.distance,
    };
    match state.commit_command(&cmd).await {
        Ok(()) => json_response(
            StatusCode::OK,
            json!({"status": "scooter released", "id": id}),
        ),
        Err(err) => error_response(&err),
    }
}

/// Capture a snapshot at the commit watermark and truncate the covered
/// log prefix.
async fn take_snapshot(state: &ApiState) -> Response<Full<Bytes>> {
    let index = state.log.commit_index().await;
    if let Err(err) = state.machine.take_snapshot(index).await {
        return error_response(&err);
    }
    state.log.purge(index).await;
    json_response(
        StatusCode::OK,
        json!({"status": "snapshot taken", "index": index}),
    )
}

async fn read_json<T, B>(body: B) -> Result<T, Response<Full<Bytes>>>
where
    T: for<'de> Deserialize<'de>,
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Err(json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("failed to read body: {err}")}),
            ));
        }
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("invalid body: {err}")}),
        )
    })
}

fn status_for(err: &ScootError) -> StatusCode {
    match err {
        ScootError::AlreadyExists(_)
        | ScootError::NotAvailable(_)
        | ScootError::NotReserved(_) => StatusCode::CONFLICT,
        ScootError::NotFound(_) => StatusCode::NOT_FOUND,
        ScootError::NegativeDistance(_) | ScootError::Codec(_) => StatusCode::BAD_REQUEST,
        ScootError::NoQuorum { .. }
        | ScootError::SlotContention { .. }
        | ScootError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ScootError) -> Response<Full<Bytes>> {
    json_response(status_for(err), json!({"error": err.to_string()}))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use hyper::Method;
    use scoot_consensus::Acceptor;

    use super::*;

    fn single_node_state() -> Arc<ApiState> {
        let machine = Arc::new(ScooterStateMachine::new());
        let log = Arc::new(ReplicatedLog::new());
        let acceptor = Arc::new(Acceptor::new(machine.clone(), log.clone()));
        let proposer = Arc::new(Proposer::new(1, Vec::new(), acceptor));
        Arc::new(ApiState {
            machine,
            log,
            proposer,
        })
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn send(
        state: &Arc<ApiState>,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = handle(state.clone(), request(method, uri, body)).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn create_then_read() {
        let state = single_node_state();

        let (status, _) = send(&state, Method::PUT, "/scooters/x", "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&state, Method::GET, "/scooters/x", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "x");
        assert_eq!(body["is_available"], true);
        assert_eq!(body["total_distance"], 0.0);
        assert_eq!(body["reservation_id"], "");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts_and_leaves_state_alone() {
        let state = single_node_state();
        send(&state, Method::PUT, "/scooters/x", "").await;

        let (status, body) = send(&state, Method::PUT, "/scooters/x", "").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already exists"));
        assert_eq!(state.machine.get_scooters().await.len(), 1);
    }

    #[tokio::test]
    async fn reserve_release_cycle() {
        let state = single_node_state();
        send(&state, Method::PUT, "/scooters/x", "").await;

        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/x/reservations",
            r#"{"reservation_id":"r1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&state, Method::GET, "/scooters/x", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_available"], false);
        assert_eq!(body["reservation_id"], "r1");

        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/x/releases",
            r#"{"distance":500}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&state, Method::GET, "/scooters/x", "").await;
        assert_eq!(body["is_available"], true);
        assert_eq!(body["total_distance"], 500.0);
        assert_eq!(body["reservation_id"], "");
    }

    #[tokio::test]
    async fn domain_errors_map_to_http_statuses() {
        let state = single_node_state();

        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/ghost/reservations",
            r#"{"reservation_id":"r1"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&state, Method::PUT, "/scooters/x", "").await;
        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/x/releases",
            r#"{"distance":10}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        send(
            &state,
            Method::POST,
            "/scooters/x/reservations",
            r#"{"reservation_id":"r1"}"#,
        )
        .await;
        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/x/reservations",
            r#"{"reservation_id":"r2"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &state,
            Method::POST,
            "/scooters/x/releases",
            r#"{"distance":-1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, Method::POST, "/scooters/x/releases", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn linearizable_list_inserts_a_noop_barrier() {
        let state = single_node_state();
        send(&state, Method::PUT, "/scooters/x", "").await;
        let slots_before = state.log.next_index().await;

        let (status, body) = send(&state, Method::GET, "/scooters?linearizable=true", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        // The barrier consumed one more slot than the write did.
        assert_eq!(state.log.next_index().await, slots_before + 1);

        let (status, body) = send(&state, Method::GET, "/scooters?linearizable=false", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_truncates_the_log_prefix() {
        let state = single_node_state();
        for id in ["a", "b", "c"] {
            send(&state, Method::PUT, &format!("/scooters/{id}"), "").await;
        }
        let commit = state.log.commit_index().await;
        assert_eq!(commit, 2);

        let (status, body) = send(&state, Method::POST, "/snapshot", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["index"], 2);

        assert!(state.log.entry(0).await.is_none());
        assert!(state.log.entry(commit).await.is_none());
        let (data, index) = state.machine.snapshot().await;
        assert_eq!(index, 2);
        assert!(!data.is_empty());

        // The snapshot reproduces the full map on a fresh machine.
        let restored = ScooterStateMachine::new();
        restored.load_snapshot(&data, index).await.unwrap();
        assert_eq!(
            restored.get_scooters().await,
            state.machine.get_scooters().await
        );
    }

    #[tokio::test]
    async fn unknown_routes_are_404() {
        let state = single_node_state();
        let (status, _) = send(&state, Method::GET, "/parked-bicycles", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, Method::DELETE, "/scooters/x", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
