#![forbid(unsafe_code)]

use crate::allocator::{AllocError, LeaseAllocator, LeaseGrant, LeaseRequest, LeaseView};
use crate::support::time::ts_ms_to_rfc3339;
use crate::wire::{HttpRequest, form_pairs, write_json};
use dkcm_core::LeaseStatus;
use dkcm_storage::{LeaseRow, LeasesListRequest};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_LIST_LIMIT: usize = 50;

const MSG_READY: &str = "Your cluster is ready!";
const MSG_PENDING: &str = "Your cluster isn't ready yet! Please check back later.";

/// Cluster shape used for request fields the caller leaves out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDefaults {
    pub zone: String,
    pub machine_type: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            zone: "us-west1".to_string(),
            machine_type: "e2-standard-4".to_string(),
            min_nodes: 1,
            max_nodes: 3,
        }
    }
}

/// Accepts until `shutdown` is set. Every connection gets its own thread.
pub fn serve(
    listener: TcpListener,
    allocator: LeaseAllocator,
    defaults: RequestDefaults,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    let defaults = Arc::new(defaults);
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let allocator = allocator.clone();
                let defaults = defaults.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &allocator, &defaults) {
                        debug!(%peer, error = %err, "connection ended with an error");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    allocator: &LeaseAllocator,
    defaults: &RequestDefaults,
) -> std::io::Result<()> {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let read = HttpRequest::read_from(&mut BufReader::new(&stream));
    let request = match read {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            return write_api_error(
                &mut stream,
                "400 Bad Request",
                "INVALID_REQUEST",
                &format!("malformed HTTP request: {err}"),
                None,
            );
        }
        Err(err) => return Err(err),
    };

    let path = request.path.as_str();
    let method = request.method.as_str();
    debug!(method, path, "request");

    let expected = match path {
        "/request-cluster" | "/createcluster" | "/clean-cluster" => "POST",
        "/get-cluster" | "/getcluster" | "/api/leases" | "/healthz" => "GET",
        _ => {
            return write_api_error(
                &mut stream,
                "404 Not Found",
                "NOT_FOUND",
                "Unknown path.",
                None,
            );
        }
    };
    if method != expected {
        return write_api_error(
            &mut stream,
            "405 Method Not Allowed",
            "METHOD_NOT_ALLOWED",
            &format!("{path} expects {expected}."),
            None,
        );
    }

    match path {
        "/request-cluster" | "/createcluster" => {
            handle_request_cluster(&mut stream, &request, allocator, defaults)
        }
        "/get-cluster" | "/getcluster" => handle_get_cluster(&mut stream, &request, allocator),
        "/clean-cluster" => handle_clean_cluster(&mut stream, &request, allocator),
        "/api/leases" => handle_list_leases(&mut stream, &request, allocator),
        _ => write_json(&mut stream, "200 OK", &json!({ "ok": true })),
    }
}

fn handle_request_cluster(
    stream: &mut TcpStream,
    request: &HttpRequest,
    allocator: &LeaseAllocator,
    defaults: &RequestDefaults,
) -> std::io::Result<()> {
    let lease_request = match request_fields(request)
        .and_then(|fields| lease_request_from_fields(&fields, defaults))
    {
        Ok(lease_request) => lease_request,
        Err(message) => {
            return write_api_error(stream, "400 Bad Request", "INVALID_REQUEST", &message, None);
        }
    };

    match allocator.request_lease(lease_request) {
        Ok(grant) => write_json(stream, "202 Accepted", &grant_json(&grant)),
        Err(err) => write_alloc_error(stream, &err),
    }
}

fn handle_get_cluster(
    stream: &mut TcpStream,
    request: &HttpRequest,
    allocator: &LeaseAllocator,
) -> std::io::Result<()> {
    let Some(token) = request.query("token") else {
        return write_api_error(
            stream,
            "400 Bad Request",
            "INVALID_REQUEST",
            "token is required.",
            Some("Pass the access_token returned by /request-cluster as ?token=."),
        );
    };
    let wait_s = match request.query("wait_s") {
        Some(raw) => match raw.parse::<u64>() {
            Ok(wait_s) => wait_s,
            Err(_) => {
                return write_api_error(
                    stream,
                    "400 Bad Request",
                    "INVALID_REQUEST",
                    "wait_s must be a whole number of seconds.",
                    None,
                );
            }
        },
        None => 0,
    };

    let view = if wait_s > 0 {
        allocator.wait_lease_status(token, Duration::from_secs(wait_s))
    } else {
        allocator.query_lease_status(token)
    };
    match view {
        Ok(view) => write_json(stream, "200 OK", &view_json(&view)),
        Err(err) => write_alloc_error(stream, &err),
    }
}

fn handle_clean_cluster(
    stream: &mut TcpStream,
    request: &HttpRequest,
    allocator: &LeaseAllocator,
) -> std::io::Result<()> {
    let token = request.query("token").map(str::to_string).or_else(|| {
        request_fields(request)
            .ok()
            .and_then(|mut fields| fields.remove("token"))
    });
    let Some(token) = token else {
        return write_api_error(
            stream,
            "400 Bad Request",
            "INVALID_REQUEST",
            "token is required.",
            None,
        );
    };

    match allocator.release_lease(&token) {
        Ok(outcome) => write_json(
            stream,
            "200 OK",
            &json!({
                "lease_id": outcome.lease_id,
                "released": true,
                "released_now": outcome.released_now,
            }),
        ),
        Err(err) => write_alloc_error(stream, &err),
    }
}

fn handle_list_leases(
    stream: &mut TcpStream,
    request: &HttpRequest,
    allocator: &LeaseAllocator,
) -> std::io::Result<()> {
    let status = match request.query("status") {
        Some(raw) => match LeaseStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return write_api_error(
                    stream,
                    "400 Bad Request",
                    "INVALID_REQUEST",
                    "status must be pending, ready or failed.",
                    None,
                );
            }
        },
        None => None,
    };
    let limit = request
        .query("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LIST_LIMIT);

    let listed = allocator.list_leases(LeasesListRequest {
        status,
        owner_id: request.query("owner_id").map(str::to_string),
        limit,
    });
    match listed {
        Ok(rows) => {
            let leases: Vec<Value> = rows.iter().map(lease_row_json).collect();
            write_json(stream, "200 OK", &json!({ "leases": leases }))
        }
        Err(err) => write_alloc_error(stream, &err),
    }
}

fn grant_json(grant: &LeaseGrant) -> Value {
    json!({
        "access_token": grant.access_token,
        "lease_id": grant.lease_id,
        "status": grant.status.as_str(),
        "reused": grant.reused,
    })
}

fn view_json(view: &LeaseView) -> Value {
    match view {
        LeaseView::Pending => json!({
            "status": "pending",
            "is_ready": false,
            "message": MSG_PENDING,
            "cluster_info": null,
        }),
        LeaseView::Ready {
            cluster_name,
            project_id,
            zone,
            region,
        } => json!({
            "status": "ready",
            "is_ready": true,
            "message": MSG_READY,
            "cluster_info": {
                "cluster_name": cluster_name,
                "project_id": project_id,
                "zone": zone,
                "region": region,
            },
        }),
        LeaseView::Failed { reason } => json!({
            "status": "failed",
            "is_ready": false,
            "message": format!("Cluster creation failed: {reason}"),
            "cluster_info": null,
        }),
    }
}

// The access token is a credential and never leaves through the listing.
fn lease_row_json(row: &LeaseRow) -> Value {
    json!({
        "lease_id": row.lease_id,
        "owner_id": row.owner_id,
        "status": row.status.as_str(),
        "zone": row.zone,
        "region": row.region,
        "cluster_name": row.cluster_name,
        "project_id": row.backing_project_id,
        "machine_type": row.machine_type,
        "min_nodes": row.min_nodes,
        "max_nodes": row.max_nodes,
        "failure_reason": row.failure_reason,
        "created_at": ts_ms_to_rfc3339(row.created_at_ms),
        "updated_at": ts_ms_to_rfc3339(row.updated_at_ms),
        "deadline": row.deadline_ms.map(ts_ms_to_rfc3339),
        "released_at": row.released_at_ms.map(ts_ms_to_rfc3339),
    })
}

fn write_alloc_error(stream: &mut TcpStream, err: &AllocError) -> std::io::Result<()> {
    let (status, recovery) = match err {
        AllocError::StoreUnavailable(_) => ("503 Service Unavailable", Some("Retry later.")),
        AllocError::IdExhaustion { .. } => ("500 Internal Server Error", Some("Retry the request.")),
        AllocError::InvalidToken => (
            "404 Not Found",
            Some("Use the access_token returned by /request-cluster."),
        ),
        AllocError::InvalidRequest(_) => ("400 Bad Request", None),
        AllocError::LeaseBusy { .. } => (
            "409 Conflict",
            Some("Wait until the cluster is ready or failed, then release it."),
        ),
        AllocError::Pool(_) => ("502 Bad Gateway", Some("Retry later.")),
        AllocError::ShuttingDown => (
            "503 Service Unavailable",
            Some("Retry against the restarted service."),
        ),
    };
    if status.starts_with('5') {
        warn!(code = err.code(), error = %err, "request failed");
    } else {
        info!(code = err.code(), error = %err, "request rejected");
    }
    write_api_error(stream, status, err.code(), &err.to_string(), recovery)
}

fn request_fields(request: &HttpRequest) -> Result<HashMap<String, String>, String> {
    if request.has_json_body() {
        let payload: Value =
            serde_json::from_slice(&request.body).map_err(|err| format!("invalid JSON: {err}"))?;
        let Value::Object(map) = payload else {
            return Err("JSON body must be an object.".to_string());
        };
        let mut fields = HashMap::new();
        for (name, value) in map {
            let value = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => continue,
                _ => return Err(format!("{name} must be a string or a number.")),
            };
            fields.insert(name, value);
        }
        return Ok(fields);
    }

    let body = std::str::from_utf8(&request.body).map_err(|_| "body must be UTF-8.".to_string())?;
    Ok(form_pairs(body).collect())
}

fn first_field<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| fields.get(*name))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_count(name: &str, raw: Option<&str>) -> Result<Option<u32>, String> {
    raw.map(|raw| {
        raw.parse::<u32>()
            .map_err(|_| format!("{name} must be a positive whole number."))
    })
    .transpose()
}

fn lease_request_from_fields(
    fields: &HashMap<String, String>,
    defaults: &RequestDefaults,
) -> Result<LeaseRequest, String> {
    let owner_id = first_field(fields, &["owner_id", "prowjobid", "prowid"])
        .ok_or_else(|| "owner_id is required.".to_string())?;

    let nodes = parse_count("nodes", first_field(fields, &["nodes"]))?;
    let min = parse_count("min_nodes", first_field(fields, &["min_nodes", "minNodes"]))?;
    let max = parse_count("max_nodes", first_field(fields, &["max_nodes", "maxNodes"]))?;
    let (min_nodes, max_nodes) = match (min.or(nodes), max.or(nodes)) {
        (Some(min), Some(max)) => (min, max),
        (Some(min), None) => (min, defaults.max_nodes.max(min)),
        (None, Some(max)) => (defaults.min_nodes.min(max), max),
        (None, None) => (defaults.min_nodes, defaults.max_nodes),
    };

    let timeout = first_field(fields, &["timeout_s"])
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| "timeout_s must be a whole number of seconds.".to_string())
        })
        .transpose()?
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    Ok(LeaseRequest {
        owner_id: owner_id.to_string(),
        zone: first_field(fields, &["zone"])
            .unwrap_or(defaults.zone.as_str())
            .to_string(),
        min_nodes,
        max_nodes,
        machine_type: first_field(fields, &["machine_type", "nodeType"])
            .unwrap_or(defaults.machine_type.as_str())
            .to_string(),
        timeout,
    })
}

fn write_api_error(
    stream: &mut TcpStream,
    status: &str,
    code: &str,
    message: &str,
    recovery: Option<&str>,
) -> std::io::Result<()> {
    let body = json!({
        "error": {
            "code": code,
            "message": message,
            "recovery": recovery,
        }
    });
    write_json(stream, status, &body)
}
