#![forbid(unsafe_code)]

use dkcm_runner::ProvisionError;
use dkcm_server::{
    AllocatorConfig, ClusterProvisioner, LeaseAllocator, ProvisionRequest, ProvisionedCluster,
    RequestDefaults, StaticProjectPool, serve,
};
use dkcm_storage::SqliteStore;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("dkcm_serve_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

struct InstantProvisioner;

impl ClusterProvisioner for InstantProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedCluster, ProvisionError> {
        Ok(ProvisionedCluster {
            region: request.zone.clone(),
        })
    }
}

fn raw_request(addr: &str, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.write_all(request.as_bytes()).expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read");
    response
}

#[test]
fn serve_answers_until_shutdown_is_requested() {
    let store = SqliteStore::open(temp_dir("shutdown")).expect("open store");
    let allocator = LeaseAllocator::new(
        Arc::new(Mutex::new(store)),
        Arc::new(StaticProjectPool::new("proj-1")),
        Arc::new(InstantProvisioner),
        AllocatorConfig::default(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let shutdown = Arc::new(AtomicBool::new(false));
    let serving = {
        let allocator = allocator.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || serve(listener, allocator, RequestDefaults::default(), shutdown))
    };

    let health = raw_request(&addr, "GET /healthz HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(health.starts_with("HTTP/1.1 200 OK"), "{health}");

    let body = "owner_id=job-1&zone=europe-west1";
    let created = raw_request(
        &addr,
        &format!(
            "POST /request-cluster HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    );
    assert!(created.starts_with("HTTP/1.1 202 Accepted"), "{created}");
    assert!(created.contains("\"reused\":false"));

    shutdown.store(true, Ordering::Relaxed);
    serving.join().expect("join").expect("serve");
    allocator.wait_idle();

    let rows = allocator
        .list_leases(dkcm_storage::LeasesListRequest::default())
        .expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].zone, "europe-west1");
}
