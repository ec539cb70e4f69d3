#![forbid(unsafe_code)]
#![allow(dead_code)]

use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub(crate) fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("dkcm_http_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[cfg(unix)]
pub(crate) fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = std::fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) body: Value,
}

/// A running `dkcm_server` on a free local port. Killed on drop.
pub(crate) struct Server {
    child: Child,
    addr: String,
    storage_dir: PathBuf,
    cleanup_storage: bool,
}

impl Server {
    pub(crate) fn start(test_name: &str, provision_bin: &Path, extra_args: &[&str]) -> Self {
        Self::start_with_storage_dir(temp_dir(test_name), provision_bin, extra_args, true)
    }

    pub(crate) fn start_with_storage_dir(
        storage_dir: PathBuf,
        provision_bin: &Path,
        extra_args: &[&str],
        cleanup_storage: bool,
    ) -> Self {
        std::fs::create_dir_all(&storage_dir).expect("create storage dir");
        let mut child = Command::new(env!("CARGO_BIN_EXE_dkcm_server"))
            .env_remove("BOSKOS_HOST")
            .env_remove("DKCM_CLUSTER_CONFIG")
            .env_remove("DKCM_WORK_DIR")
            .env("RUST_LOG", "info")
            .arg("--storage-dir")
            .arg(&storage_dir)
            .args(["--bind", "127.0.0.1", "--port", "0"])
            .args(["--project-id", "proj-1"])
            .arg("--provision-bin")
            .arg(provision_bin)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn dkcm_server");

        let stdout = child.stdout.take().expect("stdout");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("read listening line");
        let addr = line
            .trim()
            .strip_prefix("listening on ")
            .unwrap_or_else(|| panic!("unexpected first line: {line:?}"))
            .to_string();

        Self {
            child,
            addr,
            storage_dir,
            cleanup_storage,
        }
    }

    pub(crate) fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Sends SIGTERM and waits for the process to exit on its own.
    #[cfg(unix)]
    pub(crate) fn terminate(&mut self, within: Duration) -> ExitStatus {
        let sent = Command::new("kill")
            .args(["-TERM", &self.child.id().to_string()])
            .status()
            .expect("run kill");
        assert!(sent.success(), "kill -TERM failed");

        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(started.elapsed() < within, "server ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub(crate) fn get(&self, path_and_query: &str) -> Response {
        self.send("GET", path_and_query, None)
    }

    pub(crate) fn post_form(&self, path: &str, form: &str) -> Response {
        self.send(
            "POST",
            path,
            Some(("application/x-www-form-urlencoded", form)),
        )
    }

    pub(crate) fn post_json(&self, path: &str, body: &Value) -> Response {
        let body = body.to_string();
        self.send("POST", path, Some(("application/json", &body)))
    }

    pub(crate) fn send(
        &self,
        method: &str,
        path_and_query: &str,
        body: Option<(&str, &str)>,
    ) -> Response {
        let mut stream = TcpStream::connect(&self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(40)))
            .expect("read timeout");

        let mut request = format!("{method} {path_and_query} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", self.addr);
        match body {
            Some((content_type, body)) => {
                request.push_str(&format!(
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                ));
            }
            None => request.push_str("Content-Length: 0\r\n\r\n"),
        }
        stream.write_all(request.as_bytes()).expect("write request");

        let mut raw = String::new();
        stream.read_to_string(&mut raw).expect("read response");
        let (head, body) = raw.split_once("\r\n\r\n").expect("response head");
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .expect("status code");
        let body = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body).expect("json body")
        };
        Response { status, body }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if self.cleanup_storage {
            let _ = std::fs::remove_dir_all(&self.storage_dir);
        }
    }
}
