//! Test doubles for the targetd daemon

use super::client::TargetdClient;
use super::types::Export;
use crate::config::TargetdOptions;
use crate::domain::ports::TargetdApi;
use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::Value;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

// =============================================================================
// In-memory daemon
// =============================================================================

/// One daemon operation as issued by the code under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateVolume { pool: String, name: String, size: u64 },
    DestroyVolume { pool: String, name: String },
    ListExports,
    CreateExport { pool: String, volume: String, initiator: String, lun: i32 },
    DestroyExport { pool: String, volume: String, initiator: String },
}

/// Error code targetd uses for a volume name that is already taken
pub(crate) const NAME_CONFLICT: i32 = -50;

/// Records every call and keeps volume and export tables like the real daemon
#[derive(Debug, Default)]
pub(crate) struct RecordingTargetd {
    volumes: Mutex<BTreeSet<(String, String)>>,
    exports: Mutex<Vec<Export>>,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<Vec<Call>>,
    failing_once: Mutex<Vec<Call>>,
}

impl RecordingTargetd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_luns(luns: &[i32]) -> Self {
        let exports = luns
            .iter()
            .enumerate()
            .map(|(i, lun)| export("vg-targetd", &format!("existing-{}", i), "iqn.2003-01.org.example:host", *lun))
            .collect();
        Self {
            exports: Mutex::new(exports),
            ..Default::default()
        }
    }

    /// Make `call` fail every time it is issued
    pub fn fail(self, call: Call) -> Self {
        self.failing.lock().unwrap().push(call);
        self
    }

    /// Make the next issue of `call` fail
    pub fn fail_once(self, call: Call) -> Self {
        self.failing_once.lock().unwrap().push(call);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn exports(&self) -> Vec<Export> {
        self.exports.lock().unwrap().clone()
    }

    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        self.volumes
            .lock()
            .unwrap()
            .contains(&(pool.to_string(), name.to_string()))
    }

    fn record(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call.clone());

        let mut once = self.failing_once.lock().unwrap();
        let fail_now = match once.iter().position(|c| *c == call) {
            Some(index) => {
                once.remove(index);
                true
            }
            None => self.failing.lock().unwrap().contains(&call),
        };
        if fail_now {
            return Err(Error::Rpc {
                code: -1,
                message: format!("injected failure for {:?}", call),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TargetdApi for RecordingTargetd {
    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        self.record(Call::CreateVolume {
            pool: pool.into(),
            name: name.into(),
            size,
        })?;
        if !self.volumes.lock().unwrap().insert((pool.into(), name.into())) {
            return Err(Error::Rpc {
                code: NAME_CONFLICT,
                message: format!("Name {} already exists", name),
            });
        }
        Ok(())
    }

    async fn destroy_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.record(Call::DestroyVolume {
            pool: pool.into(),
            name: name.into(),
        })?;
        self.volumes
            .lock()
            .unwrap()
            .remove(&(pool.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_exports(&self) -> Result<Vec<Export>> {
        self.record(Call::ListExports)?;
        Ok(self.exports())
    }

    async fn create_export(&self, pool: &str, volume: &str, initiator: &str, lun: i32) -> Result<()> {
        self.record(Call::CreateExport {
            pool: pool.into(),
            volume: volume.into(),
            initiator: initiator.into(),
            lun,
        })?;
        self.exports
            .lock()
            .unwrap()
            .push(export(pool, volume, initiator, lun));
        Ok(())
    }

    async fn destroy_export(&self, pool: &str, volume: &str, initiator: &str) -> Result<()> {
        self.record(Call::DestroyExport {
            pool: pool.into(),
            volume: volume.into(),
            initiator: initiator.into(),
        })?;
        self.exports
            .lock()
            .unwrap()
            .retain(|e| !(e.pool == pool && e.vol_name == volume && e.initiator_wwn == initiator));
        Ok(())
    }
}

pub(crate) fn export(pool: &str, volume: &str, initiator: &str, lun: i32) -> Export {
    Export {
        initiator_wwn: initiator.into(),
        lun,
        vol_name: volume.into(),
        vol_size: 1 << 30,
        vol_uuid: format!("uuid-{}", volume),
        pool: pool.into(),
    }
}

// =============================================================================
// HTTP daemon
// =============================================================================

/// A request as seen by the fake HTTP daemon
#[derive(Debug, Clone)]
pub(crate) struct Captured {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Value,
}

/// Serve one canned reply for every request and record what arrives
pub(crate) async fn fake_daemon(status: StatusCode, reply: Value) -> (SocketAddr, Arc<Mutex<Vec<Captured>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let reply = reply.to_string();

    let seen = captured.clone();
    let make_svc = make_service_fn(move |_conn| {
        let seen = seen.clone();
        let reply = reply.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let seen = seen.clone();
                let reply = reply.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let bytes = hyper::body::to_bytes(body).await?;
                    let header = |name: hyper::header::HeaderName| {
                        parts
                            .headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let request = Captured {
                        method: parts.method.to_string(),
                        path: parts.uri.path().to_string(),
                        authorization: header(hyper::header::AUTHORIZATION),
                        content_type: header(hyper::header::CONTENT_TYPE),
                        body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
                    };
                    seen.lock().unwrap().push(request);

                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(status)
                            .body(Body::from(reply))
                            .unwrap(),
                    )
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);

    (addr, captured)
}

pub(crate) fn client_for(addr: SocketAddr, strict_errors: bool) -> TargetdClient {
    TargetdClient::new(&TargetdOptions {
        insecure: true,
        address: addr.ip().to_string(),
        port: addr.port(),
        username: "admin".into(),
        password: "secret".into(),
        strict_errors,
    })
    .unwrap()
}
