//! ZAP (ZeroMQ Authentication Protocol) handler.
//!
//! libzmq calls back into an application-supplied REP socket bound at
//! `inproc://zeromq.zap.01` during every CURVE handshake. The overlay
//! authorizes a connecting child iff its CURVE public key is in the
//! allowlist populated by bootstrap (§5's "ZAP allowlist is mutated only
//! from the bootstrap code... or additively for late-joining FLUB peers").
//!
//! This runs on a dedicated OS thread since libzmq's ZAP contract is a
//! blocking request/reply loop, not an async one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Every broker in a Flux instance shares this ZAP domain.
pub const ZAP_DOMAIN: &str = "flux";

const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

/// Shared allowlist of authorized CURVE public keys (Z85-encoded).
#[derive(Clone, Default)]
pub struct Allowlist(Arc<Mutex<HashSet<String>>>);

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authorize(&self, public_key_z85: impl Into<String>) {
        self.0.lock().unwrap().insert(public_key_z85.into());
    }

    pub fn revoke(&self, public_key_z85: &str) {
        self.0.lock().unwrap().remove(public_key_z85);
    }

    pub fn contains(&self, public_key_z85: &str) -> bool {
        self.0.lock().unwrap().contains(public_key_z85)
    }
}

/// Spawn the ZAP handler thread. The returned socket must be dropped (or
/// the context terminated) to stop the loop; `ctx` must be the same
/// context the overlay's ROUTER socket binds on.
pub fn spawn(ctx: &zmq::Context, allowlist: Allowlist) -> Result<JoinHandle<()>, zmq::Error> {
    let socket = ctx.socket(zmq::REP)?;
    socket.bind(ZAP_ENDPOINT)?;

    Ok(std::thread::spawn(move || loop {
        let parts = match socket.recv_multipart(0) {
            Ok(p) => p,
            Err(_) => break,
        };
        let Some(reply) = handle_request(&parts, &allowlist) else {
            continue;
        };
        if socket.send_multipart(reply, 0).is_err() {
            break;
        }
    }))
}

fn handle_request(parts: &[Vec<u8>], allowlist: &Allowlist) -> Option<Vec<Vec<u8>>> {
    // [version, request_id, domain, address, identity, mechanism, creds...]
    if parts.len() < 6 {
        return None;
    }
    let version = parts[0].clone();
    let request_id = parts[1].clone();
    let domain = String::from_utf8_lossy(&parts[2]).to_string();
    let mechanism = String::from_utf8_lossy(&parts[5]).to_string();

    let (status_code, status_text, user_id) = if domain != ZAP_DOMAIN {
        (b"400".to_vec(), b"unknown domain".to_vec(), Vec::new())
    } else if mechanism != "CURVE" {
        (b"400".to_vec(), b"unsupported mechanism".to_vec(), Vec::new())
    } else {
        let client_key_bin = parts.get(6).cloned().unwrap_or_default();
        let client_key_z85 = zmq::z85_encode(&client_key_bin).unwrap_or_default();
        if allowlist.contains(&client_key_z85) {
            (b"200".to_vec(), b"OK".to_vec(), client_key_z85.into_bytes())
        } else {
            (b"400".to_vec(), b"unauthorized key".to_vec(), Vec::new())
        }
    };

    Some(vec![
        version,
        request_id,
        status_code,
        status_text,
        user_id,
        Vec::new(), // metadata
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_authorize_and_revoke() {
        let list = Allowlist::new();
        assert!(!list.contains("abc"));
        list.authorize("abc");
        assert!(list.contains("abc"));
        list.revoke("abc");
        assert!(!list.contains("abc"));
    }

    #[test]
    fn wrong_domain_is_denied() {
        let list = Allowlist::new();
        let req = vec![
            b"1.0".to_vec(),
            b"req-1".to_vec(),
            b"other-domain".to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            b"CURVE".to_vec(),
            vec![0u8; 32],
        ];
        let reply = handle_request(&req, &list).unwrap();
        assert_eq!(reply[2], b"400");
    }

    #[test]
    fn authorized_curve_key_is_accepted() {
        let list = Allowlist::new();
        let (public, _secret) = zmq::curve_keypair().unwrap();
        list.authorize(&public);
        let public_bin = zmq::z85_decode(&public).unwrap();

        let req = vec![
            b"1.0".to_vec(),
            b"req-2".to_vec(),
            ZAP_DOMAIN.as_bytes().to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            b"CURVE".to_vec(),
            public_bin,
        ];
        let reply = handle_request(&req, &list).unwrap();
        assert_eq!(reply[2], b"200");
        assert_eq!(reply[4], public.into_bytes());
    }

    #[test]
    fn unauthorized_curve_key_is_rejected() {
        let list = Allowlist::new();
        let (_public, _secret) = zmq::curve_keypair().unwrap();
        let (other_public, _) = zmq::curve_keypair().unwrap();
        let other_bin = zmq::z85_decode(&other_public).unwrap();

        let req = vec![
            b"1.0".to_vec(),
            b"req-3".to_vec(),
            ZAP_DOMAIN.as_bytes().to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            b"CURVE".to_vec(),
            other_bin,
        ];
        let reply = handle_request(&req, &list).unwrap();
        assert_eq!(reply[2], b"400");
    }
}
