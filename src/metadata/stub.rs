//! In-memory metadata service for tests.
//!
//! Holds principals in a map, records every call, and can be told to fail
//! selected operations. A handful of pre-seeded principals cover the
//! reconciliation starting points: `empty`, `iponly`, `portonly`,
//! `stmtonly`, `linkonly` and `regular`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{EndorsedStatement, IpAlias, MetadataApi, Principal};
use crate::error::{Error, Result};
use crate::types::Protocol;

pub const STUB_PUBLIC_IP: &str = "192.168.0.1";
pub const STUB_LOCAL_IP: &str = "172.16.0.1";
pub const STUB_LOCAL_NS: &str = "localns";

const MUTATIONS: &[&str] = &[
    "create_principal",
    "delete_principal",
    "create_ip_alias",
    "delete_ip_alias",
    "create_port_alias",
    "delete_port_alias",
    "post_proof",
    "post_proof_for_child",
    "link_proof",
    "link_proof_for_child",
    "create_ns",
    "join_ns",
    "leave_ns",
    "delete_ns",
];

#[derive(Default)]
struct StubState {
    principals: HashMap<String, Principal>,
    proofs: HashMap<String, Vec<String>>,
    namespaces: BTreeSet<String>,
    calls: Vec<(String, String)>,
    failing: HashSet<String>,
    holds: HashMap<String, Arc<Notify>>,
    waiting: HashMap<String, usize>,
}

#[derive(Default)]
pub struct StubMetadataApi {
    state: Mutex<StubState>,
}

fn fixture(json: &str) -> Principal {
    serde_json::from_str(json).expect("fixture principal")
}

const PORTS_JSON: &str = r#"[
    {"ns_name": "default", "ip": "192.168.0.1",
     "ports": {"tcp": [[1000, 2000], [7077, 7077], [8088, 8088]],
               "udp": [[1000, 2000], [7077, 7077], [8088, 8088]]}},
    {"ns_name": "localns", "ip": "172.16.0.1",
     "ports": {"tcp": [[1000, 2000], [7077, 7077], [8088, 8088]],
               "udp": [[1000, 2000], [7077, 7077], [8088, 8088]]}}
]"#;

const REGULAR_FACT: &str = r#"containerFact(\"regular\", \"image-1\")"#;

/// The principal `regular` converges to: overlay IP alias, exposed ports
/// 7077/8088 plus static range 1000-2000 on both instance identities, image
/// link and container fact.
pub fn regular_principal() -> Principal {
    fixture(&format!(
        r#"{{"alias": {{"ips": [{{"ns_name": "overlay", "ip": "10.0.0.1"}}], "ports": {}}},
            "links": ["image-1"],
            "statements": [{{"endorser": "self", "fact": "{}"}}]}}"#,
        PORTS_JSON, REGULAR_FACT
    ))
}

fn seeded() -> HashMap<String, Principal> {
    let mut map = HashMap::new();
    map.insert("empty".to_string(), Principal::new());
    map.insert(
        "iponly".to_string(),
        fixture(r#"{"alias": {"ips": [{"ns_name": "overlay", "ip": "10.0.0.1"}]}}"#),
    );
    map.insert(
        "portonly".to_string(),
        fixture(&format!(r#"{{"alias": {{"ports": {}}}}}"#, PORTS_JSON)),
    );
    map.insert(
        "stmtonly".to_string(),
        fixture(&format!(
            r#"{{"statements": [{{"endorser": "self", "fact": "{}"}}]}}"#,
            REGULAR_FACT
        )),
    );
    map.insert(
        "linkonly".to_string(),
        fixture(r#"{"links": ["image-1"]}"#),
    );
    map.insert("regular".to_string(), regular_principal());
    map
}

impl StubMetadataApi {
    /// A service pre-seeded with the fixture principals.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                principals: seeded(),
                ..StubState::default()
            }),
        }
    }

    /// A service holding no principals.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn insert_principal(&self, id: &str, principal: Principal) {
        self.state
            .lock()
            .unwrap()
            .principals
            .insert(id.to_string(), principal);
    }

    /// Park every later `op` call until the returned handle is notified.
    pub fn hold(&self, op: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .holds
            .insert(op.to_string(), notify.clone());
        notify
    }

    /// Number of `op` calls that reached a hold.
    pub fn waiting(&self, op: &str) -> usize {
        self.state.lock().unwrap().waiting.get(op).copied().unwrap_or(0)
    }

    async fn pass_hold(&self, op: &str) {
        let hold = {
            let mut state = self.state.lock().unwrap();
            let hold = state.holds.get(op).cloned();
            if hold.is_some() {
                *state.waiting.entry(op.to_string()).or_default() += 1;
            }
            hold
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }
    }

    pub fn principal(&self, id: &str) -> Option<Principal> {
        self.state.lock().unwrap().principals.get(id).cloned()
    }

    pub fn principal_ids(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .principals
            .keys()
            .cloned()
            .collect()
    }

    pub fn proofs(&self, id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .proofs
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().namespaces.clone()
    }

    /// Number of calls made to `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(name, _)| name == op)
            .count()
    }

    /// Arguments of every call made to `op`, in order.
    pub fn call_args(&self, op: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(name, _)| name == op)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Number of calls that would change remote state.
    pub fn mutations(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(name, _)| MUTATIONS.contains(&name.as_str()))
            .count()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Record the call and run `f` unless the operation is set to fail.
    fn call<T>(
        &self,
        op: &str,
        args: String,
        f: impl FnOnce(&mut StubState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((op.to_string(), args));
        if state.failing.contains(op) {
            return Err(Error::Metadata(format!("injected failure in {}", op)));
        }
        f(&mut *state)
    }
}

fn principal_mut<'a>(state: &'a mut StubState, id: &str) -> Result<&'a mut Principal> {
    state
        .principals
        .get_mut(id)
        .ok_or_else(|| Error::Metadata(format!("can not find principal {}", id)))
}

#[async_trait]
impl MetadataApi for StubMetadataApi {
    async fn create_principal(&self, id: &str) -> Result<()> {
        self.call("create_principal", id.to_string(), |s| {
            if s.principals.contains_key(id) {
                return Err(Error::Metadata(format!("principal {} exists", id)));
            }
            s.principals.insert(id.to_string(), Principal::new());
            Ok(())
        })
    }

    async fn delete_principal(&self, id: &str) -> Result<()> {
        self.call("delete_principal", id.to_string(), |s| {
            s.principals
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::Metadata(format!("can not delete {}", id)))
        })
    }

    async fn list_principals(&self) -> Result<Vec<String>> {
        self.call("list_principals", String::new(), |s| {
            Ok(s.principals.keys().cloned().collect())
        })
    }

    async fn show_principal(&self, id: &str) -> Result<Principal> {
        self.call("show_principal", id.to_string(), |s| {
            s.principals
                .get(id)
                .cloned()
                .ok_or_else(|| Error::PrincipalNotFound(id.to_string()))
        })
    }

    async fn create_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()> {
        self.call("create_ip_alias", format!("{} {} {}", id, ns, ip), |s| {
            let p = principal_mut(s, id)?;
            let ip = ip.to_string();
            if p.has_ip_alias(ns, &ip) {
                return Err(Error::Metadata(format!("ip alias {} {} exists", ns, ip)));
            }
            p.aliases.ips.push(IpAlias::new(ns, ip));
            Ok(())
        })
    }

    async fn delete_ip_alias(&self, id: &str, ns: &str, ip: IpAddr) -> Result<()> {
        self.call("delete_ip_alias", format!("{} {} {}", id, ns, ip), |s| {
            let p = principal_mut(s, id)?;
            let ip = ip.to_string();
            let idx = p
                .aliases
                .ips
                .iter()
                .position(|a| a.ns_name == ns && a.ip == ip)
                .ok_or_else(|| Error::Metadata(format!("no ip alias {} {}", ns, ip)))?;
            p.aliases.ips.remove(idx);
            Ok(())
        })
    }

    async fn create_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        let args = format!("{} {} {} {} {} {}", id, ns, ip, protocol, min, max);
        self.call("create_port_alias", args, |s| {
            principal_mut(s, id)?.add_port_alias(ns, &ip.to_string(), protocol, min, max)
        })
    }

    async fn delete_port_alias(
        &self,
        id: &str,
        ns: &str,
        ip: IpAddr,
        protocol: Protocol,
        min: u16,
        max: u16,
    ) -> Result<()> {
        let args = format!("{} {} {} {} {} {}", id, ns, ip, protocol, min, max);
        self.call("delete_port_alias", args, |s| {
            principal_mut(s, id)?.del_port_alias(ns, &ip.to_string(), protocol, min, max)
        })
    }

    async fn post_proof(&self, id: &str, statements: &[String]) -> Result<()> {
        self.pass_hold("post_proof").await;
        self.call("post_proof", format!("{} {:?}", id, statements), |s| {
            s.proofs
                .entry(id.to_string())
                .or_default()
                .extend(statements.iter().cloned());
            Ok(())
        })
    }

    async fn post_proof_for_child(&self, id: &str, statements: &[String]) -> Result<()> {
        self.call(
            "post_proof_for_child",
            format!("{} {:?}", id, statements),
            |s| {
                let p = principal_mut(s, id)?;
                p.statements
                    .extend(statements.iter().map(|fact| EndorsedStatement {
                        endorser: String::new(),
                        fact: fact.clone(),
                    }));
                Ok(())
            },
        )
    }

    async fn link_proof(&self, id: &str, deps: &[String]) -> Result<()> {
        self.call("link_proof", format!("{} {:?}", id, deps), |s| {
            principal_mut(s, id)?.links.extend(deps.iter().cloned());
            Ok(())
        })
    }

    async fn link_proof_for_child(&self, id: &str, deps: &[String]) -> Result<()> {
        self.call("link_proof_for_child", format!("{} {:?}", id, deps), |s| {
            principal_mut(s, id)?.links.extend(deps.iter().cloned());
            Ok(())
        })
    }

    async fn create_ns(&self, ns: &str) -> Result<()> {
        self.call("create_ns", ns.to_string(), |_| Ok(()))
    }

    async fn join_ns(&self, ns: &str) -> Result<()> {
        self.call("join_ns", ns.to_string(), |s| {
            s.namespaces.insert(ns.to_string());
            Ok(())
        })
    }

    async fn leave_ns(&self, ns: &str) -> Result<()> {
        self.call("leave_ns", ns.to_string(), |s| {
            s.namespaces.remove(ns);
            Ok(())
        })
    }

    async fn delete_ns(&self, ns: &str) -> Result<()> {
        self.call("delete_ns", ns.to_string(), |_| Ok(()))
    }

    async fn my_public_ip(&self) -> Result<String> {
        self.call("my_public_ip", String::new(), |_| Ok(STUB_PUBLIC_IP.to_string()))
    }

    async fn my_local_ip(&self) -> Result<String> {
        self.call("my_local_ip", String::new(), |_| Ok(STUB_LOCAL_IP.to_string()))
    }

    async fn my_ns(&self) -> Result<String> {
        self.call("my_ns", String::new(), |_| Ok(STUB_LOCAL_NS.to_string()))
    }
}
