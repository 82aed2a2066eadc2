//! Integration tests for the registry and the per-connection session
//! protocol, without sockets.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use svcreg_core::{Endpoint, ListFilter, PeerIdentity, ServiceFlags, ServiceName, Tag};
use svcreg_protocol::{ProtocolVersion, Request, Response};
use svcregd::registry::{ConnectionId, Registry};
use svcregd::server::{Action, Session};

// ============================================================================
// Test Helpers
// ============================================================================

const DAEMON_UID: u32 = 0;

fn session(id: u64, uid: u32, pid: u32, executable: &str) -> Session {
    let mut session = Session::new(ConnectionId(id), DAEMON_UID);
    session.authenticate(PeerIdentity::new(uid, pid, executable));
    session
}

fn svc(flags: &str, service: &str, endpoint: &str) -> Request {
    Request::Svc {
        flags: ServiceFlags::parse(flags).unwrap(),
        service: ServiceName::new(service).unwrap(),
        endpoint: Endpoint::parse(endpoint).unwrap(),
    }
}

fn reg(tag: &str) -> Request {
    Request::Reg {
        tag: Tag::new(tag).unwrap(),
    }
}

fn reply(session: &mut Session, registry: &Registry, request: Request) -> Response {
    match session.handle_request(request, registry) {
        Action::Reply(response) => response,
        Action::Reexec(version) => panic!("unexpected handoff request {version}"),
    }
}

fn endpoints(registry: &Registry, service: &str) -> Vec<String> {
    registry
        .list(&ListFilter::all().with_service(service))
        .iter()
        .map(|e| e.endpoint.to_string())
        .collect()
}

// ============================================================================
// Exclusivity
// ============================================================================

#[test]
fn test_exclusive_batch_blocks_later_registrations() {
    let registry = Registry::new();
    let mut first = session(1, 1000, 10, "/usr/sbin/mta");
    let mut second = session(2, 1000, 11, "/usr/sbin/other");

    assert_eq!(reply(&mut first, &registry, svc("X", "mail", "25")), Response::Ok);
    assert_eq!(reply(&mut first, &registry, svc("X", "mail", "26")), Response::Ok);
    assert_eq!(reply(&mut first, &registry, reg("T1")), Response::Registered);

    reply(&mut second, &registry, svc("-", "mail", "27"));
    assert_eq!(
        reply(&mut second, &registry, reg("T2")),
        Response::RegistrationFailed
    );
    assert_eq!(endpoints(&registry, "mail"), vec!["25", "26"]);
    assert!(second.pending().is_empty(), "pending batch cleared on failure");
}

#[test]
fn test_exclusivity_is_per_user() {
    let registry = Registry::new();
    let mut alice = session(1, 1000, 10, "");
    let mut bob = session(2, 1001, 11, "");

    reply(&mut alice, &registry, svc("X", "mail", "25"));
    assert_eq!(reply(&mut alice, &registry, reg("T")), Response::Registered);

    reply(&mut bob, &registry, svc("X", "mail", "2525"));
    assert_eq!(reply(&mut bob, &registry, reg("T")), Response::Registered);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_failed_batch_leaves_registry_untouched() {
    let registry = Registry::new();
    let mut holder = session(1, 1000, 10, "");
    reply(&mut holder, &registry, svc("X", "db", "5432"));
    reply(&mut holder, &registry, reg("T"));

    let mut other = session(2, 1000, 11, "");
    reply(&mut other, &registry, svc("-", "web", "80"));
    reply(&mut other, &registry, svc("-", "db", "5433"));
    assert_eq!(
        reply(&mut other, &registry, reg("T")),
        Response::RegistrationFailed
    );

    // All-or-nothing: the unrelated "web" entry was not inserted either.
    assert!(endpoints(&registry, "web").is_empty());
    assert_eq!(registry.len(), 1);
}

// Duplicates of a non-exclusive (service, user, endpoint) are accepted, so
// re-registering the same endpoint stays idempotent from the client's view.
#[test]
fn test_duplicate_non_exclusive_entries_are_allowed() {
    let registry = Registry::new();
    let mut session = session(1, 1000, 10, "");

    reply(&mut session, &registry, svc("-", "mail", "25"));
    reply(&mut session, &registry, reg("A"));
    reply(&mut session, &registry, svc("-", "mail", "25"));
    assert_eq!(reply(&mut session, &registry, reg("B")), Response::Registered);

    assert_eq!(endpoints(&registry, "mail"), vec!["25", "25"]);
}

// ============================================================================
// Executable Recording
// ============================================================================

#[test]
fn test_recycled_pid_clears_stale_executable() {
    let registry = Registry::new();
    let mut old = session(1, 1000, 77, "/usr/bin/old");
    reply(&mut old, &registry, svc("P", "alpha", "1000"));
    reply(&mut old, &registry, reg("T"));

    let mut new = session(2, 1000, 77, "/usr/bin/new");
    reply(&mut new, &registry, svc("P", "beta", "2000"));
    reply(&mut new, &registry, reg("T"));

    let rows = registry.list(&ListFilter::all().with_pid(77));
    let executables: Vec<&str> = rows.iter().map(|e| e.executable.as_str()).collect();
    assert_eq!(rows.len(), 2);
    assert!(executables.contains(&""));
    assert!(executables.contains(&"/usr/bin/new"));
    assert!(!executables.contains(&"/usr/bin/old"));
}

#[test]
fn test_executable_only_recorded_on_request() {
    let registry = Registry::new();
    let mut session = session(1, 1000, 10, "/usr/sbin/mta");
    reply(&mut session, &registry, svc("-", "mail", "25"));
    reply(&mut session, &registry, svc("P", "mail", "/run/mail.sock"));
    reply(&mut session, &registry, reg("T"));

    let rows = registry.list(&ListFilter::all());
    assert_eq!(rows[0].executable, "");
    assert_eq!(rows[1].executable, "/usr/sbin/mta");
}

// ============================================================================
// Tags and Cleanup
// ============================================================================

#[test]
fn test_drop_and_dereg_only_touch_own_tag() {
    let registry = Registry::new();
    let mut session = session(1, 1000, 10, "");

    reply(&mut session, &registry, svc("-", "mail", "25"));
    reply(&mut session, &registry, svc("-", "mail", "26"));
    reply(&mut session, &registry, reg("T1"));
    reply(&mut session, &registry, svc("-", "web", "80"));
    reply(&mut session, &registry, reg("T2"));

    let dereg = Request::Dereg {
        tag: Tag::new("T1").unwrap(),
        service: ServiceName::new("mail").unwrap(),
        endpoint: Endpoint::Port(26),
    };
    assert_eq!(reply(&mut session, &registry, dereg), Response::Ok);
    assert_eq!(endpoints(&registry, "mail"), vec!["25"]);

    // Wrong tag: nothing happens, still +Ok.
    let drop_unknown = Request::Drop {
        tag: Tag::new("T9").unwrap(),
    };
    assert_eq!(reply(&mut session, &registry, drop_unknown), Response::Ok);
    assert_eq!(registry.len(), 2);

    let drop_t2 = Request::Drop {
        tag: Tag::new("T2").unwrap(),
    };
    reply(&mut session, &registry, drop_t2);
    assert!(endpoints(&registry, "web").is_empty());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_other_connections_cannot_remove_entries() {
    let registry = Registry::new();
    let mut owner = session(1, 1000, 10, "");
    reply(&mut owner, &registry, svc("-", "mail", "25"));
    reply(&mut owner, &registry, reg("T1"));

    let mut intruder = session(2, 1000, 11, "");
    let drop_t1 = Request::Drop {
        tag: Tag::new("T1").unwrap(),
    };
    assert_eq!(reply(&mut intruder, &registry, drop_t1), Response::Ok);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_release_removes_everything_the_connection_owned() {
    let registry = Registry::new();
    let mut leaving = session(1, 1000, 10, "");
    let mut staying = session(2, 1000, 11, "");

    reply(&mut leaving, &registry, svc("-", "mail", "25"));
    reply(&mut leaving, &registry, reg("T1"));
    reply(&mut leaving, &registry, svc("-", "web", "80"));
    reply(&mut leaving, &registry, reg("T2"));
    reply(&mut staying, &registry, svc("-", "mail", "2525"));
    reply(&mut staying, &registry, reg("T1"));

    assert_eq!(registry.owned_by(ConnectionId(1)).len(), 2);
    assert_eq!(leaving.release(&registry), 2);
    assert_eq!(leaving.release(&registry), 0, "release runs once");

    assert!(registry.owned_by(ConnectionId(1)).is_empty());
    assert_eq!(endpoints(&registry, "mail"), vec!["2525"]);
}

// ============================================================================
// Privileges
// ============================================================================

#[test]
fn test_unauthenticated_session_is_denied() {
    let registry = Registry::new();
    let mut session = Session::new(ConnectionId(1), DAEMON_UID);
    assert_eq!(
        reply(&mut session, &registry, svc("-", "mail", "25")),
        Response::PermissionDenied
    );
    assert!(session.pending().is_empty());
}

#[test]
fn test_reexec_requires_daemon_uid_and_compatible_version() {
    let registry = Registry::new();

    let mut user = session(1, 1000, 10, "");
    let request = Request::Reexec {
        version: ProtocolVersion::CURRENT,
    };
    assert_eq!(
        user.handle_request(request.clone(), &registry),
        Action::Reply(Response::PermissionDenied)
    );

    let mut root = session(2, DAEMON_UID, 11, "");
    let too_new = Request::Reexec {
        version: ProtocolVersion::new(ProtocolVersion::CURRENT.major + 1, 0),
    };
    assert_eq!(
        root.handle_request(too_new, &registry),
        Action::Reply(Response::UnsupportedVersion)
    );
    assert_eq!(
        root.handle_request(request, &registry),
        Action::Reexec(ProtocolVersion::CURRENT)
    );
}

// ============================================================================
// Snapshot
// ============================================================================

#[test]
fn test_restore_keeps_handles_valid() {
    let registry = Registry::new();
    let mut session = session(1, 1000, 10, "");
    reply(&mut session, &registry, svc("-", "mail", "25"));
    reply(&mut session, &registry, reg("T1"));

    let successor = Registry::new();
    successor.restore(registry.snapshot());
    for keys in session.committed().values() {
        for key in keys {
            assert!(successor.contains(key));
        }
    }

    // New entries in the successor never reuse an inherited key.
    let mut newcomer = session_on(&successor);
    let inherited: Vec<_> = session.committed().values().flatten().cloned().collect();
    for key in newcomer.committed().values().flatten() {
        assert!(!inherited.contains(key));
    }
    newcomer.release(&successor);
    assert_eq!(successor.len(), 1);
}

fn session_on(registry: &Registry) -> Session {
    let mut session = session(9, 1000, 12, "");
    reply(&mut session, registry, svc("-", "mail", "26"));
    reply(&mut session, registry, reg("T1"));
    session
}
