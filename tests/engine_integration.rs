//! Cross-module integration tests exercising the public `Engine` API
//! surface. A live SSH session needs a real server to authenticate
//! against, so these focus on the parts of Connect→Add→Start→Status that
//! don't require one: validation, port reservation, and identity
//! handling across `model`, `registry`, and `port_guard` together.

use tunnel_engine::model::forwarding::{ForwardConfig, ForwardingKind, ForwardingRule};
use tunnel_engine::Engine;

fn rule(kind: ForwardingKind, bind_port: u16) -> ForwardingRule {
    ForwardingRule {
        kind,
        local_host: "127.0.0.1".into(),
        local_port: bind_port,
        remote_host: "example.internal".into(),
        remote_port: 80,
        bind_host: "127.0.0.1".into(),
        bind_port,
        internal_host: "10.0.0.5".into(),
        internal_port: 8000,
        active: true,
    }
}

#[tokio::test]
async fn local_and_dynamic_forwarders_cannot_share_a_bind_port() {
    let engine = Engine::new();
    let local = ForwardConfig::try_from(&rule(ForwardingKind::Local, 28080)).unwrap();
    engine.add_forwarder(local, "host:22:user").await.unwrap();

    let dynamic = ForwardConfig::try_from(&rule(ForwardingKind::Dynamic, 28080)).unwrap();
    let result = engine.add_forwarder(dynamic, "host:22:user").await;
    assert!(result.is_err(), "a different kind on the same port should be rejected by the port guard");
}

#[tokio::test]
async fn two_remote_forwarders_may_request_the_same_port() {
    // RemoteForwarder never binds locally, so the port guard does not apply.
    let engine = Engine::new();
    let remote_a = ForwardConfig::try_from(&rule(ForwardingKind::Remote, 28081)).unwrap();
    let remote_b = ForwardConfig::try_from(&rule(ForwardingKind::Remote, 28081)).unwrap();
    engine.add_forwarder(remote_a, "host-a:22:user").await.unwrap();
    engine.add_forwarder(remote_b, "host-b:22:user").await.unwrap();
}

#[tokio::test]
async fn status_reports_stopped_forwarder_with_zero_traffic() {
    let engine = Engine::new();
    let config = ForwardConfig::try_from(&rule(ForwardingKind::Local, 28082)).unwrap();
    let identity = engine.add_forwarder(config, "host:22:user").await.unwrap();

    let status = engine.forwarders.status(&identity).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.bytes_sent, 0);
    assert_eq!(status.bytes_received, 0);
    assert_eq!(status.kind, ForwardingKind::Local);
}

#[tokio::test]
async fn removing_a_forwarder_frees_its_reserved_port() {
    let engine = Engine::new();
    let config = ForwardConfig::try_from(&rule(ForwardingKind::Local, 28083)).unwrap();
    let identity = engine.add_forwarder(config, "host:22:user").await.unwrap();
    engine.forwarders.remove(&identity).await.unwrap();

    let reused = ForwardConfig::try_from(&rule(ForwardingKind::Dynamic, 28083)).unwrap();
    engine.add_forwarder(reused, "host:22:user").await.unwrap();
}

#[tokio::test]
async fn disconnecting_a_session_tears_down_its_forwarders_but_not_others() {
    let engine = Engine::new();
    let owned = ForwardConfig::try_from(&rule(ForwardingKind::Local, 28084)).unwrap();
    let other = ForwardConfig::try_from(&rule(ForwardingKind::Local, 28085)).unwrap();
    let owned_id = engine.add_forwarder(owned, "a:22:user").await.unwrap();
    let other_id = engine.add_forwarder(other, "b:22:user").await.unwrap();

    engine.disconnect_session("a:22:user").await;

    assert!(engine.forwarders.status(&owned_id).await.is_err());
    assert!(engine.forwarders.status(&other_id).await.is_ok());
}
