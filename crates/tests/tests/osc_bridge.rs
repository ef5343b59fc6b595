//! OSC bridge over real UDP sockets
//!
//! A `Peer` plays the remote side: a client when the bridge is the server,
//! the server when the bridge is a client.

use soundscape_core::domain::{
    AudioOrigin, MessageLevel, NewSource, OscConfig, OscMode, Position, QueryLoop, Renderer,
    SourceId,
};
use soundscape_infra::osc::{OscHandler, OscMessage, OscType};
use soundscape_tests::{loopback, Peer, Rig};
use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(250);
const LIMIT: Duration = Duration::from_secs(2);

fn server_config(clients: Vec<String>) -> OscConfig {
    OscConfig {
        mode: OscMode::Server,
        port: 0,
        clients,
        poll_interval_ms: 50,
        ..Default::default()
    }
}

fn client_config() -> OscConfig {
    OscConfig {
        mode: OscMode::Client,
        port: 0,
        ..Default::default()
    }
}

fn paths(messages: &[(std::net::SocketAddr, OscMessage)]) -> Vec<&str> {
    messages.iter().map(|(_, m)| m.path.as_str()).collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// SERVER ROLE
// ============================================================================

#[tokio::test]
async fn test_new_source_is_announced_once() {
    let rig = Rig::idle();
    let client = Peer::bind().await;
    let handler = OscHandler::start(rig.publisher.clone(), &server_config(vec![client.addr().to_string()]))
        .await
        .unwrap();
    client.collect(WINDOW).await;

    {
        let mut control = rig.publisher.take_control();
        control
            .new_source(
                NewSource::new("voice", AudioOrigin::input("3")).at(Position::new(1.0, 2.0)),
            )
            .unwrap();
    }

    let received = client.collect(WINDOW).await;
    let announced: Vec<_> = received
        .iter()
        .filter(|(_, m)| m.path == "/source/new")
        .collect();
    assert_eq!(announced.len(), 1, "{:?}", paths(&received));

    let message = &announced[0].1;
    assert_eq!(message.tags(), "isssiffFfFfFs");
    assert_eq!(message.args[0], OscType::Int(1));
    assert_eq!(message.args[1], OscType::String("voice".to_string()));
    assert_eq!(message.args[3], OscType::String("system:capture_3".to_string()));
    assert_eq!(message.args[5], OscType::Float(1.0));
    assert_eq!(message.args[6], OscType::Float(2.0));
    // no field of the source went out on its own before the announcement
    assert!(!paths(&received).contains(&"/source/position"));

    handler.stop().await;
}

#[tokio::test]
async fn test_changes_reach_configured_client() {
    let rig = Rig::idle();
    let client = Peer::bind().await;
    let handler = OscHandler::start(rig.publisher.clone(), &server_config(vec![client.addr().to_string()]))
        .await
        .unwrap();

    let id = {
        let mut control = rig.publisher.take_control();
        control
            .new_source(NewSource::new("a", AudioOrigin::input("1")))
            .unwrap()
    };
    client.collect(WINDOW).await;

    rig.publisher
        .take_control()
        .set_source_position(&id, Position::new(-1.0, 0.5))
        .unwrap();

    let (_, message) = client.expect("/source/position", LIMIT).await.unwrap();
    assert_eq!(
        message.args,
        vec![OscType::Int(1), OscType::Float(-1.0), OscType::Float(0.5)]
    );

    rig.publisher.take_control().delete_source(&id);
    let (_, message) = client.expect("/source/delete", LIMIT).await.unwrap();
    assert_eq!(message.args, vec![OscType::Int(1)]);

    handler.stop().await;
}

#[tokio::test]
async fn test_server_polls_and_learns_clients() {
    let rig = Rig::idle();
    let configured = Peer::bind().await;
    let handler = OscHandler::start(
        rig.publisher.clone(),
        &server_config(vec![configured.addr().to_string()]),
    )
    .await
    .unwrap();
    assert!(configured.expect("/poll", LIMIT).await.is_some());

    let learned = Peer::bind().await;
    learned
        .send(&OscMessage::new("/alive", Vec::new()), loopback(handler.local_addr()))
        .await;
    assert!(wait_for(|| handler.targets().contains(&learned.addr())).await);

    rig.publisher.take_control().set_decay_exponent(1.5);
    let (_, message) = learned.expect("/scene/decay_exponent", LIMIT).await.unwrap();
    assert_eq!(message.args, vec![OscType::Float(1.5)]);

    handler.stop().await;
}

#[tokio::test]
async fn test_server_ignores_client_updates() {
    let rig = Rig::idle();
    let client = Peer::bind().await;
    let handler = OscHandler::start(rig.publisher.clone(), &server_config(Vec::new()))
        .await
        .unwrap();
    let target = loopback(handler.local_addr());

    client
        .send(&OscMessage::new("/update/scene/volume", vec![OscType::Float(-20.0)]), target)
        .await;
    client
        .send(&OscMessage::new("/scene/decay_exponent", vec![OscType::Float(2.0)]), target)
        .await;

    let scene = rig.publisher.scene().clone();
    assert!(wait_for(|| scene.get_decay_exponent() == 2.0).await);
    assert_eq!(scene.get_master_volume(), 1.0);
    // the update still counted as a sign of life
    assert!(handler.targets().contains(&client.addr()));

    handler.stop().await;
}

#[tokio::test]
async fn test_metering_only_reaches_clients_that_ask() {
    let rig = Rig::running();
    let thin = Peer::bind().await;
    let full = Peer::bind().await;
    let handler = OscHandler::start(
        rig.publisher.clone(),
        &server_config(vec![thin.addr().to_string(), full.addr().to_string()]),
    )
    .await
    .unwrap();
    assert_eq!(handler.message_level(thin.addr()), Some(MessageLevel::ThinClient));

    full.send(
        &OscMessage::new("/message_level", vec![2i32.into()]),
        loopback(handler.local_addr()),
    )
    .await;
    assert!(wait_for(|| handler.message_level(full.addr()) == Some(MessageLevel::Client)).await);

    {
        let mut control = rig.publisher.take_control();
        control.start_processing();
        control
            .new_source(NewSource::new("hum", AudioOrigin::input("1")).at(Position::new(0.0, 2.0)))
            .unwrap();
    }
    let receiver = rig.renderer.metering().unwrap();
    let mut query = QueryLoop::start(rig.publisher.clone(), receiver, Duration::from_millis(5)).unwrap();

    assert!(full.expect("/source/level", LIMIT).await.is_some());
    assert!(full.expect("/transport/frame", LIMIT).await.is_some());

    let received = thin.collect(WINDOW).await;
    let paths = paths(&received);
    assert!(paths.contains(&"/source/new"), "{:?}", paths);
    for metering in ["/source/level", "/scene/level", "/scene/cpu_load", "/transport/frame"] {
        assert!(!paths.contains(&metering), "{:?}", paths);
    }

    query.stop();
    handler.stop().await;
    rig.renderer.stop();
}

// ============================================================================
// CLIENT ROLE
// ============================================================================

fn announcement(ordinal: i32, name: &str, port: &str) -> OscMessage {
    OscMessage::new(
        "/source/new",
        vec![
            ordinal.into(),
            name.into(),
            "point".into(),
            port.into(),
            0i32.into(),
            1.0f32.into(),
            1.0f32.into(),
            false.into(),
            0.0f32.into(),
            false.into(),
            1.0f32.into(),
            false.into(),
            "".into(),
        ],
    )
}

#[tokio::test]
async fn test_client_answers_poll() {
    let rig = Rig::idle();
    let server = Peer::bind().await;
    let handler = OscHandler::start(rig.publisher.clone(), &client_config())
        .await
        .unwrap();
    assert!(handler.targets().is_empty());

    server
        .send(&OscMessage::new("/poll", Vec::new()), loopback(handler.local_addr()))
        .await;
    let (from, _) = server.expect("/alive", LIMIT).await.unwrap();
    assert_eq!(from.port(), handler.local_addr().port());
    assert_eq!(handler.targets(), vec![server.addr()]);

    handler.stop().await;
}

#[tokio::test]
async fn test_client_follows_server_numbering() {
    let rig = Rig::idle();
    let server = Peer::bind().await;
    let handler = OscHandler::start(rig.publisher.clone(), &client_config())
        .await
        .unwrap();
    let target = loopback(handler.local_addr());

    server.send(&OscMessage::new("/poll", Vec::new()), target).await;
    server.expect("/alive", LIMIT).await.unwrap();

    server.send(&announcement(7, "drums", "5"), target).await;
    let scene = rig.publisher.scene().clone();
    assert!(wait_for(|| scene.state().sources.len() == 1).await);

    let state = scene.state();
    let source = state.sources.values().next().unwrap();
    assert_eq!(source.name, "drums");
    assert_eq!(source.port_name, "system:capture_5");

    // server-driven changes are applied but not mirrored back
    server
        .send(
            &OscMessage::new(
                "/source/position",
                vec![7i32.into(), 3.0f32.into(), 0.0f32.into()],
            ),
            target,
        )
        .await;
    let id: SourceId = state.order[0].clone();
    assert!(wait_for(|| scene.get_source_position(&id) == Some(Position::new(3.0, 0.0))).await);
    let echoed = server.collect(WINDOW).await;
    assert!(
        !paths(&echoed).iter().any(|p| p.starts_with("/update/source")),
        "{:?}",
        paths(&echoed)
    );

    // local changes go upstream under the server's number
    rig.publisher
        .take_control()
        .set_source_mute(&id, true)
        .unwrap();
    let (_, message) = server.expect("/update/source/mute", LIMIT).await.unwrap();
    assert_eq!(message.args, vec![OscType::Int(7), OscType::Bool(true)]);

    handler.stop().await;
}
