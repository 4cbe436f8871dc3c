//! Media-plane scenarios: audio fan-out, simulcast layer selection,
//! metadata-driven reselection and publisher teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cascade_protocol::control::ControlMessage;
use cascade_protocol::metadata::StreamMetadataMap;
use cascade_protocol::signaling::CALL_HANGUP;

use cascade_sfu::conference::messages::SignalingEvent;
use cascade_sfu::peer::PeerEvent;
use cascade_sfu::types::SimulcastLayer;

use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use common::*;

#[tokio::test]
async fn test_audio_publisher_to_subscriber() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(&conference, "@alice:hs", StreamMetadataMap::new()).await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;

    let info = audio_info("a1");
    let output_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability::default(),
        "a1".to_owned(),
        "stream-a1".to_owned(),
    ));

    peer_event(
        &conference,
        &alice,
        PeerEvent::NewTrackPublished {
            info: Arc::clone(&info),
            layer: SimulcastLayer::None,
            ssrc: 200,
            output_track: Some(Arc::clone(&output_track)),
        },
    )
    .await;

    // Bob hears about the new track, then subscribes with no resolution.
    loop {
        if let ControlMessage::MetadataChanged { .. } = bob_probe.next_control().await {
            break;
        }
    }
    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("a1", 0, 0)], &[]),
        },
    )
    .await;

    // The egress is the publisher's shared sink itself: every packet Alice
    // sends is written straight onto what Bob reads.
    let (track_id, bound) = bob_probe.next_shared_egress().await;
    assert_eq!(track_id.as_str(), "a1");
    assert!(Arc::ptr_eq(&bound, &output_track));

    // Audio generates no upstream key frame requests.
    for seq in 0..5u16 {
        peer_event(
            &conference,
            &alice,
            PeerEvent::RtpReceived {
                info: Arc::clone(&info),
                layer: SimulcastLayer::None,
                packet: rtp_packet(seq),
            },
        )
        .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice_probe.drain_keyframe_ssrcs().is_empty());
}

#[tokio::test]
async fn test_three_way_simulcast_selection() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(
        &conference,
        "@alice:hs",
        video_stream_metadata("stream-v1", "v1", 1920, 1080),
    )
    .await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    let (carol, mut carol_probe) = join(&conference, "@carol:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;
    open_data_channel(&conference, &carol, &mut carol_probe).await;

    let info = video_info("v1");
    publish_simulcast(&conference, &alice, &info).await;

    // Bob wants full size -> High; Carol wants 640x360, ratio 3 -> Low.
    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 1920, 1080)], &[]),
        },
    )
    .await;
    peer_event(
        &conference,
        &carol,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 640, 360)], &[]),
        },
    )
    .await;

    let (_, mut bob_egress) = bob_probe.next_egress().await;
    let (_, mut carol_egress) = carol_probe.next_egress().await;

    for (layer, seq) in [
        (SimulcastLayer::High, 1u16),
        (SimulcastLayer::Medium, 2),
        (SimulcastLayer::Low, 3),
    ] {
        peer_event(
            &conference,
            &alice,
            PeerEvent::RtpReceived {
                info: Arc::clone(&info),
                layer,
                packet: rtp_packet(seq),
            },
        )
        .await;
    }

    let to_bob = tokio::time::timeout(WAIT, bob_egress.recv())
        .await
        .expect("bob got no packet")
        .expect("bob egress closed");
    assert_eq!(to_bob.header.sequence_number, 1);

    let to_carol = tokio::time::timeout(WAIT, carol_egress.recv())
        .await
        .expect("carol got no packet")
        .expect("carol egress closed");
    assert_eq!(to_carol.header.sequence_number, 3);

    // The Medium packet went nowhere.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob_egress.try_recv().is_err());
    assert!(carol_egress.try_recv().is_err());

    // Joining consumed one key frame request per selected layer.
    let mut ssrcs = alice_probe.drain_keyframe_ssrcs();
    ssrcs.sort_unstable();
    assert_eq!(ssrcs, vec![101, 103]);
}

#[tokio::test]
async fn test_metadata_change_triggers_reselection() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(
        &conference,
        "@alice:hs",
        video_stream_metadata("stream-v1", "v1", 1920, 1080),
    )
    .await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    let (carol, mut carol_probe) = join(&conference, "@carol:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;
    open_data_channel(&conference, &carol, &mut carol_probe).await;

    let info = video_info("v1");
    publish_simulcast(&conference, &alice, &info).await;

    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 1920, 1080)], &[]),
        },
    )
    .await;
    peer_event(
        &conference,
        &carol,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 640, 360)], &[]),
        },
    )
    .await;
    let (_, mut bob_egress) = bob_probe.next_egress().await;
    let (_, mut carol_egress) = carol_probe.next_egress().await;

    // Let the key frame gate from the initial subscribes reopen.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let _ = alice_probe.drain();

    // The publisher shrinks to 640x360: both ratios become <= 1 -> High.
    let shrink = serde_json::json!({
        "type": "metadata_changed",
        "stream_metadata": {
            "stream-v1": {
                "purpose": "m.usermedia",
                "tracks": { "v1": { "width": 640, "height": 360 } }
            }
        }
    });
    peer_event(
        &conference,
        &alice,
        PeerEvent::DataChannelMessage {
            payload: bytes::Bytes::from(serde_json::to_vec(&shrink).unwrap()),
        },
    )
    .await;

    // Only Carol changed layer (Low -> High): exactly one upstream request
    // in this window, for the High layer.
    loop {
        match alice_probe.next_command().await {
            StubCommand::KeyFrame { media_ssrc, .. } => {
                assert_eq!(media_ssrc, 103);
                break;
            }
            _ => continue,
        }
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(alice_probe.drain_keyframe_ssrcs().is_empty());

    // Both now receive the High layer.
    peer_event(
        &conference,
        &alice,
        PeerEvent::RtpReceived {
            info: Arc::clone(&info),
            layer: SimulcastLayer::High,
            packet: rtp_packet(42),
        },
    )
    .await;

    let to_bob = tokio::time::timeout(WAIT, bob_egress.recv())
        .await
        .expect("bob got no packet")
        .expect("bob egress closed");
    assert_eq!(to_bob.header.sequence_number, 42);
    let to_carol = tokio::time::timeout(WAIT, carol_egress.recv())
        .await
        .expect("carol got no packet")
        .expect("carol egress closed");
    assert_eq!(to_carol.header.sequence_number, 42);
}

#[tokio::test]
async fn test_publisher_leaving_tears_down_subscriptions() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(
        &conference,
        "@alice:hs",
        video_stream_metadata("stream-v1", "v1", 1920, 1080),
    )
    .await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;

    let info = video_info("v1");
    publish_simulcast(&conference, &alice, &info).await;
    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 1920, 1080)], &[]),
        },
    )
    .await;
    let (_, mut bob_egress) = bob_probe.next_egress().await;

    conference
        .handle
        .deliver(SignalingEvent::Hangup {
            participant: alice.clone(),
            reason: "user_hangup".to_owned(),
        })
        .await
        .unwrap();

    // Bob's adapter is told to drop the egress, a hangup goes out for
    // Alice, and Bob's metadata no longer mentions her stream.
    loop {
        match bob_probe.next_command().await {
            StubCommand::ReleaseEgress(track_id) => {
                assert_eq!(track_id.as_str(), "v1");
                break;
            }
            _ => continue,
        }
    }
    conference
        .transport
        .wait_for(CALL_HANGUP, &alice.user_id)
        .await;
    loop {
        if let ControlMessage::MetadataChanged { stream_metadata } = bob_probe.next_control().await
        {
            assert!(!stream_metadata.contains_key("stream-v1"));
            break;
        }
    }

    // Packets for the dead track go nowhere.
    peer_event(
        &conference,
        &alice,
        PeerEvent::RtpReceived {
            info: Arc::clone(&info),
            layer: SimulcastLayer::High,
            packet: rtp_packet(7),
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    match bob_egress.try_recv() {
        Err(_) => {}
        Ok(packet) => panic!(
            "packet {} forwarded after publisher left",
            packet.header.sequence_number
        ),
    }
}

#[tokio::test]
async fn test_subscribe_without_resolution_falls_back_to_low() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(
        &conference,
        "@alice:hs",
        video_stream_metadata("stream-v1", "v1", 1920, 1080),
    )
    .await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;

    let info = video_info("v1");
    publish_simulcast(&conference, &alice, &info).await;

    // Width and height are absent entirely; the SFU reads them as zero and
    // picks the lowest layer.
    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: bytes::Bytes::from_static(
                br#"{"type":"track_subscription","subscribe":[{"trackId":"v1"}]}"#,
            ),
        },
    )
    .await;

    let (_, mut bob_egress) = bob_probe.next_egress().await;

    peer_event(
        &conference,
        &alice,
        PeerEvent::RtpReceived {
            info: Arc::clone(&info),
            layer: SimulcastLayer::Low,
            packet: rtp_packet(9),
        },
    )
    .await;
    peer_event(
        &conference,
        &alice,
        PeerEvent::RtpReceived {
            info: Arc::clone(&info),
            layer: SimulcastLayer::High,
            packet: rtp_packet(10),
        },
    )
    .await;

    let packet = tokio::time::timeout(WAIT, bob_egress.recv())
        .await
        .expect("bob got no packet")
        .expect("bob egress closed");
    assert_eq!(packet.header.sequence_number, 9);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob_egress.try_recv().is_err());

    // The first key frame request went to the Low layer.
    let ssrcs = alice_probe.drain_keyframe_ssrcs();
    assert_eq!(ssrcs, vec![101]);
}

#[tokio::test]
async fn test_unsubscribe_unknown_track_is_a_noop() {
    let conference = start_conference(test_config(), StubFactory::new());
    let (alice, mut alice_probe) = join(
        &conference,
        "@alice:hs",
        video_stream_metadata("stream-v1", "v1", 1920, 1080),
    )
    .await;
    let (bob, mut bob_probe) = join(&conference, "@bob:hs", StreamMetadataMap::new()).await;
    open_data_channel(&conference, &alice, &mut alice_probe).await;
    open_data_channel(&conference, &bob, &mut bob_probe).await;

    let info = video_info("v1");
    publish_simulcast(&conference, &alice, &info).await;

    // The unknown unsubscribe is skipped, the subscribe in the same batch
    // still lands.
    peer_event(
        &conference,
        &bob,
        PeerEvent::DataChannelMessage {
            payload: subscription_payload(&[("v1", 1920, 1080)], &["never-existed"]),
        },
    )
    .await;

    let (track_id, _egress) = bob_probe.next_egress().await;
    assert_eq!(track_id.as_str(), "v1");
}
