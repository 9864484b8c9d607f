//! Integration tests for heartbeat channels over both transports.

use std::time::Duration;

use policy_sync_core::version::ModelVersion;
use policy_sync_net::protocol::{Envelope, SyncMessage, FRAME_HEADER_BYTES, MAX_FRAME_BYTES};
use policy_sync_net::traits::{ChannelListener, Connector, Endpoint, HeartbeatChannel, RecvMode};
use policy_sync_net::{ChannelError, MemoryNetwork};

const WAIT: RecvMode = RecvMode::Timeout(Duration::from_secs(5));

/// Answer every request on one accepted channel the way a gateway would.
async fn answer_requests(mut channel: Box<dyn HeartbeatChannel>) {
    while let Ok(Some(req)) = channel.recv(WAIT).await {
        let reply = match req.message {
            SyncMessage::HeartbeatRequest => SyncMessage::HeartbeatResponse {
                round_pending: false,
            },
            SyncMessage::VersionChangeRequest { version } => SyncMessage::VersionChangeResponse {
                version,
                success: true,
            },
            _ => continue,
        };
        if channel.send(&req.reply(reply)).await.is_err() {
            break;
        }
    }
}

async fn request(channel: &mut Box<dyn HeartbeatChannel>, envelope: Envelope) -> Envelope {
    channel.send(&envelope).await.unwrap();
    let reply = channel.recv(WAIT).await.unwrap().unwrap();
    assert!(envelope.is_answered_by(&reply));
    reply
}

#[tokio::test]
async fn memory_channel_request_reply() {
    let net = MemoryNetwork::new();
    let listener = net.listen("gateway-0");
    tokio::spawn(async move {
        while let Ok(channel) = listener.accept().await {
            tokio::spawn(answer_requests(channel));
        }
    });

    let mut channel = net.connect(&Endpoint::from("gateway-0")).await.unwrap();
    let reply = request(
        &mut channel,
        Envelope::new(SyncMessage::VersionChangeRequest {
            version: ModelVersion(7),
        })
        .with_round(3)
        .with_sequence(11),
    )
    .await;
    assert_eq!(reply.round, 3);
    assert_eq!(reply.sequence, 11);
    assert_eq!(
        reply.message,
        SyncMessage::VersionChangeResponse {
            version: ModelVersion(7),
            success: true
        }
    );
}

#[tokio::test]
async fn severing_breaks_open_channels_and_new_connects() {
    let net = MemoryNetwork::new();
    let endpoint = Endpoint::from("predictor-0");
    let listener = net.listen(endpoint.clone());
    tokio::spawn(async move {
        while let Ok(channel) = listener.accept().await {
            tokio::spawn(answer_requests(channel));
        }
    });

    let mut channel = net.connect(&endpoint).await.unwrap();
    request(&mut channel, Envelope::new(SyncMessage::HeartbeatRequest).with_sequence(1)).await;

    net.sever(&endpoint);
    assert!(channel
        .send(&Envelope::new(SyncMessage::HeartbeatRequest))
        .await
        .is_err());
    assert!(channel.recv(RecvMode::NonBlocking).await.is_err());
    assert!(matches!(
        net.connect(&endpoint).await,
        Err(ChannelError::Unreachable { .. })
    ));

    // a restored endpoint accepts new channels; the old one stays broken
    net.restore(&endpoint);
    let mut fresh = net.connect(&endpoint).await.unwrap();
    request(&mut fresh, Envelope::new(SyncMessage::HeartbeatRequest).with_sequence(2)).await;
    assert!(channel.recv(RecvMode::NonBlocking).await.is_err());
}

#[tokio::test]
async fn connecting_to_an_unknown_endpoint_fails() {
    let net = MemoryNetwork::new();
    assert!(matches!(
        net.connect(&Endpoint::from("nobody")).await,
        Err(ChannelError::NoListener(_))
    ));
}

#[tokio::test]
async fn non_blocking_recv_returns_none_when_idle() {
    let (mut client, _server) = MemoryNetwork::pair("idle");
    assert!(client.recv(RecvMode::NonBlocking).await.unwrap().is_none());
    assert!(client
        .recv(RecvMode::Timeout(Duration::from_millis(10)))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dropped_peer_reads_as_closed() {
    let (mut client, server) = MemoryNetwork::pair("gone");
    drop(server);
    assert!(matches!(
        client.recv(RecvMode::NonBlocking).await,
        Err(ChannelError::Closed(_))
    ));
}

#[cfg(feature = "tcp-transport")]
mod tcp {
    use super::*;
    use policy_sync_net::tcp::{TcpChannelListener, TcpConnector};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn heartbeat_over_tcp() {
        let listener = TcpChannelListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_endpoint();
        tokio::spawn(async move {
            while let Ok(channel) = listener.accept().await {
                tokio::spawn(answer_requests(channel));
            }
        });

        let mut channel = TcpConnector::default().connect(&endpoint).await.unwrap();
        for seq in 1..=3 {
            let reply = request(
                &mut channel,
                Envelope::new(SyncMessage::HeartbeatRequest).with_sequence(seq),
            )
            .await;
            assert_eq!(
                reply.message,
                SyncMessage::HeartbeatResponse {
                    round_pending: false
                }
            );
        }
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected() {
        let listener = TcpChannelListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_endpoint();

        let mut raw = TcpStream::connect(addr.as_str()).await.unwrap();
        let mut channel = listener.accept().await.unwrap();
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        assert_eq!(len.len(), FRAME_HEADER_BYTES);
        raw.write_all(&len).await.unwrap();

        assert!(matches!(
            channel.recv(WAIT).await,
            Err(ChannelError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn closed_socket_reads_as_closed() {
        let listener = TcpChannelListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_endpoint();

        let raw = TcpStream::connect(addr.as_str()).await.unwrap();
        let mut channel = listener.accept().await.unwrap();
        drop(raw);
        assert!(matches!(
            channel.recv(WAIT).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpChannelListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_endpoint()
        };
        let connector = TcpConnector::new(Duration::from_secs(1));
        assert!(matches!(
            connector.connect(&addr).await,
            Err(ChannelError::Unreachable { .. })
        ));
    }
}
