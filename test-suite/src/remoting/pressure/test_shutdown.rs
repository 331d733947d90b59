use crate::remoting::{client::*, server::*};
use crate::*;
use broker_remoting::error::{ErrorKind, RemotingError};
use broker_remoting::*;
use rstest::*;
use std::time::Duration;
use tokio::sync::oneshot;

#[logfn]
#[rstest]
#[case(1)]
#[case(3)]
fn test_shutdown_twice(runner: TestRunner, #[case] clients: usize) {
    runner.block_on(async move {
        let events = EventRecorder::new();
        let (server, addr) = init_server(test_server_config(), Some(events.clone())).await.expect("server");
        let mut client_list = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..clients {
            let client = init_client(test_client_config(), None);
            channels.push(client.connect(&addr).await.expect("connect"));
            client_list.push(client);
        }
        assert!(events.wait_for(ConnectionEventType::Connect, clients, Duration::from_secs(2)).await);

        futures::join!(server.shutdown(), server.shutdown());
        server.shutdown().await;
        // the event worker is drained by shutdown
        assert_eq!(events.count(ConnectionEventType::Connect), clients);
        assert_eq!(events.count(ConnectionEventType::Close), clients);
        for (_, id) in events.events() {
            assert_eq!(
                events.kinds_of(id),
                vec![ConnectionEventType::Connect, ConnectionEventType::Close]
            );
        }
        assert!(server.channels().is_empty());

        assert!(wait_until(Duration::from_secs(1), || channels.iter().all(|ch| !ch.is_active())).await);
        let channel_gone = client_list[0].connect(&addr).await.err().expect("listener closed");
        assert_eq!(channel_gone, ErrorKind::ConnectFailed);
        for client in client_list {
            client.shutdown().await;
            client.shutdown().await;
        }
    });
}

#[logfn]
#[rstest]
fn test_shutdown_fails_pending(runner: TestRunner) {
    runner.block_on(async move {
        let (server, addr) = init_server(test_server_config(), None).await.expect("server");
        server.register_processor(OP_SLOW, SlowProcessor::new(Duration::from_secs(5)), None);
        let client = init_client(test_client_config(), None);
        let (tx, rx) = oneshot::channel();
        client
            .invoke_async(&addr, Command::request(OP_SLOW, "a"), Duration::from_secs(10), move |r| {
                let _ = tx.send(r);
            })
            .await
            .expect("sent");
        client.shutdown().await;
        let e = rx.await.expect("callback").err().expect("failed");
        assert!(e == ErrorKind::ConnectionClosed || e == ErrorKind::Shutdown, "{}", e);
        assert_eq!(client.engine().pending_requests(), 0);

        let e = client
            .invoke_sync(&addr, Command::request(OP_ECHO, "x"), Duration::from_secs(1))
            .await
            .err()
            .expect("shut down");
        assert_eq!(e, RemotingError::Shutdown);
        server.shutdown().await;
    });
}
